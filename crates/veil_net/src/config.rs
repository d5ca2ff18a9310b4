use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use veil_traits::ProfileId;

use crate::fingerprint::{self, Http2Settings};

/// Immutable transport options. Built once, then shared read-only by every call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Browser whose handshake is reproduced.
    pub profile: ProfileId,
    /// Accept any server certificate.
    pub insecure_skip_verify: bool,
    /// Bounds dial, handshake and the exchange up to response headers.
    #[serde(with = "opt_millis", rename = "timeout_ms")]
    pub timeout: Option<Duration>,
    /// Explicit SOCKS5 relay. When absent, direct dialing honours environment proxies.
    pub proxy_socks5: Option<Url>,
    /// Pass-through tuning inherited by the HTTP/2 engine.
    pub base: Option<BaseTransport>,
    /// External cancellation, observed alongside the timeout.
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl TransportConfig {
    pub fn with_profile(mut self, profile: ProfileId) -> Self {
        self.profile = profile;
        self
    }

    /// A zero duration means no deadline, same as `timeout_ms = 0`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    pub fn with_proxy_socks5(mut self, proxy: Url) -> Self {
        self.proxy_socks5 = Some(proxy);
        self
    }

    pub fn with_base(mut self, base: BaseTransport) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// HTTP/2 SETTINGS for this config: the profile's browser defaults,
    /// overridden by whatever the base transport pins.
    pub fn http2_settings(&self) -> Http2Settings {
        let defaults = fingerprint::lookup(self.profile).h2;
        match &self.base {
            None => defaults,
            Some(base) => base.apply(defaults),
        }
    }
}

/// Tuning inherited from a caller-supplied transport, chosen at configuration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaseTransport {
    /// A general-purpose HTTP transport; only its flow-control windows carry over,
    /// the rest of the HTTP/2 preface follows the impersonated browser.
    Http(HttpTuning),
    /// A dedicated HTTP/2 transport; every field it sets replaces the browser default.
    Http2(Http2Tuning),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTuning {
    pub initial_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Http2Tuning {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
}

impl BaseTransport {
    fn apply(&self, mut settings: Http2Settings) -> Http2Settings {
        match self {
            Self::Http(t) => {
                if let Some(v) = t.initial_window_size {
                    settings.initial_window_size = v;
                }
                if let Some(v) = t.initial_connection_window_size {
                    settings.initial_connection_window_size = v;
                }
            }
            Self::Http2(t) => {
                if let Some(v) = t.header_table_size {
                    settings.header_table_size = v;
                }
                if let Some(v) = t.enable_push {
                    settings.enable_push = v;
                }
                if t.max_concurrent_streams.is_some() {
                    settings.max_concurrent_streams = t.max_concurrent_streams;
                }
                if let Some(v) = t.initial_window_size {
                    settings.initial_window_size = v;
                }
                if let Some(v) = t.initial_connection_window_size {
                    settings.initial_connection_window_size = v;
                }
                if let Some(v) = t.max_frame_size {
                    settings.max_frame_size = v;
                }
            }
        }
        settings
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_impersonate_chrome_without_timeout() {
        let config = TransportConfig::default();
        assert_eq!(config.profile, ProfileId::ChromeAuto);
        assert!(config.timeout.is_none());
        assert!(config.proxy_socks5.is_none());
        assert!(!config.insecure_skip_verify);
        assert_eq!(config.http2_settings().initial_window_size, 6_291_456);
    }

    #[test]
    fn deserializes_from_json() {
        let config: TransportConfig = serde_json::from_str(
            r#"{
                "profile": "firefox-120",
                "timeout_ms": 2500,
                "proxy_socks5": "socks5://127.0.0.1:9050",
                "base": { "kind": "http2", "max_frame_size": 32768 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.profile, ProfileId::Firefox120);
        assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.proxy_socks5.unwrap().port(), Some(9050));
        assert!(matches!(config.base, Some(BaseTransport::Http2(_))));
    }

    #[test]
    fn zero_timeout_means_none() {
        let config: TransportConfig = serde_json::from_str(r#"{ "timeout_ms": 0 }"#).unwrap();
        assert!(config.timeout.is_none());
    }

    #[test]
    fn zero_duration_disables_the_deadline() {
        let config = TransportConfig::default().with_timeout(Duration::ZERO);
        assert!(config.timeout.is_none());
        let config = config.with_timeout(Duration::from_secs(5));
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn http_base_only_overrides_windows() {
        let config = TransportConfig::default().with_base(BaseTransport::Http(HttpTuning {
            initial_window_size: Some(65_535),
            initial_connection_window_size: None,
        }));
        let settings = config.http2_settings();
        assert_eq!(settings.initial_window_size, 65_535);
        assert_eq!(settings.initial_connection_window_size, 15_728_640);
        assert_eq!(settings.header_table_size, 65_536);
    }

    #[test]
    fn http2_base_replaces_browser_defaults() {
        let config = TransportConfig::default().with_base(BaseTransport::Http2(Http2Tuning {
            header_table_size: Some(4_096),
            max_concurrent_streams: Some(10),
            ..Default::default()
        }));
        let settings = config.http2_settings();
        assert_eq!(settings.header_table_size, 4_096);
        assert_eq!(settings.max_concurrent_streams, Some(10));
        assert_eq!(settings.initial_window_size, 6_291_456);
    }
}
