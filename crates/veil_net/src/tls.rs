use async_trait::async_trait;
use boring::error::ErrorStack;
use boring::ssl::{SslConnector, SslMethod, SslSessionCacheMode, SslVerifyMode, SslVersion};
use tracing::debug;
use veil_traits::{BoxError, BoxStream, ProfileId, TargetAddress, TlsImpersonator, TlsSession};

use crate::fingerprint::{self, ALPN_H2_HTTP11};

/// BoringSSL-backed impersonator. Each handshake builds its context from the
/// profile's fingerprint, so nothing is shared between requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoringImpersonator;

impl BoringImpersonator {
    pub fn new() -> Self {
        Self
    }

    fn connector(profile: ProfileId, insecure_skip_verify: bool) -> Result<SslConnector, ErrorStack> {
        let fp = fingerprint::lookup(profile);
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;

        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
        builder.set_cipher_list(fp.cipher_list)?;
        builder.set_curves_list(fp.curves)?;
        builder.set_sigalgs_list(fp.sigalgs)?;
        builder.set_grease_enabled(fp.grease);
        builder.set_permute_extensions(fp.permute_extensions);
        if fp.ocsp_stapling {
            builder.enable_ocsp_stapling();
        }
        if fp.signed_cert_timestamps {
            builder.enable_signed_cert_timestamps();
        }
        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);
        builder.set_alpn_protos(ALPN_H2_HTTP11)?;

        if insecure_skip_verify {
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl TlsImpersonator for BoringImpersonator {
    async fn handshake(
        &self,
        stream: BoxStream,
        server_name: &str,
        profile: ProfileId,
        insecure_skip_verify: bool,
    ) -> Result<TlsSession, BoxError> {
        let connector = Self::connector(profile, insecure_skip_verify)?;
        let mut config = connector.configure()?;
        if insecure_skip_verify {
            config.set_verify_hostname(false);
        }
        // SNI carries hostnames only.
        if TargetAddress::new(server_name, TargetAddress::HTTPS_PORT).is_ip_literal() {
            config.set_use_server_name_indication(false);
        }

        let tls = tokio_boring::connect(config, server_name, stream)
            .await
            .map_err(|e| {
                let detail = match (e.as_ssl_error_stack(), e.as_io_error()) {
                    (Some(stack), _) => stack.to_string(),
                    (None, Some(io)) => io.to_string(),
                    (None, None) => "handshake aborted".to_string(),
                };
                BoxError::from(format!("{profile} handshake: {detail}"))
            })?;

        let alpn = tls
            .ssl()
            .selected_alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();
        debug!(server_name, %profile, alpn = %alpn, "TLS handshake complete");

        Ok(TlsSession {
            stream: Box::new(tls),
            alpn,
        })
    }
}
