//! The round-trip orchestrator.

use http::{Request, Response};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};
use veil_traits::{
    BoxError, Dialer, MultiplexEngine, PlainTransport, RequestBody, TargetAddress,
    TlsImpersonator,
};

use crate::body::ResponseBody;
use crate::config::TransportConfig;
use crate::conn::Connection;
use crate::dialer::{DialerSelector, DirectDialer, Socks5Dialer};
use crate::dispatch::dispatch;
use crate::error::{Error, Result};
use crate::h2::H2Engine;
use crate::plain::ReqwestTransport;
use crate::tls::BoringImpersonator;

/// One deadline shared by dial, handshake and dispatch of a single call.
struct Deadline {
    at: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Deadline {
    fn start(timeout: Option<Duration>, cancel: Option<CancellationToken>) -> Self {
        Self {
            at: timeout
                .filter(|t| !t.is_zero())
                .map(|t| Instant::now() + t),
            cancel,
        }
    }

    /// Runs `fut` until it completes or the deadline passes. Expiry surfaces as
    /// `TimedOut`, external cancellation as `Interrupted`.
    async fn run<F: Future>(&self, fut: F) -> io::Result<F::Output> {
        if self.at.is_none() && self.cancel.is_none() {
            return Ok(fut.await);
        }
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Err(io::Error::new(io::ErrorKind::Interrupted, "request cancelled")),
            _ = expired => Err(io::Error::new(io::ErrorKind::TimedOut, "request deadline exceeded")),
            out = fut => Ok(out),
        }
    }
}

/// HTTP transport whose TLS handshakes look like a real browser's.
///
/// Every call dials its own connection, and nothing is pooled. The transport
/// itself is immutable and can be shared freely behind an `Arc`.
pub struct Transport {
    config: TransportConfig,
    dialer: DialerSelector,
    impersonator: Arc<dyn TlsImpersonator>,
    engine: Arc<dyn MultiplexEngine>,
    plain: Arc<dyn PlainTransport>,
}

impl Transport {
    /// Builds a transport with the production collaborators.
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Builds a transport whose `http://` requests go through an existing
    /// reqwest client, keeping that client's own timeouts and proxy rules.
    pub fn with_client(config: TransportConfig, client: reqwest::Client) -> Result<Self> {
        Self::builder(config)
            .plain(Arc::new(ReqwestTransport::from_client(client)))
            .build()
    }

    pub fn builder(config: TransportConfig) -> TransportBuilder {
        TransportBuilder {
            config,
            direct: None,
            socks5: None,
            impersonator: None,
            engine: None,
            plain: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Sends one request and returns the response once its headers are in.
    ///
    /// `http` requests go to the plaintext transport untouched. `https`
    /// requests are dialed, handshaken under the configured profile and
    /// dispatched by the negotiated protocol. Any other scheme fails before
    /// anything is dialed. On error, every connection this call opened is
    /// already closed.
    pub async fn round_trip(&self, request: Request<RequestBody>) -> Result<Response<ResponseBody>> {
        match request.uri().scheme_str() {
            Some("http") => return self.round_trip_plain(request).await,
            Some("https") => {}
            other => return Err(Error::UnsupportedScheme(other.unwrap_or_default().to_string())),
        }

        let target = TargetAddress::from_uri(request.uri())
            .ok_or_else(|| Error::InvalidRequest(format!("no host in {}", request.uri())))?;
        let span = info_span!(
            "round_trip",
            method = %request.method(),
            %target,
            profile = %self.config.profile,
        );
        self.round_trip_secure(request, target).instrument(span).await
    }

    async fn round_trip_plain(&self, request: Request<RequestBody>) -> Result<Response<ResponseBody>> {
        debug!(uri = %request.uri(), "plaintext request, bypassing impersonation");
        let response = self.plain.round_trip(request).await.map_err(Error::Plaintext)?;
        Ok(response.map(ResponseBody::from_raw))
    }

    async fn round_trip_secure(
        &self,
        request: Request<RequestBody>,
        target: TargetAddress,
    ) -> Result<Response<ResponseBody>> {
        let deadline = Deadline::start(self.config.timeout, self.config.cancel.clone());

        debug!(dialer = self.dialer.name(), "dialing");
        let stream = match deadline.run(self.dialer.dial(&target)).await.and_then(|r| r) {
            Ok(stream) => stream,
            Err(source) => return Err(Error::Dial { target, source }),
        };

        // The handshake owns the dialed stream and drops it on failure.
        let handshake = self.impersonator.handshake(
            stream,
            &target.host,
            self.config.profile,
            self.config.insecure_skip_verify,
        );
        let session = deadline
            .run(handshake)
            .await
            .map_err(BoxError::from)
            .and_then(|r| r)
            .map_err(|e| Error::handshake(&target.host, e))?;

        let conn = Connection::new(session.stream);
        debug!(conn = conn.id(), alpn = %session.alpn, "secure connection established");

        let exchange = dispatch(request, &conn, &session.alpn, self.engine.as_ref());
        let dispatched = match deadline.run(exchange).await {
            Ok(result) => result,
            Err(expired) => Err(Error::Dispatch(expired.into())),
        };
        match dispatched {
            Ok(response) => {
                debug!(status = %response.status(), version = ?response.version(), "response headers received");
                Ok(response.map(|raw| ResponseBody::new(raw, conn)))
            }
            Err(e) => {
                debug!(error = %e, "dispatch failed");
                conn.close();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("dialer", &self.dialer.name())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Transport`], defaulting every collaborator left unset.
pub struct TransportBuilder {
    config: TransportConfig,
    direct: Option<Arc<dyn Dialer>>,
    socks5: Option<Arc<dyn Dialer>>,
    impersonator: Option<Arc<dyn TlsImpersonator>>,
    engine: Option<Arc<dyn MultiplexEngine>>,
    plain: Option<Arc<dyn PlainTransport>>,
}

impl TransportBuilder {
    /// Replaces the dialer used when no SOCKS5 proxy is configured.
    pub fn direct_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.direct = Some(dialer);
        self
    }

    /// Replaces the dialer used when `proxy_socks5` is configured.
    pub fn socks5_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.socks5 = Some(dialer);
        self
    }

    pub fn impersonator(mut self, impersonator: Arc<dyn TlsImpersonator>) -> Self {
        self.impersonator = Some(impersonator);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn MultiplexEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn plain(mut self, plain: Arc<dyn PlainTransport>) -> Self {
        self.plain = Some(plain);
        self
    }

    pub fn build(self) -> Result<Transport> {
        let config = self.config;

        let socks5 = match (&config.proxy_socks5, self.socks5) {
            (None, _) => None,
            (Some(_), Some(dialer)) => Some(dialer),
            (Some(url), None) => Some(Arc::new(Socks5Dialer::from_url(url)?) as Arc<dyn Dialer>),
        };
        let direct = match self.direct {
            Some(dialer) => dialer,
            None => Arc::new(DirectDialer::from_env()),
        };
        let dialer = DialerSelector::new(direct, socks5);

        let impersonator = match self.impersonator {
            Some(impersonator) => impersonator,
            None => Arc::new(BoringImpersonator::new()),
        };
        let engine = match self.engine {
            Some(engine) => engine,
            None => Arc::new(H2Engine::new(config.http2_settings())),
        };
        let plain = match self.plain {
            Some(plain) => plain,
            None => Arc::new(ReqwestTransport::new(&config)?),
        };

        debug!(
            profile = %config.profile,
            proxy = dialer.uses_proxy(),
            timeout = ?config.timeout,
            "transport ready"
        );
        Ok(Transport {
            config,
            dialer,
            impersonator,
            engine,
            plain,
        })
    }
}
