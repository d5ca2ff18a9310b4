//! Recording stand-ins for the transport's collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use veil_traits::{
    BoxBody, BoxError, BoxStream, ConnectionSource, Dialer, MultiplexEngine,
    MultiplexedConnection, PlainTransport, ProfileId, RawBody, RequestBody, TargetAddress,
    TlsImpersonator, TlsSession,
};

use super::peers::Peer;

/// Counters shared by every stream a stub dialer hands out.
#[derive(Clone, Default)]
pub struct Probe {
    drops: Arc<AtomicUsize>,
    written: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl Probe {
    /// How many dialed streams have been released.
    pub fn closes(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    /// Bytes the client wrote across all dialed streams.
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

pub struct ProbeStream {
    inner: DuplexStream,
    probe: Probe,
}

impl Drop for ProbeStream {
    fn drop(&mut self) {
        self.probe.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl AsyncRead for ProbeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProbeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.probe.written.fetch_add(n, Ordering::SeqCst);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Dialer that records targets and connects them to a scripted in-memory peer.
pub struct StubDialer {
    label: &'static str,
    peer: Peer,
    delay: Option<Duration>,
    pub probe: Probe,
    targets: Mutex<Vec<TargetAddress>>,
}

#[allow(dead_code)]
impl StubDialer {
    pub fn new(label: &'static str, peer: Peer) -> Arc<Self> {
        Arc::new(Self {
            label,
            peer,
            delay: None,
            probe: Probe::default(),
            targets: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(label: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            label,
            peer: Peer::Silent,
            delay: Some(delay),
            probe: Probe::default(),
            targets: Mutex::new(Vec::new()),
        })
    }

    pub fn targets(&self) -> Vec<TargetAddress> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl Dialer for StubDialer {
    async fn dial(&self, target: &TargetAddress) -> io::Result<BoxStream> {
        self.targets.lock().push(target.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.peer.spawn(server);
        Ok(Box::new(ProbeStream {
            inner: client,
            probe: self.probe.clone(),
        }))
    }

    fn name(&self) -> &str {
        self.label
    }
}

/// Skips TLS entirely and reports a fixed ALPN value.
pub struct StubImpersonator {
    alpn: &'static str,
    fail: bool,
    seen: Mutex<Vec<(String, ProfileId, bool)>>,
}

#[allow(dead_code)]
impl StubImpersonator {
    pub fn negotiating(alpn: &'static str) -> Arc<Self> {
        Arc::new(Self {
            alpn,
            fail: false,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            alpn: "",
            fail: true,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// `(server_name, profile, insecure_skip_verify)` per handshake.
    pub fn seen(&self) -> Vec<(String, ProfileId, bool)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl TlsImpersonator for StubImpersonator {
    async fn handshake(
        &self,
        stream: BoxStream,
        server_name: &str,
        profile: ProfileId,
        insecure_skip_verify: bool,
    ) -> Result<TlsSession, BoxError> {
        self.seen
            .lock()
            .push((server_name.to_string(), profile, insecure_skip_verify));
        if self.fail {
            drop(stream);
            return Err("handshake refused".into());
        }
        Ok(TlsSession {
            stream,
            alpn: self.alpn.to_string(),
        })
    }
}

/// Body whose close always fails, counting how often it was asked to close.
pub struct FailingCloseBody {
    closes: Arc<AtomicUsize>,
}

impl AsyncRead for FailingCloseBody {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl RawBody for FailingCloseBody {
    fn close(&mut self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::other("raw body close failed"))
    }
}

/// Engine that takes the stream from its source and answers 200 with a
/// [`FailingCloseBody`], without framing anything.
#[derive(Default)]
pub struct StubEngine {
    pub body_closes: Arc<AtomicUsize>,
}

struct StubSession {
    _stream: BoxStream,
    body_closes: Arc<AtomicUsize>,
}

#[async_trait]
impl MultiplexEngine for StubEngine {
    async fn bind(
        &self,
        mut source: Box<dyn ConnectionSource>,
    ) -> Result<Box<dyn MultiplexedConnection>, BoxError> {
        let stream = source.acquire()?;
        // The pre-connected source never yields a second stream.
        assert!(source.acquire().is_err());
        Ok(Box::new(StubSession {
            _stream: stream,
            body_closes: self.body_closes.clone(),
        }))
    }
}

#[async_trait]
impl MultiplexedConnection for StubSession {
    async fn issue(
        &mut self,
        _request: http::Request<RequestBody>,
    ) -> Result<http::Response<BoxBody>, BoxError> {
        let body: BoxBody = Box::new(FailingCloseBody {
            closes: self.body_closes.clone(),
        });
        Ok(http::Response::new(body))
    }
}

/// Plaintext transport that records request URIs and answers 204.
#[derive(Default)]
pub struct StubPlain {
    uris: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl StubPlain {
    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().clone()
    }
}

#[async_trait]
impl PlainTransport for StubPlain {
    async fn round_trip(
        &self,
        request: http::Request<RequestBody>,
    ) -> Result<http::Response<BoxBody>, BoxError> {
        self.uris.lock().push(request.uri().to_string());
        let body: BoxBody = Box::new(veil_traits::EmptyBody);
        let mut response = http::Response::new(body);
        *response.status_mut() = http::StatusCode::NO_CONTENT;
        Ok(response)
    }
}
