use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Boxed cause carried across collaborator boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Protocol-agnostic byte stream: raw TCP, a SOCKS-relayed TCP stream, or TLS on top of either.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

pub type BoxStream = Box<dyn RawStream>;

/// Host and port of the origin a request is sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
}

impl TargetAddress {
    pub const HTTPS_PORT: u16 = 443;
    pub const HTTP_PORT: u16 = 80;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Derives the target from a request URI. The port falls back to 443 for
    /// `https` and 80 for anything else when the URI does not carry one.
    pub fn from_uri(uri: &http::Uri) -> Option<Self> {
        let host = uri.host().filter(|h| !h.is_empty())?;
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("https") => Self::HTTPS_PORT,
            _ => Self::HTTP_PORT,
        });
        Some(Self::new(host, port))
    }

    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<std::net::IpAddr>().is_ok()
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Application protocol agreed on through ALPN during the TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiatedProtocol {
    /// "h2"
    H2,
    /// "http/1.1"
    Http11,
    /// The server did not select a protocol.
    None,
}

impl NegotiatedProtocol {
    /// Maps an ALPN identifier to a known protocol. Anything outside
    /// `{"h2", "http/1.1", ""}` is rejected.
    pub fn from_alpn(alpn: &str) -> Option<Self> {
        match alpn {
            "h2" => Some(Self::H2),
            "http/1.1" => Some(Self::Http11),
            "" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H2 => "h2",
            Self::Http11 => "http/1.1",
            Self::None => "",
        }
    }

    /// HTTP version used on the wire for this protocol.
    pub fn version(&self) -> http::Version {
        match self {
            Self::H2 => http::Version::HTTP_2,
            Self::Http11 | Self::None => http::Version::HTTP_11,
        }
    }
}

/// Browser whose ClientHello shape the TLS handshake reproduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProfileId {
    /// Tracks the newest Chrome profile known to this build.
    #[default]
    #[serde(rename = "chrome-auto")]
    ChromeAuto,
    #[serde(rename = "chrome-120")]
    Chrome120,
    #[serde(rename = "chrome-131")]
    Chrome131,
    #[serde(rename = "firefox-auto")]
    FirefoxAuto,
    #[serde(rename = "firefox-120")]
    Firefox120,
    #[serde(rename = "safari-auto")]
    SafariAuto,
    #[serde(rename = "safari-17")]
    Safari17,
    #[serde(rename = "edge-auto")]
    EdgeAuto,
    #[serde(rename = "edge-131")]
    Edge131,
}

impl ProfileId {
    pub const ALL: &'static [ProfileId] = &[
        Self::ChromeAuto,
        Self::Chrome120,
        Self::Chrome131,
        Self::FirefoxAuto,
        Self::Firefox120,
        Self::SafariAuto,
        Self::Safari17,
        Self::EdgeAuto,
        Self::Edge131,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChromeAuto => "chrome-auto",
            Self::Chrome120 => "chrome-120",
            Self::Chrome131 => "chrome-131",
            Self::FirefoxAuto => "firefox-auto",
            Self::Firefox120 => "firefox-120",
            Self::SafariAuto => "safari-auto",
            Self::Safari17 => "safari-17",
            Self::EdgeAuto => "edge-auto",
            Self::Edge131 => "edge-131",
        }
    }

    /// Resolves the auto-updating aliases to a concrete browser release.
    pub fn resolve(self) -> Self {
        match self {
            Self::ChromeAuto => Self::Chrome131,
            Self::FirefoxAuto => Self::Firefox120,
            Self::SafariAuto => Self::Safari17,
            Self::EdgeAuto => Self::Edge131,
            concrete => concrete,
        }
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProfile(pub String);

impl fmt::Display for UnknownProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown impersonation profile: {}", self.0)
    }
}

impl std::error::Error for UnknownProfile {}

impl FromStr for ProfileId {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| UnknownProfile(s.to_string()))
    }
}

/// Outgoing request payload.
pub enum RequestBody {
    Empty,
    Full(Bytes),
    /// Streamed body of unknown length.
    Reader(Box<dyn AsyncRead + Send + Sync + Unpin>),
}

impl RequestBody {
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        Self::Reader(Box::new(reader))
    }

    /// Length known before transmission, `None` for streamed bodies.
    pub fn exact_len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Full(bytes) => Some(bytes.len() as u64),
            Self::Reader(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact_len() == Some(0)
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Full(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::Full(Bytes::from(s))
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        Self::Full(Bytes::from_static(s.as_bytes()))
    }
}

/// Response payload as produced by a protocol engine, before lifecycle wrapping.
pub trait RawBody: AsyncRead + Send + Unpin {
    /// Releases whatever the body holds on the wire (stream slot, buffered data).
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub type BoxBody = Box<dyn RawBody>;

/// Body with no content, for HEAD, 204 and 304 responses.
#[derive(Debug, Default)]
pub struct EmptyBody;

impl AsyncRead for EmptyBody {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl RawBody for EmptyBody {}

/// Opens byte streams to a target, directly or through a relay.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &TargetAddress) -> io::Result<BoxStream>;

    /// Short label used in logs.
    fn name(&self) -> &str;
}

/// Result of a successful impersonated handshake.
pub struct TlsSession {
    pub stream: BoxStream,
    /// Raw ALPN identifier the server selected, empty if none.
    pub alpn: String,
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("alpn", &self.alpn)
            .finish_non_exhaustive()
    }
}

/// Performs a TLS handshake shaped like a specific browser's.
///
/// The stream is consumed; on failure it is dropped, which closes it.
#[async_trait]
pub trait TlsImpersonator: Send + Sync {
    async fn handshake(
        &self,
        stream: BoxStream,
        server_name: &str,
        profile: ProfileId,
        insecure_skip_verify: bool,
    ) -> Result<TlsSession, BoxError>;
}

/// Supplies the stream a multiplexing engine runs over.
pub trait ConnectionSource: Send {
    fn acquire(&mut self) -> io::Result<BoxStream>;
}

/// HTTP/2 framing engine. Binding never opens a network connection of its own;
/// it only frames over what the source hands it.
#[async_trait]
pub trait MultiplexEngine: Send + Sync {
    async fn bind(
        &self,
        source: Box<dyn ConnectionSource>,
    ) -> Result<Box<dyn MultiplexedConnection>, BoxError>;
}

#[async_trait]
pub trait MultiplexedConnection: Send {
    /// Sends one request and resolves once response headers arrive.
    async fn issue(
        &mut self,
        request: http::Request<RequestBody>,
    ) -> Result<http::Response<BoxBody>, BoxError>;
}

/// Stock transport used verbatim for `http://` requests.
#[async_trait]
pub trait PlainTransport: Send + Sync {
    async fn round_trip(
        &self,
        request: http::Request<RequestBody>,
    ) -> Result<http::Response<BoxBody>, BoxError>;
}
