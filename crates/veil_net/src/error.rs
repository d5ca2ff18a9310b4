//! Error taxonomy for the fingerprinting transport.

use std::io;
use veil_traits::{BoxError, TargetAddress};

pub type Result<T> = std::result::Result<T, Error>;

/// Stage of a round trip at which an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Scheme,
    Dial,
    Handshake,
    Dispatch,
    Plaintext,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Scheme is neither `http` nor `https`.
    #[error("unsupported scheme: {0:?}")]
    UnsupportedScheme(String),

    /// Request cannot be routed (no host, unusable URI).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport could not be built from its configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dial {target} failed: {source}")]
    Dial {
        target: TargetAddress,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {server_name} failed: {source}")]
    Handshake {
        server_name: String,
        #[source]
        source: BoxError,
    },

    /// ALPN produced a protocol outside `{"h2", "http/1.1", ""}`.
    #[error("unsupported ALPN protocol: {0:?}")]
    UnsupportedProtocol(String),

    /// HTTP/1.1 request serialization onto the secure stream failed.
    #[error("write HTTP/1.1 request failed: {0}")]
    Write(#[source] io::Error),

    /// HTTP/1.1 response could not be read or parsed.
    #[error("read HTTP/1.1 response failed: {0}")]
    Read(#[source] io::Error),

    /// HTTP/2 exchange failed.
    #[error("HTTP/2 exchange failed: {0}")]
    Dispatch(#[source] BoxError),

    /// The stock transport used for `http://` requests failed.
    #[error("plaintext round trip failed: {0}")]
    Plaintext(#[source] BoxError),
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Config(_) => Stage::Config,
            Self::UnsupportedScheme(_) | Self::InvalidRequest(_) => Stage::Scheme,
            Self::Dial { .. } => Stage::Dial,
            Self::Handshake { .. } => Stage::Handshake,
            Self::UnsupportedProtocol(_) | Self::Write(_) | Self::Read(_) | Self::Dispatch(_) => {
                Stage::Dispatch
            }
            Self::Plaintext(_) => Stage::Plaintext,
        }
    }

    /// True when the deadline or the external cancellation token cut the call short.
    pub fn is_timeout(&self) -> bool {
        let kind = match self {
            Self::Dial { source, .. } => Some(source.kind()),
            Self::Write(e) | Self::Read(e) => Some(e.kind()),
            Self::Handshake { source, .. } | Self::Dispatch(source) => {
                source.downcast_ref::<io::Error>().map(io::Error::kind)
            }
            _ => None,
        };
        matches!(kind, Some(io::ErrorKind::TimedOut | io::ErrorKind::Interrupted))
    }

    pub(crate) fn handshake(server_name: &str, source: BoxError) -> Self {
        Self::Handshake {
            server_name: server_name.to_string(),
            source,
        }
    }
}
