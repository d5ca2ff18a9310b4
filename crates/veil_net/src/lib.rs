//! Browser-fingerprinting HTTP transport.
//!
//! [`Transport::round_trip`] dials, performs a TLS handshake shaped like a real
//! browser's, and speaks HTTP/1.1 or HTTP/2 depending on what ALPN settled on.

pub mod body;
pub mod config;
pub mod conn;
pub mod dialer;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod h1;
pub mod h2;
pub mod plain;
pub mod tls;
pub mod transport;

pub use body::ResponseBody;
pub use config::{BaseTransport, Http2Tuning, HttpTuning, TransportConfig};
pub use conn::{Connection, PreConnected};
pub use dialer::{DialerSelector, DirectDialer, Socks5Dialer};
pub use error::{Error, Result, Stage};
pub use h2::H2Engine;
pub use plain::ReqwestTransport;
pub use tls::BoringImpersonator;
pub use transport::{Transport, TransportBuilder};

pub use veil_traits::{ProfileId, RequestBody, TargetAddress};
