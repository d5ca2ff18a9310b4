use http::{Request, Response};
use tracing::debug;
use veil_traits::{BoxBody, MultiplexEngine, NegotiatedProtocol, RequestBody};

use crate::conn::{Connection, PreConnected};
use crate::error::{Error, Result};
use crate::h1;

/// Runs the exchange over `conn` with the protocol the handshake negotiated.
///
/// An unrecognised ALPN value fails before a single byte is written. The
/// connection is left open on error; closing it is the caller's job.
pub async fn dispatch(
    mut request: Request<RequestBody>,
    conn: &Connection,
    alpn: &str,
    engine: &dyn MultiplexEngine,
) -> Result<Response<BoxBody>> {
    let protocol = NegotiatedProtocol::from_alpn(alpn)
        .ok_or_else(|| Error::UnsupportedProtocol(alpn.to_string()))?;
    debug!(conn = conn.id(), protocol = protocol.as_str(), "dispatching");

    let version = protocol.version();
    *request.version_mut() = version;
    let mut response = match protocol {
        NegotiatedProtocol::H2 => {
            let source = Box::new(PreConnected::new(conn));
            let mut mux = engine.bind(source).await.map_err(Error::Dispatch)?;
            mux.issue(request).await.map_err(Error::Dispatch)?
        }
        NegotiatedProtocol::Http11 | NegotiatedProtocol::None => h1::exchange(conn.io(), request).await?,
    };
    *response.version_mut() = version;
    Ok(response)
}
