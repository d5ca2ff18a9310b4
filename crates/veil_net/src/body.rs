use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use veil_traits::BoxBody;

use crate::conn::Connection;

/// Response body handed to the caller. Owns the connection the response came
/// in on; closing the body (explicitly or by dropping it) closes that
/// connection exactly once.
pub struct ResponseBody {
    raw: Option<BoxBody>,
    conn: Option<Connection>,
}

impl ResponseBody {
    pub fn new(raw: BoxBody, conn: Connection) -> Self {
        Self {
            raw: Some(raw),
            conn: Some(conn),
        }
    }

    /// Body whose transport manages its own connections.
    pub fn from_raw(raw: BoxBody) -> Self {
        Self {
            raw: Some(raw),
            conn: None,
        }
    }

    /// Closes the raw body, then the connection regardless of how that went.
    /// Returns the raw body's close error, if any. Later calls are no-ops.
    pub fn close(&mut self) -> io::Result<()> {
        let result = match self.raw.take() {
            Some(mut raw) => raw.close(),
            None => Ok(()),
        };
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }

    /// Reads the remaining body, then closes it.
    pub async fn bytes(mut self) -> io::Result<Bytes> {
        let mut out = Vec::new();
        self.read_to_end(&mut out).await?;
        self.close()?;
        Ok(Bytes::from(out))
    }

    pub async fn text(self) -> io::Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl AsyncRead for ResponseBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.raw.as_mut() {
            Some(raw) => Pin::new(raw).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "read on closed response body",
            ))),
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("closed", &self.is_closed())
            .field("conn", &self.conn)
            .finish()
    }
}
