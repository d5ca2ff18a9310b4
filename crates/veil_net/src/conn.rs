//! Per-request connection ownership.
//!
//! A [`Connection`] owns the secure stream for exactly one round trip. Protocol
//! engines only ever see [`ConnIo`] handles onto it, so closing the connection
//! releases the socket immediately, no matter which engine task still holds a
//! handle.

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;
use veil_traits::{BoxStream, ConnectionSource};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Slot {
    id: u64,
    stream: Mutex<Option<BoxStream>>,
    /// Last task blocked in each direction, woken on close so it observes `NotConnected`.
    reader: Mutex<Option<Waker>>,
    writer: Mutex<Option<Waker>>,
}

impl Slot {
    fn close(&self) -> bool {
        let taken = self.stream.lock().take();
        match taken {
            Some(stream) => {
                drop(stream);
                for parked in [&self.reader, &self.writer] {
                    if let Some(waker) = parked.lock().take() {
                        waker.wake();
                    }
                }
                debug!(conn = self.id, "connection closed");
                true
            }
            None => false,
        }
    }

    fn park<T>(parked: &Mutex<Option<Waker>>, cx: &Context<'_>, poll: Poll<T>) -> Poll<T> {
        if poll.is_pending() {
            let mut slot = parked.lock();
            match slot.as_ref() {
                Some(waker) if waker.will_wake(cx.waker()) => {}
                _ => *slot = Some(cx.waker().clone()),
            }
        }
        poll
    }
}

/// The secure stream of a single in-flight request. Never shared across requests.
pub struct Connection {
    slot: Arc<Slot>,
}

impl Connection {
    pub fn new(stream: BoxStream) -> Self {
        Self {
            slot: Arc::new(Slot {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                stream: Mutex::new(Some(stream)),
                reader: Mutex::new(None),
                writer: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// I/O handle for a protocol engine. Fails with `NotConnected` once closed.
    pub fn io(&self) -> ConnIo {
        ConnIo {
            slot: self.slot.clone(),
        }
    }

    /// Drops the underlying stream. Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.slot.close()
    }

    pub fn is_closed(&self) -> bool {
        self.slot.stream.lock().is_none()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.slot.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.slot.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

/// Borrowed view of a [`Connection`]'s stream.
pub struct ConnIo {
    slot: Arc<Slot>,
}

impl AsyncRead for ConnIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut guard = self.slot.stream.lock();
        match guard.as_mut() {
            Some(stream) => Slot::park(&self.slot.reader, cx, Pin::new(stream).poll_read(cx, buf)),
            None => Poll::Ready(Err(closed())),
        }
    }
}

impl AsyncWrite for ConnIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut guard = self.slot.stream.lock();
        match guard.as_mut() {
            Some(stream) => Slot::park(&self.slot.writer, cx, Pin::new(stream).poll_write(cx, buf)),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.slot.stream.lock();
        match guard.as_mut() {
            Some(stream) => Slot::park(&self.slot.writer, cx, Pin::new(stream).poll_flush(cx)),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.slot.stream.lock();
        match guard.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            // Already released by the owner.
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Connection source that hands an already-secured stream to a protocol engine
/// exactly once and never touches the network.
pub struct PreConnected {
    io: Option<ConnIo>,
}

impl PreConnected {
    pub fn new(conn: &Connection) -> Self {
        Self {
            io: Some(conn.io()),
        }
    }
}

impl ConnectionSource for PreConnected {
    fn acquire(&mut self) -> io::Result<BoxStream> {
        match self.io.take() {
            Some(io) => Ok(Box::new(io)),
            None => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "pre-connected stream already handed out",
            )),
        }
    }
}
