//! HTTP/2 engine bound to a pre-established secure stream.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::future::poll_fn;
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use http::header::{CONNECTION, HOST, TE, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, Request, Response, Version};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::debug;
use veil_traits::{
    BoxBody, BoxError, ConnectionSource, MultiplexEngine, MultiplexedConnection, RawBody,
    RequestBody,
};

use crate::fingerprint::{Http2Settings, MAX_HEADER_LIST_SIZE};

const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = 16_777_215;
const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;
const READ_CHUNK: usize = 16 * 1024;

/// Frames requests with the h2 crate, advertising the impersonated browser's SETTINGS.
#[derive(Debug, Clone, Copy)]
pub struct H2Engine {
    settings: Http2Settings,
}

impl H2Engine {
    pub fn new(settings: Http2Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Http2Settings {
        &self.settings
    }

    fn builder(&self) -> h2::client::Builder {
        let s = &self.settings;
        let mut builder = h2::client::Builder::new();
        builder
            .header_table_size(s.header_table_size)
            .enable_push(s.enable_push)
            .initial_window_size(s.initial_window_size.min(MAX_WINDOW_SIZE))
            .initial_connection_window_size(s.initial_connection_window_size.min(MAX_WINDOW_SIZE))
            .max_frame_size(s.max_frame_size.clamp(MIN_FRAME_SIZE, MAX_FRAME_SIZE))
            .max_header_list_size(MAX_HEADER_LIST_SIZE);
        if let Some(streams) = s.max_concurrent_streams {
            builder.max_concurrent_streams(streams);
        }
        builder
    }
}

#[async_trait]
impl MultiplexEngine for H2Engine {
    async fn bind(
        &self,
        mut source: Box<dyn ConnectionSource>,
    ) -> Result<Box<dyn MultiplexedConnection>, BoxError> {
        let io = source.acquire()?;
        let (send, connection) = self
            .builder()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| BoxError::from(format!("HTTP/2 handshake failed: {e}")))?;

        // The driver only holds a handle onto the caller's connection and ends
        // as soon as that connection is closed.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP/2 connection driver ended: {}", e);
            }
        });

        Ok(Box::new(H2Connection { send }))
    }
}

/// One bound HTTP/2 session. Used for a single request.
pub struct H2Connection {
    send: SendRequest<Bytes>,
}

/// Removes headers HTTP/2 forbids (RFC 9113 §8.2.2). `Host` travels as `:authority`.
fn strip_connection_headers(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in nominated {
        headers.remove(name.as_str());
    }

    for name in [CONNECTION, TRANSFER_ENCODING, UPGRADE, HOST] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");

    let te_trailers = headers
        .get(TE)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"trailers"))
        .unwrap_or(true);
    if !te_trailers {
        headers.remove(TE);
    }
}

async fn send_data(stream: &mut SendStream<Bytes>, mut data: Bytes, end: bool) -> Result<(), BoxError> {
    if data.is_empty() {
        stream.send_data(data, end)?;
        return Ok(());
    }
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(granted) => granted?,
            None => return Err("stream reset while sending request body".into()),
        };
        let chunk = data.split_to(granted.min(data.len()));
        stream.send_data(chunk, end && data.is_empty())?;
    }
    Ok(())
}

async fn send_body(stream: &mut SendStream<Bytes>, body: RequestBody) -> Result<(), BoxError> {
    match body {
        RequestBody::Empty => send_data(stream, Bytes::new(), true).await,
        RequestBody::Full(bytes) => send_data(stream, bytes, true).await,
        RequestBody::Reader(mut reader) => {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return send_data(stream, Bytes::new(), true).await;
                }
                send_data(stream, Bytes::copy_from_slice(&buf[..n]), false).await?;
            }
        }
    }
}

#[async_trait]
impl MultiplexedConnection for H2Connection {
    async fn issue(
        &mut self,
        request: Request<RequestBody>,
    ) -> Result<Response<BoxBody>, BoxError> {
        let (mut parts, body) = request.into_parts();
        strip_connection_headers(&mut parts.headers);
        parts.version = Version::HTTP_2;

        let end_of_stream = body.is_empty();
        let mut ready = self.send.clone().ready().await?;
        let (response, mut stream) = ready.send_request(Request::from_parts(parts, ()), end_of_stream)?;
        if !end_of_stream {
            send_body(&mut stream, body).await?;
        }

        let response = response.await?;
        let (parts, recv) = response.into_parts();
        debug!(status = %parts.status, "HTTP/2 response headers received");
        Ok(Response::from_parts(parts, Box::new(H2Body::new(recv)) as BoxBody))
    }
}

fn h2_to_io(e: h2::Error) -> io::Error {
    if e.is_io() {
        if let Some(io) = e.into_io() {
            return io;
        }
        return io::Error::other("HTTP/2 I/O error");
    }
    io::Error::other(e)
}

/// Response DATA frames exposed as a byte stream. Flow-control capacity is
/// released as soon as each frame is taken off the stream.
pub struct H2Body {
    recv: Option<RecvStream>,
    pending: Bytes,
}

impl H2Body {
    fn new(recv: RecvStream) -> Self {
        Self {
            recv: Some(recv),
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for H2Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            let Some(recv) = this.recv.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            match ready!(recv.poll_data(cx)) {
                None => return Poll::Ready(Ok(())),
                Some(Ok(chunk)) => {
                    let _ = recv.flow_control().release_capacity(chunk.len());
                    this.pending = chunk;
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
            }
        }
    }
}

impl RawBody for H2Body {
    fn close(&mut self) -> io::Result<()> {
        self.recv = None;
        self.pending.clear();
        Ok(())
    }
}
