//! HTTP/1.1 exchange written straight onto an already-secured stream.
//!
//! The request head is serialized by hand so header order survives untouched;
//! the response head is parsed with httparse through a buffered reader, and the
//! body is framed lazily as the caller reads it.

use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadBuf,
};
use tracing::debug;
use veil_traits::{BoxBody, EmptyBody, RawBody, RequestBody};

use crate::error::{Error, Result};
use crate::fingerprint::MAX_HEADER_LIST_SIZE;

const MAX_HEADERS_COUNT: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;
const WRITE_CHUNK: usize = 16 * 1024;

/// Writes `request` onto `io`, then reads the response head from the same stream.
/// The returned body keeps reading from `io` on demand.
pub async fn exchange<S>(mut io: S, request: Request<RequestBody>) -> Result<Response<BoxBody>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (parts, body) = request.into_parts();
    let head = encode_head(&parts.method, &parts.uri, &parts.headers, &body).map_err(Error::Write)?;

    io.write_all(&head).await.map_err(Error::Write)?;
    write_body(&mut io, body, &parts.headers).await.map_err(Error::Write)?;
    io.flush().await.map_err(Error::Write)?;

    let mut reader = BufReader::new(io);
    loop {
        let raw = read_head(&mut reader).await.map_err(Error::Read)?;
        let (status, headers) = parse_head(&raw).map_err(Error::Read)?;

        // Interim responses carry no body; 101 is final because the stream changes hands.
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(%status, "skipping interim response");
            continue;
        }

        let framing = Framing::for_response(&parts.method, status, &headers).map_err(Error::Read)?;
        let body: BoxBody = match framing {
            Framing::Done => Box::new(EmptyBody),
            framing => Box::new(H1Body { reader, framing }),
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.version_mut() = Version::HTTP_11;
        *response.headers_mut() = headers;
        return Ok(response);
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

fn malformed(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn encode_head(
    method: &Method,
    uri: &http::Uri,
    headers: &HeaderMap,
    body: &RequestBody,
) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');

    if method == Method::CONNECT {
        let authority = uri
            .authority()
            .ok_or_else(|| invalid("CONNECT requires an authority"))?;
        out.extend_from_slice(authority.as_str().as_bytes());
    } else {
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        out.extend_from_slice(if target.is_empty() { "/" } else { target }.as_bytes());
    }
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(HOST) {
        let host = uri
            .authority()
            .map(|a| a.as_str())
            .ok_or_else(|| invalid("request has no host"))?;
        // userinfo never goes on the wire
        let host = host.rsplit('@').next().unwrap_or(host);
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(host.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    for (name, value) in headers {
        if value.as_bytes().iter().any(|b| matches!(b, b'\r' | b'\n' | 0)) {
            return Err(invalid(format!("invalid character in header {name}")));
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    let framed = headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING);
    if !framed {
        match body.exact_len() {
            Some(0) if !method_expects_body(method) => {}
            Some(len) => {
                out.extend_from_slice(b"Content-Length: ");
                out.extend_from_slice(len.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            None => out.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
        }
    }

    out.extend_from_slice(b"\r\n");
    Ok(out)
}

fn method_expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

async fn write_body<W>(io: &mut W, body: RequestBody, headers: &HeaderMap) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match body {
        RequestBody::Empty => Ok(()),
        RequestBody::Full(bytes) => io.write_all(&bytes).await,
        RequestBody::Reader(mut reader) => {
            // A caller-supplied Content-Length means the reader is sent raw.
            let chunked = !headers.contains_key(CONTENT_LENGTH);
            let mut buf = vec![0u8; WRITE_CHUNK];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                if chunked {
                    io.write_all(format!("{n:x}\r\n").as_bytes()).await?;
                    io.write_all(&buf[..n]).await?;
                    io.write_all(b"\r\n").await?;
                } else {
                    io.write_all(&buf[..n]).await?;
                }
            }
            if chunked {
                io.write_all(b"0\r\n\r\n").await?;
            }
            Ok(())
        }
    }
}

/// Reads one response head, line by line, up to and including the blank line.
async fn read_head<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_HEADER_LIST_SIZE as usize;
    let mut head = Vec::with_capacity(1024);
    loop {
        let start = head.len();
        // one byte past the limit is enough to know the head is too large
        let budget = (limit + 1 - start) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut head).await?;
        if head.len() > limit {
            return Err(malformed("response head too large"));
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            // tolerate stray blank lines before the status line
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(head);
        }
    }
}

fn parse_head(raw: &[u8]) -> io::Result<(StatusCode, HeaderMap)> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut parsed = httparse::Response::new(&mut slots);
    match parsed.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(malformed("incomplete response head")),
        Err(e) => return Err(malformed(format!("bad response head: {e}"))),
    }

    let code = parsed.code.ok_or_else(|| malformed("missing status code"))?;
    let status = StatusCode::from_u16(code).map_err(|e| malformed(e.to_string()))?;

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| malformed(e.to_string()))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|e| malformed(e.to_string()))?;
        headers.append(name, value);
    }
    Ok((status, headers))
}

/// Multiple identical Content-Length values are allowed; conflicting ones are not.
fn parse_content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let mut found: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| malformed("non-ASCII Content-Length"))?;
        for part in text.split(',').map(str::trim) {
            let len: u64 = part
                .parse()
                .map_err(|_| malformed(format!("invalid Content-Length: {text}")))?;
            match found {
                Some(prev) if prev != len => {
                    return Err(malformed(format!("conflicting Content-Length: {text}")))
                }
                _ => found = Some(len),
            }
        }
    }
    Ok(found)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked(Chunk),
    /// Delimited by connection close.
    Eof,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk {
    Size(Vec<u8>),
    Data(u64),
    DataEnd(Vec<u8>),
    Trailer(Vec<u8>),
}

impl Framing {
    fn for_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> io::Result<Self> {
        if *method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Self::Done);
        }

        // Transfer-Encoding overrides Content-Length.
        if let Some(te) = headers.get(TRANSFER_ENCODING) {
            let chunked = te
                .to_str()
                .ok()
                .and_then(|v| v.split(',').next_back())
                .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
                .unwrap_or(false);
            return Ok(if chunked {
                Self::Chunked(Chunk::Size(Vec::new()))
            } else {
                Self::Eof
            });
        }

        Ok(match parse_content_length(headers)? {
            Some(0) => Self::Done,
            Some(len) => Self::Length(len),
            None => Self::Eof,
        })
    }
}

/// Response body read incrementally off the connection.
pub struct H1Body<R> {
    reader: BufReader<R>,
    framing: Framing,
}

/// Appends bytes up to and including `\n` to `line`.
fn poll_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    cx: &mut Context<'_>,
    line: &mut Vec<u8>,
) -> Poll<io::Result<()>> {
    loop {
        let available = ready!(Pin::new(&mut *reader).poll_fill_buf(cx))?;
        if available.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked body",
            )));
        }
        let (take, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        line.extend_from_slice(&available[..take]);
        Pin::new(&mut *reader).consume(take);
        if line.len() > MAX_CHUNK_LINE {
            return Poll::Ready(Err(malformed("chunk line too long")));
        }
        if done {
            return Poll::Ready(Ok(()));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| malformed("non-ASCII chunk size"))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| malformed(format!("invalid chunk size {size:?}")))
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

impl<R: AsyncRead + Unpin> H1Body<R> {
    /// Copies up to `limit` buffered bytes into `buf`, returning how many were copied.
    fn poll_copy(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
        limit: u64,
    ) -> Poll<io::Result<u64>> {
        let available = ready!(Pin::new(&mut self.reader).poll_fill_buf(cx))?;
        if available.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before full body",
            )));
        }
        let n = available.len().min(buf.remaining()).min(limit as usize);
        buf.put_slice(&available[..n]);
        Pin::new(&mut self.reader).consume(n);
        Poll::Ready(Ok(n as u64))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for H1Body<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let this = &mut *self;
        loop {
            match &mut this.framing {
                Framing::Done => return Poll::Ready(Ok(())),
                Framing::Eof => return Pin::new(&mut this.reader).poll_read(cx, buf),
                Framing::Length(remaining) => {
                    let remaining = *remaining;
                    let n = ready!(this.poll_copy(cx, buf, remaining))?;
                    this.framing = if n == remaining {
                        Framing::Done
                    } else {
                        Framing::Length(remaining - n)
                    };
                    return Poll::Ready(Ok(()));
                }
                Framing::Chunked(Chunk::Size(line)) => {
                    ready!(poll_line(&mut this.reader, cx, line))?;
                    let size = parse_chunk_size(line)?;
                    this.framing = Framing::Chunked(if size == 0 {
                        Chunk::Trailer(Vec::new())
                    } else {
                        Chunk::Data(size)
                    });
                }
                Framing::Chunked(Chunk::Data(remaining)) => {
                    let remaining = *remaining;
                    let n = ready!(this.poll_copy(cx, buf, remaining))?;
                    this.framing = Framing::Chunked(if n == remaining {
                        Chunk::DataEnd(Vec::new())
                    } else {
                        Chunk::Data(remaining - n)
                    });
                    return Poll::Ready(Ok(()));
                }
                Framing::Chunked(Chunk::DataEnd(line)) => {
                    ready!(poll_line(&mut this.reader, cx, line))?;
                    if !is_blank(line) {
                        return Poll::Ready(Err(malformed("missing CRLF after chunk data")));
                    }
                    this.framing = Framing::Chunked(Chunk::Size(Vec::new()));
                }
                Framing::Chunked(Chunk::Trailer(line)) => {
                    ready!(poll_line(&mut this.reader, cx, line))?;
                    if is_blank(line) {
                        this.framing = Framing::Done;
                    } else {
                        line.clear();
                    }
                }
            }
        }
    }
}

impl<R: AsyncRead + Send + Unpin> RawBody for H1Body<R> {}
