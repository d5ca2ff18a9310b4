//! Stock transport for plaintext `http://` requests, which never go through
//! the fingerprinting path.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http::{Request, Response};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::{ReaderStream, StreamReader};
use veil_traits::{BoxBody, BoxError, PlainTransport, RawBody, RequestBody};

use crate::config::TransportConfig;
use crate::error::{Error, Result};

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// [`PlainTransport`] backed by a reqwest client. Redirects are returned to the
/// caller as-is.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .map_err(|e| Error::Config(format!("plaintext client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn convert(request: Request<RequestBody>) -> std::result::Result<reqwest::Request, BoxError> {
        let (parts, body) = request.into_parts();
        let url = reqwest::Url::parse(&parts.uri.to_string())?;
        let mut out = reqwest::Request::new(parts.method, url);
        *out.headers_mut() = parts.headers;
        *out.version_mut() = parts.version;
        *out.body_mut() = match body {
            RequestBody::Empty => None,
            RequestBody::Full(bytes) => Some(reqwest::Body::from(bytes)),
            RequestBody::Reader(reader) => Some(reqwest::Body::wrap_stream(ReaderStream::new(reader))),
        };
        Ok(out)
    }
}

#[async_trait]
impl PlainTransport for ReqwestTransport {
    async fn round_trip(
        &self,
        request: Request<RequestBody>,
    ) -> std::result::Result<Response<BoxBody>, BoxError> {
        let request = Self::convert(request)?;
        let response = self.client.execute(request).await?;

        let mut out = Response::builder()
            .status(response.status())
            .version(response.version());
        if let Some(headers) = out.headers_mut() {
            *headers = response.headers().clone();
        }
        let stream: ByteStream = Box::pin(response.bytes_stream().map_err(io::Error::other));
        let body: BoxBody = Box::new(PlainBody {
            inner: StreamReader::new(stream),
        });
        Ok(out.body(body)?)
    }
}

struct PlainBody {
    inner: StreamReader<ByteStream, Bytes>,
}

impl AsyncRead for PlainBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl RawBody for PlainBody {}
