//! Scripted servers running on the far side of an in-memory stream.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

#[derive(Clone, Copy)]
#[allow(dead_code)]
pub enum Peer {
    /// h2 server answering every request with 200 and the body `ok`.
    H2,
    /// Reads one HTTP/1.1 request head, then writes these bytes verbatim.
    H1(&'static [u8]),
    /// Reads until EOF and never answers.
    Silent,
    /// Answers with a status line and one header value that never ends.
    EndlessHeader,
}

impl Peer {
    pub fn spawn(self, io: DuplexStream) {
        match self {
            Peer::H2 => {
                tokio::spawn(serve_h2(io));
            }
            Peer::H1(reply) => {
                tokio::spawn(serve_h1(io, reply));
            }
            Peer::Silent => {
                tokio::spawn(drain(io));
            }
            Peer::EndlessHeader => {
                tokio::spawn(serve_endless_header(io));
            }
        }
    }
}

async fn serve_h2(io: DuplexStream) {
    let Ok(mut conn) = h2::server::handshake(io).await else {
        return;
    };
    while let Some(Ok((request, mut respond))) = conn.accept().await {
        let response = http::Response::builder()
            .status(200)
            .header("x-path", request.uri().path())
            .body(())
            .unwrap();
        if let Ok(mut send) = respond.send_response(response, false) {
            let _ = send.send_data(Bytes::from_static(b"ok"), true);
        }
    }
}

async fn read_head(io: &mut DuplexStream) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match io.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    Some(head)
}

async fn serve_h1(mut io: DuplexStream, reply: &'static [u8]) {
    if read_head(&mut io).await.is_none() {
        return;
    }
    if io.write_all(reply).await.is_err() {
        return;
    }
    drain(io).await;
}

async fn serve_endless_header(mut io: DuplexStream) {
    if read_head(&mut io).await.is_none() {
        return;
    }
    if io.write_all(b"HTTP/1.1 200 OK\r\nX-Big: ").await.is_err() {
        return;
    }
    let filler = [b'a'; 4096];
    for _ in 0..100 {
        if io.write_all(&filler).await.is_err() {
            return;
        }
    }
    drain(io).await;
}

async fn drain(mut io: DuplexStream) {
    let mut buf = [0u8; 1024];
    while let Ok(n) = io.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
}
