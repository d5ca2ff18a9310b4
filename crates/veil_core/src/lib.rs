pub mod config;

use anyhow::{Context, Result};
use http::{Request, StatusCode, Version};
use veil_net::{RequestBody, Transport};

pub use config::{Config, CONFIG_ENV};

/// Outcome of a single fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub status: StatusCode,
    pub version: Version,
    pub body_len: usize,
}

/// Performs one GET to `url` and drains the body.
pub async fn fetch(transport: &Transport, url: &str) -> Result<Fetched> {
    let request = Request::get(url)
        .body(RequestBody::Empty)
        .with_context(|| format!("invalid URL {url}"))?;

    let response = transport.round_trip(request).await?;
    let status = response.status();
    let version = response.version();
    tracing::info!(%url, %status, ?version, "response received");

    let body = response
        .into_body()
        .bytes()
        .await
        .context("reading response body")?;

    Ok(Fetched {
        status,
        version,
        body_len: body.len(),
    })
}
