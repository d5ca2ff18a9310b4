//! Dialer selection: direct TCP (honouring environment proxies) or an explicit SOCKS5 relay.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};
use url::Url;
use veil_traits::{BoxStream, Dialer, TargetAddress};

use crate::error::{Error, Result};

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Picks the dialer for every call: the SOCKS5 relay whenever one is configured,
/// never falling back to direct or environment-implied routes.
pub struct DialerSelector {
    direct: Arc<dyn Dialer>,
    socks5: Option<Arc<dyn Dialer>>,
}

impl DialerSelector {
    pub fn new(direct: Arc<dyn Dialer>, socks5: Option<Arc<dyn Dialer>>) -> Self {
        Self { direct, socks5 }
    }

    pub fn uses_proxy(&self) -> bool {
        self.socks5.is_some()
    }
}

#[async_trait]
impl Dialer for DialerSelector {
    async fn dial(&self, target: &TargetAddress) -> io::Result<BoxStream> {
        match &self.socks5 {
            Some(proxy) => proxy.dial(target).await,
            None => self.direct.dial(target).await,
        }
    }

    fn name(&self) -> &str {
        match &self.socks5 {
            Some(proxy) => proxy.name(),
            None => self.direct.name(),
        }
    }
}

/// Relays through a SOCKS5 proxy. The hostname is handed to the proxy unresolved.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: String,
    auth: Option<(String, String)>,
}

impl Socks5Dialer {
    /// Accepts `socks5://[user:pass@]host[:port]` (or `socks5h://`).
    pub fn from_url(url: &Url) -> Result<Self> {
        match url.scheme() {
            "socks5" | "socks5h" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported proxy scheme {other:?}, expected socks5"
                )))
            }
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config(format!("proxy URL {url} has no host")))?;
        let port = url.port().unwrap_or(DEFAULT_SOCKS_PORT);
        let proxy_addr = TargetAddress::new(host, port).to_string();

        let auth = if url.username().is_empty() {
            None
        } else {
            let user = decode(url.username())?;
            let pass = decode(url.password().unwrap_or_default())?;
            Some((user, pass))
        };

        Ok(Self { proxy_addr, auth })
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }
}

fn decode(component: &str) -> Result<String> {
    urlencoding::decode(component)
        .map(|s| s.into_owned())
        .map_err(|e| Error::Config(format!("proxy credentials are not valid UTF-8: {e}")))
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, target: &TargetAddress) -> io::Result<BoxStream> {
        debug!(proxy = %self.proxy_addr, %target, "dialing through SOCKS5");
        let dest = (target.host.as_str(), target.port);
        let stream = match &self.auth {
            Some((user, pass)) => {
                Socks5Stream::connect_with_password(self.proxy_addr.as_str(), dest, user, pass)
                    .await
            }
            None => Socks5Stream::connect(self.proxy_addr.as_str(), dest).await,
        }
        .map_err(io::Error::other)?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &str {
        "socks5"
    }
}

/// Hosts excluded from environment proxying (`NO_PROXY`).
#[derive(Debug, Clone, Default)]
pub struct NoProxy {
    all: bool,
    entries: Vec<String>,
}

impl NoProxy {
    pub fn parse(raw: &str) -> Self {
        let mut out = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry == "*" {
                out.all = true;
                continue;
            }
            let entry = entry
                .trim_start_matches("*.")
                .trim_start_matches('.')
                .to_ascii_lowercase();
            out.entries.push(entry);
        }
        out
    }

    pub fn matches(&self, host: &str) -> bool {
        if self.all {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.entries.iter().any(|entry| {
            host == *entry
                || (host.len() > entry.len()
                    && host.ends_with(entry.as_str())
                    && host.as_bytes()[host.len() - entry.len() - 1] == b'.')
        })
    }
}

/// SOCKS5 proxy implied by `ALL_PROXY`, captured once at construction.
#[derive(Debug, Clone)]
pub struct EnvProxy {
    proxy: Socks5Dialer,
    no_proxy: NoProxy,
}

impl EnvProxy {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads proxy variables through `lookup`; upper-case names win over lower-case ones.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .filter(|v| !v.trim().is_empty())
        };
        let raw = var("ALL_PROXY", "all_proxy")?;
        let url = match Url::parse(raw.trim()) {
            Ok(url) => url,
            Err(e) => {
                warn!(value = %raw, error = %e, "ignoring malformed ALL_PROXY");
                return None;
            }
        };
        let proxy = match Socks5Dialer::from_url(&url) {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!(error = %e, "ignoring ALL_PROXY");
                return None;
            }
        };
        let no_proxy = var("NO_PROXY", "no_proxy")
            .map(|raw| NoProxy::parse(&raw))
            .unwrap_or_default();
        Some(Self { proxy, no_proxy })
    }

    fn applies_to(&self, target: &TargetAddress) -> bool {
        !self.no_proxy.matches(&target.host)
    }
}

/// Direct TCP dialer. Sockets are configured before connecting.
#[derive(Debug, Clone, Default)]
pub struct DirectDialer {
    env_proxy: Option<EnvProxy>,
}

impl DirectDialer {
    pub fn new(env_proxy: Option<EnvProxy>) -> Self {
        Self { env_proxy }
    }

    pub fn from_env() -> Self {
        Self::new(EnvProxy::from_env())
    }

    async fn connect_tcp(target: &TargetAddress) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host((target.host.as_str(), target.port)).await? {
            match connect_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {target}"),
            )
        }))
    }
}

async fn connect_addr(addr: SocketAddr) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    socket.set_nonblocking(true)?;
    let std_stream: std::net::TcpStream = socket.into();
    TcpSocket::from_std_stream(std_stream).connect(addr).await
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &TargetAddress) -> io::Result<BoxStream> {
        if let Some(env) = self.env_proxy.as_ref().filter(|env| env.applies_to(target)) {
            return env.proxy.dial(target).await;
        }
        debug!(%target, "dialing direct");
        let stream = Self::connect_tcp(target).await?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &str {
        "direct"
    }
}
