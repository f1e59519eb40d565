//! Outbound TCP connections, optionally routed through a SOCKS5 proxy.
//!
//! Each worker task owns its own [`Dialer`]. Nothing here touches process-wide
//! state, so tasks with and without a proxy can run side by side.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use crate::error::ProxyError;

pub const DEFAULT_SOCKS_PORT: u16 = 1080;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

// Keeps credentials out of logs.
impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyConfig {
    type Err = ProxyError;

    /// Accepts `socks5://[user:pass@]host[:port]` and the `socks5h` variant.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url: Url = Url::parse(s).map_err(|e| ProxyError::InvalidUrl(format!("{s}: {e}")))?;

        match url.scheme() {
            "socks5" | "socks5h" => {}
            other => return Err(ProxyError::UnsupportedScheme(other.to_string())),
        }

        let host: String = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidUrl(format!("{s}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let username: Option<String> = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_SOCKS_PORT),
            username,
            password: url.password().map(str::to_string),
        })
    }
}

/// Connects to targets, directly or through the configured proxy.
#[derive(Debug, Clone)]
pub struct Dialer {
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(proxy: Option<ProxyConfig>, connect_timeout: Duration) -> Self {
        Self {
            proxy,
            connect_timeout,
        }
    }

    pub fn direct(connect_timeout: Duration) -> Self {
        Self::new(None, connect_timeout)
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Opens a TCP stream to `host:port`. Hostnames are resolved by the proxy
    /// when one is set.
    pub async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        match &self.proxy {
            None => timeout(self.connect_timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))?,
            Some(proxy) => {
                let proxy_addr = (proxy.host.as_str(), proxy.port);
                let target = (host, port);

                let attempt = async {
                    match (&proxy.username, &proxy.password) {
                        (Some(user), Some(pass)) => {
                            Socks5Stream::connect_with_password(proxy_addr, target, user, pass)
                                .await
                        }
                        _ => Socks5Stream::connect(proxy_addr, target).await,
                    }
                };

                let stream = timeout(self.connect_timeout, attempt)
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "proxy connect timeout"))?
                    .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

                Ok(stream.into_inner())
            }
        }
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
