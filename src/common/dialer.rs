//! Outbound dialer used by every forwarder.
//!
//! Resolves the proxy server, applies the connect timeout and bounds each
//! handshake step with the same limit so a worker never hangs on an
//! unreachable proxy.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::error::ProxyError;

/// Default connect / handshake timeout, shared with the latency probe.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dialer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Connect timeout in milliseconds. Default: 5000.
    #[serde(rename = "connect-timeout")]
    pub connect_timeout_ms: Option<u64>,
}

impl DialerConfig {
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[derive(Debug, Clone)]
pub struct Dialer {
    timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::default_dialer()
    }
}

impl Dialer {
    pub fn new(config: &DialerConfig) -> Self {
        Self {
            timeout: config.connect_timeout(),
        }
    }

    pub fn default_dialer() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one handshake step under the dialer's timeout.
    pub async fn with_timeout<T, F>(&self, what: &str, fut: F) -> Result<T, ProxyError>
    where
        F: Future<Output = Result<T, ProxyError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| {
                ProxyError::ConnectionTimeout(format!("{} timed out after {:?}", what, self.timeout))
            })?
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, ProxyError> {
        let target = format!("{}:{}", host, port);
        self.with_timeout("resolve", async {
            tokio::net::lookup_host(&target)
                .await?
                .next()
                .ok_or_else(|| ProxyError::Protocol(format!("failed to resolve {}", target)))
        })
        .await
    }

    /// Resolve `host:port` and open a TCP connection within the timeout.
    pub async fn connect_host(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let addr = self.resolve(host, port).await?;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ProxyError::ConnectionTimeout(format!(
                    "connect timeout after {:?} to {}",
                    self.timeout, addr
                ))
            })??;
        let _ = stream.set_nodelay(true);
        debug!(server = %addr, "tcp connected");
        Ok(stream)
    }

    /// Bind an ephemeral UDP socket of the matching family and connect it.
    pub async fn connect_udp(&self, host: &str, port: u16) -> Result<UdpSocket, ProxyError> {
        let addr = self.resolve(host, port).await?;
        self.connect_udp_addr(addr).await
    }

    pub async fn connect_udp_addr(&self, addr: SocketAddr) -> Result<UdpSocket, ProxyError> {
        let local_bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local_bind).await?;
        socket.connect(addr).await?;
        debug!(server = %addr, local = ?socket.local_addr().ok(), "udp socket connected");
        Ok(socket)
    }
}
