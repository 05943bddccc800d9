use std::net::SocketAddr;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::{Dialer, ProxyError};
use crate::config::ServerDescriptor;

/// 响应最多读取的字节数
const RESPONSE_BUF_SIZE: usize = 1024;
const STATUS_OK_PREFIX: &[u8; 12] = b"HTTP/1.1 200";

/// HTTP CONNECT 转发器，只支持 TCP
#[derive(Debug, Clone)]
pub struct HttpConnectForwarder {
    server: ServerDescriptor,
    dialer: Dialer,
}

impl HttpConnectForwarder {
    pub fn new(server: &ServerDescriptor, dialer: Dialer) -> Self {
        debug!(server = %server.server_addr(), "http CONNECT forwarder created");
        Self {
            server: server.clone(),
            dialer,
        }
    }

    /// Build CONNECT request
    pub fn connect_request(&self, target: SocketAddr) -> String {
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

        if let (Some(user), Some(pass)) = (&self.server.username, &self.server.password) {
            let cred = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", cred));
        }

        request.push_str("\r\n");
        request
    }

    pub async fn forward_tcp(&self, target: SocketAddr, payload: &[u8]) -> Result<usize, ProxyError> {
        debug!(target = %target, server = %self.server.server_addr(), "http CONNECT proxy");

        let mut stream = self
            .dialer
            .connect_host(&self.server.address, self.server.port)
            .await?;
        let request = self.connect_request(target);

        self.dialer
            .with_timeout("http CONNECT handshake", async {
                stream.write_all(request.as_bytes()).await?;

                let mut buf = [0u8; RESPONSE_BUF_SIZE];
                let mut n = 0;
                while n < STATUS_OK_PREFIX.len() {
                    let read = stream.read(&mut buf[n..]).await?;
                    if read == 0 {
                        break;
                    }
                    n += read;
                }

                if n < STATUS_OK_PREFIX.len() || &buf[..STATUS_OK_PREFIX.len()] != STATUS_OK_PREFIX {
                    let status = String::from_utf8_lossy(&buf[..n]);
                    let status = status.lines().next().unwrap_or_default();
                    return Err(ProxyError::Protocol(format!(
                        "http proxy CONNECT failed: {}",
                        status.trim()
                    )));
                }

                stream.write_all(payload).await?;
                stream.flush().await?;
                Ok::<_, ProxyError>(())
            })
            .await?;

        debug!(target = %target, len = payload.len(), "http CONNECT forwarded");
        Ok(payload.len())
    }

    pub async fn forward_udp(&self, _target: SocketAddr, _payload: &[u8]) -> Result<usize, ProxyError> {
        Err(ProxyError::Unsupported(
            "HTTP CONNECT does not support UDP".into(),
        ))
    }
}
