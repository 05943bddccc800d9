use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::common::addr::{encode_socks5, parse_bound_ipv4};
use crate::common::{Dialer, ProxyError};
use crate::config::ServerDescriptor;

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

/// UDP ASSOCIATE 请求：VER=5, CMD=3, RSV=0, ATYP=IPv4, 0.0.0.0:0（由服务器选择中继地址）
pub const UDP_ASSOCIATE_REQUEST: [u8; 10] = [0x05, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// SOCKS5 转发器
///
/// 实现 RFC 1928 SOCKS5 协议的客户端侧：
/// - 方法协商（无认证 / 用户名密码）
/// - CONNECT 命令 (TCP)
/// - UDP ASSOCIATE 命令 (UDP，仅 IPv4 目标)
#[derive(Debug, Clone)]
pub struct Socks5Forwarder {
    server: ServerDescriptor,
    dialer: Dialer,
}

impl Socks5Forwarder {
    pub fn new(server: &ServerDescriptor, dialer: Dialer) -> Self {
        debug!(
            server = %server.server_addr(),
            auth = server.username.is_some() && server.password.is_some(),
            "socks5 forwarder created"
        );
        Self {
            server: server.clone(),
            dialer,
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.server.username, &self.server.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// 执行 SOCKS5 握手（方法协商 + 可选认证）
    async fn handshake(&self, stream: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> Result<(), ProxyError> {
        let credentials = self.credentials();

        // === 方法协商 ===
        if credentials.is_some() {
            // 支持 NO_AUTH(0x00) 和 USERNAME_PASSWORD(0x02)
            stream.write_all(&[SOCKS_VERSION, 0x02, 0x00, 0x02]).await?;
        } else {
            stream.write_all(&[SOCKS_VERSION, 0x01, 0x00]).await?;
        }

        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;

        if resp[0] != SOCKS_VERSION {
            return Err(ProxyError::Protocol(format!(
                "socks5: server returned unsupported version: 0x{:02x}",
                resp[0]
            )));
        }

        match (resp[1], credentials) {
            (0x00, _) => {
                debug!("socks5: no authentication required");
            }
            (0x02, Some((username, password))) => {
                // USERNAME/PASSWORD auth (RFC 1929)
                let mut auth_req = Vec::with_capacity(3 + username.len() + password.len());
                auth_req.push(0x01);
                auth_req.push(username.len() as u8);
                auth_req.extend_from_slice(username.as_bytes());
                auth_req.push(password.len() as u8);
                auth_req.extend_from_slice(password.as_bytes());
                stream.write_all(&auth_req).await?;

                let mut auth_resp = [0u8; 2];
                stream.read_exact(&mut auth_resp).await?;
                if auth_resp[1] != 0x00 {
                    return Err(ProxyError::Protocol(format!(
                        "socks5: authentication failed (status: 0x{:02x})",
                        auth_resp[1]
                    )));
                }
                debug!("socks5: authentication successful");
            }
            (0xFF, _) => {
                return Err(ProxyError::Protocol(
                    "socks5: server rejected all authentication methods".into(),
                ));
            }
            (method, _) => {
                return Err(ProxyError::Protocol(format!(
                    "socks5: unsupported auth method selected: 0x{:02x}",
                    method
                )));
            }
        }
        Ok(())
    }

    /// 发送 CONNECT 并读取完整回复
    async fn send_connect(
        &self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        target: SocketAddr,
    ) -> Result<(), ProxyError> {
        let mut req = BytesMut::with_capacity(32);
        req.put_u8(SOCKS_VERSION);
        req.put_u8(CMD_CONNECT);
        req.put_u8(0x00);
        encode_socks5(&target, &mut req);
        stream.write_all(&req).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(ProxyError::Protocol(format!(
                "socks5: invalid reply version: 0x{:02x}",
                head[0]
            )));
        }
        if head[1] != 0x00 {
            return Err(ProxyError::Protocol(format!(
                "socks5: request failed: {} (0x{:02x})",
                reply_reason(head[1]),
                head[1]
            )));
        }

        // 跳过 BND.ADDR + BND.PORT
        let skip = match head[3] {
            0x01 => 4 + 2,
            0x04 => 16 + 2,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize + 2
            }
            atyp => {
                return Err(ProxyError::Protocol(format!(
                    "socks5: unsupported bind address type: 0x{:02x}",
                    atyp
                )));
            }
        };
        let mut bound = vec![0u8; skip];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }

    /// UDP ASSOCIATE：发送固定请求，返回服务器绑定的中继地址
    ///
    /// 回复至少 10 字节，VER=5 且 REP=0；地址取最后 2 字节之前的 4 字节。
    /// 服务器返回 0.0.0.0 时使用代理服务器自身的地址。
    /// 调用前必须已完成 RFC 1928 方法协商，固定请求紧跟在协商之后发送。
    pub async fn request_udp_relay(
        &self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        server_ip: IpAddr,
    ) -> Result<SocketAddr, ProxyError> {
        stream.write_all(&UDP_ASSOCIATE_REQUEST).await?;

        let mut buf = [0u8; 256];
        let mut n = 0;
        while n < 10 {
            let read = stream.read(&mut buf[n..]).await?;
            if read == 0 {
                break;
            }
            n += read;
        }

        let reply = &buf[..n];
        if reply.len() < 10 || reply[0] != SOCKS_VERSION || reply[1] != 0x00 {
            return Err(ProxyError::Protocol(format!(
                "socks5: udp associate rejected or malformed reply ({} bytes)",
                reply.len()
            )));
        }

        let relay = parse_bound_ipv4(reply).ok_or_else(|| {
            ProxyError::Protocol("socks5: malformed udp associate reply".into())
        })?;
        if relay.ip().is_unspecified() {
            return Ok(SocketAddr::new(server_ip, relay.port()));
        }
        Ok(relay)
    }

    pub async fn forward_tcp(&self, target: SocketAddr, payload: &[u8]) -> Result<usize, ProxyError> {
        debug!(target = %target, server = %self.server.server_addr(), "socks5 CONNECT");

        let mut stream = self
            .dialer
            .connect_host(&self.server.address, self.server.port)
            .await?;

        self.dialer
            .with_timeout("socks5 handshake", async {
                self.handshake(&mut stream).await?;
                self.send_connect(&mut stream, target).await?;
                stream.write_all(payload).await?;
                stream.flush().await?;
                Ok::<_, ProxyError>(())
            })
            .await?;

        debug!(target = %target, len = payload.len(), "socks5 tcp forwarded");
        Ok(payload.len())
    }

    pub async fn forward_udp(&self, target: SocketAddr, payload: &[u8]) -> Result<usize, ProxyError> {
        // 只支持 IPv4 目标
        let datagram = encode_udp_request(target, payload)?;
        debug!(target = %target, server = %self.server.server_addr(), "socks5 UDP ASSOCIATE");

        // 控制连接保持到函数返回
        let mut control = self
            .dialer
            .connect_host(&self.server.address, self.server.port)
            .await?;
        let server_ip = control.peer_addr()?.ip();

        let relay = self
            .dialer
            .with_timeout("socks5 udp associate", async {
                self.handshake(&mut control).await?;
                self.request_udp_relay(&mut control, server_ip).await
            })
            .await?;
        debug!(relay = %relay, "socks5 udp relay bound");

        let socket = self.dialer.connect_udp_addr(relay).await?;
        socket.send(&datagram).await?;

        debug!(target = %target, len = payload.len(), "socks5 udp forwarded");
        drop(control);
        Ok(payload.len())
    }
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// SOCKS5 UDP 请求: [RSV 2B][FRAG 1B][ATYP=1][DST.ADDR 4B][DST.PORT 2B][DATA]
pub fn encode_udp_request(target: SocketAddr, payload: &[u8]) -> Result<BytesMut, ProxyError> {
    let SocketAddr::V4(target) = target else {
        return Err(ProxyError::Unsupported(format!(
            "socks5 udp: ipv6 destination {} is not supported",
            target
        )));
    };
    let mut buf = BytesMut::with_capacity(10 + payload.len());
    buf.put_slice(&[0x00, 0x00, 0x00, 0x01]);
    buf.put_slice(&target.ip().octets());
    buf.put_u16(target.port());
    buf.put_slice(payload);
    Ok(buf)
}
