pub mod http;
pub mod shadowsocks;
pub mod socks5;

use tracing::debug;

use crate::common::{ByteCounters, Dialer, ProxyError};
use crate::config::{ServerDescriptor, ServerType};
use crate::proxy::inbound::packet::{parse_header, PacketHeader};

pub use http::HttpConnectForwarder;
pub use shadowsocks::ShadowsocksForwarder;
pub use socks5::Socks5Forwarder;

/// 隧道模式的出站转发器
///
/// 会话建立时根据激活的服务器选定一次；只有这三种协议可用于隧道模式。
/// 每次调用都建立并关闭自己的远端连接，不保留数据报。
#[derive(Debug, Clone)]
pub enum Forwarder {
    Shadowsocks(ShadowsocksForwarder),
    Socks5(Socks5Forwarder),
    HttpConnect(HttpConnectForwarder),
}

impl Forwarder {
    pub fn from_descriptor(server: &ServerDescriptor, dialer: &Dialer) -> Result<Self, ProxyError> {
        let forwarder = match server.server_type {
            ServerType::Shadowsocks => {
                Forwarder::Shadowsocks(ShadowsocksForwarder::new(server, dialer.clone())?)
            }
            ServerType::Socks5 => Forwarder::Socks5(Socks5Forwarder::new(server, dialer.clone())),
            ServerType::Http | ServerType::Https => {
                Forwarder::HttpConnect(HttpConnectForwarder::new(server, dialer.clone()))
            }
            other => {
                return Err(ProxyError::Unsupported(format!(
                    "server type '{}' is not supported in tunnel mode",
                    other
                )));
            }
        };
        debug!(kind = forwarder.kind(), server = %server.display_name(), "forwarder selected");
        Ok(forwarder)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Forwarder::Shadowsocks(_) => "shadowsocks",
            Forwarder::Socks5(_) => "socks5",
            Forwarder::HttpConnect(_) => "http",
        }
    }

    /// 转发 TCP 数据报的载荷；成功时返回写出的载荷字节数并计入发送计数
    pub async fn forward_tcp(&self, datagram: &[u8], counters: &ByteCounters) -> Result<usize, ProxyError> {
        let header = validate(datagram)?;
        let target = header.destination();
        let payload = header.payload(datagram);

        let written = match self {
            Forwarder::Shadowsocks(f) => f.forward_tcp(target, payload).await?,
            Forwarder::Socks5(f) => f.forward_tcp(target, payload).await?,
            Forwarder::HttpConnect(f) => f.forward_tcp(target, payload).await?,
        };
        counters.add_sent(written as u64);
        Ok(written)
    }

    /// 转发 UDP 数据报的载荷
    pub async fn forward_udp(&self, datagram: &[u8], counters: &ByteCounters) -> Result<usize, ProxyError> {
        let header = validate(datagram)?;
        let target = header.destination();
        let payload = header.payload(datagram);

        let written = match self {
            Forwarder::Shadowsocks(f) => f.forward_udp(target, payload).await?,
            Forwarder::Socks5(f) => f.forward_udp(target, payload).await?,
            Forwarder::HttpConnect(f) => f.forward_udp(target, payload).await?,
        };
        counters.add_sent(written as u64);
        Ok(written)
    }
}

fn validate(datagram: &[u8]) -> Result<PacketHeader, ProxyError> {
    parse_header(datagram).ok_or_else(|| {
        ProxyError::Malformed(format!("datagram too short or invalid ({} bytes)", datagram.len()))
    })
}
