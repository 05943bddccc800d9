use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

/// SOCKS5 / Shadowsocks 地址类型
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_IPV6: u8 = 0x04;

/// 编码为 SOCKS5 地址格式 [ATYP][ADDR][PORT]
///
/// Shadowsocks 的目标地址头与此格式相同。
pub fn encode_socks5(addr: &SocketAddr, buf: &mut BytesMut) {
    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
    }
}

/// 编码后的地址头长度
pub fn socks5_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + 2,
    }
}

/// 从 UDP ASSOCIATE 回复的尾部解析 IPv4 中继地址
///
/// 回复格式: [VER][REP][RSV][ATYP][BND.ADDR: 4B][BND.PORT: 2B]
/// 地址取最后 2 字节之前的 4 字节，端口取最后 2 字节（大端）。
pub fn parse_bound_ipv4(reply: &[u8]) -> Option<SocketAddr> {
    if reply.len() < 10 {
        return None;
    }
    let n = reply.len();
    let ip = Ipv4Addr::new(reply[n - 6], reply[n - 5], reply[n - 4], reply[n - 3]);
    let port = u16::from_be_bytes([reply[n - 2], reply[n - 1]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}
