//! IPv4 / 传输层头部解析
//!
//! 纯函数，只读取缓冲区，不做任何分配。长度不足或头部不合法的包
//! 返回 `None`，由调用方静默丢弃。

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// 最小 IPv4 头部长度
pub const IPV4_MIN_HEADER: usize = 20;
pub const TCP_MIN_HEADER: usize = 20;
pub const UDP_HEADER: usize = 8;
pub const ICMP_HEADER: usize = 8;

/// IP 协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            other => Self::Other(other),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Other(n) => n,
        }
    }

    /// 传输层最小头部长度；未知协议不检查
    pub fn min_header_len(self) -> usize {
        match self {
            Self::Tcp => TCP_MIN_HEADER,
            Self::Udp => UDP_HEADER,
            Self::Icmp => ICMP_HEADER,
            Self::Other(_) => 0,
        }
    }
}

/// 解析后的头部信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol: IpProtocol,
    /// IP 头部长度 (IHL * 4)
    pub header_len: usize,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    /// TCP/UDP 端口；ICMP 与未知协议为 0
    pub src_port: u16,
    pub dst_port: u16,
    /// 传输层载荷起始偏移
    pub payload_offset: usize,
}

impl PacketHeader {
    pub fn destination(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.dst_ip, self.dst_port))
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.src_ip, self.src_port))
    }

    /// 传输层载荷（传输层头部之后的字节）
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[self.payload_offset.min(packet.len())..]
    }
}

/// 读取协议号，不做其他校验（长度不足 20 字节时返回 None）
pub fn protocol_of(packet: &[u8]) -> Option<IpProtocol> {
    if packet.len() < IPV4_MIN_HEADER {
        return None;
    }
    Some(IpProtocol::from_number(packet[9]))
}

/// 解析 IPv4 头部和传输层端口。
///
/// 版本字段不做检查：非 IPv4 的包按字节原样解读，结果无意义但不会越界。
pub fn parse_header(packet: &[u8]) -> Option<PacketHeader> {
    let protocol = protocol_of(packet)?;

    let header_len = (packet[0] & 0x0F) as usize * 4;
    if header_len < IPV4_MIN_HEADER {
        return None;
    }
    if packet.len() < header_len + protocol.min_header_len() {
        return None;
    }

    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);

    let (src_port, dst_port, payload_offset) = match protocol {
        IpProtocol::Tcp => {
            let t = &packet[header_len..];
            let data_offset = (t[12] >> 4) as usize * 4;
            if data_offset < TCP_MIN_HEADER || packet.len() < header_len + data_offset {
                return None;
            }
            (
                u16::from_be_bytes([t[0], t[1]]),
                u16::from_be_bytes([t[2], t[3]]),
                header_len + data_offset,
            )
        }
        IpProtocol::Udp => {
            let t = &packet[header_len..];
            (
                u16::from_be_bytes([t[0], t[1]]),
                u16::from_be_bytes([t[2], t[3]]),
                header_len + UDP_HEADER,
            )
        }
        IpProtocol::Icmp => (0, 0, header_len + ICMP_HEADER),
        IpProtocol::Other(_) => (0, 0, header_len),
    };

    Some(PacketHeader {
        protocol,
        header_len,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        payload_offset,
    })
}
