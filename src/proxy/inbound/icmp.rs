/// ICMP Echo 本地应答 — 在 TUN 模式下直接回复 ping。
///
/// 收到 Echo Request (type=8, code=0) 时复制整个数据报，交换源/目的地址，
/// 把类型改为 Echo Reply (type=0)，然后重新计算 ICMP 与 IPv4 头部校验和。
/// 其他 ICMP 消息静默忽略。
use super::packet::{parse_header, IpProtocol, ICMP_HEADER};

/// ICMP 类型常量
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;

/// 检查 IP 包是否为 ICMP Echo Request
pub fn is_echo_request(packet: &[u8]) -> bool {
    match parse_header(packet) {
        Some(hdr) if hdr.protocol == IpProtocol::Icmp => {
            let icmp = &packet[hdr.header_len..];
            icmp[0] == ICMP_ECHO_REQUEST && icmp[1] == 0
        }
        _ => false,
    }
}

/// 构建 Echo Reply；不是 Echo Request 时返回 None
pub fn build_echo_reply(request: &[u8]) -> Option<Vec<u8>> {
    if !is_echo_request(request) {
        return None;
    }
    let ihl = (request[0] & 0x0F) as usize * 4;

    let mut reply = request.to_vec();

    // 交换源 / 目的地址
    reply[12..16].copy_from_slice(&request[16..20]);
    reply[16..20].copy_from_slice(&request[12..16]);

    // type=0，code 保持不变
    reply[ihl] = ICMP_ECHO_REPLY;

    // 先清零两个校验和字段
    reply[10..12].copy_from_slice(&[0, 0]);
    reply[ihl + 2..ihl + 4].copy_from_slice(&[0, 0]);

    let icmp_cksum = checksum(&reply[ihl..]);
    reply[ihl + 2..ihl + 4].copy_from_slice(&icmp_cksum.to_be_bytes());

    let ip_cksum = checksum(&reply[..ihl]);
    reply[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    debug_assert!(reply.len() >= ihl + ICMP_HEADER);
    Some(reply)
}

/// 计算 Internet checksum (RFC 1071)
///
/// 按大端 16 位字求和，奇数长度时末字节补零作为高位，折叠进位后取反。
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
