pub mod icmp;
pub mod packet;
pub mod tun_device;

pub use packet::{parse_header, IpProtocol, PacketHeader};
pub use tun_device::{create_platform_tun_device, TunDevice};
