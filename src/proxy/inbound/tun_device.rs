use std::net::Ipv4Addr;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TunSettings;

/// TUN 设备平台抽象 trait
///
/// 引擎只依赖这四个操作；设备地址与默认路由由外部预先配置。
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// 设备名称（如 tun0, nekogo-tun）
    fn name(&self) -> &str;

    /// 读取一个 IP 包
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// 写入一个 IP 包
    async fn write_packet(&self, buf: &[u8]) -> Result<usize>;

    /// 关闭设备
    async fn close(&self) -> Result<()>;
}

/// 打开当前平台的 TUN 设备
pub fn create_platform_tun_device(settings: &TunSettings) -> Result<Box<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        return Ok(Box::new(linux::LinuxTunDevice::open(settings)?));
    }

    #[allow(unreachable_code)]
    {
        let _ = settings;
        anyhow::bail!("tun device is unsupported on this platform");
    }
}

fn netmask_prefix(netmask: Ipv4Addr) -> u8 {
    netmask
        .octets()
        .iter()
        .map(|octet| octet.count_ones() as u8)
        .sum()
}

#[cfg(target_os = "linux")]
pub mod linux {
    use std::ffi::c_void;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::process::Command;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;
    use tracing::{debug, info};

    use super::{netmask_prefix, TunDevice};
    use crate::config::TunSettings;

    const TUN_DEVICE_PATH: &[u8] = b"/dev/net/tun\0";
    const IFF_TUN: i16 = 0x0001;
    const IFF_NO_PI: i16 = 0x1000;
    const TUNSETIFF: libc::c_ulong = 0x400454CA;

    #[repr(C)]
    struct IfReq {
        ifr_name: [u8; libc::IFNAMSIZ],
        ifr_flags: i16,
        ifr_ifru: [u8; 24 - std::mem::size_of::<i16>()],
    }

    /// Linux TUN 设备
    ///
    /// 通过 ioctl(TUNSETIFF) 创建 tun 设备（IFF_TUN | IFF_NO_PI），
    /// 用 `ip` 命令配置地址并拉起链路。默认路由不在这里处理。
    pub struct LinuxTunDevice {
        name: String,
        fd: AsyncFd<OwnedFd>,
        closed: AtomicBool,
    }

    impl LinuxTunDevice {
        pub fn open(settings: &TunSettings) -> Result<Self> {
            let fd = open_tun_device(&settings.name)?;
            configure_interface(settings)?;
            let fd = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)
                .context("failed to register tun fd with the reactor")?;
            info!(device = %settings.name, address = %settings.address, mtu = settings.mtu, "tun device opened");
            Ok(Self {
                name: settings.name.clone(),
                fd,
                closed: AtomicBool::new(false),
            })
        }

        fn ensure_open(&self) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                anyhow::bail!("tun device {} is closed", self.name);
            }
            Ok(())
        }
    }

    fn open_tun_device(name: &str) -> Result<OwnedFd> {
        if name.as_bytes().len() >= libc::IFNAMSIZ {
            anyhow::bail!("tun interface name too long: {}", name);
        }

        let fd = unsafe {
            libc::open(
                TUN_DEVICE_PATH.as_ptr().cast(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            anyhow::bail!("open(/dev/net/tun) failed: {}", err);
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut ifr = IfReq {
            ifr_name: [0u8; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            ifr_ifru: [0u8; 24 - std::mem::size_of::<i16>()],
        };
        ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            anyhow::bail!("ioctl(TUNSETIFF) failed: {}", err);
        }
        Ok(fd)
    }

    fn configure_interface(settings: &TunSettings) -> Result<()> {
        let address = format!("{}/{}", settings.address, netmask_prefix(settings.netmask));
        let mtu_text = settings.mtu.to_string();

        run_ip_command(&["addr", "replace", &address, "dev", &settings.name])?;
        run_ip_command(&["link", "set", "dev", &settings.name, "up"])?;
        run_ip_command(&["link", "set", "dev", &settings.name, "mtu", &mtu_text])?;
        Ok(())
    }

    fn run_ip_command(args: &[&str]) -> Result<()> {
        let status = Command::new("ip")
            .args(args)
            .status()
            .with_context(|| format!("failed to execute ip command: ip {}", args.join(" ")))?;

        if !status.success() {
            anyhow::bail!(
                "ip command failed (status={}): ip {}",
                status,
                args.join(" ")
            );
        }
        Ok(())
    }

    #[async_trait]
    impl TunDevice for LinuxTunDevice {
        fn name(&self) -> &str {
            &self.name
        }

        async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
            if buf.is_empty() {
                anyhow::bail!("tun read buffer is empty");
            }
            loop {
                self.ensure_open()?;
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast::<c_void>(), buf.len())
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(result) => return result.context("read(tun) failed"),
                    Err(_would_block) => continue,
                }
            }
        }

        async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            loop {
                self.ensure_open()?;
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(inner.as_raw_fd(), buf.as_ptr().cast::<c_void>(), buf.len())
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(result) => return result.context("write(tun) failed"),
                    Err(_would_block) => continue,
                }
            }
        }

        async fn close(&self) -> Result<()> {
            if !self.closed.swap(true, Ordering::AcqRel) {
                debug!(device = %self.name, "tun device closed");
            }
            Ok(())
        }
    }
}
