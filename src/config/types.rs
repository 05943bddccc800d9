use std::fmt;
use std::net::Ipv4Addr;

use anyhow::Result;
use serde::Deserialize;

use crate::common::DialerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default, rename = "active-index")]
    pub active_index: usize,
    #[serde(default)]
    pub tun: TunSettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("no servers configured");
        }
        if self.active_index >= self.servers.len() {
            anyhow::bail!(
                "invalid active server index {} ({} servers configured)",
                self.active_index,
                self.servers.len()
            );
        }
        if self.engine.workers == 0 {
            anyhow::bail!("engine.workers must be at least 1");
        }
        if self.engine.queue_capacity == 0 {
            anyhow::bail!("engine.queue-capacity must be at least 1");
        }
        Ok(())
    }

    /// 当前激活的服务器
    pub fn active_server(&self) -> Result<&ServerDescriptor> {
        self.servers
            .get(self.active_index)
            .ok_or_else(|| anyhow::anyhow!("invalid active server index {}", self.active_index))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 服务器协议类型
///
/// vless / vmess / trojan 可以出现在配置中，但隧道模式不支持，
/// 会在会话构建时直接失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Shadowsocks,
    Socks5,
    Http,
    Https,
    Vless,
    Vmess,
    Trojan,
}

impl ServerType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerType::Shadowsocks => "shadowsocks",
            ServerType::Socks5 => "socks5",
            ServerType::Http => "http",
            ServerType::Https => "https",
            ServerType::Vless => "vless",
            ServerType::Vmess => "vmess",
            ServerType::Trojan => "trojan",
        }
    }

    pub fn supports_tunnel(self) -> bool {
        matches!(
            self,
            ServerType::Shadowsocks | ServerType::Socks5 | ServerType::Http | ServerType::Https
        )
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 远端服务器描述（只读）
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub address: String,
    pub port: u16,
    /// Shadowsocks cipher method
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// SOCKS5 / HTTP proxy username
    #[serde(default)]
    pub username: Option<String>,
}

impl ServerDescriptor {
    pub fn new(server_type: ServerType, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: String::new(),
            server_type,
            address: address.into(),
            port,
            method: None,
            password: None,
            username: None,
        }
    }

    pub fn shadowsocks(
        address: impl Into<String>,
        port: u16,
        method: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let mut desc = Self::new(ServerType::Shadowsocks, address, port);
        desc.method = Some(method.into());
        desc.password = Some(password.into());
        desc
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// "host:port"
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// 日志里使用的名字，未命名时退回 host:port
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.server_addr()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunSettings {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            name: "nekogo-tun".to_string(),
            address: Ipv4Addr::new(10, 0, 85, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: 1500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// worker 数量
    pub workers: usize,
    /// 工作队列容量，满时读循环阻塞
    #[serde(rename = "queue-capacity")]
    pub queue_capacity: usize,
    #[serde(flatten)]
    pub dialer: DialerConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 100,
            dialer: DialerConfig::default(),
        }
    }
}
