pub mod dispatcher;
pub mod session;

use std::sync::Arc;

use anyhow::Result;

use crate::common::ByteCounters;
use crate::config::AppConfig;
use crate::proxy::inbound::create_platform_tun_device;

pub use dispatcher::TunnelEngine;
pub use session::{SessionState, TunnelSession};

/// 根据配置构建引擎：校验激活的服务器，再打开平台 TUN 设备并启动会话。
///
/// 服务器类型不支持或参数错误时在打开设备之前失败。
pub fn start_tunnel(config: &AppConfig, counters: ByteCounters) -> Result<TunnelSession> {
    let server = config.active_server()?.clone();
    let engine = TunnelEngine::new(server, config.engine.clone(), counters);
    engine.check()?;

    let device = create_platform_tun_device(&config.tun)?;
    Ok(TunnelSession::start(engine, Arc::from(device)))
}
