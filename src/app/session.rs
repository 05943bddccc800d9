use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::ByteCounters;
use crate::proxy::inbound::TunDevice;

use super::dispatcher::TunnelEngine;

/// 会话状态：Idle → Validating → Running → Draining → Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Validating,
    Running,
    Draining,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Validating => "validating",
            SessionState::Running => "running",
            SessionState::Draining => "draining",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次隧道会话的句柄
///
/// `start` 在后台任务中运行引擎并立即返回；`stop` 触发取消信号并等待排空，
/// `wait` 只等待会话自行结束（例如设备读取失败）。
pub struct TunnelSession {
    engine: Arc<TunnelEngine>,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Result<()>>,
}

impl TunnelSession {
    pub fn start(engine: TunnelEngine, device: Arc<dyn TunDevice>) -> Self {
        let engine = Arc::new(engine);
        let cancel = CancellationToken::new();
        let state = engine.subscribe();

        let task = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(device, cancel).await })
        };

        Self {
            engine,
            cancel,
            state,
            task,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 状态变化通知
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn counters(&self) -> ByteCounters {
        self.engine.counters().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 触发取消并等待会话进入 Stopped
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.wait().await
    }

    /// 等待会话结束，返回引擎的结果
    pub async fn wait(self) -> Result<()> {
        self.task.await.context("tunnel session task failed")?
    }
}
