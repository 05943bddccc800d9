use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::common::{ByteCounters, Dialer, ProxyError};
use crate::config::{EngineSettings, ServerDescriptor};
use crate::proxy::inbound::icmp::build_echo_reply;
use crate::proxy::inbound::packet::{protocol_of, IpProtocol};
use crate::proxy::inbound::TunDevice;
use crate::proxy::Forwarder;

use super::session::SessionState;

/// 单次读取的最大包长
const MAX_PACKET_SIZE: usize = 65535;

type Datagram = Vec<u8>;

/// 隧道引擎：单个读循环 + 有界队列 + 固定数量的 worker
///
/// 读循环把每个数据报放进队列（满时阻塞，不丢包），worker 取出后按协议分类：
/// ICMP 在本地应答，TCP/UDP 交给当前的 [`Forwarder`]。各数据报的完成顺序不保证。
pub struct TunnelEngine {
    server: ServerDescriptor,
    settings: EngineSettings,
    dialer: Dialer,
    counters: ByteCounters,
    state: watch::Sender<SessionState>,
}

impl TunnelEngine {
    pub fn new(server: ServerDescriptor, settings: EngineSettings, counters: ByteCounters) -> Self {
        let dialer = Dialer::new(&settings.dialer);
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            server,
            settings,
            dialer,
            counters,
            state,
        }
    }

    pub fn counters(&self) -> &ByteCounters {
        &self.counters
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// 构建当前服务器的转发器，不做任何接口 I/O
    ///
    /// 失败时返回包装了 `ProxyError::Config` / `ProxyError::Unsupported` 的错误。
    pub fn check(&self) -> Result<Forwarder> {
        let forwarder = Forwarder::from_descriptor(&self.server, &self.dialer)?;
        Ok(forwarder)
    }

    fn set_state(&self, state: SessionState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(from = ?prev, to = ?state, "session state changed");
        }
    }

    /// 运行会话直到取消或设备读取失败，返回时状态为 Stopped。
    ///
    /// 读取失败视为隐式关闭请求：触发取消信号，排空队列后正常返回。
    pub async fn run(&self, device: Arc<dyn TunDevice>, cancel: CancellationToken) -> Result<()> {
        self.set_state(SessionState::Validating);
        let forwarder = match self.check() {
            Ok(f) => Arc::new(f),
            Err(e) => {
                error!(server = %self.server.display_name(), error = %e, "tunnel setup failed");
                self.set_state(SessionState::Stopped);
                return Err(e);
            }
        };

        let workers = self.settings.workers.max(1);
        let (tx, rx) = mpsc::channel::<Datagram>(self.settings.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = Worker {
                id,
                queue: rx.clone(),
                forwarder: forwarder.clone(),
                device: device.clone(),
                counters: self.counters.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        self.set_state(SessionState::Running);
        info!(
            device = device.name(),
            server = %self.server.display_name(),
            forwarder = forwarder.kind(),
            workers,
            "tunnel session running"
        );

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = device.read_packet(&mut buf) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        error!(device = device.name(), error = %e, "tun read failed, stopping session");
                        cancel.cancel();
                        break;
                    }
                },
            };

            self.counters.add_received(n as u64);
            if n == 0 {
                continue;
            }

            // 队列满时阻塞在这里；已读到的包必须入队，取消信号留给下一轮检查
            if tx.send(buf[..n].to_vec()).await.is_err() {
                warn!("work queue closed, stopping reader");
                break;
            }
        }

        self.set_state(SessionState::Draining);
        debug!(pending = tx.max_capacity() - tx.capacity(), "draining work queue");
        drop(tx);

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }

        if let Err(e) = device.close().await {
            debug!(device = device.name(), error = %e, "failed to close tun device");
        }

        self.set_state(SessionState::Stopped);
        let totals = self.counters.snapshot();
        info!(sent = totals.sent, received = totals.received, "tunnel session stopped");
        Ok(())
    }
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Datagram>>>,
    forwarder: Arc<Forwarder>,
    device: Arc<dyn TunDevice>,
    counters: ByteCounters,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(datagram) = next else {
                break;
            };
            self.handle(&datagram).await;
        }
        trace!(worker = self.id, "worker exited");
    }

    async fn handle(&self, datagram: &[u8]) {
        let Some(protocol) = protocol_of(datagram) else {
            trace!(len = datagram.len(), "dropping short datagram");
            return;
        };

        let result = match protocol {
            IpProtocol::Icmp => {
                self.reply_icmp(datagram).await;
                return;
            }
            IpProtocol::Tcp => self.forwarder.forward_tcp(datagram, &self.counters).await,
            IpProtocol::Udp => self.forwarder.forward_udp(datagram, &self.counters).await,
            IpProtocol::Other(number) => {
                trace!(protocol = number, "ignoring datagram");
                return;
            }
        };

        match result {
            Ok(n) => trace!(worker = self.id, ?protocol, bytes = n, "datagram forwarded"),
            Err(ProxyError::Malformed(reason)) => trace!(%reason, "dropping malformed datagram"),
            Err(e) if e.is_unsupported() => {
                debug!(worker = self.id, ?protocol, error = %e, "datagram dropped")
            }
            Err(e) => warn!(
                worker = self.id,
                ?protocol,
                kind = e.kind().as_str(),
                error = %e,
                "forwarding failed"
            ),
        }
    }

    async fn reply_icmp(&self, datagram: &[u8]) {
        let Some(reply) = build_echo_reply(datagram) else {
            return;
        };
        match self.device.write_packet(&reply).await {
            Ok(n) => {
                self.counters.add_sent(n as u64);
                trace!(worker = self.id, bytes = n, "icmp echo reply written");
            }
            Err(e) => warn!(error = %e, "failed to write icmp echo reply"),
        }
    }
}
