use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 进程内字节计数器（发送 / 接收）
///
/// 克隆得到的是同一组计数器的句柄，由读循环和所有 worker 共享。
/// 计数只增不减，引擎自身从不重置。
#[derive(Debug, Clone, Default)]
pub struct ByteCounters {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

/// 某一时刻的计数快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSnapshot {
    pub sent: u64,
    pub received: u64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent(&self, bytes: u64) {
        self.inner.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.inner.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            sent: self.sent(),
            received: self.received(),
        }
    }
}
