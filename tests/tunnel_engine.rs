//! 隧道引擎集成测试
//!
//! 覆盖：并发转发与背压、取消后排空、ICMP 本地应答、短包丢弃、
//! 不支持的服务器类型、设备读取失败时的隐式关闭。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Semaphore};

use nekotun::app::{SessionState, TunnelEngine, TunnelSession};
use nekotun::common::{ByteCounters, ProxyError};
use nekotun::config::{EngineSettings, ServerDescriptor, ServerType};
use nekotun::proxy::inbound::icmp::checksum;
use nekotun::proxy::inbound::TunDevice;

// ============================================================
// 辅助函数
// ============================================================

/// 内存中的 TUN 设备：读取来自 channel，写入被记录下来。
/// 发送端全部关闭后读取返回错误。
struct MockTun {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    written: std::sync::Mutex<Vec<Vec<u8>>>,
    reads: AtomicUsize,
    closed: AtomicBool,
}

impl MockTun {
    fn new(capacity: usize) -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let tun = Arc::new(Self {
            inbound: Mutex::new(rx),
            written: std::sync::Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        (tun, tx)
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunDevice for MockTun {
    fn name(&self) -> &str {
        "mock-tun"
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let packet = self.inbound.lock().await.recv().await;
        match packet {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => anyhow::bail!("mock device detached"),
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        self.written.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// 本地 HTTP CONNECT 代理：统计连接数并收集隧道内的载荷。
/// `gate` 没有许可时，代理在回复 200 之前阻塞。
struct MockProxy {
    port: u16,
    accepted: Arc<AtomicUsize>,
    payloads: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    gate: Arc<Semaphore>,
}

async fn start_http_proxy(open: bool) -> MockProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let payloads = Arc::new(std::sync::Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }));

    {
        let accepted = accepted.clone();
        let payloads = payloads.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let payloads = payloads.clone();
                let gate = gate.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 || line == "\r\n" {
                            break;
                        }
                    }
                    let _permit = gate.acquire().await.unwrap();
                    let mut stream = reader.into_inner();
                    let _ = stream.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
                    let mut payload = Vec::new();
                    let _ = stream.read_to_end(&mut payload).await;
                    payloads.lock().unwrap().push(payload);
                });
            }
        });
    }

    MockProxy {
        port,
        accepted,
        payloads,
        gate,
    }
}

fn http_server(port: u16) -> ServerDescriptor {
    ServerDescriptor::new(ServerType::Http, "127.0.0.1", port).with_name("mock-http")
}

fn ipv4_packet(protocol: u8, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let l4_len = if protocol == 6 { 20 } else { 8 };
    let mut pkt = vec![0u8; 20 + l4_len];
    pkt[0] = 0x45;
    pkt[8] = 64;
    pkt[9] = protocol;
    pkt[12..16].copy_from_slice(&[10, 0, 85, 2]);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..22].copy_from_slice(&40000u16.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    if protocol == 6 {
        pkt[32] = 0x50;
    }
    pkt.extend_from_slice(payload);
    let total = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    pkt
}

fn echo_request(dst: [u8; 4], id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 28];
    pkt[0] = 0x45;
    pkt[8] = 64;
    pkt[9] = 1;
    pkt[12..16].copy_from_slice(&[10, 0, 85, 2]);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20] = 8;
    pkt[24..26].copy_from_slice(&id.to_be_bytes());
    pkt[26..28].copy_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(payload);
    let total = pkt.len() as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    let icmp = checksum(&pkt[20..]);
    pkt[22..24].copy_from_slice(&icmp.to_be_bytes());
    let ip = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip.to_be_bytes());
    pkt
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================
// 并发转发
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_tcp_datagrams_with_ten_workers() {
    let proxy = start_http_proxy(true).await;
    let (tun, tx) = MockTun::new(1000);

    let mut expected_sent = 0u64;
    let mut expected_received = 0u64;
    for i in 0..1000u32 {
        let dst = [10, 1, (i / 250) as u8, (i % 250) as u8 + 1];
        let payload = vec![b'x'; (i % 50) as usize + 1];
        let pkt = ipv4_packet(6, dst, 1000 + i as u16, &payload);
        expected_sent += payload.len() as u64;
        expected_received += pkt.len() as u64;
        tx.send(pkt).await.unwrap();
    }
    // 读完 1000 个包后设备读取失败，触发隐式关闭
    drop(tx);

    let counters = ByteCounters::new();
    let settings = EngineSettings {
        workers: 10,
        queue_capacity: 100,
        ..Default::default()
    };
    let engine = TunnelEngine::new(http_server(proxy.port), settings, counters.clone());
    let device: Arc<dyn TunDevice> = tun.clone();

    tokio::time::timeout(
        Duration::from_secs(60),
        engine.run(device, tokio_util::sync::CancellationToken::new()),
    )
    .await
    .expect("engine deadlocked")
    .unwrap();

    assert_eq!(engine.state(), SessionState::Stopped);
    assert_eq!(counters.sent(), expected_sent);
    assert_eq!(counters.received(), expected_received);
    assert_eq!(tun.reads(), 1001);
    assert!(tun.closed.load(Ordering::SeqCst));

    wait_until(|| proxy.payloads.lock().unwrap().len() == 1000).await;
    let total: usize = proxy.payloads.lock().unwrap().iter().map(Vec::len).sum();
    assert_eq!(total as u64, expected_sent);
}

// ============================================================
// 取消与排空
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_drains_pending_items_without_new_reads() {
    let proxy = start_http_proxy(false).await;
    let (tun, tx) = MockTun::new(16);

    for i in 0..5u8 {
        tx.send(ipv4_packet(6, [192, 0, 2, i + 1], 443, b"pending")).await.unwrap();
    }

    let counters = ByteCounters::new();
    let settings = EngineSettings {
        workers: 1,
        queue_capacity: 100,
        ..Default::default()
    };
    let engine = TunnelEngine::new(http_server(proxy.port), settings, counters.clone());
    let session = TunnelSession::start(engine, tun.clone());
    let mut state = session.subscribe();

    // 5 个包已读出，读循环正在等待第 6 个
    wait_until(|| tun.reads() == 6).await;
    wait_until(|| proxy.accepted.load(Ordering::SeqCst) == 1).await;

    session.cancel_token().cancel();
    state
        .wait_for(|s| *s == SessionState::Draining)
        .await
        .unwrap();
    let reads_at_cancel = tun.reads();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Draining);
    assert_eq!(counters.sent(), 0);

    proxy.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    session.wait().await.unwrap();

    assert_eq!(tun.reads(), reads_at_cancel);
    assert_eq!(counters.sent(), 5 * 7);
    assert_eq!(proxy.accepted.load(Ordering::SeqCst), 5);
    drop(tx);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_with_full_queue_forwards_every_read_datagram() {
    let proxy = start_http_proxy(false).await;
    let (tun, tx) = MockTun::new(16);

    let mut packets = Vec::new();
    for i in 0..10u8 {
        let pkt = ipv4_packet(6, [198, 51, 100, i + 1], 80, b"hello");
        packets.push(pkt.clone());
        tx.send(pkt).await.unwrap();
    }

    let counters = ByteCounters::new();
    let settings = EngineSettings {
        workers: 1,
        queue_capacity: 2,
        ..Default::default()
    };
    let engine = TunnelEngine::new(http_server(proxy.port), settings, counters.clone());
    let session = TunnelSession::start(engine, tun.clone());

    // worker 持有 1 个，队列满 2 个，读循环带着第 4 个阻塞在入队上
    wait_until(|| proxy.accepted.load(Ordering::SeqCst) == 1).await;
    wait_until(|| tun.reads() == 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tun.reads(), 4);

    session.cancel_token().cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    proxy.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    session.wait().await.unwrap();

    let read = tun.reads();
    assert_eq!(read, 4);
    let received: usize = packets[..read].iter().map(Vec::len).sum();
    assert_eq!(counters.received(), received as u64);
    assert_eq!(counters.sent(), (read * 5) as u64);
    assert_eq!(proxy.accepted.load(Ordering::SeqCst), read);
    drop(tx);
}

#[tokio::test]
async fn stop_idle_session() {
    let proxy = start_http_proxy(true).await;
    let (tun, _tx) = MockTun::new(1);

    let engine = TunnelEngine::new(http_server(proxy.port), EngineSettings::default(), ByteCounters::new());
    let session = TunnelSession::start(engine, tun.clone());
    let mut state = session.subscribe();
    state.wait_for(|s| *s == SessionState::Running).await.unwrap();

    session.stop().await.unwrap();
    assert_eq!(*state.borrow(), SessionState::Stopped);
    assert!(tun.closed.load(Ordering::SeqCst));
}

// ============================================================
// ICMP / 短包 / 不支持
// ============================================================

#[tokio::test]
async fn icmp_echo_is_answered_locally() {
    let proxy = start_http_proxy(true).await;
    let (tun, tx) = MockTun::new(4);
    let request = echo_request([8, 8, 8, 8], 0x4242, 3, b"ping payload");
    tx.send(request.clone()).await.unwrap();
    drop(tx);

    let counters = ByteCounters::new();
    let engine = TunnelEngine::new(http_server(proxy.port), EngineSettings::default(), counters.clone());
    engine
        .run(tun.clone(), tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();

    let written = tun.written();
    assert_eq!(written.len(), 1);
    let reply = &written[0];
    assert_eq!(&reply[12..16], &[8, 8, 8, 8]);
    assert_eq!(&reply[16..20], &[10, 0, 85, 2]);
    assert_eq!(reply[20], 0);
    assert_eq!(&reply[24..], &request[24..]);
    assert_eq!(checksum(&reply[..20]), 0);
    assert_eq!(checksum(&reply[20..]), 0);

    assert_eq!(counters.sent(), reply.len() as u64);
    assert_eq!(proxy.accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn short_and_unsupported_datagrams_are_dropped() {
    let proxy = start_http_proxy(true).await;
    let (tun, tx) = MockTun::new(16);

    let mut received = 0u64;
    let mut truncated_tcp = ipv4_packet(6, [1, 1, 1, 1], 80, b"");
    truncated_tcp.truncate(30);
    for pkt in [
        vec![0x45; 19],
        vec![],
        truncated_tcp,
        // HTTP CONNECT 不支持 UDP
        ipv4_packet(17, [8, 8, 8, 8], 53, b"dns"),
        // 其他协议 (GRE)
        {
            let mut p = ipv4_packet(17, [1, 1, 1, 1], 1, b"");
            p[9] = 47;
            p
        },
    ] {
        received += pkt.len() as u64;
        tx.send(pkt).await.unwrap();
    }
    let ok = ipv4_packet(6, [1, 1, 1, 1], 80, b"after");
    received += ok.len() as u64;
    tx.send(ok).await.unwrap();
    drop(tx);

    let counters = ByteCounters::new();
    let engine = TunnelEngine::new(http_server(proxy.port), EngineSettings::default(), counters.clone());
    engine
        .run(tun.clone(), tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(counters.received(), received);
    assert_eq!(counters.sent(), 5);
    assert!(tun.written().is_empty());
    wait_until(|| proxy.payloads.lock().unwrap().len() == 1).await;
    assert_eq!(proxy.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsupported_server_fails_before_any_read() {
    let (tun, _tx) = MockTun::new(1);
    let server = ServerDescriptor::new(ServerType::Vmess, "127.0.0.1", 443);
    let engine = TunnelEngine::new(server, EngineSettings::default(), ByteCounters::new());

    let err = engine
        .run(tun.clone(), tokio_util::sync::CancellationToken::new())
        .await
        .unwrap_err();
    let proxy_err = err.downcast_ref::<ProxyError>().expect("ProxyError");
    assert!(proxy_err.is_unsupported());
    assert_eq!(engine.state(), SessionState::Stopped);
    assert_eq!(tun.reads(), 0);
}

#[tokio::test]
async fn read_failure_cancels_session() {
    let (tun, tx) = MockTun::new(1);
    drop(tx);

    let server = ServerDescriptor::new(ServerType::Socks5, "127.0.0.1", 1);
    let engine = TunnelEngine::new(server, EngineSettings::default(), ByteCounters::new());
    let session = TunnelSession::start(engine, tun.clone());
    let cancel = session.cancel_token();

    session.wait().await.unwrap();
    assert!(cancel.is_cancelled());
    assert_eq!(tun.reads(), 1);
}
