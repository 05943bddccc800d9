pub mod crypto;

use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::common::addr::{encode_socks5, socks5_len};
use crate::common::{Dialer, ProxyError};
use crate::config::ServerDescriptor;

use crypto::{AeadCipher, ShadowsocksCipher};

/// Maximum payload size per AEAD frame (0x3FFF = 16383)
const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

/// Shadowsocks AEAD 转发器
///
/// 每次转发都新建连接：TCP 发送 salt + 地址帧 + 载荷帧，
/// UDP 每个数据报单独加密 `salt || enc(addr || payload)`。
#[derive(Debug, Clone)]
pub struct ShadowsocksForwarder {
    server: ServerDescriptor,
    cipher: ShadowsocksCipher,
    dialer: Dialer,
}

impl ShadowsocksForwarder {
    pub fn new(server: &ServerDescriptor, dialer: Dialer) -> Result<Self, ProxyError> {
        let method = server.method.as_deref().ok_or_else(|| {
            ProxyError::Config(format!("shadowsocks server '{}' missing 'method'", server.display_name()))
        })?;
        let password = server.password.as_deref().unwrap_or_default();
        let cipher = ShadowsocksCipher::new(method, password).map_err(|e| {
            ProxyError::Config(format!("shadowsocks server '{}': {}", server.display_name(), e))
        })?;

        debug!(
            server = %server.server_addr(),
            method = cipher.kind().as_str(),
            "shadowsocks forwarder created"
        );

        Ok(Self {
            server: server.clone(),
            cipher,
            dialer,
        })
    }

    pub fn cipher(&self) -> &ShadowsocksCipher {
        &self.cipher
    }

    pub async fn forward_tcp(&self, target: SocketAddr, payload: &[u8]) -> Result<usize, ProxyError> {
        let mut stream = self
            .dialer
            .connect_host(&self.server.address, self.server.port)
            .await?;

        let request = encode_tcp_request(&self.cipher, target, payload)?;
        self.dialer
            .with_timeout("shadowsocks write", async {
                stream.write_all(&request).await?;
                stream.flush().await?;
                Ok::<_, ProxyError>(())
            })
            .await?;

        debug!(target = %target, len = payload.len(), "shadowsocks tcp forwarded");
        Ok(payload.len())
    }

    pub async fn forward_udp(&self, target: SocketAddr, payload: &[u8]) -> Result<usize, ProxyError> {
        let socket = self
            .dialer
            .connect_udp(&self.server.address, self.server.port)
            .await?;

        let packet = encode_udp_packet(&self.cipher, target, payload)?;
        socket.send(&packet).await?;

        debug!(target = %target, len = payload.len(), "shadowsocks udp forwarded");
        Ok(payload.len())
    }
}

/// salt + 地址帧 + 载荷帧（每帧最多 MAX_PAYLOAD_SIZE 字节），一次写出
pub fn encode_tcp_request(
    cipher: &ShadowsocksCipher,
    target: SocketAddr,
    payload: &[u8],
) -> Result<BytesMut, ProxyError> {
    let salt = cipher.random_salt();
    let mut encoder = cipher.session(&salt)?;
    let tag_len = cipher.kind().tag_len();

    let frames = 1 + payload.len().div_ceil(MAX_PAYLOAD_SIZE);
    let mut out = BytesMut::with_capacity(
        salt.len() + socks5_len(&target) + payload.len() + frames * (2 + 2 * tag_len),
    );
    out.put_slice(&salt);

    let mut addr_buf = BytesMut::with_capacity(socks5_len(&target));
    encode_socks5(&target, &mut addr_buf);
    write_aead_frame(&mut encoder, &addr_buf, &mut out)?;

    for chunk in payload.chunks(MAX_PAYLOAD_SIZE) {
        write_aead_frame(&mut encoder, chunk, &mut out)?;
    }
    Ok(out)
}

/// Write a single AEAD frame: [encrypted(length: 2 BE)][tag] + [encrypted(payload)][tag]
fn write_aead_frame(cipher: &mut AeadCipher, payload: &[u8], out: &mut BytesMut) -> Result<(), ProxyError> {
    let len = payload.len() as u16;
    out.put_slice(&cipher.encrypt(&len.to_be_bytes())?);
    out.put_slice(&cipher.encrypt(payload)?);
    Ok(())
}

/// UDP 包: salt || enc(addr || payload)，每个包独立 salt，nonce 从 0 开始
pub fn encode_udp_packet(
    cipher: &ShadowsocksCipher,
    target: SocketAddr,
    payload: &[u8],
) -> Result<BytesMut, ProxyError> {
    let salt = cipher.random_salt();
    let mut encoder = cipher.session(&salt)?;

    let mut plain = BytesMut::with_capacity(socks5_len(&target) + payload.len());
    encode_socks5(&target, &mut plain);
    plain.put_slice(payload);

    let sealed = encoder.encrypt(&plain)?;
    let mut out = BytesMut::with_capacity(salt.len() + sealed.len());
    out.put_slice(&salt);
    out.put_slice(&sealed);
    Ok(out)
}
