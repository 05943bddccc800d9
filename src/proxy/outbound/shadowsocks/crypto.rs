use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit};
use anyhow::{bail, Result};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as Md5Digest, Md5};
use rand::Rng;
use sha1::Sha1;

/// Shadowsocks AEAD cipher kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Parse cipher method name string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" | "aead_aes_128_gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" | "aead_aes_256_gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" | "aead_chacha20_poly1305" => {
                Ok(CipherKind::ChaCha20Poly1305)
            }
            other => bail!("unsupported shadowsocks cipher: {}", other),
        }
    }

    /// Key length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Salt length in bytes (same as key length)
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    /// AEAD tag length in bytes (always 16 for all supported ciphers)
    pub fn tag_len(&self) -> usize {
        16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        }
    }
}

/// Cipher selected from a method + password pair.
///
/// Holds only the master key; every connection or packet derives its own
/// subkey from a fresh salt, so one instance is shared read-only by all
/// workers.
#[derive(Clone)]
pub struct ShadowsocksCipher {
    kind: CipherKind,
    key: Vec<u8>,
}

impl std::fmt::Debug for ShadowsocksCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowsocksCipher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl ShadowsocksCipher {
    pub fn new(method: &str, password: &str) -> Result<Self> {
        if password.is_empty() {
            bail!("shadowsocks password must not be empty");
        }
        let kind = CipherKind::from_str(method)?;
        let key = evp_bytes_to_key(password.as_bytes(), kind.key_len());
        Ok(Self { kind, key })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn random_salt(&self) -> Vec<u8> {
        let mut salt = vec![0u8; self.kind.salt_len()];
        rand::thread_rng().fill(&mut salt[..]);
        salt
    }

    /// Session cipher for the given salt.
    pub fn session(&self, salt: &[u8]) -> Result<AeadCipher> {
        let subkey = derive_subkey(&self.key, salt, self.kind.key_len())?;
        Ok(AeadCipher::new(self.kind, subkey))
    }
}

/// Derive key from password using EVP_BytesToKey (OpenSSL compatible).
///
/// Algorithm: iterative MD5 hashing.
/// D_0 = MD5(password)
/// D_i = MD5(D_{i-1} || password)
/// Concatenate until we have at least key_len bytes.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev_hash: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref prev) = prev_hash {
            hasher.update(prev);
        }
        hasher.update(password);
        let hash = hasher.finalize().to_vec();
        key.extend_from_slice(&hash);
        prev_hash = Some(hash);
    }

    key.truncate(key_len);
    key
}

/// Derive subkey from master key and salt using HKDF-SHA1.
///
/// info = b"ss-subkey"
pub fn derive_subkey(key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {}", e))?;
    Ok(subkey)
}

/// AEAD cipher with nonce counter for Shadowsocks stream encryption.
pub struct AeadCipher {
    cipher_kind: CipherKind,
    key: Vec<u8>,
    nonce: u64,
}

impl AeadCipher {
    pub fn new(cipher_kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            cipher_kind,
            key: subkey,
            nonce: 0,
        }
    }

    /// Current nonce as 12-byte LE-encoded array, then increment.
    fn nonce_bytes_and_increment(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        nonce
    }

    /// Encrypt plaintext, returning ciphertext + tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce_bytes_and_increment();
        let nonce = GenericArray::from_slice(&nonce);
        let mut buf = plaintext.to_vec();

        let tag = match self.cipher_kind {
            CipherKind::Aes128Gcm => Aes128Gcm::new(GenericArray::from_slice(&self.key))
                .encrypt_in_place_detached(nonce, b"", &mut buf),
            CipherKind::Aes256Gcm => Aes256Gcm::new(GenericArray::from_slice(&self.key))
                .encrypt_in_place_detached(nonce, b"", &mut buf),
            CipherKind::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key))
                    .encrypt_in_place_detached(nonce, b"", &mut buf)
            }
        }
        .map_err(|e| anyhow::anyhow!("{} encrypt failed: {}", self.cipher_kind.as_str(), e))?;

        buf.extend_from_slice(&tag);
        Ok(buf)
    }

    /// Decrypt ciphertext (with appended tag), returning plaintext.
    pub fn decrypt(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.cipher_kind.tag_len();
        if ciphertext_with_tag.len() < tag_len {
            bail!(
                "ciphertext too short: {} bytes, need at least {} for tag",
                ciphertext_with_tag.len(),
                tag_len
            );
        }

        let nonce = self.nonce_bytes_and_increment();
        let nonce = GenericArray::from_slice(&nonce);
        let ct_len = ciphertext_with_tag.len() - tag_len;
        let mut buf = ciphertext_with_tag[..ct_len].to_vec();
        let tag = GenericArray::from_slice(&ciphertext_with_tag[ct_len..]);

        match self.cipher_kind {
            CipherKind::Aes128Gcm => Aes128Gcm::new(GenericArray::from_slice(&self.key))
                .decrypt_in_place_detached(nonce, b"", &mut buf, tag),
            CipherKind::Aes256Gcm => Aes256Gcm::new(GenericArray::from_slice(&self.key))
                .decrypt_in_place_detached(nonce, b"", &mut buf, tag),
            CipherKind::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key))
                    .decrypt_in_place_detached(nonce, b"", &mut buf, tag)
            }
        }
        .map_err(|e| anyhow::anyhow!("{} decrypt failed: {}", self.cipher_kind.as_str(), e))?;

        Ok(buf)
    }
}
