//! Server-side encryption: per-part data keys wrapped by a master key.

use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{Bytes, BytesMut};
use rand::RngCore;

use crate::limits::{ENCRYPTION_BLOCK_SIZE, ENCRYPTION_TAG_SIZE};
use crate::meta_store::{EncryptionConfig, SseInfo};

/// Block-wise AES-256-GCM with per-block nonces.
pub const CRYPTO_SCHEME: u8 = 1;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SUPPORTED_ALGORITHMS: [&str; 2] = ["AES256", "aws:kms"];

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("master key {0} is not configured")]
    UnknownMasterKey(String),

    #[error("master key {0} is not a hex-encoded 256-bit key")]
    InvalidMasterKey(String),

    #[error("encryption algorithm {0} is not supported")]
    UnsupportedAlgorithm(String),

    #[error("{0} failed")]
    Crypto(&'static str),
}

/// Material that encrypts the bytes of exactly one part.
///
/// Every part gets its own data key, so block nonces only need to be
/// unique within the part and are derived from the block counter.
pub struct CipherHandle {
    key: [u8; KEY_SIZE],
}

impl fmt::Debug for CipherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherHandle").finish_non_exhaustive()
    }
}

impl CipherHandle {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    pub fn encryptor(&self) -> BlockEncryptor {
        BlockEncryptor {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key)),
            counter: 0,
        }
    }

    /// Reverses [`BlockEncryptor`] over a complete stored payload.
    pub fn decrypt(&self, stored: &[u8]) -> Result<Vec<u8>, KmsError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut plain = Vec::with_capacity(stored.len());
        for (counter, block) in stored.chunks(ENCRYPTION_BLOCK_SIZE + ENCRYPTION_TAG_SIZE).enumerate() {
            let nonce = block_nonce(counter as u64);
            let out = cipher
                .decrypt(Nonce::from_slice(&nonce), block)
                .map_err(|_| KmsError::Crypto("block decryption"))?;
            plain.extend_from_slice(&out);
        }
        Ok(plain)
    }
}

fn block_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - 8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Encrypts consecutive plaintext blocks, each followed by its tag.
pub struct BlockEncryptor {
    cipher: Aes256Gcm,
    counter: u64,
}

impl BlockEncryptor {
    pub fn seal(&mut self, block: &[u8], out: &mut BytesMut) -> Result<(), KmsError> {
        let nonce = block_nonce(self.counter);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), block)
            .map_err(|_| KmsError::Crypto("block encryption"))?;
        self.counter += 1;
        out.extend_from_slice(&sealed);
        Ok(())
    }
}

/// Size of the stored payload for `plain` plaintext bytes.
pub fn encrypted_len(plain: u64) -> u64 {
    let blocks = plain.div_ceil(ENCRYPTION_BLOCK_SIZE as u64);
    plain + blocks * ENCRYPTION_TAG_SIZE as u64
}

/// Everything needed to encrypt one part, plus the fields that get
/// persisted next to it.
#[derive(Debug)]
pub struct CipherBundle {
    pub algorithm: String,
    pub master_key_id: String,
    pub crypto_scheme: u8,
    pub ciphered_data_key: String,
    pub cipher: CipherHandle,
}

impl CipherBundle {
    /// Consumes the bundle, dropping the plaintext key material.
    pub fn into_sse_info(self) -> SseInfo {
        SseInfo {
            algorithm: self.algorithm,
            master_key_id: self.master_key_id,
            crypto_scheme: self.crypto_scheme,
            ciphered_data_key: self.ciphered_data_key,
        }
    }
}

#[async_trait::async_trait]
pub trait KeyManagement: Send + Sync + fmt::Debug + 'static {
    async fn create_cipher_bundle(&self, config: &EncryptionConfig) -> Result<CipherBundle, KmsError>;
}

/// Key management backed by master keys from the configuration file.
pub struct LocalKms {
    master_keys: HashMap<String, [u8; KEY_SIZE]>,
}

impl fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKms")
            .field("master_keys", &self.master_keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocalKms {
    pub fn new(master_keys: HashMap<String, [u8; KEY_SIZE]>) -> Self {
        Self { master_keys }
    }

    pub fn from_hex(master_keys: &HashMap<String, String>) -> Result<Self, KmsError> {
        let mut keys = HashMap::with_capacity(master_keys.len());
        for (id, encoded) in master_keys {
            let raw = hex_simd::decode_to_vec(encoded.trim()).map_err(|_| KmsError::InvalidMasterKey(id.clone()))?;
            let key: [u8; KEY_SIZE] = raw.try_into().map_err(|_| KmsError::InvalidMasterKey(id.clone()))?;
            keys.insert(id.clone(), key);
        }
        Ok(Self::new(keys))
    }

    fn master_key(&self, id: &str) -> Result<&[u8; KEY_SIZE], KmsError> {
        self.master_keys.get(id).ok_or_else(|| KmsError::UnknownMasterKey(id.to_owned()))
    }

    /// Recovers the data key from its persisted, wrapped form.
    pub fn unwrap_data_key(&self, master_key_id: &str, ciphered_data_key: &str) -> Result<[u8; KEY_SIZE], KmsError> {
        let master = self.master_key(master_key_id)?;
        let wrapped = hex_simd::decode_to_vec(ciphered_data_key).map_err(|_| KmsError::Crypto("data key decoding"))?;
        if wrapped.len() < NONCE_SIZE {
            return Err(KmsError::Crypto("data key decoding"));
        }
        let (nonce, sealed) = wrapped.split_at(NONCE_SIZE);
        let plain = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master))
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| KmsError::Crypto("data key unwrapping"))?;
        plain.try_into().map_err(|_| KmsError::Crypto("data key unwrapping"))
    }

    fn wrap_data_key(&self, master_key_id: &str, data_key: &[u8; KEY_SIZE]) -> Result<String, KmsError> {
        let master = self.master_key(master_key_id)?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master))
            .encrypt(Nonce::from_slice(&nonce), data_key.as_slice())
            .map_err(|_| KmsError::Crypto("data key wrapping"))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + sealed.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&sealed);
        Ok(hex_simd::encode_to_string(wrapped, hex_simd::AsciiCase::Lower))
    }
}

#[async_trait::async_trait]
impl KeyManagement for LocalKms {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn create_cipher_bundle(&self, config: &EncryptionConfig) -> Result<CipherBundle, KmsError> {
        if !SUPPORTED_ALGORITHMS.contains(&config.algorithm.as_str()) {
            return Err(KmsError::UnsupportedAlgorithm(config.algorithm.clone()));
        }

        let mut data_key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut data_key);
        let ciphered_data_key = self.wrap_data_key(&config.master_key_id, &data_key)?;

        Ok(CipherBundle {
            algorithm: config.algorithm.clone(),
            master_key_id: config.master_key_id.clone(),
            crypto_scheme: CRYPTO_SCHEME,
            ciphered_data_key,
            cipher: CipherHandle::new(data_key),
        })
    }
}

/// Splits a plaintext byte stream into encryption blocks.
#[derive(Default)]
pub(crate) struct BlockBuffer {
    pending: BytesMut,
}

impl BlockBuffer {
    /// Seals every complete block buffered so far.
    pub(crate) fn push(&mut self, chunk: &[u8], encryptor: &mut BlockEncryptor) -> Result<Bytes, KmsError> {
        self.pending.extend_from_slice(chunk);
        let mut out = BytesMut::new();
        while self.pending.len() >= ENCRYPTION_BLOCK_SIZE {
            let block = self.pending.split_to(ENCRYPTION_BLOCK_SIZE);
            encryptor.seal(&block, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Seals the trailing partial block, if any.
    pub(crate) fn finish(mut self, encryptor: &mut BlockEncryptor) -> Result<Bytes, KmsError> {
        let mut out = BytesMut::new();
        if !self.pending.is_empty() {
            let block = self.pending.split();
            encryptor.seal(&block, &mut out)?;
        }
        Ok(out.freeze())
    }
}
