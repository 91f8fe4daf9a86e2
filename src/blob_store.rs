use std::collections::HashMap;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use md5::{Digest, Md5};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::kms::{BlockBuffer, BlockEncryptor, CipherHandle, KmsError};
use crate::limits::MAX_PART_SIZE;
use crate::meta_store::Location;

pub type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Request payload as delivered by the transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StdError>> + Send + Sync + 'static>>;

/// Who and what a blob is being written for.
#[derive(Debug, Clone)]
pub struct ObjectKeyContext {
    pub bucket_name: String,
    pub owner: String,
    pub object_key: String,
    pub upload_id: String,
}

#[derive(Debug, Clone)]
pub struct StoredData {
    pub locations: Vec<Location>,
    /// lowercase hex MD5 of the stored bytes
    pub content_md5: String,
    /// plaintext bytes received from the caller
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("payload stream failed after {received} bytes: {source}")]
    Payload {
        received: u64,
        #[source]
        source: StdError,
    },

    #[error("payload length mismatch: declared {declared} bytes, received {received}")]
    LengthMismatch { declared: u64, received: u64 },

    #[error("payload exceeds the maximum part size after {received} bytes")]
    TooLarge { received: u64 },

    #[error("payload encryption failed: {0}")]
    Encryption(#[from] KmsError),

    #[error("backing store rejected the write: {0}")]
    Upstream(#[from] s3s::S3Error),

    #[error("backing store closed the body before the payload ended")]
    BodyClosed,
}

impl BlobError {
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BlobError::Payload { .. } | BlobError::LengthMismatch { .. } | BlobError::TooLarge { .. }
        )
    }
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug + 'static {
    /// Consumes `payload`, optionally encrypting it, and returns where the
    /// bytes landed once they are durable.
    async fn store(
        &self,
        payload: ByteStream,
        size: Option<u64>,
        cipher: Option<&CipherHandle>,
        context: &ObjectKeyContext,
    ) -> Result<StoredData, BlobError>;
}

/// Summary of a fully consumed payload.
#[derive(Debug, Clone)]
pub struct Placed {
    pub content_md5: String,
    pub size: u64,
    pub stored_size: u64,
}

/// Turns payload chunks into the bytes that get persisted: counts and
/// bounds the plaintext, encrypts when a cipher is present, and hashes
/// whatever is emitted.
pub struct PlacementWriter {
    declared: Option<u64>,
    max_size: u64,
    encryption: Option<(BlockEncryptor, BlockBuffer)>,
    hasher: Md5,
    received: u64,
    stored: u64,
}

impl PlacementWriter {
    pub fn new(declared: Option<u64>, cipher: Option<&CipherHandle>) -> Self {
        Self::with_max_size(declared, cipher, MAX_PART_SIZE)
    }

    fn with_max_size(declared: Option<u64>, cipher: Option<&CipherHandle>, max_size: u64) -> Self {
        Self {
            declared,
            max_size,
            encryption: cipher.map(|c| (c.encryptor(), BlockBuffer::default())),
            hasher: Md5::new(),
            received: 0,
            stored: 0,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Bytes to persist for `chunk`; may be empty while a block fills up.
    pub fn write(&mut self, chunk: &[u8]) -> Result<Bytes, BlobError> {
        self.received += chunk.len() as u64;
        if let Some(declared) = self.declared {
            if self.received > declared {
                return Err(BlobError::LengthMismatch {
                    declared,
                    received: self.received,
                });
            }
        }
        // also bounds streams that declared no size
        if self.received > self.max_size {
            return Err(BlobError::TooLarge { received: self.received });
        }

        let out = match self.encryption.as_mut() {
            Some((encryptor, buffer)) => buffer.push(chunk, encryptor)?,
            None => Bytes::copy_from_slice(chunk),
        };
        self.emit(&out);
        Ok(out)
    }

    /// Flushes the trailing bytes and checks the declared length.
    pub fn finish(mut self) -> Result<(Bytes, Placed), BlobError> {
        if let Some(declared) = self.declared {
            if self.received != declared {
                return Err(BlobError::LengthMismatch {
                    declared,
                    received: self.received,
                });
            }
        }

        let tail = match self.encryption.take() {
            Some((mut encryptor, buffer)) => buffer.finish(&mut encryptor)?,
            None => Bytes::new(),
        };
        self.emit(&tail);

        let digest = self.hasher.finalize();
        let placed = Placed {
            content_md5: hex_simd::encode_to_string(digest, hex_simd::AsciiCase::Lower),
            size: self.received,
            stored_size: self.stored,
        };
        Ok((tail, placed))
    }

    fn emit(&mut self, out: &[u8]) {
        self.hasher.update(out);
        self.stored += out.len() as u64;
    }
}

/// Blob store keeping everything in process memory. Bytes are appended as
/// they arrive, so an aborted payload leaves its partial blob behind.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, BytesMut>>,
}

pub const MEMORY_STORE_NAME: &str = "memory";

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.blobs.read().await.get(key).map(|b| Bytes::copy_from_slice(b))
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn append(&self, key: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut blobs = self.blobs.write().await;
        blobs.entry(key.to_owned()).or_default().extend_from_slice(data);
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    #[tracing::instrument(level = "debug", skip(self, payload, cipher), fields(encrypted = cipher.is_some()))]
    async fn store(
        &self,
        mut payload: ByteStream,
        size: Option<u64>,
        cipher: Option<&CipherHandle>,
        context: &ObjectKeyContext,
    ) -> Result<StoredData, BlobError> {
        let key = Uuid::new_v4().to_string();
        self.blobs.write().await.insert(key.clone(), BytesMut::new());

        let mut writer = PlacementWriter::new(size, cipher);
        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(|source| BlobError::Payload {
                received: writer.received(),
                source,
            })?;
            let out = writer.write(&chunk)?;
            self.append(&key, &out).await;
        }
        let (tail, placed) = writer.finish()?;
        self.append(&key, &tail).await;

        tracing::debug!(%key, stored = placed.stored_size, "blob stored");
        Ok(StoredData {
            locations: vec![Location {
                key,
                data_store_name: MEMORY_STORE_NAME.to_owned(),
                size: placed.stored_size,
                data_store_etag: None,
            }],
            content_md5: placed.content_md5,
            size: placed.size,
        })
    }
}
