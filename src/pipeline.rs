//! Ingestion of a single multipart-upload part.
//!
//! Every stage hands its output to the next one and the first failure is
//! returned as is. Data is always durable before the part record that
//! points at it is written; a failure after the data write leaves an
//! unreferenced blob, never a dangling record.

use std::sync::Arc;

use crate::blob_store::{BlobStore, ByteStream, ObjectKeyContext};
use crate::error::IngestError;
use crate::kms::KeyManagement;
use crate::limits::MAX_PART_SIZE;
use crate::meta_store::{Identity, PartNumber};
use crate::metadata::{MetadataService, RequestType};
use crate::part_store::{PartMetadata, PartStore};

#[derive(Debug, Clone)]
pub struct UploadPartRequest {
    pub identity: Identity,
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number: i64,
    /// `Content-Length` of the request, when the client sent one
    pub content_length: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PartIngestion {
    metadata: Arc<dyn MetadataService>,
    kms: Arc<dyn KeyManagement>,
    blobs: Arc<dyn BlobStore>,
    parts: Arc<dyn PartStore>,
}

/// Checks the declared part size. Only the upper bound is enforced here;
/// the minimum for non-final parts is checked at completion.
pub fn validate_part_size(content_length: Option<i64>) -> Result<Option<u64>, IngestError> {
    let Some(size) = content_length else {
        return Ok(None);
    };
    let size = u64::try_from(size).map_err(|_| IngestError::InvalidArgument(format!("content length {size} is negative")))?;
    if size > MAX_PART_SIZE {
        return Err(IngestError::EntityTooLarge(size));
    }
    Ok(Some(size))
}

impl PartIngestion {
    pub fn new(
        metadata: Arc<dyn MetadataService>,
        kms: Arc<dyn KeyManagement>,
        blobs: Arc<dyn BlobStore>,
        parts: Arc<dyn PartStore>,
    ) -> Self {
        Self {
            metadata,
            kms,
            blobs,
            parts,
        }
    }

    /// Stores one part and returns the hex MD5 of the stored bytes.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(bucket = %req.bucket, key = %req.key, upload_id = %req.upload_id, part_number = req.part_number)
    )]
    pub async fn ingest_part(&self, req: UploadPartRequest, payload: ByteStream) -> Result<String, IngestError> {
        match self.run(req, payload).await {
            Ok(md5) => {
                tracing::info!(etag = %md5, "part stored");
                Ok(md5)
            }
            Err(err) if err.is_client_error() => {
                tracing::info!(error = %err, "part rejected");
                Err(err)
            }
            Err(err) => {
                crate::error::log(&err);
                Err(err)
            }
        }
    }

    async fn run(&self, req: UploadPartRequest, payload: ByteStream) -> Result<String, IngestError> {
        let part_number = PartNumber::new(req.part_number)?;
        let size = validate_part_size(req.content_length)?;

        let bucket = self
            .metadata
            .authorize_bucket(&req.identity, &req.bucket, RequestType::ObjectPut)
            .await?;
        tracing::debug!("bucket access granted");

        let shadow = self
            .metadata
            .resolve_shadow_bucket(&bucket, &req.bucket)
            .await?
            .ok_or_else(|| IngestError::NoSuchUpload(req.upload_id.clone()))?;
        let splitter = shadow.schema_version().splitter();
        tracing::debug!(shadow_bucket = %shadow.name, splitter, "resolved shadow bucket");

        let bundle = match bucket.server_side_encryption() {
            Some(sse) => Some(self.kms.create_cipher_bundle(sse).await?),
            None => None,
        };

        self.metadata
            .authorize_multipart(&req.identity, &req.bucket, &req.key, &req.upload_id, RequestType::PutPartOrComplete)
            .await?;
        tracing::debug!("upload access granted");

        let context = ObjectKeyContext {
            bucket_name: req.bucket,
            owner: req.identity.canonical_id,
            object_key: req.key,
            upload_id: req.upload_id,
        };
        let stored = self
            .blobs
            .store(payload, size, bundle.as_ref().map(|b| &b.cipher), &context)
            .await?;
        tracing::debug!(locations = stored.locations.len(), "part data is durable");

        let metadata = PartMetadata {
            part_number,
            content_md5: stored.content_md5.clone(),
            size: stored.size,
            upload_id: context.upload_id,
            splitter,
            sse: bundle.map(|b| b.into_sse_info()),
        };
        self.parts.put_part(&shadow.name, stored.locations, metadata).await?;

        Ok(stored.content_md5)
    }
}
