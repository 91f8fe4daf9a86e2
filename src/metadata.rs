//! Authorization and lookup of buckets, shadow buckets and in-flight uploads.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::limits::CURRENT_SCHEMA_VERSION;
use crate::meta_store::{Bucket, Identity, MultipartUpload, ShadowBucket};

/// Operation a check is made for.
///
/// Only recorded on the check's span. The permission class is fixed by the
/// method: bucket checks admit the bucket owner, upload checks admit the
/// upload's initiator or the bucket owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    ObjectPut,
    PutPartOrComplete,
    InitiateMultipartUpload,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("access denied")]
    AccessDenied,

    #[error("bucket {0} does not exist")]
    NoSuchBucket(String),

    #[error("multipart upload {0} does not exist")]
    NoSuchUpload(String),

    #[error("metadata database failure: {0}")]
    Database(#[from] sqlx::Error),
}

impl MetadataError {
    pub fn is_client_error(&self) -> bool {
        !matches!(self, MetadataError::Database(_))
    }
}

#[async_trait::async_trait]
pub trait MetadataService: Send + Sync + std::fmt::Debug + 'static {
    /// Checks that `identity` owns `bucket` and returns it. `request` is
    /// informational.
    async fn authorize_bucket(&self, identity: &Identity, bucket: &str, request: RequestType) -> Result<Bucket, MetadataError>;

    /// Checks that `identity` may act on the in-flight upload `upload_id`,
    /// either as its initiator or as the bucket owner.
    async fn authorize_multipart(
        &self,
        identity: &Identity,
        bucket: &str,
        key: &str,
        upload_id: &str,
        request: RequestType,
    ) -> Result<(), MetadataError>;

    /// Looks up the shadow bucket of `bucket`. Never creates one.
    async fn resolve_shadow_bucket(&self, bucket: &Bucket, bucket_name: &str) -> Result<Option<ShadowBucket>, MetadataError>;

    /// Registers a new upload, creating the shadow bucket on first use.
    async fn initiate_upload(&self, identity: &Identity, bucket: &str, key: &str) -> Result<MultipartUpload, MetadataError>;
}

pub(crate) fn check_bucket_access(identity: &Identity, bucket: &Bucket) -> Result<(), MetadataError> {
    if bucket.owner != identity.canonical_id {
        tracing::info!(bucket = %bucket.name, caller = %identity.canonical_id, "caller does not own the bucket");
        return Err(MetadataError::AccessDenied);
    }
    Ok(())
}

pub(crate) fn check_upload_access(identity: &Identity, initiator: &str, bucket_owner: &str) -> Result<(), MetadataError> {
    if identity.canonical_id != initiator && identity.canonical_id != bucket_owner {
        tracing::info!(caller = %identity.canonical_id, %initiator, "caller did not initiate the upload");
        return Err(MetadataError::AccessDenied);
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    buckets: HashMap<String, Bucket>,
    shadow_buckets: HashMap<String, ShadowBucket>,
    uploads: HashMap<String, MultipartUpload>,
}

/// Metadata kept in process memory. Used for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    state: RwLock<MemoryState>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_bucket(&self, bucket: Bucket) {
        self.state.write().await.buckets.insert(bucket.name.clone(), bucket);
    }

    /// Installs a shadow bucket with an explicit schema version, as left
    /// behind by older deployments.
    pub async fn add_shadow_bucket(&self, bucket: &str, model_version: i32) -> ShadowBucket {
        let shadow = ShadowBucket {
            name: ShadowBucket::name_for(bucket),
            model_version,
        };
        self.state
            .write()
            .await
            .shadow_buckets
            .insert(shadow.name.clone(), shadow.clone());
        shadow
    }

    pub async fn upload(&self, upload_id: &str) -> Option<MultipartUpload> {
        self.state.read().await.uploads.get(upload_id).cloned()
    }
}

#[async_trait::async_trait]
impl MetadataService for MemoryMetadata {
    #[tracing::instrument(level = "debug", skip(self, identity))]
    async fn authorize_bucket(&self, identity: &Identity, bucket: &str, request: RequestType) -> Result<Bucket, MetadataError> {
        let state = self.state.read().await;
        let Some(bucket) = state.buckets.get(bucket) else {
            return Err(MetadataError::NoSuchBucket(bucket.to_owned()));
        };
        check_bucket_access(identity, bucket)?;
        Ok(bucket.clone())
    }

    #[tracing::instrument(level = "debug", skip(self, identity))]
    async fn authorize_multipart(
        &self,
        identity: &Identity,
        bucket: &str,
        key: &str,
        upload_id: &str,
        request: RequestType,
    ) -> Result<(), MetadataError> {
        let state = self.state.read().await;
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.oid == key)
            .ok_or_else(|| MetadataError::NoSuchUpload(upload_id.to_owned()))?;
        let owner = state
            .buckets
            .get(bucket)
            .map(|b| b.owner.as_str())
            .ok_or_else(|| MetadataError::NoSuchBucket(bucket.to_owned()))?;
        check_upload_access(identity, &upload.initiator, owner)
    }

    #[tracing::instrument(level = "debug", skip(self, _bucket))]
    async fn resolve_shadow_bucket(&self, _bucket: &Bucket, bucket_name: &str) -> Result<Option<ShadowBucket>, MetadataError> {
        let state = self.state.read().await;
        Ok(state.shadow_buckets.get(&ShadowBucket::name_for(bucket_name)).cloned())
    }

    #[tracing::instrument(level = "debug", skip(self, identity))]
    async fn initiate_upload(&self, identity: &Identity, bucket: &str, key: &str) -> Result<MultipartUpload, MetadataError> {
        let mut state = self.state.write().await;
        let Some(found) = state.buckets.get(bucket) else {
            return Err(MetadataError::NoSuchBucket(bucket.to_owned()));
        };
        check_bucket_access(identity, found)?;

        let shadow_name = ShadowBucket::name_for(bucket);
        state
            .shadow_buckets
            .entry(shadow_name.clone())
            .or_insert_with(|| ShadowBucket {
                name: shadow_name.clone(),
                model_version: CURRENT_SCHEMA_VERSION,
            });

        let upload = MultipartUpload {
            bucket: bucket.to_owned(),
            oid: key.to_owned(),
            upload_id: Uuid::new_v4().simple().to_string(),
            initiator: identity.canonical_id.clone(),
            shadow_bucket: shadow_name,
        };
        state.uploads.insert(upload.upload_id.clone(), upload.clone());
        tracing::info!(upload_id = %upload.upload_id, "initiated multipart upload");
        Ok(upload)
    }
}
