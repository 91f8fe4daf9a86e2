use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::limits::{self, MAX_PART_NUMBER, MIN_PART_NUMBER, PART_NUMBER_WIDTH};

pub type AccountId = s3s::dto::AccountId;
pub type Timestamp = time::PrimitiveDateTime;

/// Current UTC wall-clock time, as stored in part records.
pub fn now_timestamp() -> Timestamp {
    let now = time::OffsetDateTime::now_utc();
    Timestamp::new(now.date(), now.time())
}

/// Authenticated caller, already resolved from its access key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub canonical_id: AccountId,
}

impl Identity {
    pub fn new(canonical_id: impl Into<AccountId>) -> Self {
        Self {
            canonical_id: canonical_id.into(),
        }
    }
}

/// Bucket-level server-side encryption setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// `AES256` or `aws:kms`
    pub algorithm: String,
    pub master_key_id: String,
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    pub owner: AccountId,
    pub encryption: Option<EncryptionConfig>,
    // versioning
    // lc policy
    // website configuration
}

impl Bucket {
    pub fn server_side_encryption(&self) -> Option<&EncryptionConfig> {
        self.encryption.as_ref()
    }
}

/// Key-layout generation of a shadow bucket. Picks the separator token
/// used in every part key written to that bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVersion {
    Legacy,
    Current,
}

impl SchemaVersion {
    pub fn from_model_version(version: i32) -> Self {
        if version < 2 {
            SchemaVersion::Legacy
        } else {
            SchemaVersion::Current
        }
    }

    pub fn splitter(self) -> &'static str {
        match self {
            SchemaVersion::Legacy => limits::OLD_SPLITTER,
            SchemaVersion::Current => limits::SPLITTER,
        }
    }
}

/// Metadata container holding the part records of in-flight uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowBucket {
    pub name: String,
    pub model_version: i32,
}

impl ShadowBucket {
    pub fn name_for(bucket: &str) -> String {
        format!("{}{}", limits::MPU_BUCKET_PREFIX, bucket)
    }

    pub fn schema_version(&self) -> SchemaVersion {
        SchemaVersion::from_model_version(self.model_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    pub bucket: String,
    pub oid: String,
    pub upload_id: String,
    pub initiator: AccountId,
    pub shadow_bucket: String,
}

/// Opaque pointer to bytes persisted by a blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub key: String,
    pub data_store_name: String,
    /// number of bytes actually stored (ciphertext size for encrypted parts)
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store_etag: Option<String>,
}

/// Descriptive encryption fields persisted next to a part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseInfo {
    pub algorithm: String,
    pub master_key_id: String,
    pub crypto_scheme: u8,
    pub ciphered_data_key: String,
}

/// Validated part number in `[1, 10000]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartNumber(u16);

impl PartNumber {
    pub fn new(number: i64) -> Result<Self, IngestError> {
        if number > MAX_PART_NUMBER {
            return Err(IngestError::TooManyParts(number));
        }
        if number < MIN_PART_NUMBER {
            return Err(IngestError::InvalidArgument(format!("part number {number} is out of range")));
        }
        // bounded by MAX_PART_NUMBER above
        Ok(Self(number as u16))
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Zero-padded form so that keys sort in numeric part order.
    pub fn padded(self) -> String {
        format!("{:0width$}", self.0, width = PART_NUMBER_WIDTH)
    }
}

impl fmt::Display for PartNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One stored chunk of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    pub key: String,
    pub upload_id: String,
    pub part_number: PartNumber,
    pub size: u64,
    pub content_md5: String,
    pub locations: Vec<Location>,
    pub sse: Option<SseInfo>,
    pub last_modified: Timestamp,
}

// shadow_buckets
//  -> name: String ("mpuShadowBucket" + bucket)
//  -> bucket: buckets->name
//  -> schema_version: i32 (set once when the first upload is initiated)

// multipart_uploads
//  -> upload_id: String
//  -> bucket, oid, initiator
//  -> shadow_bucket: shadow_buckets->name

// mpu_parts
//  -> shadow_bucket + part_key (PRIMARY KEY, last writer wins)
//  -> part_key: <upload_id><splitter><padded part number>
//  -> locations: jsonb
//  -> sse: jsonb (only for encrypted buckets)
