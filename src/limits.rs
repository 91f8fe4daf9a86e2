//! Process-wide limits and key-encoding constants for multipart ingestion.

/// Smallest valid part number.
pub const MIN_PART_NUMBER: i64 = 1;

/// AWS caps part numbers at 10,000.
pub const MAX_PART_NUMBER: i64 = 10_000;

/// A single part may not exceed 5 GiB.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Width the part number is zero-padded to inside a part key.
pub const PART_NUMBER_WIDTH: usize = 5;

/// Separator used by shadow buckets created with schema version 2 or later.
pub const SPLITTER: &str = "..|..";

// BACKWARD COMPAT: shadow buckets created before schema version 2
pub const OLD_SPLITTER: &str = "splitter";

/// Shadow buckets are named `<prefix><bucket>`.
pub const MPU_BUCKET_PREFIX: &str = "mpuShadowBucket";

/// Schema version assigned to newly created shadow buckets.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Plaintext block size for in-flight encryption.
pub const ENCRYPTION_BLOCK_SIZE: usize = 64 * 1024;

/// AES-GCM authentication tag appended to every encrypted block.
pub const ENCRYPTION_TAG_SIZE: usize = 16;
