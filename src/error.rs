use std::panic::Location;

use s3s::{S3Error, S3ErrorCode};
use tracing::error;

use crate::blob_store::BlobError;
use crate::kms::KmsError;
use crate::metadata::MetadataError;
use crate::part_store::PartStoreError;

#[inline]
#[track_caller]
pub(crate) fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "s3s_mpu_ingest",
        %location,
        error=%source,
        "span trace:\n{span_trace}"
    );
}

macro_rules! try_ {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                crate::error::log(&err);
                return Err(::s3s::S3Error::internal_error(err));
            }
        }
    };
}

/// Failure of a single part ingestion. Collaborator errors are carried
/// unmodified so the caller sees exactly which stage failed.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("part number {0} exceeds the maximum of 10000")]
    TooManyParts(i64),

    #[error("declared part size {0} exceeds the maximum allowed size")]
    EntityTooLarge(u64),

    #[error("multipart upload {0} does not exist")]
    NoSuchUpload(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    PartStore(#[from] PartStoreError),
}

impl IngestError {
    /// Errors caused by the request itself rather than by a backend.
    pub fn is_client_error(&self) -> bool {
        match self {
            IngestError::InvalidArgument(_)
            | IngestError::TooManyParts(_)
            | IngestError::EntityTooLarge(_)
            | IngestError::NoSuchUpload(_) => true,
            IngestError::Metadata(e) => e.is_client_error(),
            IngestError::Blob(e) => e.is_client_error(),
            IngestError::Kms(_) | IngestError::PartStore(_) => false,
        }
    }
}

impl From<MetadataError> for S3Error {
    fn from(err: MetadataError) -> Self {
        let code = match &err {
            MetadataError::AccessDenied => S3ErrorCode::AccessDenied,
            MetadataError::NoSuchBucket(_) => S3ErrorCode::NoSuchBucket,
            MetadataError::NoSuchUpload(_) => S3ErrorCode::NoSuchUpload,
            MetadataError::Database(_) => return S3Error::internal_error(err),
        };
        S3Error::with_message(code, err.to_string())
    }
}

impl From<IngestError> for S3Error {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Metadata(e) => e.into(),
            e if !e.is_client_error() => S3Error::internal_error(e),
            e => {
                let code = match &e {
                    IngestError::InvalidArgument(_) => S3ErrorCode::InvalidArgument,
                    IngestError::TooManyParts(_) => S3ErrorCode::Custom("TooManyParts".into()),
                    IngestError::EntityTooLarge(_) => S3ErrorCode::EntityTooLarge,
                    IngestError::NoSuchUpload(_) => S3ErrorCode::NoSuchUpload,
                    IngestError::Blob(BlobError::LengthMismatch { .. }) => S3ErrorCode::IncompleteBody,
                    IngestError::Blob(BlobError::TooLarge { .. }) => S3ErrorCode::EntityTooLarge,
                    IngestError::Blob(BlobError::Payload { .. }) => S3ErrorCode::RequestTimeout,
                    _ => S3ErrorCode::InternalError,
                };
                S3Error::with_message(code, e.to_string())
            }
        }
    }
}
