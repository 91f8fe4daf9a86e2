use std::collections::HashMap;
use std::sync::Arc;

use s3s::dto::*;
use s3s::{s3_error, S3Request, S3Response, S3Result, S3};

use crate::blob_store::{ByteStream, StdError};
use crate::meta_store::Identity;
use crate::metadata::MetadataService;
use crate::pipeline::{PartIngestion, UploadPartRequest};

/// S3 front end of the multipart ingestion path.
#[derive(Debug)]
pub struct IngestGateway {
    metadata: Arc<dyn MetadataService>,
    ingestion: PartIngestion,
    /// access key -> canonical id
    identities: HashMap<String, String>,
}

impl IngestGateway {
    pub fn new(metadata: Arc<dyn MetadataService>, ingestion: PartIngestion, identities: HashMap<String, String>) -> Self {
        Self {
            metadata,
            ingestion,
            identities,
        }
    }

    fn identity<T>(&self, req: &S3Request<T>) -> S3Result<Identity> {
        let Some(credentials) = req.credentials.as_ref() else {
            tracing::info!("request is unauthorized");
            return Err(s3s::S3Error::new(s3s::S3ErrorCode::AccessDenied));
        };
        match self.identities.get(&credentials.access_key) {
            Some(canonical_id) => Ok(Identity::new(canonical_id.clone())),
            None => Err(s3_error!(InvalidAccessKeyId)),
        }
    }
}

#[async_trait::async_trait]
impl S3 for IngestGateway {
    #[tracing::instrument(level = "info", skip_all)]
    async fn create_multipart_upload(
        &self,
        req: S3Request<CreateMultipartUploadInput>,
    ) -> S3Result<S3Response<CreateMultipartUploadOutput>> {
        let identity = self.identity(&req)?;
        let input = req.input;
        if let Some(ref storage_class) = input.storage_class {
            let is_valid = ["STANDARD"].contains(&storage_class.as_str()); // todo handle storage tiers
            if !is_valid {
                return Err(s3_error!(InvalidStorageClass));
            }
        }

        let upload = self.metadata.initiate_upload(&identity, &input.bucket, &input.key).await?;

        let output = CreateMultipartUploadOutput {
            bucket: Some(upload.bucket),
            key: Some(upload.oid),
            upload_id: Some(upload.upload_id),
            ..Default::default()
        };
        Ok(S3Response::new(output))
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn upload_part(&self, req: S3Request<UploadPartInput>) -> S3Result<S3Response<UploadPartOutput>> {
        let identity = self.identity(&req)?;
        let input = req.input;

        let payload: ByteStream = match input.body {
            Some(body) => Box::pin(body),
            None => Box::pin(futures::stream::empty::<Result<bytes::Bytes, StdError>>()),
        };
        let request = UploadPartRequest {
            identity,
            bucket: input.bucket,
            key: input.key,
            upload_id: input.upload_id,
            part_number: i64::from(input.part_number),
            content_length: input.content_length,
        };

        let e_tag = self.ingestion.ingest_part(request, payload).await?;

        let response = UploadPartOutput {
            e_tag: Some(e_tag),
            ..Default::default()
        };
        Ok(S3Response::new(response))
    }
}
