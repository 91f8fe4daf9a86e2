use std::fmt::Debug;
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use s3s::dto::{CompletedMultipartUpload, CompletedPart, StreamingBlob};
use s3s::{S3Request, S3Response, S3Result, S3};
use s3s_aws::Proxy;
use uuid::Uuid;

use crate::blob_store::{BlobError, BlobStore, ByteStream, ObjectKeyContext, Placed, PlacementWriter, StoredData};
use crate::config;
use crate::kms::{encrypted_len, CipherHandle};
use crate::meta_store::Location;

/// Size of the upstream parts used when the payload length is unknown.
const UPSTREAM_PART_SIZE: usize = 8 * 1024 * 1024;

/// Places part data in a bucket of an upstream S3-compatible service.
///
/// Payloads with a declared length are streamed into a single `PutObject`.
/// Payloads of unknown length are cut into fixed-size upstream parts and
/// assembled with a multipart upload, since `PutObject` needs a length.
pub struct S3Client {
    backend: Arc<dyn S3>,
    bucket: String,
    name: String,
    part_size: usize,
}

impl Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client").field("bucket", &self.bucket).finish()
    }
}

impl S3Client {
    pub fn new(cfg: &config::UpstreamStorage) -> Self {
        let cred = Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "s3s-mpu-ingest-config",
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .endpoint_url(cfg.endpoint.clone())
            .credentials_provider(cred)
            .region(Region::new(cfg.region.clone()))
            .force_path_style(true) // apply bucketname as path param instead of pre-domain
            .build();

        let client = aws_sdk_s3::Client::from_conf(s3_config);
        Self::with_backend(Arc::new(Proxy::from(client)), cfg.bucket.clone())
    }

    pub fn with_backend(backend: Arc<dyn S3>, bucket: String) -> Self {
        Self {
            backend,
            name: format!("upstream:{bucket}"),
            bucket,
            part_size: UPSTREAM_PART_SIZE,
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn put_object(
        &self,
        req: s3s::dto::builders::PutObjectInputBuilder,
    ) -> S3Result<S3Response<s3s::dto::PutObjectOutput>> {
        let req = try_!(req.bucket(self.bucket.clone()).build());
        self.backend.put_object(S3Request::new(req)).await
    }

    async fn create_multipart(&self, key: &str) -> S3Result<String> {
        let req = try_!(s3s::dto::CreateMultipartUploadInput::builder()
            .bucket(self.bucket.clone())
            .key(key.to_owned())
            .build());
        let output = self.backend.create_multipart_upload(S3Request::new(req)).await?.output;
        output
            .upload_id
            .ok_or_else(|| s3s::S3Error::with_message(s3s::S3ErrorCode::InternalError, "upstream returned no upload id"))
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> S3Result<CompletedPart> {
        let content_length = body.len() as i64;
        let blob = StreamingBlob::wrap(futures::stream::iter([Ok::<_, std::io::Error>(body)]));
        let req = try_!(s3s::dto::UploadPartInput::builder()
            .bucket(self.bucket.clone())
            .key(key.to_owned())
            .upload_id(upload_id.to_owned())
            .part_number(part_number)
            .content_length(Some(content_length))
            .body(Some(blob))
            .build());
        let output = self.backend.upload_part(S3Request::new(req)).await?.output;
        Ok(CompletedPart {
            e_tag: output.e_tag,
            part_number: Some(part_number),
            ..Default::default()
        })
    }

    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: Vec<CompletedPart>) -> S3Result<Option<String>> {
        let req = try_!(s3s::dto::CompleteMultipartUploadInput::builder()
            .bucket(self.bucket.clone())
            .key(key.to_owned())
            .upload_id(upload_id.to_owned())
            .multipart_upload(Some(CompletedMultipartUpload {
                parts: Some(parts),
                ..Default::default()
            }))
            .build());
        let output = self.backend.complete_multipart_upload(S3Request::new(req)).await?.output;
        Ok(output.e_tag)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> S3Result<()> {
        let req = try_!(s3s::dto::AbortMultipartUploadInput::builder()
            .bucket(self.bucket.clone())
            .key(key.to_owned())
            .upload_id(upload_id.to_owned())
            .build());
        self.backend.abort_multipart_upload(S3Request::new(req)).await?;
        Ok(())
    }

    /// Streams a payload of known length into one `PutObject`.
    async fn store_sized(
        &self,
        key: &str,
        mut payload: ByteStream,
        size: u64,
        cipher: Option<&CipherHandle>,
    ) -> Result<(Placed, Option<String>), BlobError> {
        let content_length = if cipher.is_some() { encrypted_len(size) } else { size };

        let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
        let request = s3s::dto::PutObjectInput::builder()
            .key(key.to_owned())
            .body(Some(StreamingBlob::wrap(rx)))
            .content_length(Some(content_length as i64));
        let upload = self.put_object(request);

        let mut writer = PlacementWriter::new(Some(size), cipher);
        let pump = async move {
            while let Some(chunk) = payload.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(source) => {
                        let _ = tx
                            .send(Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "payload aborted")))
                            .await;
                        return Err(BlobError::Payload {
                            received: writer.received(),
                            source,
                        });
                    }
                };
                let out = match writer.write(&chunk) {
                    Ok(out) => out,
                    Err(err) => {
                        let _ = tx.send(Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "payload rejected"))).await;
                        return Err(err);
                    }
                };
                if !out.is_empty() && tx.send(Ok(out)).await.is_err() {
                    return Err(BlobError::BodyClosed);
                }
            }
            let (tail, placed) = writer.finish()?;
            if !tail.is_empty() && tx.send(Ok(tail)).await.is_err() {
                return Err(BlobError::BodyClosed);
            }
            Ok(placed)
        };

        let (uploaded, pumped) = tokio::join!(upload, pump);
        // a failing payload wins over whatever the upstream made of the cut-off body
        let placed = match pumped {
            Err(BlobError::BodyClosed) => {
                uploaded?;
                return Err(BlobError::BodyClosed);
            }
            other => other?,
        };
        let output = uploaded?.output;
        Ok((placed, output.e_tag))
    }

    /// Cuts a payload of unknown length into upstream parts. The upstream
    /// upload is aborted on any failure.
    async fn store_unsized(
        &self,
        key: &str,
        payload: ByteStream,
        cipher: Option<&CipherHandle>,
    ) -> Result<(Placed, Option<String>), BlobError> {
        let upload_id = self.create_multipart(key).await?;
        tracing::debug!(%upload_id, "started upstream multipart upload");

        let result = self.upload_and_complete(key, &upload_id, payload, cipher).await;
        if result.is_err() {
            if let Err(err) = self.abort_multipart(key, &upload_id).await {
                tracing::warn!(%upload_id, error = %err, "failed to abort upstream multipart upload");
            }
        }
        result
    }

    async fn upload_and_complete(
        &self,
        key: &str,
        upload_id: &str,
        payload: ByteStream,
        cipher: Option<&CipherHandle>,
    ) -> Result<(Placed, Option<String>), BlobError> {
        let (parts, placed) = self.upload_parts(key, upload_id, payload, cipher).await?;
        let e_tag = self.complete_multipart(key, upload_id, parts).await?;
        Ok((placed, e_tag))
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut payload: ByteStream,
        cipher: Option<&CipherHandle>,
    ) -> Result<(Vec<CompletedPart>, Placed), BlobError> {
        let mut writer = PlacementWriter::new(None, cipher);
        let mut buffer = BytesMut::new();
        let mut parts = Vec::new();

        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(|source| BlobError::Payload {
                received: writer.received(),
                source,
            })?;
            buffer.extend_from_slice(&writer.write(&chunk)?);
            while buffer.len() >= self.part_size {
                let body = buffer.split_to(self.part_size).freeze();
                let part = self.upload_part(key, upload_id, next_part_number(&parts), body).await?;
                parts.push(part);
            }
        }

        let (tail, placed) = writer.finish()?;
        buffer.extend_from_slice(&tail);
        // an empty payload still needs one (empty) part to complete
        if !buffer.is_empty() || parts.is_empty() {
            let part = self.upload_part(key, upload_id, next_part_number(&parts), buffer.freeze()).await?;
            parts.push(part);
        }
        Ok((parts, placed))
    }
}

// the writer caps a payload at 5 GiB, far below 10000 upstream parts
fn next_part_number(parts: &[CompletedPart]) -> i32 {
    parts.len() as i32 + 1
}

#[async_trait::async_trait]
impl BlobStore for S3Client {
    #[tracing::instrument(level = "debug", skip(self, payload, cipher), fields(encrypted = cipher.is_some()))]
    async fn store(
        &self,
        payload: ByteStream,
        size: Option<u64>,
        cipher: Option<&CipherHandle>,
        context: &ObjectKeyContext,
    ) -> Result<StoredData, BlobError> {
        let key = Uuid::new_v4().to_string();
        let (placed, e_tag) = match size {
            Some(size) => self.store_sized(&key, payload, size, cipher).await?,
            None => self.store_unsized(&key, payload, cipher).await?,
        };

        tracing::debug!(%key, stored = placed.stored_size, "blob stored upstream");
        Ok(StoredData {
            locations: vec![Location {
                key,
                data_store_name: self.name.clone(),
                size: placed.stored_size,
                data_store_etag: e_tag,
            }],
            content_md5: placed.content_md5,
            size: placed.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use s3s::dto::*;
    use s3s::{s3_error, S3Request, S3Response, S3Result, S3};

    use super::*;
    use crate::blob_store::StdError;

    /// In-process stand-in for the upstream service.
    #[derive(Default)]
    struct MemoryUpstream {
        reject_puts: bool,
        objects: Mutex<HashMap<String, Vec<u8>>>,
        content_lengths: Mutex<Vec<Option<i64>>>,
        uploads: Mutex<HashMap<String, BTreeMap<i32, Vec<u8>>>>,
        aborted: Mutex<Vec<String>>,
    }

    async fn read_body(body: Option<StreamingBlob>) -> S3Result<Vec<u8>> {
        let Some(mut body) = body else {
            return Ok(Vec::new());
        };
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|_| s3_error!(IncompleteBody))?;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    #[async_trait::async_trait]
    impl S3 for MemoryUpstream {
        async fn put_object(&self, req: S3Request<PutObjectInput>) -> S3Result<S3Response<PutObjectOutput>> {
            if self.reject_puts {
                return Err(s3_error!(SlowDown));
            }
            let input = req.input;
            self.content_lengths.lock().unwrap().push(input.content_length);
            let data = read_body(input.body).await?;
            self.objects.lock().unwrap().insert(input.key, data);
            Ok(S3Response::new(PutObjectOutput {
                e_tag: Some("\"put\"".to_owned()),
                ..Default::default()
            }))
        }

        async fn create_multipart_upload(
            &self,
            _req: S3Request<CreateMultipartUploadInput>,
        ) -> S3Result<S3Response<CreateMultipartUploadOutput>> {
            let upload_id = Uuid::new_v4().simple().to_string();
            self.uploads.lock().unwrap().insert(upload_id.clone(), BTreeMap::new());
            Ok(S3Response::new(CreateMultipartUploadOutput {
                upload_id: Some(upload_id),
                ..Default::default()
            }))
        }

        async fn upload_part(&self, req: S3Request<UploadPartInput>) -> S3Result<S3Response<UploadPartOutput>> {
            let input = req.input;
            let data = read_body(input.body).await?;
            let mut uploads = self.uploads.lock().unwrap();
            let parts = uploads.get_mut(&input.upload_id).ok_or_else(|| s3_error!(NoSuchUpload))?;
            parts.insert(input.part_number, data);
            Ok(S3Response::new(UploadPartOutput {
                e_tag: Some(format!("\"part-{}\"", input.part_number)),
                ..Default::default()
            }))
        }

        async fn complete_multipart_upload(
            &self,
            req: S3Request<CompleteMultipartUploadInput>,
        ) -> S3Result<S3Response<CompleteMultipartUploadOutput>> {
            let input = req.input;
            let parts = self
                .uploads
                .lock()
                .unwrap()
                .remove(&input.upload_id)
                .ok_or_else(|| s3_error!(NoSuchUpload))?;
            let listed = input.multipart_upload.and_then(|u| u.parts).unwrap_or_default();
            assert_eq!(listed.len(), parts.len());
            let data: Vec<u8> = parts.into_values().flatten().collect();
            self.objects.lock().unwrap().insert(input.key, data);
            Ok(S3Response::new(CompleteMultipartUploadOutput {
                e_tag: Some("\"complete\"".to_owned()),
                ..Default::default()
            }))
        }

        async fn abort_multipart_upload(
            &self,
            req: S3Request<AbortMultipartUploadInput>,
        ) -> S3Result<S3Response<AbortMultipartUploadOutput>> {
            let input = req.input;
            self.uploads.lock().unwrap().remove(&input.upload_id);
            self.aborted.lock().unwrap().push(input.upload_id);
            Ok(S3Response::new(AbortMultipartUploadOutput::default()))
        }
    }

    fn client(upstream: &Arc<MemoryUpstream>, part_size: usize) -> S3Client {
        let mut client = S3Client::with_backend(upstream.clone(), "parts".to_owned());
        client.part_size = part_size;
        client
    }

    fn payload(data: &[u8], chunk: usize) -> ByteStream {
        let chunks: Vec<Result<Bytes, StdError>> = data.chunks(chunk).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        Box::pin(futures::stream::iter(chunks))
    }

    fn aborted(data: &[u8]) -> ByteStream {
        let chunks: Vec<Result<Bytes, StdError>> = vec![
            Ok(Bytes::copy_from_slice(data)),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away").into()),
        ];
        Box::pin(futures::stream::iter(chunks))
    }

    fn context() -> ObjectKeyContext {
        ObjectKeyContext {
            bucket_name: "bucket".into(),
            owner: "owner".into(),
            object_key: "key".into(),
            upload_id: "upload".into(),
        }
    }

    fn md5_hex(data: &[u8]) -> String {
        use md5::{Digest, Md5};
        hex_simd::encode_to_string(Md5::digest(data), hex_simd::AsciiCase::Lower)
    }

    #[tokio::test]
    async fn sized_payload_is_one_put_with_length() {
        let upstream = Arc::new(MemoryUpstream::default());
        let client = client(&upstream, UPSTREAM_PART_SIZE);

        let stored = client
            .store(payload(b"hello upstream", 4), Some(14), None, &context())
            .await
            .unwrap();

        let location = &stored.locations[0];
        assert_eq!(location.data_store_name, "upstream:parts");
        assert_eq!(location.data_store_etag.as_deref(), Some("\"put\""));
        assert_eq!(stored.content_md5, md5_hex(b"hello upstream"));
        assert_eq!(upstream.objects.lock().unwrap()[&location.key], b"hello upstream");
        assert_eq!(*upstream.content_lengths.lock().unwrap(), vec![Some(14)]);
    }

    #[tokio::test]
    async fn sized_encrypted_payload_declares_ciphertext_length() {
        let upstream = Arc::new(MemoryUpstream::default());
        let client = client(&upstream, UPSTREAM_PART_SIZE);
        let handle = CipherHandle::new([5u8; 32]);

        let stored = client
            .store(payload(b"0123456789", 3), Some(10), Some(&handle), &context())
            .await
            .unwrap();

        let expected = encrypted_len(10) as i64;
        assert_eq!(*upstream.content_lengths.lock().unwrap(), vec![Some(expected)]);
        let blob = upstream.objects.lock().unwrap()[&stored.locations[0].key].clone();
        assert_eq!(blob.len() as i64, expected);
        assert_eq!(handle.decrypt(&blob).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn payload_failure_wins_over_upstream_failure() {
        let upstream = Arc::new(MemoryUpstream::default());
        let client = client(&upstream, UPSTREAM_PART_SIZE);

        let err = client.store(aborted(b"partial"), Some(100), None, &context()).await.unwrap_err();
        assert!(matches!(err, BlobError::Payload { received: 7, .. }));
    }

    #[tokio::test]
    async fn upstream_rejection_is_reported() {
        let upstream = Arc::new(MemoryUpstream {
            reject_puts: true,
            ..Default::default()
        });
        let client = client(&upstream, UPSTREAM_PART_SIZE);

        let err = client.store(payload(b"abc", 3), Some(3), None, &context()).await.unwrap_err();
        assert!(matches!(err, BlobError::Upstream(ref e) if e.code().as_str() == "SlowDown"), "{err}");
    }

    #[tokio::test]
    async fn unsized_payload_goes_through_multipart() {
        let upstream = Arc::new(MemoryUpstream::default());
        let client = client(&upstream, 16);
        let data: Vec<u8> = (0..50u8).collect();

        let stored = client.store(payload(&data, 7), None, None, &context()).await.unwrap();

        assert_eq!(stored.size, 50);
        assert_eq!(stored.content_md5, md5_hex(&data));
        assert_eq!(stored.locations[0].data_store_etag.as_deref(), Some("\"complete\""));
        assert_eq!(upstream.objects.lock().unwrap()[&stored.locations[0].key], data);
        assert!(upstream.content_lengths.lock().unwrap().is_empty());
        assert!(upstream.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsized_empty_payload_completes() {
        let upstream = Arc::new(MemoryUpstream::default());
        let client = client(&upstream, 16);

        let stored = client.store(payload(b"", 1), None, None, &context()).await.unwrap();
        assert_eq!(stored.size, 0);
        assert!(upstream.objects.lock().unwrap()[&stored.locations[0].key].is_empty());
    }

    #[tokio::test]
    async fn unsized_encrypted_payload_round_trips() {
        let upstream = Arc::new(MemoryUpstream::default());
        let client = client(&upstream, 1000);
        let handle = CipherHandle::new([6u8; 32]);
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();

        let stored = client.store(payload(&data, 4096), None, Some(&handle), &context()).await.unwrap();

        let blob = upstream.objects.lock().unwrap()[&stored.locations[0].key].clone();
        assert_eq!(blob.len() as u64, encrypted_len(150_000));
        assert_eq!(stored.content_md5, md5_hex(&blob));
        assert_eq!(handle.decrypt(&blob).unwrap(), data);
    }

    #[tokio::test]
    async fn unsized_failure_aborts_upstream_upload() {
        let upstream = Arc::new(MemoryUpstream::default());
        let client = client(&upstream, 4);

        let err = client.store(aborted(b"0123456789"), None, None, &context()).await.unwrap_err();
        assert!(matches!(err, BlobError::Payload { received: 10, .. }));
        assert_eq!(upstream.aborted.lock().unwrap().len(), 1);
        assert!(upstream.uploads.lock().unwrap().is_empty());
        assert!(upstream.objects.lock().unwrap().is_empty());
    }
}
