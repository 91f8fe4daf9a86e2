use std::fmt::Debug;

use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug_span, Instrument};
use uuid::Uuid;

use crate::limits::CURRENT_SCHEMA_VERSION;
use crate::meta_store::{Bucket, EncryptionConfig, Identity, Location, MultipartUpload, PartNumber, ShadowBucket, SseInfo, UploadPart};
use crate::metadata::{check_bucket_access, check_upload_access, MetadataError, MetadataService, RequestType};
use crate::part_store::{upload_prefix, PartMetadata, PartStore, PartStoreError};

pub struct PostgresDatabase {
    db_conn: PgPool,
}

impl PostgresDatabase {
    pub async fn new(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(url).await?;

        tracing::info!("starting database migration");
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("finished database migration");

        Ok(Self { db_conn: pool })
    }
}

impl Debug for PostgresDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDatabase").finish()
    }
}

fn bucket_from_row(row: &PgRow) -> Result<Bucket, sqlx::Error> {
    let algorithm: Option<String> = row.try_get("sse_algorithm")?;
    let master_key_id: Option<String> = row.try_get("sse_master_key_id")?;
    Ok(Bucket {
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
        encryption: algorithm.map(|algorithm| EncryptionConfig {
            algorithm,
            master_key_id: master_key_id.unwrap_or_default(),
        }),
    })
}

fn part_from_row(row: &PgRow) -> Result<UploadPart, PartStoreError> {
    let key: String = row.try_get("part_key")?;
    let number: i32 = row.try_get("part_number")?;
    let size: i64 = row.try_get("size")?;
    let Json(locations): Json<Vec<Location>> = row.try_get("locations")?;
    let sse: Option<Json<SseInfo>> = row.try_get("sse")?;

    let corrupt = |reason: String| PartStoreError::Corrupt { key: key.clone(), reason };
    Ok(UploadPart {
        upload_id: row.try_get("upload_id")?,
        part_number: PartNumber::new(i64::from(number)).map_err(|e| corrupt(e.to_string()))?,
        size: u64::try_from(size).map_err(|e| corrupt(e.to_string()))?,
        content_md5: row.try_get("content_md5")?,
        locations,
        sse: sse.map(|Json(sse)| sse),
        last_modified: row.try_get("last_modified")?,
        key,
    })
}

#[async_trait::async_trait]
impl MetadataService for PostgresDatabase {
    #[tracing::instrument(level = "debug", skip(self, identity))]
    async fn authorize_bucket(&self, identity: &Identity, bucket: &str, request: RequestType) -> Result<Bucket, MetadataError> {
        let row = sqlx::query("SELECT name, owner, sse_algorithm, sse_master_key_id FROM buckets WHERE name = $1;")
            .bind(bucket)
            .fetch_optional(&self.db_conn)
            .instrument(debug_span!("db_select_bucket_info"))
            .await?;
        let Some(row) = row else {
            return Err(MetadataError::NoSuchBucket(bucket.to_owned()));
        };

        let bucket = bucket_from_row(&row)?;
        check_bucket_access(identity, &bucket)?;
        Ok(bucket)
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
        let row = sqlx::query(
            "SELECT u.initiator, b.owner FROM multipart_uploads u JOIN buckets b ON b.name = u.bucket \
             WHERE u.upload_id = $1 AND u.bucket = $2 AND u.oid = $3;",
        )
        .bind(upload_id)
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.db_conn)
        .instrument(debug_span!("db_select_multipart_upload"))
        .await?;
        let Some(row) = row else {
            return Err(MetadataError::NoSuchUpload(upload_id.to_owned()));
        };

        let initiator: String = row.try_get("initiator")?;
        let owner: String = row.try_get("owner")?;
        check_upload_access(identity, &initiator, &owner)
    }

    #[tracing::instrument(level = "debug", skip(self, _bucket))]
    async fn resolve_shadow_bucket(&self, _bucket: &Bucket, bucket_name: &str) -> Result<Option<ShadowBucket>, MetadataError> {
        let row = sqlx::query("SELECT name, schema_version FROM shadow_buckets WHERE name = $1;")
            .bind(ShadowBucket::name_for(bucket_name))
            .fetch_optional(&self.db_conn)
            .instrument(debug_span!("db_select_shadow_bucket"))
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ShadowBucket {
            name: row.try_get("name")?,
            model_version: row.try_get("schema_version")?,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, identity))]
    async fn initiate_upload(&self, identity: &Identity, bucket: &str, key: &str) -> Result<MultipartUpload, MetadataError> {
        let found = self.authorize_bucket(identity, bucket, RequestType::InitiateMultipartUpload).await?;
        let shadow_name = ShadowBucket::name_for(&found.name);

        let mut tx = self.db_conn.begin().instrument(debug_span!("db_begin_transaction")).await?;
        // existing shadow buckets keep the schema version they were created with
        sqlx::query("INSERT INTO shadow_buckets (name, bucket, schema_version) VALUES ($1, $2, $3) ON CONFLICT (name) DO NOTHING;")
            .bind(&shadow_name)
            .bind(&found.name)
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(&mut *tx)
            .instrument(debug_span!("db_insert_shadow_bucket"))
            .await?;

        let upload = MultipartUpload {
            bucket: found.name,
            oid: key.to_owned(),
            upload_id: Uuid::new_v4().simple().to_string(),
            initiator: identity.canonical_id.clone(),
            shadow_bucket: shadow_name,
        };
        sqlx::query(
            "INSERT INTO multipart_uploads (upload_id, bucket, oid, initiator, shadow_bucket, initiated_at) \
             VALUES ($1, $2, $3, $4, $5, CURRENT_TIMESTAMP);",
        )
        .bind(&upload.upload_id)
        .bind(&upload.bucket)
        .bind(&upload.oid)
        .bind(&upload.initiator)
        .bind(&upload.shadow_bucket)
        .execute(&mut *tx)
        .instrument(debug_span!("db_insert_multipart_upload"))
        .await?;

        tx.commit().instrument(debug_span!("db_commit_transaction")).await?;
        tracing::info!(upload_id = %upload.upload_id, "initiated multipart upload");
        Ok(upload)
    }
}

#[async_trait::async_trait]
impl PartStore for PostgresDatabase {
    #[tracing::instrument(level = "debug", skip(self, locations, metadata), fields(key))]
    async fn put_part(&self, shadow_bucket: &str, locations: Vec<Location>, metadata: PartMetadata) -> Result<(), PartStoreError> {
        let key = metadata.key();
        tracing::Span::current().record("key", key.as_str());

        // a single statement keeps the replacement atomic per key
        sqlx::query(
            "INSERT INTO mpu_parts (shadow_bucket, part_key, upload_id, part_number, size, content_md5, locations, sse, last_modified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, CURRENT_TIMESTAMP) \
             ON CONFLICT (shadow_bucket, part_key) DO UPDATE SET \
                upload_id = EXCLUDED.upload_id, \
                part_number = EXCLUDED.part_number, \
                size = EXCLUDED.size, \
                content_md5 = EXCLUDED.content_md5, \
                locations = EXCLUDED.locations, \
                sse = EXCLUDED.sse, \
                last_modified = EXCLUDED.last_modified;",
        )
        .bind(shadow_bucket)
        .bind(&key)
        .bind(&metadata.upload_id)
        .bind(i32::from(metadata.part_number.get()))
        .bind(metadata.size as i64)
        .bind(&metadata.content_md5)
        .bind(Json(&locations))
        .bind(metadata.sse.as_ref().map(Json))
        .execute(&self.db_conn)
        .instrument(debug_span!("db_upsert_part"))
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_parts(&self, shadow_bucket: &str, upload_id: &str, splitter: &str) -> Result<Vec<UploadPart>, PartStoreError> {
        let rows = sqlx::query(
            "SELECT part_key, upload_id, part_number, size, content_md5, locations, sse, last_modified FROM mpu_parts \
             WHERE shadow_bucket = $1 AND starts_with(part_key, $2) ORDER BY part_key ASC;",
        )
        .bind(shadow_bucket)
        .bind(upload_prefix(upload_id, splitter))
        .fetch_all(&self.db_conn)
        .instrument(debug_span!("db_select_parts"))
        .await?;

        rows.iter().map(part_from_row).collect()
    }
}
