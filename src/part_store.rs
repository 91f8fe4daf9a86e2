//! Durable association of `(upload id, part number)` with stored locations.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

use crate::meta_store::{now_timestamp, Location, PartNumber, SseInfo, UploadPart};

/// Fields recorded for a part besides its locations.
#[derive(Debug, Clone)]
pub struct PartMetadata {
    pub part_number: PartNumber,
    pub content_md5: String,
    pub size: u64,
    pub upload_id: String,
    pub splitter: &'static str,
    pub sse: Option<SseInfo>,
}

impl PartMetadata {
    pub fn key(&self) -> String {
        part_key(&self.upload_id, self.splitter, self.part_number)
    }
}

/// `<upload id><splitter><zero-padded part number>`
pub fn part_key(upload_id: &str, splitter: &str, part_number: PartNumber) -> String {
    format!("{upload_id}{splitter}{}", part_number.padded())
}

/// Prefix shared by every part key of one upload.
pub fn upload_prefix(upload_id: &str, splitter: &str) -> String {
    format!("{upload_id}{splitter}")
}

#[derive(Debug, thiserror::Error)]
pub enum PartStoreError {
    #[error("part metadata database failure: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored part record {key} is malformed: {reason}")]
    Corrupt { key: String, reason: String },
}

#[async_trait::async_trait]
pub trait PartStore: Send + Sync + std::fmt::Debug + 'static {
    /// Writes the part record atomically, replacing any earlier record
    /// with the same key.
    async fn put_part(&self, shadow_bucket: &str, locations: Vec<Location>, metadata: PartMetadata) -> Result<(), PartStoreError>;

    /// Returns the parts of one upload in key order.
    async fn list_parts(&self, shadow_bucket: &str, upload_id: &str, splitter: &str) -> Result<Vec<UploadPart>, PartStoreError>;
}

/// Part records kept in process memory, ordered by key inside each
/// shadow bucket.
#[derive(Debug, Default)]
pub struct MemoryPartStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, UploadPart>>>,
}

impl MemoryPartStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, shadow_bucket: &str, key: &str) -> Option<UploadPart> {
        self.buckets.read().await.get(shadow_bucket)?.get(key).cloned()
    }

    pub async fn keys(&self, shadow_bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .await
            .get(shadow_bucket)
            .map(|parts| parts.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl PartStore for MemoryPartStore {
    #[tracing::instrument(level = "debug", skip(self, locations, metadata), fields(key))]
    async fn put_part(&self, shadow_bucket: &str, locations: Vec<Location>, metadata: PartMetadata) -> Result<(), PartStoreError> {
        let key = metadata.key();
        tracing::Span::current().record("key", key.as_str());

        let part = UploadPart {
            key: key.clone(),
            upload_id: metadata.upload_id,
            part_number: metadata.part_number,
            size: metadata.size,
            content_md5: metadata.content_md5,
            locations,
            sse: metadata.sse,
            last_modified: now_timestamp(),
        };
        self.buckets
            .write()
            .await
            .entry(shadow_bucket.to_owned())
            .or_default()
            .insert(key, part);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_parts(&self, shadow_bucket: &str, upload_id: &str, splitter: &str) -> Result<Vec<UploadPart>, PartStoreError> {
        let prefix = upload_prefix(upload_id, splitter);
        let buckets = self.buckets.read().await;
        let Some(parts) = buckets.get(shadow_bucket) else {
            return Ok(Vec::new());
        };
        Ok(parts
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, part)| part.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{OLD_SPLITTER, SPLITTER};

    fn metadata(upload_id: &str, part: i64, md5: &str) -> PartMetadata {
        PartMetadata {
            part_number: PartNumber::new(part).unwrap(),
            content_md5: md5.to_owned(),
            size: 10,
            upload_id: upload_id.to_owned(),
            splitter: SPLITTER,
            sse: None,
        }
    }

    fn location(key: &str) -> Location {
        Location {
            key: key.to_owned(),
            data_store_name: "memory".to_owned(),
            size: 10,
            data_store_etag: None,
        }
    }

    #[test]
    fn composed_keys() {
        let part = PartNumber::new(7).unwrap();
        assert_eq!(part_key("abc", SPLITTER, part), "abc..|..00007");
        assert_eq!(part_key("abc", OLD_SPLITTER, part), "abcsplitter00007");
    }

    #[tokio::test]
    async fn put_overwrites_whole_record() {
        let store = MemoryPartStore::new();
        store
            .put_part("shadow", vec![location("old-1"), location("old-2")], metadata("u", 3, "aaa"))
            .await
            .unwrap();
        store.put_part("shadow", vec![location("new")], metadata("u", 3, "bbb")).await.unwrap();

        let part = store.get("shadow", "u..|..00003").await.unwrap();
        assert_eq!(part.content_md5, "bbb");
        assert_eq!(part.locations, vec![location("new")]);
        assert_eq!(store.keys("shadow").await.len(), 1);
    }

    #[tokio::test]
    async fn list_is_in_part_order_and_scoped_to_upload() {
        let store = MemoryPartStore::new();
        for n in [12, 3, 100, 1] {
            store.put_part("shadow", vec![location("x")], metadata("u1", n, "m")).await.unwrap();
        }
        store.put_part("shadow", vec![location("y")], metadata("u2", 2, "m")).await.unwrap();

        let parts = store.list_parts("shadow", "u1", SPLITTER).await.unwrap();
        let numbers: Vec<u16> = parts.iter().map(|p| p.part_number.get()).collect();
        assert_eq!(numbers, [1, 3, 12, 100]);

        assert!(store.list_parts("other", "u1", SPLITTER).await.unwrap().is_empty());
        assert!(store.list_parts("shadow", "u1", OLD_SPLITTER).await.unwrap().is_empty());
    }
}
