use std::collections::HashMap;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::meta_store::EncryptionConfig;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub api: Api,
    pub auth: Auth,
    pub metadata: MetadataConfig,
    pub storage: Storage,
    #[serde(default)]
    pub kms: KmsConfig,
    /// Buckets registered at startup by the memory metadata backend.
    #[serde(default)]
    pub buckets: Vec<BucketSeed>,
}

#[derive(Debug, Deserialize)]
pub struct Api {
    pub host: String,
    pub port: u16,
    pub domain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Auth {
    pub access_key: String,
    pub secret_key: String,
    /// Canonical id requests signed with `access_key` act as.
    pub canonical_id: String,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct MetadataConfig {
    pub backend: MetadataBackend,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Upstream,
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct Storage {
    pub backend: StorageBackend,
    pub upstream: Option<UpstreamStorage>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamStorage {
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

fn default_region() -> String {
    "auto".to_owned()
}

#[derive(Debug, Default, Deserialize)]
pub struct KmsConfig {
    /// master key id -> hex encoded 256-bit key
    #[serde(default)]
    pub master_keys: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct BucketSeed {
    pub name: String,
    pub owner: String,
    pub encryption: Option<EncryptionConfig>,
}

impl Settings {
    pub fn new(config_path: &str) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Environment::with_prefix("S3INGEST").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    const SAMPLE: &str = r#"
api:
  host: 0.0.0.0
  port: 8014
auth:
  access_key: AKIAEXAMPLE
  secret_key: secret
  canonical_id: owner-canonical-id
metadata:
  backend: memory
storage:
  backend: upstream
  upstream:
    endpoint: http://localhost:9000
    access_key: minio
    secret_key: minio123
    bucket: parts
kms:
  master_keys:
    default: "0000000000000000000000000000000000000000000000000000000000000000"
buckets:
  - name: photos
    owner: owner-canonical-id
    encryption:
      algorithm: AES256
      master_key_id: default
  - name: logs
    owner: owner-canonical-id
"#;

    #[test]
    fn parses_yaml_settings() {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(SAMPLE, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.api.port, 8014);
        assert!(settings.api.domain.is_none());
        assert_eq!(settings.metadata.backend, MetadataBackend::Memory);
        assert_eq!(settings.storage.backend, StorageBackend::Upstream);
        let upstream = settings.storage.upstream.unwrap();
        assert_eq!(upstream.region, "auto");
        assert_eq!(upstream.bucket, "parts");
        assert_eq!(settings.kms.master_keys.len(), 1);
        assert_eq!(settings.buckets.len(), 2);
        assert_eq!(settings.buckets[0].encryption.as_ref().unwrap().master_key_id, "default");
        assert!(settings.buckets[1].encryption.is_none());
    }
}
