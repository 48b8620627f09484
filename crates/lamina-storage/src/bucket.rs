//! `BucketStorage`: bucket lifecycle and tag CRUD. Data-first, matching the
//! object stores in this crate: a bucket's existence is its directory under
//! the data root, not a row in a side table. A JSON sidecar at
//! `<data_root>/<bucket>/.lamina-bucket.json` carries the fields a bare
//! directory can't (creation date if the dir predates this server, storage
//! class, tags, owner); when the sidecar is missing we synthesize a `Bucket`
//! from the directory itself, same spirit as object metadata repair.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lamina_common::{
    error::S3Error,
    model::{validate_bucket_name, Bucket, BucketType},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::data::ObjectDataStorage;

const SIDECAR_NAME: &str = ".lamina-bucket.json";

#[derive(Debug, Serialize, Deserialize)]
struct BucketSidecar {
    creation_date: DateTime<Utc>,
    bucket_type: BucketType,
    storage_class: Option<String>,
    tags: BTreeMap<String, String>,
    owner_id: Option<String>,
    owner_display_name: Option<String>,
}

impl BucketSidecar {
    fn into_bucket(self, name: String) -> Bucket {
        Bucket {
            name,
            creation_date: self.creation_date,
            bucket_type: self.bucket_type,
            storage_class: self.storage_class,
            tags: self.tags,
            owner_id: self.owner_id,
            owner_display_name: self.owner_display_name,
        }
    }

    fn from_bucket(bucket: &Bucket) -> Self {
        Self {
            creation_date: bucket.creation_date,
            bucket_type: bucket.bucket_type,
            storage_class: bucket.storage_class.clone(),
            tags: bucket.tags.clone(),
            owner_id: bucket.owner_id.clone(),
            owner_display_name: bucket.owner_display_name.clone(),
        }
    }
}

/// Object-safe; callers hold `Arc<dyn BucketStorage>`.
#[async_trait]
pub trait BucketStorage: Send + Sync + std::fmt::Debug {
    async fn create(&self, name: &str, bucket_type: BucketType, owner_id: Option<String>, owner_display_name: Option<String>) -> anyhow::Result<Bucket>;
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
    async fn get(&self, name: &str) -> anyhow::Result<Option<Bucket>>;
    async fn list(&self) -> anyhow::Result<Vec<Bucket>>;
    async fn put_tags(&self, name: &str, tags: BTreeMap<String, String>) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct FilesystemBucketStorage {
    data_root: PathBuf,
    data: Arc<dyn ObjectDataStorage>,
}

impl FilesystemBucketStorage {
    pub fn new(data_root: impl Into<PathBuf>, data: Arc<dyn ObjectDataStorage>) -> Self {
        Self {
            data_root: data_root.into(),
            data,
        }
    }

    fn bucket_dir(&self, name: &str) -> PathBuf {
        self.data_root.join(name)
    }

    fn sidecar_path(&self, name: &str) -> PathBuf {
        self.bucket_dir(name).join(SIDECAR_NAME)
    }

    async fn read_sidecar(&self, name: &str) -> anyhow::Result<Option<BucketSidecar>> {
        match tokio::fs::read(self.sidecar_path(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_sidecar(&self, name: &str, sidecar: &BucketSidecar) -> anyhow::Result<()> {
        let path = self.sidecar_path(name);
        let temp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(sidecar)?;
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    /// Synthesizes a `Bucket` for a directory that has no sidecar yet, using
    /// the directory's own mtime as the creation date.
    async fn synthesize_bucket(&self, name: &str) -> anyhow::Result<Bucket> {
        let metadata = tokio::fs::metadata(self.bucket_dir(name)).await?;
        let mtime = metadata.modified().unwrap_or_else(|_| std::time::SystemTime::now());
        Ok(Bucket::new(name.to_string(), DateTime::<Utc>::from(mtime)))
    }
}

#[async_trait]
impl BucketStorage for FilesystemBucketStorage {
    async fn create(&self, name: &str, bucket_type: BucketType, owner_id: Option<String>, owner_display_name: Option<String>) -> anyhow::Result<Bucket> {
        validate_bucket_name(name).map_err(S3Error::invalid_argument)?;
        let dir = self.bucket_dir(name);
        if tokio::fs::metadata(&dir).await.is_ok() {
            anyhow::bail!(S3Error::bucket_already_exists(name));
        }
        tokio::fs::create_dir_all(&dir).await?;

        let mut bucket = Bucket::new(name.to_string(), Utc::now());
        bucket.bucket_type = bucket_type;
        bucket.owner_id = owner_id;
        bucket.owner_display_name = owner_display_name;
        self.write_sidecar(name, &BucketSidecar::from_bucket(&bucket)).await?;
        Ok(bucket)
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let dir = self.bucket_dir(name);
        if tokio::fs::metadata(&dir).await.is_err() {
            anyhow::bail!(S3Error::no_such_bucket(name));
        }

        let bucket = self.get(name).await?.unwrap_or_else(|| Bucket::new(name.to_string(), Utc::now()));
        let listing = self
            .data
            .list_keys(name, bucket.bucket_type, "", None, None, 1)
            .await?;
        if !listing.keys.is_empty() || !listing.common_prefixes.is_empty() {
            anyhow::bail!(S3Error::bucket_not_empty(name));
        }

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<Bucket>> {
        if tokio::fs::metadata(self.bucket_dir(name)).await.is_err() {
            return Ok(None);
        }
        match self.read_sidecar(name).await? {
            Some(sidecar) => Ok(Some(sidecar.into_bucket(name.to_string()))),
            None => Ok(Some(self.synthesize_bucket(name).await?)),
        }
    }

    async fn list(&self) -> anyhow::Result<Vec<Bucket>> {
        let mut buckets = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.data_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(bucket) = self.get(&name).await? {
                buckets.push(bucket);
            }
        }
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn put_tags(&self, name: &str, tags: BTreeMap<String, String>) -> anyhow::Result<()> {
        let mut bucket = self.get(name).await?.ok_or_else(|| S3Error::no_such_bucket(name))?;
        bucket.tags = tags;
        self.write_sidecar(name, &BucketSidecar::from_bucket(&bucket)).await
    }
}
