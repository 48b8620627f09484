//! `ObjectMetadataStorage` (spec §4.6): key-to-`S3ObjectInfo` mapping, with
//! three interchangeable backend shapes (in-memory, sibling-JSON files,
//! SQLite table) and stale-metadata detection wired through a `DataProbe`
//! so this module never depends on `ObjectDataStorage` directly (spec §9's
//! "cyclic references" design note resolves the facade/data/metadata
//! triangle into a one-way edge).

use std::{collections::BTreeMap, path::PathBuf, pin::Pin};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lamina_common::model::{Checksums, S3ObjectInfo, DEFAULT_CONTENT_TYPE};
use parking_lot::Mutex;
use tokio_stream::Stream;
use tracing::info;

/// A seam onto the data store that the metadata store needs only to
/// detect staleness and recompute an ETag -- never the reverse. Grounded
/// on `lamina-storage::data::ObjectDataStorage`, implemented by
/// `DataStorageProbe` below so the two crates don't need to know about
/// each other's full trait surface.
#[async_trait]
pub trait DataProbe: Send + Sync + std::fmt::Debug {
    async fn get_mtime(&self, bucket: &str, key: &str) -> anyhow::Result<Option<DateTime<Utc>>>;
    async fn compute_etag(&self, bucket: &str, key: &str) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct StoreMetadataRequest {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
    pub owner_id: Option<String>,
    pub owner_display_name: Option<String>,
    pub checksums: Option<Checksums>,
}

/// Object-safe so callers hold `Arc<dyn ObjectMetadataStorage>`.
#[async_trait]
pub trait ObjectMetadataStorage: Send + Sync + std::fmt::Debug {
    async fn store(&self, request: StoreMetadataRequest) -> anyhow::Result<()>;

    /// Returns `None` if data is missing (orphaned metadata is never
    /// returned). If the data's mtime has advanced past the stored
    /// `last_modified`, the ETag is recomputed and checksums cleared
    /// before returning (spec §4.6 stale-metadata detection).
    async fn get(&self, bucket: &str, key: &str, probe: &dyn DataProbe) -> anyhow::Result<Option<S3ObjectInfo>>;

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<bool>;

    /// Lazy, cancellation-aware iteration of every `(bucket, key)` pair
    /// this store has a record for, regardless of staleness.
    fn list_all(&self) -> Pin<Box<dyn Stream<Item = anyhow::Result<(String, String)>> + Send>>;
}

/// Shared staleness logic so every backend behaves identically -- backends
/// only need to provide raw get/put of the stored record.
async fn resolve_staleness(
    stored: S3ObjectInfo,
    bucket: &str,
    key: &str,
    probe: &dyn DataProbe,
) -> anyhow::Result<Option<S3ObjectInfo>> {
    let Some(mtime) = probe.get_mtime(bucket, key).await? else {
        return Ok(None);
    };
    if mtime <= stored.last_modified {
        return Ok(Some(stored));
    }

    info!(bucket, key, "metadata stale, recomputing ETag");
    let mut info = stored;
    match probe.compute_etag(bucket, key).await {
        Ok(Some(etag)) => info.etag = etag,
        Ok(None) => return Ok(None),
        Err(_) => { /* fall back to the stored ETag, per spec */ }
    }
    info.checksums.clear();
    info.last_modified = mtime;
    Ok(Some(info))
}

#[derive(Debug, Default)]
pub struct InMemoryMetadataStorage {
    records: DashMap<(String, String), S3ObjectInfo>,
}

impl InMemoryMetadataStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectMetadataStorage for InMemoryMetadataStorage {
    async fn store(&self, request: StoreMetadataRequest) -> anyhow::Result<()> {
        let info = S3ObjectInfo {
            key: request.key.clone(),
            size: request.size,
            last_modified: Utc::now(),
            etag: request.etag,
            content_type: request.content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            user_metadata: request.user_metadata,
            owner_id: request.owner_id,
            owner_display_name: request.owner_display_name,
            checksums: request.checksums.unwrap_or_default(),
        };
        self.records.insert((request.bucket, request.key), info);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str, probe: &dyn DataProbe) -> anyhow::Result<Option<S3ObjectInfo>> {
        let Some(stored) = self.records.get(&(bucket.to_string(), key.to_string())).map(|r| r.clone()) else {
            return Ok(None);
        };
        resolve_staleness(stored, bucket, key, probe).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self.records.remove(&(bucket.to_string(), key.to_string())).is_some())
    }

    fn list_all(&self) -> Pin<Box<dyn Stream<Item = anyhow::Result<(String, String)>> + Send>> {
        let pairs: Vec<_> = self.records.iter().map(|e| Ok(e.key().clone())).collect();
        Box::pin(tokio_stream::iter(pairs))
    }
}

/// Stores each record as `<metadata_root>/<bucket>/<key>.json`, the
/// sibling-tree shape from spec §6 option (a) (also usable for the inline
/// `.lamina-meta` shape (b) by pointing `metadata_root` at
/// `<data_root>/<bucket>/.lamina-meta`).
#[derive(Debug, Clone)]
pub struct JsonFileMetadataStorage {
    metadata_root: PathBuf,
}

impl JsonFileMetadataStorage {
    pub fn new(metadata_root: impl Into<PathBuf>) -> Self {
        Self {
            metadata_root: metadata_root.into(),
        }
    }

    fn record_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.metadata_root.join(bucket).join(format!("{key}.json"))
    }
}

#[async_trait]
impl ObjectMetadataStorage for JsonFileMetadataStorage {
    async fn store(&self, request: StoreMetadataRequest) -> anyhow::Result<()> {
        let info = S3ObjectInfo {
            key: request.key.clone(),
            size: request.size,
            last_modified: Utc::now(),
            etag: request.etag,
            content_type: request.content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            user_metadata: request.user_metadata,
            owner_id: request.owner_id,
            owner_display_name: request.owner_display_name,
            checksums: request.checksums.unwrap_or_default(),
        };
        let path = self.record_path(&request.bucket, &request.key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&info)?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str, probe: &dyn DataProbe) -> anyhow::Result<Option<S3ObjectInfo>> {
        let path = self.record_path(bucket, key);
        let stored = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<S3ObjectInfo>(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        resolve_staleness(stored, bucket, key, probe).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<bool> {
        let path = self.record_path(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn list_all(&self) -> Pin<Box<dyn Stream<Item = anyhow::Result<(String, String)>> + Send>> {
        let root = self.metadata_root.clone();
        Box::pin(async_stream_walk(root))
    }
}

fn async_stream_walk(root: PathBuf) -> impl Stream<Item = anyhow::Result<(String, String)>> {
    async_stream::stream! {
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => { yield Err(err.into()); continue; }
            };
            loop {
                match read_dir.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        match entry.file_type().await {
                            Ok(ft) if ft.is_dir() => stack.push(path),
                            Ok(_) => {
                                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                                    if let Some(key_name) = name.strip_suffix(".json") {
                                        let rel = path.strip_prefix(&root).unwrap();
                                        let bucket = rel.iter().next().and_then(|c| c.to_str()).unwrap_or("").to_string();
                                        let key_path = rel.strip_prefix(&bucket).unwrap_or(rel);
                                        let mut key = key_path.to_string_lossy().trim_start_matches('/').to_string();
                                        if key.is_empty() {
                                            key = key_name.to_string();
                                        } else {
                                            key = key.strip_suffix(".json").unwrap_or(&key).to_string();
                                        }
                                        yield Ok((bucket, key));
                                    }
                                }
                            },
                            Err(err) => yield Err(err.into()),
                        }
                    },
                    Ok(None) => break,
                    Err(err) => { yield Err(err.into()); break; }
                }
            }
        }
    }
}

/// SQLite-backed metadata table. The connection is wrapped in a
/// `parking_lot::Mutex` and queried synchronously, mirroring the
/// teacher's single-connection `SqlitePersistence`: local SQLite I/O is
/// fast enough that routing it through a blocking thread pool is not
/// worth the complexity.
#[derive(Debug)]
pub struct SqliteMetadataStorage {
    conn: Mutex<rusqlite::Connection>,
}

const CREATE_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS object_metadata (
    bucket TEXT NOT NULL,
    key TEXT NOT NULL,
    etag TEXT NOT NULL,
    size INTEGER NOT NULL,
    last_modified TEXT NOT NULL,
    content_type TEXT NOT NULL,
    user_metadata TEXT NOT NULL,
    owner_id TEXT,
    owner_display_name TEXT,
    checksums TEXT NOT NULL,
    PRIMARY KEY (bucket, key)
)";

impl SqliteMetadataStorage {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(CREATE_TABLE_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn row_to_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<S3ObjectInfo> {
        let user_metadata_json: String = row.get("user_metadata")?;
        let checksums_json: String = row.get("checksums")?;
        let last_modified_str: String = row.get("last_modified")?;
        Ok(S3ObjectInfo {
            key: row.get("key")?,
            size: row.get::<_, i64>("size")? as u64,
            last_modified: last_modified_str.parse().unwrap_or_else(|_| Utc::now()),
            etag: row.get("etag")?,
            content_type: row.get("content_type")?,
            user_metadata: serde_json::from_str(&user_metadata_json).unwrap_or_default(),
            owner_id: row.get("owner_id")?,
            owner_display_name: row.get("owner_display_name")?,
            checksums: serde_json::from_str(&checksums_json).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ObjectMetadataStorage for SqliteMetadataStorage {
    async fn store(&self, request: StoreMetadataRequest) -> anyhow::Result<()> {
        let now = Utc::now();
        let content_type = request.content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let user_metadata_json = serde_json::to_string(&request.user_metadata)?;
        let checksums_json = serde_json::to_string(&request.checksums.unwrap_or_default())?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO object_metadata (bucket, key, etag, size, last_modified, content_type, \
             user_metadata, owner_id, owner_display_name, checksums) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(bucket, key) DO UPDATE SET \
             etag = excluded.etag, size = excluded.size, last_modified = excluded.last_modified, \
             content_type = excluded.content_type, user_metadata = excluded.user_metadata, \
             owner_id = excluded.owner_id, owner_display_name = excluded.owner_display_name, \
             checksums = excluded.checksums",
            rusqlite::params![
                request.bucket,
                request.key,
                request.etag,
                request.size as i64,
                now.to_rfc3339(),
                content_type,
                user_metadata_json,
                request.owner_id,
                request.owner_display_name,
                checksums_json,
            ],
        )?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str, probe: &dyn DataProbe) -> anyhow::Result<Option<S3ObjectInfo>> {
        let stored = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT * FROM object_metadata WHERE bucket = ?1 AND key = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![bucket, key])?;
            match rows.next()? {
                Some(row) => Some(Self::row_to_info(row)?),
                None => None,
            }
        };
        let Some(stored) = stored else { return Ok(None) };
        resolve_staleness(stored, bucket, key, probe).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM object_metadata WHERE bucket = ?1 AND key = ?2",
            rusqlite::params![bucket, key],
        )?;
        Ok(affected > 0)
    }

    fn list_all(&self) -> Pin<Box<dyn Stream<Item = anyhow::Result<(String, String)>> + Send>> {
        let pairs: anyhow::Result<Vec<(String, String)>> = (|| {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT bucket, key FROM object_metadata")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })();
        match pairs {
            Ok(pairs) => Box::pin(tokio_stream::iter(pairs.into_iter().map(Ok))),
            Err(err) => Box::pin(tokio_stream::once(Err(err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedProbe {
        mtime: Option<DateTime<Utc>>,
        etag: Option<String>,
    }

    #[async_trait]
    impl DataProbe for FixedProbe {
        async fn get_mtime(&self, _bucket: &str, _key: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
            Ok(self.mtime)
        }
        async fn compute_etag(&self, _bucket: &str, _key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.etag.clone())
        }
    }

    fn basic_request() -> StoreMetadataRequest {
        StoreMetadataRequest {
            bucket: "b".into(),
            key: "k".into(),
            etag: "oldetag".into(),
            size: 3,
            content_type: None,
            user_metadata: BTreeMap::new(),
            owner_id: None,
            owner_display_name: None,
            checksums: Some(Checksums {
                sha256: Some("abc".into()),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn orphaned_metadata_is_hidden_when_data_missing() {
        let storage = InMemoryMetadataStorage::new();
        storage.store(basic_request()).await.unwrap();
        let probe = FixedProbe { mtime: None, etag: None };
        assert!(storage.get("b", "k", &probe).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_metadata_recomputes_etag_and_clears_checksums() {
        let storage = InMemoryMetadataStorage::new();
        storage.store(basic_request()).await.unwrap();
        let future_mtime = Utc::now() + chrono::Duration::seconds(3600);
        let probe = FixedProbe {
            mtime: Some(future_mtime),
            etag: Some("newetag".into()),
        };
        let info = storage.get("b", "k", &probe).await.unwrap().unwrap();
        assert_eq!(info.etag, "newetag");
        assert!(info.checksums.is_empty());
    }

    #[tokio::test]
    async fn fresh_metadata_returned_unchanged() {
        let storage = InMemoryMetadataStorage::new();
        storage.store(basic_request()).await.unwrap();
        let probe = FixedProbe {
            mtime: Some(Utc::now() - chrono::Duration::seconds(10)),
            etag: Some("shouldnotuse".into()),
        };
        let info = storage.get("b", "k", &probe).await.unwrap().unwrap();
        assert_eq!(info.etag, "oldetag");
        assert!(!info.checksums.is_empty());
    }

    #[tokio::test]
    async fn json_file_backend_round_trips_and_detects_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileMetadataStorage::new(dir.path());
        storage.store(basic_request()).await.unwrap();

        let fresh_probe = FixedProbe {
            mtime: Some(Utc::now() - chrono::Duration::seconds(10)),
            etag: None,
        };
        let info = storage.get("b", "k", &fresh_probe).await.unwrap().unwrap();
        assert_eq!(info.etag, "oldetag");

        assert!(storage.delete("b", "k").await.unwrap());
        assert!(storage.get("b", "k", &fresh_probe).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meta.sqlite3");
        let storage = SqliteMetadataStorage::open(db_path.to_str().unwrap()).unwrap();
        storage.store(basic_request()).await.unwrap();
        let probe = FixedProbe {
            mtime: Some(Utc::now() - chrono::Duration::seconds(10)),
            etag: None,
        };
        let info = storage.get("b", "k", &probe).await.unwrap().unwrap();
        assert_eq!(info.etag, "oldetag");
        assert_eq!(info.size, 3);
    }
}
