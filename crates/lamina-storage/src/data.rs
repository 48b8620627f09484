//! `ObjectDataStorage` (spec §4.5): content-addressed byte store with
//! streaming put/get/copy, delimiter-aware listing, and ETag computation.
//! Data is the source of truth for the whole facade -- metadata is derived
//! from it, never the other way around.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    pin::Pin,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lamina_common::model::{BucketType, Checksums};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Fixed prefix for in-progress upload sidecar files, excluded from every
/// listing and rejected as a key segment (spec §4.5 invariants).
pub const TEMP_FILE_PREFIX: &str = ".lamina-tmp-";
/// Directory holding inline (filesystem option (b)) metadata sidecars.
pub const INLINE_METADATA_DIR: &str = ".lamina-meta";
/// Directory holding in-progress multipart parts.
pub const MULTIPART_DIR: &str = ".lamina-mpu";

#[derive(Debug, Clone)]
pub struct DataInfo {
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoreResult {
    pub size: u64,
    pub etag: String,
    pub checksums: Checksums,
    pub md5_digest: [u8; 16],
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    pub truncated: bool,
    pub start_after_next: Option<String>,
}

/// Which checksum algorithms to compute in the same pass as the MD5/ETag.
/// `None` entries are simply not computed; a client-supplied checksum is
/// compared against whichever algorithm it names.
#[derive(Debug, Clone, Default)]
pub struct ChecksumRequest {
    pub crc32: bool,
    pub sha1: bool,
    pub sha256: bool,
    /// Optional expected values to verify against what was computed;
    /// mismatch is surfaced by the caller as `BadDigest`.
    pub expected: Checksums,
}

/// Object-safe so callers hold `Arc<dyn ObjectDataStorage>` and pick a
/// backend at startup; stream parameters are therefore trait objects
/// rather than generic `AsyncRead`/`AsyncWrite` type parameters.
#[async_trait]
pub trait ObjectDataStorage: Send + Sync + std::fmt::Debug {
    /// Streams `source` into storage for `(bucket, key)`, computing MD5 and
    /// any requested checksums in one pass, then atomically publishing the
    /// result. Must be called while holding the write lock on the path.
    async fn store(
        &self,
        bucket: &str,
        key: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
        checksums: &ChecksumRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StoreResult>;

    /// Streams stored bytes to `sink`, optionally restricted to an
    /// inclusive byte range. Must be called while holding the read lock.
    async fn write_to_sink(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        range: Option<(u64, u64)>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64>;

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<bool>;

    async fn get_data_info(&self, bucket: &str, key: &str) -> anyhow::Result<Option<DataInfo>>;

    #[allow(clippy::too_many_arguments)]
    async fn list_keys(
        &self,
        bucket: &str,
        bucket_type: BucketType,
        prefix: &str,
        delimiter: Option<&str>,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> anyhow::Result<ListResult>;

    /// Server-side copy: a streamed read of the source into a fresh store
    /// call on the destination, so ETag semantics stay identical to a PUT.
    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StoreResult>;
}

/// Accumulates MD5 (always) plus whichever of CRC32/SHA1/SHA256 were
/// requested, over a single streamed pass.
struct HashAccumulator {
    md5: Md5,
    crc32: Option<crc32fast::Hasher>,
    sha1: Option<Sha1>,
    sha256: Option<Sha256>,
    size: u64,
}

impl HashAccumulator {
    fn new(req: &ChecksumRequest) -> Self {
        Self {
            md5: Md5::new(),
            crc32: req.crc32.then(crc32fast::Hasher::new),
            sha1: req.sha1.then(Sha1::new),
            sha256: req.sha256.then(Sha256::new),
            size: 0,
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        if let Some(h) = self.crc32.as_mut() {
            h.update(chunk);
        }
        if let Some(h) = self.sha1.as_mut() {
            h.update(chunk);
        }
        if let Some(h) = self.sha256.as_mut() {
            h.update(chunk);
        }
        self.size += chunk.len() as u64;
    }

    fn finish(self) -> (u64, [u8; 16], Checksums) {
        let digest: [u8; 16] = self.md5.finalize().into();
        let checksums = Checksums {
            crc32: self.crc32.map(|h| {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(h.finalize().to_be_bytes())
            }),
            crc32c: None,
            crc64nvme: None,
            sha1: self.sha1.map(|h| {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(h.finalize())
            }),
            sha256: self.sha256.map(|h| {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(h.finalize())
            }),
        };
        (self.size, digest, checksums)
    }
}

fn check_against_expected(computed: &Checksums, expected: &Checksums) -> anyhow::Result<()> {
    let mismatch = |name: &str| {
        Err(anyhow::Error::new(lamina_common::error::S3Error::bad_digest(format!(
            "{name} checksum does not match computed value"
        ))))
    };
    if let Some(want) = &expected.crc32 {
        if computed.crc32.as_deref() != Some(want.as_str()) {
            return mismatch("CRC32");
        }
    }
    if let Some(want) = &expected.sha1 {
        if computed.sha1.as_deref() != Some(want.as_str()) {
            return mismatch("SHA1");
        }
    }
    if let Some(want) = &expected.sha256 {
        if computed.sha256.as_deref() != Some(want.as_str()) {
            return mismatch("SHA256");
        }
    }
    Ok(())
}

/// Filesystem-backed implementation: `<data_root>/<bucket>/<key>` for
/// published objects, `<data_root>/<bucket>/.lamina-tmp-<uuid>` for
/// in-progress writes (spec §6 persisted-state layout).
#[derive(Debug, Clone)]
pub struct FilesystemDataStorage {
    data_root: PathBuf,
}

impl FilesystemDataStorage {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.data_root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(key)
    }

    fn temp_path(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket)
            .join(format!("{TEMP_FILE_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Excluded from any listing or HEAD result (spec §4.5, invariant 8).
    fn is_hidden_entry(name: &str) -> bool {
        name.starts_with(TEMP_FILE_PREFIX) || name == INLINE_METADATA_DIR || name == MULTIPART_DIR
    }
}

#[async_trait]
impl ObjectDataStorage for FilesystemDataStorage {
    async fn store(
        &self,
        bucket: &str,
        key: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
        checksums: &ChecksumRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StoreResult> {
        let bucket_dir = self.bucket_dir(bucket);
        tokio::fs::create_dir_all(&bucket_dir).await?;
        let temp_path = self.temp_path(bucket);
        let final_path = self.object_path(bucket, key);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            let mut hasher = HashAccumulator::new(checksums);
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = tokio::select! {
                    n = source.read(&mut buf) => n?,
                    _ = cancel.cancelled() => anyhow::bail!("store cancelled for {bucket}/{key}"),
                };
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
            }
            file.flush().await?;
            let (size, digest, computed) = hasher.finish();
            check_against_expected(&computed, &checksums.expected)?;
            Ok::<_, anyhow::Error>((size, digest, computed))
        }
        .await;

        let (size, digest, computed_checksums) = match result {
            Ok(v) => v,
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        tokio::fs::rename(&temp_path, &final_path).await?;

        Ok(StoreResult {
            size,
            etag: hex::encode(digest),
            checksums: computed_checksums,
            md5_digest: digest,
        })
    }

    async fn write_to_sink(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        range: Option<(u64, u64)>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        let path = self.object_path(bucket, key);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| lamina_common::error::S3Error::no_such_key(key))?;
        let metadata = file.metadata().await?;
        let total_size = metadata.len();

        let (start, end) = match range {
            Some((s, e)) => {
                if s > e || s >= total_size {
                    anyhow::bail!(lamina_common::error::S3Error::invalid_range(format!(
                        "range {s}-{e} unsatisfiable for object of size {total_size}"
                    )));
                }
                (s, std::cmp::min(e, total_size.saturating_sub(1)))
            }
            None => (0, total_size.saturating_sub(1)),
        };

        use tokio::io::AsyncSeekExt;
        file.seek(std::io::SeekFrom::Start(start)).await?;

        let mut remaining = if total_size == 0 { 0 } else { end - start + 1 };
        let mut buf = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        while remaining > 0 {
            let want = std::cmp::min(remaining, buf.len() as u64) as usize;
            let n = tokio::select! {
                n = file.read(&mut buf[..want]) => n?,
                _ = cancel.cancelled() => anyhow::bail!("write_to_sink cancelled for {bucket}/{key}"),
            };
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await?;
            written += n as u64;
            remaining -= n as u64;
        }
        sink.flush().await?;
        Ok(written)
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<bool> {
        let path = self.object_path(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_data_info(&self, bucket: &str, key: &str) -> anyhow::Result<Option<DataInfo>> {
        let path = self.object_path(bucket, key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(DataInfo {
                size: meta.len(),
                mtime: meta.modified()?.into(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_keys(
        &self,
        bucket: &str,
        bucket_type: BucketType,
        prefix: &str,
        delimiter: Option<&str>,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> anyhow::Result<ListResult> {
        let bucket_dir = self.bucket_dir(bucket);
        if tokio::fs::metadata(&bucket_dir).await.is_err() {
            return Ok(ListResult::default());
        }

        if delimiter == Some("/") {
            return self
                .list_with_slash_delimiter(&bucket_dir, prefix, start_after, max_keys)
                .await;
        }

        // Any other delimiter (or none): correctness over speed, full tree walk.
        let mut all_keys = Vec::new();
        walk_all_keys(&bucket_dir, &bucket_dir, &mut all_keys).await?;

        if !matches!(bucket_type, BucketType::Directory) {
            all_keys.sort();
        }

        let mut common_prefixes: Vec<String> = Vec::new();
        let mut keys: Vec<String> = Vec::new();
        let mut seen_prefixes = std::collections::BTreeSet::new();

        for key in all_keys {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(after) = start_after {
                if key.as_str() <= after {
                    continue;
                }
            }
            if let Some(delim) = delimiter {
                let rest = &key[prefix.len()..];
                if let Some(idx) = rest.find(delim) {
                    let common = format!("{}{}", prefix, &rest[..idx + delim.len()]);
                    if seen_prefixes.insert(common.clone()) {
                        common_prefixes.push(common);
                    }
                    continue;
                }
            }
            keys.push(key);
        }

        if !matches!(bucket_type, BucketType::Directory) {
            common_prefixes.sort();
        }

        let total = keys.len() + common_prefixes.len();
        let truncated = total > max_keys;
        let mut start_after_next = None;
        if truncated {
            // Truncate the union in encounter order, preferring keys first
            // to match the examples' listing order (keys then prefixes).
            let mut combined: Vec<String> = keys.iter().cloned().chain(common_prefixes.iter().cloned()).collect();
            combined.truncate(max_keys);
            start_after_next = combined.last().cloned();
            let keep_keys = keys.len().min(max_keys);
            common_prefixes.truncate(max_keys - keep_keys);
            keys.truncate(keep_keys);
        }

        Ok(ListResult {
            keys,
            common_prefixes,
            truncated,
            start_after_next,
        })
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StoreResult> {
        let src_path = self.object_path(src_bucket, src_key);
        let mut src = tokio::fs::File::open(&src_path)
            .await
            .map_err(|_| lamina_common::error::S3Error::no_such_key(src_key))?;
        self.store(dst_bucket, dst_key, &mut src, &ChecksumRequest::default(), cancel)
            .await
    }
}

impl FilesystemDataStorage {
    /// Enumerates only the single directory corresponding to the longest
    /// prefix of `prefix` ending in `/`, per spec §4.5's optimization.
    async fn list_with_slash_delimiter(
        &self,
        bucket_dir: &Path,
        prefix: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> anyhow::Result<ListResult> {
        let dir_prefix = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx + 1],
            None => "",
        };
        let scan_dir = bucket_dir.join(dir_prefix);

        let mut entries: Vec<(String, bool)> = Vec::new(); // (name, is_dir)
        if let Ok(mut read_dir) = tokio::fs::read_dir(&scan_dir).await {
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if Self::is_hidden_entry(&name) {
                    continue;
                }
                let is_dir = entry.file_type().await?.is_dir();
                entries.push((name, is_dir));
            }
        }
        entries.sort();

        let mut keys = Vec::new();
        let mut common_prefixes = Vec::new();
        for (name, is_dir) in entries {
            let full_key = format!("{dir_prefix}{name}");
            if !full_key.starts_with(prefix) {
                continue;
            }
            if let Some(after) = start_after {
                if full_key.as_str() <= after {
                    continue;
                }
            }
            if is_dir {
                common_prefixes.push(format!("{full_key}/"));
            } else {
                keys.push(full_key);
            }
        }

        let total = keys.len() + common_prefixes.len();
        let truncated = total > max_keys;
        let mut start_after_next = None;
        if truncated {
            let keep_keys = keys.len().min(max_keys);
            common_prefixes.truncate(max_keys - keep_keys);
            keys.truncate(keep_keys);
            start_after_next = keys.last().or(common_prefixes.last()).cloned();
        }

        Ok(ListResult {
            keys,
            common_prefixes,
            truncated,
            start_after_next,
        })
    }
}

fn walk_all_keys<'a>(
    root: &'a Path,
    dir: &'a Path,
    out: &'a mut Vec<String>,
) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if FilesystemDataStorage::is_hidden_entry(&name) {
                continue;
            }
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                walk_all_keys(root, &path, out).await?;
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
                out.push(rel);
            }
        }
        Ok(())
    })
}

/// In-memory backend for tests and the `--metadata-backend memory`
/// development mode; never persists across process restarts.
#[derive(Debug, Default)]
pub struct InMemoryDataStorage {
    objects: DashMap<(String, String), (Vec<u8>, DateTime<Utc>)>,
}

impl InMemoryDataStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectDataStorage for InMemoryDataStorage {
    async fn store(
        &self,
        bucket: &str,
        key: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
        checksums: &ChecksumRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StoreResult> {
        let mut data = Vec::new();
        tokio::select! {
            result = source.read_to_end(&mut data) => { result?; }
            _ = cancel.cancelled() => anyhow::bail!("store cancelled for {bucket}/{key}"),
        };
        let mut hasher = HashAccumulator::new(checksums);
        hasher.update(&data);
        let (size, digest, computed) = hasher.finish();
        check_against_expected(&computed, &checksums.expected)?;
        self.objects
            .insert((bucket.to_string(), key.to_string()), (data, Utc::now()));
        Ok(StoreResult {
            size,
            etag: hex::encode(digest),
            checksums: computed,
            md5_digest: digest,
        })
    }

    async fn write_to_sink(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        range: Option<(u64, u64)>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        let entry = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| lamina_common::error::S3Error::no_such_key(key))?;
        let data = &entry.0;
        let (start, end) = match range {
            Some((s, e)) => {
                if s > e || (s as usize) >= data.len() {
                    anyhow::bail!(lamina_common::error::S3Error::invalid_range(format!(
                        "range {s}-{e} unsatisfiable for object of size {}",
                        data.len()
                    )));
                }
                (s as usize, std::cmp::min(e as usize, data.len().saturating_sub(1)))
            }
            None => (0, data.len().saturating_sub(1)),
        };
        let slice = if data.is_empty() { &data[..] } else { &data[start..=end] };
        sink.write_all(slice).await?;
        sink.flush().await?;
        Ok(slice.len() as u64)
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self.objects.remove(&(bucket.to_string(), key.to_string())).is_some())
    }

    async fn get_data_info(&self, bucket: &str, key: &str) -> anyhow::Result<Option<DataInfo>> {
        Ok(self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| DataInfo {
                size: entry.0.len() as u64,
                mtime: entry.1,
            }))
    }

    async fn list_keys(
        &self,
        bucket: &str,
        _bucket_type: BucketType,
        prefix: &str,
        delimiter: Option<&str>,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> anyhow::Result<ListResult> {
        let mut all_keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        all_keys.sort();

        let mut keys = Vec::new();
        let mut common_prefixes = BTreeMap::new();
        for key in all_keys {
            if let Some(after) = start_after {
                if key.as_str() <= after {
                    continue;
                }
            }
            if let Some(delim) = delimiter {
                let rest = &key[prefix.len()..];
                if let Some(idx) = rest.find(delim) {
                    let common = format!("{}{}", prefix, &rest[..idx + delim.len()]);
                    common_prefixes.entry(common).or_insert(());
                    continue;
                }
            }
            keys.push(key);
        }
        let mut common_prefixes: Vec<String> = common_prefixes.into_keys().collect();

        let total = keys.len() + common_prefixes.len();
        let truncated = total > max_keys;
        let mut start_after_next = None;
        if truncated {
            let keep_keys = keys.len().min(max_keys);
            common_prefixes.truncate(max_keys - keep_keys);
            keys.truncate(keep_keys);
            start_after_next = keys.last().or(common_prefixes.last()).cloned();
        }

        Ok(ListResult {
            keys,
            common_prefixes,
            truncated,
            start_after_next,
        })
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StoreResult> {
        let data = self
            .objects
            .get(&(src_bucket.to_string(), src_key.to_string()))
            .ok_or_else(|| lamina_common::error::S3Error::no_such_key(src_key))?
            .0
            .clone();
        let mut cursor = std::io::Cursor::new(data);
        self.store(dst_bucket, dst_key, &mut cursor, &ChecksumRequest::default(), cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_bytes(storage: &FilesystemDataStorage, bucket: &str, key: &str, body: &[u8]) -> StoreResult {
        let mut cursor = std::io::Cursor::new(body.to_vec());
        storage
            .store(bucket, key, &mut cursor, &ChecksumRequest::default(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn simple_put_etag_matches_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemDataStorage::new(dir.path());
        let result = store_bytes(&storage, "b", "k", b"Hello World").await;
        assert_eq!(result.etag, "b10a8db164e0754105b7a99be72e3fe5");
        assert_eq!(result.size, 11);
    }

    #[tokio::test]
    async fn get_after_put_returns_exact_bytes_and_temp_file_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemDataStorage::new(dir.path());
        store_bytes(&storage, "b", "k", b"payload").await;

        let mut out = Vec::new();
        storage
            .write_to_sink("b", "k", &mut out, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, b"payload");

        let mut remaining_entries = tokio::fs::read_dir(dir.path().join("b")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = remaining_entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn range_read_is_inclusive_and_out_of_range_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemDataStorage::new(dir.path());
        store_bytes(&storage, "b", "k", b"0123456789").await;

        let mut out = Vec::new();
        storage
            .write_to_sink("b", "k", &mut out, Some((2, 4)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, b"234");

        let mut out = Vec::new();
        let err = storage
            .write_to_sink("b", "k", &mut out, Some((100, 200)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(lamina_common::error::classify(&err).kind, lamina_common::error::S3ErrorKind::InvalidRange);
    }

    #[tokio::test]
    async fn missing_key_returns_no_such_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemDataStorage::new(dir.path());
        let mut out = Vec::new();
        let err = storage
            .write_to_sink("b", "missing", &mut out, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(lamina_common::error::classify(&err).kind, lamina_common::error::S3ErrorKind::NoSuchKey);
    }

    #[tokio::test]
    async fn delimiter_listing_matches_scenario_four() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemDataStorage::new(dir.path());
        for key in [
            "a/b/c/f1",
            "a/b/c/f2",
            "a/b/cat/f",
            "a/b/coffee/f",
            "a/b/c_important.log",
        ] {
            store_bytes(&storage, "b", key, b"x").await;
        }

        let result = storage
            .list_keys("b", BucketType::GeneralPurpose, "a/b/c", Some("/"), None, 1000)
            .await
            .unwrap();
        assert_eq!(result.keys, vec!["a/b/c_important.log".to_string()]);
        let mut prefixes = result.common_prefixes;
        prefixes.sort();
        assert_eq!(
            prefixes,
            vec!["a/b/c/".to_string(), "a/b/cat/".to_string(), "a/b/coffee/".to_string()]
        );
    }

    #[tokio::test]
    async fn temp_files_never_appear_in_listings() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemDataStorage::new(dir.path());
        store_bytes(&storage, "b", "k", b"x").await;
        tokio::fs::write(dir.path().join("b").join(format!("{TEMP_FILE_PREFIX}leftover")), b"junk")
            .await
            .unwrap();

        let result = storage
            .list_keys("b", BucketType::GeneralPurpose, "", None, None, 1000)
            .await
            .unwrap();
        assert_eq!(result.keys, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn cancellation_during_store_leaves_no_temp_file() {
        struct NeverReady;
        impl AsyncRead for NeverReady {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Pending
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemDataStorage::new(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = NeverReady;
        let err = storage
            .store("b", "k", &mut source, &ChecksumRequest::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));

        let entries = tokio::fs::read_dir(dir.path().join("b")).await;
        if let Ok(mut rd) = entries {
            assert!(rd.next_entry().await.unwrap().is_none());
        }
    }
}
