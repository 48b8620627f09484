//! `MultipartUploadStorage` (spec §4.7): initiate/part/complete/abort state
//! machine, part ETag validation, and multipart ETag composition.

use std::{
    collections::{BTreeMap, VecDeque},
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use lamina_common::{
    error::S3Error,
    model::{compose_multipart_etag, Checksums, MultipartUpload, PartMetadata, DEFAULT_CONTENT_TYPE},
};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::data::{ChecksumRequest, ObjectDataStorage, StoreResult};

#[derive(Debug, Clone)]
pub struct CompletedPartSpec {
    pub part_number: u16,
    pub etag: String,
}

struct UploadState {
    record: MultipartUpload,
    parts: Mutex<BTreeMap<u16, (PartMetadata, PathBuf)>>,
}

/// Object-safe; callers hold `Arc<dyn MultipartUploadStorage>`.
#[async_trait]
pub trait MultipartUploadStorage: Send + Sync + std::fmt::Debug {
    #[allow(clippy::too_many_arguments)]
    async fn initiate(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        user_metadata: BTreeMap<String, String>,
        checksum_algorithm: Option<String>,
    ) -> anyhow::Result<String>;

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u16,
        source: &mut (dyn AsyncRead + Unpin + Send),
        cancel: &CancellationToken,
    ) -> anyhow::Result<PartMetadata>;

    /// Validates requested parts against stored parts, assembles them in
    /// order into `data`, composes the multipart ETag, and clears all part
    /// state for `upload_id`. Returns the published object's store result
    /// (with `etag` overwritten to the multipart form) plus the consumed
    /// upload record (for inherited content-type/user-metadata).
    async fn complete(
        &self,
        upload_id: &str,
        requested_parts: &[CompletedPartSpec],
        data: &dyn ObjectDataStorage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(StoreResult, MultipartUpload)>;

    async fn abort(&self, upload_id: &str) -> anyhow::Result<bool>;

    async fn list_uploads(&self, bucket: &str) -> anyhow::Result<Vec<MultipartUpload>>;

    async fn list_parts(&self, upload_id: &str) -> anyhow::Result<Vec<PartMetadata>>;
}

/// Reads a sequence of files back to back, advancing to the next once the
/// current one hits EOF. Used by `complete` to stream parts, in order,
/// into a single `ObjectDataStorage::store` call without buffering the
/// whole object in memory.
struct ChainedPartReader {
    files: VecDeque<tokio::fs::File>,
}

impl ChainedPartReader {
    async fn open(paths: &[PathBuf]) -> anyhow::Result<Self> {
        let mut files = VecDeque::new();
        for path in paths {
            files.push_back(tokio::fs::File::open(path).await?);
        }
        Ok(Self { files })
    }
}

impl AsyncRead for ChainedPartReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut tokio::io::ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            let Some(front) = this.files.front_mut() else {
                return Poll::Ready(Ok(()));
            };
            let before = buf.filled().len();
            match Pin::new(front).poll_read(cx, buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Ready(Ok(())) => {
                    if buf.filled().len() == before {
                        this.files.pop_front();
                        continue;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

/// Filesystem-backed multipart store: parts at
/// `<data_root>/<bucket>/.lamina-mpu/<upload_id>/<part_number>`. The
/// upload registry itself (which uploads are open, and each part's
/// metadata) lives in memory -- acceptable since an in-flight multipart
/// upload is scoped to a single server's lifetime, same as the reference.
#[derive(Debug)]
pub struct FilesystemMultipartStorage {
    data_root: PathBuf,
    uploads: DashMap<String, UploadState>,
}

impl std::fmt::Debug for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadState").field("record", &self.record).finish()
    }
}

impl FilesystemMultipartStorage {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            uploads: DashMap::new(),
        }
    }

    fn upload_dir(&self, bucket: &str, upload_id: &str) -> PathBuf {
        self.data_root.join(bucket).join(".lamina-mpu").join(upload_id)
    }

    fn part_path(&self, bucket: &str, upload_id: &str, part_number: u16) -> PathBuf {
        self.upload_dir(bucket, upload_id).join(part_number.to_string())
    }
}

#[async_trait]
impl MultipartUploadStorage for FilesystemMultipartStorage {
    async fn initiate(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        user_metadata: BTreeMap<String, String>,
        checksum_algorithm: Option<String>,
    ) -> anyhow::Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        let record = MultipartUpload {
            upload_id: upload_id.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            initiated: Utc::now(),
            content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            user_metadata,
            checksum_algorithm,
        };
        tokio::fs::create_dir_all(self.upload_dir(bucket, &upload_id)).await?;
        self.uploads.insert(
            upload_id.clone(),
            UploadState {
                record,
                parts: Mutex::new(BTreeMap::new()),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u16,
        source: &mut (dyn AsyncRead + Unpin + Send),
        cancel: &CancellationToken,
    ) -> anyhow::Result<PartMetadata> {
        anyhow::ensure!(
            (1..=10_000).contains(&part_number),
            S3Error::invalid_argument(format!("part number {part_number} out of range 1-10000"))
        );
        let state = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| S3Error::no_such_upload(upload_id))?;
        let bucket = state.record.bucket.clone();
        drop(state);

        let part_path = self.part_path(&bucket, upload_id, part_number);
        if let Some(parent) = part_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = part_path.with_extension("tmp");

        let (size, digest) = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            let mut hasher = Md5::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut size = 0u64;
            loop {
                let n = tokio::select! {
                    n = source.read(&mut buf) => n?,
                    _ = cancel.cancelled() => anyhow::bail!("upload_part cancelled for {upload_id}/{part_number}"),
                };
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                size += n as u64;
            }
            file.flush().await?;
            Ok::<_, anyhow::Error>((size, hasher.finalize()))
        }
        .await
        .inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_path);
        })?;

        tokio::fs::rename(&temp_path, &part_path).await?;

        let metadata = PartMetadata {
            part_number,
            etag: hex::encode(digest),
            size,
            last_modified: Utc::now(),
            checksums: Checksums::default(),
        };

        let state = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| S3Error::no_such_upload(upload_id))?;
        state.parts.lock().insert(part_number, (metadata.clone(), part_path));
        Ok(metadata)
    }

    async fn complete(
        &self,
        upload_id: &str,
        requested_parts: &[CompletedPartSpec],
        data: &dyn ObjectDataStorage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(StoreResult, MultipartUpload)> {
        let state = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| S3Error::no_such_upload(upload_id))?;
        let record = state.record.clone();
        let stored_parts = state.parts.lock().clone();
        drop(state);

        anyhow::ensure!(!stored_parts.is_empty(), S3Error::no_such_upload(upload_id));

        let mut ordered_paths = Vec::with_capacity(requested_parts.len());
        let mut digests = Vec::with_capacity(requested_parts.len());
        let mut prev_part_number = 0u16;
        for requested in requested_parts {
            anyhow::ensure!(
                requested.part_number > prev_part_number,
                S3Error::invalid_part_order("part numbers must be strictly ascending")
            );
            prev_part_number = requested.part_number;

            let (stored_meta, path) = stored_parts
                .get(&requested.part_number)
                .ok_or_else(|| S3Error::invalid_part(format!("part {} was not uploaded", requested.part_number)))?;

            let requested_etag = requested.etag.trim_matches('"');
            anyhow::ensure!(
                requested_etag.eq_ignore_ascii_case(&stored_meta.etag),
                S3Error::invalid_part(format!("etag mismatch for part {}", requested.part_number))
            );

            let mut digest_bytes = [0u8; 16];
            hex::decode_to_slice(&stored_meta.etag, &mut digest_bytes)
                .map_err(|_| S3Error::internal("stored part etag is not valid hex"))?;
            digests.push(digest_bytes);
            ordered_paths.push(path.clone());
        }

        let mut reader = ChainedPartReader::open(&ordered_paths).await?;
        let mut store_result = data
            .store(&record.bucket, &record.key, &mut reader, &ChecksumRequest::default(), cancel)
            .await?;
        store_result.etag = compose_multipart_etag(&digests);

        self.uploads.remove(upload_id);
        tokio::fs::remove_dir_all(self.upload_dir(&record.bucket, upload_id))
            .await
            .ok();

        Ok((store_result, record))
    }

    async fn abort(&self, upload_id: &str) -> anyhow::Result<bool> {
        let Some((_, state)) = self.uploads.remove(upload_id) else {
            return Ok(false);
        };
        tokio::fs::remove_dir_all(self.upload_dir(&state.record.bucket, upload_id))
            .await
            .ok();
        Ok(true)
    }

    async fn list_uploads(&self, bucket: &str) -> anyhow::Result<Vec<MultipartUpload>> {
        let mut uploads: Vec<MultipartUpload> = self
            .uploads
            .iter()
            .filter(|entry| entry.record.bucket == bucket)
            .map(|entry| entry.record.clone())
            .collect();
        uploads.sort_by_key(|u| u.initiated);
        Ok(uploads)
    }

    async fn list_parts(&self, upload_id: &str) -> anyhow::Result<Vec<PartMetadata>> {
        let state = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| S3Error::no_such_upload(upload_id))?;
        let mut parts: Vec<PartMetadata> = state.parts.lock().values().map(|(meta, _)| meta.clone()).collect();
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::FilesystemDataStorage;

    async fn upload_raw_part(storage: &FilesystemMultipartStorage, upload_id: &str, part_number: u16, body: &[u8]) -> PartMetadata {
        let mut cursor = std::io::Cursor::new(body.to_vec());
        storage
            .upload_part(upload_id, part_number, &mut cursor, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn complete_composes_multipart_etag_and_concatenates_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let multipart = FilesystemMultipartStorage::new(dir.path());
        let data: Arc<dyn ObjectDataStorage> = Arc::new(FilesystemDataStorage::new(dir.path()));

        let upload_id = multipart
            .initiate("b", "big", None, BTreeMap::new(), None)
            .await
            .unwrap();

        let p1 = upload_raw_part(&multipart, &upload_id, 1, &vec![b'a'; 16]).await;
        let p2 = upload_raw_part(&multipart, &upload_id, 2, &vec![b'b'; 16]).await;
        let p3 = upload_raw_part(&multipart, &upload_id, 3, b"tail").await;

        let requested = vec![
            CompletedPartSpec { part_number: 1, etag: format!("\"{}\"", p1.etag) },
            CompletedPartSpec { part_number: 2, etag: p2.etag.clone() },
            CompletedPartSpec { part_number: 3, etag: p3.etag.clone() },
        ];

        let (result, record) = multipart.complete(&upload_id, &requested, data.as_ref(), &CancellationToken::new()).await.unwrap();
        assert!(result.etag.ends_with("-3"));
        assert_eq!(record.key, "big");

        let mut out = Vec::new();
        data.write_to_sink("b", "big", &mut out, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.len(), 16 + 16 + 4);
        assert_eq!(&out[..16], &vec![b'a'; 16][..]);
        assert_eq!(&out[32..], b"tail");
    }

    #[tokio::test]
    async fn complete_rejects_etag_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let multipart = FilesystemMultipartStorage::new(dir.path());
        let data: Arc<dyn ObjectDataStorage> = Arc::new(FilesystemDataStorage::new(dir.path()));
        let upload_id = multipart.initiate("b", "k", None, BTreeMap::new(), None).await.unwrap();
        upload_raw_part(&multipart, &upload_id, 1, b"hello").await;

        let requested = vec![CompletedPartSpec { part_number: 1, etag: "deadbeef".into() }];
        let err = multipart.complete(&upload_id, &requested, data.as_ref(), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(lamina_common::error::classify(&err).kind, lamina_common::error::S3ErrorKind::InvalidPart);
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_never_throws() {
        let dir = tempfile::tempdir().unwrap();
        let multipart = FilesystemMultipartStorage::new(dir.path());
        let upload_id = multipart.initiate("b", "k", None, BTreeMap::new(), None).await.unwrap();
        assert!(multipart.abort(&upload_id).await.unwrap());
        assert!(!multipart.abort(&upload_id).await.unwrap());
        assert!(!multipart.abort("never-existed").await.unwrap());
    }

    #[tokio::test]
    async fn reupload_of_same_part_number_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let multipart = FilesystemMultipartStorage::new(dir.path());
        let upload_id = multipart.initiate("b", "k", None, BTreeMap::new(), None).await.unwrap();
        upload_raw_part(&multipart, &upload_id, 1, b"first").await;
        let second = upload_raw_part(&multipart, &upload_id, 1, b"second-version").await;
        let parts = multipart.list_parts(&upload_id).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].etag, second.etag);
    }
}
