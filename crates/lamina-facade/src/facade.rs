//! `ObjectStorageFacade` (spec §4.8): the thin orchestrator that wires
//! signature validation, storage, and the per-path lock manager together.
//! Routing/XML/config are a caller's concern; this crate only runs the
//! put/delete/list data flow spec §2 draws from HTTP body to storage.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use lamina_common::{
    error::S3Error,
    model::{validate_bucket_name, validate_key, Bucket, BucketType, Checksums, MultipartUpload, PartMetadata, S3ObjectInfo, DEFAULT_CONTENT_TYPE},
};
use lamina_lock::LockManager;
use lamina_sigv4::ChunkSignatureValidator;
use lamina_storage::{
    data::{ChecksumRequest, ListResult, ObjectDataStorage},
    metadata::{DataProbe, ObjectMetadataStorage, StoreMetadataRequest},
    multipart::{CompletedPartSpec, MultipartUploadStorage},
    BucketStorage,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-request input to [`ObjectStorageFacade::put_object`]. `is_streaming`
/// selects whether `source` is raw bytes or an `aws-chunked` frame that
/// needs decoding through `chunk_validator` before it reaches the data
/// store (spec §2's "HTTP body → ChunkedDataParser → decoded-bytes pipe →
/// ObjectDataStorage.Store" flow).
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub is_streaming: bool,
    pub content_type: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
    pub owner_id: Option<String>,
    pub owner_display_name: Option<String>,
    pub checksums: ChecksumRequest,
}

#[derive(Debug, Default)]
pub struct DeleteMultipleOutcome {
    pub deleted: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// A single listed object, with metadata hydrated (or synthesized) per key.
#[derive(Debug, Clone)]
pub struct ListedObject {
    pub info: S3ObjectInfo,
}

#[derive(Debug, Default)]
pub struct ListObjectsOutcome {
    pub objects: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
    pub truncated: bool,
    pub start_after_next: Option<String>,
}

#[derive(Debug)]
pub struct ObjectStorageFacade {
    data: Arc<dyn ObjectDataStorage>,
    metadata: Arc<dyn ObjectMetadataStorage>,
    multipart: Arc<dyn MultipartUploadStorage>,
    buckets: Arc<dyn BucketStorage>,
    lock: Arc<dyn LockManager>,
    probe: Arc<dyn DataProbe>,
    temp_file_prefix: String,
}

impl ObjectStorageFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: Arc<dyn ObjectDataStorage>,
        metadata: Arc<dyn ObjectMetadataStorage>,
        multipart: Arc<dyn MultipartUploadStorage>,
        buckets: Arc<dyn BucketStorage>,
        lock: Arc<dyn LockManager>,
        probe: Arc<dyn DataProbe>,
        temp_file_prefix: impl Into<String>,
    ) -> Self {
        Self {
            data,
            metadata,
            multipart,
            buckets,
            lock,
            probe,
            temp_file_prefix: temp_file_prefix.into(),
        }
    }

    fn lock_path(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    fn guess_content_type(key: &str) -> String {
        mime_guess::from_path(key)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }

    /// Runs `ChunkedDataParser` over `source` when `request.is_streaming`,
    /// otherwise copies it raw, then publishes size/ETag/checksums to the
    /// metadata store under the per-key write lock. Returns the published
    /// object's info.
    pub async fn put_object(
        &self,
        request: PutObjectRequest,
        source: &mut (dyn AsyncRead + Unpin + Send),
        mut chunk_validator: Option<ChunkSignatureValidator>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<S3ObjectInfo> {
        validate_key(&request.key, &self.temp_file_prefix).map_err(S3Error::invalid_argument)?;
        let path = Self::lock_path(&request.bucket, &request.key);
        let (bucket, key) = (request.bucket.clone(), request.key.clone());
        let token = self.lock.acquire_write(&path, cancel).await?;

        let result = async {
            let store_result = if request.is_streaming {
                let (read_half, write_half) = tokio::io::duplex(64 * 1024);
                let mut read_half = read_half;
                let decode_fut = lamina_sigv4::decode_to_sink(source, write_half, chunk_validator.as_mut());
                let store_fut = self.data.store(&request.bucket, &request.key, &mut read_half, &request.checksums, cancel);
                let (outcome, store_result) = tokio::try_join!(decode_fut, store_fut)?;

                if outcome.trailer_ok == Some(false) {
                    self.data.delete(&request.bucket, &request.key).await.ok();
                    anyhow::bail!(S3Error::signature_does_not_match("trailer signature mismatch"));
                }
                store_result
            } else {
                self.data.store(&request.bucket, &request.key, source, &request.checksums, cancel).await?
            };

            let content_type = request
                .content_type
                .clone()
                .unwrap_or_else(|| Self::guess_content_type(&request.key));

            let info = S3ObjectInfo {
                key: request.key.clone(),
                size: store_result.size,
                last_modified: Utc::now(),
                etag: store_result.etag.clone(),
                content_type: content_type.clone(),
                user_metadata: request.user_metadata.clone(),
                owner_id: request.owner_id.clone(),
                owner_display_name: request.owner_display_name.clone(),
                checksums: store_result.checksums.clone(),
            };

            self.metadata
                .store(StoreMetadataRequest {
                    bucket: request.bucket.clone(),
                    key: request.key.clone(),
                    etag: info.etag.clone(),
                    size: info.size,
                    content_type: Some(content_type),
                    user_metadata: request.user_metadata,
                    owner_id: request.owner_id,
                    owner_display_name: request.owner_display_name,
                    checksums: Some(info.checksums.clone()),
                })
                .await?;

            Ok(info)
        }
        .await;

        self.lock.release_write(&path, token).await?;
        if result.is_ok() {
            info!(bucket = %bucket, key = %key, "object published");
        }
        result
    }

    /// Falls back to [`Self::synthesize_object_info`] when no metadata
    /// record exists but the data still does (data-first invariant, spec
    /// §3: "if data exists and metadata is missing, HEAD returns a
    /// synthesized ETag equal to MD5(data)") — `metadata.get` only repairs
    /// a *stale* record, it never synthesizes one from scratch.
    pub async fn get_object(&self, bucket: &str, key: &str, cancel: &CancellationToken) -> anyhow::Result<Option<S3ObjectInfo>> {
        let path = Self::lock_path(bucket, key);
        let token = self.lock.acquire_read(&path, cancel).await?;
        let result = async {
            match self.metadata.get(bucket, key, self.probe.as_ref()).await? {
                Some(info) => Ok(Some(info)),
                None => match self.synthesize_object_info(bucket, key).await {
                    Ok(info) => Ok(Some(info)),
                    Err(err) if lamina_common::error::classify(&err).kind == lamina_common::error::S3ErrorKind::NoSuchKey => Ok(None),
                    Err(err) => Err(err),
                },
            }
        }
        .await;
        self.lock.release_read(&path, token).await?;
        result
    }

    pub async fn delete_object(&self, bucket: &str, key: &str, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let path = Self::lock_path(bucket, key);
        let token = self.lock.acquire_write(&path, cancel).await?;
        let result = async {
            let data_existed = self.data.delete(bucket, key).await?;
            let meta_existed = self.metadata.delete(bucket, key).await?;
            Ok(data_existed || meta_existed)
        }
        .await;
        self.lock.release_write(&path, token).await?;
        result
    }

    /// Streams stored bytes to `sink` under the read lock, optionally
    /// restricted to an inclusive byte range (spec §4.8's `GetObject`).
    pub async fn write_object_to(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        range: Option<(u64, u64)>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        let path = Self::lock_path(bucket, key);
        let token = self.lock.acquire_read(&path, cancel).await?;
        let result = self.data.write_to_sink(bucket, key, sink, range, cancel).await;
        self.lock.release_read(&path, token).await?;
        result
    }

    /// Server-side copy (spec §4.8's `CopyObject`): a read lock on the
    /// source and a write lock on the destination, held simultaneously so a
    /// concurrent write to either side can't interleave with the copy.
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<S3ObjectInfo> {
        let src_path = Self::lock_path(src_bucket, src_key);
        let dst_path = Self::lock_path(dst_bucket, dst_key);
        let src_token = self.lock.acquire_read(&src_path, cancel).await?;
        let dst_token = self.lock.acquire_write(&dst_path, cancel).await?;

        let result = async {
            let store_result = self.data.copy(src_bucket, src_key, dst_bucket, dst_key, cancel).await?;
            let src_info = self.metadata.get(src_bucket, src_key, self.probe.as_ref()).await?;
            let content_type = src_info
                .as_ref()
                .map(|i| i.content_type.clone())
                .unwrap_or_else(|| Self::guess_content_type(dst_key));
            let user_metadata = src_info.as_ref().map(|i| i.user_metadata.clone()).unwrap_or_default();

            let info = S3ObjectInfo {
                key: dst_key.to_string(),
                size: store_result.size,
                last_modified: Utc::now(),
                etag: store_result.etag.clone(),
                content_type: content_type.clone(),
                user_metadata: user_metadata.clone(),
                owner_id: None,
                owner_display_name: None,
                checksums: store_result.checksums.clone(),
            };

            self.metadata
                .store(StoreMetadataRequest {
                    bucket: dst_bucket.to_string(),
                    key: dst_key.to_string(),
                    etag: info.etag.clone(),
                    size: info.size,
                    content_type: Some(content_type),
                    user_metadata,
                    owner_id: None,
                    owner_display_name: None,
                    checksums: Some(info.checksums.clone()),
                })
                .await?;

            Ok(info)
        }
        .await;

        self.lock.release_write(&dst_path, dst_token).await?;
        self.lock.release_read(&src_path, src_token).await?;
        result
    }

    /// Best-effort per-object delete; one object's failure doesn't stop the
    /// others. `quiet` suppresses the `deleted` list in the outcome (spec
    /// §4.8), matching S3's `Quiet` multi-delete mode.
    pub async fn delete_multiple_objects(&self, bucket: &str, keys: &[String], quiet: bool, cancel: &CancellationToken) -> DeleteMultipleOutcome {
        let mut outcome = DeleteMultipleOutcome::default();
        for key in keys {
            match self.delete_object(bucket, key, cancel).await {
                Ok(_) if quiet => {},
                Ok(_) => outcome.deleted.push(key.clone()),
                Err(err) => outcome.errors.push((key.clone(), lamina_common::error::classify(&err).message.into_owned())),
            }
        }
        outcome
    }

    /// Delegates to the data store's listing and hydrates each key's
    /// metadata, synthesizing defaults when metadata is missing (spec
    /// §4.8's `ListObjects`).
    pub async fn list_objects(
        &self,
        bucket: &str,
        bucket_type: BucketType,
        prefix: &str,
        delimiter: Option<&str>,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> anyhow::Result<ListObjectsOutcome> {
        let ListResult {
            keys,
            common_prefixes,
            truncated,
            start_after_next,
        } = self.data.list_keys(bucket, bucket_type, prefix, delimiter, start_after, max_keys).await?;

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let info = match self.metadata.get(bucket, &key, self.probe.as_ref()).await? {
                Some(info) => info,
                None => self.synthesize_object_info(bucket, &key).await?,
            };
            objects.push(ListedObject { info });
        }

        Ok(ListObjectsOutcome {
            objects,
            common_prefixes,
            truncated,
            start_after_next,
        })
    }

    async fn synthesize_object_info(&self, bucket: &str, key: &str) -> anyhow::Result<S3ObjectInfo> {
        let data_info = self
            .data
            .get_data_info(bucket, key)
            .await?
            .ok_or_else(|| S3Error::no_such_key(key))?;
        let etag = self.probe.compute_etag(bucket, key).await?.unwrap_or_default();
        Ok(S3ObjectInfo {
            key: key.to_string(),
            size: data_info.size,
            last_modified: data_info.mtime,
            etag,
            content_type: Self::guess_content_type(key),
            user_metadata: BTreeMap::new(),
            owner_id: None,
            owner_display_name: None,
            checksums: Checksums::default(),
        })
    }

    pub async fn create_bucket(&self, name: &str, bucket_type: BucketType, owner_id: Option<String>, owner_display_name: Option<String>) -> anyhow::Result<Bucket> {
        validate_bucket_name(name).map_err(S3Error::invalid_argument)?;
        self.buckets.create(name, bucket_type, owner_id, owner_display_name).await
    }

    pub async fn delete_bucket(&self, name: &str) -> anyhow::Result<()> {
        self.buckets.delete(name).await
    }

    pub async fn list_buckets(&self) -> anyhow::Result<Vec<Bucket>> {
        self.buckets.list().await
    }

    pub async fn put_bucket_tags(&self, name: &str, tags: BTreeMap<String, String>) -> anyhow::Result<()> {
        self.buckets.put_tags(name, tags).await
    }

    pub async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        user_metadata: BTreeMap<String, String>,
        checksum_algorithm: Option<String>,
    ) -> anyhow::Result<String> {
        validate_key(key, &self.temp_file_prefix).map_err(S3Error::invalid_argument)?;
        self.multipart.initiate(bucket, key, content_type, user_metadata, checksum_algorithm).await
    }

    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u16,
        source: &mut (dyn AsyncRead + Unpin + Send),
        mut chunk_validator: Option<ChunkSignatureValidator>,
        is_streaming: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<PartMetadata> {
        if !is_streaming {
            return self.multipart.upload_part(upload_id, part_number, source, cancel).await;
        }

        let (read_half, write_half) = tokio::io::duplex(64 * 1024);
        let mut read_half = read_half;
        let decode_fut = lamina_sigv4::decode_to_sink(source, write_half, chunk_validator.as_mut());
        let part_fut = self.multipart.upload_part(upload_id, part_number, &mut read_half, cancel);
        let (outcome, part_metadata) = tokio::try_join!(decode_fut, part_fut)?;

        if outcome.trailer_ok == Some(false) {
            anyhow::bail!(S3Error::signature_does_not_match("trailer signature mismatch"));
        }
        Ok(part_metadata)
    }

    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        requested_parts: &[CompletedPartSpec],
        cancel: &CancellationToken,
    ) -> anyhow::Result<S3ObjectInfo> {
        let path = Self::lock_path(bucket, key);
        let token = self.lock.acquire_write(&path, cancel).await?;

        let result = async {
            let (store_result, record) = self.multipart.complete(upload_id, requested_parts, self.data.as_ref(), cancel).await?;

            let info = S3ObjectInfo {
                key: key.to_string(),
                size: store_result.size,
                last_modified: Utc::now(),
                etag: store_result.etag.clone(),
                content_type: record.content_type.clone(),
                user_metadata: record.user_metadata.clone(),
                owner_id: None,
                owner_display_name: None,
                checksums: store_result.checksums.clone(),
            };

            self.metadata
                .store(StoreMetadataRequest {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    etag: info.etag.clone(),
                    size: info.size,
                    content_type: Some(record.content_type),
                    user_metadata: record.user_metadata,
                    owner_id: None,
                    owner_display_name: None,
                    checksums: Some(info.checksums.clone()),
                })
                .await?;

            Ok(info)
        }
        .await;

        self.lock.release_write(&path, token).await?;
        result
    }

    pub async fn abort_multipart_upload(&self, upload_id: &str) -> anyhow::Result<bool> {
        self.multipart.abort(upload_id).await
    }

    pub async fn list_multipart_uploads(&self, bucket: &str) -> anyhow::Result<Vec<MultipartUpload>> {
        self.multipart.list_uploads(bucket).await
    }

    pub async fn list_parts(&self, upload_id: &str) -> anyhow::Result<Vec<PartMetadata>> {
        self.multipart.list_parts(upload_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_lock::InProcessLockManager;
    use lamina_storage::{metadata::InMemoryMetadataStorage, multipart::FilesystemMultipartStorage, DataStorageProbe, FilesystemBucketStorage, FilesystemDataStorage};

    fn facade(root: &std::path::Path) -> ObjectStorageFacade {
        let data: Arc<dyn ObjectDataStorage> = Arc::new(FilesystemDataStorage::new(root));
        let metadata: Arc<dyn ObjectMetadataStorage> = Arc::new(InMemoryMetadataStorage::new());
        let multipart: Arc<dyn MultipartUploadStorage> = Arc::new(FilesystemMultipartStorage::new(root));
        let buckets: Arc<dyn BucketStorage> = Arc::new(FilesystemBucketStorage::new(root, data.clone()));
        let lock: Arc<dyn LockManager> = Arc::new(InProcessLockManager::new(""));
        let probe: Arc<dyn DataProbe> = Arc::new(DataStorageProbe::new(data.clone()));
        ObjectStorageFacade::new(data, metadata, multipart, buckets, lock, probe, ".lamina-tmp-")
    }

    #[tokio::test]
    async fn put_then_get_round_trips_plain_body() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade(dir.path());
        let cancel = CancellationToken::new();
        facade.create_bucket("b", BucketType::GeneralPurpose, None, None).await.unwrap();

        let mut cursor = std::io::Cursor::new(b"Hello World".to_vec());
        let request = PutObjectRequest {
            bucket: "b".into(),
            key: "greeting.txt".into(),
            is_streaming: false,
            content_type: None,
            user_metadata: BTreeMap::new(),
            owner_id: None,
            owner_display_name: None,
            checksums: ChecksumRequest::default(),
        };
        let info = facade.put_object(request, &mut cursor, None, &cancel).await.unwrap();
        assert_eq!(info.etag, "b10a8db164e0754105b7a99be72e3fe5");
        assert_eq!(info.content_type, "text/plain");

        let fetched = facade.get_object("b", "greeting.txt", &cancel).await.unwrap().unwrap();
        assert_eq!(fetched.etag, info.etag);
    }

    #[tokio::test]
    async fn delete_object_removes_data_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade(dir.path());
        let cancel = CancellationToken::new();
        facade.create_bucket("b", BucketType::GeneralPurpose, None, None).await.unwrap();
        let mut cursor = std::io::Cursor::new(b"x".to_vec());
        let request = PutObjectRequest {
            bucket: "b".into(),
            key: "k".into(),
            is_streaming: false,
            content_type: None,
            user_metadata: BTreeMap::new(),
            owner_id: None,
            owner_display_name: None,
            checksums: ChecksumRequest::default(),
        };
        facade.put_object(request, &mut cursor, None, &cancel).await.unwrap();

        assert!(facade.delete_object("b", "k", &cancel).await.unwrap());
        assert!(!facade.delete_object("b", "k", &cancel).await.unwrap());
        assert!(facade.get_object("b", "k", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_objects_hydrates_metadata_for_each_key() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade(dir.path());
        let cancel = CancellationToken::new();
        facade.create_bucket("b", BucketType::GeneralPurpose, None, None).await.unwrap();
        for key in ["a", "b", "c"] {
            let mut cursor = std::io::Cursor::new(key.as_bytes().to_vec());
            let request = PutObjectRequest {
                bucket: "b".into(),
                key: key.into(),
                is_streaming: false,
                content_type: None,
                user_metadata: BTreeMap::new(),
                owner_id: None,
                owner_display_name: None,
                checksums: ChecksumRequest::default(),
            };
            facade.put_object(request, &mut cursor, None, &cancel).await.unwrap();
        }

        let listing = facade.list_objects("b", BucketType::GeneralPurpose, "", None, None, 10).await.unwrap();
        assert_eq!(listing.objects.len(), 3);
        assert!(listing.objects.iter().all(|o| !o.info.etag.is_empty()));
    }
}
