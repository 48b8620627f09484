//! Wires `ObjectDataStorage` into the `DataProbe` seam the metadata store
//! needs, without the metadata store ever depending on the full data-store
//! trait (spec §9).

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::{data::ObjectDataStorage, metadata::DataProbe};

#[derive(Debug)]
pub struct DataStorageProbe {
    data: Arc<dyn ObjectDataStorage>,
}

impl DataStorageProbe {
    pub fn new(data: Arc<dyn ObjectDataStorage>) -> Self {
        Self { data }
    }
}

/// A write sink that only accumulates an MD5 digest, discarding the bytes.
struct HashingSink(Md5);

impl AsyncWrite for HashingSink {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0.update(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl DataProbe for DataStorageProbe {
    async fn get_mtime(&self, bucket: &str, key: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.data.get_data_info(bucket, key).await?.map(|info| info.mtime))
    }

    async fn compute_etag(&self, bucket: &str, key: &str) -> anyhow::Result<Option<String>> {
        if self.data.get_data_info(bucket, key).await?.is_none() {
            return Ok(None);
        }
        let mut sink = HashingSink(Md5::new());
        self.data
            .write_to_sink(bucket, key, &mut sink, None, &CancellationToken::new())
            .await?;
        Ok(Some(hex::encode(sink.0.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FilesystemDataStorage, ChecksumRequest as CR};

    #[tokio::test]
    async fn compute_etag_matches_stored_object_md5() {
        let dir = tempfile::tempdir().unwrap();
        let data_storage: Arc<dyn ObjectDataStorage> = Arc::new(FilesystemDataStorage::new(dir.path()));
        let mut cursor = std::io::Cursor::new(b"Hello World".to_vec());
        data_storage
            .store("b", "k", &mut cursor, &CR::default(), &CancellationToken::new())
            .await
            .unwrap();

        let probe = DataStorageProbe::new(data_storage);
        let etag = probe.compute_etag("b", "k").await.unwrap().unwrap();
        assert_eq!(etag, "b10a8db164e0754105b7a99be72e3fe5");
    }

    #[tokio::test]
    async fn missing_object_has_no_mtime_or_etag() {
        let dir = tempfile::tempdir().unwrap();
        let data_storage: Arc<dyn ObjectDataStorage> = Arc::new(FilesystemDataStorage::new(dir.path()));
        let probe = DataStorageProbe::new(data_storage);
        assert!(probe.get_mtime("b", "missing").await.unwrap().is_none());
        assert!(probe.compute_etag("b", "missing").await.unwrap().is_none());
    }
}
