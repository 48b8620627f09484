//! The `LockManager` contract (spec §4.4): per-path read/write locking with
//! two pluggable backends. The trait itself stays object-safe (so callers
//! hold an `Arc<dyn LockManager>` and pick a backend at startup); the
//! higher-level `ReadFile`/`WriteFile`/`DeleteFile` helpers from the spec
//! are a generic extension trait built on top of the object-safe
//! acquire/release primitives.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque token identifying a held lock, returned by `acquire_*` and
/// required to `release_*`. For the Redis backend this doubles as the
/// owner identity embedded in the lock value, so a release from a
/// different token (a "stolen" release) is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait LockManager: Send + Sync + std::fmt::Debug {
    /// Acquires a read lock on `path`, blocking (cooperatively) until
    /// available or `cancel` fires. On cancellation, no lock state is left
    /// behind (spec §4.4/§5).
    async fn acquire_read(&self, path: &str, cancel: &CancellationToken) -> anyhow::Result<LockToken>;

    async fn release_read(&self, path: &str, token: LockToken) -> anyhow::Result<()>;

    async fn acquire_write(&self, path: &str, cancel: &CancellationToken) -> anyhow::Result<LockToken>;

    async fn release_write(&self, path: &str, token: LockToken) -> anyhow::Result<()>;
}

/// `ReadFile`/`WriteFile`/`DeleteFile` from spec §4.4, expressed as
/// "run this async operation while holding the {read,write} lock on
/// `path`". Generic over the closure's return type, so it can't be part of
/// the object-safe `LockManager` trait itself; it's implemented once here
/// for every `LockManager`.
#[async_trait]
pub trait LockManagerExt: LockManager {
    async fn read_file<T, F, Fut>(&self, path: &str, cancel: &CancellationToken, transform: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        let token = self.acquire_read(path, cancel).await?;
        let result = transform().await;
        self.release_read(path, token).await?;
        result
    }

    async fn write_file<T, F, Fut>(&self, path: &str, cancel: &CancellationToken, write: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        let token = self.acquire_write(path, cancel).await?;
        let result = write().await;
        self.release_write(path, token).await?;
        result
    }

    async fn delete_file<T, F, Fut>(&self, path: &str, cancel: &CancellationToken, delete: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        self.write_file(path, cancel, delete).await
    }
}

impl<T: LockManager + ?Sized> LockManagerExt for T {}

/// Builds the error a caller sees when a lock could not be acquired within
/// the configured retry budget, distinguishable from other internal errors
/// so `lamina-common::error` can classify it distinctly if it ever needs to.
pub fn lock_unavailable(key: &str) -> anyhow::Error {
    anyhow::anyhow!("lock on {key} unavailable: exhausted acquisition retry budget")
}
