//! Server configuration, parsed from the command line (and `LAMINA_*` env
//! vars via `clap`'s `env` feature). Modeled on the teacher's `LocalConfig`:
//! a `Parser`-derived struct with per-field defaults, a selective `Debug`
//! impl so credentials never land in a log line, and a test constructor
//! built through `try_parse_from` instead of hand-assembling the struct.

use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetadataBackendKind {
    /// No durability across restarts; metadata is resynthesized from data
    /// on demand. Useful for tests and ephemeral deployments.
    Memory,
    /// One `.lamina-meta.json` sidecar per object, next to its bytes.
    Json,
    /// A single SQLite database file under the data root.
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LockBackendKind {
    InProcess,
    Redis,
}

#[derive(Parser, Clone)]
#[clap(
    name = "lamina-server",
    version,
    about = "S3-compatible object storage server"
)]
pub struct ServerConfig {
    /// Root directory object bytes, metadata sidecars, and multipart parts
    /// are stored under.
    #[clap(long, env = "LAMINA_DATA_ROOT", default_value = "./lamina-data")]
    pub data_root: PathBuf,

    /// Interface to bind the HTTP listener to.
    #[clap(long, env = "LAMINA_HOST", default_value = "0.0.0.0")]
    pub host: std::net::IpAddr,

    #[clap(long, env = "LAMINA_PORT", default_value = "8080")]
    pub port: u16,

    /// AWS region used in the signing scope and `GetBucketLocation`.
    #[clap(long, env = "LAMINA_REGION", default_value = "us-east-1")]
    pub region: String,

    #[clap(long, env = "LAMINA_METADATA_BACKEND", value_enum, default_value_t = MetadataBackendKind::Json)]
    pub metadata_backend: MetadataBackendKind,

    /// Required when `metadata_backend = sqlite`; defaults to a file under
    /// `data_root` otherwise.
    #[clap(long, env = "LAMINA_SQLITE_PATH")]
    pub sqlite_path: Option<PathBuf>,

    #[clap(long, env = "LAMINA_LOCK_BACKEND", value_enum, default_value_t = LockBackendKind::InProcess)]
    pub lock_backend: LockBackendKind,

    /// Required when `lock_backend = redis`; checked in [`Self::validate`]
    /// rather than by `clap` since the requirement is conditional on
    /// another field's value.
    #[clap(long, env = "LAMINA_REDIS_URL")]
    pub redis_url: Option<String>,

    #[clap(long, env = "LAMINA_LOCK_KEY_PREFIX", default_value = "lamina:lock:")]
    pub lock_key_prefix: String,

    /// Access key clients authenticate with. A single static credential
    /// pair, per spec's single-predicate authorization scope.
    #[clap(long, env = "LAMINA_ACCESS_KEY", default_value = "laminaadmin")]
    pub access_key: String,

    #[clap(long, env = "LAMINA_SECRET_KEY", default_value = "laminasecret")]
    pub secret_key: String,

    /// Path segment prefix reserved for internal bookkeeping files; a
    /// client-supplied key containing a segment with this prefix is
    /// rejected (spec §4.5).
    #[clap(long, default_value = ".lamina-tmp-")]
    pub temp_file_prefix: String,

    /// How often the janitor sweeps for multipart uploads abandoned past
    /// their expiry.
    #[clap(long, value_parser = humantime_secs, default_value = "300")]
    pub janitor_interval_secs: u64,

    #[clap(long, value_parser = humantime_secs, default_value = "86400")]
    pub multipart_expiry_secs: u64,
}

fn humantime_secs(s: &str) -> Result<u64, String> {
    s.parse::<u64>().map_err(|e| e.to_string())
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("data_root", &self.data_root)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("region", &self.region)
            .field("metadata_backend", &self.metadata_backend)
            .field("lock_backend", &self.lock_backend)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.host, self.port)
    }

    /// Validated separately from parsing so a bad combination (e.g.
    /// `lock_backend = redis` with no URL) produces a clear message and a
    /// non-zero exit rather than a panic deep in startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if matches!(self.lock_backend, LockBackendKind::Redis) && self.redis_url.is_none() {
            anyhow::bail!("--redis-url is required when --lock-backend=redis");
        }
        if self.access_key.is_empty() || self.secret_key.is_empty() {
            anyhow::bail!("access key and secret key must not be empty");
        }
        Ok(())
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("lamina-metadata.sqlite3"))
    }

    #[cfg(test)]
    pub fn new_for_test(data_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_root = data_root.into();
        let config = <Self as Parser>::try_parse_from([
            "lamina-server",
            "--data-root",
            data_root.to_str().expect("utf8 test path"),
            "--port",
            "0",
        ])?;
        Ok(config)
    }
}
