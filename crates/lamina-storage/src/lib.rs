//! Object data, metadata, multipart, and bucket storage backends (spec §4.5-§4.8).
//!
//! Every trait here is object-safe so a server can select a backend at
//! startup and hold it as `Arc<dyn Trait>`; generics only show up behind a
//! `&mut dyn AsyncRead`/`AsyncWrite` at the I/O boundary.

pub mod bucket;
pub mod data;
pub mod metadata;
pub mod multipart;
pub mod probe;

pub use bucket::{BucketStorage, FilesystemBucketStorage};
pub use data::{ChecksumRequest, FilesystemDataStorage, InMemoryDataStorage, ListResult, ObjectDataStorage, StoreResult};
pub use metadata::{DataProbe, InMemoryMetadataStorage, JsonFileMetadataStorage, ObjectMetadataStorage, SqliteMetadataStorage, StoreMetadataRequest};
pub use multipart::{CompletedPartSpec, FilesystemMultipartStorage, MultipartUploadStorage};
pub use probe::DataStorageProbe;
