//! Shared data model and error classification for the Lamina object storage
//! server. See `error` for the S3 error taxonomy and `model` for the
//! bucket/object/multipart types shared by `lamina-storage`, `lamina-lock`,
//! and `lamina-facade`.

pub mod error;
pub mod model;
pub mod request_id;

pub use error::{classify, S3Error, S3ErrorKind};
pub use model::{
    compose_multipart_etag, validate_bucket_name, validate_key, Bucket, BucketType, Checksums,
    MultipartUpload, PartMetadata, S3ObjectInfo, DEFAULT_CONTENT_TYPE,
};
