//! S3 error taxonomy, modeled after the teacher's `ErrorMetadata`-over-`anyhow`
//! idiom: a small classification object carries the S3 error code and a
//! human message, and gets attached to an [`anyhow::Error`] chain via
//! `.context(...)` rather than defining a second parallel error hierarchy.

use std::borrow::Cow;

use http::StatusCode;

/// The S3 error kinds from the spec's error taxonomy (§7). Each maps to
/// exactly one wire `Code` and HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3ErrorKind {
    InvalidArgument,
    InvalidDigest,
    BadDigest,
    SignatureDoesNotMatch,
    AccessDenied,
    NoSuchBucket,
    NoSuchKey,
    NoSuchUpload,
    BucketAlreadyExists,
    BucketNotEmpty,
    InvalidPart,
    InvalidPartOrder,
    InvalidRange,
    InternalError,
}

impl S3ErrorKind {
    /// The `Code` element S3 clients match on.
    pub fn code(self) -> &'static str {
        use S3ErrorKind::*;
        match self {
            InvalidArgument => "InvalidArgument",
            InvalidDigest => "InvalidDigest",
            BadDigest => "BadDigest",
            SignatureDoesNotMatch => "SignatureDoesNotMatch",
            AccessDenied => "AccessDenied",
            NoSuchBucket => "NoSuchBucket",
            NoSuchKey => "NoSuchKey",
            NoSuchUpload => "NoSuchUpload",
            BucketAlreadyExists => "BucketAlreadyExists",
            BucketNotEmpty => "BucketNotEmpty",
            InvalidPart => "InvalidPart",
            InvalidPartOrder => "InvalidPartOrder",
            InvalidRange => "InvalidRange",
            InternalError => "InternalError",
        }
    }

    pub fn status(self) -> StatusCode {
        use S3ErrorKind::*;
        match self {
            InvalidArgument | InvalidDigest | BadDigest | InvalidPart | InvalidPartOrder => {
                StatusCode::BAD_REQUEST
            },
            SignatureDoesNotMatch | AccessDenied => StatusCode::FORBIDDEN,
            NoSuchBucket | NoSuchKey | NoSuchUpload => StatusCode::NOT_FOUND,
            BucketAlreadyExists | BucketNotEmpty => StatusCode::CONFLICT,
            InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Attached to an [`anyhow::Error`] via `.context(e /* S3Error */)` to
/// classify a failure for the wire layer. The `message` is the developer
/// facing `Message` element; `resource` is filled in by the facade/router
/// when the bucket/key is known at the call site that surfaces the error.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{message}")]
pub struct S3Error {
    pub kind: S3ErrorKind,
    pub message: Cow<'static, str>,
}

impl S3Error {
    pub fn new(kind: S3ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(S3ErrorKind::InvalidArgument, message)
    }

    pub fn bad_digest(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(S3ErrorKind::BadDigest, message)
    }

    pub fn signature_does_not_match(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(S3ErrorKind::SignatureDoesNotMatch, message)
    }

    pub fn no_such_bucket(bucket: &str) -> Self {
        Self::new(
            S3ErrorKind::NoSuchBucket,
            format!("The specified bucket does not exist: {bucket}"),
        )
    }

    pub fn no_such_key(key: &str) -> Self {
        Self::new(
            S3ErrorKind::NoSuchKey,
            format!("The specified key does not exist: {key}"),
        )
    }

    pub fn no_such_upload(upload_id: &str) -> Self {
        Self::new(
            S3ErrorKind::NoSuchUpload,
            format!("The specified upload does not exist: {upload_id}"),
        )
    }

    pub fn bucket_already_exists(bucket: &str) -> Self {
        Self::new(
            S3ErrorKind::BucketAlreadyExists,
            format!("The requested bucket name is not available: {bucket}"),
        )
    }

    pub fn bucket_not_empty(bucket: &str) -> Self {
        Self::new(
            S3ErrorKind::BucketNotEmpty,
            format!("The bucket you tried to delete is not empty: {bucket}"),
        )
    }

    pub fn invalid_part(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(S3ErrorKind::InvalidPart, message)
    }

    pub fn invalid_part_order(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(S3ErrorKind::InvalidPartOrder, message)
    }

    pub fn invalid_range(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(S3ErrorKind::InvalidRange, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(S3ErrorKind::InternalError, message)
    }

    pub fn access_denied(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(S3ErrorKind::AccessDenied, message)
    }
}

/// Walks an `anyhow::Error`'s context chain for an attached [`S3Error`],
/// falling back to `InternalError` for unclassified failures (I/O errors
/// bubbling up from the filesystem or Redis, for instance).
pub fn classify(err: &anyhow::Error) -> S3Error {
    for cause in err.chain() {
        if let Some(s3_err) = cause.downcast_ref::<S3Error>() {
            return s3_err.clone();
        }
    }
    S3Error::internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn classify_finds_attached_error_in_chain() {
        let base = anyhow::anyhow!("disk full");
        let wrapped = base.context(S3Error::bad_digest("checksum mismatch"));
        let classified = classify(&wrapped);
        assert_eq!(classified.kind, S3ErrorKind::BadDigest);
    }

    #[test]
    fn classify_falls_back_to_internal_error() {
        let err = anyhow::anyhow!("unexpected failure");
        let classified = classify(&err);
        assert_eq!(classified.kind, S3ErrorKind::InternalError);
    }
}
