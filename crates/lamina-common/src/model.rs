//! Data model shared across the storage, lock, and facade crates (spec §3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bucket's storage type. `Directory` buckets preserve native filesystem
/// enumeration order on listing instead of being lexicographically sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketType {
    GeneralPurpose,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub creation_date: DateTime<Utc>,
    pub bucket_type: BucketType,
    pub storage_class: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub owner_id: Option<String>,
    pub owner_display_name: Option<String>,
}

impl Bucket {
    pub fn new(name: String, creation_date: DateTime<Utc>) -> Self {
        Self {
            name,
            creation_date,
            bucket_type: BucketType::GeneralPurpose,
            storage_class: None,
            tags: BTreeMap::new(),
            owner_id: None,
            owner_display_name: None,
        }
    }
}

/// A bucket name is 3-63 chars, DNS-label-like. We check the shape the spec
/// actually tests (length + character class); full DNS label validation
/// (no leading/trailing hyphen per label, no adjacent dots) is applied too
/// since S3 enforces it and a looser check would accept names S3 rejects.
pub fn validate_bucket_name(name: &str) -> Result<(), String> {
    if name.len() < 3 || name.len() > 63 {
        return Err(format!(
            "bucket name must be 3-63 characters, got {}",
            name.len()
        ));
    }
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.');
    if !valid_chars {
        return Err("bucket name may only contain lowercase letters, digits, '-' and '.'".into());
    }
    if !name.as_bytes()[0].is_ascii_alphanumeric()
        || !name.as_bytes()[name.len() - 1].is_ascii_alphanumeric()
    {
        return Err("bucket name must start and end with a letter or digit".into());
    }
    if name.contains("..") {
        return Err("bucket name must not contain consecutive periods".into());
    }
    Ok(())
}

/// Per-algorithm checksums, each base64 encoded per S3 convention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub crc32: Option<String>,
    pub crc32c: Option<String>,
    pub crc64nvme: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
}

impl Checksums {
    pub fn is_empty(&self) -> bool {
        self.crc32.is_none()
            && self.crc32c.is_none()
            && self.crc64nvme.is_none()
            && self.sha1.is_none()
            && self.sha256.is_none()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// Hex, unquoted. Quoted only at the wire boundary.
    pub etag: String,
    pub content_type: String,
    pub user_metadata: BTreeMap<String, String>,
    pub owner_id: Option<String>,
    pub owner_display_name: Option<String>,
    pub checksums: Checksums,
}

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Key validation per spec §4.5: no NUL/CR/LF, not leading `/`, 1-1024 bytes,
/// and no path segment colliding with the temp-file prefix (so a client
/// can never address a path our own bookkeeping uses).
pub fn validate_key(key: &str, temp_file_prefix: &str) -> Result<(), String> {
    if key.is_empty() || key.len() > 1024 {
        return Err(format!(
            "key must be 1-1024 bytes, got {}",
            key.len()
        ));
    }
    if key.starts_with('/') {
        return Err("key must not start with '/'".into());
    }
    if key.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return Err("key must not contain NUL, CR, or LF".into());
    }
    if key.split('/').any(|segment| segment.starts_with(temp_file_prefix)) {
        return Err(format!(
            "key must not contain a path segment starting with '{temp_file_prefix}'"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMetadata {
    pub part_number: u16,
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub checksums: Checksums,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated: DateTime<Utc>,
    pub content_type: String,
    pub user_metadata: BTreeMap<String, String>,
    pub checksum_algorithm: Option<String>,
}

/// Composes the multipart ETag from each part's raw MD5 digest bytes, per
/// spec §4.7 / glossary: `hex(MD5(concat(MD5_bytes_i))) + "-" + N`.
pub fn compose_multipart_etag(part_md5_digests: &[[u8; 16]]) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    for digest in part_md5_digests {
        hasher.update(digest);
    }
    let combined = hasher.finalize();
    format!("{}-{}", hex::encode(combined), part_md5_digests.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_name_validation() {
        assert!(validate_bucket_name("my-bucket").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name(&"a".repeat(64)).is_err());
        assert!(validate_bucket_name("My-Bucket").is_err());
        assert!(validate_bucket_name("-leading-hyphen").is_err());
        assert!(validate_bucket_name("has..dots").is_err());
    }

    #[test]
    fn key_validation_rejects_control_bytes_and_leading_slash() {
        assert!(validate_key("a/b/c", ".lamina-tmp-").is_ok());
        assert!(validate_key("/leading", ".lamina-tmp-").is_err());
        assert!(validate_key("has\0nul", ".lamina-tmp-").is_err());
        assert!(validate_key("has\nnewline", ".lamina-tmp-").is_err());
        assert!(validate_key("a/.lamina-tmp-x/b", ".lamina-tmp-").is_err());
    }

    #[test]
    fn multipart_etag_composition() {
        let digests = [[0u8; 16], [1u8; 16], [2u8; 16]];
        let etag = compose_multipart_etag(&digests);
        assert!(etag.ends_with("-3"));
        assert_eq!(etag.len(), 32 + 2);
    }
}
