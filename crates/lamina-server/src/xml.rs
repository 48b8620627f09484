//! S3 XML wire bodies, built on `quick-xml`'s serde integration (already a
//! workspace dependency via the `serialize` feature).
//!
//! Requests may or may not carry the `http://s3.amazonaws.com/doc/2006-03-01/`
//! namespace; `quick-xml`'s derived `Deserialize` has no notion of a
//! "default, ignorable" namespace, so [`strip_default_namespace`] peels a
//! matching `xmlns="..."` attribute off the root element before handing the
//! body to `quick_xml::de::from_str`. Responses are always written with the
//! namespace attached, matching what every S3 client expects.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lamina_common::model::{Bucket, S3ObjectInfo};
use lamina_common::request_id::RequestContext;
use serde::{Deserialize, Serialize};

pub const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Strips a root-element `xmlns="http://s3.amazonaws.com/doc/2006-03-01/"`
/// attribute, if present, so namespaced and non-namespaced request bodies
/// parse identically.
pub fn strip_default_namespace(body: &str) -> Cow<'_, str> {
    let needle = format!(" xmlns=\"{S3_XMLNS}\"");
    if body.contains(&needle) {
        Cow::Owned(body.replacen(&needle, "", 1))
    } else {
        Cow::Borrowed(body)
    }
}

pub fn from_xml_str<'de, T: Deserialize<'de>>(body: &'de str) -> anyhow::Result<T> {
    let stripped = strip_default_namespace(body);
    Ok(quick_xml::de::from_str(stripped.as_ref())?)
}

pub fn to_xml_string<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let mut body = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    body.push_str(&quick_xml::se::to_string(value)?);
    Ok(body)
}

#[derive(Debug, Serialize)]
#[serde(rename = "Owner")]
pub struct OwnerXml {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "DisplayName")]
    pub display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "Bucket")]
pub struct BucketXml {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "CreationDate")]
    pub creation_date: DateTime<Utc>,
}

impl From<&Bucket> for BucketXml {
    fn from(bucket: &Bucket) -> Self {
        Self {
            name: bucket.name.clone(),
            creation_date: bucket.creation_date,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListAllMyBucketsResult")]
pub struct ListAllMyBucketsResultXml {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Owner")]
    pub owner: OwnerXml,
    #[serde(rename = "Buckets")]
    pub buckets: BucketsXml,
}

#[derive(Debug, Serialize)]
pub struct BucketsXml {
    #[serde(rename = "Bucket")]
    pub bucket: Vec<BucketXml>,
}

impl ListAllMyBucketsResultXml {
    pub fn new(owner_id: &str, owner_display_name: &str, buckets: &[Bucket]) -> Self {
        Self {
            xmlns: S3_XMLNS,
            owner: OwnerXml {
                id: owner_id.to_string(),
                display_name: owner_display_name.to_string(),
            },
            buckets: BucketsXml {
                bucket: buckets.iter().map(BucketXml::from).collect(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "Contents")]
pub struct ContentsXml {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "LastModified")]
    pub last_modified: DateTime<Utc>,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "StorageClass")]
    pub storage_class: &'static str,
}

impl From<&S3ObjectInfo> for ContentsXml {
    fn from(info: &S3ObjectInfo) -> Self {
        Self {
            key: info.key.clone(),
            last_modified: info.last_modified,
            etag: format!("\"{}\"", info.etag),
            size: info.size,
            storage_class: "STANDARD",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommonPrefixXml {
    #[serde(rename = "Prefix")]
    pub prefix: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListBucketResult")]
pub struct ListBucketResultXml {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Prefix")]
    pub prefix: String,
    #[serde(rename = "Delimiter", skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(rename = "MaxKeys")]
    pub max_keys: u32,
    #[serde(rename = "IsTruncated")]
    pub is_truncated: bool,
    #[serde(rename = "Contents")]
    pub contents: Vec<ContentsXml>,
    #[serde(rename = "CommonPrefixes", skip_serializing_if = "Vec::is_empty")]
    pub common_prefixes: Vec<CommonPrefixXml>,
}

#[derive(Debug, Serialize)]
#[serde(rename = "InitiateMultipartUploadResult")]
pub struct InitiateMultipartUploadResultXml {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUploadXml {
    #[serde(rename = "Part", default)]
    pub part: Vec<CompletedPartXml>,
}

#[derive(Debug, Deserialize)]
pub struct CompletedPartXml {
    #[serde(rename = "PartNumber")]
    pub part_number: u16,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUploadResult")]
pub struct CompleteMultipartUploadResultXml {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CopyObjectResult")]
pub struct CopyObjectResultXml {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "LastModified")]
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "Delete")]
pub struct DeleteRequestXml {
    #[serde(rename = "Object", default)]
    pub object: Vec<DeleteObjectXml>,
    #[serde(rename = "Quiet", default)]
    pub quiet: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteObjectXml {
    #[serde(rename = "Key")]
    pub key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "DeleteResult")]
pub struct DeleteResultXml {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Deleted", skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<DeletedXml>,
    #[serde(rename = "Error", skip_serializing_if = "Vec::is_empty")]
    pub error: Vec<DeleteErrorXml>,
}

#[derive(Debug, Serialize)]
pub struct DeletedXml {
    #[serde(rename = "Key")]
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteErrorXml {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename = "Tagging")]
pub struct TaggingXml {
    #[serde(rename = "TagSet")]
    pub tag_set: TagSetXml,
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct TagSetXml {
    #[serde(rename = "Tag", default)]
    pub tag: Vec<TagXml>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TagXml {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl TaggingXml {
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.tag_set
            .tag
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect()
    }

    pub fn from_map(tags: &BTreeMap<String, String>) -> Self {
        Self {
            tag_set: TagSetXml {
                tag: tags
                    .iter()
                    .map(|(k, v)| TagXml {
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .collect(),
            },
        }
    }
}

/// The S3 error-XML body (spec §7): `Code`/`Message` classify the failure,
/// `Resource` is filled in by the handler that knew the bucket/key,
/// `RequestId`/`HostId` are per-request identifiers with no bearing on the
/// storage model.
#[derive(Debug, Serialize)]
#[serde(rename = "Error")]
pub struct ErrorResponseXml {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Resource", skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(rename = "RequestId")]
    pub request_id: String,
    #[serde(rename = "HostId")]
    pub host_id: String,
}

impl ErrorResponseXml {
    pub fn new(code: &str, message: &str, resource: Option<String>) -> Self {
        let ctx = RequestContext::new();
        Self {
            code: code.to_string(),
            message: message.to_string(),
            resource,
            request_id: ctx.request_id,
            host_id: ctx.host_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_only_a_matching_default_namespace() {
        let namespaced = format!(r#"<Delete xmlns="{S3_XMLNS}"><Quiet>true</Quiet></Delete>"#);
        let stripped = strip_default_namespace(&namespaced);
        assert_eq!(stripped.as_ref(), "<Delete><Quiet>true</Quiet></Delete>");

        let bare = "<Delete><Quiet>true</Quiet></Delete>";
        assert_eq!(strip_default_namespace(bare).as_ref(), bare);
    }

    #[test]
    fn parses_complete_multipart_upload_body_with_or_without_namespace() {
        let body = format!(
            r#"<CompleteMultipartUpload xmlns="{S3_XMLNS}"><Part><PartNumber>1</PartNumber><ETag>"abc"</ETag></Part></CompleteMultipartUpload>"#
        );
        let parsed: CompleteMultipartUploadXml = from_xml_str(&body).unwrap();
        assert_eq!(parsed.part.len(), 1);
        assert_eq!(parsed.part[0].part_number, 1);

        let bare = r#"<CompleteMultipartUpload><Part><PartNumber>2</PartNumber><ETag>"def"</ETag></Part></CompleteMultipartUpload>"#;
        let parsed: CompleteMultipartUploadXml = from_xml_str(bare).unwrap();
        assert_eq!(parsed.part[0].part_number, 2);
    }

    #[test]
    fn tagging_round_trips_through_a_map() {
        let mut tags = BTreeMap::new();
        tags.insert("project".to_string(), "lamina".to_string());
        let xml = TaggingXml::from_map(&tags);
        let rendered = to_xml_string(&xml).unwrap();
        let parsed: TaggingXml = from_xml_str(&rendered).unwrap();
        assert_eq!(parsed.into_map(), tags);
    }
}
