//! Routes spec §6's endpoint table onto [`ObjectStorageFacade`] calls.
//! Grounded on the teacher's `local_backend::router` shape (`State<Arc<...>>`,
//! a `tower::ServiceBuilder` trace layer) without its app-specific handlers;
//! every handler here is new, written against this repo's own routing table.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use lamina_common::error::{classify, S3Error};
use lamina_common::model::{BucketType, MultipartUpload, S3ObjectInfo};
use lamina_facade::{ObjectStorageFacade, PutObjectRequest};
use lamina_sigv4::{ChunkSignatureValidator, ChunkValidatorConfig};
use lamina_storage::multipart::CompletedPartSpec;
use lamina_storage::ChecksumRequest;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{self, Authorizer};
use crate::config::ServerConfig;
use crate::xml;

pub struct AppState {
    pub facade: Arc<ObjectStorageFacade>,
    pub config: ServerConfig,
    pub authorizer: Arc<dyn Authorizer>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(list_buckets))
        .route(
            "/:bucket",
            get(bucket_get_dispatch)
                .put(bucket_put_dispatch)
                .delete(bucket_delete_dispatch)
                .post(delete_multiple_objects),
        )
        .route(
            "/:bucket/*key",
            get(get_object)
                .head(head_object)
                .put(object_put_dispatch)
                .delete(object_delete_dispatch)
                .post(object_post_dispatch),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(err: anyhow::Error, resource: Option<String>) -> Response {
    let classified = classify(&err);
    let status = classified.kind.status();
    let body = xml::ErrorResponseXml::new(classified.kind.code(), &classified.message, resource);
    let xml_body = xml::to_xml_string(&body).unwrap_or_default();
    (
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [("Content-Type", "application/xml")],
        xml_body,
    )
        .into_response()
}

/// What a successful [`authenticate`] call hands back: the caller's access
/// key plus the header signature a streaming `aws-chunked` body seeds its
/// first chunk signature from (spec §4.3).
struct Authenticated {
    access_key: String,
    seed_signature: String,
    amz_date: String,
    date: String,
}

/// Verifies the `Authorization` header against `config` and the single
/// authorization predicate, returning the caller's access key (and the
/// verified request's seed signature, for streaming bodies) on success.
fn authenticate(state: &AppState, method: &str, path: &str, query: &str, headers: &HeaderMap, bucket: &str, action: &str) -> Result<Authenticated, Response> {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| error_response(anyhow::Error::new(S3Error::access_denied("missing Authorization header")), None))?;

    let mut header_map = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str().to_lowercase();
        let value = value.to_str().unwrap_or_default();
        header_map
            .entry(name)
            .and_modify(|existing: &mut String| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let query_pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let verified = auth::verify_request(&state.config, method, path, &query_pairs, &header_map, authorization)
        .map_err(|e| error_response(e, None))?;
    let access_key = state.config.access_key.clone();

    if !state.authorizer.is_allowed(&access_key, bucket, action) {
        return Err(error_response(anyhow::Error::new(S3Error::access_denied("not authorized")), Some(bucket.to_string())));
    }

    Ok(Authenticated {
        access_key,
        seed_signature: verified.seed_signature,
        amz_date: verified.amz_date,
        date: verified.date,
    })
}

/// Builds a `ChunkSignatureValidator` for a streaming body, seeded from the
/// already-verified header signature, when `x-amz-content-sha256` names one
/// of the two streaming payload forms.
fn chunk_validator_for(state: &AppState, headers: &HeaderMap, seed_signature: &str, amz_date: &str, date: &str) -> Option<ChunkSignatureValidator> {
    let content_sha256 = headers.get("x-amz-content-sha256")?.to_str().ok()?;
    let expects_trailers = content_sha256 == "STREAMING-AWS4-HMAC-SHA256-PAYLOAD-TRAILER";
    if content_sha256 != "STREAMING-AWS4-HMAC-SHA256-PAYLOAD" && !expects_trailers {
        return None;
    }
    let decoded_content_length = headers
        .get("x-amz-decoded-content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    Some(ChunkSignatureValidator::new(ChunkValidatorConfig {
        secret_key: state.config.secret_key.clone(),
        date: date.to_string(),
        region: state.config.region.clone(),
        amz_date: amz_date.to_string(),
        seed_signature: seed_signature.to_string(),
        expected_decoded_length: decoded_content_length,
        expects_trailers,
        expected_trailer_names: Default::default(),
    }))
}

fn parse_query(raw: &str) -> BTreeMap<String, String> {
    raw.split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            (
                parts.next().unwrap_or_default().to_string(),
                percent_encoding::percent_decode_str(parts.next().unwrap_or_default())
                    .decode_utf8_lossy()
                    .into_owned(),
            )
        })
        .collect()
}

async fn list_buckets(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authenticate(&state, "GET", "/", "", &headers, "", "ListBuckets") {
        return resp;
    }
    match state.facade.list_buckets().await {
        Ok(buckets) => {
            let body = xml::ListAllMyBucketsResultXml::new(&state.config.access_key, &state.config.access_key, &buckets);
            xml_ok(&body)
        },
        Err(err) => error_response(err, None),
    }
}

fn xml_ok<T: serde::Serialize>(value: &T) -> Response {
    match xml::to_xml_string(value) {
        Ok(body) => (StatusCode::OK, [("Content-Type", "application/xml")], body).into_response(),
        Err(err) => error_response(err, None),
    }
}

/// `PUT /<bucket>` fans out by query marker: tagging, or plain bucket
/// creation.
async fn bucket_put_dispatch(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = parse_query(raw_query.as_deref().unwrap_or_default());
    let action = if query.contains_key("tagging") { "PutBucketTagging" } else { "CreateBucket" };
    if let Err(resp) = authenticate(&state, "PUT", &format!("/{bucket}"), raw_query.as_deref().unwrap_or_default(), &headers, &bucket, action) {
        return resp;
    }

    if query.contains_key("tagging") {
        let body_str = match std::str::from_utf8(&body) {
            Ok(s) => s,
            Err(_) => return error_response(anyhow::Error::new(S3Error::invalid_argument("request body is not valid UTF-8")), None),
        };
        let tagging: xml::TaggingXml = match xml::from_xml_str(body_str) {
            Ok(v) => v,
            Err(err) => return error_response(err, None),
        };
        return match state.facade.put_bucket_tags(&bucket, tagging.into_map()).await {
            Ok(()) => StatusCode::OK.into_response(),
            Err(err) => error_response(err, Some(bucket)),
        };
    }

    match state.facade.create_bucket(&bucket, BucketType::GeneralPurpose, None, None).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => error_response(err, Some(bucket)),
    }
}

async fn bucket_delete_dispatch(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = parse_query(raw_query.as_deref().unwrap_or_default());
    if let Err(resp) = authenticate(&state, "DELETE", &format!("/{bucket}"), raw_query.as_deref().unwrap_or_default(), &headers, &bucket, "DeleteBucket") {
        return resp;
    }

    if query.contains_key("tagging") {
        return match state.facade.put_bucket_tags(&bucket, BTreeMap::new()).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(err) => error_response(err, Some(bucket)),
        };
    }

    match state.facade.delete_bucket(&bucket).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err, Some(bucket)),
    }
}

/// `/<bucket>?<query>` fans out by query marker: tagging, uploads listing,
/// or a plain `ListObjects`/`GetBucketLocation`/versioning stub.
async fn bucket_get_dispatch(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    axum::extract::RawQuery(raw_query_string): axum::extract::RawQuery,
    headers: HeaderMap,
) -> Response {
    let action = "GetBucket";
    let raw_query = parse_query(raw_query_string.as_deref().unwrap_or_default());
    if let Err(resp) = authenticate(&state, "GET", &format!("/{bucket}"), raw_query_string.as_deref().unwrap_or_default(), &headers, &bucket, action) {
        return resp;
    }

    if raw_query.contains_key("tagging") {
        return match state.facade.list_buckets().await {
            Ok(buckets) => {
                let tags = buckets.into_iter().find(|b| b.name == bucket).map(|b| b.tags).unwrap_or_default();
                xml_ok(&xml::TaggingXml::from_map(&tags))
            },
            Err(err) => error_response(err, Some(bucket)),
        };
    }

    if raw_query.contains_key("location") {
        #[derive(serde::Serialize)]
        #[serde(rename = "LocationConstraint")]
        struct LocationConstraint(String);
        return xml_ok(&LocationConstraint(state.config.region.clone()));
    }

    if raw_query.contains_key("versioning") {
        #[derive(serde::Serialize)]
        #[serde(rename = "VersioningConfiguration")]
        struct VersioningConfiguration {}
        return xml_ok(&VersioningConfiguration {});
    }

    if raw_query.contains_key("uploads") {
        return match state.facade.list_multipart_uploads(&bucket).await {
            Ok(uploads) => list_multipart_uploads_response(&bucket, &uploads),
            Err(err) => error_response(err, Some(bucket)),
        };
    }

    let prefix = raw_query.get("prefix").cloned().unwrap_or_default();
    let delimiter = raw_query.get("delimiter").cloned();
    let start_after = raw_query
        .get("start-after")
        .or_else(|| raw_query.get("marker"))
        .cloned();
    let max_keys: usize = raw_query
        .get("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    match state
        .facade
        .list_objects(&bucket, BucketType::GeneralPurpose, &prefix, delimiter.as_deref(), start_after.as_deref(), max_keys)
        .await
    {
        Ok(outcome) => {
            let body = xml::ListBucketResultXml {
                xmlns: xml::S3_XMLNS,
                name: bucket,
                prefix,
                delimiter,
                max_keys: max_keys as u32,
                is_truncated: outcome.truncated,
                contents: outcome.objects.iter().map(|o| xml::ContentsXml::from(&o.info)).collect(),
                common_prefixes: outcome.common_prefixes.into_iter().map(|p| xml::CommonPrefixXml { prefix: p }).collect(),
            };
            xml_ok(&body)
        },
        Err(err) => error_response(err, None),
    }
}

fn list_multipart_uploads_response(bucket: &str, uploads: &[MultipartUpload]) -> Response {
    #[derive(serde::Serialize)]
    #[serde(rename = "Upload")]
    struct UploadXml {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "UploadId")]
        upload_id: String,
        #[serde(rename = "Initiated")]
        initiated: chrono::DateTime<chrono::Utc>,
    }
    #[derive(serde::Serialize)]
    #[serde(rename = "ListMultipartUploadsResult")]
    struct ListMultipartUploadsResultXml {
        #[serde(rename = "@xmlns")]
        xmlns: &'static str,
        #[serde(rename = "Bucket")]
        bucket: String,
        #[serde(rename = "Upload")]
        upload: Vec<UploadXml>,
    }
    let body = ListMultipartUploadsResultXml {
        xmlns: xml::S3_XMLNS,
        bucket: bucket.to_string(),
        upload: uploads
            .iter()
            .map(|u| UploadXml {
                key: u.key.clone(),
                upload_id: u.upload_id.clone(),
                initiated: u.initiated,
            })
            .collect(),
    };
    xml_ok(&body)
}

async fn delete_multiple_objects(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = authenticate(&state, "POST", &format!("/{bucket}"), "delete", &headers, &bucket, "DeleteObject") {
        return resp;
    }
    let body_str = match std::str::from_utf8(&body) {
        Ok(s) => s,
        Err(_) => return error_response(anyhow::Error::new(S3Error::invalid_argument("request body is not valid UTF-8")), None),
    };
    let parsed: xml::DeleteRequestXml = match xml::from_xml_str(body_str) {
        Ok(v) => v,
        Err(err) => return error_response(err, None),
    };
    let keys: Vec<String> = parsed.object.into_iter().map(|o| o.key).collect();
    let cancel = CancellationToken::new();
    let outcome = state.facade.delete_multiple_objects(&bucket, &keys, parsed.quiet, &cancel).await;
    let response = xml::DeleteResultXml {
        xmlns: xml::S3_XMLNS,
        deleted: outcome.deleted.into_iter().map(|key| xml::DeletedXml { key }).collect(),
        error: outcome
            .errors
            .into_iter()
            .map(|(key, message)| xml::DeleteErrorXml { key, message })
            .collect(),
    };
    xml_ok(&response)
}

fn parse_range_header(headers: &HeaderMap, size: u64) -> Option<(u64, u64)> {
    let raw = headers.get("range")?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        let start = size.saturating_sub(suffix);
        return Some((start, size.saturating_sub(1)));
    }
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() { size.saturating_sub(1) } else { end.parse().ok()? };
    Some((start, end.min(size.saturating_sub(1))))
}

async fn get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authenticate(&state, "GET", &format!("/{bucket}/{key}"), "", &headers, &bucket, "GetObject") {
        return resp;
    }
    let cancel = CancellationToken::new();
    let info = match state.facade.get_object(&bucket, &key, &cancel).await {
        Ok(Some(info)) => info,
        Ok(None) => return error_response(anyhow::Error::new(S3Error::no_such_key(&key)), Some(key)),
        Err(err) => return error_response(err, Some(key)),
    };

    let range = parse_range_header(&headers, info.size);
    let (tx, body_rx) = tokio::io::duplex(64 * 1024);
    let facade = state.facade.clone();
    let (bucket_owned, key_owned) = (bucket.clone(), key.clone());
    tokio::spawn(async move {
        let mut sink = tx;
        if let Err(err) = facade.write_object_to(&bucket_owned, &key_owned, &mut sink, range, &CancellationToken::new()).await {
            warn!(error = %err, "streaming object body failed midway");
        }
    });

    let status = if range.is_some() { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
    let mut response = Response::builder()
        .status(status)
        .header("Content-Type", info.content_type.clone())
        .header("ETag", format!("\"{}\"", info.etag))
        .header("Content-Length", range.map(|(s, e)| e - s + 1).unwrap_or(info.size).to_string())
        .body(Body::from_stream(tokio_util::io::ReaderStream::new(body_rx)))
        .unwrap();
    if let Some((start, end)) = range {
        response.headers_mut().insert("Content-Range", format!("bytes {start}-{end}/{}", info.size).parse().unwrap());
    }
    for (k, v) in &info.user_metadata {
        if let Ok(value) = format!("{v}").parse() {
            response.headers_mut().insert(format!("x-amz-meta-{k}").parse::<axum::http::HeaderName>().unwrap(), value);
        }
    }
    response
}

async fn head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authenticate(&state, "HEAD", &format!("/{bucket}/{key}"), "", &headers, &bucket, "GetObject") {
        return resp;
    }
    let cancel = CancellationToken::new();
    match state.facade.get_object(&bucket, &key, &cancel).await {
        Ok(Some(info)) => head_response(&info),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn head_response(info: &S3ObjectInfo) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", info.content_type.clone())
        .header("Content-Length", info.size.to_string())
        .header("ETag", format!("\"{}\"", info.etag))
        .body(Body::empty())
        .unwrap()
}

fn collect_user_metadata(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str();
            name.strip_prefix("x-amz-meta-").map(|suffix| (suffix.to_string(), value.to_str().unwrap_or_default().to_string()))
        })
        .collect()
}

async fn object_put_dispatch(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = parse_query(raw_query.as_deref().unwrap_or_default());
    let action = if headers.contains_key("x-amz-copy-source") { "CopyObject" } else { "PutObject" };
    let authenticated = match authenticate(&state, "PUT", &format!("/{bucket}/{key}"), raw_query.as_deref().unwrap_or_default(), &headers, &bucket, action) {
        Ok(authenticated) => authenticated,
        Err(resp) => return resp,
    };

    if let (Some(part_number), Some(upload_id)) = (query.get("partNumber"), query.get("uploadId")) {
        return upload_part(&state, part_number, upload_id, &headers, &authenticated, body).await;
    }

    if let Some(copy_source) = headers.get("x-amz-copy-source").and_then(|v| v.to_str().ok()) {
        return copy_object(&state, &bucket, &key, copy_source).await;
    }

    let content_sha256 = headers.get("x-amz-content-sha256").and_then(|v| v.to_str().ok()).unwrap_or("");
    let is_streaming = content_sha256.starts_with("STREAMING-");
    let chunk_validator = chunk_validator_for(&state, &headers, &authenticated.seed_signature, &authenticated.amz_date, &authenticated.date);

    let content_type = headers.get("content-type").and_then(|v| v.to_str().ok()).map(str::to_string);
    let request = PutObjectRequest {
        bucket: bucket.clone(),
        key: key.clone(),
        is_streaming,
        content_type,
        user_metadata: collect_user_metadata(&headers),
        owner_id: None,
        owner_display_name: None,
        checksums: ChecksumRequest::default(),
    };
    let mut reader = std::io::Cursor::new(body.to_vec());
    let cancel = CancellationToken::new();
    match state.facade.put_object(request, &mut reader, chunk_validator, &cancel).await {
        Ok(info) => Response::builder()
            .status(StatusCode::OK)
            .header("ETag", format!("\"{}\"", info.etag))
            .body(Body::empty())
            .unwrap(),
        Err(err) => error_response(err, Some(key)),
    }
}

async fn upload_part(state: &AppState, part_number: &str, upload_id: &str, headers: &HeaderMap, authenticated: &Authenticated, body: Bytes) -> Response {
    let part_number: u16 = match part_number.parse() {
        Ok(n) => n,
        Err(_) => return error_response(anyhow::Error::new(S3Error::invalid_argument("partNumber must be an integer")), None),
    };
    let content_sha256 = headers.get("x-amz-content-sha256").and_then(|v| v.to_str().ok()).unwrap_or("");
    let is_streaming = content_sha256.starts_with("STREAMING-");
    let chunk_validator = chunk_validator_for(state, headers, &authenticated.seed_signature, &authenticated.amz_date, &authenticated.date);

    let mut reader = std::io::Cursor::new(body.to_vec());
    let cancel = CancellationToken::new();
    match state.facade.upload_part(upload_id, part_number, &mut reader, chunk_validator, is_streaming, &cancel).await {
        Ok(part) => Response::builder()
            .status(StatusCode::OK)
            .header("ETag", format!("\"{}\"", part.etag))
            .body(Body::empty())
            .unwrap(),
        Err(err) => error_response(err, None),
    }
}

async fn copy_object(state: &AppState, dst_bucket: &str, dst_key: &str, copy_source: &str) -> Response {
    let decoded = percent_encoding::percent_decode_str(copy_source.trim_start_matches('/')).decode_utf8_lossy().into_owned();
    let (src_bucket, src_key) = match decoded.split_once('/') {
        Some(parts) => parts,
        None => return error_response(anyhow::Error::new(S3Error::invalid_argument("malformed x-amz-copy-source")), None),
    };
    let cancel = CancellationToken::new();
    match state.facade.copy_object(src_bucket, src_key, dst_bucket, dst_key, &cancel).await {
        Ok(info) => {
            let body = xml::CopyObjectResultXml { etag: format!("\"{}\"", info.etag), last_modified: info.last_modified };
            xml_ok(&body)
        },
        Err(err) => error_response(err, Some(dst_key.to_string())),
    }
}

/// `DELETE /<bucket>/<key>?uploadId=...` aborts a multipart upload instead
/// of deleting a published object.
async fn object_delete_dispatch(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = parse_query(raw_query.as_deref().unwrap_or_default());
    if let Err(resp) = authenticate(&state, "DELETE", &format!("/{bucket}/{key}"), raw_query.as_deref().unwrap_or_default(), &headers, &bucket, "DeleteObject") {
        return resp;
    }

    if let Some(upload_id) = query.get("uploadId") {
        return match state.facade.abort_multipart_upload(upload_id).await {
            Ok(_) => StatusCode::NO_CONTENT.into_response(),
            Err(err) => error_response(err, Some(key)),
        };
    }

    let cancel = CancellationToken::new();
    match state.facade.delete_object(&bucket, &key, &cancel).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err, Some(key)),
    }
}

/// `POST /<bucket>/<key>?uploads|uploadId=...` fans out to initiate/complete.
async fn object_post_dispatch(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    raw_query: axum::extract::RawQuery,
    body: Bytes,
) -> Response {
    let query = parse_query(raw_query.0.as_deref().unwrap_or_default());
    if let Err(resp) = authenticate(&state, "POST", &format!("/{bucket}/{key}"), raw_query.0.as_deref().unwrap_or_default(), &headers, &bucket, "PutObject") {
        return resp;
    }

    if query.contains_key("uploads") {
        let content_type = headers.get("content-type").and_then(|v| v.to_str().ok()).map(str::to_string);
        return match state
            .facade
            .initiate_multipart_upload(&bucket, &key, content_type, collect_user_metadata(&headers), None)
            .await
        {
            Ok(upload_id) => xml_ok(&xml::InitiateMultipartUploadResultXml {
                xmlns: xml::S3_XMLNS,
                bucket,
                key,
                upload_id,
            }),
            Err(err) => error_response(err, Some(key)),
        };
    }

    if let Some(upload_id) = query.get("uploadId") {
        let body_str = match std::str::from_utf8(&body) {
            Ok(s) => s,
            Err(_) => return error_response(anyhow::Error::new(S3Error::invalid_argument("request body is not valid UTF-8")), None),
        };
        let parsed: xml::CompleteMultipartUploadXml = match xml::from_xml_str(body_str) {
            Ok(v) => v,
            Err(err) => return error_response(err, None),
        };
        let parts: Vec<CompletedPartSpec> = parsed
            .part
            .into_iter()
            .map(|p| CompletedPartSpec { part_number: p.part_number, etag: p.etag })
            .collect();
        let cancel = CancellationToken::new();
        return match state.facade.complete_multipart_upload(&bucket, &key, upload_id, &parts, &cancel).await {
            Ok(info) => xml_ok(&xml::CompleteMultipartUploadResultXml {
                xmlns: xml::S3_XMLNS,
                bucket,
                key,
                etag: format!("\"{}\"", info.etag),
            }),
            Err(err) => error_response(err, Some(key)),
        };
    }

    error_response(anyhow::Error::new(S3Error::invalid_argument("unsupported POST query")), Some(key))
}
