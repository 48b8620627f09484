//! End-to-end scenarios driven straight at the router through
//! `tower::ServiceExt::oneshot`, the idiomatic way to exercise an axum
//! `Router` without binding a real socket.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use lamina_facade::ObjectStorageFacade;
use lamina_lock::InProcessLockManager;
use lamina_server::config::ServerConfig;
use lamina_server::router::{build_router, AppState};
use lamina_server::{auth, xml};
use lamina_storage::{
    DataStorageProbe, FilesystemBucketStorage, FilesystemDataStorage, FilesystemMultipartStorage, InMemoryMetadataStorage,
    ObjectMetadataStorage,
};
use tower::ServiceExt;

fn test_app(data_root: &std::path::Path) -> (Arc<AppState>, ServerConfig, Arc<InMemoryMetadataStorage>) {
    let config = ServerConfig::new_for_test(data_root).expect("valid test config");
    let data = Arc::new(FilesystemDataStorage::new(data_root));
    let metadata = Arc::new(InMemoryMetadataStorage::new());
    let multipart = Arc::new(FilesystemMultipartStorage::new(data_root));
    let buckets = Arc::new(FilesystemBucketStorage::new(data_root, data.clone()));
    let probe = Arc::new(DataStorageProbe::new(data.clone()));
    let lock = Arc::new(InProcessLockManager::new(config.lock_key_prefix.clone()));
    let facade = Arc::new(ObjectStorageFacade::new(
        data,
        metadata.clone(),
        multipart,
        buckets,
        lock,
        probe,
        config.temp_file_prefix.clone(),
    ));
    let state = Arc::new(AppState {
        facade,
        authorizer: Arc::new(auth::AllowAllAuthorizer),
        config: config.clone(),
    });
    (state, config, metadata)
}

/// Signs a request the way a real SigV4 client would, reusing the same
/// canonicalization helpers the server verifies against so the test fixture
/// doesn't drift from the production path.
fn signed_request(
    config: &ServerConfig,
    method: &str,
    path: &str,
    query_pairs: &[(String, String)],
    extra_headers: &[(&str, &str)],
    body: Vec<u8>,
) -> Request<Body> {
    let now = chrono::Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let payload_hash = lamina_sigv4::sha256_hex(&body);

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    headers.insert("host".to_string(), "s3.example.com".to_string());
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
    for (name, value) in extra_headers {
        headers.insert(name.to_lowercase(), value.to_string());
    }

    let mut signed_header_names: Vec<&String> = headers.keys().collect();
    signed_header_names.sort();
    let signed_headers_joined = signed_header_names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(";");
    let canonical_headers = signed_header_names
        .iter()
        .map(|name| format!("{name}:{}\n", headers.get(*name).unwrap()))
        .collect::<String>();
    let canonical_headers = canonical_headers.trim_end_matches('\n');

    let hash = lamina_sigv4::canonical_request_hash(
        method,
        &auth::encode_uri_path(path),
        &auth::canonical_query_string(query_pairs),
        canonical_headers,
        &signed_headers_joined,
        &payload_hash,
    );
    let scope = lamina_sigv4::scope(&date, &config.region, "s3");
    let string_to_sign = lamina_sigv4::seed_string_to_sign(&amz_date, &scope, &hash);
    let signing_key = lamina_sigv4::derive_signing_key(&config.secret_key, &date, &config.region, "s3");
    let signature = lamina_sigv4::sign(&signing_key, &string_to_sign);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{date}/{}/s3/aws4_request, SignedHeaders={signed_headers_joined}, Signature={signature}",
        config.access_key, config.region
    );

    let query_string = auth::canonical_query_string(query_pairs);
    let uri = if query_string.is_empty() {
        path.to_string()
    } else {
        // Canonicalization re-encodes; the wire query string here is
        // unencoded on purpose since these tests don't exercise characters
        // that would differ between the two forms.
        format!("{path}?{}", query_pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&"))
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "s3.example.com")
        .header("x-amz-date", amz_date)
        .header("x-amz-content-sha256", payload_hash)
        .header("authorization", authorization);
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn create_bucket_put_object_then_get_it_back() {
    let dir = tempfile::tempdir().unwrap();
    let (state, config, _metadata) = test_app(dir.path());
    let app = build_router(state);

    let create = signed_request(&config, "PUT", "/widgets", &[], &[], Vec::new());
    let response = app.clone().oneshot(create).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = b"hello lamina".to_vec();
    let put = signed_request(&config, "PUT", "/widgets/hello.txt", &[], &[("content-type", "text/plain")], body.clone());
    let response = app.clone().oneshot(put).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("etag"));

    let get = signed_request(&config, "GET", "/widgets/hello.txt", &[], &[], Vec::new());
    let response = app.clone().oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(fetched.as_ref(), body.as_slice());
}

#[tokio::test]
async fn get_object_range_request_returns_partial_content() {
    let dir = tempfile::tempdir().unwrap();
    let (state, config, _metadata) = test_app(dir.path());
    let app = build_router(state);

    app.clone()
        .oneshot(signed_request(&config, "PUT", "/widgets", &[], &[], Vec::new()))
        .await
        .unwrap();
    app.clone()
        .oneshot(signed_request(&config, "PUT", "/widgets/range.bin", &[], &[], b"0123456789".to_vec()))
        .await
        .unwrap();

    let get = signed_request(&config, "GET", "/widgets/range.bin", &[], &[("range", "bytes=2-5")], Vec::new());
    let response = app.oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let content_range = response.headers().get("content-range").unwrap().to_str().unwrap().to_string();
    assert_eq!(content_range, "bytes 2-5/10");
    let fetched = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(fetched.as_ref(), b"2345");
}

#[tokio::test]
async fn missing_authorization_header_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _config, _metadata) = test_app(dir.path());
    let app = build_router(state);

    let request = Request::builder().method("GET").uri("/").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (state, config, _metadata) = test_app(dir.path());
    let app = build_router(state);

    let mut request = signed_request(&config, "GET", "/", &[], &[], Vec::new());
    let bad_auth = request.headers().get("authorization").unwrap().to_str().unwrap().replace("Signature=", "Signature=deadbeef");
    request.headers_mut().insert("authorization", bad_auth.parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn multipart_upload_round_trip_via_complete() {
    let dir = tempfile::tempdir().unwrap();
    let (state, config, _metadata) = test_app(dir.path());
    let app = build_router(state);

    app.clone()
        .oneshot(signed_request(&config, "PUT", "/widgets", &[], &[], Vec::new()))
        .await
        .unwrap();

    let initiate = signed_request(&config, "POST", "/widgets/big.bin", &[("uploads".to_string(), String::new())], &[], Vec::new());
    let response = app.clone().oneshot(initiate).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();

    #[derive(serde::Deserialize)]
    #[serde(rename = "InitiateMultipartUploadResult")]
    struct InitiateResult {
        #[serde(rename = "UploadId")]
        upload_id: String,
    }
    let parsed: InitiateResult = xml::from_xml_str(std::str::from_utf8(&body).unwrap()).unwrap();
    let upload_id = parsed.upload_id;

    let part_body = vec![b'x'; 5 * 1024 * 1024];
    let part = signed_request(
        &config,
        "PUT",
        "/widgets/big.bin",
        &[("partNumber".to_string(), "1".to_string()), ("uploadId".to_string(), upload_id.clone())],
        &[],
        part_body,
    );
    let response = app.clone().oneshot(part).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response.headers().get("etag").unwrap().to_str().unwrap().trim_matches('"').to_string();

    let complete_body = format!(
        r#"<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>"{etag}"</ETag></Part></CompleteMultipartUpload>"#
    )
    .into_bytes();
    let complete = signed_request(
        &config,
        "POST",
        "/widgets/big.bin",
        &[("uploadId".to_string(), upload_id)],
        &[],
        complete_body,
    );
    let response = app.oneshot(complete).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (state, config, _metadata) = test_app(dir.path());
    let app = build_router(state);

    app.clone()
        .oneshot(signed_request(&config, "PUT", "/widgets", &[], &[], Vec::new()))
        .await
        .unwrap();
    app.clone()
        .oneshot(signed_request(&config, "PUT", "/widgets/gone.txt", &[], &[], b"bye".to_vec()))
        .await
        .unwrap();
    let delete = signed_request(&config, "DELETE", "/widgets/gone.txt", &[], &[], Vec::new());
    let response = app.clone().oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let get = signed_request(&config, "GET", "/widgets/gone.txt", &[], &[], Vec::new());
    let response = app.oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Builds an `aws-chunked` streaming PUT, chaining each chunk's signature
/// off the header signature the way a real SigV4 streaming client does, so
/// the router's `ChunkSignatureValidator` (seeded from that same signature)
/// accepts it.
fn streaming_signed_request(config: &ServerConfig, method: &str, path: &str, chunks: &[&[u8]]) -> Request<Body> {
    let now = chrono::Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let payload_hash = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD".to_string();
    let decoded_content_length: u64 = chunks.iter().map(|c| c.len() as u64).sum();

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    headers.insert("host".to_string(), "s3.example.com".to_string());
    headers.insert("x-amz-date".to_string(), amz_date.clone());
    headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
    headers.insert("x-amz-decoded-content-length".to_string(), decoded_content_length.to_string());

    let mut signed_header_names: Vec<&String> = headers.keys().collect();
    signed_header_names.sort();
    let signed_headers_joined = signed_header_names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(";");
    let canonical_headers = signed_header_names
        .iter()
        .map(|name| format!("{name}:{}\n", headers.get(*name).unwrap()))
        .collect::<String>();
    let canonical_headers = canonical_headers.trim_end_matches('\n');

    let hash = lamina_sigv4::canonical_request_hash(
        method,
        &auth::encode_uri_path(path),
        &auth::canonical_query_string(&[]),
        canonical_headers,
        &signed_headers_joined,
        &payload_hash,
    );
    let scope = lamina_sigv4::scope(&date, &config.region, "s3");
    let string_to_sign = lamina_sigv4::seed_string_to_sign(&amz_date, &scope, &hash);
    let signing_key = lamina_sigv4::derive_signing_key(&config.secret_key, &date, &config.region, "s3");
    let seed_signature = lamina_sigv4::sign(&signing_key, &string_to_sign);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{date}/{}/s3/aws4_request, SignedHeaders={signed_headers_joined}, Signature={seed_signature}",
        config.access_key, config.region
    );

    let mut body = Vec::new();
    let mut previous_signature = seed_signature.clone();
    for chunk in chunks {
        let sts = lamina_sigv4::chunk_string_to_sign(&previous_signature, &amz_date, &scope, &lamina_sigv4::sha256_hex(chunk));
        let chunk_signature = lamina_sigv4::sign(&signing_key, &sts);
        body.extend_from_slice(format!("{:x};chunk-signature={chunk_signature}\r\n", chunk.len()).as_bytes());
        body.extend_from_slice(chunk);
        body.extend_from_slice(b"\r\n");
        previous_signature = chunk_signature;
    }
    let sts = lamina_sigv4::chunk_string_to_sign(&previous_signature, &amz_date, &scope, lamina_sigv4::EMPTY_SHA256_HEX);
    let final_signature = lamina_sigv4::sign(&signing_key, &sts);
    body.extend_from_slice(format!("0;chunk-signature={final_signature}\r\n\r\n").as_bytes());

    Request::builder()
        .method(method)
        .uri(path)
        .header("host", "s3.example.com")
        .header("x-amz-date", amz_date)
        .header("x-amz-content-sha256", payload_hash)
        .header("x-amz-decoded-content-length", decoded_content_length.to_string())
        .header("authorization", authorization)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn streaming_chunked_put_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (state, config, _metadata) = test_app(dir.path());
    let app = build_router(state);

    app.clone()
        .oneshot(signed_request(&config, "PUT", "/widgets", &[], &[], Vec::new()))
        .await
        .unwrap();

    let chunks: &[&[u8]] = &[b"hello ", b"streaming ", b"world"];
    let put = streaming_signed_request(&config, "PUT", "/widgets/streamed.bin", chunks);
    let response = app.clone().oneshot(put).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("etag"));

    let get = signed_request(&config, "GET", "/widgets/streamed.bin", &[], &[], Vec::new());
    let response = app.oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(fetched.as_ref(), b"hello streaming world");
}

#[tokio::test]
async fn get_object_with_data_but_no_metadata_synthesizes_etag() {
    let dir = tempfile::tempdir().unwrap();
    let (state, config, metadata) = test_app(dir.path());
    let app = build_router(state);

    app.clone()
        .oneshot(signed_request(&config, "PUT", "/widgets", &[], &[], Vec::new()))
        .await
        .unwrap();
    let body = b"orphaned data".to_vec();
    app.clone()
        .oneshot(signed_request(&config, "PUT", "/widgets/orphan.txt", &[], &[], body.clone()))
        .await
        .unwrap();

    assert!(metadata.delete("widgets", "orphan.txt").await.unwrap());

    use md5::Digest;
    let mut hasher = md5::Md5::new();
    hasher.update(&body);
    let expected_etag = hex::encode(hasher.finalize());
    let get = signed_request(&config, "GET", "/widgets/orphan.txt", &[], &[], Vec::new());
    let response = app.oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response.headers().get("etag").unwrap().to_str().unwrap().trim_matches('"').to_string();
    assert_eq!(etag, expected_etag);
}
