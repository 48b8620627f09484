//! Header-based (non-streaming) SigV4 request verification.
//!
//! `lamina_sigv4::calculator` only supplies the pure HMAC math over an
//! already-canonicalized request; building that canonical form from an
//! actual `http::Request` — percent-encoding the URI and folding headers
//! into the `CanonicalHeaders`/`SignedHeaders` blocks — is this module's
//! job, grounded on `minio-rs`'s `s3::signer`/`s3::utils` percent-encoding
//! conventions (`percent_encoding::AsciiSet` built from `NON_ALPHANUMERIC`
//! with the characters S3 leaves unescaped removed).

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use lamina_common::S3Error;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::config::ServerConfig;

/// Characters a URI path segment leaves unescaped: alnum plus `-_.~/`.
const URI_PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Characters a query key/value leaves unescaped: alnum plus `-_.~` (no
/// `/`, unlike the path set — AWS requires query values fully encoded).
const QUERY_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn encode_uri_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, URI_PATH_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_query_component(s: &str) -> String {
    utf8_percent_encode(s, QUERY_SET).to_string()
}

/// Sorts by (encoded key, encoded value) and joins `k=v` pairs with `&`,
/// per SigV4's `CanonicalQueryString` rule.
pub fn canonical_query_string(pairs: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (encode_query_component(k), encode_query_component(v)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

struct ParsedAuthorizationHeader {
    access_key: String,
    date: String,
    region: String,
    signed_headers: Vec<String>,
    signature: String,
}

/// `AWS4-HMAC-SHA256 Credential=<key>/<date>/<region>/s3/aws4_request, SignedHeaders=a;b;c, Signature=<hex>`
fn parse_authorization_header(value: &str) -> anyhow::Result<ParsedAuthorizationHeader> {
    let rest = value
        .strip_prefix("AWS4-HMAC-SHA256 ")
        .ok_or_else(|| S3Error::signature_does_not_match("unsupported Authorization scheme"))?;

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for field in rest.split(',') {
        let field = field.trim();
        if let Some(v) = field.strip_prefix("Credential=") {
            credential = Some(v);
        } else if let Some(v) = field.strip_prefix("SignedHeaders=") {
            signed_headers = Some(v);
        } else if let Some(v) = field.strip_prefix("Signature=") {
            signature = Some(v);
        }
    }

    let credential =
        credential.ok_or_else(|| S3Error::signature_does_not_match("missing Credential"))?;
    let signed_headers =
        signed_headers.ok_or_else(|| S3Error::signature_does_not_match("missing SignedHeaders"))?;
    let signature =
        signature.ok_or_else(|| S3Error::signature_does_not_match("missing Signature"))?;

    let mut parts = credential.splitn(5, '/');
    let access_key = parts.next().unwrap_or_default().to_string();
    let date = parts.next().unwrap_or_default().to_string();
    let region = parts.next().unwrap_or_default().to_string();

    Ok(ParsedAuthorizationHeader {
        access_key,
        date,
        region,
        signed_headers: signed_headers.split(';').map(str::to_string).collect(),
        signature: signature.to_string(),
    })
}

pub struct VerifiedRequest {
    /// The payload-hash sentinel from `x-amz-content-sha256`: a hex
    /// digest, `UNSIGNED-PAYLOAD`, or one of the two streaming markers.
    pub content_sha256: String,
    pub amz_date: String,
    pub date: String,
    pub region: String,
    /// Seeds a [`lamina_sigv4::ChunkSignatureValidator`] for the two
    /// streaming payload forms; unused for a fully-buffered/unsigned body.
    pub seed_signature: String,
}

/// Verifies a request's `Authorization` header against the configured
/// static credential. `method`/`uri_path` are already-decoded (not
/// percent-encoded); `query_pairs` are the raw (not yet encoded) key/value
/// pairs from the query string; `headers` holds every header name
/// (lowercased) to its joined value, as the canonicalization needs it.
#[allow(clippy::too_many_arguments)]
pub fn verify_request(
    config: &ServerConfig,
    method: &str,
    uri_path: &str,
    query_pairs: &[(String, String)],
    headers: &BTreeMap<String, String>,
    authorization_header: &str,
) -> anyhow::Result<VerifiedRequest> {
    let parsed = parse_authorization_header(authorization_header)?;

    if parsed.access_key != config.access_key {
        anyhow::bail!(S3Error::signature_does_not_match("unknown access key"));
    }
    if parsed.region != config.region {
        anyhow::bail!(S3Error::signature_does_not_match("region mismatch"));
    }

    let amz_date = headers
        .get("x-amz-date")
        .ok_or_else(|| S3Error::signature_does_not_match("missing x-amz-date header"))?
        .clone();
    check_clock_skew(&amz_date)?;

    let content_sha256 = headers
        .get("x-amz-content-sha256")
        .cloned()
        .unwrap_or_else(|| lamina_sigv4::EMPTY_SHA256_HEX.to_string());

    let canonical_headers: String = parsed
        .signed_headers
        .iter()
        .map(|name| {
            let value = headers.get(name).map(String::as_str).unwrap_or("");
            format!("{name}:{}\n", value.trim())
        })
        .collect::<Vec<_>>()
        .join("")
        .trim_end_matches('\n')
        .to_string();
    let signed_headers_joined = parsed.signed_headers.join(";");

    let hash = lamina_sigv4::canonical_request_hash(
        method,
        &encode_uri_path(uri_path),
        &canonical_query_string(query_pairs),
        &canonical_headers,
        &signed_headers_joined,
        &content_sha256,
    );

    let scope = lamina_sigv4::scope(&parsed.date, &parsed.region, "s3");
    let string_to_sign = lamina_sigv4::seed_string_to_sign(&amz_date, &scope, &hash);
    let signing_key =
        lamina_sigv4::derive_signing_key(&config.secret_key, &parsed.date, &parsed.region, "s3");
    let expected = lamina_sigv4::sign(&signing_key, &string_to_sign);

    if expected != parsed.signature {
        anyhow::bail!(S3Error::signature_does_not_match(
            "the request signature does not match the calculated signature"
        ));
    }

    Ok(VerifiedRequest {
        content_sha256,
        amz_date,
        date: parsed.date,
        region: parsed.region,
        seed_signature: expected,
    })
}

fn check_clock_skew(amz_date: &str) -> anyhow::Result<()> {
    let parsed = chrono::NaiveDateTime::parse_from_str(amz_date, "%Y%m%dT%H%M%SZ")
        .map_err(|_| S3Error::signature_does_not_match("malformed x-amz-date"))?;
    let parsed = parsed.and_utc();
    let skew = (Utc::now() - parsed).abs();
    if skew > Duration::minutes(15) {
        anyhow::bail!(S3Error::signature_does_not_match("request timestamp outside the 15 minute window"));
    }
    Ok(())
}

/// The spec's single-predicate authorization seam: a full IAM-style policy
/// language is out of scope, but a hook deciding "may this principal
/// perform this action on this resource" is kept so a caller can plug in
/// one later without touching the routing layer.
pub trait Authorizer: Send + Sync {
    fn is_allowed(&self, access_key: &str, bucket: &str, action: &str) -> bool;
}

/// The only predicate shipped: any verified static-credential holder may
/// perform any action on any bucket.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn is_allowed(&self, _access_key: &str, _bucket: &str, _action: &str) -> bool {
        true
    }
}
