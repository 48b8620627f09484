//! Stateful per-request chunk signature validation (spec §4.3). The rolling
//! `previous_signature` makes out-of-order validation impossible by
//! construction: each call advances the chain, so a caller cannot "skip
//! ahead" without first supplying the in-between chunk.

use std::collections::BTreeSet;

use crate::calculator::{
    chunk_string_to_sign, derive_signing_key, sha256_hex, sign, trailer_string_to_sign,
};

#[derive(Debug, Clone)]
pub struct ChunkValidatorConfig {
    pub secret_key: String,
    pub date: String,
    pub region: String,
    pub amz_date: String,
    pub seed_signature: String,
    pub expected_decoded_length: Option<u64>,
    pub expects_trailers: bool,
    pub expected_trailer_names: BTreeSet<String>,
}

/// Stateful validator carrying the HMAC signing key and the rolling
/// previous-signature. One instance is constructed per streaming PUT / part
/// upload and must see every chunk in wire order.
pub struct ChunkSignatureValidator {
    signing_key: Vec<u8>,
    amz_date: String,
    scope: String,
    previous_signature: String,
    chunk_index: u64,
    bytes_seen: u64,
    expected_decoded_length: Option<u64>,
    expects_trailers: bool,
    expected_trailer_names: BTreeSet<String>,
}

impl ChunkSignatureValidator {
    pub fn new(config: ChunkValidatorConfig) -> Self {
        let signing_key = derive_signing_key(&config.secret_key, &config.date, &config.region, "s3");
        let scope = crate::calculator::scope(&config.date, &config.region, "s3");
        Self {
            signing_key,
            amz_date: config.amz_date,
            scope,
            previous_signature: config.seed_signature,
            chunk_index: 0,
            bytes_seen: 0,
            expected_decoded_length: config.expected_decoded_length,
            expects_trailers: config.expects_trailers,
            expected_trailer_names: config
                .expected_trailer_names
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    pub fn chunk_index(&self) -> u64 {
        self.chunk_index
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Validates one already-buffered chunk. On success, advances the
    /// rolling signature and returns `true`; on mismatch returns `false`
    /// without mutating state, so a caller may report a structured error
    /// naming `chunk_index()` before aborting.
    pub fn validate_chunk(&mut self, bytes: &[u8], signature: &str, is_last: bool) -> bool {
        let chunk_hash = sha256_hex(bytes);
        self.validate_chunk_hash(&chunk_hash, bytes.len() as u64, signature, is_last)
    }

    /// Same contract as [`Self::validate_chunk`] but the chunk hash is
    /// computed by the caller (e.g. while streaming bytes through a hasher
    /// without buffering the whole chunk), matching spec §4.3's
    /// `ValidateChunkStream`.
    pub fn validate_chunk_stream(
        &mut self,
        chunk_hash: &str,
        chunk_len: u64,
        signature: &str,
        is_last: bool,
    ) -> bool {
        self.validate_chunk_hash(chunk_hash, chunk_len, signature, is_last)
    }

    fn validate_chunk_hash(
        &mut self,
        chunk_hash: &str,
        chunk_len: u64,
        signature: &str,
        _is_last: bool,
    ) -> bool {
        let string_to_sign =
            chunk_string_to_sign(&self.previous_signature, &self.amz_date, &self.scope, chunk_hash);
        let expected = sign(&self.signing_key, &string_to_sign);

        if expected != signature {
            return false;
        }

        self.previous_signature = expected;
        self.chunk_index += 1;
        self.bytes_seen += chunk_len;
        true
    }

    /// Validates the final trailer block: the trailer set must cover every
    /// name in `expected_trailer_names` (case-insensitively), and the
    /// canonical `name:value\n` block's signature must chain from the last
    /// chunk's signature.
    pub fn validate_trailer(&mut self, trailers: &[(String, String)], trailer_signature: &str) -> bool {
        let present: BTreeSet<String> = trailers
            .iter()
            .map(|(name, _)| name.to_lowercase())
            .collect();
        if !self.expected_trailer_names.is_subset(&present) {
            return false;
        }

        let block = crate::calculator::build_trailer_header_string(trailers);
        let block_hash = sha256_hex(block.as_bytes());
        let string_to_sign =
            trailer_string_to_sign(&self.previous_signature, &self.amz_date, &self.scope, &block_hash);
        let expected = sign(&self.signing_key, &string_to_sign);

        if expected != trailer_signature {
            return false;
        }
        self.previous_signature = expected;
        true
    }

    /// Whether decoded byte count matches the length declared at
    /// construction (when known), used by callers as an extra sanity check
    /// once the stream is fully decoded.
    pub fn length_matches_expected(&self) -> bool {
        match self.expected_decoded_length {
            Some(expected) => expected == self.bytes_seen,
            None => true,
        }
    }

    pub fn expects_trailers(&self) -> bool {
        self.expects_trailers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{derive_signing_key, scope as scope_fn, sha256_hex, sign};

    fn config() -> (ChunkValidatorConfig, Vec<u8>) {
        let secret_key = "secret".to_string();
        let date = "20130524".to_string();
        let region = "us-east-1".to_string();
        let amz_date = "20130524T000000Z".to_string();
        let signing_key = derive_signing_key(&secret_key, &date, &region, "s3");
        let scope = scope_fn(&date, &region, "s3");

        let seed_sts = format!(
            "AWS4-HMAC-SHA256-PAYLOAD\n{amz_date}\n{scope}\n0000000000000000000000000000000000000000000000000000000000000000\n{empty}\n{first_hash}",
            empty = crate::calculator::EMPTY_SHA256_HEX,
            first_hash = sha256_hex(b"hello"),
        );
        let seed_signature = sign(&signing_key, &seed_sts);

        (
            ChunkValidatorConfig {
                secret_key,
                date,
                region,
                amz_date,
                seed_signature: "0000000000000000000000000000000000000000000000000000000000000000"
                    .to_string(),
                expected_decoded_length: None,
                expects_trailers: false,
                expected_trailer_names: BTreeSet::new(),
            },
            signing_key,
        )
    }

    #[test]
    fn accepts_correctly_chained_chunks_and_rejects_mutation() {
        let (cfg, signing_key) = config();
        let scope = scope_fn(&cfg.date, &cfg.region, "s3");
        let mut validator = ChunkSignatureValidator::new(cfg.clone());

        let sts1 = chunk_string_to_sign(&cfg.seed_signature, &cfg.amz_date, &scope, &sha256_hex(b"hello"));
        let sig1 = sign(&signing_key, &sts1);
        assert!(validator.validate_chunk(b"hello", &sig1, false));
        assert_eq!(validator.chunk_index(), 1);

        let sts2 = chunk_string_to_sign(&sig1, &cfg.amz_date, &scope, &sha256_hex(b" world"));
        let sig2 = sign(&signing_key, &sts2);
        assert!(validator.validate_chunk(b" world", &sig2, true));

        // Replaying with a mutated payload but the original signature must fail:
        // the tampered payload hashes differently, so sig1 no longer validates.
        let mut replay = ChunkSignatureValidator::new(cfg);
        assert!(!replay.validate_chunk(b"hellp", &sig1, false));
    }

    #[test]
    fn trailer_requires_all_expected_names_present() {
        let (cfg, _signing_key) = config();
        let mut cfg = cfg;
        cfg.expects_trailers = true;
        cfg.expected_trailer_names = BTreeSet::from(["x-amz-checksum-sha256".to_string()]);
        let mut validator = ChunkSignatureValidator::new(cfg);

        let trailers = vec![("x-amz-checksum-crc32".to_string(), "abc".to_string())];
        assert!(!validator.validate_trailer(&trailers, "deadbeef"));
    }
}
