//! AWS Signature V4 streaming authenticator and `aws-chunked` body decoder
//! (spec §4.1–4.3).

pub mod calculator;
pub mod parser;
pub mod validator;

pub use calculator::{
    build_trailer_header_string, canonical_request_hash, chunk_string_to_sign, derive_signing_key,
    scope, seed_string_to_sign, sha256_hex, sign, trailer_string_to_sign, EMPTY_SHA256_HEX,
};
pub use parser::{decode_chunk_stream, decode_to_sink, DecodeOutcome};
pub use validator::{ChunkSignatureValidator, ChunkValidatorConfig};
