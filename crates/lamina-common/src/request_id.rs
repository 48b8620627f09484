//! `RequestId`/`HostId` generation for the S3 error-XML surface (spec §7).
//! These are per-request identifiers only; they carry no persistence and
//! are not part of the storage data model (spec §3 supplement).

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    pub host_id: String,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().simple().to_string().to_uppercase(),
            host_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
