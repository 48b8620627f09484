//! Orchestrates storage, locking, and streaming signature validation into
//! the put/get/delete/list/multipart operations a server's routing layer
//! calls into (spec §4.8).

pub mod facade;

pub use facade::{DeleteMultipleOutcome, ListObjectsOutcome, ListedObject, ObjectStorageFacade, PutObjectRequest};
