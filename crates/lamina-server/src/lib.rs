//! Library surface for `lamina-server`: split out from the binary so
//! integration tests (and anything embedding the router, e.g. a future
//! CLI-less deployment) can drive [`router::build_router`] directly
//! through `tower::ServiceExt::oneshot` instead of binding a socket.

pub mod auth;
pub mod config;
pub mod janitor;
pub mod router;
pub mod xml;
