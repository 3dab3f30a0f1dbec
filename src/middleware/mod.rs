//! Producer side: instruments an axum app and publishes one digest per
//! completed request.

pub mod recorder;

pub use recorder::{record_digest, DigestRecorder};
