//! Rolling-window traffic statistics over a stream of HTTP request digests.
//!
//! Producers publish one digest per completed request (see [`middleware`]).
//! An [`Orchestrator`] subscribes to them, keeps a windowed history per
//! tenant and periodically computes the [`statistics`] over it.

pub mod digest;
pub mod error;
pub mod history;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod persister;
pub mod server;
pub mod statistics;
pub mod store;
pub mod transport;

pub use digest::Digest;
pub use error::{Error, Result};
pub use history::{Bucketed, History};
pub use orchestrator::{Config, IngestHandle, Loader, Orchestrator, Report, Signal};

/// Prefix shared by every channel name and persisted key.
pub const TOPIC: &str = "livetraffic";

/// Dot-joins `parts` under the [`TOPIC`] prefix.
///
/// `key(&["report", "app1"])` gives `"livetraffic.report.app1"`.
pub fn key<S: AsRef<str>>(parts: &[S]) -> String {
    let mut out = String::from(TOPIC);
    for part in parts {
        out.push('.');
        out.push_str(part.as_ref());
    }
    out
}

/// Current wall-clock time in whole seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
