use std::sync::Arc;

use axum::{routing::get, Router};
use parking_lot::Mutex;
use tower_http::cors::CorsLayer;

use crate::metrics::{stream, CycleTimings};
use crate::orchestrator::{Report, Signal};

/// What the dashboard serves: the latest cycle report and how long
/// cycles take to compute.
#[derive(Default)]
pub struct Dashboard {
    latest: Mutex<Arc<Report>>,
    pub timings: Arc<CycleTimings>,
}

impl Dashboard {
    pub fn new(timings: Arc<CycleTimings>) -> Self {
        Self {
            latest: Mutex::default(),
            timings,
        }
    }

    /// Compute-loop callback: keeps `report` as the latest one.
    pub fn publish(&self, report: &Report) -> Signal {
        *self.latest.lock() = Arc::new(report.clone());
        Signal::Continue
    }

    pub fn latest(&self) -> Arc<Report> {
        Arc::clone(&self.latest.lock())
    }
}

/// Builds the read-only dashboard `Router`.
pub fn create_router(dashboard: Arc<Dashboard>) -> Router {
    Router::new()
        .route("/api/report", get(stream::get_report))
        .route("/api/report/stream", get(stream::report_stream))
        .route("/api/timings", get(stream::get_timings))
        .with_state(dashboard)
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn keeps_latest_report() {
        let dashboard = Dashboard::default();
        assert!(dashboard.latest().is_empty());

        let mut report = Report::new();
        report.insert("app1".into(), BTreeMap::from([("requests".into(), 3.into())]));
        assert_eq!(dashboard.publish(&report), Signal::Continue);
        assert_eq!(dashboard.latest()["app1"]["requests"], 3);
    }
}
