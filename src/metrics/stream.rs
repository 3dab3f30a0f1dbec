use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use super::PercentileSet;
use crate::orchestrator::Report;
use crate::server::Dashboard;

/// How often the SSE stream pushes the latest report.
const STREAM_INTERVAL: Duration = Duration::from_secs(1);

// ─── GET /api/report ─────────────────────────────────────────────
/// Latest cycle report as JSON.

pub async fn get_report(State(dashboard): State<Arc<Dashboard>>) -> Json<Report> {
    Json(dashboard.latest().as_ref().clone())
}

// ─── GET /api/report/stream ──────────────────────────────────────
/// Server-Sent Events endpoint pushing the latest report every second.

pub async fn report_stream(
    State(dashboard): State<Arc<Dashboard>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(STREAM_INTERVAL);

    let stream = IntervalStream::new(interval).map(move |_| {
        let json = serde_json::to_string(dashboard.latest().as_ref()).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

// ─── GET /api/timings ────────────────────────────────────────────
/// Compute-time percentiles per statistic, in microseconds.

pub async fn get_timings(
    State(dashboard): State<Arc<Dashboard>>,
) -> Json<BTreeMap<String, PercentileSet>> {
    Json(dashboard.timings.snapshot())
}
