use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};

use crate::digest::DigestBody;
use crate::transport::{PublishQueue, REPORT_TOPIC};

/// State of the [`record_digest`] middleware.
#[derive(Clone)]
pub struct DigestRecorder {
    queue: PublishQueue,
    tenant_id: Arc<str>,
    cookie_name: Option<Arc<str>>,
}

impl DigestRecorder {
    /// `cookie_name` names a cookie uniquely identifying a visitor. Its
    /// value is hashed before it leaves the process.
    pub fn new(queue: PublishQueue, tenant_id: &str, cookie_name: Option<&str>) -> Self {
        Self {
            queue,
            tenant_id: tenant_id.into(),
            cookie_name: cookie_name.map(Into::into),
        }
    }
}

/// What is known about a request before handing it to the app.
struct RequestInfo {
    host: Option<String>,
    path: String,
    uri: String,
    ip: Option<String>,
    user_agent: Option<String>,
    cookie: Option<String>,
}

/// Tower-compatible middleware publishing a digest of every request.
///
/// Only enqueues on the recorder's [`PublishQueue`]; the publisher task
/// does the network I/O, so the response is never held back.
pub async fn record_digest(
    State(recorder): State<DigestRecorder>,
    req: Request,
    next: Next,
) -> Response {
    let info = request_info(&req, recorder.cookie_name.as_deref());

    let t0 = Utc::now();
    let response = next.run(req).await;
    let t1 = Utc::now();

    let body = digest_body(info, &recorder.tenant_id, t0, t1);
    if let Ok(payload) = serde_json::to_string(&body) {
        recorder.queue.publish(&recorder.tenant_id, payload, REPORT_TOPIC);
    }
    response
}

fn request_info(req: &Request, cookie_name: Option<&str>) -> RequestInfo {
    let headers = req.headers();
    let host = req
        .uri()
        .host()
        .map(str::to_owned)
        .or_else(|| {
            header_str(headers, header::HOST).map(|h| h.split(':').next().unwrap_or(h).to_owned())
        });
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    RequestInfo {
        host,
        path: req.uri().path().to_owned(),
        uri,
        ip,
        user_agent: header_str(headers, header::USER_AGENT).map(str::to_owned),
        cookie: cookie_name.and_then(|name| cookie_value(headers, name)).map(hash_cookie),
    }
}

fn digest_body(
    info: RequestInfo,
    tenant_id: &str,
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
) -> DigestBody {
    DigestBody {
        start_sec: t0.timestamp(),
        start_usec: i64::from(t0.timestamp_subsec_micros()),
        stop_sec: t1.timestamp(),
        stop_usec: i64::from(t1.timestamp_subsec_micros()),
        host: info.host,
        path: Some(info.path),
        uri: Some(info.uri),
        ip: info.ip,
        user_agent: info.user_agent,
        tenant_id: Some(tenant_id.to_owned()),
        cookie: info.cookie,
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Value of cookie `name` in the request's `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_owned())
}

fn hash_cookie(value: String) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}
