use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};
use crate::history::Bucketed;

// ─── Wire body ───────────────────────────────────────────────────

/// JSON body of one request digest, as published by the middleware.
///
/// Every string field may be absent or `null` on the wire; accessors on
/// [`Digest`] read them as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestBody {
    #[serde(rename = "t0.sec")]
    pub start_sec: i64,
    #[serde(rename = "t0.usec", default)]
    pub start_usec: i64,
    #[serde(rename = "t1.sec")]
    pub stop_sec: i64,
    #[serde(rename = "t1.usec", default)]
    pub stop_usec: i64,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(rename = "user-agent", default)]
    pub user_agent: Option<String>,
    #[serde(rename = "rack-id", default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
}

impl DigestBody {
    /// Request duration in milliseconds, or `None` when the timestamps do
    /// not fit in milliseconds.
    fn checked_lifetime(&self) -> Option<i64> {
        let stop = self.stop_sec.checked_mul(1000)?;
        let start = self.start_sec.checked_mul(1000)?;
        stop.checked_sub(start)?.checked_add(self.stop_usec / 1000 - self.start_usec / 1000)
    }
}

// ─── Digest ──────────────────────────────────────────────────────

/// Decoded, immutable view of one completed HTTP request.
///
/// The raw payload is kept alongside the decoded body so the digest can
/// be persisted verbatim. The visitor token is derived on first use.
#[derive(Debug)]
pub struct Digest {
    tenant_id: String,
    payload: String,
    body: DigestBody,
    token: OnceLock<String>,
}

impl Digest {
    /// Decodes a digest received for `tenant_id`.
    pub fn decode(tenant_id: impl Into<String>, payload: impl Into<String>) -> Result<Self> {
        let payload = payload.into();
        let body: DigestBody =
            serde_json::from_str(&payload).map_err(|e| Error::decode("digest", e))?;
        if body.checked_lifetime().is_none() {
            let e = <serde_json::Error as serde::de::Error>::custom("timestamps out of range");
            return Err(Error::decode("digest", e));
        }
        Ok(Self {
            tenant_id: tenant_id.into(),
            payload,
            body,
            token: OnceLock::new(),
        })
    }

    /// Decodes a persisted digest, taking the tenant id from its own
    /// `rack-id` field.
    pub fn decode_persisted(payload: impl Into<String>) -> Result<Self> {
        let mut digest = Self::decode(String::new(), payload)?;
        digest.tenant_id = digest.body.tenant_id.clone().unwrap_or_default();
        Ok(digest)
    }

    /// Builds a digest from an already-decoded body.
    pub fn from_body(tenant_id: impl Into<String>, body: DigestBody) -> Self {
        let payload = serde_json::to_string(&body).unwrap_or_default();
        Self {
            tenant_id: tenant_id.into(),
            payload,
            body,
            token: OnceLock::new(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn start_sec(&self) -> i64 {
        self.body.start_sec
    }

    pub fn stop_sec(&self) -> i64 {
        self.body.stop_sec
    }

    /// Request duration in milliseconds.
    ///
    /// Seconds and microseconds are converted separately, so sub-millisecond
    /// remainders are truncated on each side. Saturates for bodies built
    /// with [`from_body`](Self::from_body); decoded digests never overflow.
    pub fn lifetime(&self) -> i64 {
        let b = &self.body;
        b.checked_lifetime().unwrap_or_else(|| {
            b.stop_sec
                .saturating_mul(1000)
                .saturating_sub(b.start_sec.saturating_mul(1000))
        })
    }

    pub fn host(&self) -> &str {
        self.body.host.as_deref().unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.body.path.as_deref().unwrap_or("")
    }

    pub fn url(&self) -> &str {
        self.body.uri.as_deref().unwrap_or("")
    }

    pub fn ip(&self) -> &str {
        self.body.ip.as_deref().unwrap_or("")
    }

    pub fn user_agent(&self) -> &str {
        self.body.user_agent.as_deref().unwrap_or("")
    }

    pub fn cookie(&self) -> Option<&str> {
        self.body.cookie.as_deref()
    }

    /// Identity of the visitor behind this request.
    ///
    /// The identifying cookie when there is one, otherwise a hash of the
    /// (ip, user-agent) pair so visitors behind a NAT stay apart.
    pub fn visitor_token(&self) -> &str {
        self.token.get_or_init(|| match self.cookie() {
            Some(cookie) => format!("cookie:{cookie}"),
            None => {
                let mut hasher = Sha256::new();
                hasher.update(self.ip().as_bytes());
                hasher.update(self.user_agent().as_bytes());
                hex::encode(hasher.finalize())
            }
        })
    }
}

impl Bucketed for Digest {
    fn bucket_key(&self) -> i64 {
        self.body.start_sec
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Test helper: a digest for `tenant` started at `start` seconds.
    pub(crate) fn digest(tenant: &str, start: i64) -> Arc<Digest> {
        Arc::new(Digest::from_body(
            tenant,
            DigestBody {
                start_sec: start,
                stop_sec: start,
                host: Some("example.com".into()),
                path: Some("/".into()),
                uri: Some("/".into()),
                ip: Some("10.0.0.1".into()),
                user_agent: Some("curl/8".into()),
                tenant_id: Some(tenant.into()),
                ..Default::default()
            },
        ))
    }

    #[test]
    fn decodes_wire_payload() {
        let json = r#"{"t0.sec":1000,"t0.usec":250000,"t1.sec":1001,"t1.usec":500000,
            "host":"a.com","path":"/x","uri":"/x?q=1","ip":"1.2.3.4",
            "user-agent":"ua","rack-id":"app1","cookie":null}"#;
        let d = Digest::decode("app1", json).unwrap();
        assert_eq!(d.tenant_id(), "app1");
        assert_eq!(d.bucket_key(), 1000);
        assert_eq!(d.lifetime(), 1250);
        assert_eq!(d.host(), "a.com");
        assert_eq!(d.url(), "/x?q=1");
        assert_eq!(d.cookie(), None);
        assert_eq!(d.payload(), json);
    }

    #[test]
    fn rejects_malformed_payload() {
        let err = Digest::decode("app1", "{not json").unwrap_err();
        assert!(matches!(err, Error::Decode { what: "digest", .. }));
        assert!(Digest::decode("", r#"{"host":"a.com"}"#).is_err());
    }

    #[test]
    fn rejects_timestamps_beyond_millisecond_range() {
        let json = r#"{"t0.sec":1000,"t1.sec":9300000000000000,"uri":"/x"}"#;
        let err = Digest::decode("app1", json).unwrap_err();
        assert!(matches!(err, Error::Decode { what: "digest", .. }));
        assert!(Digest::decode_persisted(json).is_err());

        let ok = r#"{"t0.sec":1000,"t1.sec":9000000000000000,"uri":"/x"}"#;
        assert!(Digest::decode("app1", ok).is_ok());
    }

    #[test]
    fn lifetime_saturates_for_built_bodies() {
        let d = Digest::from_body(
            "",
            DigestBody {
                start_sec: -1,
                stop_sec: i64::MAX,
                ..Default::default()
            },
        );
        assert_eq!(d.lifetime(), i64::MAX);
    }

    #[test]
    fn persisted_digest_takes_tenant_from_body() {
        let d = Digest::decode_persisted(r#"{"t0.sec":1,"t1.sec":2,"rack-id":"shop"}"#).unwrap();
        assert_eq!(d.tenant_id(), "shop");
        assert_eq!(d.host(), "");
    }

    #[test]
    fn cookie_token_is_tagged() {
        let d = Digest::decode("", r#"{"t0.sec":1,"t1.sec":1,"cookie":"X"}"#).unwrap();
        assert_eq!(d.visitor_token(), "cookie:X");
    }

    #[test]
    fn cookieless_token_hashes_ip_and_agent() {
        let a = digest("", 1);
        let b = digest("", 2);
        assert_eq!(a.visitor_token(), b.visitor_token());
        assert_eq!(a.visitor_token().len(), 64);

        let other = Digest::decode(
            "",
            r#"{"t0.sec":1,"t1.sec":1,"ip":"10.0.0.2","user-agent":"curl/8"}"#,
        )
        .unwrap();
        assert_ne!(a.visitor_token(), other.visitor_token());
    }
}
