//! Persisted key-value store used to bridge restarts.
//!
//! Raw digests live under `livetraffic.report.<tenant>.<start>.<suffix>`
//! and expire quickly; computed aggregates live under
//! `livetraffic.stats.<stat>.<tenant>.<bucket>`.

use std::future::Future;

use log::{debug, info};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::Result;
use crate::statistics::STATS_TOPIC;
use crate::transport::REPORT_TOPIC;

/// Default expiry of persisted items, in seconds.
pub const DEFAULT_TTL_SECS: u64 = 30;

/// Default upper bound of the random suffix of raw-digest keys.
pub const DEFAULT_RANDMAX: u32 = 65_535;

pub fn report_key(tenant: &str, start_sec: i64, suffix: u32) -> String {
    crate::key(&[REPORT_TOPIC, tenant, start_sec.to_string().as_str(), suffix.to_string().as_str()])
}

/// Literal prefix shared by every raw-digest key of `tenant`.
pub fn report_prefix(tenant: &str) -> String {
    crate::key(&[REPORT_TOPIC, tenant, ""])
}

/// Scan pattern for raw digests. `None` matches every tenant.
pub fn report_pattern(tenant: Option<&str>) -> String {
    match tenant {
        Some(tenant) => glob(&report_prefix(tenant)),
        None => crate::key(&[REPORT_TOPIC, "*"]),
    }
}

pub fn stats_key(stat: &str, tenant: &str, bucket_key: i64) -> String {
    crate::key(&[STATS_TOPIC, stat, tenant, bucket_key.to_string().as_str()])
}

/// Literal prefix shared by every persisted `stat` computation of `tenant`.
pub fn stats_prefix(stat: &str, tenant: &str) -> String {
    crate::key(&[STATS_TOPIC, stat, tenant, ""])
}

pub fn stats_pattern(stat: &str, tenant: &str) -> String {
    glob(&stats_prefix(stat, tenant))
}

/// Escapes glob metacharacters of `prefix` and appends `*`.
fn glob(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Whether `key` is `prefix` followed by exactly `segments` numeric parts.
///
/// A pattern for tenant `app` also matches the keys of tenant `app.one`;
/// this tells them apart.
pub fn has_numeric_tail(key: &str, prefix: &str, segments: usize) -> bool {
    let Some(tail) = key.strip_prefix(prefix) else {
        return false;
    };
    let parts: Vec<&str> = tail.split('.').collect();
    parts.len() == segments && parts.iter().all(|p| p.parse::<i64>().is_ok())
}

/// Bulk read of every `(key, value)` pair whose key matches a glob pattern.
pub trait Snapshot {
    fn fetch_matching(
        &mut self,
        pattern: &str,
    ) -> impl Future<Output = Result<Vec<(String, String)>>> + Send;
}

/// Write side of the store, as used by the persisters.
pub trait Persist {
    fn set_with_expiry(
        &mut self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Redis-backed store client.
///
/// `ConnectionManager` is cheaply cloneable and reconnects on failure,
/// so clones of a `Store` share one multiplexed connection.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to store at {url}");
        Ok(Self { conn })
    }
}

impl Persist for Store {
    /// Stores `value` under `key` and makes it expire after `ttl_secs`,
    /// both in one transaction.
    async fn set_with_expiry(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        redis::pipe()
            .atomic()
            .set(key, value)
            .ignore()
            .expire(key, ttl_secs as i64)
            .ignore()
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        Ok(())
    }
}

impl Snapshot for Store {
    async fn fetch_matching(&mut self, pattern: &str) -> Result<Vec<(String, String)>> {
        let keys: Vec<String> = self.conn.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(&keys).query_async(&mut self.conn).await?;
        let total = keys.len();
        // Keys may expire between KEYS and MGET.
        let pairs: Vec<(String, String)> = keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect();
        debug!("{pattern}: {total} keys, {} values", pairs.len());
        Ok(pairs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// In-memory stand-in supporting escaped prefixes with a trailing `*`.
    #[derive(Default)]
    pub(crate) struct MemoryStore(pub BTreeMap<String, String>);

    impl Snapshot for MemoryStore {
        async fn fetch_matching(&mut self, pattern: &str) -> Result<Vec<(String, String)>> {
            let mut prefix = String::new();
            let mut chars = pattern.strip_suffix('*').unwrap_or(pattern).chars();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => prefix.extend(chars.next()),
                    c => prefix.push(c),
                }
            }
            Ok(self
                .0
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    impl Persist for MemoryStore {
        async fn set_with_expiry(&mut self, key: &str, value: &str, _ttl_secs: u64) -> Result<()> {
            self.0.insert(key.to_owned(), value.to_owned());
            Ok(())
        }
    }

    #[test]
    fn key_layout() {
        assert_eq!(report_key("app1", 1000, 42), "livetraffic.report.app1.1000.42");
        assert_eq!(report_key("", 1000, 42), "livetraffic.report..1000.42");
        assert_eq!(report_pattern(Some("app1")), "livetraffic.report.app1.*");
        assert_eq!(report_pattern(None), "livetraffic.report.*");
        assert_eq!(stats_key("requests", "app1", 1000), "livetraffic.stats.requests.app1.1000");
        assert_eq!(stats_pattern("rate", ""), "livetraffic.stats.rate..*");
    }

    #[tokio::test]
    async fn memory_store_matches_prefix() {
        let mut store = MemoryStore::default();
        store.0.insert(report_key("a", 1, 1), "one".into());
        store.0.insert(report_key("b", 1, 1), "two".into());
        let a = store.fetch_matching(&report_pattern(Some("a"))).await.unwrap();
        assert_eq!(a, vec![(report_key("a", 1, 1), "one".to_owned())]);
        assert_eq!(store.fetch_matching(&report_pattern(None)).await.unwrap().len(), 2);
    }

    #[test]
    fn patterns_escape_glob_characters() {
        assert_eq!(stats_pattern("requests", "a*b"), r"livetraffic.stats.requests.a\*b.*");
        assert_eq!(report_pattern(Some("[x]?")), r"livetraffic.report.\[x\]\?.*");
    }

    #[test]
    fn numeric_tail_separates_dotted_tenants() {
        let prefix = stats_prefix("requests", "app");
        assert!(has_numeric_tail(&stats_key("requests", "app", 990), &prefix, 1));
        assert!(!has_numeric_tail(&stats_key("requests", "app.one", 991), &prefix, 1));
        assert!(!has_numeric_tail("livetraffic.stats.requests.app.", &prefix, 1));

        let prefix = report_prefix("app");
        assert!(has_numeric_tail(&report_key("app", 1000, 7), &prefix, 2));
        assert!(!has_numeric_tail(&report_key("app.one", 1000, 7), &prefix, 2));
    }
}
