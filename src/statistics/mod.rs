//! Incremental, cache-aware statistics over a windowed digest history.
//!
//! A [`Statistic`] memoizes one [`Computation`] per bucket and only
//! recomputes the buckets it has not seen yet, plus the most recent ones
//! (see [`GRACE_BUCKETS`]). Each concrete statistic plugs its per-bucket
//! and cross-bucket logic in through [`Aggregate`].

pub mod counter;
pub mod hostnames;
pub mod rate;
pub mod slow_requests;
pub mod unique_visitors;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::history::{Bucketed, History};
use crate::transport::PublishQueue;

pub use counter::Counter;
pub use hostnames::{HostStats, HostnameStats};
pub use rate::Rate;
pub use slow_requests::{SlowRequest, SlowRequests};
pub use unique_visitors::UniqueVisitors;

/// Number of most recent cached buckets recomputed on every cycle.
///
/// Producers' clocks drift and the pub/sub adds latency, so the newest
/// buckets may still be receiving digests.
pub const GRACE_BUCKETS: usize = 5;

/// Topic computed aggregates are published under.
pub const STATS_TOPIC: &str = "stats";

// ─── Computation ─────────────────────────────────────────────────

/// One statistic's memoized result for one bucket.
///
/// Encoded positionally as `[bucket_key, stat_key, result]`, both on the
/// pub/sub and in the persisted store.
#[derive(Debug, Clone, PartialEq)]
pub struct Computation<R> {
    pub bucket_key: i64,
    pub stat_key: String,
    pub result: R,
}

impl<R> Computation<R> {
    pub fn new(bucket_key: i64, stat_key: impl Into<String>, result: R) -> Self {
        Self {
            bucket_key,
            stat_key: stat_key.into(),
            result,
        }
    }
}

impl<R> Bucketed for Computation<R> {
    fn bucket_key(&self) -> i64 {
        self.bucket_key
    }
}

impl<R: Serialize> Serialize for Computation<R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.bucket_key, &self.stat_key, &self.result).serialize(serializer)
    }
}

impl<'de, R: Deserialize<'de>> Deserialize<'de> for Computation<R> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (bucket_key, stat_key, result) = <(i64, String, R)>::deserialize(deserializer)?;
        Ok(Self {
            bucket_key,
            stat_key,
            result,
        })
    }
}

// ─── Aggregate ───────────────────────────────────────────────────

/// Per-statistic logic plugged into [`Statistic`].
pub trait Aggregate: Send + 'static {
    /// Name of the statistic in reports and persisted keys.
    const KEY: &'static str;

    /// Result memoized for a single bucket.
    type Bucket: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync;

    /// Value reported for the whole window.
    type Output: Serialize;

    fn compute_result(&self, bucket_key: i64, items: &[Arc<Digest>]) -> Self::Bucket;

    fn reduce_computations(
        &self,
        computations: &[&Computation<Self::Bucket>],
        now: i64,
    ) -> Self::Output;

    /// Rebuilds a bucket result from its persisted JSON form.
    fn restore_result(&self, value: Value) -> serde_json::Result<Self::Bucket> {
        serde_json::from_value(value)
    }
}

// ─── Statistic ───────────────────────────────────────────────────

/// A stateful statistic bound to one tenant, with its own cache of
/// per-bucket computations.
pub struct Statistic<A: Aggregate> {
    aggregate: A,
    tenant_id: String,
    sink: Option<PublishQueue>,
    cache: History<Computation<A::Bucket>>,
}

impl<A: Aggregate> Statistic<A> {
    pub fn new(aggregate: A, tenant_id: impl Into<String>, sink: Option<PublishQueue>) -> Self {
        Self {
            aggregate,
            tenant_id: tenant_id.into(),
            sink,
            cache: History::new(),
        }
    }

    pub fn key(&self) -> &'static str {
        A::KEY
    }

    pub fn cache(&self) -> &History<Computation<A::Bucket>> {
        &self.cache
    }

    /// Raw buckets that still have to be computed: every bucket not in the
    /// cache, plus the [`GRACE_BUCKETS`] most recent cached ones.
    pub fn needed(&self, raw: &History<Arc<Digest>>) -> History<Arc<Digest>> {
        let mut done = self.cache.bucket_keys();
        done.truncate(done.len().saturating_sub(GRACE_BUCKETS));
        raw.filter(|key| done.binary_search(&key).is_err())
    }

    /// Brings the cache up to date with `raw`, forgets buckets older than
    /// `window` seconds and reduces what is left.
    pub fn compute_cycle(
        &mut self,
        raw: &History<Arc<Digest>>,
        window: i64,
        now: i64,
    ) -> A::Output {
        let needed = self.needed(raw);

        let mut fresh = BTreeMap::new();
        for (bucket_key, items) in needed.buckets() {
            let result = self.aggregate.compute_result(bucket_key, items);
            fresh.insert(bucket_key, vec![Computation::new(bucket_key, A::KEY, result)]);
        }

        if let Some(sink) = &self.sink {
            for computation in fresh.values().flatten() {
                match serde_json::to_string(computation) {
                    Ok(payload) => sink.publish(&self.tenant_id, payload, STATS_TOPIC),
                    Err(e) => warn!("{}: cannot encode computation: {e}", A::KEY),
                }
            }
        }

        self.cache.merge(fresh);
        self.cache = self.cache.recent(window, now);

        let cached: Vec<_> = self.cache.items().collect();
        self.aggregate.reduce_computations(&cached, now)
    }

    /// Decodes one persisted `[bucket_key, stat_key, result]` payload.
    pub fn decode_computation(&self, json: &str) -> Result<Computation<A::Bucket>> {
        let (bucket_key, stat_key, raw): (i64, String, Value) =
            serde_json::from_str(json).map_err(|e| Error::decode("computation", e))?;
        let result = self
            .aggregate
            .restore_result(raw)
            .map_err(|e| Error::decode("computation result", e))?;
        Ok(Computation {
            bucket_key,
            stat_key,
            result,
        })
    }

    /// Installs persisted computations into the cache. Undecodable entries
    /// are skipped; returns how many were restored.
    pub fn restore_from_jsons<S: AsRef<str>>(&mut self, jsons: &[S]) -> usize {
        let mut grouped: BTreeMap<i64, Vec<Computation<A::Bucket>>> = BTreeMap::new();
        let mut restored = 0;
        for json in jsons {
            match self.decode_computation(json.as_ref()) {
                Ok(c) => {
                    grouped.entry(c.bucket_key).or_default().push(c);
                    restored += 1;
                }
                Err(e) => warn!("{}: dropping persisted computation: {e}", A::KEY),
            }
        }
        debug!("{}[{}]: restored {restored} computations", A::KEY, self.tenant_id);
        self.cache.merge(grouped);
        restored
    }
}

// ─── Closed set of statistics ────────────────────────────────────

/// Every statistic a slice computes, behind one type.
pub enum AnyStatistic {
    Counter(Statistic<Counter>),
    Rate(Statistic<Rate>),
    SlowRequests(Statistic<SlowRequests>),
    UniqueVisitors(Statistic<UniqueVisitors>),
    Hostnames(Statistic<HostnameStats>),
}

macro_rules! each_statistic {
    ($self:expr, $stat:ident => $body:expr) => {
        match $self {
            AnyStatistic::Counter($stat) => $body,
            AnyStatistic::Rate($stat) => $body,
            AnyStatistic::SlowRequests($stat) => $body,
            AnyStatistic::UniqueVisitors($stat) => $body,
            AnyStatistic::Hostnames($stat) => $body,
        }
    };
}

impl AnyStatistic {
    /// The standard set computed for every tenant.
    pub fn standard_set(
        tenant_id: &str,
        slow_requests: usize,
        sink: Option<&PublishQueue>,
    ) -> Vec<AnyStatistic> {
        vec![
            AnyStatistic::Counter(Statistic::new(Counter, tenant_id, sink.cloned())),
            AnyStatistic::Rate(Statistic::new(Rate, tenant_id, sink.cloned())),
            AnyStatistic::SlowRequests(Statistic::new(
                SlowRequests::new(slow_requests),
                tenant_id,
                sink.cloned(),
            )),
            AnyStatistic::UniqueVisitors(Statistic::new(UniqueVisitors, tenant_id, sink.cloned())),
            AnyStatistic::Hostnames(Statistic::new(HostnameStats, tenant_id, sink.cloned())),
        ]
    }

    pub fn key(&self) -> &'static str {
        each_statistic!(self, s => s.key())
    }

    pub fn compute_cycle(&mut self, raw: &History<Arc<Digest>>, window: i64, now: i64) -> Value {
        each_statistic!(self, s => {
            let output = s.compute_cycle(raw, window, now);
            serde_json::to_value(output).unwrap_or_else(|e| {
                warn!("{}: cannot encode output: {e}", s.key());
                Value::Null
            })
        })
    }

    pub fn restore_from_jsons<S: AsRef<str>>(&mut self, jsons: &[S]) -> usize {
        each_statistic!(self, s => s.restore_from_jsons(jsons))
    }

    /// Number of buckets currently cached.
    pub fn cached_buckets(&self) -> usize {
        each_statistic!(self, s => s.cache().bucket_keys().len())
    }
}
