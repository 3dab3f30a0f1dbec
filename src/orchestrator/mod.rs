//! Multiplexes tenants and drives the periodic compute cycle.
//!
//! Two concurrent units share one lock: the ingestion task files incoming
//! digests into slices, the compute loop ages slices out and runs every
//! statistic on a snapshot taken under that lock.

mod slice;

pub use slice::Slice;

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::history::History;
use crate::metrics::{CycleTimings, TOTAL};
use crate::statistics::slow_requests::DEFAULT_SLOW_REQUESTS;
use crate::statistics::AnyStatistic;
use crate::store::{
    has_numeric_tail, report_pattern, report_prefix, stats_pattern, stats_prefix, Snapshot,
};
use crate::transport::{PublishQueue, Subscriber};

/// Per-cycle result: tenant id → statistic key → value.
pub type Report = BTreeMap<String, BTreeMap<String, Value>>;

/// What a callback or hook asks the surrounding loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    /// Skip the current item. The compute loop treats it as `Continue`.
    Skip,
    /// Stop the loop for good.
    Kill,
}

// ─── Configuration ───────────────────────────────────────────────

/// Sources of state replayed before going live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loader {
    Nothing,
    /// Raw digests persisted by the http persister.
    RedisHttp,
    /// Aggregates persisted by the stats persister.
    RedisStats,
}

impl FromStr for Loader {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nothing" => Ok(Self::Nothing),
            "redis_http" => Ok(Self::RedisHttp),
            "redis_stats" => Ok(Self::RedisStats),
            other => Err(Error::UnknownLoader(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Pause between two compute cycles.
    pub period: Duration,
    /// Seconds of history kept and reported on.
    pub window_secs: i64,
    /// Create a slice per tenant on first sight, next to the default one.
    pub multiplex: bool,
    /// Tenant of the default slice; empty means every tenant.
    pub default_tenant: String,
    /// Only compute over resurrected data, never subscribe.
    pub read_only: bool,
    /// Loader names, run in order before ingestion starts.
    pub loaders: Vec<String>,
    /// How many requests `slow_requests` reports.
    pub slow_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
            window_secs: 300,
            multiplex: false,
            default_tenant: String::new(),
            read_only: false,
            loaders: Vec::new(),
            slow_requests: DEFAULT_SLOW_REQUESTS,
        }
    }
}

impl Config {
    fn parse_loaders(&self) -> Result<Vec<Loader>> {
        self.loaders.iter().map(|name| name.parse()).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.window_secs <= 0 {
            return Err(Error::Config(format!("window must be positive, got {}", self.window_secs)));
        }
        if self.slow_requests == 0 {
            return Err(Error::Config("slow request count must be positive".into()));
        }
        Ok(())
    }
}

// ─── Shared state ────────────────────────────────────────────────

struct State {
    slices: HashMap<String, Slice>,
    killed: bool,
}

/// What the ingestion task and the compute loop both need.
struct Shared {
    state: Mutex<State>,
    multiplex: bool,
    slow_requests: usize,
    sink: Option<PublishQueue>,
}

impl Shared {
    fn new_slice(&self, tenant_id: &str) -> Slice {
        let statistics =
            AnyStatistic::standard_set(tenant_id, self.slow_requests, self.sink.as_ref());
        Slice::new(tenant_id, statistics)
    }

    /// Files `digest` into every interested slice, creating the tenant's
    /// slice first in multiplex mode.
    fn ingest(&self, digest: Arc<Digest>) -> Signal {
        let mut state = self.state.lock();
        if state.killed {
            return Signal::Kill;
        }

        let tenant = digest.tenant_id();
        if self.multiplex && !state.slices.contains_key(tenant) {
            debug!("new slice for tenant {tenant:?}");
            let slice = self.new_slice(tenant);
            state.slices.insert(tenant.to_owned(), slice);
        }

        for slice in state.slices.values_mut() {
            slice.store(&digest);
        }
        Signal::Continue
    }
}

/// Decodes subscribed messages and ingests them until the orchestrator
/// is killed or the subscription ends.
async fn ingestion_loop(shared: Arc<Shared>, mut subscriber: Subscriber) {
    while let Some(message) = subscriber.recv().await {
        let digest = match Digest::decode(message.tenant, message.payload) {
            Ok(digest) => Arc::new(digest),
            Err(e) => {
                warn!("dropping digest: {e}");
                continue;
            }
        };
        if shared.ingest(digest) == Signal::Kill {
            break;
        }
    }
    debug!("ingestion stopped");
}

/// Cloneable handle feeding digests into an orchestrator from other
/// threads or tasks.
#[derive(Clone)]
pub struct IngestHandle {
    shared: Arc<Shared>,
}

impl IngestHandle {
    pub fn ingest(&self, digest: Arc<Digest>) -> Signal {
        self.shared.ingest(digest)
    }
}

// ─── Orchestrator ────────────────────────────────────────────────

/// Owns the tenant → slice table and runs the compute loop.
///
/// Lifecycle is created → running → killed. A killed orchestrator cannot
/// run again; build a new one instead.
pub struct Orchestrator {
    config: Config,
    loaders: Vec<Loader>,
    loaders_pending: bool,
    shared: Arc<Shared>,
    subscriber: Option<Subscriber>,
    timings: Option<Arc<CycleTimings>>,
}

impl Orchestrator {
    /// Builds an orchestrator with its default slice.
    ///
    /// Computed aggregates are published on `sink` unless `read_only` is set.
    pub fn new(config: Config, sink: Option<PublishQueue>) -> Result<Self> {
        config.validate()?;
        let loaders = config.parse_loaders()?;
        let loaders_pending = loaders.iter().any(|l| *l != Loader::Nothing);

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                slices: HashMap::new(),
                killed: false,
            }),
            multiplex: config.multiplex,
            slow_requests: config.slow_requests,
            sink: if config.read_only { None } else { sink },
        });
        let default_slice = shared.new_slice(&config.default_tenant);
        shared
            .state
            .lock()
            .slices
            .insert(config.default_tenant.clone(), default_slice);

        Ok(Self {
            config,
            loaders,
            loaders_pending,
            shared,
            subscriber: None,
            timings: None,
        })
    }

    /// Source of live digests. Required unless the config is read-only.
    pub fn with_subscriber(mut self, subscriber: Subscriber) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Records how long each statistic takes to compute.
    pub fn with_timings(mut self, timings: Arc<CycleTimings>) -> Self {
        self.timings = Some(timings);
        self
    }

    pub fn is_killed(&self) -> bool {
        self.shared.state.lock().killed
    }

    /// Tenant ids of the current slices, sorted.
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<_> = self.shared.state.lock().slices.keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Number of raw digests held by a tenant's slice.
    pub fn raw_len(&self, tenant: &str) -> Option<usize> {
        self.shared.state.lock().slices.get(tenant).map(|s| s.history.len())
    }

    /// Routes one digest as the ingestion task would.
    pub fn ingest(&self, digest: Arc<Digest>) -> Signal {
        self.shared.ingest(digest)
    }

    pub fn ingest_handle(&self) -> IngestHandle {
        IngestHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    // ── Resurrection ────────────────────────────────────────────

    /// Runs the configured loaders against `store`, in order.
    ///
    /// Must happen before [`run`](Self::run) when any loader reads from
    /// the store.
    pub async fn resurrect<S: Snapshot>(&mut self, store: &mut S) -> Result<()> {
        for loader in self.loaders.clone() {
            match loader {
                Loader::Nothing => {}
                Loader::RedisHttp => self.load_digests(store).await?,
                Loader::RedisStats => self.load_computations(store).await?,
            }
        }
        self.loaders_pending = false;
        Ok(())
    }

    async fn load_digests<S: Snapshot>(&mut self, store: &mut S) -> Result<()> {
        // Digests are persisted per tenant, so a catch-all or multiplexed
        // orchestrator has to read every tenant's keys.
        let tenants: Vec<Option<String>> = {
            let state = self.shared.state.lock();
            if self.shared.multiplex || state.slices.values().any(Slice::keep_all) {
                vec![None]
            } else {
                state.slices.keys().cloned().map(Some).collect()
            }
        };

        for tenant in tenants {
            let pattern = report_pattern(tenant.as_deref());
            let prefix = tenant.as_deref().map(report_prefix);
            let values = store.fetch_matching(&pattern).await?;
            let mut loaded = 0;
            for (key, json) in values {
                if let Some(prefix) = &prefix {
                    if !has_numeric_tail(&key, prefix, 2) {
                        continue;
                    }
                }
                match Digest::decode_persisted(json) {
                    Ok(digest) => {
                        self.shared.ingest(Arc::new(digest));
                        loaded += 1;
                    }
                    Err(e) => warn!("dropping persisted digest: {e}"),
                }
            }
            info!("resurrected {loaded} digests from {pattern}");
        }
        Ok(())
    }

    async fn load_computations<S: Snapshot>(&mut self, store: &mut S) -> Result<()> {
        let slices: Vec<(String, Arc<Mutex<Vec<AnyStatistic>>>)> = {
            let state = self.shared.state.lock();
            state
                .slices
                .values()
                .map(|s| (s.tenant_id.clone(), Arc::clone(&s.statistics)))
                .collect()
        };

        for (tenant, statistics) in slices {
            let keys: Vec<&'static str> = statistics.lock().iter().map(AnyStatistic::key).collect();
            for (idx, key) in keys.into_iter().enumerate() {
                let prefix = stats_prefix(key, &tenant);
                let values: Vec<String> = store
                    .fetch_matching(&stats_pattern(key, &tenant))
                    .await?
                    .into_iter()
                    .filter(|(k, _)| has_numeric_tail(k, &prefix, 1))
                    .map(|(_, v)| v)
                    .collect();
                let restored = statistics.lock()[idx].restore_from_jsons(&values);
                info!("resurrected {restored} {key} computations for tenant {tenant:?}");
            }
        }
        Ok(())
    }

    // ── Compute loop ────────────────────────────────────────────

    /// Ages out old digests and computes every statistic of every slice
    /// as of `now`.
    ///
    /// Cycles must not overlap, hence `&mut self`.
    pub fn compute(&mut self, now: i64) -> Report {
        let window = self.config.window_secs;

        let snapshot: Vec<(String, History<Arc<Digest>>, Arc<Mutex<Vec<AnyStatistic>>>)> = {
            let mut state = self.shared.state.lock();
            for slice in state.slices.values_mut() {
                slice.history = slice.history.recent(window, now);
            }
            if self.shared.multiplex {
                state.slices.retain(|tenant, slice| {
                    let keep = slice.keep_all() || !slice.history.is_empty();
                    if !keep {
                        debug!("evicting idle tenant {tenant:?}");
                    }
                    keep
                });
            }
            state
                .slices
                .values()
                .map(|s| (s.tenant_id.clone(), s.history.clone(), Arc::clone(&s.statistics)))
                .collect()
        };

        let started = Instant::now();
        let mut report = Report::new();
        for (tenant, history, statistics) in snapshot {
            let mut values = BTreeMap::new();
            for stat in statistics.lock().iter_mut() {
                let t0 = Instant::now();
                let value = stat.compute_cycle(&history, window, now);
                if let Some(timings) = &self.timings {
                    timings.record(stat.key(), t0.elapsed());
                }
                values.insert(stat.key().to_owned(), value);
            }
            report.insert(tenant, values);
        }
        if let Some(timings) = &self.timings {
            timings.record(TOTAL, started.elapsed());
        }
        report
    }

    /// Runs compute cycles every `period` until `callback` returns
    /// [`Signal::Kill`], then marks the orchestrator killed.
    ///
    /// Live ingestion runs alongside unless the config is read-only.
    pub async fn run<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Report) -> Signal,
    {
        if self.is_killed() {
            return Err(Error::Killed);
        }
        if self.loaders_pending {
            return Err(Error::Config(
                "loaders configured but no store was resurrected from".into(),
            ));
        }

        let ingestion = if self.config.read_only {
            None
        } else {
            let subscriber = self
                .subscriber
                .take()
                .ok_or_else(|| Error::Config("live ingestion needs a subscriber".into()))?;
            Some(tokio::spawn(ingestion_loop(Arc::clone(&self.shared), subscriber)))
        };

        info!(
            "computing every {:?} over {}s of history",
            self.config.period, self.config.window_secs
        );
        loop {
            let report = self.compute(crate::now_secs());
            if callback(&report) == Signal::Kill {
                break;
            }
            tokio::time::sleep(self.config.period).await;
        }

        self.shared.state.lock().killed = true;
        if let Some(handle) = ingestion {
            handle.abort();
        }
        info!("orchestrator killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::tests::digest;
    use crate::store::tests::MemoryStore;
    use crate::store::{report_key, stats_key};
    use crate::transport::Message;

    fn read_only(config: Config) -> Orchestrator {
        Orchestrator::new(Config { read_only: true, ..config }, None).unwrap()
    }

    #[test]
    fn unknown_loader_fails_fast() {
        let config = Config {
            loaders: vec!["redis_http".into(), "mysql".into()],
            ..Config::default()
        };
        let err = Orchestrator::new(config, None).err().unwrap();
        assert!(matches!(err, Error::UnknownLoader(name) if name == "mysql"));
    }

    #[test]
    fn rejects_empty_window() {
        let config = Config {
            window_secs: 0,
            ..Config::default()
        };
        assert!(matches!(Orchestrator::new(config, None), Err(Error::Config(_))));
    }

    #[test]
    fn counts_and_rates_one_tenant() {
        let mut orch = read_only(Config {
            default_tenant: "app1".into(),
            ..Config::default()
        });
        for _ in 0..3 {
            orch.ingest(digest("app1", 1000));
        }
        orch.ingest(digest("app2", 1000));

        let report = orch.compute(1005);
        let app1 = &report["app1"];
        assert_eq!(app1["requests"], 3);
        assert_eq!(app1["rate"], 0.6);
        assert_eq!(app1["uniq_visitor"], 1);
        assert_eq!(report.len(), 1);
    }

    #[test]
    fn multiplex_creates_and_evicts_slices() {
        let mut orch = read_only(Config {
            multiplex: true,
            window_secs: 60,
            ..Config::default()
        });
        orch.ingest(digest("app1", 1000));
        orch.ingest(digest("app2", 1010));
        assert_eq!(orch.tenants(), vec!["", "app1", "app2"]);
        assert_eq!(orch.raw_len(""), Some(2));

        let report = orch.compute(1010);
        assert_eq!(report[""]["requests"], 2);
        assert_eq!(report["app1"]["requests"], 1);

        // app1's only digest falls out of the window.
        let report = orch.compute(1065);
        assert_eq!(orch.tenants(), vec!["", "app2"]);
        assert_eq!(report[""]["requests"], 1);
        assert!(!report.contains_key("app1"));

        // The catch-all slice survives even when empty.
        orch.compute(2000);
        assert_eq!(orch.tenants(), vec![""]);
    }

    #[test]
    fn raw_history_is_bounded_by_window() {
        let mut orch = read_only(Config {
            window_secs: 10,
            ..Config::default()
        });
        for t in 0..1000 {
            orch.ingest(digest("", t));
            if t % 10 == 0 {
                orch.compute(t);
            }
        }
        orch.compute(999);
        assert_eq!(orch.raw_len(""), Some(11));

        let state = orch.shared.state.lock();
        for stat in state.slices[""].statistics.lock().iter() {
            assert!(stat.cached_buckets() <= 11, "{} kept {}", stat.key(), stat.cached_buckets());
        }
    }

    #[test]
    fn hostnames_end_to_end() {
        let mut orch = read_only(Config::default());
        let hit = |host: &str, path: &str, start: i64| {
            let json = format!(
                r#"{{"t0.sec":{start},"t1.sec":{start},"host":"{host}","path":"{path}"}}"#
            );
            Arc::new(Digest::decode("", json).unwrap())
        };
        orch.ingest(hit("a.com", "/x", 1000));
        orch.ingest(hit("a.com", "/x", 1000));
        orch.ingest(hit("b.com", "/y", 1001));

        let report = orch.compute(1005);
        assert_eq!(
            report[""]["hostnames"],
            serde_json::json!({
                "a.com": {"total": 2, "paths": {"/x": 2}},
                "b.com": {"total": 1, "paths": {"/y": 1}},
            })
        );
    }

    #[tokio::test]
    async fn resurrects_digests_and_computations() {
        let mut store = MemoryStore::default();
        store.0.insert(
            report_key("app1", 1000, 1),
            r#"{"t0.sec":1000,"t1.sec":1000,"rack-id":"app1"}"#.into(),
        );
        store.0.insert(
            report_key("app2", 1000, 2),
            r#"{"t0.sec":1000,"t1.sec":1000,"rack-id":"app2"}"#.into(),
        );
        store.0.insert(report_key("app1", 1000, 3), "garbage".into());
        store.0.insert(stats_key("requests", "app1", 990), r#"[990,"requests",4]"#.into());

        let mut orch = read_only(Config {
            default_tenant: "app1".into(),
            loaders: vec!["redis_http".into(), "redis_stats".into()],
            ..Config::default()
        });
        orch.resurrect(&mut store).await.unwrap();
        assert_eq!(orch.raw_len("app1"), Some(1));

        let report = orch.compute(1000);
        assert_eq!(report["app1"]["requests"], 5);
    }

    #[tokio::test]
    async fn resurrection_keeps_dotted_tenants_apart() {
        let mut store = MemoryStore::default();
        store.0.insert(stats_key("requests", "app", 990), r#"[990,"requests",4]"#.into());
        store.0.insert(stats_key("requests", "app.one", 991), r#"[991,"requests",100]"#.into());
        store.0.insert(
            report_key("app.one", 995, 1),
            r#"{"t0.sec":995,"t1.sec":995,"rack-id":"app"}"#.into(),
        );

        let mut orch = read_only(Config {
            default_tenant: "app".into(),
            loaders: vec!["redis_http".into(), "redis_stats".into()],
            ..Config::default()
        });
        orch.resurrect(&mut store).await.unwrap();
        assert_eq!(orch.raw_len("app"), Some(0));

        let report = orch.compute(1000);
        assert_eq!(report["app"]["requests"], 4);
    }

    #[tokio::test]
    async fn run_requires_resurrection_when_loaders_configured() {
        let mut orch = read_only(Config {
            loaders: vec!["redis_stats".into()],
            ..Config::default()
        });
        let err = orch.run(|_| Signal::Kill).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn second_run_is_illegal() {
        let mut orch = read_only(Config::default());
        let mut cycles = 0;
        orch.run(|_| {
            cycles += 1;
            Signal::Kill
        })
        .await
        .unwrap();
        assert_eq!(cycles, 1);
        assert!(orch.is_killed());
        assert!(matches!(orch.run(|_| Signal::Continue).await, Err(Error::Killed)));
    }

    #[tokio::test]
    async fn live_ingestion_feeds_cycles() {
        let (tx, subscriber) = Subscriber::channel();
        let mut orch = Orchestrator::new(
            Config {
                period: Duration::from_millis(20),
                ..Config::default()
            },
            None,
        )
        .unwrap()
        .with_subscriber(subscriber);

        let now = crate::now_secs();
        for _ in 0..4 {
            let payload = format!(r#"{{"t0.sec":{now},"t1.sec":{now}}}"#);
            tx.send(Message::new("report", "app1", payload)).await.unwrap();
        }
        tx.send(Message::new("report", "app1", "not json")).await.unwrap();

        let mut seen = 0;
        let mut cycles = 0;
        orch.run(|report| {
            cycles += 1;
            seen = report[""]["requests"].as_u64().unwrap_or(0);
            if seen == 4 || cycles > 200 {
                Signal::Kill
            } else {
                Signal::Continue
            }
        })
        .await
        .unwrap();
        assert_eq!(seen, 4);

        // Once killed, the orchestrator takes no more digests.
        assert_eq!(orch.ingest(digest("", now)), Signal::Kill);
    }

    #[tokio::test]
    async fn live_run_needs_subscriber() {
        let mut orch = Orchestrator::new(Config::default(), None).unwrap();
        assert!(matches!(orch.run(|_| Signal::Kill).await, Err(Error::Config(_))));
    }
}
