use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Aggregate, Computation};
use crate::digest::Digest;

/// Request count for one host, broken down per path.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub total: u64,
    pub paths: BTreeMap<String, u64>,
}

/// Per-hostname request counts with a per-path breakdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostnameStats;

impl Aggregate for HostnameStats {
    const KEY: &'static str = "hostnames";
    type Bucket = BTreeMap<String, HostStats>;
    type Output = BTreeMap<String, HostStats>;

    fn compute_result(&self, _bucket_key: i64, items: &[Arc<Digest>]) -> Self::Bucket {
        let mut hosts: BTreeMap<String, HostStats> = BTreeMap::new();
        for d in items {
            let stats = hosts.entry(d.host().to_owned()).or_default();
            stats.total += 1;
            *stats.paths.entry(d.path().to_owned()).or_default() += 1;
        }
        hosts
    }

    fn reduce_computations(
        &self,
        computations: &[&Computation<Self::Bucket>],
        _now: i64,
    ) -> Self::Output {
        let mut hosts: BTreeMap<String, HostStats> = BTreeMap::new();
        for computation in computations {
            for (host, stats) in &computation.result {
                let merged = hosts.entry(host.clone()).or_default();
                merged.total += stats.total;
                for (path, count) in &stats.paths {
                    *merged.paths.entry(path.clone()).or_default() += count;
                }
            }
        }
        hosts
    }
}
