use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Aggregate, Computation};
use crate::digest::Digest;

/// Default number of slow requests reported.
pub const DEFAULT_SLOW_REQUESTS: usize = 10;

/// A request url and its duration in milliseconds, encoded as `[url, lifetime]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, i64)", into = "(String, i64)")]
pub struct SlowRequest {
    pub url: String,
    pub lifetime: i64,
}

impl From<(String, i64)> for SlowRequest {
    fn from((url, lifetime): (String, i64)) -> Self {
        Self { url, lifetime }
    }
}

impl From<SlowRequest> for (String, i64) {
    fn from(r: SlowRequest) -> Self {
        (r.url, r.lifetime)
    }
}

/// The `number` slowest requests of the window.
#[derive(Debug, Clone, Copy)]
pub struct SlowRequests {
    pub number: usize,
}

impl SlowRequests {
    pub fn new(number: usize) -> Self {
        Self { number }
    }

    /// Slowest first; equal lifetimes keep their relative order.
    fn slowest(&self, mut requests: Vec<SlowRequest>) -> Vec<SlowRequest> {
        requests.sort_by(|a, b| b.lifetime.cmp(&a.lifetime));
        requests.truncate(self.number);
        requests
    }
}

impl Default for SlowRequests {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_REQUESTS)
    }
}

impl Aggregate for SlowRequests {
    const KEY: &'static str = "slow_requests";
    type Bucket = Vec<SlowRequest>;
    type Output = Vec<SlowRequest>;

    fn compute_result(&self, _bucket_key: i64, items: &[Arc<Digest>]) -> Vec<SlowRequest> {
        let requests = items
            .iter()
            .map(|d| SlowRequest {
                url: d.url().to_owned(),
                lifetime: d.lifetime(),
            })
            .collect();
        self.slowest(requests)
    }

    fn reduce_computations(
        &self,
        computations: &[&Computation<Vec<SlowRequest>>],
        _now: i64,
    ) -> Vec<SlowRequest> {
        let all = computations
            .iter()
            .flat_map(|c| c.result.iter().cloned())
            .collect();
        self.slowest(all)
    }

    /// Accepts `[url, lifetime]` pairs as well as the `{url: lifetime}`
    /// objects older producers persisted.
    fn restore_result(&self, value: Value) -> serde_json::Result<Vec<SlowRequest>> {
        let entries = match value {
            Value::Array(entries) => entries,
            other => return serde_json::from_value(other),
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Value::Object(map) => {
                    for (url, lifetime) in map {
                        out.push(SlowRequest {
                            url,
                            lifetime: serde_json::from_value(lifetime)?,
                        });
                    }
                }
                other => out.push(serde_json::from_value(other)?),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(url: &str, lifetime: i64) -> SlowRequest {
        SlowRequest {
            url: url.into(),
            lifetime,
        }
    }

    #[test]
    fn keeps_global_top_n() {
        let stat = SlowRequests::new(2);
        let a = Computation::new(1, "slow_requests", vec![req("a", 50)]);
        let b = Computation::new(2, "slow_requests", vec![req("b", 200), req("c", 10)]);
        assert_eq!(
            stat.reduce_computations(&[&a, &b], 2),
            vec![req("b", 200), req("a", 50)]
        );
    }

    #[test]
    fn ties_keep_arrival_order() {
        let stat = SlowRequests::new(3);
        let c = Computation::new(1, "slow_requests", vec![req("x", 5), req("y", 9), req("z", 5)]);
        assert_eq!(
            stat.reduce_computations(&[&c], 1),
            vec![req("y", 9), req("x", 5), req("z", 5)]
        );
    }

    #[test]
    fn restores_pairs_and_objects() {
        let stat = SlowRequests::default();
        let restored = stat
            .restore_result(serde_json::json!([["/a", 12], {"/b": 7}]))
            .unwrap();
        assert_eq!(restored, vec![req("/a", 12), req("/b", 7)]);
        assert!(stat.restore_result(serde_json::json!([["/a"]])).is_err());
    }

    #[test]
    fn encodes_as_pairs() {
        let json = serde_json::to_string(&vec![req("/a", 12)]).unwrap();
        assert_eq!(json, r#"[["/a",12]]"#);
    }
}
