use std::collections::BTreeMap;
use std::time::Duration;

use hdrhistogram::Histogram;
use log::warn;
use parking_lot::Mutex;

use super::percentiles::PercentileSet;

/// HdrHistogram range: 1 μs → 60 s, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 60_000_000;
const HIST_SIGFIG: u8 = 3;

/// Name under which whole compute cycles are recorded.
pub const TOTAL: &str = ".total";

/// How long each statistic takes to compute, one histogram per key.
///
/// The compute loop calls `record()`, the dashboard calls `snapshot()`.
#[derive(Default)]
pub struct CycleTimings {
    inner: Mutex<BTreeMap<String, Histogram<u64>>>,
}

impl CycleTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str, elapsed: Duration) {
        let us = (elapsed.as_micros() as u64).clamp(HIST_LOW, HIST_HIGH);
        let mut inner = self.inner.lock();
        if !inner.contains_key(key) {
            match Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG) {
                Ok(hist) => {
                    inner.insert(key.to_owned(), hist);
                }
                Err(e) => {
                    warn!("cannot create histogram for {key}: {e}");
                    return;
                }
            }
        }
        if let Some(hist) = inner.get_mut(key) {
            let _ = hist.record(us);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, PercentileSet> {
        self.inner
            .lock()
            .iter()
            .map(|(key, hist)| (key.clone(), PercentileSet::from_histogram(hist)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_per_key() {
        let timings = CycleTimings::new();
        timings.record("requests", Duration::from_micros(100));
        timings.record("requests", Duration::from_micros(300));
        timings.record(TOTAL, Duration::ZERO);

        let snap = timings.snapshot();
        assert_eq!(snap["requests"].count, 2);
        assert_eq!(snap["requests"].min, 100);
        assert_eq!(snap[TOTAL].count, 1);
        assert_eq!(snap[TOTAL].min, 1);
    }
}
