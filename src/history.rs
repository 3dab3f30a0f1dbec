use std::collections::BTreeMap;
use std::sync::Arc;

/// Anything that can be filed under an integer-second bucket.
pub trait Bucketed {
    fn bucket_key(&self) -> i64;
}

impl<T: Bucketed + ?Sized> Bucketed for Arc<T> {
    fn bucket_key(&self) -> i64 {
        (**self).bucket_key()
    }
}

/// Time-bucketed, append-only collection of items.
///
/// Every item lives in the bucket matching its own bucket key. Filtering
/// never touches `self`: [`recent`](Self::recent) and
/// [`filter`](Self::filter) return a new history which the caller has to
/// store back if it wants the pruning to stick.
#[derive(Debug, Clone)]
pub struct History<T> {
    buckets: BTreeMap<i64, Vec<T>>,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }
}

impl<T: Bucketed + Clone> History<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: T) {
        self.buckets.entry(item.bucket_key()).or_default().push(item);
    }

    /// Keeps the buckets whose key is at least `now - secs`.
    pub fn recent(&self, secs: i64, now: i64) -> Self {
        let oldest = now - secs;
        self.filter(|key| key >= oldest)
    }

    /// Keeps the buckets whose key satisfies `keep`.
    pub fn filter(&self, mut keep: impl FnMut(i64) -> bool) -> Self {
        let buckets = self
            .buckets
            .iter()
            .filter(|(key, _)| keep(**key))
            .map(|(key, items)| (*key, items.clone()))
            .collect();
        Self { buckets }
    }

    /// Replaces whole buckets with the given ones.
    ///
    /// Buckets present in `fresh` overwrite the existing content for that
    /// key; other buckets are left alone.
    pub fn merge(&mut self, fresh: BTreeMap<i64, Vec<T>>) {
        for (key, items) in fresh {
            self.buckets.insert(key, items);
        }
    }
}

impl<T> History<T> {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Bucket keys, ascending.
    pub fn bucket_keys(&self) -> Vec<i64> {
        self.buckets.keys().copied().collect()
    }

    /// Every item of every bucket, flattened.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.buckets.values().flatten()
    }

    pub fn buckets(&self) -> impl Iterator<Item = (i64, &[T])> {
        self.buckets.iter().map(|(key, items)| (*key, items.as_slice()))
    }

    /// Total number of items across buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}
