use std::sync::Arc;

use parking_lot::Mutex;

use crate::digest::Digest;
use crate::history::History;
use crate::statistics::AnyStatistic;

/// Everything computed for one tenant: its raw digests and its statistics.
///
/// The statistics sit behind their own lock so a compute cycle can run on
/// a snapshot of `history` without holding the orchestrator lock.
pub struct Slice {
    pub tenant_id: String,
    pub history: History<Arc<Digest>>,
    pub statistics: Arc<Mutex<Vec<AnyStatistic>>>,
}

impl Slice {
    pub fn new(tenant_id: impl Into<String>, statistics: Vec<AnyStatistic>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            history: History::new(),
            statistics: Arc::new(Mutex::new(statistics)),
        }
    }

    /// The catch-all slice, accepting digests of every tenant.
    pub fn keep_all(&self) -> bool {
        self.tenant_id.is_empty()
    }

    pub fn matches(&self, digest: &Digest) -> bool {
        self.keep_all() || digest.tenant_id() == self.tenant_id
    }

    /// Files `digest` if this slice is interested in it.
    pub fn store(&mut self, digest: &Arc<Digest>) -> bool {
        if !self.matches(digest) {
            return false;
        }
        self.history.insert(Arc::clone(digest));
        true
    }
}
