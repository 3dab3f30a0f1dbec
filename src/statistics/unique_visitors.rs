use std::collections::BTreeSet;
use std::sync::Arc;

use super::{Aggregate, Computation};
use crate::digest::Digest;

/// Distinct visitors in the window, identified by [`Digest::visitor_token`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UniqueVisitors;

impl Aggregate for UniqueVisitors {
    const KEY: &'static str = "uniq_visitor";
    type Bucket = BTreeSet<String>;
    type Output = u64;

    fn compute_result(&self, _bucket_key: i64, items: &[Arc<Digest>]) -> BTreeSet<String> {
        items.iter().map(|d| d.visitor_token().to_owned()).collect()
    }

    fn reduce_computations(
        &self,
        computations: &[&Computation<BTreeSet<String>>],
        _now: i64,
    ) -> u64 {
        let all: BTreeSet<&String> = computations.iter().flat_map(|c| c.result.iter()).collect();
        all.len() as u64
    }
}
