use std::sync::Arc;

use super::{Aggregate, Computation};
use crate::digest::Digest;

/// Number of requests in the window.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter;

impl Aggregate for Counter {
    const KEY: &'static str = "requests";
    type Bucket = u64;
    type Output = u64;

    fn compute_result(&self, _bucket_key: i64, items: &[Arc<Digest>]) -> u64 {
        items.len() as u64
    }

    fn reduce_computations(&self, computations: &[&Computation<u64>], _now: i64) -> u64 {
        computations.iter().map(|c| c.result).sum()
    }
}
