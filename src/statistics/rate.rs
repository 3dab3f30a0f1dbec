use std::sync::Arc;

use super::{Aggregate, Computation};
use crate::digest::Digest;

/// Average requests per second since the oldest bucket in the window.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rate;

impl Aggregate for Rate {
    const KEY: &'static str = "rate";
    type Bucket = u64;
    type Output = f64;

    fn compute_result(&self, _bucket_key: i64, items: &[Arc<Digest>]) -> u64 {
        items.len() as u64
    }

    fn reduce_computations(&self, computations: &[&Computation<u64>], now: i64) -> f64 {
        let Some(oldest) = computations.iter().map(|c| c.bucket_key).min() else {
            return 0.0;
        };
        let total: u64 = computations.iter().map(|c| c.result).sum();
        // Everything landed in the current second.
        let elapsed = (now - oldest).max(1);
        total as f64 / elapsed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_over_elapsed_seconds() {
        assert_eq!(Rate.reduce_computations(&[], 110), 0.0);
        let a = Computation::new(100, "rate", 4);
        let b = Computation::new(105, "rate", 6);
        assert_eq!(Rate.reduce_computations(&[&a, &b], 110), 1.0);
    }

    #[test]
    fn same_second_does_not_divide_by_zero() {
        let a = Computation::new(110, "rate", 3);
        assert_eq!(Rate.reduce_computations(&[&a], 110), 3.0);
    }
}
