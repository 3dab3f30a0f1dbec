//! Self-observation of the compute loop.

pub mod collector;
pub mod percentiles;
pub mod stream;

pub use collector::{CycleTimings, TOTAL};
pub use percentiles::PercentileSet;
