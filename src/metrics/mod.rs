//! Outcome metrics — read-side aggregation over finalized outreach attempts.

pub mod aggregator;

pub use aggregator::{OutcomeAggregator, OutcomeReport};
