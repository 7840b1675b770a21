//! Outcome metrics aggregator.
//!
//! Pure read side: scans finalized queue entries in a window and computes
//! reply rate, time-to-reply percentiles, and throughput. Runs concurrently
//! with the monitor — it reads whatever snapshot the store serves and blocks
//! no writers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::queue::{QueueEntry, QueueStatus};
use crate::store::Database;

/// Aggregated outcomes for a window.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub finalized: u32,
    pub replied: u32,
    pub stale: u32,
    pub failed: u32,
    /// replied / finalized, 0.0 on an empty window.
    pub reply_rate: f64,
    pub median_time_to_reply_secs: Option<i64>,
    pub p90_time_to_reply_secs: Option<i64>,
    /// Finalized attempts per day of window.
    pub throughput_per_day: f64,
}

/// Read-only aggregator over finalized outreach attempts.
pub struct OutcomeAggregator {
    db: Arc<dyn Database>,
}

impl OutcomeAggregator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Compute the outcome report for `[start, end)`.
    pub async fn report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<OutcomeReport, DatabaseError> {
        let entries = self.db.finalized_entries_between(start, end).await?;
        Ok(summarize(start, end, &entries))
    }
}

/// Pure summary over a finalized-entry slice.
fn summarize(start: DateTime<Utc>, end: DateTime<Utc>, entries: &[QueueEntry]) -> OutcomeReport {
    let mut replied = 0u32;
    let mut stale = 0u32;
    let mut failed = 0u32;
    let mut reply_times: Vec<i64> = Vec::new();

    for entry in entries {
        match entry.status {
            QueueStatus::Replied => {
                replied += 1;
                reply_times.push(entry.age_at_last_transition().num_seconds());
            }
            QueueStatus::Stale => stale += 1,
            QueueStatus::Failed => failed += 1,
            // The store query only yields terminal entries; anything else
            // would be a query regression worth noticing in the counts.
            _ => {}
        }
    }

    reply_times.sort_unstable();
    let finalized = replied + stale + failed;

    let window_days = (end - start).num_seconds().max(1) as f64 / 86_400.0;

    OutcomeReport {
        window_start: start,
        window_end: end,
        finalized,
        replied,
        stale,
        failed,
        reply_rate: if finalized == 0 {
            0.0
        } else {
            f64::from(replied) / f64::from(finalized)
        },
        median_time_to_reply_secs: percentile(&reply_times, 50.0),
        p90_time_to_reply_secs: percentile(&reply_times, 90.0),
        throughput_per_day: f64::from(finalized) / window_days,
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[i64], pct: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct / 100.0 * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted.get(rank.min(sorted.len() - 1)).copied()
}
