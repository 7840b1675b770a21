//! Staleness sweep — retires threads that never got a reply.
//!
//! Policy lives here, not in each poll pass: the sweep runs on its own cron
//! cadence and marks open threads older than the configured maximum age as
//! stale, together with their queue entries.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Error;
use crate::monitor::ReplyMonitor;
use crate::queue::QueueStatus;
use crate::threads::ThreadStatus;

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub threads_staled: u32,
    pub entries_staled: u32,
}

impl ReplyMonitor {
    /// Mark every open thread past the maximum age as stale.
    ///
    /// Idempotent under overlap: each retirement is a compare-and-set, so a
    /// concurrent sweep simply loses the race and moves on.
    pub async fn sweep_stale(&self) -> Result<SweepSummary, Error> {
        let cutoff = Utc::now() - self.config().stale_after;
        let aged = self.db().open_threads_older_than(cutoff).await?;

        let mut summary = SweepSummary::default();
        for thread in aged {
            let retired = self
                .db()
                .transition_thread(thread.id, thread.status, ThreadStatus::Stale, None)
                .await?;
            if !retired {
                continue;
            }
            summary.threads_staled += 1;

            if let Some(entry_id) = thread.queue_entry_id {
                let entry_retired = self
                    .db()
                    .transition_queue_entry(entry_id, QueueStatus::AwaitingReply, QueueStatus::Stale)
                    .await?;
                if entry_retired {
                    summary.entries_staled += 1;
                } else {
                    warn!(
                        thread_id = %thread.id,
                        entry_id = %entry_id,
                        "Staled thread's entry was not awaiting a reply"
                    );
                }
            }
        }

        if summary.threads_staled > 0 {
            info!(
                threads = summary.threads_staled,
                entries = summary.entries_staled,
                "Staleness sweep retired aged threads"
            );
        }
        Ok(summary)
    }
}
