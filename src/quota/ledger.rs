//! Daily send-quota accounting.
//!
//! Reservation is a single guarded UPDATE in the store, so two concurrent
//! reservations for the same user can never both succeed past the allowance.
//! Exhaustion is an expected business refusal, surfaced as a typed outcome
//! rather than an error.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tracing::debug;

use crate::config::{QuotaConfig, QuotaResetPolicy};
use crate::error::DatabaseError;
use crate::store::Database;

/// A successful reservation. Hold it until the send is dispatched; release it
/// if the provider rejects the message so the ledger reflects *attempted*
/// sends, not merely planned ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub user_id: String,
    pub day: NaiveDate,
    pub cost: u32,
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaOutcome {
    Reserved(Reservation),
    /// Allowance would be exceeded; `used` is untouched.
    Exhausted,
}

/// The ledger day a given instant falls in under a reset policy.
pub fn ledger_day(at: DateTime<Utc>, policy: QuotaResetPolicy) -> NaiveDate {
    match policy {
        QuotaResetPolicy::UtcMidnight => at.date_naive(),
        QuotaResetPolicy::FixedOffsetMinutes(minutes) => {
            let offset = FixedOffset::east_opt(minutes * 60)
                .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
            at.with_timezone(&offset).date_naive()
        }
    }
}

/// Per-user daily send-allowance ledger.
pub struct QuotaLedger {
    db: Arc<dyn Database>,
    config: QuotaConfig,
}

impl QuotaLedger {
    pub fn new(db: Arc<dyn Database>, config: QuotaConfig) -> Self {
        Self { db, config }
    }

    /// Today's ledger day under the configured reset policy.
    pub fn today(&self) -> NaiveDate {
        ledger_day(Utc::now(), self.config.reset_policy)
    }

    /// Atomically reserve `cost` sends for today.
    ///
    /// Creates today's ledger row lazily with the default allowance on first
    /// access of a new day.
    pub async fn check_and_reserve(
        &self,
        user_id: &str,
        cost: u32,
    ) -> Result<QuotaOutcome, DatabaseError> {
        let day = self.today();
        let reserved = self
            .db
            .quota_reserve(user_id, day, cost, self.config.default_daily_allowance)
            .await?;

        if reserved {
            debug!(user_id, cost, %day, "Quota reserved");
            Ok(QuotaOutcome::Reserved(Reservation {
                user_id: user_id.to_string(),
                day,
                cost,
            }))
        } else {
            debug!(user_id, cost, %day, "Quota exhausted");
            Ok(QuotaOutcome::Exhausted)
        }
    }

    /// Compensating decrement for a reservation whose send failed to
    /// dispatch.
    pub async fn release(&self, reservation: Reservation) -> Result<(), DatabaseError> {
        self.db
            .quota_release(&reservation.user_id, reservation.day, reservation.cost)
            .await
    }
}
