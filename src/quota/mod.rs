//! Quota ledger — per-user daily send-allowance accounting.

pub mod ledger;

pub use ledger::{QuotaLedger, QuotaOutcome, Reservation};
