//! Outreach queue — one entry per planned contact attempt and its lifecycle.

pub mod model;

pub use model::{QueueEntry, QueueEvent, QueueStatus, TransitionOutcome};
