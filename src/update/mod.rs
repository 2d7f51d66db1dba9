//! The feed update engine.
//!
//! [`UpdateScheduler`] selects due feeds and runs a [`FeedUpdater`] for each
//! with bounded concurrency. Each unit fetches conditionally, parses,
//! reconciles entries and writes back exactly one terminal state; the
//! [`OutcomeSink`] reports every outcome and the per-cycle summary.

mod outcome;
mod reconcile;
mod scheduler;
mod sink;
mod unit;

pub use outcome::{
    EntryCounts, EntryFailure, FailureKind, FeedReport, TerminalState, UpdateError,
    UpdateOutcome, UpdateSummary,
};
pub use reconcile::{reconcile_entries, unique_entry_count, Reconciliation};
pub use scheduler::{select_due_feeds, UpdateScheduler};
pub use sink::OutcomeSink;
pub use unit::FeedUpdater;
