use std::error::Error as _;
use std::fmt;
use thiserror::Error;

use crate::feed::{FetchError, ParseError};
use crate::storage::{DatabaseError, ExceptionInfo};

/// Failure category of a feed update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network, timeout or HTTP error; retried next cycle
    Fetch,
    /// Not a feed even after best-effort recovery; retried next cycle
    Parse,
    /// Persistence unavailable; says nothing about the feed itself
    Storage,
    /// Internal invariant violated; the feed is disabled for review
    FatalAssertion,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Fetch => "FetchFailure",
            FailureKind::Parse => "ParseFailure",
            FailureKind::Storage => "StorageFailure",
            FailureKind::FatalAssertion => "FatalAssertion",
        }
    }

    /// Whether the feed stays scheduled after this failure
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::FatalAssertion)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a feed update failed.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("storage failed: {0}")]
    Storage(#[from] DatabaseError),

    /// An internal invariant did not hold (including a panic inside the unit)
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl UpdateError {
    pub fn kind(&self) -> FailureKind {
        match self {
            UpdateError::Fetch(_) => FailureKind::Fetch,
            UpdateError::Parse(_) => FailureKind::Parse,
            UpdateError::Storage(_) => FailureKind::Storage,
            UpdateError::Invariant(_) => FailureKind::FatalAssertion,
        }
    }

    /// Render for the feed's `last_exception_*` columns.
    ///
    /// The traceback is the chain of underlying causes, one per line.
    pub fn exception_info(&self) -> ExceptionInfo {
        let mut traceback = Vec::new();
        let mut source = self.source();
        while let Some(cause) = source {
            traceback.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        ExceptionInfo {
            type_name: self.kind().as_str().to_string(),
            value: self.to_string(),
            traceback: traceback.join("\n"),
        }
    }
}

/// Entry counts of one reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub new: usize,
    pub modified: usize,
    pub unmodified: usize,
}

impl EntryCounts {
    pub fn total(&self) -> usize {
        self.new + self.modified + self.unmodified
    }
}

/// An entry that could not be stored; siblings were still processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub entry_id: String,
    pub error: String,
}

/// A completed (non-failed) update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated {
        counts: EntryCounts,
        failures: Vec<EntryFailure>,
    },
    /// Not due, or the server answered 304
    NotModified,
}

/// Terminal state of a feed update unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Succeeded,
    /// Stored, but some entries failed
    PartiallyFailed,
    Failed(FailureKind),
}

/// The result of updating one feed, as handed to the outcome sink.
#[derive(Debug)]
pub struct FeedReport {
    pub url: String,
    pub result: Result<UpdateOutcome, UpdateError>,
    /// Diagnostic for a malformed document that was still stored
    pub parse_warning: Option<String>,
}

impl FeedReport {
    pub fn state(&self) -> TerminalState {
        match &self.result {
            Ok(UpdateOutcome::Updated { failures, .. }) if !failures.is_empty() => {
                TerminalState::PartiallyFailed
            }
            Ok(_) => TerminalState::Succeeded,
            Err(e) => TerminalState::Failed(e.kind()),
        }
    }

    /// Failure category, if the update failed
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.result.as_ref().err().map(UpdateError::kind)
    }
}

impl fmt::Display for FeedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(UpdateOutcome::Updated { counts, failures }) => {
                write!(
                    f,
                    "{}: updated (new {}, modified {}, unmodified {}",
                    self.url, counts.new, counts.modified, counts.unmodified
                )?;
                if !failures.is_empty() {
                    write!(f, ", failed {}", failures.len())?;
                }
                f.write_str(")")?;
                if self.parse_warning.is_some() {
                    f.write_str(" [malformed]")?;
                }
                Ok(())
            }
            Ok(UpdateOutcome::NotModified) => write!(f, "{}: not modified", self.url),
            Err(e) => write!(f, "{}: {}: {}", self.url, e.kind(), e),
        }
    }
}

/// Aggregate counts for one scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub partially_failed: usize,
    pub not_modified: usize,
    pub fetch_failures: usize,
    pub parse_failures: usize,
    pub storage_failures: usize,
    pub fatal_assertions: usize,
}

impl UpdateSummary {
    pub fn record(&mut self, report: &FeedReport) {
        self.processed += 1;
        if matches!(report.result, Ok(UpdateOutcome::NotModified)) {
            self.not_modified += 1;
        }
        match report.state() {
            TerminalState::Succeeded => self.succeeded += 1,
            TerminalState::PartiallyFailed => self.partially_failed += 1,
            TerminalState::Failed(FailureKind::Fetch) => self.fetch_failures += 1,
            TerminalState::Failed(FailureKind::Parse) => self.parse_failures += 1,
            TerminalState::Failed(FailureKind::Storage) => self.storage_failures += 1,
            TerminalState::Failed(FailureKind::FatalAssertion) => self.fatal_assertions += 1,
        }
    }

    pub fn failed(&self) -> usize {
        self.fetch_failures + self.parse_failures + self.storage_failures + self.fatal_assertions
    }
}

impl fmt::Display for UpdateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {}, succeeded {} ({} not modified), partially failed {}, failed {} \
             (fetch {}, parse {}, storage {}, fatal {})",
            self.processed,
            self.succeeded,
            self.not_modified,
            self.partially_failed,
            self.failed(),
            self.fetch_failures,
            self.parse_failures,
            self.storage_failures,
            self.fatal_assertions
        )
    }
}
