use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::outcome::{FailureKind, FeedReport, TerminalState, UpdateOutcome, UpdateSummary};

/// Reports feed outcomes to operators.
///
/// Emits one log event per feed and one per cycle. Feeds that hit a fatal
/// assertion are also appended, one URL per line, to the broken-feeds file
/// so they can be reviewed after the process exits.
pub struct OutcomeSink {
    broken_feeds_path: Option<PathBuf>,
    // Serializes appends from concurrent units
    write_lock: Mutex<()>,
}

impl OutcomeSink {
    pub fn new(broken_feeds_path: Option<PathBuf>) -> Self {
        Self {
            broken_feeds_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Log one feed's outcome and persist it to the broken-feeds file if fatal
    pub async fn record(&self, report: &FeedReport) {
        match (&report.result, report.state()) {
            (Ok(UpdateOutcome::NotModified), _) => {
                tracing::info!(feed = %report.url, outcome = "not_modified", "{}", report);
            }
            (Ok(UpdateOutcome::Updated { counts, failures }), state) => {
                let outcome = if state == TerminalState::PartiallyFailed {
                    "partially_failed"
                } else {
                    "updated"
                };
                if let Some(warning) = &report.parse_warning {
                    tracing::warn!(
                        feed = %report.url,
                        outcome = outcome,
                        new = counts.new,
                        modified = counts.modified,
                        unmodified = counts.unmodified,
                        failed = failures.len(),
                        warning = %warning,
                        "{}",
                        report
                    );
                } else {
                    tracing::info!(
                        feed = %report.url,
                        outcome = outcome,
                        new = counts.new,
                        modified = counts.modified,
                        unmodified = counts.unmodified,
                        failed = failures.len(),
                        "{}",
                        report
                    );
                }
            }
            (Err(e), _) => {
                tracing::warn!(
                    feed = %report.url,
                    outcome = e.kind().as_str(),
                    error = %e,
                    "{}",
                    report
                );
            }
        }

        if report.failure_kind() == Some(FailureKind::FatalAssertion) {
            self.append_broken(&report.url).await;
        }
    }

    /// Log the aggregate outcome of a cycle
    pub fn record_summary(&self, summary: &UpdateSummary) {
        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            not_modified = summary.not_modified,
            partially_failed = summary.partially_failed,
            fetch_failures = summary.fetch_failures,
            parse_failures = summary.parse_failures,
            storage_failures = summary.storage_failures,
            fatal_assertions = summary.fatal_assertions,
            "Update cycle finished: {}",
            summary
        );
    }

    async fn append_broken(&self, url: &str) {
        let Some(path) = &self.broken_feeds_path else {
            return;
        };

        let _guard = self.write_lock.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(format!("{}\n", url).as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                feed = %url,
                path = %path.display(),
                error = %e,
                "Failed to append to broken feeds file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::outcome::{EntryCounts, UpdateError};

    fn fatal(url: &str) -> FeedReport {
        FeedReport {
            url: url.to_string(),
            result: Err(UpdateError::Invariant("counts mismatch".to_string())),
            parse_warning: None,
        }
    }

    #[tokio::test]
    async fn test_fatal_reports_are_appended_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken_feeds.csv");
        let sink = OutcomeSink::new(Some(path.clone()));

        sink.record(&fatal("https://a.example.com/feed")).await;
        sink.record(&fatal("https://b.example.com/feed")).await;
        sink.record(&fatal("https://a.example.com/feed")).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "https://a.example.com/feed\nhttps://b.example.com/feed\nhttps://a.example.com/feed\n"
        );
    }

    #[tokio::test]
    async fn test_non_fatal_reports_are_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken_feeds.csv");
        let sink = OutcomeSink::new(Some(path.clone()));

        sink.record(&FeedReport {
            url: "https://a.example.com/feed".to_string(),
            result: Ok(UpdateOutcome::Updated {
                counts: EntryCounts::default(),
                failures: vec![],
            }),
            parse_warning: Some("mismatched tag".to_string()),
        })
        .await;
        sink.record(&FeedReport {
            url: "https://b.example.com/feed".to_string(),
            result: Err(crate::feed::FetchError::HttpStatus(500).into()),
            parse_warning: None,
        })
        .await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_path_is_logged_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending
        let sink = OutcomeSink::new(Some(dir.path().to_path_buf()));
        sink.record(&fatal("https://a.example.com/feed")).await;
    }
}
