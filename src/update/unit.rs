use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::outcome::{EntryCounts, FailureKind, FeedReport, UpdateError, UpdateOutcome};
use super::reconcile::{reconcile_entries, unique_entry_count};
use crate::feed::{decide, feed_hash, parse_document, FeedFetcher, FetchDirective, FetchResponse};
use crate::storage::{DatabaseError, Feed, FeedStore, FeedUpdate, Validators};

/// Non-terminal states a unit passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fetching,
    Parsing,
    Reconciling,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fetching => "fetching",
            Stage::Parsing => "parsing",
            Stage::Reconciling => "reconciling",
        })
    }
}

/// A pipeline run that reached a non-failure terminal state, with the
/// write-back that persists it.
struct Completed {
    outcome: UpdateOutcome,
    update: FeedUpdate,
    parse_warning: Option<String>,
}

/// Runs the update of a single feed from start to terminal state.
///
/// Every failure (including a panic) is converted into the returned
/// [`FeedReport`]; nothing propagates to the caller. Exactly one write-back
/// reaches the store per attempted update: the success write, or the error
/// record. A fatal assertion additionally disables the feed.
pub struct FeedUpdater {
    store: Arc<dyn FeedStore>,
    fetcher: FeedFetcher,
    staleness_window: Duration,
}

impl FeedUpdater {
    pub fn new(store: Arc<dyn FeedStore>, fetcher: FeedFetcher, staleness_window: Duration) -> Self {
        Self {
            store,
            fetcher,
            staleness_window,
        }
    }

    pub fn store(&self) -> &Arc<dyn FeedStore> {
        &self.store
    }

    pub fn staleness_window(&self) -> Duration {
        self.staleness_window
    }

    /// Update one feed by URL, reading its current state from the store first
    pub async fn update_url(&self, url: &str, now: DateTime<Utc>) -> FeedReport {
        match self.store.get_feed_by_url(url).await {
            Ok(Some(feed)) => self.update_feed(&feed, now).await,
            Ok(None) => FeedReport {
                url: url.to_string(),
                result: Err(DatabaseError::FeedNotFound(url.to_string()).into()),
                parse_warning: None,
            },
            Err(e) => FeedReport {
                url: url.to_string(),
                result: Err(e.into()),
                parse_warning: None,
            },
        }
    }

    /// Update one feed.
    pub async fn update_feed(&self, feed: &Feed, now: DateTime<Utc>) -> FeedReport {
        let directive = decide(feed, now, self.staleness_window);
        if directive == FetchDirective::Skip {
            tracing::debug!(feed = %feed.url, "Checked recently, skipping");
            return FeedReport {
                url: feed.url.clone(),
                result: Ok(UpdateOutcome::NotModified),
                parse_warning: None,
            };
        }

        let attempt = AssertUnwindSafe(self.run(feed, directive, now))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(UpdateError::Invariant(panic_message(&*payload))));

        match attempt {
            Ok(done) => match self.store.upsert_feed(&done.update).await {
                Ok(()) => FeedReport {
                    url: feed.url.clone(),
                    result: Ok(done.outcome),
                    parse_warning: done.parse_warning,
                },
                Err(e) => {
                    let error = UpdateError::Storage(e);
                    self.record_failure(feed, &error, now).await;
                    FeedReport {
                        url: feed.url.clone(),
                        result: Err(error),
                        parse_warning: done.parse_warning,
                    }
                }
            },
            Err(error) => {
                self.record_failure(feed, &error, now).await;
                FeedReport {
                    url: feed.url.clone(),
                    result: Err(error),
                    parse_warning: None,
                }
            }
        }
    }

    async fn run(
        &self,
        feed: &Feed,
        directive: FetchDirective,
        now: DateTime<Utc>,
    ) -> Result<Completed, UpdateError> {
        let force = directive == FetchDirective::Unconditional;
        let sent = match directive {
            FetchDirective::Conditional(v) if !v.is_empty() => Some(v),
            _ => None,
        };

        tracing::debug!(
            feed = %feed.url,
            stage = %Stage::Fetching,
            conditional = sent.is_some(),
            force = force,
            "Update stage"
        );
        let (body, validators) = match self.fetcher.fetch(&feed.url, sent.as_ref()).await? {
            FetchResponse::NotModified => {
                if sent.is_none() {
                    return Err(UpdateError::Invariant(
                        "server answered 304 Not Modified to an unconditional request".to_string(),
                    ));
                }
                return Ok(Completed {
                    outcome: UpdateOutcome::NotModified,
                    update: FeedUpdate {
                        url: feed.url.clone(),
                        last_checked: now,
                        validators: None,
                        metadata: None,
                        data_hash: None,
                        parse_warning: feed.parse_warning.clone(),
                    },
                    parse_warning: None,
                });
            }
            FetchResponse::Fetched { body, validators } => (body, validators),
        };

        tracing::debug!(feed = %feed.url, stage = %Stage::Parsing, bytes = body.len(), "Update stage");
        let parsed = parse_document(&body)?;
        if let Some(diagnostic) = &parsed.bozo {
            tracing::debug!(feed = %feed.url, warning = %diagnostic, "Malformed document recovered");
        }
        let document_hash = feed_hash(&parsed);
        let unique = unique_entry_count(&parsed.entries);

        if !force && feed.data_hash.as_deref() == Some(document_hash.as_str()) {
            tracing::debug!(feed = %feed.url, "Document unchanged since last update");
            return Ok(Completed {
                outcome: UpdateOutcome::Updated {
                    counts: EntryCounts {
                        new: 0,
                        modified: 0,
                        unmodified: unique,
                    },
                    failures: Vec::new(),
                },
                update: FeedUpdate {
                    url: feed.url.clone(),
                    last_checked: now,
                    validators: Some(validators),
                    metadata: Some(parsed.metadata),
                    data_hash: Some(document_hash),
                    parse_warning: parsed.bozo.clone(),
                },
                parse_warning: parsed.bozo,
            });
        }

        tracing::debug!(feed = %feed.url, stage = %Stage::Reconciling, entries = unique, "Update stage");
        let reconciled =
            reconcile_entries(self.store.as_ref(), feed.id, &parsed.entries, now, force).await?;

        let accounted = reconciled.counts.total() + reconciled.failures.len();
        if accounted != unique {
            return Err(UpdateError::Invariant(format!(
                "reconciliation accounted for {} of {} entries",
                accounted, unique
            )));
        }

        // With failed entries neither the validators nor the document hash may
        // be kept, or the next cycle would never retry them.
        let clean = reconciled.failures.is_empty();
        Ok(Completed {
            outcome: UpdateOutcome::Updated {
                counts: reconciled.counts,
                failures: reconciled.failures,
            },
            update: FeedUpdate {
                url: feed.url.clone(),
                last_checked: now,
                validators: Some(if clean { validators } else { Validators::default() }),
                metadata: Some(parsed.metadata),
                data_hash: clean.then_some(document_hash),
                parse_warning: parsed.bozo.clone(),
            },
            parse_warning: parsed.bozo,
        })
    }

    async fn record_failure(&self, feed: &Feed, error: &UpdateError, now: DateTime<Utc>) {
        let fatal = error.kind() == FailureKind::FatalAssertion;
        if let Err(e) = self
            .store
            .record_feed_error(&feed.url, now, &error.exception_info(), fatal)
            .await
        {
            tracing::warn!(feed = %feed.url, error = %e, "Failed to record feed error");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic during update: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic during update: {}", message)
    } else {
        "panic during update".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use pretty_assertions::assert_eq;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Unit Feed</title>
  <item><guid>e1</guid><title>First</title></item>
  <item><guid>e2</guid><title>Second</title></item>
</channel></rss>"#;

    async fn setup(server: &MockServer) -> (Database, FeedUpdater, Feed) {
        let db = Database::open(":memory:").await.unwrap();
        let feed = db
            .add_feed(&format!("{}/feed", server.uri()), Utc::now())
            .await
            .unwrap();
        let fetcher = FeedFetcher::new(reqwest::Client::new(), StdDuration::from_secs(5), 1 << 20)
            .with_retry_base(StdDuration::from_millis(10));
        let updater = FeedUpdater::new(Arc::new(db.clone()), fetcher, Duration::minutes(30));
        (db, updater, feed)
    }

    #[tokio::test]
    async fn test_first_update_stores_everything() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;
        let (db, updater, feed) = setup(&server).await;

        let now = Utc::now();
        let report = updater.update_feed(&feed, now).await;
        assert_eq!(
            report.result.unwrap(),
            UpdateOutcome::Updated {
                counts: EntryCounts {
                    new: 2,
                    modified: 0,
                    unmodified: 0
                },
                failures: vec![],
            }
        );

        let stored = db.get_feed_by_url(&feed.url).await.unwrap().unwrap();
        assert_eq!(stored.metadata.title.as_deref(), Some("Unit Feed"));
        assert_eq!(stored.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(stored.last_checked.map(|t| t.timestamp()), Some(now.timestamp()));
        assert!(stored.data_hash.is_some());
        assert!(stored.last_exception.is_none());
    }

    #[tokio::test]
    async fn test_recently_checked_feed_is_skipped_without_writes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .expect(1)
            .mount(&server)
            .await;
        let (db, updater, feed) = setup(&server).await;

        let first = Utc::now();
        updater.update_feed(&feed, first).await.result.unwrap();
        let fresh = db.get_feed_by_url(&feed.url).await.unwrap().unwrap();

        let report = updater
            .update_feed(&fresh, first + Duration::minutes(5))
            .await;
        assert_eq!(report.result.unwrap(), UpdateOutcome::NotModified);
        let after = db.get_feed_by_url(&feed.url).await.unwrap().unwrap();
        assert_eq!(after.last_checked, fresh.last_checked);
    }

    #[tokio::test]
    async fn test_304_to_unconditional_request_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        let (db, updater, feed) = setup(&server).await;

        let report = updater.update_feed(&feed, Utc::now()).await;
        assert_eq!(report.failure_kind(), Some(FailureKind::FatalAssertion));

        let stored = db.get_feed_by_url(&feed.url).await.unwrap().unwrap();
        assert!(stored.broken);
        assert!(!stored.updates_enabled);
        assert_eq!(
            stored.last_exception.map(|e| e.type_name).as_deref(),
            Some("FatalAssertion")
        );
    }

    #[tokio::test]
    async fn test_conditional_not_modified_keeps_error_fields_clear() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"abc\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("ETag", "\"abc\""),
            )
            .mount(&server)
            .await;
        let (db, updater, feed) = setup(&server).await;

        let first = Utc::now() - Duration::hours(2);
        updater.update_feed(&feed, first).await.result.unwrap();
        let before = db.get_entries_for_feed(feed.id).await.unwrap();

        let fresh = db.get_feed_by_url(&feed.url).await.unwrap().unwrap();
        let now = Utc::now();
        let report = updater.update_feed(&fresh, now).await;
        assert_eq!(report.result.unwrap(), UpdateOutcome::NotModified);

        let stored = db.get_feed_by_url(&feed.url).await.unwrap().unwrap();
        assert_eq!(stored.last_checked.map(|t| t.timestamp()), Some(now.timestamp()));
        assert!(stored.last_exception.is_none());
        assert_eq!(stored.validators.etag.as_deref(), Some("\"abc\""));
        assert_eq!(db.get_entries_for_feed(feed.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_recorded_and_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (db, updater, feed) = setup(&server).await;

        let report = updater.update_feed(&feed, Utc::now()).await;
        assert_eq!(report.failure_kind(), Some(FailureKind::Fetch));

        let stored = db.get_feed_by_url(&feed.url).await.unwrap().unwrap();
        assert!(stored.updates_enabled);
        assert!(!stored.broken);
        let exception = stored.last_exception.unwrap();
        assert_eq!(exception.type_name, "FetchFailure");
        assert!(exception.value.contains("404"));
    }

    #[tokio::test]
    async fn test_unknown_url_reports_storage_failure() {
        let server = MockServer::start().await;
        let (_db, updater, _feed) = setup(&server).await;
        let report = updater
            .update_url("https://missing.example.com/feed", Utc::now())
            .await;
        assert_eq!(report.failure_kind(), Some(FailureKind::Storage));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("index out of bounds");
        assert_eq!(
            panic_message(&*payload),
            "panic during update: index out of bounds"
        );
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "panic during update");
    }
}
