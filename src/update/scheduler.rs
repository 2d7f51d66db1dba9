use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::future::{self, Future};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::outcome::UpdateSummary;
use super::sink::OutcomeSink;
use super::unit::FeedUpdater;
use crate::feed::is_due;
use crate::storage::{DatabaseError, Feed, FeedStore};

/// Feeds eligible for this cycle: updates enabled, not broken, and either
/// never checked or last checked at least one staleness window ago.
///
/// Feeds flagged stale are selected regardless of the window.
pub async fn select_due_feeds(
    store: &dyn FeedStore,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<Vec<Feed>, DatabaseError> {
    let feeds = store.get_feeds_for_update().await?;
    Ok(feeds
        .into_iter()
        .filter(|feed| feed.stale || is_due(feed.last_checked, now, window))
        .collect())
}

/// Run `run` over `items` with at most `limit` in flight.
///
/// Once `cancel` fires no further items are started; items already running
/// complete and their outputs are returned. Outputs are in completion order.
pub(crate) async fn dispatch_bounded<T, F, Fut>(
    items: Vec<T>,
    limit: usize,
    cancel: &CancellationToken,
    run: F,
) -> Vec<Fut::Output>
where
    F: FnMut(T) -> Fut,
    Fut: Future,
{
    stream::iter(items)
        .take_while(|_| future::ready(!cancel.is_cancelled()))
        .map(run)
        .buffer_unordered(limit.max(1))
        .collect()
        .await
}

/// Periodically selects due feeds and fans their updates out to a bounded
/// pool of feed update units.
///
/// A cycle always runs to completion: every failure is contained in its feed's
/// report, and a storage error while selecting feeds only skips that cycle.
pub struct UpdateScheduler {
    updater: Arc<FeedUpdater>,
    sink: Arc<OutcomeSink>,
    max_concurrency: usize,
}

impl UpdateScheduler {
    pub fn new(updater: Arc<FeedUpdater>, sink: Arc<OutcomeSink>, max_concurrency: usize) -> Self {
        Self {
            updater,
            sink,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run one scheduling cycle.
    ///
    /// # Errors
    ///
    /// Only selecting the due feeds can fail the cycle; per-feed failures are
    /// counted in the returned summary.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<UpdateSummary, DatabaseError> {
        let now = Utc::now();
        let feeds = select_due_feeds(
            self.updater.store().as_ref(),
            now,
            self.updater.staleness_window(),
        )
        .await?;

        tracing::info!(
            due = feeds.len(),
            concurrency = self.max_concurrency,
            "Starting update cycle"
        );

        let reports = dispatch_bounded(feeds, self.max_concurrency, cancel, |feed| {
            let updater = Arc::clone(&self.updater);
            let sink = Arc::clone(&self.sink);
            async move {
                let report = updater.update_feed(&feed, now).await;
                sink.record(&report).await;
                report
            }
        })
        .await;

        let mut summary = UpdateSummary::default();
        for report in &reports {
            summary.record(report);
        }
        if cancel.is_cancelled() {
            tracing::info!(completed = summary.processed, "Update cycle cancelled");
        }
        self.sink.record_summary(&summary);
        Ok(summary)
    }

    /// Run cycles every `interval` until cancelled.
    pub async fn run_forever(&self, interval: std::time::Duration, cancel: CancellationToken) {
        // tokio rejects a zero period
        let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_cycle(&cancel).await {
                tracing::error!(error = %e, "Update cycle failed to select feeds");
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
