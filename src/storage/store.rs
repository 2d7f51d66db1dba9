use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{DatabaseError, EntryWrite, ExceptionInfo, Feed, FeedUpdate, StoredEntry};

// ============================================================================
// Feed Store Trait (for dependency injection)
// ============================================================================

/// The narrow storage contract the update engine depends on.
///
/// The engine never issues queries of its own; everything it persists goes
/// through these methods. [`Database`] is the SQLite implementation; tests
/// wrap it to inject failures.
#[async_trait::async_trait]
pub trait FeedStore: Send + Sync {
    /// Look up a feed by its source URL
    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError>;

    /// Feeds with updates enabled that are not flagged broken
    async fn get_feeds_for_update(&self) -> Result<Vec<Feed>, DatabaseError>;

    /// Write back a non-failure terminal state (metadata, validators, hash)
    async fn upsert_feed(&self, update: &FeedUpdate) -> Result<(), DatabaseError>;

    /// Stored entries of one feed
    async fn get_entries_for_feed(&self, feed_id: i64) -> Result<Vec<StoredEntry>, DatabaseError>;

    /// Insert a new entry or replace a changed one
    async fn upsert_entry(&self, feed_id: i64, entry: &EntryWrite) -> Result<(), DatabaseError>;

    /// Bump `last_seen` of an unchanged entry
    async fn mark_entry_seen(
        &self,
        feed_id: i64,
        entry_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Enable or disable future updates of a feed
    async fn set_feed_enabled(&self, url: &str, enabled: bool) -> Result<(), DatabaseError>;

    /// Record a failed update; `broken` flags the feed for manual review and
    /// disables its updates
    async fn record_feed_error(
        &self,
        url: &str,
        checked_at: DateTime<Utc>,
        error: &ExceptionInfo,
        broken: bool,
    ) -> Result<(), DatabaseError>;
}

#[async_trait::async_trait]
impl FeedStore for Database {
    async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        Database::get_feed_by_url(self, url).await
    }

    async fn get_feeds_for_update(&self) -> Result<Vec<Feed>, DatabaseError> {
        Database::get_feeds_for_update(self).await
    }

    async fn upsert_feed(&self, update: &FeedUpdate) -> Result<(), DatabaseError> {
        self.update_feed(update).await
    }

    async fn get_entries_for_feed(&self, feed_id: i64) -> Result<Vec<StoredEntry>, DatabaseError> {
        Database::get_entries_for_feed(self, feed_id).await
    }

    async fn upsert_entry(&self, feed_id: i64, entry: &EntryWrite) -> Result<(), DatabaseError> {
        Database::upsert_entry(self, feed_id, entry).await
    }

    async fn mark_entry_seen(
        &self,
        feed_id: i64,
        entry_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        Database::mark_entry_seen(self, feed_id, entry_id, seen_at).await
    }

    async fn set_feed_enabled(&self, url: &str, enabled: bool) -> Result<(), DatabaseError> {
        Database::set_feed_enabled(self, url, enabled).await
    }

    async fn record_feed_error(
        &self,
        url: &str,
        checked_at: DateTime<Utc>,
        error: &ExceptionInfo,
        broken: bool,
    ) -> Result<(), DatabaseError> {
        Database::record_feed_error(self, url, checked_at, error, broken).await
    }
}
