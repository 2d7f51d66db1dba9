use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{to_timestamp, DatabaseError, Domain, ExceptionInfo, Feed, FeedDbRow, FeedUpdate};

const FEED_COLUMNS: &str = "id, url, domain_id, added_at, last_checked, stale, updates_enabled, \
     broken, http_etag, http_last_modified, data_hash, title, author, link, subtitle, version, \
     language, generator, image, published_raw, published, updated_raw, updated, parse_warning, last_exception_type, last_exception_value, last_exception_traceback";

/// Display name for a host: the host without a leading `www.`.
fn domain_display_name(host: &str) -> String {
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Add a feed pending its first fetch, creating its domain if the host
    /// has not been seen before.
    ///
    /// # Errors
    ///
    /// - [`DatabaseError::FeedExists`] if the URL is already stored
    /// - [`DatabaseError::InvalidUrl`] if the URL has no host
    pub async fn add_feed(&self, url: &str, added: DateTime<Utc>) -> Result<Feed, DatabaseError> {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .ok_or_else(|| DatabaseError::InvalidUrl(url.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            return Err(DatabaseError::FeedExists(url.to_string()));
        }

        sqlx::query("INSERT OR IGNORE INTO domains (host, name) VALUES (?, ?)")
            .bind(&host)
            .bind(domain_display_name(&host))
            .execute(&mut *tx)
            .await?;
        let (domain_id,): (i64,) = sqlx::query_as("SELECT id FROM domains WHERE host = ?")
            .bind(&host)
            .fetch_one(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, FeedDbRow>(&format!(
            "INSERT INTO feeds (url, domain_id, added_at) VALUES (?, ?, ?) RETURNING {FEED_COLUMNS}"
        ))
        .bind(url)
        .bind(domain_id)
        .bind(to_timestamp(added))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(feed = %url, host = %host, "Feed added");
        Ok(row.into_feed())
    }

    /// Look up a feed by its source URL
    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// All feeds, ordered by URL
    pub async fn list_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY url"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Feeds eligible for scheduling: updates enabled and not flagged broken.
    ///
    /// The staleness window is applied by the caller.
    pub async fn get_feeds_for_update(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE updates_enabled = 1 AND broken = 0 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Write back a successful (or not-modified) update.
    ///
    /// Clears the stale flag, the broken flag and any recorded exception.
    /// Fields left as `None` in the update keep their stored values.
    pub async fn update_feed(&self, update: &FeedUpdate) -> Result<(), DatabaseError> {
        let (etag, last_modified, keep_validators) = match &update.validators {
            Some(v) => (v.etag.clone(), v.last_modified.clone(), false),
            None => (None, None, true),
        };
        let metadata = update.metadata.clone().unwrap_or_default();
        let keep_metadata = update.metadata.is_none();

        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                last_checked = ?,
                stale = 0,
                broken = 0,
                http_etag = CASE WHEN ? THEN http_etag ELSE ? END,
                http_last_modified = CASE WHEN ? THEN http_last_modified ELSE ? END,
                data_hash = COALESCE(?, data_hash),
                title = CASE WHEN ? THEN title ELSE ? END,
                author = CASE WHEN ? THEN author ELSE ? END,
                link = CASE WHEN ? THEN link ELSE ? END,
                subtitle = CASE WHEN ? THEN subtitle ELSE ? END,
                version = CASE WHEN ? THEN version ELSE ? END,
                language = CASE WHEN ? THEN language ELSE ? END,
                generator = CASE WHEN ? THEN generator ELSE ? END,
                image = CASE WHEN ? THEN image ELSE ? END,
                published_raw = CASE WHEN ? THEN published_raw ELSE ? END,
                published = CASE WHEN ? THEN published ELSE ? END,
                updated_raw = CASE WHEN ? THEN updated_raw ELSE ? END,
                updated = CASE WHEN ? THEN updated ELSE ? END,
                parse_warning = ?,
                last_exception_type = NULL,
                last_exception_value = NULL,
                last_exception_traceback = NULL
            WHERE url = ?
        "#,
        )
        .bind(to_timestamp(update.last_checked))
        .bind(keep_validators)
        .bind(etag)
        .bind(keep_validators)
        .bind(last_modified)
        .bind(&update.data_hash)
        .bind(keep_metadata)
        .bind(metadata.title)
        .bind(keep_metadata)
        .bind(metadata.author)
        .bind(keep_metadata)
        .bind(metadata.link)
        .bind(keep_metadata)
        .bind(metadata.subtitle)
        .bind(keep_metadata)
        .bind(metadata.version)
        .bind(keep_metadata)
        .bind(metadata.language)
        .bind(keep_metadata)
        .bind(metadata.generator)
        .bind(keep_metadata)
        .bind(metadata.image)
        .bind(keep_metadata)
        .bind(metadata.published_raw)
        .bind(keep_metadata)
        .bind(metadata.published.map(to_timestamp))
        .bind(keep_metadata)
        .bind(metadata.updated_raw)
        .bind(keep_metadata)
        .bind(metadata.updated.map(to_timestamp))
        .bind(&update.parse_warning)
        .bind(&update.url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::FeedNotFound(update.url.clone()));
        }
        Ok(())
    }

    /// Record a failed update. `broken` flags the feed for manual review and
    /// disables its updates in the same write.
    pub async fn record_feed_error(
        &self,
        url: &str,
        checked_at: DateTime<Utc>,
        error: &ExceptionInfo,
        broken: bool,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                last_checked = ?,
                broken = MAX(broken, ?),
                updates_enabled = CASE WHEN ? THEN 0 ELSE updates_enabled END,
                last_exception_type = ?,
                last_exception_value = ?,
                last_exception_traceback = ?
            WHERE url = ?
        "#,
        )
        .bind(to_timestamp(checked_at))
        .bind(broken)
        .bind(broken)
        .bind(&error.type_name)
        .bind(&error.value)
        .bind(&error.traceback)
        .bind(url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::FeedNotFound(url.to_string()));
        }
        Ok(())
    }

    /// Enable or disable updates for a feed. Re-enabling also clears the
    /// broken flag so the scheduler picks the feed up again.
    pub async fn set_feed_enabled(&self, url: &str, enabled: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE feeds SET updates_enabled = ?, broken = CASE WHEN ? THEN 0 ELSE broken END WHERE url = ?",
        )
        .bind(enabled)
        .bind(enabled)
        .bind(url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::FeedNotFound(url.to_string()));
        }
        Ok(())
    }

    /// Mark a feed so its next update ignores validators and stored hashes
    pub async fn set_feed_stale(&self, url: &str, stale: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE feeds SET stale = ? WHERE url = ?")
            .bind(stale)
            .bind(url)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::FeedNotFound(url.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Domain Operations
    // ========================================================================

    /// Look up a domain by host name
    pub async fn get_domain_by_host(&self, host: &str) -> Result<Option<Domain>, DatabaseError> {
        let domain = sqlx::query_as::<_, Domain>(
            "SELECT id, host, name, hidden FROM domains WHERE host = ?",
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;
        Ok(domain)
    }
}
