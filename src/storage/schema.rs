use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// SQLite-backed storage handle.
///
/// Cloning is cheap (the pool is reference counted). The process opens one
/// handle at start-up, passes clones into the scheduler, and calls
/// [`Database::close`] once at shutdown.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED).
    /// Returns `DatabaseError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: concurrent update units queue on the single
        // SQLite writer instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000")
            .foreign_keys(true);

        // An in-memory database exists per connection; keep it to one so every
        // caller sees the same schema and rows.
        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));
        pool_options = if path == ":memory:" {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Close every pooled connection. Consumes the handle so shutdown
    /// closes it exactly once.
    pub async fn close(self) {
        self.pool.close().await;
        tracing::debug!("Database closed");
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS domains (
                id INTEGER PRIMARY KEY,
                host TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                hidden INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                domain_id INTEGER NOT NULL REFERENCES domains(id),
                added_at INTEGER NOT NULL,
                last_checked INTEGER,
                stale INTEGER NOT NULL DEFAULT 0,
                updates_enabled INTEGER NOT NULL DEFAULT 1,
                broken INTEGER NOT NULL DEFAULT 0,
                http_etag TEXT,
                http_last_modified TEXT,
                data_hash TEXT,
                title TEXT,
                author TEXT,
                link TEXT,
                subtitle TEXT,
                version TEXT,
                language TEXT,
                generator TEXT,
                image TEXT,
                published_raw TEXT,
                published INTEGER,
                updated_raw TEXT,
                updated INTEGER,
                parse_warning TEXT,
                last_exception_type TEXT,
                last_exception_value TEXT,
                last_exception_traceback TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                entry_id TEXT NOT NULL,
                title TEXT,
                link TEXT,
                author TEXT,
                summary TEXT,
                content TEXT,
                published_raw TEXT,
                published INTEGER,
                updated_raw TEXT,
                updated INTEGER,
                categories TEXT NOT NULL DEFAULT '[]',
                links TEXT NOT NULL DEFAULT '[]',
                enclosures TEXT NOT NULL DEFAULT '[]',
                data_hash TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                UNIQUE(feed_id, entry_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_feed ON entries(feed_id)")
            .execute(&mut *tx)
            .await?;

        // Due-feed selection filters on these columns every cycle
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feeds_due ON feeds(updates_enabled, broken, last_checked)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
