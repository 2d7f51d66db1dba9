use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with operator-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Database is locked by another feedvault process")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A feed URL was looked up but is not stored
    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    /// A feed URL was added twice
    #[error("Feed already exists: {0}")]
    FeedExists(String),

    /// A feed URL without a usable host
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6). A file that cannot be opened
        // at all (SQLITE_CANTOPEN) is a path problem and stays `Other`.
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub(crate) fn from_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow).
/// Converts to [`Feed`] via `into_feed()`.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub domain_id: i64,
    pub added_at: i64,
    pub last_checked: Option<i64>,
    pub stale: bool,
    pub updates_enabled: bool,
    pub broken: bool,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub data_hash: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub link: Option<String>,
    pub subtitle: Option<String>,
    pub version: Option<String>,
    pub language: Option<String>,
    pub generator: Option<String>,
    pub image: Option<String>,
    pub published_raw: Option<String>,
    pub published: Option<i64>,
    pub updated_raw: Option<String>,
    pub updated: Option<i64>,
    pub parse_warning: Option<String>,
    pub last_exception_type: Option<String>,
    pub last_exception_value: Option<String>,
    pub last_exception_traceback: Option<String>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        let last_exception = self.last_exception_type.map(|type_name| ExceptionInfo {
            type_name,
            value: self.last_exception_value.unwrap_or_default(),
            traceback: self.last_exception_traceback.unwrap_or_default(),
        });

        Feed {
            id: self.id,
            url: self.url,
            domain_id: self.domain_id,
            added_at: from_timestamp(self.added_at).unwrap_or_default(),
            last_checked: self.last_checked.and_then(from_timestamp),
            stale: self.stale,
            updates_enabled: self.updates_enabled,
            broken: self.broken,
            validators: Validators {
                etag: self.http_etag,
                last_modified: self.http_last_modified,
            },
            data_hash: self.data_hash,
            metadata: FeedMetadata {
                title: self.title,
                author: self.author,
                link: self.link,
                subtitle: self.subtitle,
                version: self.version,
                language: self.language,
                generator: self.generator,
                image: self.image,
                published_raw: self.published_raw,
                published: self.published.and_then(from_timestamp),
                updated_raw: self.updated_raw,
                updated: self.updated.and_then(from_timestamp),
            },
            parse_warning: self.parse_warning,
            last_exception,
        }
    }
}

/// Internal row type for entry queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryDbRow {
    pub entry_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published_raw: Option<String>,
    pub published: Option<i64>,
    pub updated_raw: Option<String>,
    pub updated: Option<i64>,
    pub categories: String,
    pub links: String,
    pub enclosures: String,
    pub data_hash: String,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl EntryDbRow {
    pub(crate) fn into_entry(self) -> StoredEntry {
        StoredEntry {
            entry_id: self.entry_id,
            title: self.title,
            link: self.link,
            author: self.author,
            summary: self.summary,
            content: self.content,
            published_raw: self.published_raw,
            published: self.published.and_then(from_timestamp),
            updated_raw: self.updated_raw,
            updated: self.updated.and_then(from_timestamp),
            categories: serde_json::from_str(&self.categories).unwrap_or_default(),
            links: serde_json::from_str(&self.links).unwrap_or_default(),
            enclosures: serde_json::from_str(&self.enclosures).unwrap_or_default(),
            data_hash: self.data_hash,
            first_seen: from_timestamp(self.first_seen).unwrap_or_default(),
            last_seen: from_timestamp(self.last_seen).unwrap_or_default(),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A host that owns one or more feeds. Created the first time a feed URL
/// with that host is added.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Domain {
    pub id: i64,
    pub host: String,
    pub name: String,
    pub hidden: bool,
}

/// HTTP validators remembered between fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Denormalized feed-level metadata copied from the last parsed document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub link: Option<String>,
    pub subtitle: Option<String>,
    /// Format identifier such as `rss20`, `atom10` or `json1`
    pub version: Option<String>,
    pub language: Option<String>,
    pub generator: Option<String>,
    /// Logo or icon URL
    pub image: Option<String>,
    pub published_raw: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated_raw: Option<String>,
    pub updated: Option<DateTime<Utc>>,
}

/// Media attached to an entry (RSS `<enclosure>`, Atom `rel="enclosure"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub url: String,
    pub media_type: Option<String>,
    /// Size in bytes as declared by the feed
    pub length: Option<u64>,
}

/// The last failure recorded for a feed.
///
/// `traceback` holds the rendered error source chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub value: String,
    pub traceback: String,
}

/// Feed data from database
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub domain_id: i64,
    pub added_at: DateTime<Utc>,
    /// `None` until the first update attempt
    pub last_checked: Option<DateTime<Utc>>,
    /// Next update must ignore validators and stored hashes
    pub stale: bool,
    pub updates_enabled: bool,
    /// Set after a fatal assertion; excluded from scheduling until re-enabled
    pub broken: bool,
    pub validators: Validators,
    pub data_hash: Option<String>,
    pub metadata: FeedMetadata,
    /// Diagnostic from the last malformed-but-parseable document
    pub parse_warning: Option<String>,
    pub last_exception: Option<ExceptionInfo>,
}

/// Entry as stored for one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub entry_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published_raw: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated_raw: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    /// Every link of the entry, in document order
    pub links: Vec<String>,
    pub enclosures: Vec<Enclosure>,
    pub data_hash: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Fields written when an entry is inserted or its content changed.
#[derive(Debug, Clone)]
pub struct EntryWrite {
    pub entry_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published_raw: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated_raw: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub links: Vec<String>,
    pub enclosures: Vec<Enclosure>,
    pub data_hash: String,
    /// Becomes `first_seen` on insert and `last_seen` always
    pub seen_at: DateTime<Utc>,
}

/// Write-back for a feed whose update reached a non-failure terminal state.
///
/// `None` for `validators`, `metadata` or `data_hash` keeps the stored value.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub url: String,
    pub last_checked: DateTime<Utc>,
    pub validators: Option<Validators>,
    pub metadata: Option<FeedMetadata>,
    pub data_hash: Option<String>,
    pub parse_warning: Option<String>,
}
