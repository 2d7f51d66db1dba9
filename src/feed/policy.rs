use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, ETAG, LAST_MODIFIED};

use crate::storage::{Feed, Validators};

/// What to do with a feed on this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchDirective {
    /// Checked within the staleness window; leave it alone
    Skip,
    /// Fetch, sending whatever validators are stored (none is a plain GET)
    Conditional(Validators),
    /// Forced refresh: ignore validators and the stored document hash
    Unconditional,
}

/// A feed is due when it was never checked or its last check is at least
/// one staleness window old.
pub fn is_due(last_checked: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    match last_checked {
        None => true,
        Some(checked) => now.signed_duration_since(checked) >= window,
    }
}

/// Decide how to fetch a feed.
pub fn decide(feed: &Feed, now: DateTime<Utc>, window: Duration) -> FetchDirective {
    if feed.stale {
        return FetchDirective::Unconditional;
    }
    if !is_due(feed.last_checked, now, window) {
        return FetchDirective::Skip;
    }
    FetchDirective::Conditional(feed.validators.clone())
}

/// Validators a response offers for the next conditional request
pub fn validators_from_headers(headers: &HeaderMap) -> Validators {
    let header = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    Validators {
        etag: header(ETAG),
        last_modified: header(LAST_MODIFIED),
    }
}
