//! Utility functions for common operations.
//!
//! - **URL validation**: admission checks for new feed URLs (scheme, local
//!   and private hosts, IP literals, host blocklist)

mod url_validator;

pub use url_validator::{validate_feed_url, Blocklist, UrlValidationError};
