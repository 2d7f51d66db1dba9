//! Feed documents: retrieval, parsing and change detection.
//!
//! - [`parser`] - Normalizes RSS/Atom/JSON Feed documents, recovering what it
//!   can from malformed XML (the document is then flagged "bozo")
//! - [`fetcher`] - Conditional HTTP retrieval with retry and size limits
//! - [`policy`] - Decides whether a feed is due and which validators to send
//! - [`hash`] - Order-independent content hashes for entries and documents

mod dates;
mod fetcher;
mod hash;
mod parser;
mod policy;
mod recover;

pub use dates::parse_timestamp;
pub use fetcher::{FeedFetcher, FetchError, FetchResponse};
pub use hash::{entry_hash, feed_hash, hash_record};
pub use parser::{parse_document, ParseError, ParsedEntry, ParsedFeed};
pub use policy::{decide, is_due, validators_from_headers, FetchDirective};
