//! feedvault: an archive ingestion engine for RSS, Atom and JSON feeds.
//!
//! Feeds are added once, then a scheduler periodically fetches every feed
//! that is due (conditionally, using stored ETag/Last-Modified validators),
//! parses it with tolerance for malformed XML, and reconciles its entries
//! against the SQLite archive. One feed's failure never affects another's.

pub mod config;
pub mod feed;
pub mod storage;
pub mod update;
pub mod util;
