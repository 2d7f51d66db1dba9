use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, FeedType, Link};
use feed_rs::parser;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::dates::parse_timestamp;
use super::recover::{self, RawDocument, RawEntry};
use crate::storage::{Enclosure, FeedMetadata};

#[derive(Debug, Error)]
pub enum ParseError {
    /// Neither the strict parser nor best-effort recovery found a feed
    #[error("Document is not a recognizable feed: {reason}")]
    Unparseable { reason: String },
}

/// One entry as extracted from a feed document.
///
/// Dates keep the string the feed actually carried next to the parsed value;
/// either may be `None` independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedEntry {
    pub id: String,
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
}

/// A parsed feed document.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub metadata: FeedMetadata,
    pub entries: Vec<ParsedEntry>,
    /// Diagnostic for a malformed document that was still extracted
    pub bozo: Option<String>,
}

impl ParsedFeed {
    pub fn is_bozo(&self) -> bool {
        self.bozo.is_some()
    }
}

/// Parse a feed document (RSS 0.9x/1.0/2.0, Atom, JSON Feed).
///
/// Malformed XML is not an error. When the document is not well-formed
/// (whether or not the strict parser accepted it), the result carries a
/// `bozo` diagnostic and holds whichever of the strict and recovered
/// extractions found more. Only a document with no recognizable feed content
/// at all fails.
pub fn parse_document(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let raw = recover::scan(bytes);

    match parser::parse(bytes) {
        Ok(feed) => {
            // The XML scanner has nothing to say about JSON documents
            let malformed = match feed.feed_type {
                FeedType::JSON => None,
                _ => raw.malformation(),
            };
            let strict = from_strict(feed, &raw);
            let Some(diagnostic) = malformed else {
                return Ok(strict);
            };

            tracing::debug!(error = %diagnostic, "Strict parser accepted a malformed feed document");
            if raw.has_content() && recovered_outweighs(&raw, &strict) {
                Ok(from_recovered(raw, diagnostic))
            } else {
                Ok(ParsedFeed {
                    bozo: Some(diagnostic),
                    ..strict
                })
            }
        }
        Err(e) => {
            if !raw.has_content() {
                return Err(ParseError::Unparseable {
                    reason: e.to_string(),
                });
            }
            let diagnostic = match raw.malformation() {
                Some(found) => format!("{}; {}", e, found),
                None => e.to_string(),
            };
            tracing::debug!(error = %diagnostic, "Recovered malformed feed document");
            Ok(from_recovered(raw, diagnostic))
        }
    }
}

/// More entries wins; a title breaks ties
fn recovered_outweighs(raw: &RawDocument, strict: &ParsedFeed) -> bool {
    (raw.entries.len(), raw.title.is_some())
        > (strict.entries.len(), strict.metadata.title.is_some())
}

fn version_name(feed_type: &FeedType) -> &'static str {
    match feed_type {
        FeedType::Atom => "atom10",
        FeedType::JSON => "json1",
        FeedType::RSS0 => "rss09x",
        FeedType::RSS1 => "rss10",
        FeedType::RSS2 => "rss20",
    }
}

/// Prefer an alternate (or untyped) link over self/enclosure links
fn primary_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.is_none() || l.rel.as_deref() == Some("alternate"))
        .or_else(|| links.first())
        .map(|l| l.href.clone())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Media objects and `rel="enclosure"` links, first occurrence of each URL
fn entry_enclosures(entry: &Entry) -> Vec<Enclosure> {
    let media = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|c| {
            let url = c.url.as_ref()?;
            Some(Enclosure {
                url: url.to_string(),
                media_type: c.content_type.as_ref().map(|m| m.to_string()),
                length: c.size,
            })
        });
    let linked = entry
        .links
        .iter()
        .filter(|l| l.rel.as_deref() == Some("enclosure"))
        .map(|l| Enclosure {
            url: l.href.clone(),
            media_type: l.media_type.clone(),
            length: l.length,
        });

    let mut found: Vec<Enclosure> = Vec::new();
    for enclosure in media.chain(linked) {
        if !found.iter().any(|e| e.url == enclosure.url) {
            found.push(enclosure);
        }
    }
    found
}

fn from_strict(feed: feed_rs::model::Feed, raw: &RawDocument) -> ParsedFeed {
    let is_json = matches!(feed.feed_type, FeedType::JSON);
    let version = match (&feed.feed_type, raw.version.as_deref()) {
        // The scanner reads the exact 0.9x version off the root element
        (FeedType::RSS0, Some(v)) => v.to_string(),
        (feed_type, _) => version_name(feed_type).to_string(),
    };
    let (published_raw, published) = raw_date(raw.published.as_deref(), feed.published);
    let (updated_raw, updated) = raw_date(raw.updated.as_deref(), feed.updated);
    let metadata = FeedMetadata {
        title: non_empty(feed.title.map(|t| t.content)),
        author: non_empty(feed.authors.first().map(|p| p.name.clone())),
        link: primary_link(&feed.links),
        subtitle: non_empty(feed.description.map(|t| t.content)),
        version: Some(version),
        language: non_empty(feed.language),
        generator: non_empty(feed.generator.map(|g| g.content)),
        image: feed.logo.or(feed.icon).map(|i| i.uri),
        published_raw,
        published,
        updated_raw,
        updated,
    };

    // The scanner yields one record per item/entry element, so for XML the
    // two sides line up unless the document is malformed.
    let aligned = raw.entries.len() == feed.entries.len();

    let entries = feed
        .entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let raw_entry = if aligned { raw.entries.get(index) } else { None };
            let enclosures = entry_enclosures(&entry);
            let links: Vec<String> = entry.links.iter().map(|l| l.href.clone()).collect();

            let title = non_empty(entry.title.map(|t| t.content));
            let link = primary_link(&entry.links);
            let summary = non_empty(entry.summary.map(|t| t.content));
            let (published_raw, published) =
                raw_date(raw_entry.and_then(|r| r.published.as_deref()), entry.published);
            let (updated_raw, updated) =
                raw_date(raw_entry.and_then(|r| r.updated.as_deref()), entry.updated);

            // The strict parser invents ids for XML entries that have none,
            // and not deterministically. Only the document's own guid counts.
            let guid = match raw_entry {
                Some(r) => r.guid.clone(),
                None if is_json => Some(entry.id.clone()),
                None => None,
            };
            let id = entry_identity(
                guid.as_deref(),
                link.as_deref(),
                title.as_deref(),
                published_raw.as_deref(),
                summary.as_deref(),
            );

            let mut categories: Vec<String> = entry
                .categories
                .iter()
                .map(|c| c.label.clone().unwrap_or_else(|| c.term.clone()))
                .collect();
            if categories.is_empty() {
                if let Some(r) = raw_entry {
                    categories = r.categories.clone();
                }
            }

            ParsedEntry {
                id,
                title,
                link,
                author: non_empty(entry.authors.first().map(|p| p.name.clone())),
                summary,
                content: non_empty(entry.content.and_then(|c| c.body)),
                published_raw,
                published,
                updated_raw,
                updated,
                categories,
                links,
                enclosures,
            }
        })
        .collect();

    ParsedFeed {
        metadata,
        entries,
        bozo: None,
    }
}

/// Pair the date string the feed carried with its parsed value
fn raw_date(
    raw: Option<&str>,
    parsed: Option<DateTime<Utc>>,
) -> (Option<String>, Option<DateTime<Utc>>) {
    match raw {
        Some(text) => (
            Some(text.to_string()),
            parsed.or_else(|| parse_timestamp(text)),
        ),
        None => (parsed.map(|dt| dt.to_rfc3339()), parsed),
    }
}

fn from_recovered(raw: RawDocument, diagnostic: String) -> ParsedFeed {
    let published = raw.published.as_deref().and_then(parse_timestamp);
    let updated = raw.updated.as_deref().and_then(parse_timestamp);
    let metadata = FeedMetadata {
        title: raw.title,
        author: raw.author,
        link: raw.link,
        subtitle: raw.subtitle,
        version: raw.version,
        language: raw.language,
        generator: raw.generator,
        image: raw.image,
        published_raw: raw.published,
        published,
        updated_raw: raw.updated,
        updated,
    };
    let entries = raw.entries.into_iter().map(recovered_entry).collect();

    ParsedFeed {
        metadata,
        entries,
        bozo: Some(diagnostic),
    }
}

fn recovered_entry(raw: RawEntry) -> ParsedEntry {
    let id = entry_identity(
        raw.guid.as_deref(),
        raw.link.as_deref(),
        raw.title.as_deref(),
        raw.published.as_deref(),
        raw.summary.as_deref(),
    );
    let published = raw.published.as_deref().and_then(parse_timestamp);
    let updated = raw.updated.as_deref().and_then(parse_timestamp);

    ParsedEntry {
        id,
        title: raw.title,
        link: raw.link,
        author: raw.author,
        summary: raw.summary,
        content: raw.content,
        published_raw: raw.published,
        published,
        updated_raw: raw.updated,
        updated,
        categories: raw.categories,
        links: raw.links,
        enclosures: raw.enclosures,
    }
}

/// Durable identifier for an entry: the feed's own id, else its link,
/// else a content-derived key.
fn entry_identity(
    existing: Option<&str>,
    link: Option<&str>,
    title: Option<&str>,
    published: Option<&str>,
    summary: Option<&str>,
) -> String {
    for candidate in [existing, link].into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        title.unwrap_or(""),
        published.unwrap_or(""),
        summary.unwrap_or("")
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("sha256:{:x}", hash)
}
