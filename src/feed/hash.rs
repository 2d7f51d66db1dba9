//! Content hashes used to detect changed entries and unchanged documents.
//!
//! Records are serialized to JSON and re-emitted with object keys sorted, so
//! field order never affects the digest. Entry categories are unordered and
//! sorted before hashing; the entry sequence of a feed is ordered and hashed
//! as-is.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::parser::{ParsedEntry, ParsedFeed};

/// Hex-encoded SHA-256 over the canonical form of any serializable record.
pub fn hash_record<T: Serialize + ?Sized>(record: &T) -> String {
    // Plain data records always serialize; a failure degrades to hashing null
    let value = serde_json::to_value(record).unwrap_or(Value::Null);
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hash of every observable field of one entry.
pub fn entry_hash(entry: &ParsedEntry) -> String {
    let mut normalized = entry.clone();
    normalized.categories.sort();
    normalized.categories.dedup();
    hash_record(&normalized)
}

#[derive(Serialize)]
struct FeedRecord<'a> {
    metadata: &'a crate::storage::FeedMetadata,
    entries: Vec<String>,
}

/// Hash of a whole document: feed metadata plus the ordered entry hashes.
///
/// Equal hashes mean nothing stored from the document could change.
pub fn feed_hash(feed: &ParsedFeed) -> String {
    let record = FeedRecord {
        metadata: &feed.metadata,
        entries: feed.entries.iter().map(entry_hash).collect(),
    };
    hash_record(&record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FeedMetadata;
    use proptest::prelude::*;

    fn entry(id: &str, title: &str) -> ParsedEntry {
        ParsedEntry {
            id: id.to_string(),
            title: Some(title.to_string()),
            link: Some(format!("https://example.com/{id}")),
            author: None,
            summary: None,
            content: None,
            published_raw: None,
            published: None,
            updated_raw: None,
            updated: None,
            categories: vec![],
            links: vec![],
            enclosures: vec![],
        }
    }

    fn feed(entries: Vec<ParsedEntry>) -> ParsedFeed {
        ParsedFeed {
            metadata: FeedMetadata {
                title: Some("Feed".to_string()),
                ..Default::default()
            },
            entries,
            bozo: None,
        }
    }

    #[test]
    fn test_entry_hash_is_stable() {
        assert_eq!(entry_hash(&entry("e1", "A")), entry_hash(&entry("e1", "A")));
        assert_eq!(entry_hash(&entry("e1", "A")).len(), 64);
    }

    #[test]
    fn test_entry_hash_changes_with_any_field() {
        let base = entry("e1", "A");
        let mut changed = base.clone();
        changed.summary = Some("new summary".to_string());
        assert_ne!(entry_hash(&base), entry_hash(&changed));

        let mut retitled = base.clone();
        retitled.title = Some("B".to_string());
        assert_ne!(entry_hash(&base), entry_hash(&retitled));
    }

    #[test]
    fn test_category_order_does_not_matter() {
        let mut a = entry("e1", "A");
        a.categories = vec!["rust".to_string(), "news".to_string()];
        let mut b = entry("e1", "A");
        b.categories = vec!["news".to_string(), "rust".to_string()];
        assert_eq!(entry_hash(&a), entry_hash(&b));
    }

    #[test]
    fn test_feed_hash_depends_on_entry_order() {
        let forward = feed(vec![entry("e1", "A"), entry("e2", "B")]);
        let reversed = feed(vec![entry("e2", "B"), entry("e1", "A")]);
        assert_ne!(feed_hash(&forward), feed_hash(&reversed));
        assert_eq!(
            feed_hash(&forward),
            feed_hash(&feed(vec![entry("e1", "A"), entry("e2", "B")]))
        );
    }

    #[test]
    fn test_bozo_diagnostic_is_not_content() {
        let clean = feed(vec![entry("e1", "A")]);
        let mut warned = clean.clone();
        warned.bozo = Some("mismatched tag".to_string());
        assert_eq!(feed_hash(&clean), feed_hash(&warned));
    }

    proptest! {
        #[test]
        fn object_key_order_does_not_matter(
            pairs in proptest::collection::hash_map("[a-z]{1,8}", "[a-z0-9 ]{0,12}", 0..12)
        ) {
            let forward: Vec<(String, String)> = pairs.into_iter().collect();
            let mut backward = forward.clone();
            backward.reverse();
            let a: serde_json::Map<String, Value> = forward
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            let b: serde_json::Map<String, Value> = backward
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            prop_assert_eq!(hash_record(&a), hash_record(&b));
        }

        #[test]
        fn category_permutations_hash_equal(
            mut categories in proptest::collection::vec("[a-z]{1,6}", 0..8)
        ) {
            let mut a = entry("e1", "A");
            a.categories = categories.clone();
            categories.reverse();
            let mut b = entry("e1", "A");
            b.categories = categories;
            prop_assert_eq!(entry_hash(&a), entry_hash(&b));
        }
    }
}
