use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{to_timestamp, DatabaseError, EntryDbRow, EntryWrite, StoredEntry};

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| sqlx::Error::Encode(Box::new(e)).into())
}

impl Database {
    // ========================================================================
    // Entry Operations
    // ========================================================================

    /// All stored entries of one feed, in first-seen order
    pub async fn get_entries_for_feed(&self, feed_id: i64) -> Result<Vec<StoredEntry>, DatabaseError> {
        let rows = sqlx::query_as::<_, EntryDbRow>(
            r#"
            SELECT entry_id, title, link, author, summary, content,
                   published_raw, published, updated_raw, updated,
                   categories, links, enclosures, data_hash, first_seen, last_seen
            FROM entries
            WHERE feed_id = ?
            ORDER BY first_seen, id
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EntryDbRow::into_entry).collect())
    }

    /// Insert an entry or overwrite the content of an existing one.
    ///
    /// `(feed_id, entry_id)` is unique: an existing row keeps its
    /// `first_seen` and has every other column replaced.
    pub async fn upsert_entry(&self, feed_id: i64, entry: &EntryWrite) -> Result<(), DatabaseError> {
        let seen = to_timestamp(entry.seen_at);
        let categories = to_json(&entry.categories)?;
        let links = to_json(&entry.links)?;
        let enclosures = to_json(&entry.enclosures)?;
        sqlx::query(
            r#"
            INSERT INTO entries (
                feed_id, entry_id, title, link, author, summary, content,
                published_raw, published, updated_raw, updated,
                categories, links, enclosures, data_hash, first_seen, last_seen
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_id, entry_id) DO UPDATE SET
                title = excluded.title,
                link = excluded.link,
                author = excluded.author,
                summary = excluded.summary,
                content = excluded.content,
                published_raw = excluded.published_raw,
                published = excluded.published,
                updated_raw = excluded.updated_raw,
                updated = excluded.updated,
                categories = excluded.categories,
                links = excluded.links,
                enclosures = excluded.enclosures,
                data_hash = excluded.data_hash,
                last_seen = excluded.last_seen
        "#,
        )
        .bind(feed_id)
        .bind(&entry.entry_id)
        .bind(&entry.title)
        .bind(&entry.link)
        .bind(&entry.author)
        .bind(&entry.summary)
        .bind(&entry.content)
        .bind(&entry.published_raw)
        .bind(entry.published.map(to_timestamp))
        .bind(&entry.updated_raw)
        .bind(entry.updated.map(to_timestamp))
        .bind(categories)
        .bind(links)
        .bind(enclosures)
        .bind(&entry.data_hash)
        .bind(seen)
        .bind(seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record that an unchanged entry was present in the latest document
    pub async fn mark_entry_seen(
        &self,
        feed_id: i64,
        entry_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE entries SET last_seen = ? WHERE feed_id = ? AND entry_id = ?")
            .bind(to_timestamp(seen_at))
            .bind(feed_id)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of entries stored for a feed
    pub async fn count_entries(&self, feed_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Enclosure;
    use chrono::Duration;

    fn write(entry_id: &str, title: &str, hash: &str, seen_at: DateTime<Utc>) -> EntryWrite {
        EntryWrite {
            entry_id: entry_id.to_string(),
            title: Some(title.to_string()),
            link: Some(format!("https://example.com/{entry_id}")),
            author: None,
            summary: Some("Test summary".to_string()),
            content: None,
            published_raw: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            published: DateTime::parse_from_rfc2822("Mon, 01 Jan 2024 00:00:00 GMT")
                .ok()
                .map(|d| d.with_timezone(&Utc)),
            updated_raw: None,
            updated: None,
            categories: vec!["news".to_string()],
            links: vec![format!("https://example.com/{entry_id}")],
            enclosures: vec![Enclosure {
                url: format!("https://example.com/{entry_id}.mp3"),
                media_type: Some("audio/mpeg".to_string()),
                length: Some(1024),
            }],
            data_hash: hash.to_string(),
            seen_at,
        }
    }

    async fn db_with_feed() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let feed = db
            .add_feed("https://example.com/feed.xml", Utc::now())
            .await
            .unwrap();
        (db, feed.id)
    }

    #[tokio::test]
    async fn test_upsert_same_id_keeps_single_row() {
        let (db, feed_id) = db_with_feed().await;
        let now = Utc::now();

        db.upsert_entry(feed_id, &write("e1", "First", "h1", now))
            .await
            .unwrap();
        db.upsert_entry(feed_id, &write("e1", "First (edited)", "h2", now))
            .await
            .unwrap();

        assert_eq!(db.count_entries(feed_id).await.unwrap(), 1);
        let stored = db.get_entries_for_feed(feed_id).await.unwrap();
        assert_eq!(stored[0].title.as_deref(), Some("First (edited)"));
        assert_eq!(stored[0].data_hash, "h2");
        assert_eq!(stored[0].categories, vec!["news".to_string()]);
        assert_eq!(stored[0].links, vec!["https://example.com/e1".to_string()]);
        assert_eq!(stored[0].enclosures[0].media_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(stored[0].enclosures[0].length, Some(1024));
    }

    #[tokio::test]
    async fn test_upsert_preserves_first_seen() {
        let (db, feed_id) = db_with_feed().await;
        let first = Utc::now() - Duration::hours(2);
        let second = Utc::now();

        db.upsert_entry(feed_id, &write("e1", "First", "h1", first))
            .await
            .unwrap();
        db.upsert_entry(feed_id, &write("e1", "First", "h2", second))
            .await
            .unwrap();

        let stored = &db.get_entries_for_feed(feed_id).await.unwrap()[0];
        assert_eq!(stored.first_seen.timestamp(), first.timestamp());
        assert_eq!(stored.last_seen.timestamp(), second.timestamp());
    }

    #[tokio::test]
    async fn test_mark_entry_seen_only_touches_last_seen() {
        let (db, feed_id) = db_with_feed().await;
        let first = Utc::now() - Duration::hours(1);
        db.upsert_entry(feed_id, &write("e1", "First", "h1", first))
            .await
            .unwrap();

        let later = Utc::now();
        db.mark_entry_seen(feed_id, "e1", later).await.unwrap();

        let stored = &db.get_entries_for_feed(feed_id).await.unwrap()[0];
        assert_eq!(stored.data_hash, "h1");
        assert_eq!(stored.first_seen.timestamp(), first.timestamp());
        assert_eq!(stored.last_seen.timestamp(), later.timestamp());
    }

    #[tokio::test]
    async fn test_same_entry_id_in_different_feeds_is_distinct() {
        let (db, feed_a) = db_with_feed().await;
        let feed_b = db
            .add_feed("https://other.example.com/feed.xml", Utc::now())
            .await
            .unwrap()
            .id;
        let now = Utc::now();

        db.upsert_entry(feed_a, &write("shared", "A", "h", now))
            .await
            .unwrap();
        db.upsert_entry(feed_b, &write("shared", "B", "h", now))
            .await
            .unwrap();

        assert_eq!(db.count_entries(feed_a).await.unwrap(), 1);
        assert_eq!(db.count_entries(feed_b).await.unwrap(), 1);
    }
}
