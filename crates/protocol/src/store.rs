//! Persistent event store.
//!
//! Received events are immutable rows in `relay_events`. The infohash and
//! `d` tag are extracted into first-class columns at save time for fast
//! filtering; the raw JSON is preserved as the source of truth.

use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::warn;

use shared::error::AppResult;
use shared::types::now_ts;

use crate::event::{Event, TagName};
use crate::filter::Filter;

/// Store for received wire events.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Create a new event store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist an event. Returns `true` if the event was newly inserted,
    /// `false` if it was already stored.
    pub async fn save(&self, event: &Event) -> AppResult<bool> {
        let tags_json = serde_json::to_string(&event.tags)?;
        let raw = serde_json::to_string(event)?;
        let infohash = TagName::Infohash.value(event).map(str::to_lowercase);
        let d_tag = TagName::Identifier.value(event).map(str::to_string);

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO relay_events
                (event_id, pubkey, kind, created_at, content, tags, infohash, d_tag, raw, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.kind as i64)
        .bind(event.created_at)
        .bind(&event.content)
        .bind(&tags_json)
        .bind(&infohash)
        .bind(&d_tag)
        .bind(&raw)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch a single event by exact id.
    pub async fn get_by_id(&self, event_id: &str) -> AppResult<Option<Event>> {
        let row = sqlx::query("SELECT raw FROM relay_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("raw");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Query stored events matching a filter, newest first.
    pub async fn query(&self, filter: &Filter) -> AppResult<Vec<Event>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT raw FROM relay_events WHERE 1=1");

        if let Some(ids) = &filter.ids {
            push_prefix_clause(&mut qb, "event_id", ids);
        }

        if let Some(authors) = &filter.authors {
            push_prefix_clause(&mut qb, "pubkey", authors);
        }

        if let Some(kinds) = &filter.kinds {
            qb.push(" AND kind IN (");
            let mut separated = qb.separated(", ");
            for kind in kinds {
                separated.push_bind(*kind as i64);
            }
            qb.push(")");
        }

        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(since);
        }

        if let Some(until) = filter.until {
            qb.push(" AND created_at <= ").push_bind(until);
        }

        for (name, values) in filter.tag_constraints() {
            if values.is_empty() {
                continue;
            }
            match name {
                // First-class columns for the hot tag names.
                "x" | "btih" | "infohash" => {
                    qb.push(" AND infohash IN (");
                    let mut separated = qb.separated(", ");
                    for value in &values {
                        separated.push_bind(value.to_lowercase());
                    }
                    qb.push(")");
                }
                "d" => {
                    qb.push(" AND d_tag IN (");
                    let mut separated = qb.separated(", ");
                    for value in &values {
                        separated.push_bind(value.to_string());
                    }
                    qb.push(")");
                }
                // Everything else falls back to a substring match against
                // the compact tags JSON: ["<name>","<value>"
                _ => {
                    qb.push(" AND (");
                    let mut first = true;
                    for value in &values {
                        if !first {
                            qb.push(" OR ");
                        }
                        first = false;
                        qb.push("tags LIKE ").push_bind(format!(
                            "%[\"{}\",\"{}\"%",
                            name, value
                        ));
                    }
                    qb.push(")");
                }
            }
        }

        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("raw");
            match serde_json::from_str::<Event>(&raw) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping undecodable stored event: {}", e),
            }
        }

        Ok(events)
    }

    /// Query across several filters, deduplicating by event id and keeping
    /// newest-first order.
    pub async fn query_many(&self, filters: &[Filter]) -> AppResult<Vec<Event>> {
        let mut seen = std::collections::HashSet::new();
        let mut events = Vec::new();

        for filter in filters {
            for event in self.query(filter).await? {
                if seen.insert(event.id.clone()) {
                    events.push(event);
                }
            }
        }

        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }

    /// Delete a stored event.
    pub async fn delete(&self, event_id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM relay_events WHERE event_id = ?")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Total number of stored events.
    pub async fn count(&self) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM relay_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn push_prefix_clause(qb: &mut QueryBuilder<Sqlite>, column: &str, prefixes: &[String]) {
    qb.push(" AND (");
    let mut first = true;
    for prefix in prefixes {
        if prefix.is_empty() {
            continue;
        }
        if !first {
            qb.push(" OR ");
        }
        first = false;
        qb.push(column)
            .push(" LIKE ")
            .push_bind(format!("{}%", prefix));
    }
    if first {
        // Only empty prefixes: match nothing.
        qb.push("0");
    }
    qb.push(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;
    use shared::database::Database;

    async fn store() -> EventStore {
        let db = Database::connect_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        EventStore::new(db.pool().clone())
    }

    fn torrent_event(keys: &Keys, infohash: &str, created_at: i64) -> Event {
        keys.sign(
            2003,
            vec![
                vec!["x".to_string(), infohash.to_string()],
                vec!["name".to_string(), "A Torrent".to_string()],
            ],
            String::new(),
            created_at,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = store().await;
        let event = torrent_event(&Keys::generate(), &"a".repeat(40), 100);

        assert!(store.save(&event).await.unwrap());
        assert!(!store.save(&event).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_by_id_round_trips() {
        let store = store().await;
        let event = torrent_event(&Keys::generate(), &"a".repeat(40), 100);
        store.save(&event).await.unwrap();

        let loaded = store.get_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(loaded, event);
        assert!(store.get_by_id(&"0".repeat(64)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_by_kind_and_time() {
        let store = store().await;
        let keys = Keys::generate();
        store
            .save(&torrent_event(&keys, &"a".repeat(40), 100))
            .await
            .unwrap();
        store
            .save(&torrent_event(&keys, &"b".repeat(40), 200))
            .await
            .unwrap();

        let events = store
            .query(&Filter::new().kinds(vec![2003]).since(150))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].created_at, 200);

        let events = store.query(&Filter::new().kinds(vec![9999])).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_query_by_infohash_tag_uses_column() {
        let store = store().await;
        let keys = Keys::generate();
        let infohash = "c".repeat(40);
        store.save(&torrent_event(&keys, &infohash, 100)).await.unwrap();
        store
            .save(&torrent_event(&keys, &"d".repeat(40), 100))
            .await
            .unwrap();

        let events = store
            .query(&Filter::new().tag("x", vec![infohash.clone()]))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag_value("x"), Some(infohash.as_str()));
    }

    #[tokio::test]
    async fn test_query_by_arbitrary_tag_substring() {
        let store = store().await;
        let keys = Keys::generate();
        let event = keys
            .sign(
                2004,
                vec![vec!["e".to_string(), "f".repeat(64)]],
                "a comment".to_string(),
                100,
            )
            .unwrap();
        store.save(&event).await.unwrap();

        let events = store
            .query(&Filter::new().tag("e", vec!["f".repeat(64)]))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        let events = store
            .query(&Filter::new().tag("e", vec!["0".repeat(64)]))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_query_author_prefix() {
        let store = store().await;
        let keys = Keys::generate();
        let event = torrent_event(&keys, &"a".repeat(40), 100);
        store.save(&event).await.unwrap();

        let filter = Filter {
            authors: Some(vec![keys.public_key_hex()[..10].to_string()]),
            ..Filter::default()
        };
        assert_eq!(store.query(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_query_many_deduplicates() {
        let store = store().await;
        let keys = Keys::generate();
        let event = torrent_event(&keys, &"a".repeat(40), 100);
        store.save(&event).await.unwrap();

        let filters = vec![
            Filter::new().kinds(vec![2003]),
            Filter::new().tag("x", vec!["a".repeat(40)]),
        ];
        let events = store.query_many(&filters).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
