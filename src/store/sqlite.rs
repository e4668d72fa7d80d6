// src/store/sqlite.rs
//! SQLite adapter. One connection behind a mutex; calls run on the blocking
//! pool. Uniqueness lives in the schema (`UNIQUE`/`PRIMARY KEY` + `ON CONFLICT`).

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::error::StoreError;
use crate::model::{
    ContentItem, DailyAggregate, EntityKind, EntityMention, EntityRef, ItemStatus, MentionDraft,
    NewContentItem, Sentiment, SentimentCounts,
};
use crate::persist::bump_daily_aggregate;
use crate::store::{ContentStore, Upserted};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS content_items (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id   TEXT NOT NULL,
    url         TEXT NOT NULL,
    published   TEXT NOT NULL,
    body        TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL,
    summary     TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE (source_id, url)
);

CREATE TABLE IF NOT EXISTS entities (
    id          TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_mentions (
    item_id     INTEGER NOT NULL REFERENCES content_items(id),
    entity_id   TEXT NOT NULL REFERENCES entities(id),
    sentiment   TEXT NOT NULL,
    rationale   TEXT NOT NULL,
    details     TEXT,
    PRIMARY KEY (item_id, entity_id)
);

CREATE TABLE IF NOT EXISTS daily_aggregates (
    entity_id   TEXT NOT NULL REFERENCES entities(id),
    date        TEXT NOT NULL,
    positive    INTEGER NOT NULL DEFAULT 0,
    neutral     INTEGER NOT NULL DEFAULT 0,
    negative    INTEGER NOT NULL DEFAULT 0,
    overall     TEXT NOT NULL,
    PRIMARY KEY (entity_id, date)
);

CREATE INDEX IF NOT EXISTS idx_daily_date ON daily_aggregates(date);
"#;

const DATE_FMT: &str = "%Y-%m-%d";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {e}")))?
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::PersistenceConflict(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}

fn fmt_date(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FMT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn bad_value(what: &str, v: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unknown {what} `{v}`").into(),
    )
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ContentItem> {
    let published: String = row.get("published")?;
    let status: String = row.get("status")?;
    Ok(ContentItem {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        url: row.get("url")?,
        published: parse_date(&published)?,
        body: row.get("body")?,
        status: ItemStatus::parse(&status).ok_or_else(|| bad_value("status", &status))?,
        summary: row.get("summary")?,
    })
}

fn aggregate_from_row(row: &Row<'_>) -> rusqlite::Result<DailyAggregate> {
    let date: String = row.get("date")?;
    let overall: String = row.get("overall")?;
    Ok(DailyAggregate {
        entity_id: row.get("entity_id")?,
        date: parse_date(&date)?,
        counts: SentimentCounts {
            positive: row.get("positive")?,
            neutral: row.get("neutral")?,
            negative: row.get("negative")?,
        },
        overall: Sentiment::parse(&overall).ok_or_else(|| bad_value("sentiment", &overall))?,
    })
}

fn select_item(conn: &Connection, source_id: &str, url: &str) -> rusqlite::Result<Option<ContentItem>> {
    conn.query_row(
        "SELECT * FROM content_items WHERE source_id = ?1 AND url = ?2",
        params![source_id, url],
        item_from_row,
    )
    .optional()
}

#[async_trait::async_trait]
impl ContentStore for SqliteStore {
    async fn find_item(&self, source_id: &str, url: &str) -> Result<Option<ContentItem>, StoreError> {
        let (source_id, url) = (source_id.to_string(), url.to_string());
        self.with_conn(move |c| select_item(c, &source_id, &url).map_err(db_err))
            .await
    }

    async fn insert_item_if_absent(
        &self,
        item: NewContentItem,
    ) -> Result<Upserted<ContentItem>, StoreError> {
        self.with_conn(move |c| {
            let now = Utc::now().to_rfc3339();
            let inserted = c
                .execute(
                    "INSERT INTO content_items (source_id, url, published, body, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT (source_id, url) DO NOTHING",
                    params![
                        item.source_id,
                        item.url,
                        fmt_date(item.published),
                        item.body,
                        item.status.as_str(),
                        now
                    ],
                )
                .map_err(db_err)?;
            let row = select_item(c, &item.source_id, &item.url)
                .map_err(db_err)?
                .ok_or_else(|| {
                    StoreError::PersistenceConflict(format!("item {} vanished after upsert", item.url))
                })?;
            Ok(if inserted == 1 {
                Upserted::Inserted(row)
            } else {
                Upserted::Existing(row)
            })
        })
        .await
    }

    async fn update_item(
        &self,
        item_id: i64,
        status: ItemStatus,
        body: Option<String>,
        summary: Option<String>,
    ) -> Result<ContentItem, StoreError> {
        self.with_conn(move |c| {
            c.execute(
                "UPDATE content_items
                 SET status = ?2,
                     body = COALESCE(?3, body),
                     summary = COALESCE(?4, summary),
                     updated_at = ?5
                 WHERE id = ?1 AND status != 'analyzed'",
                params![item_id, status.as_str(), body, summary, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            c.query_row(
                "SELECT * FROM content_items WHERE id = ?1",
                params![item_id],
                item_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or(StoreError::NotFound(item_id))
        })
        .await
    }

    async fn record_mention(
        &self,
        item: &ContentItem,
        mention: &MentionDraft,
    ) -> Result<bool, StoreError> {
        let item_id = item.id;
        let date = item.published;
        let mention = mention.clone();
        self.with_conn(move |c| {
            let entity_id = mention.entity.id();
            let tx = c.transaction().map_err(db_err)?;
            tx.execute(
                "INSERT INTO entities (id, kind, name, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO NOTHING",
                params![
                    entity_id,
                    mention.entity.kind.as_str(),
                    mention.entity.name,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            let details = mention.details.as_ref().map(|v| v.to_string());
            let inserted = tx
                .execute(
                    "INSERT INTO entity_mentions (item_id, entity_id, sentiment, rationale, details)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (item_id, entity_id) DO NOTHING",
                    params![
                        item_id,
                        entity_id,
                        mention.sentiment.as_str(),
                        mention.rationale,
                        details
                    ],
                )
                .map_err(db_err)?
                == 1;

            if inserted {
                let mut agg = tx
                    .query_row(
                        "SELECT * FROM daily_aggregates WHERE entity_id = ?1 AND date = ?2",
                        params![entity_id, fmt_date(date)],
                        aggregate_from_row,
                    )
                    .optional()
                    .map_err(db_err)?
                    .unwrap_or_else(|| DailyAggregate::new(entity_id.clone(), date));
                bump_daily_aggregate(&mut agg, mention.sentiment);
                tx.execute(
                    "INSERT INTO daily_aggregates (entity_id, date, positive, neutral, negative, overall)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (entity_id, date) DO UPDATE SET
                        positive = excluded.positive,
                        neutral = excluded.neutral,
                        negative = excluded.negative,
                        overall = excluded.overall",
                    params![
                        agg.entity_id,
                        fmt_date(agg.date),
                        agg.counts.positive,
                        agg.counts.neutral,
                        agg.counts.negative,
                        agg.overall.as_str()
                    ],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(inserted)
        })
        .await
    }

    async fn mentions_for_item(&self, item_id: i64) -> Result<Vec<EntityMention>, StoreError> {
        self.with_conn(move |c| {
            let mut stmt = c
                .prepare(
                    "SELECT item_id, entity_id, sentiment, rationale, details
                     FROM entity_mentions WHERE item_id = ?1 ORDER BY entity_id",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![item_id], |row| {
                    let entity_id: String = row.get(1)?;
                    let sentiment: String = row.get(2)?;
                    let details: Option<String> = row.get(4)?;
                    Ok(EntityMention {
                        item_id: row.get(0)?,
                        entity: EntityRef::from_id(&entity_id)
                            .ok_or_else(|| bad_value("entity id", &entity_id))?,
                        sentiment: Sentiment::parse(&sentiment)
                            .ok_or_else(|| bad_value("sentiment", &sentiment))?,
                        rationale: row.get(3)?,
                        details: details.and_then(|d| serde_json::from_str(&d).ok()),
                    })
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
        .await
    }

    async fn daily_aggregates(
        &self,
        entity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let entity_id = entity_id.to_string();
        self.with_conn(move |c| {
            let mut stmt = c
                .prepare(
                    "SELECT * FROM daily_aggregates
                     WHERE entity_id = ?1 AND date >= ?2 AND date <= ?3
                     ORDER BY date",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![entity_id, fmt_date(from), fmt_date(to)],
                    aggregate_from_row,
                )
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
        .await
    }

    async fn daily_aggregates_by_kind(
        &self,
        kind: EntityKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        self.with_conn(move |c| {
            let mut stmt = c
                .prepare(
                    "SELECT a.* FROM daily_aggregates a
                     JOIN entities e ON e.id = a.entity_id
                     WHERE e.kind = ?1 AND a.date >= ?2 AND a.date <= ?3
                     ORDER BY a.entity_id, a.date",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![kind.as_str(), fmt_date(from), fmt_date(to)],
                    aggregate_from_row,
                )
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn new_item(url: &str, published: NaiveDate) -> NewContentItem {
        NewContentItem {
            source_id: "src".into(),
            url: url.into(),
            published,
            body: "text".into(),
            status: ItemStatus::Fetched,
        }
    }

    fn draft(kind: EntityKind, name: &str, s: Sentiment) -> MentionDraft {
        MentionDraft {
            entity: EntityRef::new(kind, name),
            sentiment: s,
            rationale: "because".into(),
            details: Some(serde_json::json!({"price_target": 31000})),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_first_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store
            .insert_item_if_absent(new_item("https://x.test/a", day(9)))
            .await
            .unwrap();
        assert!(a.was_inserted());
        let b = store
            .insert_item_if_absent(NewContentItem {
                body: "different".into(),
                ..new_item("https://x.test/a", day(9))
            })
            .await
            .unwrap();
        assert!(!b.was_inserted());
        assert_eq!(a.into_inner().id, b.clone().into_inner().id);
        assert_eq!(b.into_inner().body, "text");
    }

    #[tokio::test]
    async fn mentions_bump_aggregates_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = store
            .insert_item_if_absent(new_item("https://x.test/a", day(9)))
            .await
            .unwrap()
            .into_inner();
        let m = draft(EntityKind::Instrument, "acb", Sentiment::Negative);
        assert!(store.record_mention(&item, &m).await.unwrap());
        assert!(!store.record_mention(&item, &m).await.unwrap());

        let rows = store
            .daily_aggregates("instrument:ACB", day(1), day(31))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].counts.negative, 1);
        assert_eq!(rows[0].overall, Sentiment::Negative);

        let mentions = store.mentions_for_item(item.id).await.unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].details, Some(serde_json::json!({"price_target": 31000})));
    }

    #[tokio::test]
    async fn aggregates_by_kind_respect_window() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (i, d) in [day(1), day(8), day(9)].into_iter().enumerate() {
            let item = store
                .insert_item_if_absent(new_item(&format!("https://x.test/{i}"), d))
                .await
                .unwrap()
                .into_inner();
            store
                .record_mention(&item, &draft(EntityKind::Topic, "Interest Rates", Sentiment::Positive))
                .await
                .unwrap();
            store
                .record_mention(&item, &draft(EntityKind::Sector, "banking", Sentiment::Neutral))
                .await
                .unwrap();
        }
        let topics = store
            .daily_aggregates_by_kind(EntityKind::Topic, day(7), day(9))
            .await
            .unwrap();
        assert_eq!(topics.len(), 2);
        assert!(topics.iter().all(|a| a.entity_id == "topic:interest rates"));
    }

    #[tokio::test]
    async fn status_never_downgrades_from_analyzed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = store
            .insert_item_if_absent(new_item("https://x.test/a", day(9)))
            .await
            .unwrap()
            .into_inner();
        store
            .update_item(item.id, ItemStatus::Analyzed, None, Some("summary".into()))
            .await
            .unwrap();
        let after = store
            .update_item(item.id, ItemStatus::Failed, None, None)
            .await
            .unwrap();
        assert_eq!(after.status, ItemStatus::Analyzed);
        assert_eq!(after.summary.as_deref(), Some("summary"));
    }
}
