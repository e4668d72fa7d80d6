// src/store/mod.rs
//! Persistent store boundary. Two adapters: [`MemoryStore`] (tests, dry runs)
//! and [`SqliteStore`] (embedded SQLite file).
//!
//! Every write is idempotent on its natural key. `record_mention` creates
//! the entity, inserts the mention and bumps the daily aggregate as one
//! atomic unit, so a re-run never double counts.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use chrono::NaiveDate;

use crate::error::StoreError;
use crate::model::{
    ContentItem, DailyAggregate, EntityKind, EntityMention, ItemStatus, MentionDraft,
    NewContentItem,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Outcome of an insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upserted<T> {
    Inserted(T),
    Existing(T),
}

impl<T> Upserted<T> {
    pub fn into_inner(self) -> T {
        match self {
            Upserted::Inserted(v) | Upserted::Existing(v) => v,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, Upserted::Inserted(_))
    }
}

#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    async fn find_item(&self, source_id: &str, url: &str) -> Result<Option<ContentItem>, StoreError>;

    /// Insert keyed on `(source_id, url)`; an existing row is returned untouched.
    async fn insert_item_if_absent(
        &self,
        item: NewContentItem,
    ) -> Result<Upserted<ContentItem>, StoreError>;

    /// Update status (and optionally body/summary). An `analyzed` item is
    /// immutable: the call is a no-op returning the stored row.
    async fn update_item(
        &self,
        item_id: i64,
        status: ItemStatus,
        body: Option<String>,
        summary: Option<String>,
    ) -> Result<ContentItem, StoreError>;

    /// Returns `true` if the mention was new (and the aggregate was bumped).
    async fn record_mention(
        &self,
        item: &ContentItem,
        mention: &MentionDraft,
    ) -> Result<bool, StoreError>;

    async fn mentions_for_item(&self, item_id: i64) -> Result<Vec<EntityMention>, StoreError>;

    /// Daily rows for one entity, `from..=to`, ascending by date.
    async fn daily_aggregates(
        &self,
        entity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError>;

    /// Daily rows for every entity of `kind`, `from..=to`.
    async fn daily_aggregates_by_kind(
        &self,
        kind: EntityKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError>;
}

pub type DynStore = Arc<dyn ContentStore>;

/// Open the configured store: `:memory:` selects the in-process adapter.
pub fn open_store(database_path: &str) -> anyhow::Result<DynStore> {
    if database_path.trim() == ":memory:" {
        tracing::info!("using in-memory content store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::open(database_path)?;
    tracing::info!(path = database_path, "using sqlite content store");
    Ok(Arc::new(store))
}
