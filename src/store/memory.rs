// src/store/memory.rs
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::NaiveDate;

use crate::error::StoreError;
use crate::model::{
    ContentItem, DailyAggregate, EntityKind, EntityMention, EntityRef, ItemStatus, MentionDraft,
    NewContentItem,
};
use crate::persist::bump_daily_aggregate;
use crate::store::{ContentStore, Upserted};

#[derive(Default)]
struct Tables {
    next_id: i64,
    items: BTreeMap<i64, ContentItem>,
    by_key: HashMap<(String, String), i64>,
    entities: BTreeMap<String, EntityRef>,
    mentions: BTreeMap<(i64, String), EntityMention>,
    daily: BTreeMap<(String, NaiveDate), DailyAggregate>,
}

/// Single-lock in-memory store; every operation is atomic by construction.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".into()))
    }

    pub fn item_count(&self) -> usize {
        self.tables().map(|t| t.items.len()).unwrap_or_default()
    }

    pub fn mention_count(&self) -> usize {
        self.tables().map(|t| t.mentions.len()).unwrap_or_default()
    }

    pub fn entity_count(&self) -> usize {
        self.tables().map(|t| t.entities.len()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ContentStore for MemoryStore {
    async fn find_item(&self, source_id: &str, url: &str) -> Result<Option<ContentItem>, StoreError> {
        let t = self.tables()?;
        Ok(t.by_key
            .get(&(source_id.to_string(), url.to_string()))
            .and_then(|id| t.items.get(id))
            .cloned())
    }

    async fn insert_item_if_absent(
        &self,
        item: NewContentItem,
    ) -> Result<Upserted<ContentItem>, StoreError> {
        let mut t = self.tables()?;
        let key = (item.source_id.clone(), item.url.clone());
        if let Some(existing) = t.by_key.get(&key).and_then(|id| t.items.get(id)) {
            return Ok(Upserted::Existing(existing.clone()));
        }
        t.next_id += 1;
        let stored = ContentItem {
            id: t.next_id,
            source_id: item.source_id,
            url: item.url,
            published: item.published,
            body: item.body,
            status: item.status,
            summary: None,
        };
        t.by_key.insert(key, stored.id);
        t.items.insert(stored.id, stored.clone());
        Ok(Upserted::Inserted(stored))
    }

    async fn update_item(
        &self,
        item_id: i64,
        status: ItemStatus,
        body: Option<String>,
        summary: Option<String>,
    ) -> Result<ContentItem, StoreError> {
        let mut t = self.tables()?;
        let item = t.items.get_mut(&item_id).ok_or(StoreError::NotFound(item_id))?;
        if item.status == ItemStatus::Analyzed {
            return Ok(item.clone());
        }
        item.status = status;
        if let Some(b) = body {
            item.body = b;
        }
        if summary.is_some() {
            item.summary = summary;
        }
        Ok(item.clone())
    }

    async fn record_mention(
        &self,
        item: &ContentItem,
        mention: &MentionDraft,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables()?;
        if !t.items.contains_key(&item.id) {
            return Err(StoreError::NotFound(item.id));
        }
        let entity_id = mention.entity.id();
        let key = (item.id, entity_id.clone());
        if t.mentions.contains_key(&key) {
            return Ok(false);
        }
        t.entities
            .entry(entity_id.clone())
            .or_insert_with(|| mention.entity.clone());
        t.mentions
            .insert(key, EntityMention::from_draft(item.id, mention));
        let agg = t
            .daily
            .entry((entity_id.clone(), item.published))
            .or_insert_with(|| DailyAggregate::new(entity_id, item.published));
        bump_daily_aggregate(agg, mention.sentiment);
        Ok(true)
    }

    async fn mentions_for_item(&self, item_id: i64) -> Result<Vec<EntityMention>, StoreError> {
        let t = self.tables()?;
        Ok(t.mentions
            .range((item_id, String::new())..)
            .take_while(|((id, _), _)| *id == item_id)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn daily_aggregates(
        &self,
        entity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let t = self.tables()?;
        Ok(t.daily
            .range((entity_id.to_string(), from)..=(entity_id.to_string(), to))
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn daily_aggregates_by_kind(
        &self,
        kind: EntityKind,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let t = self.tables()?;
        let prefix = format!("{}:", kind.as_str());
        Ok(t.daily
            .values()
            .filter(|a| a.entity_id.starts_with(&prefix) && a.date >= from && a.date <= to)
            .cloned()
            .collect())
    }
}
