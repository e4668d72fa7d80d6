// src/persist.rs
//! Persistence writer: idempotent upserts of items and mentions on top of
//! a [`ContentStore`].

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{ContentItem, DailyAggregate, ItemStatus, MentionDraft, NewContentItem, Sentiment};
use crate::store::{ContentStore, Upserted};

/// Counts from one `upsert_mentions` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MentionWrite {
    pub inserted: usize,
    pub unchanged: usize,
}

#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<dyn ContentStore>,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Insert keyed on `(source_id, url)`. A racing writer's row wins and
    /// is returned as `Existing`.
    pub async fn upsert_item(&self, item: NewContentItem) -> Result<Upserted<ContentItem>, StoreError> {
        let (source_id, url) = (item.source_id.clone(), item.url.clone());
        match self.store.insert_item_if_absent(item).await {
            Ok(u) => Ok(u),
            Err(StoreError::PersistenceConflict(msg)) => {
                debug!(%source_id, %url, %msg, "item insert conflicted, re-reading");
                self.store
                    .find_item(&source_id, &url)
                    .await?
                    .map(Upserted::Existing)
                    .ok_or(StoreError::PersistenceConflict(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Write mentions for one item. Duplicate entities in the batch keep the
    /// first occurrence; mentions already stored are left unchanged.
    pub async fn upsert_mentions(
        &self,
        item: &ContentItem,
        drafts: &[MentionDraft],
    ) -> Result<MentionWrite, StoreError> {
        let mut seen = HashSet::new();
        let mut out = MentionWrite::default();
        for draft in drafts {
            if !seen.insert(draft.entity.id()) {
                warn!(item = item.id, entity = %draft.entity, "duplicate entity in analysis output, keeping first");
                continue;
            }
            if self.record_one(item, draft).await? {
                out.inserted += 1;
            } else {
                out.unchanged += 1;
            }
        }
        Ok(out)
    }

    async fn record_one(&self, item: &ContentItem, draft: &MentionDraft) -> Result<bool, StoreError> {
        match self.store.record_mention(item, draft).await {
            Err(StoreError::PersistenceConflict(msg)) => {
                // another writer inserted the same (item, entity) first
                debug!(item = item.id, entity = %draft.entity, %msg, "mention insert conflicted");
                Ok(false)
            }
            other => other,
        }
    }

    pub async fn mark(
        &self,
        item: &ContentItem,
        status: ItemStatus,
        body: Option<String>,
        summary: Option<String>,
    ) -> Result<ContentItem, StoreError> {
        self.store.update_item(item.id, status, body, summary).await
    }
}

/// Increment the bucket for `sentiment`; the store calls this inside the
/// same atomic unit that inserts the mention.
pub fn bump_daily_aggregate(agg: &mut DailyAggregate, sentiment: Sentiment) {
    agg.bump(sentiment);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, EntityRef};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn batch_duplicates_and_reruns_do_not_double_count() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistenceWriter::new(store.clone());
        let item = writer
            .upsert_item(NewContentItem {
                source_id: "s".into(),
                url: "https://x.test/a".into(),
                published: NaiveDate::from_ymd_opt(2024, 5, 9).unwrap(),
                body: "b".into(),
                status: ItemStatus::Fetched,
            })
            .await
            .unwrap()
            .into_inner();

        let m = |name: &str, s| MentionDraft {
            entity: EntityRef::new(EntityKind::Instrument, name),
            sentiment: s,
            rationale: String::new(),
            details: None,
        };
        let drafts = vec![
            m("ACB", Sentiment::Positive),
            m("acb", Sentiment::Negative),
            m("VCB", Sentiment::Neutral),
        ];
        let first = writer.upsert_mentions(&item, &drafts).await.unwrap();
        assert_eq!(first, MentionWrite { inserted: 2, unchanged: 0 });
        let second = writer.upsert_mentions(&item, &drafts).await.unwrap();
        assert_eq!(second, MentionWrite { inserted: 0, unchanged: 2 });

        let d = item.published;
        let acb = store.daily_aggregates("instrument:ACB", d, d).await.unwrap();
        assert_eq!(acb[0].counts.total(), 1);
        assert_eq!(acb[0].overall, Sentiment::Positive);
    }
}
