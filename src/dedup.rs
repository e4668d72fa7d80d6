// src/dedup.rs
//! Dedup gate: decides whether an item still needs analysis.

use std::sync::Arc;

use crate::error::StoreError;
use crate::model::{ContentItem, ItemStatus};
use crate::store::ContentStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Already analyzed; reuse stored mentions.
    Skip(ContentItem),
    /// Needs work. `existing` carries a previous pending/failed row, if any.
    Proceed { existing: Option<ContentItem> },
}

#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn ContentStore>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Only an `analyzed` row counts as a hit; failed or half-done rows are
    /// retried on later runs.
    pub async fn check(&self, source_id: &str, url: &str) -> Result<GateDecision, StoreError> {
        Ok(match self.store.find_item(source_id, url).await? {
            Some(item) if item.status == ItemStatus::Analyzed => GateDecision::Skip(item),
            other => GateDecision::Proceed { existing: other },
        })
    }

    pub async fn should_process(&self, source_id: &str, url: &str) -> Result<bool, StoreError> {
        Ok(matches!(
            self.check(source_id, url).await?,
            GateDecision::Proceed { .. }
        ))
    }
}
