//! # Data model
//! Source configuration, content items, entity mentions and the daily
//! write-through aggregate shared by the store adapters and the pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a source publishes about; selects the prompt/schema used for analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Instrument,
    Sector,
    Macro,
}

impl Category {
    /// Kind of entity the analysis of this category yields.
    pub fn entity_kind(self) -> EntityKind {
        match self {
            Category::Instrument => EntityKind::Instrument,
            Category::Sector => EntityKind::Sector,
            Category::Macro => EntityKind::Topic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Instrument => "instrument",
            Category::Sector => "sector",
            Category::Macro => "macro",
        }
    }
}

/// How the body of an item is obtained once its page is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Body text is extracted directly with the content locator.
    #[default]
    Text,
    /// The content locator points at a link to a document (usually PDF)
    /// which is downloaded and converted to text.
    LinkedDocument,
}

fn default_active() -> bool {
    true
}

/// One crawlable source. Owned and edited outside the core; read-only here.
///
/// Locators are CSS selectors. `date_rule` and `link_rule` are evaluated
/// relative to each element matched by `listing_item_rule`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    pub listing_item_rule: String,
    pub content_rule: String,
    pub date_rule: String,
    /// Overrides the link lookup inside a listing item (default `a[href]`).
    #[serde(default)]
    pub link_rule: Option<String>,
    /// `<page>` template, `/segment/` prefix, or absent for `/page/{n}`.
    #[serde(default)]
    pub pagination_rule: Option<String>,
    pub category: Category,
    #[serde(default)]
    pub content_kind: ContentKind,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl SourceConfig {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Instrument,
    Sector,
    Topic,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Instrument => "instrument",
            EntityKind::Sector => "sector",
            EntityKind::Topic => "topic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instrument" => Some(EntityKind::Instrument),
            "sector" => Some(EntityKind::Sector),
            "topic" => Some(EntityKind::Topic),
            _ => None,
        }
    }
}

/// A tracked entity identified by kind + normalized name.
///
/// Instrument symbols are upper-cased; sector and topic names are
/// lower-cased with whitespace collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, raw: &str) -> Self {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let name = match kind {
            EntityKind::Instrument => collapsed.to_uppercase(),
            EntityKind::Sector | EntityKind::Topic => collapsed.to_lowercase(),
        };
        Self { kind, name }
    }

    /// Stable store id, e.g. `instrument:ACB`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.name)
    }

    /// Inverse of [`EntityRef::id`].
    pub fn from_id(id: &str) -> Option<Self> {
        let (kind, name) = id.split_once(':')?;
        Some(Self {
            kind: EntityKind::parse(kind)?,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    /// Case-insensitive label parsing; accepts market synonyms.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "positive" | "bullish" | "pos" => Some(Sentiment::Positive),
            "neutral" | "mixed" | "neu" => Some(Sentiment::Neutral),
            "negative" | "bearish" | "neg" => Some(Sentiment::Negative),
            _ => None,
        }
    }
}

/// Per-sentiment counters with a plurality verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentCounts {
    pub positive: u32,
    pub neutral: u32,
    pub negative: u32,
}

impl SentimentCounts {
    pub fn record(&mut self, s: Sentiment) {
        match s {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Neutral => self.neutral += 1,
            Sentiment::Negative => self.negative += 1,
        }
    }

    pub fn merge(&mut self, other: &SentimentCounts) {
        self.positive += other.positive;
        self.neutral += other.neutral;
        self.negative += other.negative;
    }

    pub fn total(&self) -> u32 {
        self.positive + self.neutral + self.negative
    }

    /// Plurality label. Ties resolve by fixed priority
    /// positive > neutral > negative; an empty counter is neutral.
    pub fn overall(&self) -> Sentiment {
        if self.total() == 0 {
            return Sentiment::Neutral;
        }
        let mut best = (Sentiment::Positive, self.positive);
        for (label, n) in [
            (Sentiment::Neutral, self.neutral),
            (Sentiment::Negative, self.negative),
        ] {
            // strictly greater: earlier labels win ties
            if n > best.1 {
                best = (label, n);
            }
        }
        best.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Fetched,
    Analyzed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Fetched => "fetched",
            ItemStatus::Analyzed => "analyzed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "fetched" => Some(ItemStatus::Fetched),
            "analyzed" => Some(ItemStatus::Analyzed),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted content item. Natural key: `(source_id, url)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    pub source_id: String,
    pub url: String,
    pub published: NaiveDate,
    pub body: String,
    pub status: ItemStatus,
    pub summary: Option<String>,
}

/// Insert payload for [`ContentItem`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContentItem {
    pub source_id: String,
    pub url: String,
    pub published: NaiveDate,
    pub body: String,
    pub status: ItemStatus,
}

/// A mention produced by analysis, not yet tied to a stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionDraft {
    pub entity: EntityRef,
    pub sentiment: Sentiment,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// A stored mention. Unique on `(item_id, entity)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub item_id: i64,
    pub entity: EntityRef,
    pub sentiment: Sentiment,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EntityMention {
    pub fn from_draft(item_id: i64, draft: &MentionDraft) -> Self {
        Self {
            item_id,
            entity: draft.entity.clone(),
            sentiment: draft.sentiment,
            rationale: draft.rationale.clone(),
            details: draft.details.clone(),
        }
    }
}

/// One row per (entity, date), bumped write-through on each new mention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub entity_id: String,
    pub date: NaiveDate,
    pub counts: SentimentCounts,
    pub overall: Sentiment,
}

impl DailyAggregate {
    pub fn new(entity_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            entity_id: entity_id.into(),
            date,
            counts: SentimentCounts::default(),
            overall: Sentiment::Neutral,
        }
    }

    /// Increment one bucket and recompute the plurality label.
    pub fn bump(&mut self, sentiment: Sentiment) {
        self.counts.record(sentiment);
        self.overall = self.counts.overall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_break_prefers_positive_then_neutral() {
        let c = SentimentCounts {
            positive: 2,
            neutral: 0,
            negative: 2,
        };
        assert_eq!(c.overall(), Sentiment::Positive);
        // repeatable
        assert_eq!(c.overall(), c.overall());

        let c = SentimentCounts {
            positive: 0,
            neutral: 3,
            negative: 3,
        };
        assert_eq!(c.overall(), Sentiment::Neutral);

        let c = SentimentCounts {
            positive: 1,
            neutral: 1,
            negative: 4,
        };
        assert_eq!(c.overall(), Sentiment::Negative);
    }

    #[test]
    fn daily_aggregate_bump_recomputes_overall() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let mut agg = DailyAggregate::new("instrument:ACB", d);
        agg.bump(Sentiment::Negative);
        assert_eq!(agg.overall, Sentiment::Negative);
        agg.bump(Sentiment::Positive);
        assert_eq!(agg.overall, Sentiment::Positive);
        assert_eq!(agg.counts.total(), 2);
    }

    #[test]
    fn entity_ref_normalizes_by_kind() {
        assert_eq!(EntityRef::new(EntityKind::Instrument, " acb ").name, "ACB");
        let s = EntityRef::new(EntityKind::Sector, "  Real   Estate ");
        assert_eq!(s.name, "real estate");
        assert_eq!(s.id(), "sector:real estate");
        assert_eq!(EntityRef::from_id(&s.id()), Some(s));
    }

    #[test]
    fn sentiment_labels_accept_synonyms() {
        assert_eq!(Sentiment::parse("Bullish"), Some(Sentiment::Positive));
        assert_eq!(Sentiment::parse(" NEGATIVE "), Some(Sentiment::Negative));
        assert_eq!(Sentiment::parse("sideways"), None);
    }

    #[test]
    fn source_config_defaults_from_json() {
        let raw = r#"{
            "id": "cafef",
            "base_url": "https://example.test/news",
            "listing_item_rule": "article.post",
            "content_rule": "div.content",
            "date_rule": "span.date",
            "category": "instrument"
        }"#;
        let cfg: SourceConfig = serde_json::from_str(raw).unwrap();
        assert!(cfg.active);
        assert_eq!(cfg.content_kind, ContentKind::Text);
        assert_eq!(cfg.display_name(), "cafef");
    }
}
