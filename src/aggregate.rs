// src/aggregate.rs
//! Aggregation engine: folds the run's mentions into ranked per-entity views
//! and joins sector/macro context from the daily aggregates.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::warn;

use crate::model::{EntityKind, EntityMention, EntityRef, Sentiment, SentimentCounts};
use crate::registry::EntityRegistry;
use crate::store::ContentStore;

/// One processed item with its mentions, fresh or reused from the store.
#[derive(Debug, Clone)]
pub struct AnalyzedItem {
    pub source_id: String,
    pub item_id: i64,
    pub url: String,
    pub published: NaiveDate,
    pub from_cache: bool,
    pub mentions: Vec<EntityMention>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MentionNote {
    pub source_id: String,
    pub url: String,
    pub published: NaiveDate,
    pub sentiment: Sentiment,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectorTrend {
    pub sector: String,
    pub window_days: u32,
    pub counts: SentimentCounts,
    pub overall: Sentiment,
    /// Per-day verdicts, oldest first.
    pub daily: Vec<(NaiveDate, Sentiment)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicSentiment {
    pub topic: String,
    pub counts: SentimentCounts,
    pub overall: Sentiment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityView {
    pub entity_id: String,
    pub kind: EntityKind,
    pub name: String,
    pub mentions: u32,
    pub counts: SentimentCounts,
    pub overall: Sentiment,
    pub sources: Vec<String>,
    pub latest_mention: NaiveDate,
    pub notes: Vec<MentionNote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector_trend: Option<SectorTrend>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub macro_context: Vec<TopicSentiment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindows {
    pub sector_days: u32,
    pub macro_days: u32,
}

impl Default for ContextWindows {
    fn default() -> Self {
        Self {
            sector_days: 7,
            macro_days: 3,
        }
    }
}

struct Acc {
    entity: EntityRef,
    counts: SentimentCounts,
    sources: BTreeSet<String>,
    latest: NaiveDate,
    notes: Vec<MentionNote>,
}

/// Group mentions by entity and rank: mention count desc, latest mention
/// date desc, entity id asc. Independent of input order.
pub fn aggregate(items: &[AnalyzedItem]) -> Vec<EntityView> {
    let mut by_entity: BTreeMap<String, Acc> = BTreeMap::new();
    for item in items {
        for m in &item.mentions {
            let acc = by_entity.entry(m.entity.id()).or_insert_with(|| Acc {
                entity: m.entity.clone(),
                counts: SentimentCounts::default(),
                sources: BTreeSet::new(),
                latest: item.published,
                notes: Vec::new(),
            });
            acc.counts.record(m.sentiment);
            acc.sources.insert(item.source_id.clone());
            acc.latest = acc.latest.max(item.published);
            acc.notes.push(MentionNote {
                source_id: item.source_id.clone(),
                url: item.url.clone(),
                published: item.published,
                sentiment: m.sentiment,
                rationale: m.rationale.clone(),
            });
        }
    }

    let mut views: Vec<EntityView> = by_entity
        .into_iter()
        .map(|(id, mut acc)| {
            acc.notes.sort_by(|a, b| {
                b.published
                    .cmp(&a.published)
                    .then_with(|| a.source_id.cmp(&b.source_id))
                    .then_with(|| a.url.cmp(&b.url))
            });
            EntityView {
                entity_id: id,
                kind: acc.entity.kind,
                name: acc.entity.name,
                mentions: acc.counts.total(),
                overall: acc.counts.overall(),
                counts: acc.counts,
                sources: acc.sources.into_iter().collect(),
                latest_mention: acc.latest,
                notes: acc.notes,
                sector_trend: None,
                macro_context: Vec::new(),
            }
        })
        .collect();

    views.sort_by(|a, b| {
        b.mentions
            .cmp(&a.mentions)
            .then_with(|| b.latest_mention.cmp(&a.latest_mention))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    views
}

/// Trailing window of `days` days ending at `today`, inclusive.
fn window_start(today: NaiveDate, days: u32) -> NaiveDate {
    today - Duration::days(i64::from(days.max(1)) - 1)
}

/// Attach sector trend and macro-topic sentiment to each view. Read-only
/// store lookups; a store error or a missing row leaves the field empty.
pub async fn join_context(
    views: &mut [EntityView],
    store: &dyn ContentStore,
    registry: &EntityRegistry,
    today: NaiveDate,
    windows: ContextWindows,
) {
    if views.is_empty() {
        return;
    }

    let macro_from = window_start(today, windows.macro_days);
    let macro_context = match store
        .daily_aggregates_by_kind(EntityKind::Topic, macro_from, today)
        .await
    {
        Ok(rows) => {
            let mut per_topic: BTreeMap<String, SentimentCounts> = BTreeMap::new();
            for row in rows {
                let name = EntityRef::from_id(&row.entity_id)
                    .map(|e| e.name)
                    .unwrap_or(row.entity_id);
                per_topic.entry(name).or_default().merge(&row.counts);
            }
            let mut topics: Vec<TopicSentiment> = per_topic
                .into_iter()
                .map(|(topic, counts)| TopicSentiment {
                    topic,
                    overall: counts.overall(),
                    counts,
                })
                .collect();
            topics.sort_by(|a, b| {
                b.counts
                    .total()
                    .cmp(&a.counts.total())
                    .then_with(|| a.topic.cmp(&b.topic))
            });
            topics
        }
        Err(e) => {
            warn!(error = %e, "macro context lookup failed, omitting");
            Vec::new()
        }
    };

    let sector_from = window_start(today, windows.sector_days);
    let mut trends: HashMap<String, Option<SectorTrend>> = HashMap::new();
    for view in views.iter_mut() {
        let sector = match view.kind {
            EntityKind::Instrument => registry.sector_of(&view.name).map(str::to_string),
            EntityKind::Sector => Some(view.name.clone()),
            EntityKind::Topic => None,
        };
        if let Some(sector) = sector {
            if !trends.contains_key(&sector) {
                let trend = sector_trend(store, &sector, sector_from, today, windows.sector_days).await;
                trends.insert(sector.clone(), trend);
            }
            view.sector_trend = trends.get(&sector).cloned().flatten();
        }
        view.macro_context = macro_context.clone();
    }
}

async fn sector_trend(
    store: &dyn ContentStore,
    sector: &str,
    from: NaiveDate,
    to: NaiveDate,
    window_days: u32,
) -> Option<SectorTrend> {
    let id = EntityRef::new(EntityKind::Sector, sector).id();
    let rows = match store.daily_aggregates(&id, from, to).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(sector, error = %e, "sector trend lookup failed, omitting");
            return None;
        }
    };
    if rows.is_empty() {
        return None;
    }
    let mut counts = SentimentCounts::default();
    let mut daily = Vec::with_capacity(rows.len());
    for row in &rows {
        counts.merge(&row.counts);
        daily.push((row.date, row.overall));
    }
    daily.sort_by_key(|(d, _)| *d);
    Some(SectorTrend {
        sector: sector.to_string(),
        window_days,
        overall: counts.overall(),
        counts,
        daily,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn item(source: &str, id: i64, published: NaiveDate, mentions: &[(&str, Sentiment)]) -> AnalyzedItem {
        AnalyzedItem {
            source_id: source.into(),
            item_id: id,
            url: format!("https://{source}.test/{id}"),
            published,
            from_cache: false,
            mentions: mentions
                .iter()
                .map(|(sym, s)| EntityMention {
                    item_id: id,
                    entity: EntityRef::new(EntityKind::Instrument, sym),
                    sentiment: *s,
                    rationale: String::new(),
                    details: None,
                })
                .collect(),
        }
    }

    #[test]
    fn acb_across_three_sources() {
        let items = vec![
            item("C", 3, day(9), &[("ACB", Sentiment::Positive)]),
            item("A", 1, day(10), &[("ACB", Sentiment::Positive)]),
            item("B", 2, day(8), &[("ACB", Sentiment::Negative)]),
        ];
        let views = aggregate(&items);
        assert_eq!(views.len(), 1);
        let acb = &views[0];
        assert_eq!(acb.entity_id, "instrument:ACB");
        assert_eq!(acb.mentions, 3);
        assert_eq!(acb.overall, Sentiment::Positive);
        assert_eq!(acb.sources, vec!["A", "B", "C"]);
        assert_eq!(acb.latest_mention, day(10));
        assert_eq!(acb.notes[0].source_id, "A");
    }

    #[test]
    fn ranking_and_tie_break_are_deterministic() {
        let items = vec![
            item("A", 1, day(5), &[("VCB", Sentiment::Positive), ("ACB", Sentiment::Negative)]),
            item("A", 2, day(6), &[("VCB", Sentiment::Negative), ("FPT", Sentiment::Neutral)]),
            item("B", 3, day(6), &[("HPG", Sentiment::Neutral), ("ACB", Sentiment::Positive)]),
        ];
        let mut reversed = items.clone();
        reversed.reverse();

        let views = aggregate(&items);
        let ids: Vec<_> = views.iter().map(|v| v.entity_id.as_str()).collect();
        // ACB and VCB: 2 mentions, latest 6 -> id order; FPT/HPG: 1 mention, latest 6 -> id order
        assert_eq!(
            ids,
            vec!["instrument:ACB", "instrument:VCB", "instrument:FPT", "instrument:HPG"]
        );
        // 1 positive vs 1 negative resolves to positive
        assert_eq!(views[1].overall, Sentiment::Positive);
        assert_eq!(aggregate(&reversed), views);
    }

    #[test]
    fn window_is_inclusive_of_today() {
        assert_eq!(window_start(day(10), 7), day(4));
        assert_eq!(window_start(day(10), 1), day(10));
    }
}
