// tests/pipeline_scenario.rs
//
// End-to-end run over several sources: cross-source aggregation, ranking,
// and the sector/macro context joined from stored daily aggregates.

mod common;

use std::sync::Arc;

use common::*;
use market_sentiment_crawler::model::Sentiment;
use market_sentiment_crawler::pool::BrowserFactory;
use market_sentiment_crawler::registry::EntityRegistry;
use market_sentiment_crawler::store::MemoryStore;
use market_sentiment_crawler::{Category, SourceStatus};

const REGISTRY: &str = r#"
sectors = ["banking", "steel"]
topics = ["inflation", "credit"]

[[instruments]]
symbol = "ACB"
sector = "banking"

[[instruments]]
symbol = "HPG"
sector = "steel"
"#;

fn site(web: &FakeWeb, host: &str, date: chrono::NaiveDate, mentions: &[(&str, &str)]) {
    let base = format!("https://{host}/news");
    web.page(&base, listing_html(&[("/item/1", date), ("/item/old", day(1))]));
    web.page(&format!("https://{host}/item/1"), article_html(mentions));
}

#[tokio::test]
async fn acb_across_three_sources_with_context() {
    let web = FakeWeb::new();
    site(&web, "a.test", day(10), &[("ACB", "positive")]);
    site(&web, "b.test", day(9), &[("ACB", "negative"), ("HPG", "neutral")]);
    site(&web, "c.test", day(8), &[("acb", "bullish")]);
    site(&web, "s.test", day(9), &[("Banking", "negative")]);
    site(&web, "m.test", day(10), &[("Inflation", "positive")]);
    // outside the 3-day macro window ending on the 10th
    site(&web, "m2.test", day(6), &[("credit", "negative")]);

    let pool = pool_with(3, vec![FakeFactory::new(web, "fake") as Arc<dyn BrowserFactory>]);
    let p = pipeline(
        pool,
        Arc::new(MemoryStore::new()),
        echo_inference(),
        EntityRegistry::from_toml_str(REGISTRY).unwrap(),
        fast_run_settings(),
    );

    let sources = vec![
        source("A", "https://a.test/news", Category::Instrument),
        source("B", "https://b.test/news", Category::Instrument),
        source("C", "https://c.test/news", Category::Instrument),
        source("S", "https://s.test/news", Category::Sector),
        source("M", "https://m.test/news", Category::Macro),
        source("M2", "https://m2.test/news", Category::Macro),
    ];
    let report = p.run_at(&sources, 7, day(10)).await.unwrap();
    assert!(report.sources.iter().all(|s| s.status == SourceStatus::Ok));

    let acb = &report.entities[0];
    assert_eq!(acb.entity_id, "instrument:ACB");
    assert_eq!(acb.mentions, 3);
    assert_eq!(acb.overall, Sentiment::Positive);
    assert_eq!(acb.sources, vec!["A", "B", "C"]);
    assert_eq!(acb.latest_mention, day(10));

    let trend = acb.sector_trend.as_ref().expect("banking trend");
    assert_eq!(trend.sector, "banking");
    assert_eq!(trend.counts.negative, 1);
    assert_eq!(trend.overall, Sentiment::Negative);
    assert_eq!(trend.window_days, 7);

    let topics: Vec<&str> = acb.macro_context.iter().map(|t| t.topic.as_str()).collect();
    assert_eq!(topics, vec!["inflation"]);

    // one mention each, ranked by latest date then id
    let rest: Vec<&str> = report.entities[1..]
        .iter()
        .map(|e| e.entity_id.as_str())
        .collect();
    assert_eq!(
        rest,
        vec![
            "topic:inflation",
            "instrument:HPG",
            "sector:banking",
            "topic:credit"
        ]
    );

    // HPG's sector has no stored rows: omitted, not an error
    let hpg = report.entities.iter().find(|e| e.entity_id == "instrument:HPG").unwrap();
    assert!(hpg.sector_trend.is_none());

    // a sector entity is its own sector
    let banking = report.entities.iter().find(|e| e.entity_id == "sector:banking").unwrap();
    assert_eq!(banking.sector_trend.as_ref().unwrap().sector, "banking");
}

#[tokio::test]
async fn empty_run_has_no_entities() {
    let web = FakeWeb::new();
    web.page("https://a.test/news", listing_html(&[("/item/old", day(1))]));
    let p = simple_pipeline(web, Arc::new(MemoryStore::new()), echo_inference());
    let report = p
        .run_at(&[source("A", "https://a.test/news", Category::Instrument)], 3, day(10))
        .await
        .unwrap();
    assert_eq!(report.sources[0].status, SourceStatus::Ok);
    assert_eq!(report.sources[0].listed, 0);
    assert!(report.entities.is_empty());
    assert_eq!(report.since, day(7));
}
