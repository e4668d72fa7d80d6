// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - POST /runs (validation of lookback and inline sources, explicit sources,
//   configured fallback, pool exhaustion)
// - GET /runs/recent
// - GET /debug/pool

mod common;

use std::sync::Arc;

use serde_json::json;
use serde_json::Value as Json;
use shuttle_axum::axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use tower::ServiceExt as _; // for `oneshot`

use common::*;
use market_sentiment_crawler::history::RunHistory;
use market_sentiment_crawler::pool::BrowserFactory;
use market_sentiment_crawler::registry::EntityRegistry;
use market_sentiment_crawler::store::MemoryStore;
use market_sentiment_crawler::{create_router, AppState, Category, SourceConfig};

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests
const BASE: &str = "https://a.test/news";

fn site() -> Arc<FakeWeb> {
    let today = chrono::Local::now().date_naive();
    let web = FakeWeb::new();
    web.page(
        BASE,
        listing_html(&[("/a/1", today), ("/a/old", today - chrono::Duration::days(60))]),
    );
    web.page("https://a.test/a/1", article_html(&[("ACB", "positive")]));
    web
}

fn state_with(web: Arc<FakeWeb>, defaults: Vec<SourceConfig>) -> AppState {
    AppState {
        pipeline: Arc::new(simple_pipeline(web, Arc::new(MemoryStore::new()), echo_inference())),
        history: Arc::new(RunHistory::with_capacity(10)),
        default_sources: Arc::new(defaults),
        default_lookback_days: 3,
    }
}

fn test_router(defaults: Vec<SourceConfig>) -> Router {
    create_router(state_with(site(), defaults))
}

async fn send(app: Router, method: &str, uri: &str, payload: Option<Json>) -> (StatusCode, Vec<u8>) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match payload {
        Some(p) => {
            req = req.header("content-type", "application/json");
            Body::from(p.to_string())
        }
        None => Body::empty(),
    };
    let resp = app
        .oneshot(req.body(body).expect("build request"))
        .await
        .expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

#[tokio::test]
async fn api_health_returns_200_and_ok_body() {
    let (status, body) = send(test_router(vec![]), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK, "health should be 200");
    assert_eq!(String::from_utf8(body).unwrap().trim(), "ok");
}

#[tokio::test]
async fn api_runs_rejects_bad_lookback() {
    let app = test_router(vec![source("a", BASE, Category::Instrument)]);
    let (status, body) = send(app.clone(), "POST", "/runs", Some(json!({ "lookback_days": 0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert!(v["error"].as_str().unwrap().contains("lookback_days"));

    let (status, _) = send(app, "POST", "/runs", Some(json!({ "lookback_days": 365 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_runs_without_any_sources_is_400() {
    let (status, _) = send(test_router(vec![]), "POST", "/runs", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_runs_with_explicit_sources_returns_report_and_records_history() {
    let app = test_router(vec![]);
    let src = serde_json::to_value(source("a", BASE, Category::Instrument)).unwrap();
    let (status, body) = send(
        app.clone(),
        "POST",
        "/runs",
        Some(json!({ "sources": [src], "lookback_days": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

    let v: Json = serde_json::from_slice(&body).unwrap();
    // Contract checks for UI consumers
    assert_eq!(v["lookback_days"], 2);
    assert_eq!(v["sources"][0]["status"], "ok");
    assert_eq!(v["entities"][0]["entity_id"], "instrument:ACB");
    assert_eq!(v["entities"][0]["overall"], "positive");
    assert!(v["failures"].as_array().unwrap().is_empty());

    let (status, body) = send(app, "GET", "/runs/recent?n=5", None).await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&body).unwrap();
    let runs = v.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["ok"], 1);
    assert_eq!(runs[0]["top_entities"][0], "instrument:ACB");
}

#[tokio::test]
async fn api_runs_rejects_invalid_inline_sources() {
    let a = serde_json::to_value(source("a", BASE, Category::Instrument)).unwrap();
    let (status, body) = send(
        test_router(vec![]),
        "POST",
        "/runs",
        Some(json!({ "sources": [a.clone(), a] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert!(v["error"].as_str().unwrap().contains("duplicate source id"));

    let bad = serde_json::to_value(source("b", "not a url", Category::Macro)).unwrap();
    let (status, _) = send(test_router(vec![]), "POST", "/runs", Some(json!({ "sources": [bad] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let blank = serde_json::to_value(source(" ", BASE, Category::Macro)).unwrap();
    let (status, _) = send(test_router(vec![]), "POST", "/runs", Some(json!({ "sources": [blank] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_runs_fall_back_to_configured_sources() {
    let app = test_router(vec![source("a", BASE, Category::Instrument)]);
    let (status, body) = send(app, "POST", "/runs", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["lookback_days"], 3);
    assert_eq!(v["sources"][0]["source_id"], "a");
}

#[tokio::test]
async fn api_runs_report_pool_exhaustion_as_503() {
    let pool = pool_with(1, vec![FakeFactory::broken("browserless") as Arc<dyn BrowserFactory>]);
    let state = AppState {
        pipeline: Arc::new(pipeline(
            pool,
            Arc::new(MemoryStore::new()),
            echo_inference(),
            EntityRegistry::default(),
            fast_run_settings(),
        )),
        history: Arc::new(RunHistory::with_capacity(10)),
        default_sources: Arc::new(vec![source("a", BASE, Category::Instrument)]),
        default_lookback_days: 3,
    };
    let history = state.history.clone();
    let app = create_router(state);

    let (status, body) = send(app, "POST", "/runs", Some(json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert!(v["error"].as_str().unwrap().contains("exhausted"));
    assert!(history.snapshot_last_n(1)[0].error.is_some());
}

#[tokio::test]
async fn api_debug_pool_exposes_stats() {
    let (status, body) = send(test_router(vec![]), "GET", "/debug/pool", None).await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["size"], 3);
    assert_eq!(v["outstanding"], 0);
}
