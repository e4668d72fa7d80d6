// tests/common/mod.rs
//
// Shared fixtures: an in-process "web" served through fake browser handles,
// an inference mock that echoes `MENTION <entity> <sentiment>` markers from
// the article text, and a pipeline builder with zero-delay retry policies.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;

use market_sentiment_crawler::aggregate::ContextWindows;
use market_sentiment_crawler::analyze::{AnalysisSettings, MockInference, NoopAudit};
use market_sentiment_crawler::error::FetchError;
use market_sentiment_crawler::fetch::{DocumentFetcher, FetchSettings};
use market_sentiment_crawler::pool::{Browser, BrowserFactory, BrowserPool, PoolConfig};
use market_sentiment_crawler::registry::EntityRegistry;
use market_sentiment_crawler::retry::RetryPolicy;
use market_sentiment_crawler::store::DynStore;
use market_sentiment_crawler::{Category, ContentKind, Pipeline, PipelineContext, RunSettings, SourceConfig};

// ------------------------------------------------------------
// Fake web
// ------------------------------------------------------------

#[derive(Default)]
pub struct FakeWeb {
    pages: Mutex<HashMap<String, String>>,
    slow: Mutex<HashMap<String, Duration>>,
    hits: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    render_delay: Mutex<Duration>,
}

impl FakeWeb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn page(&self, url: &str, html: impl Into<String>) {
        self.pages.lock().unwrap().insert(url.to_string(), html.into());
    }

    /// Every render of `url` takes `delay`.
    pub fn slow(&self, url: &str, delay: Duration) {
        self.slow.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn set_render_delay(&self, delay: Duration) {
        *self.render_delay.lock().unwrap() = delay;
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    /// Highest number of renders observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn serve(&self, url: &str) -> Result<String, FetchError> {
        *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = {
            let base = *self.render_delay.lock().unwrap();
            self.slow.lock().unwrap().get(url).copied().unwrap_or(base)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        let page = self.pages.lock().unwrap().get(url).cloned();
        page.ok_or_else(|| FetchError::permanent(url, "HTTP 404 Not Found"))
    }
}

pub struct FakeBrowser {
    web: Arc<FakeWeb>,
    tier: &'static str,
    alive: Arc<AtomicBool>,
    liveness_delay: Arc<Mutex<Duration>>,
}

#[async_trait::async_trait]
impl Browser for FakeBrowser {
    async fn render(&self, url: &str) -> Result<String, FetchError> {
        self.web.serve(url).await
    }

    async fn is_alive(&self) -> bool {
        let delay = *self.liveness_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.alive.load(Ordering::SeqCst)
    }

    fn tier(&self) -> &'static str {
        self.tier
    }
}

/// Launches [`FakeBrowser`]s; keeps the liveness switch of each handle.
pub struct FakeFactory {
    web: Arc<FakeWeb>,
    tier: &'static str,
    fail: bool,
    pub launched: AtomicUsize,
    switches: Mutex<Vec<Arc<AtomicBool>>>,
    liveness_delay: Arc<Mutex<Duration>>,
}

impl FakeFactory {
    pub fn new(web: Arc<FakeWeb>, tier: &'static str) -> Arc<Self> {
        Arc::new(Self {
            web,
            tier,
            fail: false,
            launched: AtomicUsize::new(0),
            switches: Mutex::new(Vec::new()),
            liveness_delay: Arc::default(),
        })
    }

    /// A tier whose launches always fail.
    pub fn broken(tier: &'static str) -> Arc<Self> {
        Arc::new(Self {
            web: FakeWeb::new(),
            tier,
            fail: true,
            launched: AtomicUsize::new(0),
            switches: Mutex::new(Vec::new()),
            liveness_delay: Arc::default(),
        })
    }

    pub fn launches(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Liveness checks of every handle (past and future) take `delay`.
    pub fn set_liveness_delay(&self, delay: Duration) {
        *self.liveness_delay.lock().unwrap() = delay;
    }

    /// Mark every handle launched so far as dead.
    pub fn kill_all(&self) {
        for s in self.switches.lock().unwrap().iter() {
            s.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl BrowserFactory for FakeFactory {
    async fn launch(&self) -> anyhow::Result<Box<dyn Browser>> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("{} unavailable", self.tier);
        }
        let alive = Arc::new(AtomicBool::new(true));
        self.switches.lock().unwrap().push(alive.clone());
        Ok(Box::new(FakeBrowser {
            web: self.web.clone(),
            tier: self.tier,
            alive,
            liveness_delay: self.liveness_delay.clone(),
        }))
    }

    fn tier(&self) -> &'static str {
        self.tier
    }
}

pub fn pool_with(size: usize, factories: Vec<Arc<dyn BrowserFactory>>) -> BrowserPool {
    BrowserPool::new(
        PoolConfig {
            size,
            launch_attempts_per_tier: 1,
            launch_backoff: Duration::ZERO,
        },
        factories,
    )
}

// ------------------------------------------------------------
// Canned HTML
// ------------------------------------------------------------

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
}

/// Listing page with one `div.item` per `(href, date)`.
pub fn listing_html(entries: &[(&str, NaiveDate)]) -> String {
    let mut s = String::from("<html><body><div class=\"list\">");
    for (href, date) in entries {
        s.push_str(&format!(
            "<div class=\"item\"><a href=\"{href}\">Headline</a><span class=\"date\">{}</span></div>",
            date.format("%d/%m/%Y")
        ));
    }
    s.push_str("</div></body></html>");
    s
}

/// Article page whose body carries one `MENTION` marker per pair.
pub fn article_html(mentions: &[(&str, &str)]) -> String {
    let mut body = String::from(
        "<p>Market commentary for the trading session with enough prose to pass the minimum body length check.</p>",
    );
    for (entity, sentiment) in mentions {
        body.push_str(&format!("<p>MENTION {entity} {sentiment} today</p>"));
    }
    format!("<html><body><nav>menu</nav><div class=\"content\">{body}</div></body></html>")
}

pub fn source(id: &str, base_url: &str, category: Category) -> SourceConfig {
    SourceConfig {
        id: id.to_string(),
        name: format!("Source {id}"),
        base_url: base_url.to_string(),
        listing_item_rule: "div.item".into(),
        content_rule: "div.content".into(),
        date_rule: "span.date".into(),
        link_rule: None,
        pagination_rule: None,
        category,
        content_kind: ContentKind::Text,
        active: true,
    }
}

// ------------------------------------------------------------
// Inference
// ------------------------------------------------------------

/// Answers with one mention per `MENTION <entity> <sentiment>` marker in the prompt.
pub fn echo_inference() -> Arc<MockInference> {
    Arc::new(MockInference::new(|prompt| {
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let mentions: Vec<_> = words
            .windows(3)
            .filter(|w| w[0] == "MENTION")
            .map(|w| json!({"entity": w[1], "sentiment": w[2], "rationale": "marker"}))
            .collect();
        Ok(json!({"summary": "test summary", "mentions": mentions}).to_string())
    }))
}

// ------------------------------------------------------------
// Pipeline
// ------------------------------------------------------------

pub fn fast_run_settings() -> RunSettings {
    RunSettings {
        workers: 3,
        run_timeout: Duration::from_secs(30),
        fetch: FetchSettings {
            max_pages: 10,
            page_delay: Duration::ZERO,
            min_body_chars: 50,
            retry: RetryPolicy::immediate(2),
        },
        analysis: AnalysisSettings {
            retry: RetryPolicy::immediate(3),
            max_input_chars: 12_000,
        },
        windows: ContextWindows::default(),
    }
}

pub fn documents() -> DocumentFetcher {
    DocumentFetcher::new("test-agent", Duration::from_secs(5)).unwrap()
}

pub fn pipeline(
    pool: BrowserPool,
    store: DynStore,
    inference: Arc<MockInference>,
    registry: EntityRegistry,
    settings: RunSettings,
) -> Pipeline {
    Pipeline::new(PipelineContext {
        pool,
        store,
        inference,
        audit: Arc::new(NoopAudit),
        registry: Arc::new(registry),
        documents: documents(),
        settings,
    })
}

/// Pipeline over `web` with a 3-handle pool and an empty registry.
pub fn simple_pipeline(web: Arc<FakeWeb>, store: DynStore, inference: Arc<MockInference>) -> Pipeline {
    let pool = pool_with(3, vec![FakeFactory::new(web, "fake") as Arc<dyn BrowserFactory>]);
    pipeline(pool, store, inference, EntityRegistry::default(), fast_run_settings())
}

pub fn unique_urls(urls: &[String]) -> HashSet<String> {
    urls.iter().cloned().collect()
}
