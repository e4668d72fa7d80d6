// src/pool/browser.rs
//! Browser handles and the factories that launch them.
//!
//! Three construction tiers, tried in order by the pool:
//! * `browserless` – remote headless Chrome over the Browserless `/content` API
//! * `chromium`    – local headless Chromium (`--dump-dom`) with a private profile dir
//! * `http`        – plain HTTP client with browser-like headers (no JS)

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tokio::process::Command;

use crate::error::FetchError;

/// A leased rendering handle. One page at a time per handle.
#[async_trait::async_trait]
pub trait Browser: Send + Sync {
    /// Navigate to `url` and return the rendered HTML.
    async fn render(&self, url: &str) -> Result<String, FetchError>;

    /// Liveness probe run before a handle is handed out again.
    async fn is_alive(&self) -> bool;

    /// Tear down external resources. Must be safe to call more than once.
    async fn close(&self) {}

    fn tier(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self) -> anyhow::Result<Box<dyn Browser>>;
    fn tier(&self) -> &'static str;
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Tier configuration (the `[browser]` section of the settings file).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Construction order; unknown names are skipped with a warning.
    pub tiers: Vec<String>,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub chrome_bin: String,
    pub user_agent: String,
    pub page_timeout_secs: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            tiers: vec!["browserless".into(), "chromium".into(), "http".into()],
            browserless_url: None,
            browserless_token: None,
            chrome_bin: "chromium".into(),
            user_agent: DEFAULT_USER_AGENT.into(),
            page_timeout_secs: 30,
        }
    }
}

/// Build the factory chain from settings, in configured order.
pub fn factories_from(settings: &BrowserSettings) -> Vec<Arc<dyn BrowserFactory>> {
    let timeout = Duration::from_secs(settings.page_timeout_secs.max(1));
    let mut out: Vec<Arc<dyn BrowserFactory>> = Vec::new();
    for tier in &settings.tiers {
        match tier.trim().to_ascii_lowercase().as_str() {
            "browserless" => match settings.browserless_url.as_deref() {
                Some(base) if !base.trim().is_empty() => out.push(Arc::new(BrowserlessFactory {
                    base_url: base.trim_end_matches('/').to_string(),
                    token: settings.browserless_token.clone(),
                    timeout,
                })),
                _ => tracing::debug!("browserless tier configured without BROWSERLESS_URL, skipping"),
            },
            "chromium" => out.push(Arc::new(ChromiumFactory {
                chrome_bin: PathBuf::from(&settings.chrome_bin),
                page_timeout: timeout,
            })),
            "http" => out.push(Arc::new(HttpFactory {
                user_agent: settings.user_agent.clone(),
                timeout,
            })),
            other => tracing::warn!(tier = other, "unknown browser tier in config, skipping"),
        }
    }
    out
}

// ------------------------------------------------------------
// Tier 1: Browserless
// ------------------------------------------------------------

pub struct BrowserlessFactory {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[async_trait::async_trait]
impl BrowserFactory for BrowserlessFactory {
    async fn launch(&self) -> anyhow::Result<Box<dyn Browser>> {
        let http = reqwest::Client::builder()
            .timeout(self.timeout + Duration::from_secs(5))
            .build()
            .context("building browserless http client")?;
        let session = BrowserlessSession {
            http,
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            timeout: self.timeout,
            broken: AtomicBool::new(false),
        };
        if !session.probe().await {
            return Err(anyhow!("browserless at {} is not reachable", self.base_url));
        }
        Ok(Box::new(session))
    }

    fn tier(&self) -> &'static str {
        "browserless"
    }
}

pub struct BrowserlessSession {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    broken: AtomicBool,
}

impl BrowserlessSession {
    fn endpoint(&self, path: &str) -> String {
        match &self.token {
            Some(t) => format!("{}{path}?token={t}", self.base_url),
            None => format!("{}{path}", self.base_url),
        }
    }

    async fn probe(&self) -> bool {
        match self.http.get(self.endpoint("/json/version")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait::async_trait]
impl Browser for BrowserlessSession {
    async fn render(&self, url: &str) -> Result<String, FetchError> {
        let body = serde_json::json!({
            "url": url,
            "gotoOptions": {
                "waitUntil": "networkidle2",
                "timeout": self.timeout.as_millis() as u64,
            },
        });
        let resp = self
            .http
            .post(self.endpoint("/content"))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    self.broken.store(true, Ordering::SeqCst);
                }
                FetchError::from_reqwest(url, &e)
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(url, status));
        }
        resp.text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))
    }

    async fn is_alive(&self) -> bool {
        !self.broken.load(Ordering::SeqCst) && self.probe().await
    }

    fn tier(&self) -> &'static str {
        "browserless"
    }
}

// ------------------------------------------------------------
// Tier 2: local headless Chromium
// ------------------------------------------------------------

/// Consecutive crashes after which a local session counts as dead.
const CHROMIUM_MAX_FAILURES: u32 = 3;

pub struct ChromiumFactory {
    pub chrome_bin: PathBuf,
    pub page_timeout: Duration,
}

#[async_trait::async_trait]
impl BrowserFactory for ChromiumFactory {
    async fn launch(&self) -> anyhow::Result<Box<dyn Browser>> {
        let out = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new(&self.chrome_bin).arg("--version").output(),
        )
        .await
        .map_err(|_| anyhow!("{} --version timed out", self.chrome_bin.display()))?
        .with_context(|| format!("spawning {}", self.chrome_bin.display()))?;
        if !out.status.success() {
            return Err(anyhow!(
                "{} --version exited with {}",
                self.chrome_bin.display(),
                out.status
            ));
        }
        let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let profile = tempfile::Builder::new()
            .prefix("crawler-chrome-")
            .tempdir()
            .context("creating chromium profile dir")?;
        tracing::debug!(%version, profile = %profile.path().display(), "chromium session ready");
        Ok(Box::new(ChromiumSession {
            chrome_bin: self.chrome_bin.clone(),
            profile,
            page_timeout: self.page_timeout,
            failures: AtomicU32::new(0),
        }))
    }

    fn tier(&self) -> &'static str {
        "chromium"
    }
}

/// Each render is a short-lived `--dump-dom` process sharing one profile
/// directory; the directory is removed when the session is dropped.
pub struct ChromiumSession {
    chrome_bin: PathBuf,
    profile: tempfile::TempDir,
    page_timeout: Duration,
    failures: AtomicU32,
}

#[async_trait::async_trait]
impl Browser for ChromiumSession {
    async fn render(&self, url: &str) -> Result<String, FetchError> {
        let parsed = url::Url::parse(url).map_err(|e| FetchError::permanent(url, e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::permanent(url, "only http(s) URLs can be rendered"));
        }

        let mut cmd = Command::new(&self.chrome_bin);
        cmd.arg("--headless")
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg(format!("--user-data-dir={}", self.profile.path().display()))
            .arg("--dump-dom")
            .arg(parsed.as_str())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.page_timeout, cmd.output()).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(FetchError::transient(url, format!("chromium spawn failed: {e}")));
            }
            Err(_) => {
                return Err(FetchError::transient(
                    url,
                    format!("chromium timed out after {}s", self.page_timeout.as_secs()),
                ))
            }
        };

        if !output.status.success() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.chars().take(200).collect();
            return Err(FetchError::transient(
                url,
                format!("chromium exited with {}: {tail}", output.status),
            ));
        }

        let html = String::from_utf8_lossy(&output.stdout).into_owned();
        if html.trim().is_empty() {
            return Err(FetchError::transient(url, "chromium returned an empty DOM"));
        }
        self.failures.store(0, Ordering::SeqCst);
        Ok(html)
    }

    async fn is_alive(&self) -> bool {
        self.profile.path().exists() && self.failures.load(Ordering::SeqCst) < CHROMIUM_MAX_FAILURES
    }

    fn tier(&self) -> &'static str {
        "chromium"
    }
}

// ------------------------------------------------------------
// Tier 3: plain HTTP
// ------------------------------------------------------------

pub struct HttpFactory {
    pub user_agent: String,
    pub timeout: Duration,
}

#[async_trait::async_trait]
impl BrowserFactory for HttpFactory {
    async fn launch(&self) -> anyhow::Result<Box<dyn Browser>> {
        use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9,vi;q=0.8"));
        let http = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(self.timeout)
            .build()
            .context("building http tier client")?;
        Ok(Box::new(HttpSession {
            http,
            closed: AtomicBool::new(false),
        }))
    }

    fn tier(&self) -> &'static str {
        "http"
    }
}

pub struct HttpSession {
    http: reqwest::Client,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Browser for HttpSession {
    async fn render(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(url, status));
        }
        resp.text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))
    }

    async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn tier(&self) -> &'static str {
        "http"
    }
}
