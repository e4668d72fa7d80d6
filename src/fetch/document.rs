// src/fetch/document.rs
//! Linked-document sources: the content locator points at a download link
//! (typically a PDF report) instead of inline text.

use std::time::Duration;

use scraper::Html;
use url::Url;

use crate::error::FetchError;
use crate::fetch::listing::compile_rule;
use crate::fetch::text::{clean_text, normalize_text};
use crate::retry::{retry_async, RetryPolicy};

/// Downloads above this size are rejected.
const DEFAULT_MAX_BYTES: usize = 25 * 1024 * 1024;

/// Resolve the document link from a rendered detail page.
///
/// Looks at `href`, then `src`, then `data-src`, then the element text.
pub fn resolve_document_link(html: &str, rule: &str, page_url: &str) -> Result<String, FetchError> {
    let sel = compile_rule(rule)?;
    let doc = Html::parse_document(html);
    let el = doc.select(&sel).next().ok_or_else(|| {
        FetchError::permanent(page_url, format!("document locator `{rule}` matched nothing"))
    })?;
    let raw = ["href", "src", "data-src"]
        .iter()
        .find_map(|a| el.value().attr(a))
        .map(str::to_string)
        .unwrap_or_else(|| el.text().collect::<String>());
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FetchError::permanent(page_url, "document link is empty"));
    }
    let base = Url::parse(page_url).map_err(|e| FetchError::permanent(page_url, e.to_string()))?;
    base.join(raw)
        .map(|u| u.to_string())
        .map_err(|e| FetchError::permanent(page_url, format!("bad document link `{raw}`: {e}")))
}

pub fn looks_like_pdf(content_type: Option<&str>, bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
        || content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
}

/// PDF to text on the blocking pool. The extractor can panic on malformed
/// input, which is turned into a permanent error.
pub async fn pdf_to_text(url: &str, bytes: Vec<u8>) -> Result<String, FetchError> {
    let joined = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&bytes))
    })
    .await
    .map_err(|e| FetchError::permanent(url, format!("pdf task failed: {e}")))?;

    match joined {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(FetchError::permanent(url, format!("pdf extraction failed: {e}"))),
        Err(_) => Err(FetchError::permanent(url, "pdf extraction panicked")),
    }
}

#[derive(Clone)]
pub struct DocumentFetcher {
    http: reqwest::Client,
    max_bytes: usize,
}

impl DocumentFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            max_bytes: DEFAULT_MAX_BYTES,
        })
    }

    /// Cap on a single download, in bytes.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Download `url` (with retries) and convert it to cleaned text.
    pub async fn fetch_text(&self, url: &str, retry: &RetryPolicy) -> Result<String, FetchError> {
        let (content_type, bytes) = retry_async(
            retry,
            "document download",
            |_| self.download(url),
            FetchError::is_retryable,
        )
        .await
        .map_err(|(e, _)| e)?;

        if looks_like_pdf(content_type.as_deref(), &bytes) {
            Ok(normalize_text(&pdf_to_text(url, bytes).await?))
        } else {
            Ok(clean_text(&String::from_utf8_lossy(&bytes)))
        }
    }

    async fn download(&self, url: &str) -> Result<(Option<String>, Vec<u8>), FetchError> {
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
        if resp
            .content_length()
            .is_some_and(|n| n as usize > self.max_bytes)
        {
            return Err(FetchError::permanent(url, "document exceeds size limit"));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;
        if bytes.len() > self.max_bytes {
            return Err(FetchError::permanent(url, "document exceeds size limit"));
        }
        Ok((content_type, bytes.to_vec()))
    }
}
