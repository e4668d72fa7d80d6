// src/fetch/mod.rs
//! Fetch executor: walks a source's listing pages up to the date cutoff and
//! retrieves item bodies, all through leased browser handles.

pub mod document;
pub mod listing;
pub mod text;

use std::collections::HashSet;
use std::time::Duration;

use chrono::NaiveDate;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::model::{ContentKind, SourceConfig};
use crate::pool::{BrowserPool, LeaseOutcome};
use crate::retry::{retry_async, RetryPolicy};

pub use document::DocumentFetcher;
pub use listing::{ListedItem, ListingEntry};

/// Bodies shorter than this (in chars) are treated as extraction failures.
pub const MIN_BODY_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Hard cap on listing pages per source.
    pub max_pages: u32,
    /// Politeness delay between listing pages.
    pub page_delay: Duration,
    pub min_body_chars: usize,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_pages: 10,
            page_delay: Duration::from_millis(1_500),
            min_body_chars: MIN_BODY_CHARS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Pagination cursor for one source crawl. Lives only for the crawl.
#[derive(Debug)]
pub struct FetchJob<'a> {
    source: &'a SourceConfig,
    since: NaiveDate,
    page: u32,
    seen: HashSet<String>,
}

impl<'a> FetchJob<'a> {
    pub fn new(source: &'a SourceConfig, since: NaiveDate) -> Self {
        Self {
            source,
            since,
            page: 0,
            seen: HashSet::new(),
        }
    }

    /// URL of the next listing page, or `None` once `max_pages` is reached.
    pub fn next_page(&mut self, max_pages: u32) -> Option<String> {
        if self.page >= max_pages {
            return None;
        }
        self.page += 1;
        Some(listing::page_url(
            &self.source.base_url,
            self.source.pagination_rule.as_deref(),
            self.page,
        ))
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    /// Drop links already collected on earlier pages (pinned posts etc.).
    fn fresh(&mut self, items: Vec<ListedItem>) -> Vec<ListedItem> {
        items
            .into_iter()
            .filter(|i| self.seen.insert(i.url.clone()))
            .collect()
    }
}

pub struct FetchExecutor {
    pool: BrowserPool,
    documents: DocumentFetcher,
    settings: FetchSettings,
}

impl FetchExecutor {
    pub fn new(pool: BrowserPool, documents: DocumentFetcher, settings: FetchSettings) -> Self {
        Self {
            pool,
            documents,
            settings,
        }
    }

    /// Collect `(url, date)` for every item published on or after `since`.
    ///
    /// Stops at the first page holding an item older than `since`, on an
    /// empty page, or at `max_pages`. Listings are assumed newest-first.
    /// A failing first page fails the source; later page failures end
    /// pagination and keep what was collected.
    pub async fn list_items(
        &self,
        source: &SourceConfig,
        since: NaiveDate,
    ) -> Result<Vec<ListedItem>, FetchError> {
        let mut job = FetchJob::new(source, since);
        let mut out = Vec::new();

        while let Some(url) = job.next_page(self.settings.max_pages) {
            if job.page() > 1 && !self.settings.page_delay.is_zero() {
                tokio::time::sleep(self.settings.page_delay).await;
            }

            let html = match self.render(&url).await {
                Ok(h) => h,
                Err(e @ FetchError::Pool(_)) => return Err(e),
                Err(e) if job.page() == 1 => return Err(e),
                Err(e) => {
                    warn!(source = %source.id, page = job.page(), error = %e, "listing page failed, ending pagination");
                    break;
                }
            };
            counter!("crawl_pages_total").increment(1);

            let entries = listing::parse_listing(&html, &url, source)?;
            if entries.is_empty() {
                debug!(source = %source.id, page = job.page(), "empty listing page, stopping");
                break;
            }
            let scan = listing::apply_cutoff(entries, job.since);
            let fresh = job.fresh(scan.accepted);
            debug!(
                source = %source.id,
                page = job.page(),
                accepted = fresh.len(),
                undated = scan.undated,
                reached_cutoff = scan.reached_cutoff,
                "listing page parsed"
            );
            out.extend(fresh);
            if scan.reached_cutoff {
                break;
            }
        }

        info!(source = %source.id, pages = job.page(), items = out.len(), %since, "listing complete");
        Ok(out)
    }

    /// Retrieve the cleaned body of one item.
    pub async fn fetch_body(&self, url: &str, source: &SourceConfig) -> Result<String, FetchError> {
        let html = self.render(url).await?;
        let body = match source.content_kind {
            ContentKind::Text => text::extract_text(&html, &source.content_rule, url)?,
            ContentKind::LinkedDocument => {
                let link = document::resolve_document_link(&html, &source.content_rule, url)?;
                debug!(source = %source.id, %link, "fetching linked document");
                self.documents.fetch_text(&link, &self.settings.retry).await?
            }
        };
        if body.chars().count() < self.settings.min_body_chars {
            return Err(FetchError::permanent(
                url,
                format!("extracted content too short ({} chars)", body.chars().count()),
            ));
        }
        Ok(body)
    }

    /// Render one URL on a leased handle, retrying transient failures.
    /// The handle is always released, and re-acquired per attempt.
    async fn render(&self, url: &str) -> Result<String, FetchError> {
        retry_async(
            &self.settings.retry,
            "page render",
            |_| async move {
                let lease = self.pool.acquire().await?;
                let result = lease.render(url).await;
                let outcome = if result.is_ok() {
                    LeaseOutcome::Healthy
                } else {
                    LeaseOutcome::Failed
                };
                self.pool.release(lease, outcome).await;
                result
            },
            FetchError::is_retryable,
        )
        .await
        .map_err(|(e, _)| e)
    }
}
