// src/pipeline.rs
//! Multi-source run orchestration.
//!
//! Sources run in parallel on a bounded set of workers; inside a source the
//! listing walk and item processing are sequential in discovery order. Each
//! item goes gate -> fetch -> analyze -> persist. Failures stay local to the
//! item or source; only pool exhaustion on every source fails the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregate::{self, AnalyzedItem, ContextWindows, EntityView};
use crate::analyze::{AnalysisInvoker, AnalysisSettings, AuditSink, ContextHints, DynInferenceClient};
use crate::dedup::{DedupGate, GateDecision};
use crate::error::{FetchError, PoolError, RunError, StoreError};
use crate::fetch::{DocumentFetcher, FetchExecutor, FetchSettings, ListedItem};
use crate::model::{ContentItem, ItemStatus, NewContentItem, SourceConfig};
use crate::persist::PersistenceWriter;
use crate::pool::BrowserPool;
use crate::registry::EntityRegistry;
use crate::store::{DynStore, Upserted};

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Sources processed concurrently.
    pub workers: usize,
    /// Wall-clock budget for the whole run.
    pub run_timeout: Duration,
    pub fetch: FetchSettings,
    pub analysis: AnalysisSettings,
    pub windows: ContextWindows,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            run_timeout: Duration::from_secs(30 * 60),
            fetch: FetchSettings::default(),
            analysis: AnalysisSettings::default(),
            windows: ContextWindows::default(),
        }
    }
}

/// Everything a run needs, owned explicitly and handed over once.
pub struct PipelineContext {
    pub pool: BrowserPool,
    pub store: DynStore,
    pub inference: DynInferenceClient,
    pub audit: Arc<dyn AuditSink>,
    pub registry: Arc<EntityRegistry>,
    pub documents: DocumentFetcher,
    pub settings: RunSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Partial,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub source_id: String,
    pub status: SourceStatus,
    pub listed: usize,
    pub analyzed: usize,
    pub cached: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub since: NaiveDate,
    pub lookback_days: u32,
    pub duration_ms: u64,
    pub entities: Vec<EntityView>,
    pub sources: Vec<SourceStats>,
    pub failures: Vec<SourceFailure>,
}

impl RunReport {
    pub fn count(&self, status: SourceStatus) -> usize {
        self.sources.iter().filter(|s| s.status == status).count()
    }
}

/// Why a source stopped before finishing its listing.
#[derive(Debug)]
enum Abort {
    Pool(PoolError),
    Fetch(FetchError),
    Deadline,
}

#[derive(Debug, Default)]
struct SourceProgress {
    listed: usize,
    analyzed: usize,
    cached: usize,
    failed: usize,
    items: Vec<AnalyzedItem>,
    failures: Vec<SourceFailure>,
}

struct SourceRun {
    stats: SourceStats,
    items: Vec<AnalyzedItem>,
    failures: Vec<SourceFailure>,
    pool_exhausted: Option<String>,
}

enum ItemOutcome {
    Analyzed(AnalyzedItem),
    Cached(AnalyzedItem),
    Failed(String),
}

pub struct Pipeline {
    fetcher: FetchExecutor,
    gate: DedupGate,
    invoker: AnalysisInvoker,
    writer: PersistenceWriter,
    store: DynStore,
    registry: Arc<EntityRegistry>,
    pool: BrowserPool,
    settings: RunSettings,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        crate::metrics::ensure_metrics_described();
        let PipelineContext {
            pool,
            store,
            inference,
            audit,
            registry,
            documents,
            settings,
        } = ctx;
        Self {
            fetcher: FetchExecutor::new(pool.clone(), documents, settings.fetch.clone()),
            gate: DedupGate::new(store.clone()),
            invoker: AnalysisInvoker::new(
                inference,
                registry.clone(),
                audit,
                settings.analysis.clone(),
            ),
            writer: PersistenceWriter::new(store.clone()),
            store,
            registry,
            pool,
            settings,
        }
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    /// Crawl, analyze and aggregate `sources` over the last `lookback_days`.
    pub async fn run_multi_source_analysis(
        &self,
        sources: &[SourceConfig],
        lookback_days: u32,
    ) -> Result<RunReport, RunError> {
        self.run_at(sources, lookback_days, Local::now().date_naive())
            .await
    }

    /// Same as [`Pipeline::run_multi_source_analysis`] with an explicit
    /// "today" (cutoff and context windows are relative to it).
    pub async fn run_at(
        &self,
        sources: &[SourceConfig],
        lookback_days: u32,
        today: NaiveDate,
    ) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = tokio::time::Instant::now() + self.settings.run_timeout;
        let since = today - chrono::Duration::days(i64::from(lookback_days));
        let workers = self.settings.workers.max(1);

        info!(
            sources = sources.len(),
            lookback_days,
            %since,
            workers,
            "multi-source run started"
        );

        let jobs: Vec<_> = sources
            .iter()
            .enumerate()
            .map(|(idx, src)| self.run_indexed(idx, src, since, deadline))
            .collect();
        let mut runs: Vec<(usize, SourceRun)> = stream::iter(jobs)
            .buffer_unordered(workers)
            .collect()
            .await;
        runs.sort_by_key(|(idx, _)| *idx);

        let active = sources.iter().filter(|s| s.active).count();
        let exhausted: Vec<String> = runs
            .iter()
            .filter_map(|(_, r)| r.pool_exhausted.clone())
            .collect();
        if active > 0 && exhausted.len() == active {
            let last = exhausted.last().cloned().unwrap_or_default();
            warn!(sources = active, error = %last, "browser pool exhausted on every source");
            return Err(RunError::PoolExhausted(last));
        }

        let mut stats = Vec::with_capacity(runs.len());
        let mut items = Vec::new();
        let mut failures = Vec::new();
        for (_, run) in runs {
            stats.push(run.stats);
            items.extend(run.items);
            failures.extend(run.failures);
        }

        let mut entities = aggregate::aggregate(&items);
        aggregate::join_context(
            &mut entities,
            self.store.as_ref(),
            &self.registry,
            today,
            self.settings.windows,
        )
        .await;

        let duration_ms = clock.elapsed().as_millis() as u64;
        histogram!("run_duration_ms").record(duration_ms as f64);

        let report = RunReport {
            started_at,
            since,
            lookback_days,
            duration_ms,
            entities,
            sources: stats,
            failures,
        };
        info!(
            ok = report.count(SourceStatus::Ok),
            partial = report.count(SourceStatus::Partial),
            failed = report.count(SourceStatus::Failed),
            skipped = report.count(SourceStatus::Skipped),
            entities = report.entities.len(),
            duration_ms,
            "multi-source run finished"
        );
        Ok(report)
    }

    async fn run_indexed(
        &self,
        idx: usize,
        src: &SourceConfig,
        since: NaiveDate,
        deadline: tokio::time::Instant,
    ) -> (usize, SourceRun) {
        (idx, self.run_source(src, since, deadline).await)
    }

    async fn run_source(
        &self,
        src: &SourceConfig,
        since: NaiveDate,
        deadline: tokio::time::Instant,
    ) -> SourceRun {
        if !src.active {
            debug!(source = %src.id, "source inactive, skipping");
            return SourceRun {
                stats: SourceStats {
                    source_id: src.id.clone(),
                    status: SourceStatus::Skipped,
                    listed: 0,
                    analyzed: 0,
                    cached: 0,
                    failed: 0,
                    error: None,
                },
                items: Vec::new(),
                failures: Vec::new(),
                pool_exhausted: None,
            };
        }

        let mut progress = SourceProgress::default();
        let abort = match tokio::time::timeout_at(deadline, self.crawl_source(src, since, &mut progress)).await {
            Ok(Ok(())) => None,
            Ok(Err(abort)) => Some(abort),
            // the crawl future is dropped here; any lease it held is destroyed
            Err(_) => Some(Abort::Deadline),
        };

        let succeeded = progress.analyzed + progress.cached;
        let (status, error, pool_exhausted) = match &abort {
            None if progress.failed > 0 && succeeded == 0 => (SourceStatus::Failed, None, None),
            None if progress.failed > 0 => (SourceStatus::Partial, None, None),
            None => (SourceStatus::Ok, None, None),
            Some(a) => {
                let message = match a {
                    Abort::Pool(e) => e.to_string(),
                    Abort::Fetch(e) => e.to_string(),
                    Abort::Deadline => "run timeout reached".to_string(),
                };
                let status = if succeeded == 0 {
                    SourceStatus::Failed
                } else {
                    SourceStatus::Partial
                };
                let pool = match a {
                    Abort::Pool(_) if succeeded == 0 => Some(message.clone()),
                    _ => None,
                };
                warn!(source = %src.id, error = %message, succeeded, "source aborted");
                progress.failures.push(SourceFailure {
                    source_id: src.id.clone(),
                    url: None,
                    message: message.clone(),
                });
                (status, Some(message), pool)
            }
        };

        info!(
            source = %src.id,
            status = ?status,
            listed = progress.listed,
            analyzed = progress.analyzed,
            cached = progress.cached,
            failed = progress.failed,
            "source finished"
        );

        SourceRun {
            stats: SourceStats {
                source_id: src.id.clone(),
                status,
                listed: progress.listed,
                analyzed: progress.analyzed,
                cached: progress.cached,
                failed: progress.failed,
                error,
            },
            items: progress.items,
            failures: progress.failures,
            pool_exhausted,
        }
    }

    /// Listing walk plus sequential item processing. Progress is written
    /// into `progress` as it happens so a deadline keeps what was done.
    async fn crawl_source(
        &self,
        src: &SourceConfig,
        since: NaiveDate,
        progress: &mut SourceProgress,
    ) -> Result<(), Abort> {
        let listed = match self.fetcher.list_items(src, since).await {
            Ok(l) => l,
            Err(FetchError::Pool(e)) => return Err(Abort::Pool(e)),
            Err(e) => return Err(Abort::Fetch(e)),
        };
        progress.listed = listed.len();

        for entry in &listed {
            match self.process_item(src, entry).await.map_err(Abort::Pool)? {
                ItemOutcome::Analyzed(item) => {
                    counter!("crawl_items_total", "outcome" => "analyzed").increment(1);
                    progress.analyzed += 1;
                    progress.items.push(item);
                }
                ItemOutcome::Cached(item) => {
                    counter!("crawl_items_total", "outcome" => "cached").increment(1);
                    progress.cached += 1;
                    progress.items.push(item);
                }
                ItemOutcome::Failed(message) => {
                    counter!("crawl_items_total", "outcome" => "failed").increment(1);
                    progress.failed += 1;
                    progress.failures.push(SourceFailure {
                        source_id: src.id.clone(),
                        url: Some(entry.url.clone()),
                        message,
                    });
                }
            }
        }
        Ok(())
    }

    /// One item through gate, fetch, analysis and persistence. Only a pool
    /// failure escapes; everything else is an item-level outcome.
    async fn process_item(
        &self,
        src: &SourceConfig,
        entry: &ListedItem,
    ) -> Result<ItemOutcome, PoolError> {
        let url = entry.url.as_str();

        let existing = match self.gate.check(&src.id, url).await {
            Ok(GateDecision::Skip(item)) => {
                debug!(source = %src.id, %url, "already analyzed, reusing mentions");
                return Ok(self.cached(src, item).await);
            }
            Ok(GateDecision::Proceed { existing }) => existing,
            Err(e) => return Ok(store_failure(src, url, e)),
        };

        let body = match self.fetcher.fetch_body(url, src).await {
            Ok(b) => b,
            Err(FetchError::Pool(e)) => return Err(e),
            Err(e) => {
                warn!(source = %src.id, %url, error = %e, "item fetch failed");
                self.record_failed_fetch(src, entry, existing).await;
                return Ok(ItemOutcome::Failed(e.to_string()));
            }
        };

        let item = match self
            .writer
            .upsert_item(NewContentItem {
                source_id: src.id.clone(),
                url: entry.url.clone(),
                published: entry.published,
                body: body.clone(),
                status: ItemStatus::Fetched,
            })
            .await
        {
            Ok(Upserted::Inserted(item)) => item,
            Ok(Upserted::Existing(item)) if item.status == ItemStatus::Analyzed => {
                // a concurrent writer finished it first
                return Ok(self.cached(src, item).await);
            }
            Ok(Upserted::Existing(item)) => {
                match self
                    .writer
                    .mark(&item, ItemStatus::Fetched, Some(body.clone()), None)
                    .await
                {
                    Ok(item) => item,
                    Err(e) => return Ok(store_failure(src, url, e)),
                }
            }
            Err(e) => return Ok(store_failure(src, url, e)),
        };

        let hints = ContextHints::for_item(
            &self.registry,
            src.category,
            src.display_name(),
            item.published,
        );
        let analysis = match self.invoker.analyze(&body, src.category, &hints).await {
            Ok(a) => a,
            Err(e) => {
                warn!(source = %src.id, %url, error = %e, "analysis failed");
                if let Err(se) = self.writer.mark(&item, ItemStatus::Failed, None, None).await {
                    warn!(source = %src.id, %url, error = %se, "could not mark item failed");
                }
                return Ok(ItemOutcome::Failed(e.to_string()));
            }
        };

        let written = match self.writer.upsert_mentions(&item, &analysis.mentions).await {
            Ok(w) => w,
            Err(e) => return Ok(store_failure(src, url, e)),
        };
        let summary = Some(analysis.summary).filter(|s| !s.is_empty());
        let item = match self.writer.mark(&item, ItemStatus::Analyzed, None, summary).await {
            Ok(item) => item,
            Err(e) => return Ok(store_failure(src, url, e)),
        };
        debug!(
            source = %src.id,
            %url,
            inserted = written.inserted,
            unchanged = written.unchanged,
            "item analyzed"
        );

        Ok(match self.store.mentions_for_item(item.id).await {
            Ok(mentions) => ItemOutcome::Analyzed(analyzed_item(src, &item, false, mentions)),
            Err(e) => store_failure(src, url, e),
        })
    }

    async fn cached(&self, src: &SourceConfig, item: ContentItem) -> ItemOutcome {
        match self.store.mentions_for_item(item.id).await {
            Ok(mentions) => ItemOutcome::Cached(analyzed_item(src, &item, true, mentions)),
            Err(e) => store_failure(src, &item.url, e),
        }
    }

    async fn record_failed_fetch(
        &self,
        src: &SourceConfig,
        entry: &ListedItem,
        existing: Option<ContentItem>,
    ) {
        let result = match existing {
            Some(item) => self
                .writer
                .mark(&item, ItemStatus::Failed, None, None)
                .await
                .map(|_| ()),
            None => self
                .writer
                .upsert_item(NewContentItem {
                    source_id: src.id.clone(),
                    url: entry.url.clone(),
                    published: entry.published,
                    body: String::new(),
                    status: ItemStatus::Failed,
                })
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            warn!(source = %src.id, url = %entry.url, error = %e, "could not record failed item");
        }
    }
}

fn analyzed_item(
    src: &SourceConfig,
    item: &ContentItem,
    from_cache: bool,
    mentions: Vec<crate::model::EntityMention>,
) -> AnalyzedItem {
    AnalyzedItem {
        source_id: src.id.clone(),
        item_id: item.id,
        url: item.url.clone(),
        published: item.published,
        from_cache,
        mentions,
    }
}

fn store_failure(src: &SourceConfig, url: &str, e: StoreError) -> ItemOutcome {
    warn!(source = %src.id, %url, error = %e, "store operation failed");
    ItemOutcome::Failed(e.to_string())
}
