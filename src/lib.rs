// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod ai_bootstrap;
pub mod analyze;
pub mod api;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod history;
pub mod metrics;
pub mod model;
pub mod persist;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::error::{AnalysisError, FetchError, PoolError, RunError, StoreError};
pub use crate::model::{Category, ContentKind, SourceConfig};
pub use crate::pipeline::{Pipeline, PipelineContext, RunReport, RunSettings, SourceStatus};

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::analyze::{AuditSink, FileAuditSink, NoopAudit};
use crate::config::Settings;
use crate::fetch::DocumentFetcher;
use crate::history::RunHistory;
use crate::pool::{browser::factories_from, BrowserPool};
use crate::registry::EntityRegistry;

/// Wire every collaborator from configuration files and env.
///
/// Call after tracing init; the AI quick probe only logs its result.
pub async fn build_state(settings: &Settings) -> anyhow::Result<AppState> {
    let sources = config::load_sources_default().context("loading source definitions")?;
    let registry = EntityRegistry::load_default().context("loading entity registry")?;
    let ai = ai_bootstrap::AiRuntime::load_default().context("loading AI config")?;
    ai.quick_probe().await;

    let store = store::open_store(&settings.storage.database_path)
        .with_context(|| format!("opening store at {}", settings.storage.database_path))?;

    let factories = factories_from(&settings.browser);
    let tiers: Vec<&str> = factories.iter().map(|f| f.tier()).collect();
    info!(?tiers, size = settings.pool.size, "browser pool configured");
    let pool = BrowserPool::new(settings.pool_config(), factories);

    let documents = DocumentFetcher::new(&settings.browser.user_agent, settings.document_timeout())?;
    let audit: Arc<dyn AuditSink> = match settings.storage.audit_dir.as_deref() {
        Some(dir) if !dir.trim().is_empty() => Arc::new(FileAuditSink::new(dir)),
        _ => Arc::new(NoopAudit),
    };

    let pipeline = Pipeline::new(PipelineContext {
        pool,
        store,
        inference: ai.client.clone(),
        audit,
        registry: Arc::new(registry),
        documents,
        settings: settings.run_settings(ai.cfg.max_input_chars),
    });

    info!(
        sources = sources.len(),
        active = sources.iter().filter(|s| s.active).count(),
        "crawler state ready"
    );

    Ok(AppState {
        pipeline: Arc::new(pipeline),
        history: Arc::new(RunHistory::with_capacity(settings.run.history_capacity)),
        default_sources: Arc::new(sources),
        default_lookback_days: settings.run.default_lookback_days,
    })
}
