//! history.rs: bounded in-memory log of run summaries, served on `/runs/recent`.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::pipeline::{RunReport, SourceStatus};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ts_unix: u64,
    pub lookback_days: u32,
    pub sources_requested: usize,
    pub ok: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub entities: usize,
    // short fingerprint of the ranking for quick diagnostics
    pub top_entities: Vec<String>, // e.g. ["instrument:ACB", "sector:banking"]
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RunHistory {
    inner: Mutex<Vec<RunSummary>>,
    cap: usize,
}

impl RunHistory {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::with_capacity(cap.min(10_000))),
            cap: cap.clamp(1, 10_000),
        }
    }

    pub fn push(&self, r: &RunReport) {
        self.push_summary(RunSummary {
            ts_unix: now_unix(),
            lookback_days: r.lookback_days,
            sources_requested: r.sources.len(),
            ok: r.count(SourceStatus::Ok),
            partial: r.count(SourceStatus::Partial),
            failed: r.count(SourceStatus::Failed),
            skipped: r.count(SourceStatus::Skipped),
            entities: r.entities.len(),
            top_entities: r.entities.iter().take(3).map(|e| e.entity_id.clone()).collect(),
            duration_ms: r.duration_ms,
            error: None,
        });
    }

    /// Record a run that failed as a whole.
    pub fn push_failure(&self, sources_requested: usize, lookback_days: u32, error: &str) {
        self.push_summary(RunSummary {
            ts_unix: now_unix(),
            lookback_days,
            sources_requested,
            ok: 0,
            partial: 0,
            failed: sources_requested,
            skipped: 0,
            entities: 0,
            top_entities: Vec::new(),
            duration_ms: 0,
            error: Some(error.to_string()),
        });
    }

    fn push_summary(&self, entry: RunSummary) {
        let mut v = self.inner.lock().expect("history mutex poisoned");
        v.push(entry);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
    }

    pub fn snapshot_last_n(&self, n: usize) -> Vec<RunSummary> {
        let v = self.inner.lock().expect("history mutex poisoned");
        let len = v.len();
        let start = len.saturating_sub(n);
        v[start..].to_vec()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
