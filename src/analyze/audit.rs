// src/analyze/audit.rs
//! Prompt/response capture. Best effort: a failing sink is logged and
//! never fails the analysis.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize)]
pub struct AuditRecord<'a> {
    pub ts: String,
    pub provider: &'a str,
    pub category: &'a str,
    /// "initial" or "strict"
    pub pass: &'a str,
    pub attempts: u32,
    pub prompt_sha256: String,
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<'a> AuditRecord<'a> {
    pub fn new(provider: &'a str, category: &'a str, pass: &'a str, prompt: &'a str) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            provider,
            category,
            pass,
            attempts: 0,
            prompt_sha256: prompt_digest(prompt),
            prompt,
            response: None,
            error: None,
        }
    }
}

pub fn prompt_digest(prompt: &str) -> String {
    let mut h = Sha256::new();
    h.update(prompt.as_bytes());
    format!("{:x}", h.finalize())
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord<'_>) -> io::Result<()>;
}

/// Discards everything.
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _record: &AuditRecord<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// One JSON file per exchange under `dir`, written via tmp + rename.
pub struct FileAuditSink {
    dir: PathBuf,
    seq: AtomicU64,
}

impl FileAuditSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let _ = fs::create_dir_all(&dir); // best-effort
        Self {
            dir,
            seq: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, record: &AuditRecord<'_>) -> io::Result<()> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let name = format!(
            "{stamp}_{n:05}_{}_{}.json",
            record.category,
            &record.prompt_sha256[..12]
        );
        let path = self.dir.join(name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&json)?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}
