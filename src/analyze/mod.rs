// src/analyze/mod.rs
//! Analysis invoker: turns item text into a summary plus entity mentions
//! via the external inference model.
//!
//! Service failures (timeout, rate limit, unavailable) are retried with
//! backoff up to the policy ceiling. Unparseable output gets exactly one
//! stricter re-ask. Audit capture never fails the analysis.

pub mod ai_adapter;
pub mod audit;
pub mod parse;
pub mod prompts;

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::error::{AnalysisError, InferenceError};
use crate::model::{Category, MentionDraft};
use crate::registry::EntityRegistry;
use crate::retry::RetryPolicy;

pub use ai_adapter::{build_client_from_config, DynInferenceClient, InferenceClient, MockInference};
pub use audit::{AuditRecord, AuditSink, FileAuditSink, NoopAudit};
pub use prompts::ContextHints;

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub retry: RetryPolicy,
    pub max_input_chars: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(20),
                jitter: Duration::from_millis(500),
            },
            max_input_chars: 12_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub summary: String,
    pub mentions: Vec<MentionDraft>,
}

/// Cut `s` to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Initial,
    Strict,
}

impl Pass {
    fn as_str(self) -> &'static str {
        match self {
            Pass::Initial => "initial",
            Pass::Strict => "strict",
        }
    }
}

pub struct AnalysisInvoker {
    client: DynInferenceClient,
    registry: Arc<EntityRegistry>,
    audit: Arc<dyn AuditSink>,
    settings: AnalysisSettings,
}

impl AnalysisInvoker {
    pub fn new(
        client: DynInferenceClient,
        registry: Arc<EntityRegistry>,
        audit: Arc<dyn AuditSink>,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            client,
            registry,
            audit,
            settings,
        }
    }

    pub async fn analyze(
        &self,
        text: &str,
        category: Category,
        hints: &ContextHints,
    ) -> Result<Analysis, AnalysisError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AnalysisError::EmptyInput);
        }
        let text = truncate_chars(text, self.settings.max_input_chars);

        match self.exchange(text, category, hints, Pass::Initial).await {
            Err(AnalysisError::AnalysisParse { message, .. }) => {
                warn!(
                    category = category.as_str(),
                    error = %message,
                    "analysis output unparseable, re-asking with strict instructions"
                );
                counter!("analysis_reasks_total").increment(1);
                self.exchange(text, category, hints, Pass::Strict).await
            }
            other => other,
        }
    }

    /// One prompt/response round (with service retries) plus parsing.
    async fn exchange(
        &self,
        text: &str,
        category: Category,
        hints: &ContextHints,
        pass: Pass,
    ) -> Result<Analysis, AnalysisError> {
        let prompt = prompts::build_prompt(text, category, hints, pass == Pass::Strict);
        let mut record = AuditRecord::new(
            self.client.provider_name(),
            category.as_str(),
            pass.as_str(),
            &prompt,
        );

        let policy = &self.settings.retry;
        let max = policy.max_attempts.max(1);
        let mut attempt = 0;
        let raw = loop {
            attempt += 1;
            counter!("analysis_calls_total", "category" => category.as_str()).increment(1);
            match self.client.complete(&prompt).await {
                Ok(raw) => break raw,
                Err(InferenceError::MalformedOutput(message)) => {
                    record.attempts = attempt;
                    record.error = Some(message.clone());
                    self.capture(&record);
                    return Err(AnalysisError::AnalysisParse {
                        message,
                        preview: String::new(),
                    });
                }
                Err(e) if e.is_retryable() && attempt < max => {
                    let mut delay = policy.delay_for(attempt);
                    if let InferenceError::RateLimited {
                        retry_after: Some(ra),
                    } = &e
                    {
                        delay = delay.max((*ra).min(policy.max_delay));
                    }
                    counter!("analysis_retries_total").increment(1);
                    warn!(
                        category = category.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "inference call failed, backing off"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    record.attempts = attempt;
                    record.error = Some(e.to_string());
                    self.capture(&record);
                    return Err(AnalysisError::Service {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        };

        record.attempts = attempt;
        record.response = Some(&raw);
        self.capture(&record);

        let kind = category.entity_kind();
        match parse::parse_analysis(&raw, kind, &self.registry) {
            Ok(parsed) => {
                debug!(
                    category = category.as_str(),
                    mentions = parsed.mentions.len(),
                    dropped = parsed.dropped,
                    "analysis parsed"
                );
                Ok(Analysis {
                    summary: parsed.summary,
                    mentions: parsed.mentions,
                })
            }
            Err(message) => Err(AnalysisError::AnalysisParse {
                message,
                preview: truncate_chars(&raw, 200).to_string(),
            }),
        }
    }

    fn capture(&self, record: &AuditRecord<'_>) {
        if let Err(e) = self.audit.record(record) {
            warn!(error = %e, "audit capture failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("Lãi suất", 3), "Lãi");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 0), "");
    }
}
