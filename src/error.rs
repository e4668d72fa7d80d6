//! Error taxonomy shared across the crawler.
//!
//! Retryability is a property of the error, not of the call site: callers
//! ask [`FetchError::is_retryable`] / [`InferenceError::is_retryable`].

use std::time::Duration;
use thiserror::Error;

/// Resource pool failures.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Every construction tier failed; fatal for the current job.
    #[error("browser pool exhausted after trying {tiers} construction tiers (last error: {last_error})")]
    Exhausted { tiers: usize, last_error: String },

    #[error("browser pool is shut down")]
    Closed,
}

/// Page/document retrieval failures.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeouts, connection resets, 429/5xx. Retried with bounded backoff.
    #[error("transient network error for {url}: {message}")]
    TransientNetwork { url: String, message: String },

    /// 4xx, missing content, unusable documents. Not retried.
    #[error("fetch failed for {url}: {message}")]
    Permanent { url: String, message: String },

    /// A configured CSS locator does not compile.
    #[error("invalid extraction rule `{rule}`: {message}")]
    InvalidRule { rule: String, message: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl FetchError {
    pub fn transient(url: &str, message: impl Into<String>) -> Self {
        FetchError::TransientNetwork {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(url: &str, message: impl Into<String>) -> Self {
        FetchError::Permanent {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::TransientNetwork { .. })
    }

    /// Classify a reqwest failure (timeouts and connect errors are transient).
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            FetchError::transient(url, err.to_string())
        } else {
            FetchError::permanent(url, err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(url: &str, status: reqwest::StatusCode) -> Self {
        if status.as_u16() == 429 || status.is_server_error() {
            FetchError::transient(url, format!("HTTP {status}"))
        } else {
            FetchError::permanent(url, format!("HTTP {status}"))
        }
    }
}

/// Failure modes of the external inference collaborator.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("inference call timed out")]
    Timeout,

    #[error("inference provider rate-limited the call")]
    RateLimited { retry_after: Option<Duration> },

    #[error("inference provider unavailable: {0}")]
    Unavailable(String),

    #[error("inference request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The call succeeded but carried no usable text.
    #[error("inference provider returned malformed output: {0}")]
    MalformedOutput(String),

    #[error("inference is disabled")]
    Disabled,
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Timeout
                | InferenceError::RateLimited { .. }
                | InferenceError::Unavailable(_)
        )
    }
}

/// Analysis Invoker failures. Service and parse failures stay distinct.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis service failed after {attempts} attempt(s): {source}")]
    Service {
        attempts: u32,
        #[source]
        source: InferenceError,
    },

    /// Usable call, unusable output (already re-asked once).
    #[error("analysis output could not be parsed: {message}")]
    AnalysisParse { message: String, preview: String },

    #[error("nothing to analyze: item text is empty")]
    EmptyInput,
}

/// Persistent store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint fired under a racing writer; reconciled by re-read.
    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("item {0} not found")]
    NotFound(i64),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Run-level failure. Only pool exhaustion on every source escalates here.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("browser pool exhausted on every source: {0}")]
    PoolExhausted(String),
}
