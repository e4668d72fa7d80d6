//! Inference adapter: provider abstraction for the analysis model.
//! The invoker only sees `complete(prompt) -> raw text`; parsing and
//! retries live one level up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ai::AiConfig;
use crate::error::InferenceError;

// ------------------------------------------------------------
// Public surface
// ------------------------------------------------------------

#[async_trait::async_trait]
pub trait InferenceClient: Send + Sync {
    /// Send one prompt, get the model's raw text back.
    async fn complete(&self, prompt: &str) -> Result<String, InferenceError>;
    /// Provider name for diagnostics/audit records.
    fn provider_name(&self) -> &'static str;
}

/// Convenient alias used by callers.
pub type DynInferenceClient = Arc<dyn InferenceClient>;

/// Factory: build a client according to config and environment variables.
///
/// * If `AI_TEST_MODE=mock`, returns a deterministic mock client.
/// * Else if `config.enabled==false`, returns a disabled client.
/// * Else builds the real provider.
pub fn build_client_from_config(config: &AiConfig) -> anyhow::Result<DynInferenceClient> {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Ok(Arc::new(MockInference::fixed(MOCK_RESPONSE)));
    }

    if !config.enabled {
        return Ok(Arc::new(DisabledClient));
    }

    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        other => {
            tracing::warn!(provider = other, "unsupported AI provider, analysis disabled");
            Ok(Arc::new(DisabledClient))
        }
    }
}

const MOCK_RESPONSE: &str = r#"{"summary": "Mock analysis (AI_TEST_MODE=mock).", "mentions": []}"#;

// ------------------------------------------------------------
// OpenAI-compatible provider
// ------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You are a financial news analyst. You read one article at a time and report entity-level market sentiment. Reply with a single JSON object and nothing else.";

/// OpenAI provider (Chat Completions API, or any compatible endpoint).
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    json_mode: bool,
}

impl OpenAiProvider {
    pub fn new(cfg: &AiConfig) -> anyhow::Result<Self> {
        let api_key = if cfg.api_key.is_empty() {
            std::env::var("OPENAI_API_KEY").unwrap_or_default()
        } else {
            cfg.api_key.clone()
        };
        let http = reqwest::Client::builder()
            .user_agent("market-sentiment-crawler/0.1")
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_key,
            model: cfg.model.clone(),
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            json_mode: cfg.json_mode,
        })
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}
#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}
#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}
#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}
#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait::async_trait]
impl InferenceClient for OpenAiProvider {
    async fn complete(&self, prompt: &str) -> Result<String, InferenceError> {
        if self.api_key.is_empty() {
            return Err(InferenceError::Rejected {
                status: 401,
                message: "missing API key".into(),
            });
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.2,
            response_format: self
                .json_mode
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout
                } else {
                    InferenceError::Unavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(InferenceError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(InferenceError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Rejected {
                status: status.as_u16(),
                message: message.chars().take(300).collect(),
            });
        }

        let body: Resp = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout
            } else {
                InferenceError::MalformedOutput(e.to_string())
            }
        })?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(InferenceError::MalformedOutput("empty completion".into()));
        }
        Ok(content)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

// ------------------------------------------------------------
// Disabled + mock clients
// ------------------------------------------------------------

/// Always fails with `Disabled`; used when AI is turned off.
pub struct DisabledClient;

#[async_trait::async_trait]
impl InferenceClient for DisabledClient {
    async fn complete(&self, _prompt: &str) -> Result<String, InferenceError> {
        Err(InferenceError::Disabled)
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

type Responder = Box<dyn Fn(&str) -> Result<String, InferenceError> + Send + Sync>;

/// Deterministic client for tests/local runs. Either answers every prompt
/// through a function, or replays a script of responses in order.
pub struct MockInference {
    responder: Responder,
    script: Mutex<Vec<Result<String, InferenceError>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockInference {
    pub fn new(f: impl Fn(&str) -> Result<String, InferenceError> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(f),
            script: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Replay `responses` in order; afterwards fall back to `fallback`.
    pub fn scripted(
        responses: Vec<Result<String, InferenceError>>,
        fallback: impl Fn(&str) -> Result<String, InferenceError> + Send + Sync + 'static,
    ) -> Self {
        let mock = Self::new(fallback);
        {
            let mut s = mock.script.lock().expect("mock script mutex poisoned");
            *s = responses.into_iter().rev().collect();
        }
        mock
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock prompts mutex poisoned").clone()
    }
}

#[async_trait::async_trait]
impl InferenceClient for MockInference {
    async fn complete(&self, prompt: &str) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("mock prompts mutex poisoned")
            .push(prompt.to_string());
        let scripted = self.script.lock().expect("mock script mutex poisoned").pop();
        match scripted {
            Some(r) => r,
            None => (self.responder)(prompt),
        }
    }
    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[serial_test::serial]
    #[test]
    fn factory_respects_test_mode_and_enabled_flag() {
        std::env::set_var("AI_TEST_MODE", "mock");
        let c = build_client_from_config(&AiConfig::default()).unwrap();
        assert_eq!(c.provider_name(), "mock");

        std::env::remove_var("AI_TEST_MODE");
        let c = build_client_from_config(&AiConfig::default()).unwrap();
        assert_eq!(c.provider_name(), "disabled");

        let cfg = AiConfig {
            enabled: true,
            provider: "claude".into(),
            ..AiConfig::default()
        };
        assert_eq!(build_client_from_config(&cfg).unwrap().provider_name(), "disabled");
    }

    #[tokio::test]
    async fn scripted_mock_replays_then_falls_back() {
        let m = MockInference::scripted(
            vec![Err(InferenceError::Timeout), Ok("first".into())],
            |_| Ok("rest".into()),
        );
        assert!(matches!(m.complete("a").await, Err(InferenceError::Timeout)));
        assert_eq!(m.complete("b").await.unwrap(), "first");
        assert_eq!(m.complete("c").await.unwrap(), "rest");
        assert_eq!(m.calls(), 3);
        assert_eq!(m.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn missing_key_is_rejected_without_network() {
        let cfg = AiConfig {
            enabled: true,
            api_key: String::new(),
            ..AiConfig::default()
        };
        let p = OpenAiProvider {
            api_key: String::new(),
            ..OpenAiProvider::new(&cfg).unwrap()
        };
        assert!(matches!(
            p.complete("x").await,
            Err(InferenceError::Rejected { status: 401, .. })
        ));
    }
}
