// src/ai_bootstrap.rs
use crate::analyze::ai_adapter::{build_client_from_config, DynInferenceClient};
use crate::config::ai::{AiConfig, DEFAULT_AI_CONFIG_PATH};
use tracing::{info, warn};

pub struct AiRuntime {
    pub cfg: AiConfig,
    pub client: DynInferenceClient,
}

impl AiRuntime {
    pub fn from_config(cfg: AiConfig) -> anyhow::Result<Self> {
        // Safe diagnostics: only provider + enabled + key length
        info!(
            provider = %cfg.provider,
            model = %cfg.model,
            enabled = cfg.enabled,
            key_len = cfg.api_key.len(),
            "AI config loaded"
        );
        let client = build_client_from_config(&cfg)?;
        Ok(Self { cfg, client })
    }

    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        Self::from_config(AiConfig::load_from_file(path)?)
    }

    /// `$AI_CONFIG_PATH` or `config/ai.json`; a missing file means disabled.
    pub fn load_default() -> anyhow::Result<Self> {
        let path = std::env::var("AI_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_AI_CONFIG_PATH.to_string());
        Self::from_config(AiConfig::load_or_default(&path)?)
    }

    /// One tiny completion to surface key/endpoint problems at boot. Never fails.
    pub async fn quick_probe(&self) {
        if !self.cfg.enabled {
            warn!("AI quick_probe skipped: AI is disabled in config");
            return;
        }
        let sample = "Reply with the JSON object {\"ok\": true} and nothing else.";
        match self.client.complete(sample).await {
            Ok(out) => info!(provider = self.client.provider_name(), chars = out.len(), "AI quick_probe ok"),
            Err(e) => warn!(provider = self.client.provider_name(), error = %e, "AI quick_probe failed"),
        }
    }
}
