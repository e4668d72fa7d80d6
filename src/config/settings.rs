// src/config/settings.rs
//! Crawler settings (`config/crawler.toml`) with env overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::aggregate::ContextWindows;
use crate::analyze::AnalysisSettings;
use crate::fetch::{FetchSettings, MIN_BODY_CHARS};
use crate::pipeline::RunSettings;
use crate::pool::browser::BrowserSettings;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;

pub const DEFAULT_SETTINGS_PATH: &str = "config/crawler.toml";
const ENV_PATH: &str = "CRAWLER_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub size: usize,
    pub launch_attempts_per_tier: u32,
    pub launch_backoff_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: 3,
            launch_attempts_per_tier: 2,
            launch_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub workers: usize,
    pub run_timeout_secs: u64,
    /// Used by `POST /runs` when the request omits `lookback_days`.
    pub default_lookback_days: u32,
    pub sector_window_days: u32,
    pub macro_window_days: u32,
    /// Capacity of the in-memory run history.
    pub history_capacity: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            workers: 3,
            run_timeout_secs: 30 * 60,
            default_lookback_days: 3,
            sector_window_days: 7,
            macro_window_days: 3,
            history_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub max_pages: u32,
    pub page_delay_ms: u64,
    pub min_body_chars: usize,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub document_timeout_secs: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            max_pages: 10,
            page_delay_ms: 1_500,
            min_body_chars: MIN_BODY_CHARS,
            retry_attempts: 3,
            retry_base_ms: 2_000,
            document_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            retry_attempts: 4,
            retry_base_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// SQLite file path, or `:memory:`.
    pub database_path: String,
    /// Prompt/response capture directory; unset disables capture.
    pub audit_dir: Option<String>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: "data/crawler.db".into(),
            audit_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolSection,
    pub run: RunSection,
    pub fetch: FetchSection,
    pub analysis: AnalysisSection,
    pub storage: StorageSection,
    pub browser: BrowserSettings,
}

impl Settings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing settings from {}", path.display()))
    }

    /// `$CRAWLER_CONFIG_PATH`, else `config/crawler.toml`, else defaults;
    /// env overrides applied last.
    pub fn load_default() -> Result<Self> {
        let path = env::var(ENV_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH));
        let mut s = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
            Self::default()
        };
        s.apply_env_overrides()?;
        Ok(s)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<usize>("POOL_SIZE")? {
            self.pool.size = v;
        }
        if let Some(v) = env_parse::<usize>("WORKERS")? {
            self.run.workers = v;
        }
        if let Some(v) = env_parse::<u64>("RUN_TIMEOUT_SECS")? {
            self.run.run_timeout_secs = v;
        }
        if let Some(v) = env_string("DATABASE_PATH") {
            self.storage.database_path = v;
        }
        if let Some(v) = env_string("BROWSERLESS_URL") {
            self.browser.browserless_url = Some(v);
        }
        if let Some(v) = env_string("BROWSERLESS_TOKEN") {
            self.browser.browserless_token = Some(v);
        }
        if let Some(v) = env_string("CHROME_BIN") {
            self.browser.chrome_bin = v;
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool.size.max(1),
            launch_attempts_per_tier: self.pool.launch_attempts_per_tier.max(1),
            launch_backoff: Duration::from_millis(self.pool.launch_backoff_ms),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        let base = Duration::from_millis(self.fetch.retry_base_ms);
        FetchSettings {
            max_pages: self.fetch.max_pages.max(1),
            page_delay: Duration::from_millis(self.fetch.page_delay_ms),
            min_body_chars: self.fetch.min_body_chars,
            retry: RetryPolicy {
                max_attempts: self.fetch.retry_attempts.max(1),
                base_delay: base,
                ..RetryPolicy::default()
            },
        }
    }

    /// `max_input_chars` comes from the AI config.
    pub fn run_settings(&self, max_input_chars: usize) -> RunSettings {
        let analysis_defaults = AnalysisSettings::default();
        RunSettings {
            workers: self.run.workers.max(1),
            run_timeout: Duration::from_secs(self.run.run_timeout_secs.max(1)),
            fetch: self.fetch_settings(),
            analysis: AnalysisSettings {
                retry: RetryPolicy {
                    max_attempts: self.analysis.retry_attempts.max(1),
                    base_delay: Duration::from_millis(self.analysis.retry_base_ms),
                    ..analysis_defaults.retry
                },
                max_input_chars,
            },
            windows: ContextWindows {
                sector_days: self.run.sector_window_days.max(1),
                macro_days: self.run.macro_window_days.max(1),
            },
        }
    }

    pub fn document_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.document_timeout_secs.max(1))
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(key) {
        Some(v) => Ok(Some(
            v.trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}={v}"))?,
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let s = Settings::from_toml_str(
            r#"
            [pool]
            size = 5

            [run]
            sector_window_days = 14

            [browser]
            tiers = ["http"]
            "#,
        )
        .unwrap();
        assert_eq!(s.pool.size, 5);
        assert_eq!(s.pool.launch_attempts_per_tier, 2);
        assert_eq!(s.run.workers, 3);
        assert_eq!(s.browser.tiers, vec!["http"]);

        let run = s.run_settings(8_000);
        assert_eq!(run.windows.sector_days, 14);
        assert_eq!(run.windows.macro_days, 3);
        assert_eq!(run.analysis.max_input_chars, 8_000);
        assert_eq!(run.fetch.max_pages, 10);
    }

    #[serial_test::serial]
    #[test]
    fn env_overrides_win() {
        env::set_var("POOL_SIZE", "7");
        env::set_var("DATABASE_PATH", ":memory:");
        env::set_var("BROWSERLESS_URL", "http://browserless:3000");
        let mut s = Settings::default();
        s.apply_env_overrides().unwrap();
        assert_eq!(s.pool_config().size, 7);
        assert_eq!(s.storage.database_path, ":memory:");
        assert_eq!(s.browser.browserless_url.as_deref(), Some("http://browserless:3000"));

        env::set_var("POOL_SIZE", "many");
        assert!(Settings::default().apply_env_overrides().is_err());

        env::remove_var("POOL_SIZE");
        env::remove_var("DATABASE_PATH");
        env::remove_var("BROWSERLESS_URL");
    }
}
