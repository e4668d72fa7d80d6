// src/config/sources.rs
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::SourceConfig;

const ENV_PATH: &str = "SOURCES_PATH";

/// Load source definitions from an explicit path. Supports TOML or JSON formats.
pub fn load_sources_from(path: &Path) -> Result<Vec<SourceConfig>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let sources = parse_sources(&content, ext.as_str())
        .with_context(|| format!("parsing sources from {}", path.display()))?;
    validate(&sources)?;
    Ok(sources)
}

/// Load sources using env var + fallbacks:
/// 1) $SOURCES_PATH
/// 2) config/sources.toml
/// 3) config/sources.json
pub fn load_sources_default() -> Result<Vec<SourceConfig>> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_sources_from(&pb);
        } else {
            return Err(anyhow!("SOURCES_PATH points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/sources.toml");
    if toml_p.exists() {
        return load_sources_from(&toml_p);
    }
    let json_p = PathBuf::from("config/sources.json");
    if json_p.exists() {
        return load_sources_from(&json_p);
    }
    Ok(Vec::new())
}

fn parse_sources(s: &str, hint_ext: &str) -> Result<Vec<SourceConfig>> {
    if hint_ext == "json" || s.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(s)?);
    }

    #[derive(serde::Deserialize)]
    struct TomlSources {
        #[serde(default)]
        sources: Vec<SourceConfig>,
    }
    let v: TomlSources = toml::from_str(s)?;
    Ok(v.sources)
}

/// Ids must be non-empty and unique; every `base_url` must parse.
pub fn validate(sources: &[SourceConfig]) -> Result<()> {
    let mut ids = HashSet::new();
    for s in sources {
        if s.id.trim().is_empty() {
            bail!("source with base_url {} has an empty id", s.base_url);
        }
        if !ids.insert(s.id.as_str()) {
            bail!("duplicate source id `{}`", s.id);
        }
        url::Url::parse(&s.base_url)
            .with_context(|| format!("source `{}` has an invalid base_url", s.id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, ContentKind};
    use std::{env, fs};

    const TOML: &str = r#"
[[sources]]
id = "cafef-stocks"
name = "CafeF stocks"
base_url = "https://cafef.example/thi-truong-chung-khoan.chn"
listing_item_rule = "div.tlitem"
content_rule = "div.detail-content"
date_rule = "span.time"
pagination_rule = "/trang-<page>.chn"
category = "instrument"

[[sources]]
id = "ssi-reports"
base_url = "https://ssi.example/reports"
listing_item_rule = "li.report"
content_rule = "a.download"
date_rule = "span.date"
category = "sector"
content_kind = "linked_document"
active = false
"#;

    #[test]
    fn toml_and_json_formats_work() {
        let v = parse_sources(TOML, "toml").unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].category, Category::Instrument);
        assert_eq!(v[0].pagination_rule.as_deref(), Some("/trang-<page>.chn"));
        assert_eq!(v[1].content_kind, ContentKind::LinkedDocument);
        assert!(!v[1].active);

        let json = r#"[{"id":"vn","base_url":"https://vn.example/macro","listing_item_rule":"article",
            "content_rule":"div.body","date_rule":"time","category":"macro"}]"#;
        let v = parse_sources(json, "json").unwrap();
        assert_eq!(v[0].category, Category::Macro);
        assert!(v[0].active);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut v = parse_sources(TOML, "toml").unwrap();
        v[1].id = v[0].id.clone();
        let err = validate(&v).unwrap_err().to_string();
        assert!(err.contains("duplicate source id"));
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_PATH);

        assert!(load_sources_default().unwrap().is_empty());

        fs::create_dir_all("config").unwrap();
        fs::write("config/sources.toml", TOML).unwrap();
        assert_eq!(load_sources_default().unwrap().len(), 2);

        let custom = tmp.path().join("custom.json");
        fs::write(
            &custom,
            r#"[{"id":"x","base_url":"https://x.example/","listing_item_rule":"a",
                "content_rule":"p","date_rule":"time","category":"macro"}]"#,
        )
        .unwrap();
        env::set_var(ENV_PATH, &custom);
        assert_eq!(load_sources_default().unwrap()[0].id, "x");

        env::set_var(ENV_PATH, tmp.path().join("missing.toml"));
        assert!(load_sources_default().is_err());

        env::remove_var(ENV_PATH);
        env::set_current_dir(old).unwrap();
    }
}
