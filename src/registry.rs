// src/registry.rs
//! Known entities: instrument symbols with their sector, the sector list and
//! macro topics. Used to build analysis hints, canonicalize names coming
//! back from the model and join sector/macro context.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::model::{EntityKind, EntityRef};

const ENV_PATH: &str = "ENTITIES_PATH";
const DEFAULT_PATH: &str = "config/entities.toml";

/// Minimum Jaro-Winkler similarity for snapping a free-form sector/topic
/// name onto a registered one.
const SNAP_THRESHOLD: f64 = 0.92;

static RE_SYMBOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9][A-Z0-9.\-]{0,11}$").expect("valid regex"));

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentEntry {
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    instruments: Vec<InstrumentEntry>,
    #[serde(default)]
    sectors: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    sector_by_symbol: HashMap<String, String>,
    symbols: Vec<String>,
    sectors: Vec<String>,
    topics: Vec<String>,
}

impl EntityRegistry {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(s).context("parsing entity registry")?;
        Ok(Self::from_file(file))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading entity registry from {}", path.display()))?;
        Self::from_toml_str(&s)
    }

    /// `$ENTITIES_PATH`, then `config/entities.toml`, else an empty registry.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            return Self::load_from(&PathBuf::from(p));
        }
        let p = PathBuf::from(DEFAULT_PATH);
        if p.exists() {
            return Self::load_from(&p);
        }
        tracing::warn!("no entity registry found, continuing with an empty one");
        Ok(Self::default())
    }

    fn from_file(file: RegistryFile) -> Self {
        let norm = |s: &str| EntityRef::new(EntityKind::Sector, s).name;
        let mut sectors: Vec<String> = file.sectors.iter().map(|s| norm(s)).collect();
        let mut sector_by_symbol = HashMap::new();
        let mut symbols = Vec::new();
        for inst in file.instruments {
            let sym = EntityRef::new(EntityKind::Instrument, &inst.symbol).name;
            if sym.is_empty() {
                continue;
            }
            if let Some(sector) = inst.sector.as_deref().map(norm).filter(|s| !s.is_empty()) {
                if !sectors.contains(&sector) {
                    sectors.push(sector.clone());
                }
                sector_by_symbol.insert(sym.clone(), sector);
            }
            symbols.push(sym);
        }
        symbols.sort();
        symbols.dedup();
        sectors.sort();
        sectors.dedup();
        let mut topics: Vec<String> = file
            .topics
            .iter()
            .map(|t| EntityRef::new(EntityKind::Topic, t).name)
            .filter(|t| !t.is_empty())
            .collect();
        topics.sort();
        topics.dedup();
        Self {
            sector_by_symbol,
            symbols,
            sectors,
            topics,
        }
    }

    /// Sector of an instrument, if registered.
    pub fn sector_of(&self, symbol: &str) -> Option<&str> {
        self.sector_by_symbol
            .get(&symbol.trim().to_uppercase())
            .map(String::as_str)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn sectors(&self) -> &[String] {
        &self.sectors
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Symbol → sector pairs, sorted by symbol.
    pub fn instrument_sectors(&self) -> Vec<(&str, &str)> {
        let mut v: Vec<_> = self
            .sector_by_symbol
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        v.sort();
        v
    }

    /// Map a raw model-produced name onto a canonical entity.
    ///
    /// Instruments must look like a ticker; sector and topic names are
    /// snapped to the closest registered name when similar enough.
    pub fn canonicalize(&self, kind: EntityKind, raw: &str) -> Option<EntityRef> {
        let candidate = EntityRef::new(kind, raw);
        if candidate.name.is_empty() {
            return None;
        }
        match kind {
            EntityKind::Instrument => RE_SYMBOL.is_match(&candidate.name).then_some(candidate),
            EntityKind::Sector => Some(snap(candidate, &self.sectors)),
            EntityKind::Topic => Some(snap(candidate, &self.topics)),
        }
    }
}

fn snap(candidate: EntityRef, known: &[String]) -> EntityRef {
    if known.iter().any(|k| *k == candidate.name) {
        return candidate;
    }
    let best = known
        .iter()
        .map(|k| (k, strsim::jaro_winkler(k, &candidate.name)))
        .filter(|(_, score)| *score >= SNAP_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1));
    match best {
        Some((k, _)) => EntityRef {
            kind: candidate.kind,
            name: k.clone(),
        },
        None => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        sectors = ["Banking", "Real Estate"]
        topics = ["interest rates", "inflation"]

        [[instruments]]
        symbol = "acb"
        sector = "banking"

        [[instruments]]
        symbol = "VHM"
        name = "Vinhomes"
        sector = "Real  estate"

        [[instruments]]
        symbol = "FPT"
        sector = "Technology"
    "#;

    #[test]
    fn loads_and_normalizes() {
        let r = EntityRegistry::from_toml_str(SAMPLE).unwrap();
        assert_eq!(r.sector_of("ACB"), Some("banking"));
        assert_eq!(r.sector_of("vhm"), Some("real estate"));
        assert_eq!(r.sectors(), &["banking", "real estate", "technology"]);
        assert_eq!(r.symbols(), &["ACB", "FPT", "VHM"]);
    }

    #[test]
    fn canonicalize_snaps_and_validates() {
        let r = EntityRegistry::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            r.canonicalize(EntityKind::Instrument, " acb ").map(|e| e.id()),
            Some("instrument:ACB".to_string())
        );
        assert!(r.canonicalize(EntityKind::Instrument, "Asia Commercial Bank").is_none());
        assert_eq!(
            r.canonicalize(EntityKind::Sector, "Banking ").unwrap().name,
            "banking"
        );
        assert_eq!(
            r.canonicalize(EntityKind::Topic, "interest rate").unwrap().name,
            "interest rates"
        );
        // unknown names pass through normalized
        assert_eq!(
            r.canonicalize(EntityKind::Topic, "Oil Prices").unwrap().name,
            "oil prices"
        );
    }
}
