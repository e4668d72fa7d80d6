// src/analyze/parse.rs
//! Tolerant parsing of model output into mentions.

use serde::Deserialize;
use serde_json::Value;

use crate::model::{EntityKind, MentionDraft, Sentiment};
use crate::registry::EntityRegistry;

/// Parsed analysis before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnalysis {
    pub summary: String,
    pub mentions: Vec<MentionDraft>,
    /// Entries dropped for an empty name or unknown label.
    pub dropped: usize,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "mentioned_stocks", alias = "entities")]
    mentions: Vec<RawMention>,
}

#[derive(Debug, Deserialize)]
struct RawMention {
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sentiment: String,
    #[serde(default, alias = "reason")]
    rationale: String,
    #[serde(default)]
    details: Option<Value>,
}

impl RawMention {
    /// First non-empty of `entity`, `symbol`, `name`.
    fn label(&self) -> &str {
        [&self.entity, &self.symbol, &self.name]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or("")
    }
}

/// Strip markdown fences and surrounding prose; return the first JSON
/// object, or array of objects, found in the text.
pub fn extract_json_payload(raw: &str) -> Option<&str> {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // drop the language tag line (```json)
        s = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
        if let Some(end) = s.rfind("```") {
            s = &s[..end];
        }
        s = s.trim();
    }

    for (start, _) in s.match_indices(['{', '[']) {
        let mut stream = serde_json::Deserializer::from_str(&s[start..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            let usable = match &value {
                Value::Object(_) => true,
                Value::Array(items) => items.iter().all(Value::is_object),
                _ => false,
            };
            if usable {
                return Some(&s[start..start + stream.byte_offset()]);
            }
        }
    }
    None
}

/// Parse raw model text. Errors describe why nothing usable was found.
pub fn parse_analysis(
    raw: &str,
    kind: EntityKind,
    registry: &EntityRegistry,
) -> Result<ParsedAnalysis, String> {
    let payload = extract_json_payload(raw).ok_or_else(|| "no JSON object in response".to_string())?;
    let value: Value = serde_json::from_str(payload).map_err(|e| format!("invalid JSON: {e}"))?;

    let parsed: RawAnalysis = match value {
        // bare list of mentions
        Value::Array(_) => RawAnalysis {
            summary: String::new(),
            mentions: serde_json::from_value(value).map_err(|e| format!("bad mention list: {e}"))?,
        },
        Value::Object(_) => {
            serde_json::from_value(value).map_err(|e| format!("unexpected JSON shape: {e}"))?
        }
        other => return Err(format!("expected object, got {other}")),
    };

    let mut mentions = Vec::with_capacity(parsed.mentions.len());
    let mut dropped = 0usize;
    for m in parsed.mentions {
        let entity = registry.canonicalize(kind, m.label());
        let sentiment = Sentiment::parse(&m.sentiment);
        match (entity, sentiment) {
            (Some(entity), Some(sentiment)) => mentions.push(MentionDraft {
                entity,
                sentiment,
                rationale: m.rationale.trim().to_string(),
                details: m.details.filter(|d| !d.is_null()),
            }),
            _ => {
                tracing::warn!(
                    entity = %m.label(),
                    sentiment = %m.sentiment,
                    "dropping mention with unusable entity or sentiment"
                );
                dropped += 1;
            }
        }
    }

    Ok(ParsedAnalysis {
        summary: parsed.summary.trim().to_string(),
        mentions,
        dropped,
    })
}
