// src/analyze/prompts.rs
//! Category-specific prompt construction.

use chrono::NaiveDate;

use crate::model::Category;
use crate::registry::EntityRegistry;

/// At most this many known names are listed in a prompt.
const MAX_HINT_NAMES: usize = 120;

/// Context handed to the model alongside the item text.
#[derive(Debug, Clone, Default)]
pub struct ContextHints {
    pub source_name: String,
    pub published: Option<NaiveDate>,
    /// Known entity names for the category (sectors, topics or symbols).
    pub known_entities: Vec<String>,
    /// `SYMBOL: sector` lines, instrument prompts only.
    pub instrument_sectors: Vec<String>,
}

impl ContextHints {
    pub fn for_item(
        registry: &EntityRegistry,
        category: Category,
        source_name: &str,
        published: NaiveDate,
    ) -> Self {
        let (known_entities, instrument_sectors) = match category {
            Category::Instrument => (
                registry.symbols().iter().take(MAX_HINT_NAMES).cloned().collect(),
                registry
                    .instrument_sectors()
                    .into_iter()
                    .take(MAX_HINT_NAMES)
                    .map(|(s, sec)| format!("{s}: {sec}"))
                    .collect(),
            ),
            Category::Sector => (registry.sectors().to_vec(), Vec::new()),
            Category::Macro => (registry.topics().to_vec(), Vec::new()),
        };
        Self {
            source_name: source_name.to_string(),
            published: Some(published),
            known_entities,
            instrument_sectors,
        }
    }
}

struct PromptSpec {
    role: &'static str,
    task: &'static str,
    entity_rule: &'static str,
    schema: &'static str,
}

const INSTRUMENT: PromptSpec = PromptSpec {
    role: "You analyze stock market news about individual listed companies.",
    task: "Identify every listed stock the article says something material about and judge the article's sentiment toward each one.",
    entity_rule: "Use the exchange ticker symbol (e.g. ACB, VCB, FPT) as the entity. Only include real ticker symbols, never company names or indices.",
    schema: r#"{
  "summary": "<two or three sentence summary of the article>",
  "mentions": [
    {
      "entity": "<TICKER>",
      "sentiment": "positive | neutral | negative",
      "rationale": "<one sentence explaining the sentiment>",
      "details": {"price_target": null, "recommendation": null}
    }
  ]
}"#,
};

const SECTOR: PromptSpec = PromptSpec {
    role: "You analyze industry and sector reports.",
    task: "Identify the industry sectors the article discusses and judge the outlook it gives for each.",
    entity_rule: "Use a short sector name (e.g. banking, real estate, steel). Prefer the known sector names when they fit.",
    schema: r#"{
  "summary": "<two or three sentence summary of the article>",
  "mentions": [
    {
      "entity": "<sector name>",
      "sentiment": "positive | neutral | negative",
      "rationale": "<one sentence explaining the outlook>",
      "details": {"drivers": [], "risks": []}
    }
  ]
}"#,
};

const MACRO: PromptSpec = PromptSpec {
    role: "You analyze macroeconomic news and policy commentary.",
    task: "Identify the macroeconomic topics the article covers and judge whether each is a tailwind or headwind for the equity market.",
    entity_rule: "Use a short topic name (e.g. interest rates, inflation, exchange rate, public investment). Prefer the known topic names when they fit.",
    schema: r#"{
  "summary": "<two or three sentence summary of the article>",
  "mentions": [
    {
      "entity": "<topic>",
      "sentiment": "positive | neutral | negative",
      "rationale": "<one sentence on the market impact>",
      "details": {"indicators": []}
    }
  ]
}"#,
};

const STRICT_SUFFIX: &str = "IMPORTANT: your previous answer could not be parsed. Return ONLY one JSON object exactly matching the schema above. No markdown fences, no commentary, no trailing text.";

/// Build the prompt for `category`. `strict` adds the re-ask instruction.
pub fn build_prompt(text: &str, category: Category, hints: &ContextHints, strict: bool) -> String {
    let spec = match category {
        Category::Instrument => &INSTRUMENT,
        Category::Sector => &SECTOR,
        Category::Macro => &MACRO,
    };

    let mut p = String::with_capacity(text.len() + 2_048);
    p.push_str(spec.role);
    p.push('\n');
    p.push_str(spec.task);
    p.push('\n');
    p.push_str(spec.entity_rule);
    p.push_str("\nSentiment must be exactly one of: positive, neutral, negative. Omit entities the article only names in passing.\n");

    if !hints.source_name.is_empty() {
        p.push_str(&format!("\nSource: {}\n", hints.source_name));
    }
    if let Some(d) = hints.published {
        p.push_str(&format!("Published: {}\n", d.format("%Y-%m-%d")));
    }
    if !hints.known_entities.is_empty() {
        p.push_str("Known entities: ");
        p.push_str(&hints.known_entities.join(", "));
        p.push('\n');
    }
    if !hints.instrument_sectors.is_empty() {
        p.push_str("Ticker sectors:\n");
        for line in &hints.instrument_sectors {
            p.push_str("- ");
            p.push_str(line);
            p.push('\n');
        }
    }

    p.push_str("\nRespond with JSON in this shape:\n");
    p.push_str(spec.schema);
    p.push_str("\n\nArticle:\n\"\"\"\n");
    p.push_str(text);
    p.push_str("\n\"\"\"\n");

    if strict {
        p.push('\n');
        p.push_str(STRICT_SUFFIX);
        p.push('\n');
    }
    p
}
