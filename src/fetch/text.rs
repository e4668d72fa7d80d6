// src/fetch/text.rs
//! Body text extraction and cleanup.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;

use crate::error::FetchError;
use crate::fetch::listing::compile_rule;

static RE_SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>").expect("valid regex")
});
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("valid regex"));
static RE_BLOCK_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
static RE_JS_DECL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(var|let|const)\s+[\w$]+\s*=").expect("valid regex"));
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{00A0}]+").expect("valid regex"));
static RE_ELLIPSIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{4,}").expect("valid regex"));

/// Lines that look like inline CSS/JS leaking into article text.
fn is_noise_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    line.starts_with(['.', '#', '@'])
        || line.contains('{')
        || line.contains('}')
        || lower.contains("function(")
        || lower.contains("jquery")
        || lower.contains("elementor")
        || RE_JS_DECL.is_match(line)
}

/// Clean raw HTML: drop script/style blocks and markup, then decode
/// entities, so an escaped `&lt;` in prose survives as text.
pub fn clean_text(s: &str) -> String {
    let out = RE_SCRIPT_STYLE.replace_all(s, "\n");
    let out = RE_TAGS.replace_all(&out, "\n");
    normalize_text(&html_escape::decode_html_entities(&out))
}

/// Normalize already-decoded text: drop CSS/JS noise, normalize quotes and
/// collapse whitespace. Line breaks between paragraphs are kept.
pub fn normalize_text(s: &str) -> String {
    let out = RE_BLOCK_COMMENT
        .replace_all(s, "")
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    let lines: Vec<String> = out
        .lines()
        .map(|l| RE_SPACES.replace_all(l.trim(), " ").to_string())
        .filter(|l| l.chars().count() > 3 && !is_noise_line(l))
        .collect();

    let joined = lines.join("\n");
    RE_ELLIPSIS.replace_all(&joined, "...").trim().to_string()
}

/// Text of the first element matching `rule`, normalized. Text nodes come
/// out of the parser already decoded and free of markup.
pub fn extract_text(html: &str, rule: &str, page_url: &str) -> Result<String, FetchError> {
    let sel = compile_rule(rule)?;
    let doc = Html::parse_document(html);
    let Some(el) = doc.select(&sel).next() else {
        return Err(FetchError::permanent(
            page_url,
            format!("content locator `{rule}` matched nothing"),
        ));
    };
    let raw = el.text().collect::<Vec<_>>().join("\n");
    Ok(normalize_text(&raw))
}
