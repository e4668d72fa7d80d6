// src/fetch/listing.rs
//! Listing-page parsing: item links, publication dates, pagination URLs
//! and the date cutoff. Pure functions; no I/O.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::FetchError;
use crate::model::SourceConfig;

const DEFAULT_LINK_RULE: &str = "a[href]";

/// A listing entry as found on the page (date may be unparseable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub url: String,
    pub published: Option<NaiveDate>,
}

/// An entry that passed the cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedItem {
    pub url: String,
    pub published: NaiveDate,
}

/// Result of applying the cutoff to one page.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PageScan {
    pub accepted: Vec<ListedItem>,
    /// At least one entry on the page predates the cutoff.
    pub reached_cutoff: bool,
    pub undated: usize,
}

pub fn compile_rule(rule: &str) -> Result<Selector, FetchError> {
    Selector::parse(rule).map_err(|e| FetchError::InvalidRule {
        rule: rule.to_string(),
        message: e.to_string(),
    })
}

/// Extract `(url, date)` pairs from one listing page.
///
/// The item link is the `href` of the listing element itself, or of the
/// first `link_rule` match inside it. Relative links resolve against `page_url`.
pub fn parse_listing(
    html: &str,
    page_url: &str,
    source: &SourceConfig,
) -> Result<Vec<ListingEntry>, FetchError> {
    let item_sel = compile_rule(&source.listing_item_rule)?;
    let date_sel = compile_rule(&source.date_rule)?;
    let link_sel = compile_rule(source.link_rule.as_deref().unwrap_or(DEFAULT_LINK_RULE))?;
    let base = Url::parse(page_url).map_err(|e| FetchError::permanent(page_url, e.to_string()))?;

    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for item in doc.select(&item_sel) {
        let href = item
            .value()
            .attr("href")
            .or_else(|| {
                item.select(&link_sel)
                    .next()
                    .and_then(|a| a.value().attr("href"))
            })
            .map(str::trim)
            .filter(|h| !h.is_empty() && !h.starts_with('#') && !h.starts_with("javascript:"));
        let Some(href) = href else {
            tracing::debug!(source = %source.id, "listing item without link, skipping");
            continue;
        };
        let Ok(url) = base.join(href) else {
            tracing::debug!(source = %source.id, href, "unresolvable listing link, skipping");
            continue;
        };
        let published = item.select(&date_sel).next().and_then(|el| date_of(&el));
        out.push(ListingEntry {
            url: url.to_string(),
            published,
        });
    }
    Ok(out)
}

/// Prefer a machine-readable `datetime` attribute, then the visible text.
fn date_of(el: &ElementRef<'_>) -> Option<NaiveDate> {
    if let Some(d) = el.value().attr("datetime").and_then(parse_date) {
        return Some(d);
    }
    let text = el.text().collect::<Vec<_>>().join(" ");
    parse_date(&text)
}

static RE_DMY_SLASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})").expect("valid regex"));
static RE_ISO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("valid regex"));

const DATE_FORMATS: &[&str] = &["%d-%m-%Y", "%Y-%m-%d", "%d.%m.%Y", "%B %d, %Y", "%d %B %Y"];

/// Parse a listing date. `DD/MM/YYYY` anywhere in the text wins, then an
/// embedded ISO date, then a handful of whole-string formats.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    if let Some(c) = RE_DMY_SLASH.captures(text) {
        let (d, m, y) = (c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
        return NaiveDate::from_ymd_opt(y, m, d);
    }
    if let Some(c) = RE_ISO.captures(text) {
        let (y, m, d) = (c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
        if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
            return Some(date);
        }
    }
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
}

/// URL of listing page `page` (1-based). Page 1 is always the base URL.
///
/// * rule containing `<page>`: appended to the base with the number substituted
/// * rule starting with `/`: used as a path segment, trailing `/` enforced
/// * no rule: `{base}/page/{n}`
pub fn page_url(base_url: &str, rule: Option<&str>, page: u32) -> String {
    if page <= 1 {
        return base_url.to_string();
    }
    let base = base_url.trim_end_matches('/');
    match rule.map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) if r.contains("<page>") => {
            format!("{base}{}", r.replace("<page>", &page.to_string()))
        }
        Some(r) if r.starts_with('/') => {
            let seg = if r.ends_with('/') {
                r.to_string()
            } else {
                format!("{r}/")
            };
            format!("{base}{seg}{page}")
        }
        Some(r) => {
            tracing::warn!(rule = r, "unrecognized pagination rule, using /page/ default");
            format!("{base}/page/{page}")
        }
        None => format!("{base}/page/{page}"),
    }
}

/// Keep entries on or after `since`; flag whether the page crossed it.
pub fn apply_cutoff(entries: Vec<ListingEntry>, since: NaiveDate) -> PageScan {
    let mut scan = PageScan::default();
    for e in entries {
        match e.published {
            Some(d) if d >= since => scan.accepted.push(ListedItem {
                url: e.url,
                published: d,
            }),
            Some(_) => scan.reached_cutoff = true,
            None => scan.undated += 1,
        }
    }
    scan
}
