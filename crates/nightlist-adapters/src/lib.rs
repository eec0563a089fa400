//! Declarative selector table and the event-card extractor built from it.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nightlist_core::{field, EventDraft};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const CRATE_NAME: &str = "nightlist-adapters";

const BUILTIN_TABLE: &str = include_str!("../../../selectors/edmtrain.yaml");

/// Every structural assumption about the listing page lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorTable {
    pub version: u32,
    pub source_id: String,
    pub base_url: String,
    pub root: String,
    #[serde(default)]
    pub skip_terms: Vec<String>,
    pub layouts: Vec<LayoutVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutVariant {
    pub name: String,
    pub card: String,
    pub fields: BTreeMap<String, FieldRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(default)]
    pub selectors: Vec<String>,
    /// Read this attribute instead of the element text.
    #[serde(default)]
    pub attr: Option<String>,
    /// Regex applied to the whole card text when no selector matches.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}` for {context}: {message}")]
    InvalidSelector {
        context: String,
        selector: String,
        message: String,
    },
    #[error("invalid pattern for {context}: {source}")]
    InvalidPattern {
        context: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid base url {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("selector table has no layouts")]
    NoLayouts,
    #[error("root container `{selector}` not found in rendered markup")]
    RootMissing { selector: String },
}

impl SelectorTable {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_TABLE).context("parsing built-in selector table")
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Selector matching a card of any layout; what the renderer waits for.
    pub fn card_selector(&self) -> String {
        self.layouts
            .iter()
            .map(|l| l.card.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn compile(&self) -> Result<Extractor, ExtractError> {
        if self.layouts.is_empty() {
            return Err(ExtractError::NoLayouts);
        }
        let base_url = Url::parse(&self.base_url).map_err(|source| ExtractError::InvalidBaseUrl {
            url: self.base_url.clone(),
            source,
        })?;
        let layouts = self
            .layouts
            .iter()
            .map(compile_layout)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Extractor {
            version: self.version,
            root_source: self.root.clone(),
            root: parse_selector("root", &self.root)?,
            skip_terms: self
                .skip_terms
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            base_url,
            layouts,
        })
    }
}

fn parse_selector(context: &str, selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::InvalidSelector {
        context: context.to_string(),
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_layout(layout: &LayoutVariant) -> Result<CompiledLayout, ExtractError> {
    let card = parse_selector(&format!("layout {} card", layout.name), &layout.card)?;
    let mut fields = Vec::with_capacity(layout.fields.len());
    for (name, rule) in &layout.fields {
        let context = format!("layout {} field {}", layout.name, name);
        let selectors = rule
            .selectors
            .iter()
            .map(|s| parse_selector(&context, s))
            .collect::<Result<Vec<_>, _>>()?;
        let pattern = rule
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|source| ExtractError::InvalidPattern {
                context: context.clone(),
                source,
            })?;
        fields.push(CompiledField {
            name: name.clone(),
            selectors,
            attr: rule.attr.clone(),
            pattern,
        });
    }
    Ok(CompiledLayout {
        name: layout.name.clone(),
        card,
        fields,
    })
}

#[derive(Debug)]
struct CompiledField {
    name: String,
    selectors: Vec<Selector>,
    attr: Option<String>,
    pattern: Option<Regex>,
}

#[derive(Debug)]
struct CompiledLayout {
    name: String,
    card: Selector,
    fields: Vec<CompiledField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardSkipReason {
    MissingArtist,
    Navigation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSkip {
    pub index: usize,
    pub layout: String,
    pub reason: CardSkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub drafts: Vec<EventDraft>,
    pub cards_seen: usize,
    pub skipped: Vec<CardSkip>,
}

/// A compiled [`SelectorTable`], ready to run against rendered markup.
#[derive(Debug)]
pub struct Extractor {
    version: u32,
    root_source: String,
    root: Selector,
    skip_terms: Vec<String>,
    base_url: Url,
    layouts: Vec<CompiledLayout>,
}

impl Extractor {
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Cards in document order; a card nested in an already-claimed card is ignored,
    /// so intermixed layouts never yield the same show twice.
    pub fn extract(&self, html: &str) -> Result<Extraction, ExtractError> {
        let document = Html::parse_document(html);
        let roots = document.select(&self.root).collect::<Vec<_>>();
        if roots.is_empty() {
            return Err(ExtractError::RootMissing {
                selector: self.root_source.clone(),
            });
        }

        let mut claimed = HashSet::new();
        let mut extraction = Extraction::default();
        for root in roots {
            for node in root.descendants() {
                let Some(element) = ElementRef::wrap(node) else {
                    continue;
                };
                if claimed.contains(&element.id())
                    || element.ancestors().any(|a| claimed.contains(&a.id()))
                {
                    continue;
                }
                let Some(layout) = self.layouts.iter().find(|l| l.card.matches(&element)) else {
                    continue;
                };
                claimed.insert(element.id());

                let index = extraction.cards_seen;
                extraction.cards_seen += 1;
                match self.extract_card(layout, element) {
                    Ok(draft) => extraction.drafts.push(draft),
                    Err(reason) => {
                        debug!(index, layout = %layout.name, ?reason, "skipping card");
                        extraction.skipped.push(CardSkip {
                            index,
                            layout: layout.name.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        info!(
            table_version = self.version,
            cards = extraction.cards_seen,
            drafts = extraction.drafts.len(),
            skipped = extraction.skipped.len(),
            "extracted event cards"
        );
        Ok(extraction)
    }

    fn extract_card(
        &self,
        layout: &CompiledLayout,
        card: ElementRef<'_>,
    ) -> Result<EventDraft, CardSkipReason> {
        let card_text = collapse_whitespace(card.text());
        let mut draft = EventDraft::new(layout.name.clone());
        for rule in &layout.fields {
            if let Some(value) = self.field_value(rule, card, &card_text) {
                draft.fields.insert(rule.name.clone(), value);
            }
        }
        draft.card_text = card_text;

        let Some(artist) = draft.get(field::ARTIST) else {
            return Err(CardSkipReason::MissingArtist);
        };
        let lower = artist.to_lowercase();
        if let Some(term) = self.skip_terms.iter().find(|t| lower.contains(t.as_str())) {
            return Err(CardSkipReason::Navigation(term.clone()));
        }
        Ok(draft)
    }

    fn field_value(
        &self,
        rule: &CompiledField,
        card: ElementRef<'_>,
        card_text: &str,
    ) -> Option<String> {
        for selector in &rule.selectors {
            for element in card.select(selector) {
                let value = match &rule.attr {
                    Some(attr) => element
                        .value()
                        .attr(attr)
                        .map(|v| self.resolve_attr(attr, v.trim())),
                    None => Some(collapse_whitespace(element.text())),
                };
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    return Some(value);
                }
            }
        }
        let captures = rule.pattern.as_ref()?.captures(card_text)?;
        captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn resolve_attr(&self, attr: &str, value: &str) -> String {
        if !matches!(attr, "href" | "src") || value.is_empty() {
            return value.to_string();
        }
        self.base_url
            .join(value)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| value.to_string())
    }
}

fn collapse_whitespace<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
