//! Deciding which layout fragments get redacted
//!
//! Pages are walked in ascending order. On each page the schema fields come
//! first, then lines (when enabled), then words. Each pass only contributes
//! fragments that carry a polygon; the rest are recorded as skipped.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::layout::{Field, LayoutResult, Polygon};
use crate::report::SkipReason;

/// Switches for the matching passes.
///
/// Word matching splits PII phrases into tokens and redacts every page word
/// equal to one of them, so a shared first name is redacted everywhere.
/// Field matching ignores the PII list and redacts every extracted field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchPolicy {
    pub redact_fields: bool,
    pub match_lines: bool,
    pub match_words: bool,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            redact_fields: true,
            match_lines: false,
            match_words: true,
        }
    }
}

/// Where a target came from. Carries positions, never text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSource {
    Field { key: String },
    Line { index: usize },
    Word { index: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedactionTarget {
    /// 0-based page number
    pub page: usize,
    pub polygon: Polygon,
    pub source: TargetSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedFragment {
    pub page: Option<usize>,
    pub source: TargetSource,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchOutcome {
    pub targets: Vec<RedactionTarget>,
    pub skipped: Vec<SkippedFragment>,
}

impl MatchOutcome {
    fn skip(&mut self, page: Option<usize>, source: TargetSource, reason: SkipReason) {
        debug!(page = ?page, source = ?source, reason = ?reason, "Skipping fragment");
        self.skipped.push(SkippedFragment {
            page,
            source,
            reason,
        });
    }
}

/// Entity reported by a recognizer, reduced to its text before matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PiiEntity {
    pub text: String,
    pub category: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Distinct non-empty entity texts, in first-seen order.
pub fn entity_values(entities: &[PiiEntity]) -> Vec<String> {
    let mut seen = HashSet::new();
    entities
        .iter()
        .map(|e| e.text.trim())
        .filter(|t| !t.is_empty() && seen.insert(*t))
        .map(str::to_string)
        .collect()
}

/// Whitespace tokens of every PII value.
///
/// `["Jane Doe"]` gives `{"Jane", "Doe"}`. Matching against the set is exact
/// and case-sensitive.
pub fn pii_words(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .flat_map(|v| v.split_whitespace())
        .map(str::to_string)
        .collect()
}

pub fn find_redaction_targets(
    layout: &LayoutResult,
    fields: &[Field],
    pii_values: &[String],
    policy: &MatchPolicy,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();

    let mut fields_by_page: BTreeMap<usize, Vec<&Field>> = BTreeMap::new();
    if policy.redact_fields {
        for field in fields {
            let source = TargetSource::Field {
                key: field.key.clone(),
            };
            match field.page_number() {
                None => outcome.skip(None, source, SkipReason::MissingPolygon),
                Some(page) if layout.page(page).is_none() => {
                    outcome.skip(Some(page), source, SkipReason::UnknownPage)
                }
                Some(page) => fields_by_page.entry(page).or_default().push(field),
            }
        }
    }

    let words = pii_words(pii_values);
    let phrases: Vec<&str> = pii_values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();

    for page in &layout.pages {
        for field in fields_by_page.remove(&page.number).unwrap_or_default() {
            let source = TargetSource::Field {
                key: field.key.clone(),
            };
            match field.anchor() {
                Some((_, polygon)) => outcome.targets.push(RedactionTarget {
                    page: page.number,
                    polygon: polygon.clone(),
                    source,
                }),
                None => outcome.skip(Some(page.number), source, SkipReason::MissingPolygon),
            }
        }

        if policy.match_lines {
            for (index, line) in page.lines.iter().enumerate() {
                if !phrases.iter().any(|p| line.content.contains(p)) {
                    continue;
                }
                let source = TargetSource::Line { index };
                match &line.polygon {
                    Some(polygon) => outcome.targets.push(RedactionTarget {
                        page: page.number,
                        polygon: polygon.clone(),
                        source,
                    }),
                    None => outcome.skip(Some(page.number), source, SkipReason::MissingPolygon),
                }
            }
        }

        if policy.match_words {
            for (index, word) in page.words.iter().enumerate() {
                if !words.contains(word.content.as_str()) {
                    continue;
                }
                let source = TargetSource::Word { index };
                match &word.polygon {
                    Some(polygon) => outcome.targets.push(RedactionTarget {
                        page: page.number,
                        polygon: polygon.clone(),
                        source,
                    }),
                    None => outcome.skip(Some(page.number), source, SkipReason::MissingPolygon),
                }
            }
        }
    }

    debug!(
        targets = outcome.targets.len(),
        skipped = outcome.skipped.len(),
        "Matching finished"
    );
    outcome
}
