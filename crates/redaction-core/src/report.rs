//! Per-fragment results of a redaction run

use serde::{Deserialize, Serialize};

use crate::geometry::Rect;
use crate::matcher::TargetSource;

/// What a single redaction removed underneath its rectangle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyStats {
    pub glyphs_removed: usize,
    pub paths_removed: usize,
    pub images_cleared: usize,
    pub inline_images_removed: usize,
    pub forms_rewritten: usize,
}

impl ApplyStats {
    pub fn absorb(&mut self, other: &ApplyStats) {
        self.glyphs_removed += other.glyphs_removed;
        self.paths_removed += other.paths_removed;
        self.images_cleared += other.images_cleared;
        self.inline_images_removed += other.inline_images_removed;
        self.forms_rewritten += other.forms_rewritten;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Fragment carries no polygon
    MissingPolygon,
    /// Field refers to a page the layout does not have
    UnknownPage,
    /// Target page is beyond the end of the PDF
    PageNotFound,
    MalformedPolygon { message: String },
    /// Removal failed; see `painted` on the outcome for the overlay
    ApplyFailed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FragmentOutcome {
    Redacted {
        /// Render-space rectangle that was blacked out
        rect: Rect,
        stats: ApplyStats,
    },
    Skipped {
        reason: SkipReason,
        /// Overlay still painted here, when the rectangle was known
        painted: Option<Rect>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FragmentReport {
    /// 0-based page, absent when the fragment never named one
    pub page: Option<usize>,
    pub source: TargetSource,
    pub outcome: FragmentOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RedactionReport {
    pub page_count: usize,
    pub fragments: Vec<FragmentReport>,
}

impl RedactionReport {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            fragments: Vec::new(),
        }
    }

    pub fn push(&mut self, page: Option<usize>, source: TargetSource, outcome: FragmentOutcome) {
        self.fragments.push(FragmentReport {
            page,
            source,
            outcome,
        });
    }

    pub fn redacted(&self) -> usize {
        self.fragments
            .iter()
            .filter(|f| matches!(f.outcome, FragmentOutcome::Redacted { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.fragments.len() - self.redacted()
    }

    /// Number of black boxes drawn, including those over failed removals.
    pub fn overlays_painted(&self) -> usize {
        self.fragments
            .iter()
            .filter(|f| match &f.outcome {
                FragmentOutcome::Redacted { .. } => true,
                FragmentOutcome::Skipped { painted, .. } => painted.is_some(),
            })
            .count()
    }

    pub fn totals(&self) -> ApplyStats {
        let mut totals = ApplyStats::default();
        for fragment in &self.fragments {
            if let FragmentOutcome::Redacted { stats, .. } = &fragment.outcome {
                totals.absorb(stats);
            }
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_distinguish_painted_failures() {
        let rect = Rect::new(0.0, 0.0, 1.0, 1.0);
        let mut report = RedactionReport::new(2);
        report.push(
            Some(0),
            TargetSource::Word { index: 0 },
            FragmentOutcome::Redacted {
                rect,
                stats: ApplyStats {
                    glyphs_removed: 5,
                    ..ApplyStats::default()
                },
            },
        );
        report.push(
            Some(0),
            TargetSource::Word { index: 1 },
            FragmentOutcome::Skipped {
                reason: SkipReason::ApplyFailed {
                    message: "unsupported image encoding".to_string(),
                },
                painted: Some(rect),
            },
        );
        report.push(
            None,
            TargetSource::Field {
                key: "Informant".to_string(),
            },
            FragmentOutcome::Skipped {
                reason: SkipReason::MissingPolygon,
                painted: None,
            },
        );

        assert_eq!(report.redacted(), 1);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.overlays_painted(), 2);
        assert_eq!(report.totals().glyphs_removed, 5);
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = FragmentOutcome::Skipped {
            reason: SkipReason::UnknownPage,
            painted: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"]["kind"], "unknown_page");
    }
}
