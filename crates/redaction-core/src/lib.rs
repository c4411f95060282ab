//! PII redaction engine for scanned PDFs
//!
//! Maps layout polygons reported by an OCR engine onto PDF pages and
//! permanently removes what lies underneath them.
//!
//! - `matcher`: decide which layout fragments are sensitive
//! - `geometry`: model space → render space → PDF user space
//! - `applicator`: strip text, vectors and pixels, then paint black

pub mod applicator;
mod content;
pub mod error;
mod fonts;
pub mod geometry;
pub mod layout;
pub mod matcher;
mod pdf;
mod raster;
pub mod report;

pub use applicator::{redact_document, redact_pages, PageRedactor, RedactionDocument};
pub use content::REDACTION_TAG;
pub use error::RedactError;
pub use geometry::{map_to_rectangle, PageSpace, Rect, ScaleFactors};
pub use layout::{
    BoundingRegion, Extraction, Field, FieldValue, LayoutPage, LayoutResult, Line, Point, Polygon,
    Word,
};
pub use matcher::{
    entity_values, find_redaction_targets, pii_words, MatchOutcome, MatchPolicy, PiiEntity,
    RedactionTarget, SkippedFragment, TargetSource,
};
pub use report::{ApplyStats, FragmentOutcome, FragmentReport, RedactionReport, SkipReason};

/// Parse PDF bytes and return page count
pub fn get_page_count(bytes: &[u8]) -> Result<usize, RedactError> {
    let doc =
        lopdf::Document::load_mem(bytes).map_err(|e| RedactError::DocumentOpen(e.to_string()))?;
    Ok(doc.get_pages().len())
}
