//! Destructive redaction of PDF pages
//!
//! Each rectangle goes through the same sequence: it is marked pending, text
//! and vector content under every pending region is cut from the content
//! stream, covered image pixels are overwritten, and finally a black box is
//! painted on top. The paint step runs even when removal fails.

use std::collections::{BTreeMap, HashMap};

use lopdf::{Document, Object, ObjectId};
use tracing::{debug, info, warn};

use crate::content::{filter_content, FilterOutcome, XObjectHit, REDACTION_TAG};
use crate::error::RedactError;
use crate::geometry::{map_to_rectangle, Matrix, PageSpace, Rect, ScaleFactors};
use crate::raster::clear_image_region;
use crate::layout::LayoutResult;
use crate::matcher::{MatchOutcome, RedactionTarget};
use crate::pdf::{
    add_stream, get, page_content, page_contents_refs, page_resources, page_space, repoint_xobject,
    set_page_contents, stream_data, write_flate, ResourceView,
};
use crate::report::{ApplyStats, FragmentOutcome, RedactionReport, SkipReason};

/// Nesting limit for form XObjects drawing other forms.
const MAX_FORM_DEPTH: usize = 8;

/// A parsed PDF open for redaction.
pub struct RedactionDocument {
    doc: Document,
    pages: Vec<ObjectId>,
}

impl RedactionDocument {
    pub fn open(bytes: &[u8]) -> Result<Self, RedactError> {
        let doc = Document::load_mem(bytes).map_err(|e| RedactError::DocumentOpen(e.to_string()))?;
        if doc.trailer.get(b"Encrypt").is_ok() {
            return Err(RedactError::DocumentOpen(
                "encrypted documents are not supported".to_string(),
            ));
        }
        let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if pages.is_empty() {
            return Err(RedactError::DocumentOpen("document has no pages".to_string()));
        }
        Ok(Self { doc, pages })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Geometry of a 0-based page.
    pub fn page_space(&self, page: usize) -> Result<PageSpace, RedactError> {
        let page_id = self.page_id(page)?;
        Ok(page_space(&self.doc, page_id))
    }

    pub fn page(&mut self, page: usize) -> Result<PageRedactor<'_>, RedactError> {
        let page_id = self.page_id(page)?;
        let space = page_space(&self.doc, page_id);
        Ok(PageRedactor {
            doc: &mut self.doc,
            page_id,
            page,
            space,
            pending: Vec::new(),
            overlays: 0,
            copies: HashMap::new(),
        })
    }

    /// Serialize, dropping every object no longer reachable from the trailer.
    pub fn save(mut self) -> Result<Vec<u8>, RedactError> {
        self.doc.prune_objects();
        self.doc.compress();
        let mut buffer = Vec::new();
        self.doc
            .save_to(&mut buffer)
            .map_err(|e| RedactError::Serialization(e.to_string()))?;
        Ok(buffer)
    }

    fn page_id(&self, page: usize) -> Result<ObjectId, RedactError> {
        self.pages
            .get(page)
            .copied()
            .ok_or(RedactError::PageNotFound(page))
    }
}

/// Single writer for one page's redactions.
pub struct PageRedactor<'a> {
    doc: &'a mut Document,
    page_id: ObjectId,
    page: usize,
    space: PageSpace,
    pending: Vec<Rect>,
    overlays: usize,
    /// Shared XObject -> this page's private copy
    copies: HashMap<ObjectId, ObjectId>,
}

impl<'a> PageRedactor<'a> {
    pub fn space(&self) -> PageSpace {
        self.space
    }

    /// Pending regions so far, in user space.
    pub fn pending(&self) -> &[Rect] {
        &self.pending
    }

    pub fn overlays_painted(&self) -> usize {
        self.overlays
    }

    /// Redact a render-space rectangle.
    ///
    /// Removal problems are returned as `RedactionApply` after the overlay
    /// has been painted; `overlays_painted` tells whether it was.
    pub fn apply_redaction(&mut self, rect: &Rect) -> Result<ApplyStats, RedactError> {
        let region = self.space.render_to_user(rect);
        self.pending.push(region);

        let mut stats = ApplyStats::default();
        let mut failure: Option<RedactError> = None;

        let body = match self.remove_content(&region, &mut stats) {
            Ok(body) => body,
            Err(e) => {
                failure = Some(e);
                None
            }
        };

        self.paint(&region, body)?;

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Text, vector and image passes. Returns the replacement content stream
    /// when the page content changed.
    fn remove_content(
        &mut self,
        region: &Rect,
        stats: &mut ApplyStats,
    ) -> Result<Option<ObjectId>, RedactError> {
        let content = page_content(self.doc, self.page_id)?;
        let resources = ResourceView::from_resources(self.doc, page_resources(self.doc, self.page_id));
        let outcome = filter_content(&content, &resources, &self.pending, Matrix::IDENTITY)?;
        record(stats, &outcome);

        let mut failure = None;
        let page_id = self.page_id;
        for form in &outcome.forms {
            if let Err(e) = self.redact_form(form, page_id, &resources, 1, region, stats) {
                failure.get_or_insert(e);
            }
        }
        for image in &outcome.images {
            if let Err(e) = self.clear_image(image, page_id, region, stats) {
                failure.get_or_insert(e);
            }
        }

        let body = outcome
            .changed
            .then(|| add_stream(self.doc, outcome.content));
        match failure {
            Some(e) => {
                // Keep whatever text was removed even though an image failed
                if let Some(body) = body {
                    self.replace_body(body)?;
                }
                Err(e)
            }
            None => Ok(body),
        }
    }

    /// `holder` is the page or form whose resources named `hit`.
    fn redact_form(
        &mut self,
        hit: &XObjectHit,
        holder: ObjectId,
        parent: &ResourceView,
        depth: usize,
        region: &Rect,
        stats: &mut ApplyStats,
    ) -> Result<(), RedactError> {
        if depth > MAX_FORM_DEPTH {
            return Err(RedactError::RedactionApply(format!(
                "form XObjects nested deeper than {}",
                MAX_FORM_DEPTH
            )));
        }

        let (content, resources, own_resources) = {
            let stream = self
                .doc
                .get_object(hit.id)
                .and_then(Object::as_stream)
                .map_err(|e| RedactError::RedactionApply(e.to_string()))?;
            match get(self.doc, &stream.dict, b"Resources") {
                Some(Object::Dictionary(dict)) => (
                    stream_data(stream)?,
                    ResourceView::from_resources(self.doc, Some(dict)),
                    true,
                ),
                _ => (stream_data(stream)?, parent.clone(), false),
            }
        };

        let outcome = filter_content(&content, &resources, &self.pending, hit.ctm)?;
        if !outcome.changed && outcome.forms.is_empty() && outcome.images.is_empty() {
            return Ok(());
        }

        // Other pages may draw the same form, edit a copy owned by this page
        let id = self.private_copy(hit, holder)?;
        let child_holder = if own_resources { id } else { holder };

        record(stats, &outcome);
        if outcome.changed {
            let stream = self
                .doc
                .get_object_mut(id)
                .and_then(Object::as_stream_mut)
                .map_err(|e| RedactError::RedactionApply(e.to_string()))?;
            write_flate(stream, &outcome.content)?;
            stats.forms_rewritten += 1;
        }

        let mut failure = None;
        for form in &outcome.forms {
            if let Err(e) = self.redact_form(form, child_holder, &resources, depth + 1, region, stats) {
                failure.get_or_insert(e);
            }
        }
        for image in &outcome.images {
            if let Err(e) = self.clear_image(image, child_holder, region, stats) {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn clear_image(
        &mut self,
        hit: &XObjectHit,
        holder: ObjectId,
        region: &Rect,
        stats: &mut ApplyStats,
    ) -> Result<(), RedactError> {
        let bounds = hit.ctm.apply_rect(&Rect::new(0.0, 0.0, 1.0, 1.0));
        if !bounds.intersects(region) {
            // Hit by an earlier pending region, already cleared
            return Ok(());
        }
        let id = self.private_copy(hit, holder)?;
        if clear_image_region(self.doc, id, &hit.ctm, region)? {
            stats.images_cleared += 1;
        }
        Ok(())
    }

    /// This page's own copy of the XObject behind `hit`, with `holder`'s
    /// resources pointing at it.
    fn private_copy(&mut self, hit: &XObjectHit, holder: ObjectId) -> Result<ObjectId, RedactError> {
        if self.copies.values().any(|copy| *copy == hit.id) {
            return Ok(hit.id);
        }
        let copy = match self.copies.get(&hit.id) {
            Some(copy) => *copy,
            None => {
                let object = self
                    .doc
                    .get_object(hit.id)
                    .map_err(|e| RedactError::RedactionApply(e.to_string()))?
                    .clone();
                let copy = self.doc.add_object(object);
                self.copies.insert(hit.id, copy);
                copy
            }
        };
        repoint_xobject(self.doc, holder, &hit.name, copy)?;
        Ok(copy)
    }

    fn replace_body(&mut self, body: ObjectId) -> Result<(), RedactError> {
        set_page_contents(self.doc, self.page_id, vec![Object::Reference(body)])
    }

    /// Append the black box, wrapping the existing content in `q`/`Q` so
    /// its graphics state cannot leak into the overlay.
    fn paint(&mut self, region: &Rect, body: Option<ObjectId>) -> Result<(), RedactError> {
        let mut contents = vec![Object::Reference(add_stream(self.doc, b"q\n".to_vec()))];
        match body {
            Some(id) => contents.push(Object::Reference(id)),
            None => contents.extend(page_contents_refs(self.doc, self.page_id)),
        }
        contents.push(Object::Reference(add_stream(self.doc, b"\nQ\n".to_vec())));
        contents.push(Object::Reference(add_stream(self.doc, overlay(region))));
        set_page_contents(self.doc, self.page_id, contents)?;
        self.overlays += 1;
        debug!(page = self.page, "Painted redaction overlay");
        Ok(())
    }
}

fn record(stats: &mut ApplyStats, outcome: &FilterOutcome) {
    stats.glyphs_removed += outcome.glyphs_removed;
    stats.paths_removed += outcome.paths_removed;
    stats.inline_images_removed += outcome.inline_images_removed;
}

/// Opaque black fill over `region`, tagged so later passes leave it alone.
fn overlay(region: &Rect) -> Vec<u8> {
    format!(
        "q /{} BMC 0 0 0 rg {:.4} {:.4} {:.4} {:.4} re f EMC Q\n",
        String::from_utf8_lossy(REDACTION_TAG),
        region.min_x,
        region.min_y,
        region.width(),
        region.height()
    )
    .into_bytes()
}

/// Redact every matched target, pages ascending, and report per fragment.
pub fn redact_pages(
    doc: &mut RedactionDocument,
    layout: &LayoutResult,
    matches: &MatchOutcome,
) -> RedactionReport {
    let mut report = RedactionReport::new(doc.page_count());
    for skipped in &matches.skipped {
        report.push(
            skipped.page,
            skipped.source.clone(),
            FragmentOutcome::Skipped {
                reason: skipped.reason.clone(),
                painted: None,
            },
        );
    }

    let mut by_page: BTreeMap<usize, Vec<&RedactionTarget>> = BTreeMap::new();
    for target in &matches.targets {
        by_page.entry(target.page).or_default().push(target);
    }

    for (page, targets) in by_page {
        let skip_all = |report: &mut RedactionReport, reason: SkipReason| {
            for target in &targets {
                report.push(
                    Some(page),
                    target.source.clone(),
                    FragmentOutcome::Skipped {
                        reason: reason.clone(),
                        painted: None,
                    },
                );
            }
        };

        let Some(layout_page) = layout.page(page) else {
            skip_all(&mut report, SkipReason::UnknownPage);
            continue;
        };
        let mut redactor = match doc.page(page) {
            Ok(redactor) => redactor,
            Err(e) => {
                warn!(page, error = %e, "Targets refer to a page the PDF does not have");
                skip_all(&mut report, SkipReason::PageNotFound);
                continue;
            }
        };

        let (render_width, render_height) = redactor.space().render_size();
        let scale = match ScaleFactors::for_page(
            render_width,
            render_height,
            layout_page.width,
            layout_page.height,
        ) {
            Ok(scale) => scale,
            Err(e) => {
                warn!(page, error = %e, "Cannot scale page");
                skip_all(
                    &mut report,
                    SkipReason::ApplyFailed {
                        message: e.to_string(),
                    },
                );
                continue;
            }
        };

        for target in &targets {
            let rect = match map_to_rectangle(&target.polygon, scale.x, scale.y) {
                Ok(rect) => rect,
                Err(e) => {
                    warn!(page, source = ?target.source, error = %e, "Malformed polygon");
                    report.push(
                        Some(page),
                        target.source.clone(),
                        FragmentOutcome::Skipped {
                            reason: SkipReason::MalformedPolygon {
                                message: e.to_string(),
                            },
                            painted: None,
                        },
                    );
                    continue;
                }
            };

            let painted_before = redactor.overlays_painted();
            let outcome = match redactor.apply_redaction(&rect) {
                Ok(stats) => FragmentOutcome::Redacted { rect, stats },
                Err(e) => {
                    warn!(page, source = ?target.source, error = %e, "Redaction incomplete");
                    FragmentOutcome::Skipped {
                        reason: SkipReason::ApplyFailed {
                            message: e.to_string(),
                        },
                        painted: (redactor.overlays_painted() > painted_before).then_some(rect),
                    }
                }
            };
            report.push(Some(page), target.source.clone(), outcome);
        }
    }

    info!(
        pages = report.page_count,
        redacted = report.redacted(),
        skipped = report.skipped(),
        "Redaction finished"
    );
    report
}

/// Open, redact and serialize in one go.
pub fn redact_document(
    bytes: &[u8],
    layout: &LayoutResult,
    matches: &MatchOutcome,
) -> Result<(Vec<u8>, RedactionReport), RedactError> {
    let mut doc = RedactionDocument::open(bytes)?;
    let report = redact_pages(&mut doc, layout, matches);
    let output = doc.save()?;
    Ok((output, report))
}
