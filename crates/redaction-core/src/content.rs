//! Content stream rewriting
//!
//! Walks a content stream with enough graphics and text state to know where
//! each glyph, path and image lands in user space, and drops whatever falls
//! inside a redaction region:
//!
//! - glyphs are cut out of their string and replaced by a `TJ` offset of the
//!   same advance, so neighbouring text stays put;
//! - painted paths are dropped, clipping paths keep their clip but lose the paint;
//! - inline images are dropped;
//! - image and form XObjects are reported back, their bytes live elsewhere.
//!
//! Marked content tagged `/Redaction` holds our own overlays; paths inside
//! it are never touched.

use lopdf::content::{Content, Operation};
use lopdf::{Object, ObjectId, StringFormat};

use crate::error::RedactError;
use crate::fonts::FontMetrics;
use crate::geometry::{Matrix, Rect};
use crate::pdf::{name, number, ResourceView, XObject};

/// Marked-content tag wrapped around every overlay we paint.
pub const REDACTION_TAG: &[u8] = b"Redaction";

const UNIT_SQUARE: Rect = Rect {
    min_x: 0.0,
    min_y: 0.0,
    max_x: 1.0,
    max_y: 1.0,
};

/// An XObject drawn over a region, with the CTM in effect when it was drawn.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct XObjectHit {
    /// Resource name the stream drew it under
    pub name: Vec<u8>,
    pub id: ObjectId,
    pub ctm: Matrix,
}

#[derive(Debug, Default)]
pub(crate) struct FilterOutcome {
    pub content: Vec<u8>,
    pub changed: bool,
    pub glyphs_removed: usize,
    pub paths_removed: usize,
    pub inline_images_removed: usize,
    pub images: Vec<XObjectHit>,
    pub forms: Vec<XObjectHit>,
}

#[derive(Debug, Clone)]
struct TextState {
    char_spacing: f64,
    word_spacing: f64,
    horizontal_scaling: f64,
    leading: f64,
    font: Option<Vec<u8>>,
    size: f64,
    rise: f64,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            char_spacing: 0.0,
            word_spacing: 0.0,
            horizontal_scaling: 1.0,
            leading: 0.0,
            font: None,
            size: 0.0,
            rise: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct GraphicsState {
    ctm: Matrix,
    line_width: f64,
    text: TextState,
}

enum Piece {
    Text(Vec<u8>, StringFormat),
    Shift(f64),
}

/// Rewrite `content`, removing everything that intersects `regions`.
///
/// `regions` and `base` are in page user space; `base` is the CTM in force
/// when the stream starts (identity for a page, placement for a form).
pub(crate) fn filter_content(
    content: &[u8],
    resources: &ResourceView,
    regions: &[Rect],
    base: Matrix,
) -> Result<FilterOutcome, RedactError> {
    let content = Content::decode(content)
        .map_err(|e| RedactError::RedactionApply(format!("cannot parse content stream: {}", e)))?;

    let mut filter = ContentFilter {
        resources,
        regions,
        state: GraphicsState {
            ctm: base,
            line_width: 1.0,
            text: TextState::default(),
        },
        saved: Vec::new(),
        tm: Matrix::IDENTITY,
        tlm: Matrix::IDENTITY,
        in_text: false,
        marked: Vec::new(),
        path: Vec::new(),
        path_bounds: None,
        clipping: false,
        dropping_inline_image: false,
        out: Vec::with_capacity(content.operations.len()),
        outcome: FilterOutcome::default(),
    };

    for op in content.operations {
        filter.handle(op);
    }
    filter.finish()
}

struct ContentFilter<'a> {
    resources: &'a ResourceView,
    regions: &'a [Rect],
    state: GraphicsState,
    saved: Vec<GraphicsState>,
    tm: Matrix,
    tlm: Matrix,
    in_text: bool,
    marked: Vec<bool>,
    path: Vec<Operation>,
    path_bounds: Option<Rect>,
    clipping: bool,
    dropping_inline_image: bool,
    out: Vec<Operation>,
    outcome: FilterOutcome,
}

impl<'a> ContentFilter<'a> {
    fn handle(&mut self, op: Operation) {
        match op.operator.as_str() {
            "m" | "l" | "c" | "v" | "y" | "h" | "re" => return self.extend_path(op),
            "W" | "W*" if !self.path.is_empty() => {
                self.clipping = true;
                self.path.push(op);
                return;
            }
            "S" | "s" | "f" | "F" | "f*" | "B" | "B*" | "b" | "b*" | "n" => {
                return self.paint_path(op)
            }
            _ => {}
        }

        // Anything else terminates a path, keep it as written
        self.flush_path();

        match op.operator.as_str() {
            "q" => {
                self.saved.push(self.state.clone());
                self.out.push(op);
            }
            "Q" => {
                if let Some(state) = self.saved.pop() {
                    self.state = state;
                    self.out.push(op);
                } else {
                    // Unbalanced restore would pop the wrapper around the page
                    self.outcome.changed = true;
                }
            }
            "cm" => {
                if let Some(m) = matrix_operands(&op) {
                    self.state.ctm = m.then(&self.state.ctm);
                }
                self.out.push(op);
            }
            "w" => {
                if let Some(width) = operand(&op, 0) {
                    self.state.line_width = width;
                }
                self.out.push(op);
            }
            "BT" => {
                self.in_text = true;
                self.tm = Matrix::IDENTITY;
                self.tlm = Matrix::IDENTITY;
                self.out.push(op);
            }
            "ET" => {
                self.in_text = false;
                self.out.push(op);
            }
            "Tc" | "Tw" | "Tz" | "TL" | "Ts" => {
                if let Some(value) = operand(&op, 0) {
                    let text = &mut self.state.text;
                    match op.operator.as_str() {
                        "Tc" => text.char_spacing = value,
                        "Tw" => text.word_spacing = value,
                        "Tz" => text.horizontal_scaling = value / 100.0,
                        "TL" => text.leading = value,
                        _ => text.rise = value,
                    }
                }
                self.out.push(op);
            }
            "Tf" => {
                if let (Some(font), Some(size)) =
                    (op.operands.first().and_then(name), operand(&op, 1))
                {
                    self.state.text.font = Some(font.to_vec());
                    self.state.text.size = size;
                }
                self.out.push(op);
            }
            "Td" | "TD" => {
                if let (Some(tx), Some(ty)) = (operand(&op, 0), operand(&op, 1)) {
                    if op.operator == "TD" {
                        self.state.text.leading = -ty;
                    }
                    self.move_line(tx, ty);
                }
                self.out.push(op);
            }
            "Tm" => {
                if let Some(m) = matrix_operands(&op) {
                    self.tm = m;
                    self.tlm = m;
                }
                self.out.push(op);
            }
            "T*" => {
                self.next_line();
                self.out.push(op);
            }
            "Tj" => {
                let items = op.operands.clone();
                self.show(op, &items, Vec::new());
            }
            "TJ" => {
                let items = match op.operands.first() {
                    Some(Object::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                self.show(op, &items, Vec::new());
            }
            "'" => {
                self.next_line();
                let items = op.operands.clone();
                self.show(op, &items, vec![Operation::new("T*", vec![])]);
            }
            "\"" => {
                let (Some(aw), Some(ac)) = (op.operands.first().cloned(), op.operands.get(1).cloned())
                else {
                    self.out.push(op);
                    return;
                };
                if let (Some(w), Some(c)) = (number(&aw), number(&ac)) {
                    self.state.text.word_spacing = w;
                    self.state.text.char_spacing = c;
                }
                self.next_line();
                let items: Vec<Object> = op.operands.iter().skip(2).cloned().collect();
                let prefix = vec![
                    Operation::new("Tw", vec![aw]),
                    Operation::new("Tc", vec![ac]),
                    Operation::new("T*", vec![]),
                ];
                self.show(op, &items, prefix);
            }
            "Do" => {
                self.draw_xobject(&op);
                self.out.push(op);
            }
            "BI" => {
                let bounds = self.state.ctm.apply_rect(&UNIT_SQUARE);
                if self.hits(&bounds) {
                    self.dropping_inline_image = true;
                    self.outcome.inline_images_removed += 1;
                    self.outcome.changed = true;
                } else {
                    self.out.push(op);
                }
            }
            "ID" | "EI" => {
                let ends_image = op.operator == "EI";
                if !self.dropping_inline_image {
                    self.out.push(op);
                }
                if ends_image {
                    self.dropping_inline_image = false;
                }
            }
            "BMC" | "BDC" => {
                let tagged = op.operands.first().and_then(name) == Some(REDACTION_TAG);
                self.marked.push(tagged);
                self.out.push(op);
            }
            "EMC" => {
                self.marked.pop();
                self.out.push(op);
            }
            _ => self.out.push(op),
        }
    }

    fn finish(mut self) -> Result<FilterOutcome, RedactError> {
        self.flush_path();
        if self.in_text {
            self.out.push(Operation::new("ET", vec![]));
            self.outcome.changed = true;
        }
        for _ in 0..self.saved.len() {
            self.out.push(Operation::new("Q", vec![]));
            self.outcome.changed = true;
        }

        let content = Content {
            operations: self.out,
        };
        self.outcome.content = content
            .encode()
            .map_err(|e| RedactError::RedactionApply(format!("cannot encode content stream: {}", e)))?;
        Ok(self.outcome)
    }

    fn hits(&self, bounds: &Rect) -> bool {
        self.regions.iter().any(|region| bounds.intersects(region))
    }

    fn protected(&self) -> bool {
        self.marked.iter().any(|tagged| *tagged)
    }

    fn move_line(&mut self, tx: f64, ty: f64) {
        self.tlm = Matrix::translate(tx, ty).then(&self.tlm);
        self.tm = self.tlm;
    }

    fn next_line(&mut self) {
        let leading = self.state.text.leading;
        self.move_line(0.0, -leading);
    }

    fn extend_path(&mut self, op: Operation) {
        let values: Vec<f64> = op.operands.iter().filter_map(number).collect();
        let points: Vec<(f64, f64)> = if op.operator == "re" {
            match values.as_slice() {
                [x, y, w, h] => vec![(*x, *y), (x + w, *y), (x + w, y + h), (*x, y + h)],
                _ => Vec::new(),
            }
        } else {
            values.chunks_exact(2).map(|p| (p[0], p[1])).collect()
        };

        let ctm = self.state.ctm;
        let mapped = points.into_iter().map(|(x, y)| ctm.apply(x, y));
        if let Some(bounds) = Rect::bounding(mapped) {
            self.path_bounds = Some(match self.path_bounds {
                Some(existing) => existing.union(&bounds),
                None => bounds,
            });
        }
        self.path.push(op);
    }

    fn paint_path(&mut self, op: Operation) {
        let stroked = matches!(
            op.operator.as_str(),
            "S" | "s" | "B" | "B*" | "b" | "b*"
        );
        let bounds = self.path_bounds.take().map(|b| {
            if stroked {
                let m = &self.state.ctm;
                let half = self.state.line_width.abs() * (m.a * m.d - m.b * m.c).abs().sqrt() / 2.0;
                Rect::new(b.min_x - half, b.min_y - half, b.max_x + half, b.max_y + half)
            } else {
                b
            }
        });
        let path = std::mem::take(&mut self.path);
        let clipping = std::mem::replace(&mut self.clipping, false);

        let hit = !self.protected() && bounds.is_some_and(|b| self.hits(&b));
        if !hit {
            self.out.extend(path);
            self.out.push(op);
            return;
        }

        self.outcome.changed = true;
        if op.operator != "n" {
            self.outcome.paths_removed += 1;
        }
        if clipping {
            self.out.extend(path);
            self.out.push(Operation::new("n", vec![]));
        }
    }

    fn flush_path(&mut self) {
        if !self.path.is_empty() {
            self.out.append(&mut self.path);
        }
        self.path_bounds = None;
        self.clipping = false;
    }

    fn draw_xobject(&mut self, op: &Operation) {
        let resources = self.resources;
        let Some((xobject_name, xobject)) = op
            .operands
            .first()
            .and_then(name)
            .and_then(|n| resources.xobject(n).map(|x| (n.to_vec(), x)))
        else {
            return;
        };
        match xobject {
            XObject::Image { id } => {
                let bounds = self.state.ctm.apply_rect(&UNIT_SQUARE);
                if self.hits(&bounds) {
                    self.outcome.images.push(XObjectHit {
                        name: xobject_name,
                        id: *id,
                        ctm: self.state.ctm,
                    });
                }
            }
            XObject::Form { id, matrix, bbox } => {
                let ctm = matrix.then(&self.state.ctm);
                let hit = bbox.map_or(true, |b| self.hits(&ctm.apply_rect(&b)));
                if hit {
                    self.outcome.forms.push(XObjectHit {
                        name: xobject_name,
                        id: *id,
                        ctm,
                    });
                }
            }
        }
    }

    /// Run a text-showing operator, rewriting it as `TJ` when glyphs go.
    fn show(&mut self, original: Operation, items: &[Object], prefix: Vec<Operation>) {
        let resources = self.resources;
        let font = resources.font(self.state.text.font.as_deref());
        let text = self.state.text.clone();
        let scale = text.size * text.horizontal_scaling;

        let mut pieces: Vec<Piece> = Vec::new();
        let mut removed = 0;
        for item in items {
            match item {
                Object::String(bytes, format) => {
                    for (code, code_bytes) in font.codes(bytes) {
                        let (advance, bounds) = self.glyph(font, &text, code, code_bytes.len());
                        if self.hits(&bounds) {
                            removed += 1;
                            if scale != 0.0 {
                                push_shift(&mut pieces, -advance * 1000.0 / scale);
                            }
                        } else {
                            push_text(&mut pieces, code_bytes, format);
                        }
                        self.tm = Matrix::translate(advance, 0.0).then(&self.tm);
                    }
                }
                other => {
                    if let Some(adjust) = number(other) {
                        push_shift(&mut pieces, adjust);
                        self.tm = Matrix::translate(-adjust / 1000.0 * scale, 0.0).then(&self.tm);
                    }
                }
            }
        }

        if removed == 0 {
            self.out.push(original);
            return;
        }

        self.outcome.glyphs_removed += removed;
        self.outcome.changed = true;
        let array = pieces
            .into_iter()
            .map(|piece| match piece {
                Piece::Text(bytes, format) => Object::String(bytes, format),
                Piece::Shift(value) => Object::Real(value as f32),
            })
            .collect();
        self.out.extend(prefix);
        self.out.push(Operation::new("TJ", vec![Object::Array(array)]));
    }

    /// Advance and user-space box of one glyph at the current text position.
    fn glyph(&self, font: &FontMetrics, text: &TextState, code: u32, byte_len: usize) -> (f64, Rect) {
        let width = font.glyph_width(code);
        let mut spacing = text.char_spacing;
        if font.is_word_space(code, byte_len) {
            spacing += text.word_spacing;
        }
        let advance = (width * text.size + spacing) * text.horizontal_scaling;
        let glyph_box = Rect::new(
            0.0,
            text.rise + font.descent() * text.size,
            width * text.size * text.horizontal_scaling,
            text.rise + font.ascent() * text.size,
        );
        let bounds = self.tm.then(&self.state.ctm).apply_rect(&glyph_box);
        (advance, bounds)
    }
}

fn push_text(pieces: &mut Vec<Piece>, bytes: &[u8], format: &StringFormat) {
    if let Some(Piece::Text(existing, existing_format)) = pieces.last_mut() {
        if std::mem::discriminant(existing_format) == std::mem::discriminant(format) {
            existing.extend_from_slice(bytes);
            return;
        }
    }
    pieces.push(Piece::Text(bytes.to_vec(), format.clone()));
}

fn push_shift(pieces: &mut Vec<Piece>, value: f64) {
    if let Some(Piece::Shift(existing)) = pieces.last_mut() {
        *existing += value;
        return;
    }
    pieces.push(Piece::Shift(value));
}

fn operand(op: &Operation, index: usize) -> Option<f64> {
    op.operands.get(index).and_then(number)
}

fn matrix_operands(op: &Operation) -> Option<Matrix> {
    let values: Vec<f64> = op.operands.iter().map(number).collect::<Option<_>>()?;
    crate::pdf::matrix_from(&values)
}
