//! Geometry between OCR model space, render space and PDF user space
//!
//! - Model space: units the OCR engine reports polygons in, relative to the
//!   page width/height it measured.
//! - Render space: the page as displayed, top-left origin, y pointing down,
//!   in PDF points with the page rotation applied.
//! - User space: PDF default coordinates, bottom-left origin, y pointing up.

use serde::{Deserialize, Serialize};

use crate::error::RedactError;
use crate::layout::Polygon;

/// Axis-aligned rectangle given by its extremes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    /// Smallest rectangle covering all points. `None` for an empty iterator.
    pub fn bounding<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x, y) = iter.next()?;
        let mut rect = Rect {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        };
        for (x, y) in iter {
            rect.min_x = rect.min_x.min(x);
            rect.min_y = rect.min_y.min(y);
            rect.max_x = rect.max_x.max(x);
            rect.max_y = rect.max_y.max(y);
        }
        Some(rect)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ]
    }

    /// Open-interval overlap: rectangles that only touch along an edge do
    /// not intersect, a degenerate rectangle strictly inside another does.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
            || (self.is_degenerate() && other.contains_strictly(self.min_x, self.min_y))
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    fn is_degenerate(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    fn contains_strictly(&self, x: f64, y: f64) -> bool {
        x > self.min_x && x < self.max_x && y > self.min_y && y < self.max_y
    }
}

/// Reduce a model-space quadrilateral to a covering render-space rectangle.
pub fn map_to_rectangle(polygon: &Polygon, scale_x: f64, scale_y: f64) -> Result<Rect, RedactError> {
    if !(scale_x.is_finite() && scale_y.is_finite() && scale_x > 0.0 && scale_y > 0.0) {
        return Err(RedactError::MalformedPolygon(format!(
            "invalid scale factors ({}, {})",
            scale_x, scale_y
        )));
    }

    match polygon.vertex_count() {
        Some(4) => {}
        Some(n) => {
            return Err(RedactError::MalformedPolygon(format!(
                "expected 4 vertices, got {}",
                n
            )))
        }
        None => {
            return Err(RedactError::MalformedPolygon(format!(
                "odd coordinate count {}",
                polygon.coords().len()
            )))
        }
    }

    if polygon.coords().iter().any(|c| !c.is_finite()) {
        return Err(RedactError::MalformedPolygon(
            "non-finite coordinate".to_string(),
        ));
    }

    Rect::bounding(polygon.points().map(|p| (p.x * scale_x, p.y * scale_y))).ok_or_else(|| {
        RedactError::MalformedPolygon("polygon has no vertices".to_string())
    })
}

/// Per-page factors turning model units into render units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub x: f64,
    pub y: f64,
}

impl ScaleFactors {
    /// `render / model` for one page. Both sizes must belong to the same page.
    pub fn for_page(
        render_width: f64,
        render_height: f64,
        model_width: f64,
        model_height: f64,
    ) -> Result<Self, RedactError> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !(valid(render_width) && valid(render_height)) {
            return Err(RedactError::RedactionApply(format!(
                "invalid render size {}x{}",
                render_width, render_height
            )));
        }
        if !(valid(model_width) && valid(model_height)) {
            return Err(RedactError::RedactionApply(format!(
                "invalid model page size {}x{}",
                model_width, model_height
            )));
        }
        Ok(Self {
            x: render_width / model_width,
            y: render_height / model_height,
        })
    }
}

/// Affine transform `[a b c d e f]` in PDF row-vector convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    pub fn translate(tx: f64, ty: f64) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    /// `self × other`: apply `self` first, then `other`.
    pub fn then(&self, other: &Matrix) -> Matrix {
        Matrix {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            e: self.e * other.a + self.f * other.c + other.e,
            f: self.e * other.b + self.f * other.d + other.f,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x * self.a + y * self.c + self.e,
            x * self.b + y * self.d + self.f,
        )
    }

    pub fn apply_rect(&self, rect: &Rect) -> Rect {
        let corners = rect.corners().map(|(x, y)| self.apply(x, y));
        Rect::bounding(corners).unwrap_or(*rect)
    }

    pub fn invert(&self) -> Option<Matrix> {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let a = self.d / det;
        let b = -self.b / det;
        let c = -self.c / det;
        let d = self.a / det;
        Some(Matrix {
            a,
            b,
            c,
            d,
            e: -(self.e * a + self.f * c),
            f: -(self.e * b + self.f * d),
        })
    }
}

/// Visible area of a PDF page and how render space maps onto it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSpace {
    /// Crop box (or media box) in user space
    pub page_box: Rect,
    /// Clockwise display rotation, one of 0, 90, 180, 270
    pub rotation: u16,
}

impl PageSpace {
    pub fn new(page_box: Rect, rotation: i64) -> Self {
        let normalized = rotation.rem_euclid(360);
        let rotation = if normalized % 90 == 0 {
            normalized as u16
        } else {
            0
        };
        Self { page_box, rotation }
    }

    /// Width and height of the page as displayed.
    pub fn render_size(&self) -> (f64, f64) {
        let (w, h) = (self.page_box.width(), self.page_box.height());
        match self.rotation {
            90 | 270 => (h, w),
            _ => (w, h),
        }
    }

    /// Map a render-space point to user space.
    pub fn render_point_to_user(&self, x: f64, y: f64) -> (f64, f64) {
        let (w, h) = (self.page_box.width(), self.page_box.height());
        // Undo the display rotation, still in top-left/y-down coordinates
        let (ux, uy) = match self.rotation {
            90 => (y, h - x),
            180 => (w - x, h - y),
            270 => (w - y, x),
            _ => (x, y),
        };
        // Flip the y axis
        (self.page_box.min_x + ux, self.page_box.max_y - uy)
    }

    pub fn render_to_user(&self, rect: &Rect) -> Rect {
        let corners = rect
            .corners()
            .map(|(x, y)| self.render_point_to_user(x, y));
        Rect::bounding(corners).unwrap_or(*rect)
    }
}
