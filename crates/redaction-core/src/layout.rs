//! Layout analysis model
//!
//! Typed view of what the OCR/layout collaborator reports for a document:
//! the extracted text, per-page geometry (lines and words with their
//! bounding polygons) and optional key/value fields. Everything here is in
//! model space, i.e. relative to the page width/height the OCR engine used.

use serde::{Deserialize, Serialize};

/// A vertex in model-space units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Quadrilateral bounding a text fragment, stored as flat coordinates.
///
/// Accepts both wire shapes: the REST form `[x1, y1, ..., x4, y4]` and the
/// SDK form `[{"x": .., "y": ..}, ...]`. Validation of the vertex count is
/// left to the geometry mapper so that a bad polygon only skips one fragment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "PolygonRepr", into = "Vec<f64>")]
pub struct Polygon {
    coords: Vec<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PolygonRepr {
    Flat(Vec<f64>),
    Points(Vec<Point>),
}

impl From<PolygonRepr> for Polygon {
    fn from(repr: PolygonRepr) -> Self {
        match repr {
            PolygonRepr::Flat(coords) => Polygon { coords },
            PolygonRepr::Points(points) => Polygon::new(points),
        }
    }
}

impl From<Polygon> for Vec<f64> {
    fn from(polygon: Polygon) -> Self {
        polygon.coords
    }
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        let coords = points.iter().flat_map(|p| [p.x, p.y]).collect();
        Self { coords }
    }

    pub fn from_flat(coords: Vec<f64>) -> Self {
        Self { coords }
    }

    /// Axis-aligned rectangle helper, mostly for fixtures.
    pub fn from_bounds(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self::from_flat(vec![min_x, min_y, max_x, min_y, max_x, max_y, min_x, max_y])
    }

    pub fn coords(&self) -> &[f64] {
        &self.coords
    }

    /// Vertex count, or `None` when the coordinate list has a dangling value.
    pub fn vertex_count(&self) -> Option<usize> {
        if self.coords.len() % 2 == 0 {
            Some(self.coords.len() / 2)
        } else {
            None
        }
    }

    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.coords
            .chunks_exact(2)
            .map(|pair| Point { x: pair[0], y: pair[1] })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Line {
    pub content: String,
    #[serde(default)]
    pub polygon: Option<Polygon>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Word {
    pub content: String,
    #[serde(default)]
    pub polygon: Option<Polygon>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayoutPage {
    /// 0-based position of the page in the document
    pub number: usize,
    /// Model-space width used to interpret this page's polygons
    pub width: f64,
    /// Model-space height used to interpret this page's polygons
    pub height: f64,
    #[serde(default)]
    pub lines: Vec<Line>,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LayoutResult {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub pages: Vec<LayoutPage>,
}

impl LayoutResult {
    pub fn page(&self, number: usize) -> Option<&LayoutPage> {
        self.pages.get(number).filter(|p| p.number == number)
    }

    /// Check that page numbers are unique and match their position.
    pub fn validate(&self) -> Result<(), String> {
        for (index, page) in self.pages.iter().enumerate() {
            if page.number != index {
                return Err(format!(
                    "page at position {} reports number {}",
                    index, page.number
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundingRegion {
    /// 0-based page the region lives on
    #[serde(default)]
    pub page_number: usize,
    #[serde(default)]
    pub polygon: Option<Polygon>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldValue {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
}

/// Key/value pair extracted by a schema-aware layout model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    pub key: String,
    pub value: FieldValue,
}

impl Field {
    /// Page and polygon of the first bounding region, if it has one.
    pub fn anchor(&self) -> Option<(usize, &Polygon)> {
        let region = self.value.bounding_regions.first()?;
        region.polygon.as_ref().map(|p| (region.page_number, p))
    }

    /// Page the field claims to live on, even without a polygon.
    pub fn page_number(&self) -> Option<usize> {
        self.value.bounding_regions.first().map(|r| r.page_number)
    }
}

/// Everything the layout collaborator hands back for one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Extraction {
    pub layout: LayoutResult,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_polygon_accepts_flat_coordinates() {
        let polygon: Polygon = serde_json::from_str("[1, 2, 3, 4, 5, 6, 7, 8]").unwrap();
        assert_eq!(polygon.vertex_count(), Some(4));
        assert_eq!(polygon.points().nth(2), Some(Point { x: 5.0, y: 6.0 }));
    }

    #[test]
    fn test_polygon_accepts_point_objects() {
        let json = r#"[{"x":1,"y":2},{"x":3,"y":4},{"x":5,"y":6},{"x":7,"y":8}]"#;
        let polygon: Polygon = serde_json::from_str(json).unwrap();
        assert_eq!(polygon.coords(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_polygon_with_dangling_coordinate_has_no_vertex_count() {
        let polygon = Polygon::from_flat(vec![1.0, 2.0, 3.0]);
        assert_eq!(polygon.vertex_count(), None);
    }

    #[test]
    fn test_line_without_polygon_deserializes() {
        let line: Line = serde_json::from_str(r#"{"content":"Name: Jane"}"#).unwrap();
        assert!(line.polygon.is_none());
    }

    #[test]
    fn test_field_anchor_uses_first_region() {
        let field = Field {
            key: "Informant".to_string(),
            value: FieldValue {
                content: Some("Jane Doe".to_string()),
                bounding_regions: vec![
                    BoundingRegion {
                        page_number: 1,
                        polygon: Some(Polygon::from_bounds(0.0, 0.0, 1.0, 1.0)),
                    },
                    BoundingRegion {
                        page_number: 2,
                        polygon: None,
                    },
                ],
            },
        };
        let (page, _) = field.anchor().unwrap();
        assert_eq!(page, 1);
    }

    #[test]
    fn test_validate_rejects_out_of_order_pages() {
        let page = |number| LayoutPage {
            number,
            width: 1.0,
            height: 1.0,
            lines: vec![],
            words: vec![],
        };
        let good = LayoutResult {
            content: String::new(),
            pages: vec![page(0), page(1)],
        };
        assert!(good.validate().is_ok());

        let bad = LayoutResult {
            content: String::new(),
            pages: vec![page(1), page(0)],
        };
        assert!(bad.validate().is_err());
        assert!(bad.page(0).is_none());
    }
}
