//! lopdf plumbing shared by the redaction passes

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use weezl::{decode::Decoder as LzwDecoder, BitOrder};

use crate::error::RedactError;
use crate::fonts::FontMetrics;
use crate::geometry::{Matrix, PageSpace, Rect};

/// Follow indirect references, giving up on cycles.
pub(crate) fn resolve<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    let mut current = object;
    for _ in 0..16 {
        match current {
            Object::Reference(id) => match doc.get_object(*id) {
                Ok(next) => current = next,
                Err(_) => return current,
            },
            _ => return current,
        }
    }
    current
}

pub(crate) fn number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

pub(crate) fn name(object: &Object) -> Option<&[u8]> {
    match object {
        Object::Name(n) => Some(n.as_slice()),
        _ => None,
    }
}

pub(crate) fn get<'a>(doc: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    dict.get(key).ok().map(|o| resolve(doc, o))
}

pub(crate) fn get_number(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<f64> {
    get(doc, dict, key).and_then(number)
}

pub(crate) fn get_dict<'a>(doc: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Dictionary> {
    match get(doc, dict, key)? {
        Object::Dictionary(d) => Some(d),
        Object::Stream(s) => Some(&s.dict),
        _ => None,
    }
}

pub(crate) fn numbers(doc: &Document, object: &Object) -> Option<Vec<f64>> {
    match resolve(doc, object) {
        Object::Array(items) => items.iter().map(|o| number(resolve(doc, o))).collect(),
        _ => None,
    }
}

pub(crate) fn rect_from(values: &[f64]) -> Option<Rect> {
    match values {
        [x0, y0, x1, y1] => Some(Rect::new(*x0, *y0, *x1, *y1)),
        _ => None,
    }
}

pub(crate) fn matrix_from(values: &[f64]) -> Option<Matrix> {
    match values {
        [a, b, c, d, e, f] => Some(Matrix::new(*a, *b, *c, *d, *e, *f)),
        _ => None,
    }
}

/// Page attribute, searched up the page tree for inheritable keys.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..32 {
        if let Some(value) = get(doc, node, key) {
            return Some(value);
        }
        node = match get(doc, node, b"Parent")? {
            Object::Dictionary(parent) => parent,
            _ => return None,
        };
    }
    None
}

pub(crate) fn page_space(doc: &Document, page_id: ObjectId) -> PageSpace {
    let media_box = inherited(doc, page_id, b"MediaBox")
        .and_then(|o| numbers(doc, o))
        .and_then(|v| rect_from(&v))
        // Default US Letter
        .unwrap_or(Rect::new(0.0, 0.0, 612.0, 792.0));
    let page_box = inherited(doc, page_id, b"CropBox")
        .and_then(|o| numbers(doc, o))
        .and_then(|v| rect_from(&v))
        .filter(|r| r.width() > 0.0 && r.height() > 0.0)
        .unwrap_or(media_box);
    let rotation = inherited(doc, page_id, b"Rotate")
        .and_then(number)
        .map(|r| r as i64)
        .unwrap_or(0);
    PageSpace::new(page_box, rotation)
}

pub(crate) fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    match inherited(doc, page_id, b"Resources")? {
        Object::Dictionary(d) => Some(d),
        _ => None,
    }
}

/// Resources a page or form XObject draws with; pages inherit theirs.
pub(crate) fn holder_resources(doc: &Document, holder: ObjectId) -> Option<&Dictionary> {
    match doc.get_object(holder).ok()? {
        Object::Stream(stream) => get_dict(doc, &stream.dict, b"Resources"),
        Object::Dictionary(_) => page_resources(doc, holder),
        _ => None,
    }
}

/// Point `/XObject /<name>` in the resources of `holder` at `target`.
///
/// The holder is given direct copies of its resource and XObject
/// dictionaries first, so anything else sharing them keeps the original.
pub(crate) fn repoint_xobject(
    doc: &mut Document,
    holder: ObjectId,
    xobject_name: &[u8],
    target: ObjectId,
) -> Result<(), RedactError> {
    let mut resources = holder_resources(doc, holder)
        .cloned()
        .unwrap_or_else(Dictionary::new);
    let mut xobjects = get_dict(doc, &resources, b"XObject")
        .cloned()
        .unwrap_or_else(Dictionary::new);
    xobjects.set(xobject_name.to_vec(), Object::Reference(target));
    resources.set("XObject", Object::Dictionary(xobjects));

    let dict = match doc
        .get_object_mut(holder)
        .map_err(|e| RedactError::RedactionApply(e.to_string()))?
    {
        Object::Dictionary(dict) => dict,
        Object::Stream(stream) => &mut stream.dict,
        _ => {
            return Err(RedactError::RedactionApply(format!(
                "object {} {} cannot hold resources",
                holder.0, holder.1
            )))
        }
    };
    dict.set("Resources", Object::Dictionary(resources));
    Ok(())
}

/// Decoded bytes of a stream with direct `/Filter` and `/DecodeParms` entries.
pub(crate) fn stream_data(stream: &Stream) -> Result<Vec<u8>, RedactError> {
    decode_chain(&filter_chain(None, &stream.dict), &stream.content)
}

/// One entry of a stream's filter chain.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FilterStep<'a> {
    pub name: Vec<u8>,
    pub params: Option<&'a Dictionary>,
}

/// Filters of a stream in decoding order, paired with their parameters.
///
/// Without a document, indirect filter entries are ignored.
pub(crate) fn filter_chain<'a>(doc: Option<&'a Document>, dict: &'a Dictionary) -> Vec<FilterStep<'a>> {
    let deref = move |object: &'a Object| -> &'a Object {
        match doc {
            Some(doc) => resolve(doc, object),
            None => object,
        }
    };

    let names: Vec<Vec<u8>> = match dict.get(b"Filter").ok().map(deref) {
        Some(Object::Name(n)) => vec![n.clone()],
        Some(Object::Array(items)) => items
            .iter()
            .filter_map(|o| name(deref(o)).map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    };
    let params: Vec<Option<&Dictionary>> = match dict.get(b"DecodeParms").ok().map(deref) {
        Some(Object::Dictionary(d)) => vec![Some(d)],
        Some(Object::Array(items)) => items
            .iter()
            .map(|o| match deref(o) {
                Object::Dictionary(d) => Some(d),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| FilterStep {
            name,
            params: params.get(i).copied().flatten(),
        })
        .collect()
}

/// Undo a chain of Flate and LZW filters, predictors included.
///
/// Image streams cannot go through `Stream::decompressed_content`, which
/// refuses `/Subtype /Image`, so both filters are decoded here.
pub(crate) fn decode_chain(chain: &[FilterStep<'_>], data: &[u8]) -> Result<Vec<u8>, RedactError> {
    let mut data = data.to_vec();
    for step in chain {
        data = match step.name.as_slice() {
            b"FlateDecode" | b"Fl" => inflate(&data)?,
            b"LZWDecode" | b"LZW" => {
                let early_change = step
                    .params
                    .and_then(|p| p.get(b"EarlyChange").ok())
                    .and_then(number)
                    .map_or(true, |v| v != 0.0);
                let mut decoder = if early_change {
                    LzwDecoder::with_tiff_size_switch(BitOrder::Msb, 8)
                } else {
                    LzwDecoder::new(BitOrder::Msb, 8)
                };
                decoder
                    .decode(&data)
                    .map_err(|e| RedactError::RedactionApply(format!("cannot decode LZW data: {}", e)))?
            }
            other => {
                return Err(RedactError::RedactionApply(format!(
                    "unsupported filter {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        if let Some(params) = step.params {
            data = unpredict(data, params)?;
        }
    }
    Ok(data)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, RedactError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| RedactError::RedactionApply(format!("cannot inflate stream: {}", e)))?;
    Ok(out)
}

/// Reverse a TIFF or PNG predictor described by `/DecodeParms`.
fn unpredict(data: Vec<u8>, params: &Dictionary) -> Result<Vec<u8>, RedactError> {
    let param = |key: &[u8], default: usize| {
        params
            .get(key)
            .ok()
            .and_then(number)
            .filter(|v| *v >= 1.0)
            .map_or(default, |v| v as usize)
    };
    let predictor = param(b"Predictor", 1);
    if predictor == 1 {
        return Ok(data);
    }

    let colors = param(b"Colors", 1);
    let bits = param(b"BitsPerComponent", 8);
    let columns = param(b"Columns", 1);
    let pixel_bits = colors
        .checked_mul(bits)
        .ok_or_else(|| RedactError::RedactionApply("predictor pixel size overflows".to_string()))?;
    let row_bytes = pixel_bits
        .checked_mul(columns)
        .map(|v| (v + 7) / 8)
        .ok_or_else(|| RedactError::RedactionApply("predictor row size overflows".to_string()))?;
    let pixel_bytes = (pixel_bits + 7) / 8;

    match predictor {
        2 if bits == 8 => Ok(tiff_unpredict(data, row_bytes, pixel_bytes)),
        10..=15 => png_unpredict(&data, row_bytes, pixel_bytes),
        _ => Err(RedactError::RedactionApply(format!(
            "unsupported predictor {} at {} bits",
            predictor, bits
        ))),
    }
}

fn tiff_unpredict(mut data: Vec<u8>, row_bytes: usize, pixel_bytes: usize) -> Vec<u8> {
    for row in data.chunks_mut(row_bytes) {
        for i in pixel_bytes..row.len() {
            row[i] = row[i].wrapping_add(row[i - pixel_bytes]);
        }
    }
    data
}

fn png_unpredict(data: &[u8], row_bytes: usize, pixel_bytes: usize) -> Result<Vec<u8>, RedactError> {
    let mut out = Vec::with_capacity(data.len());
    let mut previous = vec![0u8; row_bytes];
    // A trailing partial row carries no complete samples
    for chunk in data.chunks_exact(row_bytes + 1) {
        let tag = chunk[0];
        if tag > 4 {
            return Err(RedactError::RedactionApply(format!("invalid PNG row filter {}", tag)));
        }
        let mut row = chunk[1..].to_vec();
        for i in 0..row_bytes {
            let left = if i >= pixel_bytes { row[i - pixel_bytes] } else { 0 };
            let up = previous[i];
            let up_left = if i >= pixel_bytes { previous[i - pixel_bytes] } else { 0 };
            let delta = match tag {
                1 => left,
                2 => up,
                3 => ((left as u16 + up as u16) / 2) as u8,
                4 => paeth(left, up, up_left),
                _ => 0,
            };
            row[i] = row[i].wrapping_add(delta);
        }
        out.extend_from_slice(&row);
        previous = row;
    }
    Ok(out)
}

fn paeth(left: u8, up: u8, up_left: u8) -> u8 {
    let estimate = left as i16 + up as i16 - up_left as i16;
    let distance = |v: u8| (estimate - v as i16).abs();
    if distance(left) <= distance(up) && distance(left) <= distance(up_left) {
        left
    } else if distance(up) <= distance(up_left) {
        up
    } else {
        up_left
    }
}

/// All content streams of a page joined into one buffer.
pub(crate) fn page_content(doc: &Document, page_id: ObjectId) -> Result<Vec<u8>, RedactError> {
    let mut content = Vec::new();
    for id in doc.get_page_contents(page_id) {
        let stream = doc
            .get_object(id)
            .and_then(Object::as_stream)
            .map_err(|e| RedactError::RedactionApply(e.to_string()))?;
        content.extend(stream_data(stream)?);
        content.push(b'\n');
    }
    Ok(content)
}

pub(crate) fn page_contents_refs(doc: &Document, page_id: ObjectId) -> Vec<Object> {
    doc.get_page_contents(page_id)
        .into_iter()
        .map(Object::Reference)
        .collect()
}

pub(crate) fn set_page_contents(
    doc: &mut Document,
    page_id: ObjectId,
    contents: Vec<Object>,
) -> Result<(), RedactError> {
    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| RedactError::RedactionApply(e.to_string()))?;
    page.set("Contents", Object::Array(contents));
    Ok(())
}

pub(crate) fn add_stream(doc: &mut Document, content: Vec<u8>) -> ObjectId {
    doc.add_object(Stream::new(Dictionary::new(), content))
}

/// Replace a stream's payload with `raw` compressed as FlateDecode.
pub(crate) fn write_flate(stream: &mut Stream, raw: &[u8]) -> Result<(), RedactError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| RedactError::RedactionApply(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| RedactError::RedactionApply(e.to_string()))?;
    stream.dict.remove(b"DecodeParms");
    stream
        .dict
        .set("Filter", Object::Name(b"FlateDecode".to_vec()));
    stream.set_content(compressed);
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum XObject {
    Image {
        id: ObjectId,
    },
    Form {
        id: ObjectId,
        matrix: Matrix,
        bbox: Option<Rect>,
    },
}

/// Font metrics and external objects a content stream can name.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResourceView {
    fonts: HashMap<Vec<u8>, FontMetrics>,
    xobjects: HashMap<Vec<u8>, XObject>,
    fallback: FontMetrics,
}

impl ResourceView {
    pub(crate) fn from_resources(doc: &Document, resources: Option<&Dictionary>) -> Self {
        let mut view = ResourceView::default();
        let Some(resources) = resources else {
            return view;
        };

        if let Some(fonts) = get_dict(doc, resources, b"Font") {
            for (font_name, font) in fonts.iter() {
                if let Object::Dictionary(font) = resolve(doc, font) {
                    view.fonts
                        .insert(font_name.clone(), FontMetrics::from_dict(doc, font));
                }
            }
        }

        if let Some(xobjects) = get_dict(doc, resources, b"XObject") {
            for (xobject_name, reference) in xobjects.iter() {
                let Object::Reference(id) = reference else {
                    continue;
                };
                let Ok(Object::Stream(stream)) = doc.get_object(*id) else {
                    continue;
                };
                let xobject = match get(doc, &stream.dict, b"Subtype").and_then(name) {
                    Some(b"Image") => XObject::Image { id: *id },
                    Some(b"Form") => XObject::Form {
                        id: *id,
                        matrix: stream
                            .dict
                            .get(b"Matrix")
                            .ok()
                            .and_then(|o| numbers(doc, o))
                            .and_then(|v| matrix_from(&v))
                            .unwrap_or(Matrix::IDENTITY),
                        bbox: stream
                            .dict
                            .get(b"BBox")
                            .ok()
                            .and_then(|o| numbers(doc, o))
                            .and_then(|v| rect_from(&v)),
                    },
                    _ => continue,
                };
                view.xobjects.insert(xobject_name.clone(), xobject);
            }
        }

        view
    }

    pub(crate) fn font(&self, font_name: Option<&[u8]>) -> &FontMetrics {
        font_name
            .and_then(|n| self.fonts.get(n))
            .unwrap_or(&self.fallback)
    }

    pub(crate) fn xobject(&self, xobject_name: &[u8]) -> Option<&XObject> {
        self.xobjects.get(xobject_name)
    }

    #[cfg(test)]
    pub(crate) fn with_font(mut self, font_name: &str, metrics: FontMetrics) -> Self {
        self.fonts.insert(font_name.as_bytes().to_vec(), metrics);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_xobject(mut self, xobject_name: &str, xobject: XObject) -> Self {
        self.xobjects.insert(xobject_name.as_bytes().to_vec(), xobject);
        self
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    /// Single-page document drawing `texts` as `(x, y, text)` in 12pt Helvetica.
    pub fn text_pdf(texts: &[(i64, i64, &str)]) -> Vec<u8> {
        let mut operations = Vec::new();
        for (x, y, text) in texts {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new(
                "Tf",
                vec![Object::Name(b"F1".to_vec()), Object::Integer(12)],
            ));
            operations.push(Operation::new(
                "Td",
                vec![Object::Integer(*x), Object::Integer(*y)],
            ));
            operations.push(Operation::new(
                "Tj",
                vec![Object::string_literal(text.as_bytes().to_vec())],
            ));
            operations.push(Operation::new("ET", vec![]));
        }
        build(vec![operations])
    }

    /// Document with one page per entry, each page's content given as operations.
    pub fn build(pages: Vec<Vec<Operation>>) -> Vec<u8> {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids = Vec::new();
        for operations in pages {
            let content = Content { operations };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).unwrap();
        buffer
    }

    /// Concatenated decoded payload of every stream in the file.
    pub fn all_stream_text(bytes: &[u8]) -> Vec<u8> {
        let doc = Document::load_mem(bytes).unwrap();
        let mut out = Vec::new();
        for object in doc.objects.values() {
            if let Object::Stream(stream) = object {
                out.extend(super::stream_data(stream).unwrap_or_else(|_| stream.content.clone()));
                out.push(b'\n');
            }
        }
        out
    }

    pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    #[test]
    fn test_page_space_inherits_media_box_and_rotation() {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
                "Rotate" => 90,
            }),
        );

        let space = page_space(&doc, page_id);
        assert_eq!(space.page_box, Rect::new(0.0, 0.0, 595.0, 842.0));
        assert_eq!(space.rotation, 90);
        assert_eq!(space.render_size(), (842.0, 595.0));
    }

    #[test]
    fn test_crop_box_wins_over_media_box() {
        let mut doc = Document::with_version("1.7");
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "CropBox" => vec![10.into(), 20.into(), 600.into(), 780.into()],
        });
        let space = page_space(&doc, page_id);
        assert_eq!(space.page_box, Rect::new(10.0, 20.0, 600.0, 780.0));
    }

    #[test]
    fn test_write_flate_round_trips_through_lopdf() {
        let mut stream = Stream::new(dictionary! {}, b"raw".to_vec());
        write_flate(&mut stream, b"0 0 0 rg 1 1 5 5 re f").unwrap();
        assert_eq!(stream_data(&stream).unwrap(), b"0 0 0 rg 1 1 5 5 re f".to_vec());
    }

    #[test]
    fn test_flate_image_stream_is_decoded() {
        let mut stream = Stream::new(
            dictionary! { "Subtype" => "Image", "Width" => 2, "Height" => 1 },
            Vec::new(),
        );
        write_flate(&mut stream, &[10, 20]).unwrap();
        assert!(stream.decompressed_content().is_err());
        assert_eq!(stream_data(&stream).unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_lzw_with_early_change_is_decoded() {
        let encoded = weezl::encode::Encoder::with_tiff_size_switch(BitOrder::Msb, 8)
            .encode(b"ABABABABABABABAB")
            .unwrap();
        let stream = Stream::new(dictionary! { "Filter" => "LZWDecode" }, encoded);
        assert_eq!(stream_data(&stream).unwrap(), b"ABABABABABABABAB".to_vec());
    }

    #[test]
    fn test_png_predictor_rows_are_reconstructed() {
        // Two rows of three gray samples: Sub on the first, Up on the second
        let filtered = vec![1, 10, 5, 5, 2, 1, 1, 1];
        let params = dictionary! { "Predictor" => 12, "Columns" => 3 };
        assert_eq!(
            unpredict(filtered, &params).unwrap(),
            vec![10, 15, 20, 11, 16, 21]
        );
    }

    #[test]
    fn test_paeth_picks_nearest_neighbour() {
        assert_eq!(paeth(10, 20, 10), 20);
        assert_eq!(paeth(20, 10, 10), 20);
        assert_eq!(paeth(10, 10, 30), 10);
    }

    #[test]
    fn test_indirect_decode_parms_resolve_with_document() {
        let mut doc = Document::with_version("1.7");
        let params_id = doc.add_object(dictionary! { "Predictor" => 10, "Columns" => 1 });
        let dict = dictionary! {
            "Filter" => vec![Object::Name(b"FlateDecode".to_vec())],
            "DecodeParms" => vec![Object::Reference(params_id)],
        };
        let chain = filter_chain(Some(&doc), &dict);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].name, b"FlateDecode".to_vec());
        assert_eq!(
            chain[0].params.and_then(|p| p.get(b"Predictor").ok()).and_then(number),
            Some(10.0)
        );
        assert!(filter_chain(None, &dict)[0].params.is_none());
    }
}
