//! Glyph metrics for locating text in a content stream
//!
//! Only what is needed to estimate a glyph's box: advance widths, ascent,
//! descent and how many bytes a character code takes. Unknown fonts fall
//! back to half-em glyphs, which errs on the side of removing too much.
//!
//! Composite fonts split codes with their CMap. Identity CMaps and embedded
//! CMap streams are understood; other predefined CMaps are read as two-byte
//! codes of the widest known glyph, since their code to CID tables are not
//! bundled.

use std::collections::HashMap;

use lopdf::{Dictionary, Document, Object};

use crate::pdf::{get, get_dict, get_number, number, numbers, resolve, stream_data};

const DEFAULT_WIDTH: f64 = 500.0;
const DEFAULT_ASCENT: f64 = 800.0;
const DEFAULT_DESCENT: f64 = -200.0;
const GLYPH_SCALE: f64 = 0.001;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FontMetrics {
    first_char: u32,
    widths: Vec<f64>,
    cid_widths: HashMap<u32, f64>,
    default_width: f64,
    ascent: f64,
    descent: f64,
    horizontal_scale: f64,
    vertical_scale: f64,
    code_map: CodeMap,
}

/// How string bytes split into codes, and how codes become CIDs.
#[derive(Debug, Clone, PartialEq)]
enum CodeMap {
    /// Simple font: one byte per code, widths indexed by code
    Simple,
    /// `Identity-H` / `Identity-V`: two-byte codes equal to CIDs
    Identity,
    /// Embedded CMap stream
    Embedded {
        codespace: Vec<CodespaceRange>,
        cids: Vec<CidRange>,
    },
    /// Predefined CMap without a bundled table
    Opaque,
}

#[derive(Debug, Clone, PartialEq)]
struct CodespaceRange {
    low: Vec<u8>,
    high: Vec<u8>,
}

impl CodespaceRange {
    fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.low.len()
            && self
                .low
                .iter()
                .zip(&self.high)
                .zip(bytes)
                .all(|((low, high), b)| (*low..=*high).contains(b))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CidRange {
    low: u32,
    high: u32,
    cid: u32,
}

impl Default for FontMetrics {
    fn default() -> Self {
        Self {
            first_char: 0,
            widths: Vec::new(),
            cid_widths: HashMap::new(),
            default_width: DEFAULT_WIDTH,
            ascent: DEFAULT_ASCENT,
            descent: DEFAULT_DESCENT,
            horizontal_scale: GLYPH_SCALE,
            vertical_scale: GLYPH_SCALE,
            code_map: CodeMap::Simple,
        }
    }
}

impl FontMetrics {
    pub(crate) fn from_dict(doc: &Document, font: &Dictionary) -> Self {
        match get(doc, font, b"Subtype").and_then(crate::pdf::name) {
            Some(b"Type0") => Self::composite(doc, font),
            Some(b"Type3") => Self::type3(doc, font),
            _ => Self::simple(doc, font),
        }
    }

    fn simple(doc: &Document, font: &Dictionary) -> Self {
        let mut metrics = FontMetrics {
            first_char: get_number(doc, font, b"FirstChar").unwrap_or(0.0).max(0.0) as u32,
            widths: get(doc, font, b"Widths")
                .and_then(|o| numbers(doc, o))
                .unwrap_or_default(),
            ..FontMetrics::default()
        };
        if let Some(descriptor) = get_dict(doc, font, b"FontDescriptor") {
            metrics.apply_descriptor(doc, descriptor);
        }
        metrics
    }

    fn type3(doc: &Document, font: &Dictionary) -> Self {
        let mut metrics = Self::simple(doc, font);
        let matrix = get(doc, font, b"FontMatrix")
            .and_then(|o| numbers(doc, o))
            .filter(|m| m.len() == 6)
            .unwrap_or_else(|| vec![GLYPH_SCALE, 0.0, 0.0, GLYPH_SCALE, 0.0, 0.0]);
        metrics.horizontal_scale = matrix[0].abs();
        metrics.vertical_scale = matrix[3].abs();

        // Type 3 glyph space is arbitrary, so take the vertical extent from FontBBox
        if let Some(bbox) = get(doc, font, b"FontBBox")
            .and_then(|o| numbers(doc, o))
            .filter(|b| b.len() == 4 && b[3] > b[1])
        {
            metrics.descent = bbox[1];
            metrics.ascent = bbox[3];
        } else {
            metrics.descent = DEFAULT_DESCENT * GLYPH_SCALE / metrics.vertical_scale.max(f64::EPSILON);
            metrics.ascent = DEFAULT_ASCENT * GLYPH_SCALE / metrics.vertical_scale.max(f64::EPSILON);
        }
        if metrics.widths.is_empty() {
            metrics.default_width =
                DEFAULT_WIDTH * GLYPH_SCALE / metrics.horizontal_scale.max(f64::EPSILON);
        }
        metrics
    }

    fn composite(doc: &Document, font: &Dictionary) -> Self {
        let code_map = match get(doc, font, b"Encoding") {
            None => CodeMap::Identity,
            Some(Object::Name(n)) if n.starts_with(b"Identity-") => CodeMap::Identity,
            Some(Object::Stream(cmap)) => parse_cmap(&stream_data(cmap).unwrap_or_default()),
            Some(_) => CodeMap::Opaque,
        };
        let mut metrics = FontMetrics {
            code_map,
            default_width: 1000.0,
            ..FontMetrics::default()
        };

        let descendant = get(doc, font, b"DescendantFonts").and_then(|o| match o {
            Object::Array(items) => match items.first().map(|d| resolve(doc, d)) {
                Some(Object::Dictionary(d)) => Some(d),
                _ => None,
            },
            _ => None,
        });
        let Some(descendant) = descendant else {
            return metrics;
        };

        if let Some(dw) = get_number(doc, descendant, b"DW") {
            metrics.default_width = dw;
        }
        if let Some(Object::Array(w)) = get(doc, descendant, b"W") {
            metrics.cid_widths = parse_cid_widths(doc, w);
        }
        if let Some(descriptor) = get_dict(doc, descendant, b"FontDescriptor") {
            metrics.apply_descriptor(doc, descriptor);
        }
        metrics
    }

    fn apply_descriptor(&mut self, doc: &Document, descriptor: &Dictionary) {
        let ascent = get_number(doc, descriptor, b"Ascent").unwrap_or(0.0);
        let descent = get_number(doc, descriptor, b"Descent").unwrap_or(0.0);
        // Plenty of producers write zeros here
        if ascent > descent && ascent > 0.0 {
            self.ascent = ascent;
            self.descent = descent.min(0.0);
        }
        if let Some(missing) = get_number(doc, descriptor, b"MissingWidth").filter(|w| *w > 0.0) {
            self.default_width = missing;
        }
    }

    /// Bytes taken by the code starting at `bytes`.
    fn code_length(&self, bytes: &[u8]) -> usize {
        match &self.code_map {
            CodeMap::Simple => 1,
            CodeMap::Identity | CodeMap::Opaque => 2,
            CodeMap::Embedded { codespace, .. } => codespace
                .iter()
                .find(|range| range.matches(bytes))
                .or_else(|| codespace.iter().min_by_key(|range| range.low.len()))
                .map_or(2, |range| range.low.len()),
        }
    }

    /// Split a string operand into `(code, bytes)` pairs.
    pub(crate) fn codes<'a>(&self, bytes: &'a [u8]) -> Vec<(u32, &'a [u8])> {
        let mut codes = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(self.code_length(rest).clamp(1, rest.len()));
            codes.push((code_value(chunk), chunk));
            rest = tail;
        }
        codes
    }

    /// Advance width in text space units per unit of font size.
    pub(crate) fn glyph_width(&self, code: u32) -> f64 {
        let width = match &self.code_map {
            CodeMap::Simple => code
                .checked_sub(self.first_char)
                .and_then(|i| self.widths.get(i as usize).copied()),
            CodeMap::Identity => self.cid_widths.get(&code).copied(),
            CodeMap::Embedded { cids, .. } => cids
                .iter()
                .find(|range| (range.low..=range.high).contains(&code))
                .and_then(|range| self.cid_widths.get(&(range.cid + (code - range.low))))
                .copied(),
            // Unknown CID, assume the widest glyph
            CodeMap::Opaque => Some(
                self.cid_widths
                    .values()
                    .fold(self.default_width, |widest, w| widest.max(*w)),
            ),
        };
        width.unwrap_or(self.default_width) * self.horizontal_scale
    }

    pub(crate) fn ascent(&self) -> f64 {
        self.ascent * self.vertical_scale
    }

    pub(crate) fn descent(&self) -> f64 {
        self.descent * self.vertical_scale
    }

    /// Word spacing only applies to the single-byte code 32.
    pub(crate) fn is_word_space(&self, code: u32, byte_len: usize) -> bool {
        byte_len == 1 && code == 32
    }

    #[cfg(test)]
    pub(crate) fn with_widths(first_char: u32, widths: Vec<f64>) -> Self {
        Self {
            first_char,
            widths,
            ..Self::default()
        }
    }
}

fn code_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

#[derive(Debug, Clone, PartialEq)]
enum CmapToken {
    Hex(Vec<u8>),
    Int(u32),
    Word(Vec<u8>),
}

fn cmap_tokens(data: &[u8]) -> Vec<CmapToken> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b == b'%' {
            while i < data.len() && data[i] != b'\n' && data[i] != b'\r' {
                i += 1;
            }
            continue;
        }
        if b == b'<' && data.get(i + 1) != Some(&b'<') {
            let end = data[i..]
                .iter()
                .position(|c| *c == b'>')
                .map_or(data.len(), |p| i + p);
            let digits: Vec<u8> = data[i + 1..end]
                .iter()
                .filter(|c| c.is_ascii_hexdigit())
                .copied()
                .collect();
            tokens.push(CmapToken::Hex(hex_bytes(&digits)));
            i = end + 1;
            continue;
        }
        let start = i;
        while i < data.len() && !data[i].is_ascii_whitespace() && !b"<>[](){}/%".contains(&data[i]) {
            i += 1;
        }
        if start == i {
            // Whitespace or a delimiter we have no use for
            i += 1;
            continue;
        }
        let word = &data[start..i];
        match std::str::from_utf8(word).ok().and_then(|w| w.parse::<u32>().ok()) {
            Some(n) => tokens.push(CmapToken::Int(n)),
            None => tokens.push(CmapToken::Word(word.to_vec())),
        }
    }
    tokens
}

/// Hex digits to bytes; an odd trailing digit is padded with 0.
fn hex_bytes(digits: &[u8]) -> Vec<u8> {
    let value = |d: u8| (d as char).to_digit(16).unwrap_or(0) as u8;
    digits
        .chunks(2)
        .map(|pair| (value(pair[0]) << 4) | pair.get(1).map_or(0, |d| value(*d)))
        .collect()
}

/// Codespace ranges and CID mappings of an embedded CMap.
fn parse_cmap(data: &[u8]) -> CodeMap {
    let tokens = cmap_tokens(data);
    let mut codespace = Vec::new();
    let mut cids = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let CmapToken::Word(word) = &tokens[i] else {
            i += 1;
            continue;
        };
        i += 1;
        match word.as_slice() {
            b"begincodespacerange" => {
                while let (Some(CmapToken::Hex(low)), Some(CmapToken::Hex(high))) =
                    (tokens.get(i), tokens.get(i + 1))
                {
                    if !low.is_empty() && low.len() == high.len() {
                        codespace.push(CodespaceRange {
                            low: low.clone(),
                            high: high.clone(),
                        });
                    }
                    i += 2;
                }
            }
            b"begincidrange" => {
                while let (Some(CmapToken::Hex(low)), Some(CmapToken::Hex(high)), Some(CmapToken::Int(cid))) =
                    (tokens.get(i), tokens.get(i + 1), tokens.get(i + 2))
                {
                    cids.push(CidRange {
                        low: code_value(low),
                        high: code_value(high),
                        cid: *cid,
                    });
                    i += 3;
                }
            }
            b"begincidchar" => {
                while let (Some(CmapToken::Hex(code)), Some(CmapToken::Int(cid))) =
                    (tokens.get(i), tokens.get(i + 1))
                {
                    let code = code_value(code);
                    cids.push(CidRange {
                        low: code,
                        high: code,
                        cid: *cid,
                    });
                    i += 2;
                }
            }
            _ => {}
        }
    }

    if codespace.is_empty() {
        CodeMap::Opaque
    } else {
        CodeMap::Embedded { codespace, cids }
    }
}

/// Parse a CIDFont `W` array: `c [w1 w2 ...]` or `c_first c_last w`.
fn parse_cid_widths(doc: &Document, w: &[Object]) -> HashMap<u32, f64> {
    let mut widths = HashMap::new();
    let mut i = 0;
    while i < w.len() {
        let Some(first) = number(resolve(doc, &w[i])) else {
            break;
        };
        let first = first.max(0.0) as u32;
        match w.get(i + 1).map(|o| resolve(doc, o)) {
            Some(Object::Array(list)) => {
                for (offset, value) in list.iter().enumerate() {
                    if let Some(width) = number(resolve(doc, value)) {
                        widths.insert(first + offset as u32, width);
                    }
                }
                i += 2;
            }
            Some(last) => {
                let (Some(last), Some(width)) = (
                    number(last),
                    w.get(i + 2).and_then(|o| number(resolve(doc, o))),
                ) else {
                    break;
                };
                // Cap runaway ranges from broken files
                let last = (last.max(0.0) as u32).min(first.saturating_add(0xFFFF));
                for cid in first..=last {
                    widths.insert(cid, width);
                }
                i += 3;
            }
            None => break,
        }
    }
    widths
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    #[test]
    fn test_simple_font_reads_widths_and_descriptor() {
        let mut doc = Document::with_version("1.7");
        let descriptor_id = doc.add_object(dictionary! {
            "Type" => "FontDescriptor",
            "Ascent" => 718,
            "Descent" => -207,
        });
        let font = dictionary! {
            "Type" => "Font",
            "Subtype" => "TrueType",
            "FirstChar" => 65,
            "Widths" => vec![600.into(), 700.into()],
            "FontDescriptor" => descriptor_id,
        };
        let metrics = FontMetrics::from_dict(&doc, &font);
        assert!((metrics.glyph_width(65) - 0.6).abs() < 1e-9);
        assert!((metrics.glyph_width(66) - 0.7).abs() < 1e-9);
        // Outside the Widths range falls back to half an em
        assert!((metrics.glyph_width(90) - 0.5).abs() < 1e-9);
        assert!((metrics.ascent() - 0.718).abs() < 1e-9);
        assert!((metrics.descent() + 0.207).abs() < 1e-9);
    }

    #[test]
    fn test_standard_font_without_widths_uses_defaults() {
        let doc = Document::with_version("1.7");
        let font = dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        };
        let metrics = FontMetrics::from_dict(&doc, &font);
        assert_eq!(metrics.codes(b"Sm").len(), 2);
        assert!((metrics.glyph_width(b'S' as u32) - 0.5).abs() < 1e-9);
        assert!((metrics.ascent() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_composite_font_uses_two_byte_codes_and_w_array() {
        let doc = Document::with_version("1.7");
        let descendant = dictionary! {
            "Type" => "Font",
            "Subtype" => "CIDFontType2",
            "DW" => 1000,
            "W" => vec![
                1.into(),
                Object::Array(vec![250.into(), 300.into()]),
                10.into(),
                12.into(),
                400.into(),
            ],
        };
        let font = dictionary! {
            "Type" => "Font",
            "Subtype" => "Type0",
            "Encoding" => "Identity-H",
            "DescendantFonts" => vec![Object::Dictionary(descendant)],
        };
        let metrics = FontMetrics::from_dict(&doc, &font);
        let codes: Vec<u32> = metrics.codes(&[0, 1, 0, 11]).into_iter().map(|(c, _)| c).collect();
        assert_eq!(codes, vec![1, 11]);
        assert!((metrics.glyph_width(2) - 0.3).abs() < 1e-9);
        assert!((metrics.glyph_width(11) - 0.4).abs() < 1e-9);
        assert!((metrics.glyph_width(99) - 1.0).abs() < 1e-9);
        assert!(!metrics.is_word_space(32, 2));
    }

    fn cid_descendant() -> Dictionary {
        dictionary! {
            "Type" => "Font",
            "Subtype" => "CIDFontType0",
            "DW" => 1000,
            "W" => vec![
                100.into(),
                Object::Array(vec![250.into(), 300.into()]),
                500.into(),
                500.into(),
                800.into(),
            ],
        }
    }

    #[test]
    fn test_embedded_cmap_splits_mixed_length_codes() {
        let mut doc = Document::with_version("1.7");
        let cmap = b"/CIDInit /ProcSet findresource begin\n\
            12 dict begin\nbegincmap\n\
            % one-byte ASCII, two-byte from 0x81\n\
            2 begincodespacerange\n<00> <80>\n<8140> <9FFC>\nendcodespacerange\n\
            1 begincidrange\n<41> <42> 100\nendcidrange\n\
            1 begincidchar\n<8140> 500\nendcidchar\n\
            endcmap\n";
        let cmap_id = doc.add_object(lopdf::Stream::new(dictionary! { "Type" => "CMap" }, cmap.to_vec()));
        let font = dictionary! {
            "Type" => "Font",
            "Subtype" => "Type0",
            "Encoding" => cmap_id,
            "DescendantFonts" => vec![Object::Dictionary(cid_descendant())],
        };
        let metrics = FontMetrics::from_dict(&doc, &font);

        let codes: Vec<u32> = metrics
            .codes(&[0x41, 0x81, 0x40, 0x42])
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        assert_eq!(codes, vec![0x41, 0x8140, 0x42]);
        assert!((metrics.glyph_width(0x41) - 0.25).abs() < 1e-9);
        assert!((metrics.glyph_width(0x42) - 0.3).abs() < 1e-9);
        assert!((metrics.glyph_width(0x8140) - 0.8).abs() < 1e-9);
        // Unmapped codes take the default width
        assert!((metrics.glyph_width(0x50) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_predefined_cmap_assumes_widest_glyph() {
        let doc = Document::with_version("1.7");
        let font = dictionary! {
            "Type" => "Font",
            "Subtype" => "Type0",
            "Encoding" => "UniJIS-UCS2-H",
            "DescendantFonts" => vec![Object::Dictionary(cid_descendant())],
        };
        let metrics = FontMetrics::from_dict(&doc, &font);
        assert_eq!(metrics.codes(&[0x30, 0x42, 0x30, 0x44]).len(), 2);
        assert!((metrics.glyph_width(0x3042) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cmap_hex_tokens_pad_odd_digits() {
        assert_eq!(
            cmap_tokens(b"<8 1> 7 begincidchar"),
            vec![
                CmapToken::Hex(vec![0x81]),
                CmapToken::Int(7),
                CmapToken::Word(b"begincidchar".to_vec()),
            ]
        );
        assert_eq!(hex_bytes(b"abc"), vec![0xab, 0xc0]);
    }
}
