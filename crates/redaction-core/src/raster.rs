//! Clearing raster samples under a redaction region
//!
//! The image is decoded to raw samples, the covered pixels are overwritten
//! and the result is written back Flate-compressed. JPEG data is decoded to
//! 8-bit gray or RGB first, since blacking out DCT blocks in place is not
//! possible.

use image::ImageFormat;
use lopdf::{Document, Object, ObjectId};

use crate::error::RedactError;
use crate::geometry::{Matrix, Rect};
use crate::pdf::{decode_chain, filter_chain, get, get_number, name, numbers, resolve, write_flate};

struct Samples {
    data: Vec<u8>,
    width: usize,
    height: usize,
    bits: usize,
    components: usize,
    fill: Vec<u32>,
    /// Colour space to record when the samples were transcoded from JPEG
    transcoded: Option<&'static str>,
}

/// Overwrite the pixels of image `id` that fall under `region`.
///
/// `placement` is the CTM the image was drawn with, mapping the unit square
/// onto the page. Returns whether any pixel changed.
pub(crate) fn clear_image_region(
    doc: &mut Document,
    id: ObjectId,
    placement: &Matrix,
    region: &Rect,
) -> Result<bool, RedactError> {
    let Some(inverse) = placement.invert() else {
        // Degenerate placement, nothing visible to clear
        return Ok(false);
    };

    let mut samples = read_samples(doc, id)?;
    let Some((cols, rows)) = pixel_span(&inverse, region, samples.width, samples.height) else {
        return Ok(false);
    };

    let (row_bytes, expected) = sample_layout(&samples).ok_or_else(|| {
        RedactError::RedactionApply(format!("image {} {} is too large to address", id.0, id.1))
    })?;
    if samples.data.len() < expected {
        return Err(RedactError::RedactionApply(format!(
            "image {} {} has {} sample bytes, expected {}",
            id.0,
            id.1,
            samples.data.len(),
            expected
        )));
    }

    for row in rows {
        let line = &mut samples.data[row * row_bytes..(row + 1) * row_bytes];
        for col in cols.clone() {
            for component in 0..samples.components {
                let index = col * samples.components + component;
                set_sample(line, index, samples.bits, samples.fill[component]);
            }
        }
    }

    let stream = doc
        .get_object_mut(id)
        .and_then(Object::as_stream_mut)
        .map_err(|e| RedactError::RedactionApply(e.to_string()))?;
    if let Some(color_space) = samples.transcoded {
        stream
            .dict
            .set("ColorSpace", Object::Name(color_space.as_bytes().to_vec()));
        stream.dict.set("BitsPerComponent", Object::Integer(8));
        stream.dict.remove(b"Decode");
    }
    write_flate(stream, &samples.data)?;
    Ok(true)
}

fn read_samples(doc: &Document, id: ObjectId) -> Result<Samples, RedactError> {
    let stream = doc
        .get_object(id)
        .and_then(Object::as_stream)
        .map_err(|e| RedactError::RedactionApply(e.to_string()))?;
    let dict = &stream.dict;

    let dimension = |key: &[u8]| {
        get_number(doc, dict, key)
            .filter(|v| *v >= 1.0)
            .map(|v| v as usize)
            .ok_or_else(|| RedactError::RedactionApply(format!("image {} {} has no usable size", id.0, id.1)))
    };
    let width = dimension(b"Width")?;
    let height = dimension(b"Height")?;

    let is_mask = matches!(get(doc, dict, b"ImageMask"), Some(Object::Boolean(true)));
    let chain = filter_chain(Some(doc), dict);
    let filters: Vec<&[u8]> = chain.iter().map(|step| step.name.as_slice()).collect();

    if filters.iter().any(|f| matches!(*f, b"DCTDecode" | b"DCT")) {
        if filters.len() != 1 {
            return Err(unsupported(&filters));
        }
        return decode_jpeg(&stream.content);
    }
    if !filters
        .iter()
        .all(|f| matches!(*f, b"FlateDecode" | b"Fl" | b"LZWDecode" | b"LZW"))
    {
        return Err(unsupported(&filters));
    }

    let (bits, components, fill) = if is_mask {
        // Stencil masks paint where the sample is 0 unless Decode is [1 0]
        let inverted = get(doc, dict, b"Decode")
            .and_then(|o| numbers(doc, o))
            .is_some_and(|d| d.first() == Some(&1.0));
        (1, 1, vec![if inverted { 0 } else { 1 }])
    } else {
        let bits = get_number(doc, dict, b"BitsPerComponent").unwrap_or(8.0) as usize;
        let (components, cmyk) = get(doc, dict, b"ColorSpace")
            .and_then(|cs| color_components(doc, cs))
            .ok_or_else(|| RedactError::RedactionApply("unsupported image colour space".to_string()))?;
        let max = (1u32 << bits.min(16)) - 1;
        let mut fill = vec![0; components];
        if cmyk {
            fill[3] = max;
        }
        (bits, components, fill)
    };
    if !matches!(bits, 1 | 2 | 4 | 8 | 16) {
        return Err(RedactError::RedactionApply(format!(
            "unsupported bits per component {}",
            bits
        )));
    }

    Ok(Samples {
        data: decode_chain(&chain, &stream.content)?,
        width,
        height,
        bits,
        components,
        fill,
        transcoded: None,
    })
}

fn decode_jpeg(bytes: &[u8]) -> Result<Samples, RedactError> {
    let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .map_err(|e| RedactError::RedactionApply(format!("cannot decode JPEG image: {}", e)))?;
    let (width, height) = (decoded.width() as usize, decoded.height() as usize);
    let (data, components, color_space) = if decoded.color().channel_count() == 1 {
        (decoded.to_luma8().into_raw(), 1, "DeviceGray")
    } else {
        (decoded.to_rgb8().into_raw(), 3, "DeviceRGB")
    };
    Ok(Samples {
        data,
        width,
        height,
        bits: 8,
        components,
        fill: vec![0; components],
        transcoded: Some(color_space),
    })
}

fn unsupported(filters: &[&[u8]]) -> RedactError {
    let names: Vec<String> = filters
        .iter()
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect();
    RedactError::RedactionApply(format!("unsupported image encoding [{}]", names.join(", ")))
}

/// Bytes per row and total sample bytes, `None` when they overflow.
fn sample_layout(samples: &Samples) -> Option<(usize, usize)> {
    let row_bits = samples
        .width
        .checked_mul(samples.components)?
        .checked_mul(samples.bits)?;
    let row_bytes = row_bits.checked_add(7)? / 8;
    Some((row_bytes, row_bytes.checked_mul(samples.height)?))
}

/// Component count of a colour space, and whether it is CMYK.
fn color_components(doc: &Document, color_space: &Object) -> Option<(usize, bool)> {
    match resolve(doc, color_space) {
        Object::Name(n) => match n.as_slice() {
            b"DeviceGray" | b"CalGray" | b"G" => Some((1, false)),
            b"DeviceRGB" | b"CalRGB" | b"RGB" => Some((3, false)),
            b"DeviceCMYK" | b"CMYK" => Some((4, true)),
            _ => None,
        },
        Object::Array(items) => {
            let family = items.first().map(|o| resolve(doc, o)).and_then(name)?;
            match family {
                b"ICCBased" => {
                    let Object::Stream(profile) = resolve(doc, items.get(1)?) else {
                        return None;
                    };
                    let n = get_number(doc, &profile.dict, b"N")? as usize;
                    Some((n, n == 4))
                }
                b"Indexed" | b"I" | b"Separation" | b"CalGray" => Some((1, false)),
                b"CalRGB" | b"Lab" => Some((3, false)),
                b"DeviceN" => match resolve(doc, items.get(1)?) {
                    Object::Array(names) => Some((names.len(), false)),
                    _ => None,
                },
                _ => color_components(doc, items.first()?),
            }
        }
        _ => None,
    }
}

/// Columns and rows of the image covered by `region`.
fn pixel_span(
    inverse: &Matrix,
    region: &Rect,
    width: usize,
    height: usize,
) -> Option<(std::ops::Range<usize>, std::ops::Range<usize>)> {
    let unit = inverse.apply_rect(region);
    let (w, h) = (width as f64, height as f64);
    let clamp = |v: f64, max: f64| v.clamp(0.0, max) as usize;

    let x0 = clamp((unit.min_x * w).floor(), w);
    let x1 = clamp((unit.max_x * w).ceil(), w);
    // Row 0 is the top of the image, which sits at unit y = 1
    let y0 = clamp(((1.0 - unit.max_y) * h).floor(), h);
    let y1 = clamp(((1.0 - unit.min_y) * h).ceil(), h);

    if x0 >= x1 || y0 >= y1 {
        None
    } else {
        Some((x0..x1, y0..y1))
    }
}

fn set_sample(line: &mut [u8], index: usize, bits: usize, value: u32) {
    match bits {
        8 => line[index] = value as u8,
        16 => {
            let [hi, lo] = (value as u16).to_be_bytes();
            line[index * 2] = hi;
            line[index * 2 + 1] = lo;
        }
        _ => {
            let bit = index * bits;
            let shift = 8 - bits - (bit % 8);
            let mask = (((1u32 << bits) - 1) << shift) as u8;
            let byte = &mut line[bit / 8];
            *byte = (*byte & !mask) | (((value << shift) as u8) & mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::stream_data;
    use lopdf::{dictionary, Stream};
    use pretty_assertions::assert_eq;

    fn gray_image(doc: &mut Document, width: usize, height: usize) -> ObjectId {
        let stream = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![255u8; width * height],
        );
        doc.add_object(stream)
    }

    fn samples(doc: &Document, id: ObjectId) -> Vec<u8> {
        stream_data(doc.get_object(id).unwrap().as_stream().unwrap()).unwrap()
    }

    #[test]
    fn test_clears_only_covered_pixels() {
        let mut doc = Document::with_version("1.7");
        let id = gray_image(&mut doc, 4, 4);
        // Image drawn over 0..400 x 0..400, region covers its top-left quarter
        let placement = Matrix::new(400.0, 0.0, 0.0, 400.0, 0.0, 0.0);
        let region = Rect::new(0.0, 200.0, 200.0, 400.0);

        assert!(clear_image_region(&mut doc, id, &placement, &region).unwrap());

        let data = samples(&doc, id);
        assert_eq!(
            data,
            vec![
                0, 0, 255, 255, //
                0, 0, 255, 255, //
                255, 255, 255, 255, //
                255, 255, 255, 255,
            ]
        );
        let stream = doc.get_object(id).unwrap().as_stream().unwrap();
        assert_eq!(
            stream.dict.get(b"Filter").ok().and_then(name),
            Some(b"FlateDecode".as_slice())
        );
    }

    #[test]
    fn test_region_outside_image_changes_nothing() {
        let mut doc = Document::with_version("1.7");
        let id = gray_image(&mut doc, 4, 4);
        let placement = Matrix::new(100.0, 0.0, 0.0, 100.0, 0.0, 0.0);
        let region = Rect::new(300.0, 300.0, 400.0, 400.0);
        assert!(!clear_image_region(&mut doc, id, &placement, &region).unwrap());
        assert_eq!(samples(&doc, id), vec![255u8; 16]);
    }

    #[test]
    fn test_one_bit_stencil_mask_is_cleared_to_no_paint() {
        let mut doc = Document::with_version("1.7");
        let id = doc.add_object(Stream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => 8,
                "Height" => 1,
                "ImageMask" => true,
            },
            vec![0b0000_0000],
        ));
        let placement = Matrix::new(80.0, 0.0, 0.0, 10.0, 0.0, 0.0);
        // Covers pixels 2..4
        let region = Rect::new(21.0, 1.0, 39.0, 9.0);

        assert!(clear_image_region(&mut doc, id, &placement, &region).unwrap());
        assert_eq!(samples(&doc, id), vec![0b0011_0000]);
    }

    #[test]
    fn test_cmyk_is_filled_with_full_black_ink() {
        let mut doc = Document::with_version("1.7");
        let id = doc.add_object(Stream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 1,
                "ColorSpace" => "DeviceCMYK",
                "BitsPerComponent" => 8,
            },
            vec![10, 20, 30, 40],
        ));
        let placement = Matrix::new(10.0, 0.0, 0.0, 10.0, 0.0, 0.0);
        clear_image_region(&mut doc, id, &placement, &Rect::new(0.0, 0.0, 10.0, 10.0)).unwrap();
        assert_eq!(samples(&doc, id), vec![0, 0, 0, 255]);
    }

    #[test]
    fn test_unsupported_filter_is_an_apply_error() {
        let mut doc = Document::with_version("1.7");
        let id = doc.add_object(Stream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 1,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 1,
                "Filter" => "CCITTFaxDecode",
            },
            vec![0],
        ));
        let placement = Matrix::new(10.0, 0.0, 0.0, 10.0, 0.0, 0.0);
        let result = clear_image_region(&mut doc, id, &placement, &Rect::new(0.0, 0.0, 10.0, 10.0));
        assert!(matches!(result, Err(RedactError::RedactionApply(_))));
    }

    #[test]
    fn test_flate_image_with_png_predictor_is_cleared() {
        // 4x2 gray, each row tagged None before compression
        let mut filtered = Vec::new();
        for _ in 0..2 {
            filtered.push(0u8);
            filtered.extend_from_slice(&[200, 200, 200, 200]);
        }
        let mut stream = Stream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => 4,
                "Height" => 2,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            Vec::new(),
        );
        write_flate(&mut stream, &filtered).unwrap();
        stream.dict.set(
            "DecodeParms",
            dictionary! { "Predictor" => 15, "Columns" => 4 },
        );
        let mut doc = Document::with_version("1.7");
        let id = doc.add_object(stream);
        // Left half of the image
        let placement = Matrix::new(40.0, 0.0, 0.0, 20.0, 0.0, 0.0);

        assert!(clear_image_region(&mut doc, id, &placement, &Rect::new(0.0, 0.0, 20.0, 20.0)).unwrap());

        let stream = doc.get_object(id).unwrap().as_stream().unwrap();
        assert!(stream.dict.get(b"DecodeParms").is_err());
        assert_eq!(samples(&doc, id), vec![0, 0, 200, 200, 0, 0, 200, 200]);
    }

    #[test]
    fn test_lzw_image_is_cleared() {
        let encoded = weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
            .encode(&[90u8; 4])
            .unwrap();
        let mut doc = Document::with_version("1.7");
        let id = doc.add_object(Stream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 2,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
                "Filter" => "LZWDecode",
            },
            encoded,
        ));
        // Bottom row only
        let placement = Matrix::new(20.0, 0.0, 0.0, 20.0, 0.0, 0.0);

        assert!(clear_image_region(&mut doc, id, &placement, &Rect::new(0.0, 0.0, 20.0, 8.0)).unwrap());
        assert_eq!(samples(&doc, id), vec![90, 90, 0, 0]);
    }

    #[test]
    fn test_oversized_dimensions_are_rejected() {
        let samples = Samples {
            data: Vec::new(),
            width: usize::MAX / 2,
            height: 2,
            bits: 8,
            components: 3,
            fill: vec![0; 3],
            transcoded: None,
        };
        assert_eq!(sample_layout(&samples), None);

        let mut doc = Document::with_version("1.7");
        let id = doc.add_object(Stream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => i64::MAX,
                "Height" => i64::MAX,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![0; 3],
        ));
        let placement = Matrix::new(10.0, 0.0, 0.0, 10.0, 0.0, 0.0);
        let result = clear_image_region(&mut doc, id, &placement, &Rect::new(0.0, 0.0, 10.0, 10.0));
        assert!(matches!(result, Err(RedactError::RedactionApply(_))));
    }

    #[test]
    fn test_set_sample_packs_sub_byte_values() {
        let mut line = vec![0u8; 2];
        set_sample(&mut line, 1, 4, 0xF);
        set_sample(&mut line, 2, 4, 0xA);
        assert_eq!(line, vec![0x0F, 0xA0]);
    }
}
