use std::io::Write;

use flate2::{write::ZlibEncoder, Compression};
use image::RgbaImage;
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use thiserror::Error;

/// The embedded signature is drawn at half its natural pixel size,
/// anchored a fixed margin from the right and bottom edges of the last
/// page. The placement rule is fixed for compatibility with documents
/// signed by earlier releases.
pub const SIGNATURE_SCALE: f64 = 0.5;
pub const SIGNATURE_MARGIN: f64 = 50.0;

const SIGNATURE_XOBJECT_NAME: &str = "SigImg";

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("failed to parse pdf: {0}")]
    Parse(#[source] lopdf::Error),
    #[error("pdf has no pages")]
    NoPages,
    #[error("malformed pdf structure: {0}")]
    Structure(#[source] lopdf::Error),
    #[error("page media box is missing or invalid")]
    InvalidMediaBox,
    #[error("failed to compress image stream: {0}")]
    Compress(#[from] std::io::Error),
    #[error("failed to serialize pdf: {0}")]
    Serialize(#[source] lopdf::Error),
}

impl PdfError {
    /// Decode-side failures mean the source bytes are unusable; retrying
    /// on identical bytes cannot succeed.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            PdfError::Parse(_)
                | PdfError::NoPages
                | PdfError::Structure(_)
                | PdfError::InvalidMediaBox
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MediaBox {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

/// Embeds `signature` onto the last page of `source` and returns the
/// re-serialized document. Pure in-memory transformation; identical
/// inputs produce identical output bytes.
pub fn embed_signature(source: &[u8], signature: &RgbaImage) -> Result<Vec<u8>, PdfError> {
    let mut doc = Document::load_mem(source).map_err(PdfError::Parse)?;

    let pages = doc.get_pages();
    let page_id = *pages.values().next_back().ok_or(PdfError::NoPages)?;
    let media_box = page_media_box(&doc, page_id)?;

    let width = f64::from(signature.width()) * SIGNATURE_SCALE;
    let height = f64::from(signature.height()) * SIGNATURE_SCALE;
    let x = media_box.x1 - width - SIGNATURE_MARGIN;
    let y = media_box.y0 + SIGNATURE_MARGIN;

    let xobject_id = add_image_xobject(&mut doc, signature)?;
    register_xobject(&mut doc, page_id, xobject_id)?;
    append_draw_operation(&mut doc, page_id, width, height, x, y);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| PdfError::Serialize(e.into()))?;
    Ok(bytes)
}

/// Splits the RGBA samples into a DeviceRGB image stream plus a
/// DeviceGray SMask carrying the alpha channel, both flate-compressed.
fn add_image_xobject(doc: &mut Document, image: &RgbaImage) -> Result<ObjectId, PdfError> {
    let (width, height) = image.dimensions();

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    for pixel in image.pixels() {
        let [r, g, b, a] = pixel.0;
        rgb.extend_from_slice(&[r, g, b]);
        alpha.push(a);
    }

    let mut rgb_encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    rgb_encoder.write_all(&rgb)?;
    let compressed_rgb = rgb_encoder.finish()?;

    let mut alpha_encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    alpha_encoder.write_all(&alpha)?;
    let compressed_alpha = alpha_encoder.finish()?;

    let smask_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        },
        compressed_alpha,
    ));

    let xobject_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
            "SMask" => Object::Reference(smask_id),
        },
        compressed_rgb,
    ));

    Ok(xobject_id)
}

fn register_xobject(
    doc: &mut Document,
    page_id: ObjectId,
    xobject_id: ObjectId,
) -> Result<(), PdfError> {
    // Resources may be held inline on the page or behind an indirect
    // reference; mutate whichever dictionary actually owns it.
    let resources_ref = {
        let dict = doc
            .get_object(page_id)
            .and_then(Object::as_dict)
            .map_err(PdfError::Structure)?;
        match dict.get(b"Resources") {
            Ok(Object::Reference(id)) => Some(*id),
            _ => None,
        }
    };

    let resources = match resources_ref {
        Some(id) => doc
            .get_object_mut(id)
            .and_then(Object::as_dict_mut)
            .map_err(PdfError::Structure)?,
        None => {
            let dict = doc
                .get_object_mut(page_id)
                .and_then(Object::as_dict_mut)
                .map_err(PdfError::Structure)?;
            if !dict.has(b"Resources") {
                dict.set("Resources", Object::Dictionary(dictionary! {}));
            }
            dict.get_mut(b"Resources")
                .and_then(Object::as_dict_mut)
                .map_err(PdfError::Structure)?
        }
    };

    if !resources.has(b"XObject") {
        resources.set("XObject", Object::Dictionary(dictionary! {}));
    }
    let xobjects = resources
        .get_mut(b"XObject")
        .and_then(Object::as_dict_mut)
        .map_err(PdfError::Structure)?;
    xobjects.set(SIGNATURE_XOBJECT_NAME, Object::Reference(xobject_id));

    Ok(())
}

fn append_draw_operation(
    doc: &mut Document,
    page_id: ObjectId,
    width: f64,
    height: f64,
    x: f64,
    y: f64,
) {
    let draw_ops = format!(
        "q\n{width:.2} 0 0 {height:.2} {x:.2} {y:.2} cm\n/{SIGNATURE_XOBJECT_NAME} Do\nQ\n"
    );
    let stream_id = doc.add_object(Stream::new(dictionary! {}, draw_ops.into_bytes()));

    let existing = match doc.get_object_mut(page_id).and_then(Object::as_dict_mut) {
        Ok(dict) => dict.remove(b"Contents"),
        Err(_) => return,
    };

    // Existing page content is preserved; the signature draw is appended
    // as a trailing content stream. A stream held directly on the page is
    // promoted to an indirect object so it can join the array.
    let new_contents = match existing {
        Some(Object::Reference(existing)) => Object::Array(vec![
            Object::Reference(existing),
            Object::Reference(stream_id),
        ]),
        Some(Object::Array(mut array)) => {
            array.push(Object::Reference(stream_id));
            Object::Array(array)
        }
        Some(Object::Stream(stream)) => {
            let promoted = doc.add_object(Object::Stream(stream));
            Object::Array(vec![
                Object::Reference(promoted),
                Object::Reference(stream_id),
            ])
        }
        _ => Object::Reference(stream_id),
    };

    if let Ok(dict) = doc.get_object_mut(page_id).and_then(Object::as_dict_mut) {
        dict.set("Contents", new_contents);
    }
}

/// Resolves the page media box, walking up the page tree when the box is
/// inherited from an ancestor Pages node.
fn page_media_box(doc: &Document, page_id: ObjectId) -> Result<MediaBox, PdfError> {
    let mut current = page_id;
    loop {
        let dict = doc
            .get_object(current)
            .and_then(Object::as_dict)
            .map_err(PdfError::Structure)?;

        if let Ok(mut object) = dict.get(b"MediaBox") {
            if let Ok(reference) = object.as_reference() {
                object = doc.get_object(reference).map_err(PdfError::Structure)?;
            }
            let values = object.as_array().map_err(PdfError::Structure)?;
            if values.len() != 4 {
                return Err(PdfError::InvalidMediaBox);
            }
            let numbers: Vec<f64> = values
                .iter()
                .map(number)
                .collect::<Option<_>>()
                .ok_or(PdfError::InvalidMediaBox)?;
            return Ok(MediaBox {
                x0: numbers[0].min(numbers[2]),
                y0: numbers[1].min(numbers[3]),
                x1: numbers[0].max(numbers[2]),
                y1: numbers[1].max(numbers[3]),
            });
        }

        match dict.get(b"Parent") {
            Ok(parent) => {
                current = parent.as_reference().map_err(PdfError::Structure)?;
            }
            Err(_) => return Err(PdfError::InvalidMediaBox),
        }
    }
}

fn number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(value) => Some(*value as f64),
        Object::Real(value) => Some(f64::from(*value)),
        _ => None,
    }
}
