use std::collections::BTreeSet;
use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{
    ColorType, DynamicImage, ImageEncoder, ImageFormat, ImageOutputFormat,
    Pixel, Rgba, RgbaImage,
};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use tracing::{debug, warn};

use crate::error::{EndorseError, Result};
use crate::model::PlacementDirective;

/// Page size used when neither the page nor its ancestors carry a MediaBox (A4).
const FALLBACK_MEDIA_BOX: MediaBox = MediaBox {
    llx: 0.0,
    lly: 0.0,
    urx: 595.0,
    ury: 842.0,
};

const JPEG_QUALITY: u8 = 90;

const SIGNATURE_INK: Rgba<u8> = Rgba([0x03, 0x69, 0xA1, 0xFF]);
const STAMP_INK: Rgba<u8> = Rgba([0xF9, 0x73, 0x16, 0xFF]);

/// Result of endorsing a PDF: the new bytes plus which pages were touched.
#[derive(Debug, Clone)]
pub struct PdfEndorsement {
    pub bytes: Vec<u8>,
    pub endorsed_pages: Vec<u32>,
    pub skipped_pages: Vec<u32>,
}

/// An encoded raster with the format that was actually written.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl EncodedImage {
    pub fn mime(&self) -> &'static str {
        mime_for(self.format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MediaBox {
    llx: f64,
    lly: f64,
    urx: f64,
    ury: f64,
}

/// Draws the directive's image onto the selected 0-based pages and returns the
/// re-serialized document.
///
/// With no explicit page list the directive's `target_page_index` is used, and
/// page 0 when that is absent too. Indices past the last page are skipped.
pub fn endorse_pdf(
    source: &[u8],
    directive: &PlacementDirective,
    page_indices: Option<&[u32]>,
) -> Result<Vec<u8>> {
    endorse_pdf_pages(source, directive, page_indices).map(|out| out.bytes)
}

#[tracing::instrument(skip(source, directive), fields(source_len = source.len()))]
pub fn endorse_pdf_pages(
    source: &[u8],
    directive: &PlacementDirective,
    page_indices: Option<&[u32]>,
) -> Result<PdfEndorsement> {
    directive.validate()?;
    let mut doc = Document::load_mem(source)?;
    let overlay = decode_overlay(&directive.image)?;

    let requested: BTreeSet<u32> = match page_indices {
        Some(list) if !list.is_empty() => list.iter().copied().collect(),
        _ => BTreeSet::from([directive.target_page_index.unwrap_or(0)]),
    };

    // lopdf numbers pages from 1.
    let pages = doc.get_pages();
    let mut endorsed_pages = Vec::new();
    let mut skipped_pages = Vec::new();
    let mut embedded = None;

    for index in requested {
        let Some(&page_id) = index.checked_add(1).and_then(|n| pages.get(&n)) else {
            debug!(page_index = index, page_count = pages.len(), "page out of range, skipped");
            skipped_pages.push(index);
            continue;
        };
        let image_id = match embedded {
            Some(id) => id,
            None => {
                let id = embed_image(&mut doc, &overlay);
                embedded = Some(id);
                id
            }
        };
        let name = format!("EndorseIm{}", image_id.0);
        let media_box = page_media_box(&doc, page_id)?;
        attach_xobject(&mut doc, page_id, &name, image_id)?;
        let matrix = placement_matrix(directive, &media_box);
        draw_on_page(&mut doc, page_id, &name, matrix)?;
        endorsed_pages.push(index);
    }

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| EndorseError::EncodeFailure(format!("pdf:{e}")))?;
    debug!(
        endorsed = endorsed_pages.len(),
        skipped = skipped_pages.len(),
        output_len = bytes.len(),
        "pdf endorsed"
    );
    Ok(PdfEndorsement {
        bytes,
        endorsed_pages,
        skipped_pages,
    })
}

pub fn pdf_page_count(source: &[u8]) -> Result<usize> {
    let doc = Document::load_mem(source)?;
    Ok(doc.get_pages().len())
}

/// Composites the directive's image onto a raster, keeping the source's size
/// and, where an encoder is available, its format.
#[tracing::instrument(skip(source, directive), fields(source_len = source.len()))]
pub fn endorse_image(source: &[u8], directive: &PlacementDirective) -> Result<EncodedImage> {
    directive.validate()?;
    let format = image::guess_format(source)
        .map_err(|e| EndorseError::DecodeFailure(format!("source:{e}")))?;
    let base = image::load_from_memory_with_format(source, format)
        .map_err(|e| EndorseError::DecodeFailure(format!("source:{e}")))?;
    let overlay = decode_overlay(&directive.image)?;

    let mut canvas = base.to_rgba8();
    let target_w = directive.width.round().max(1.0);
    let target_h = directive.height.round().max(1.0);
    let stamp = sampling_source(&overlay, target_w, target_h, &canvas);
    composite(
        &mut canvas,
        &stamp,
        (directive.x, directive.y),
        (target_w, target_h),
        directive.rotation_degrees,
    );

    encode_raster(canvas, format)
}

/// Deterministic "DEMO SIGNATURE" placeholder, 200x80 PNG.
pub fn generate_placeholder_signature() -> Result<Vec<u8>> {
    let mut img = RgbaImage::new(200, 80);
    draw_text(&mut img, "DEMO SIGNATURE", 10, 24, 2, true, SIGNATURE_INK);
    // Underline flourish.
    for x in 10..190u32 {
        let t = (x - 10) as f64 / 180.0;
        let y = 54.0 + 4.0 * (t * std::f64::consts::TAU * 1.5).sin();
        for dy in 0..2 {
            put_clipped(&mut img, x as i64, y.round() as i64 + dy, SIGNATURE_INK);
        }
    }
    encode_png(&img)
}

/// Deterministic circular "DEMO STAMP" placeholder, 120x120 PNG.
pub fn generate_placeholder_stamp() -> Result<Vec<u8>> {
    let mut img = RgbaImage::new(120, 120);
    let (cx, cy, radius, half_stroke) = (60.0f64, 60.0f64, 50.0f64, 1.5f64);
    for (x, y, px) in img.enumerate_pixels_mut() {
        let dx = x as f64 + 0.5 - cx;
        let dy = y as f64 + 0.5 - cy;
        if ((dx * dx + dy * dy).sqrt() - radius).abs() <= half_stroke {
            *px = STAMP_INK;
        }
    }
    for (label, top) in [("DEMO", 36), ("STAMP", 56)] {
        let left = 60 - text_width(label, 2) as i64 / 2;
        draw_text(&mut img, label, left, top, 2, false, STAMP_INK);
    }
    encode_png(&img)
}

pub fn to_data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", B64.encode(bytes))
}

/// Accepts raw image bytes or a `data:<mime>;base64,<payload>` URL.
pub fn decode_image_source(raw: &[u8]) -> Result<Vec<u8>> {
    let Some(rest) = raw.strip_prefix(b"data:") else {
        return Ok(raw.to_vec());
    };
    let text = std::str::from_utf8(rest)
        .map_err(|_| EndorseError::DecodeFailure("data_url_not_utf8".into()))?;
    let (header, payload) = text
        .split_once(',')
        .ok_or_else(|| EndorseError::DecodeFailure("data_url_missing_payload".into()))?;
    if !header.ends_with(";base64") {
        return Err(EndorseError::DecodeFailure("data_url_not_base64".into()));
    }
    B64.decode(payload.trim())
        .map_err(|e| EndorseError::DecodeFailure(format!("data_url:{e}")))
}

pub fn mime_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::WebP => "image/webp",
        _ => "application/octet-stream",
    }
}

fn decode_overlay(raw: &[u8]) -> Result<DynamicImage> {
    let bytes = decode_image_source(raw)?;
    image::load_from_memory(&bytes).map_err(|e| EndorseError::DecodeFailure(format!("overlay:{e}")))
}

fn embed_image(doc: &mut Document, overlay: &DynamicImage) -> ObjectId {
    let img = overlay.to_rgba8();
    let (img_w, img_h) = img.dimensions();
    let mut rgb = Vec::with_capacity((img_w * img_h * 3) as usize);
    let mut alpha = Vec::with_capacity((img_w * img_h) as usize);
    for pixel in img.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel[3]);
    }

    let mut image_dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => img_w as i64,
        "Height" => img_h as i64,
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => 8,
    };
    if alpha.iter().any(|a| *a != u8::MAX) {
        let mut smask = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => img_w as i64,
                "Height" => img_h as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            alpha,
        );
        if let Err(e) = smask.compress() {
            debug!(error = %e, "soft mask left uncompressed");
        }
        image_dict.set("SMask", doc.add_object(smask));
    }
    let mut image_stream = Stream::new(image_dict, rgb);
    if let Err(e) = image_stream.compress() {
        debug!(error = %e, "overlay image left uncompressed");
    }
    doc.add_object(image_stream)
}

fn page_media_box(doc: &Document, page_id: ObjectId) -> Result<MediaBox> {
    let mut current = Some(page_id);
    while let Some(id) = current {
        let dict = doc.get_object(id).and_then(Object::as_dict)?;
        if let Some(media_box) = extract_media_box(doc, dict) {
            return Ok(media_box);
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    Ok(FALLBACK_MEDIA_BOX)
}

fn extract_media_box(doc: &Document, dict: &Dictionary) -> Option<MediaBox> {
    let arr = resolve(doc, dict.get(b"MediaBox").ok()?)?.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let llx = obj_to_f64(&arr[0])?;
    let lly = obj_to_f64(&arr[1])?;
    let urx = obj_to_f64(&arr[2])?;
    let ury = obj_to_f64(&arr[3])?;
    Some(MediaBox {
        llx: llx.min(urx),
        lly: lly.min(ury),
        urx: llx.max(urx),
        ury: lly.max(ury),
    })
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn obj_to_f64(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some((*f).into()),
        _ => None,
    }
}

/// `cm` operands mapping the image's unit square onto the page: scale, then
/// rotate counter-clockwise about the lower-left corner, then translate to
/// `(x, top - y - height)`.
fn placement_matrix(directive: &PlacementDirective, media_box: &MediaBox) -> [f64; 6] {
    let (sin, cos) = directive.rotation_degrees.to_radians().sin_cos();
    let (w, h) = (directive.width, directive.height);
    let origin_x = media_box.llx + directive.x;
    let origin_y = media_box.ury - directive.y - h;
    [w * cos, w * sin, -h * sin, h * cos, origin_x, origin_y]
}

/// Registers the image under `name` in the page's resources. Inherited or
/// inline resources are materialized as an indirect dictionary on the page.
fn attach_xobject(doc: &mut Document, page_id: ObjectId, name: &str, image_id: ObjectId) -> Result<()> {
    let current = doc
        .get_object(page_id)
        .and_then(Object::as_dict)?
        .get(b"Resources")
        .ok()
        .cloned();
    let resources = match current {
        Some(obj) => obj,
        None => Object::Dictionary(inherited_resources(doc, page_id)?.unwrap_or_else(Dictionary::new)),
    };
    let resources_id = match resources {
        Object::Reference(id) => id,
        Object::Dictionary(dict) => {
            let id = doc.add_object(dict);
            doc.get_object_mut(page_id)
                .and_then(Object::as_dict_mut)?
                .set("Resources", id);
            id
        }
        _ => return Err(EndorseError::DecodeFailure("pdf:resources_invalid".into())),
    };

    let xobjects = doc
        .get_object(resources_id)
        .and_then(Object::as_dict)?
        .get(b"XObject")
        .ok()
        .cloned();
    match xobjects {
        Some(Object::Reference(xobject_id)) => {
            doc.get_object_mut(xobject_id)
                .and_then(Object::as_dict_mut)?
                .set(name, image_id);
        }
        Some(Object::Dictionary(mut dict)) => {
            dict.set(name, image_id);
            doc.get_object_mut(resources_id)
                .and_then(Object::as_dict_mut)?
                .set("XObject", dict);
        }
        None => {
            let mut dict = Dictionary::new();
            dict.set(name, image_id);
            doc.get_object_mut(resources_id)
                .and_then(Object::as_dict_mut)?
                .set("XObject", dict);
        }
        Some(_) => return Err(EndorseError::DecodeFailure("pdf:xobject_invalid".into())),
    }
    Ok(())
}

fn inherited_resources(doc: &Document, page_id: ObjectId) -> Result<Option<Dictionary>> {
    let mut current = doc
        .get_object(page_id)
        .and_then(Object::as_dict)?
        .get(b"Parent")
        .and_then(Object::as_reference)
        .ok();
    while let Some(id) = current {
        let dict = doc.get_object(id).and_then(Object::as_dict)?;
        if let Ok(obj) = dict.get(b"Resources") {
            return Ok(resolve(doc, obj)
                .and_then(|o| o.as_dict().ok())
                .cloned());
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    Ok(None)
}

/// Wraps the existing content in `q ... Q` and appends the drawing operators,
/// so whatever graphics state the page leaves behind cannot skew the overlay.
fn draw_on_page(doc: &mut Document, page_id: ObjectId, name: &str, matrix: [f64; 6]) -> Result<()> {
    let existing = content_stream_ids(doc, page_id)?;
    let operands = matrix.iter().map(|v| format_number(*v)).collect::<Vec<_>>().join(" ");
    let drawing = format!("\nQ\nq\n{operands} cm\n/{name} Do\nQ\n");

    let open_id = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let draw_id = doc.add_object(Stream::new(Dictionary::new(), drawing.into_bytes()));

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(open_id));
    contents.extend(existing.into_iter().map(Object::Reference));
    contents.push(Object::Reference(draw_id));
    doc.get_object_mut(page_id)
        .and_then(Object::as_dict_mut)?
        .set("Contents", contents);
    Ok(())
}

fn content_stream_ids(doc: &Document, page_id: ObjectId) -> Result<Vec<ObjectId>> {
    let page = doc.get_object(page_id).and_then(Object::as_dict)?;
    let Ok(contents) = page.get(b"Contents") else {
        return Ok(Vec::new());
    };
    let ids = match contents {
        Object::Reference(id) => match doc.get_object(*id)? {
            Object::Array(items) => items.iter().filter_map(|o| o.as_reference().ok()).collect(),
            _ => vec![*id],
        },
        Object::Array(items) => items.iter().filter_map(|o| o.as_reference().ok()).collect(),
        _ => return Err(EndorseError::DecodeFailure("pdf:contents_invalid".into())),
    };
    Ok(ids)
}

fn format_number(value: f64) -> String {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    if rounded == 0.0 {
        return "0".into();
    }
    let text = format!("{rounded:.4}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Pixels the compositor samples from. The overlay is pre-filtered to the
/// target size only when that size is no larger than the canvas; bigger
/// targets sample the original so work stays bounded by the output.
fn sampling_source(overlay: &DynamicImage, width: f64, height: f64, canvas: &RgbaImage) -> RgbaImage {
    let canvas_area = (canvas.width() as f64 * canvas.height() as f64).max(1.0);
    if width * height <= canvas_area {
        overlay
            .resize_exact(width as u32, height as u32, FilterType::Triangle)
            .to_rgba8()
    } else {
        debug!(width, height, "overlay larger than canvas, sampling unscaled source");
        overlay.to_rgba8()
    }
}

/// Alpha-composites `stamp` stretched to `size` with its top-left corner at
/// `origin`, rotated counter-clockwise (as seen on screen) about its
/// bottom-left corner. Only canvas pixels inside the rotated rectangle are
/// visited; each maps back into `stamp`.
fn composite(
    canvas: &mut RgbaImage,
    stamp: &RgbaImage,
    origin: (f64, f64),
    size: (f64, f64),
    degrees: f64,
) {
    if stamp.width() == 0 || stamp.height() == 0 {
        return;
    }
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (w, h) = size;
    let (pivot_x, pivot_y) = (origin.0, origin.1 + h);
    let scale_x = stamp.width() as f64 / w;
    let scale_y = stamp.height() as f64 / h;

    let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)].map(|(lx, ly)| {
        let (rx, ry) = (lx, ly - h);
        (pivot_x + rx * cos + ry * sin, pivot_y - rx * sin + ry * cos)
    });
    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min).floor().max(0.0);
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min).floor().max(0.0);
    let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max).ceil();
    let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max).ceil();
    let max_x = max_x.min(canvas.width() as f64);
    let max_y = max_y.min(canvas.height() as f64);

    let mut py = min_y;
    while py < max_y {
        let mut px = min_x;
        while px < max_x {
            let dx = px + 0.5 - pivot_x;
            let dy = py + 0.5 - pivot_y;
            let lx = dx * cos - dy * sin;
            let ly = dx * sin + dy * cos + h;
            if lx >= 0.0 && ly >= 0.0 && lx < w && ly < h {
                let sx = ((lx * scale_x) as u32).min(stamp.width() - 1);
                let sy = ((ly * scale_y) as u32).min(stamp.height() - 1);
                let src = *stamp.get_pixel(sx, sy);
                canvas.get_pixel_mut(px as u32, py as u32).blend(&src);
            }
            px += 1.0;
        }
        py += 1.0;
    }
}

fn encode_raster(canvas: RgbaImage, format: ImageFormat) -> Result<EncodedImage> {
    let (image, output, written) = match format {
        ImageFormat::Jpeg => (
            DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8()),
            ImageOutputFormat::Jpeg(JPEG_QUALITY),
            ImageFormat::Jpeg,
        ),
        ImageFormat::Png => (DynamicImage::ImageRgba8(canvas), ImageOutputFormat::Png, ImageFormat::Png),
        // Lossless, the only WebP encoder built without libwebp.
        ImageFormat::WebP => (DynamicImage::ImageRgba8(canvas), ImageOutputFormat::WebP, ImageFormat::WebP),
        other => {
            warn!(format = ?other, "no encoder for source format, writing png");
            (DynamicImage::ImageRgba8(canvas), ImageOutputFormat::Png, ImageFormat::Png)
        }
    };
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), output)
        .map_err(|e| EndorseError::EncodeFailure(format!("image:{e}")))?;
    Ok(EncodedImage {
        bytes,
        format: written,
    })
}

fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(img, img.width(), img.height(), ColorType::Rgba8)
        .map_err(|e| EndorseError::EncodeFailure(format!("png:{e}")))?;
    Ok(buf)
}

// 5x7 bitmap glyphs, bit 4 is the leftmost column.
fn glyph(c: char) -> [u8; 7] {
    match c {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        _ => [0; 7],
    }
}

fn text_width(text: &str, scale: u32) -> u32 {
    let n = text.chars().count() as u32;
    if n == 0 {
        return 0;
    }
    n * 6 * scale - scale
}

fn draw_text(img: &mut RgbaImage, text: &str, left: i64, top: i64, scale: u32, slant: bool, ink: Rgba<u8>) {
    let scale = scale as i64;
    for (i, c) in text.chars().enumerate() {
        let origin_x = left + i as i64 * 6 * scale;
        for (row, bits) in glyph(c).into_iter().enumerate() {
            let shear = if slant { (6 - row as i64) * scale / 2 } else { 0 };
            for col in 0..5u32 {
                if bits & (0x10u8 >> col) == 0 {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        put_clipped(
                            img,
                            origin_x + shear + col as i64 * scale + sx,
                            top + row as i64 * scale + sy,
                            ink,
                        );
                    }
                }
            }
        }
    }
}

fn put_clipped(img: &mut RgbaImage, x: i64, y: i64, ink: Rgba<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, ink);
    }
}
