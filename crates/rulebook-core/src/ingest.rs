//! Rulebook ingestion.
//!
//! A rulebook is read as text first. When the text layer is missing or too
//! thin to teach from (scanned or photographed rules), every page is rendered
//! to a JPEG data URL instead and the model reads the pages as images. The two
//! representations are never mixed.

use crate::error::{Result, TutorError};
use base64::Engine;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use lopdf::{Document, Object, ObjectId, Stream};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, LazyLock};

/// Upscale factor applied when rendering a page to an image.
pub const RENDER_SCALE: f32 = 1.5;
/// Cleaned text shorter than this is treated as "no usable text layer".
pub const MIN_LEGIBLE_CHARS: usize = 200;
pub const JPEG_QUALITY: u8 = 80;
/// PDF user space units per inch; rendering at scale 1.0 uses this dpi.
const PDF_POINTS_PER_INCH: f32 = 72.0;
const PDFTOPPM: &str = "pdftoppm";
/// Shown to the model when neither text nor images could be produced.
pub const UNREADABLE_PLACEHOLDER: &str = "无法提取规则文本，请尝试重新上传或直接提问。";

static PAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--- Page \d+ ---").expect("page marker pattern is valid"));

/// The raw rulebook as uploaded.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceDocument {
    Pdf(Bytes),
    /// Photographed pages, in reading order.
    Images(Vec<Bytes>),
}

impl SourceDocument {
    pub fn page_hint(&self) -> Option<usize> {
        match self {
            SourceDocument::Pdf(_) => None,
            SourceDocument::Images(pages) => Some(pages.len()),
        }
    }
}

/// What the tutor teaches from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RuleContent {
    Text { content: String },
    Images { pages: Vec<String> },
}

impl RuleContent {
    pub fn text(content: impl Into<String>) -> Self {
        RuleContent::Text {
            content: content.into(),
        }
    }

    /// Whether there is anything to teach from at all.
    pub fn is_usable(&self) -> bool {
        match self {
            RuleContent::Text { content } => !content.is_empty(),
            RuleContent::Images { pages } => !pages.is_empty(),
        }
    }
}

/// Low-level access to a document's pages.
#[cfg_attr(test, automock)]
pub trait RulebookParser: Send + Sync {
    /// Plain text of every page, in order.
    fn page_texts(&self, document: &SourceDocument) -> Result<Vec<String>>;

    /// Every page as a `data:image/jpeg;base64,` URL, scaled by `scale`.
    fn render_pages(&self, document: &SourceDocument, scale: f32) -> Result<Vec<String>>;
}

/// Joins page texts with a `--- Page N ---` marker in front of each page.
pub fn join_pages(pages: &[String]) -> String {
    let mut full = String::new();
    for (index, text) in pages.iter().enumerate() {
        full.push_str(&format!("\n--- Page {} ---\n", index + 1));
        full.push_str(text);
    }
    full
}

/// Length in characters once page markers and surrounding whitespace are gone.
pub fn legible_len(text: &str) -> usize {
    PAGE_MARKER.replace_all(text, "").trim().chars().count()
}

/// Turns a document into teachable content. Never fails: when both the text
/// and the image path break down, the result is a placeholder text.
pub async fn ingest(parser: Arc<dyn RulebookParser>, document: SourceDocument) -> RuleContent {
    let text_parser = parser.clone();
    let text_document = document.clone();
    let extracted =
        tokio::task::spawn_blocking(move || text_parser.page_texts(&text_document)).await;

    match extracted {
        Ok(Ok(pages)) => {
            let text = join_pages(&pages);
            let legible = legible_len(&text);
            if legible >= MIN_LEGIBLE_CHARS {
                tracing::info!("Extracted {} chars of rule text from {} pages", legible, pages.len());
                return RuleContent::Text { content: text };
            }
            tracing::info!("Text too short ({} chars), switching to image mode", legible);
        }
        Ok(Err(e)) => {
            tracing::warn!("Text extraction failed, trying image conversion: {}", e);
        }
        Err(e) => {
            tracing::error!("Text extraction task aborted: {}", e);
        }
    }

    let rendered =
        tokio::task::spawn_blocking(move || parser.render_pages(&document, RENDER_SCALE)).await;
    match rendered {
        Ok(Ok(pages)) => {
            tracing::info!("Rendered {} pages as images", pages.len());
            RuleContent::Images { pages }
        }
        Ok(Err(e)) => {
            tracing::error!("Image conversion failed: {}", e);
            RuleContent::text(UNREADABLE_PLACEHOLDER)
        }
        Err(e) => {
            tracing::error!("Image conversion task aborted: {}", e);
            RuleContent::text(UNREADABLE_PLACEHOLDER)
        }
    }
}

/// Parser backed by `lopdf` for PDF text and the `image` crate for rasters.
///
/// PDF pages are rasterised whole by poppler's `pdftoppm`. Without it, a page
/// renders to the scan embedded in it, which covers image-only rulebooks but
/// not vector pages.
#[derive(Debug, Default, Clone)]
pub struct PdfParser;

impl PdfParser {
    pub fn new() -> Self {
        Self
    }
}

impl RulebookParser for PdfParser {
    fn page_texts(&self, document: &SourceDocument) -> Result<Vec<String>> {
        match document {
            SourceDocument::Pdf(bytes) => {
                let doc = load_pdf(bytes)?;
                let mut texts = Vec::new();
                for page_number in doc.get_pages().keys() {
                    let text = doc.extract_text(&[*page_number]).map_err(|e| {
                        TutorError::Ingestion(format!("page {page_number}: {e}"))
                    })?;
                    tracing::debug!("Page {} yielded {} chars", page_number, text.len());
                    texts.push(text);
                }
                Ok(texts)
            }
            // Photographs have no text layer.
            SourceDocument::Images(pages) => Ok(vec![String::new(); pages.len()]),
        }
    }

    fn render_pages(&self, document: &SourceDocument, scale: f32) -> Result<Vec<String>> {
        match document {
            SourceDocument::Pdf(bytes) => {
                let doc = load_pdf(bytes)?;
                if let Some(pages) = rasterize_with_pdftoppm(bytes, scale)? {
                    // Already rendered at the requested scale.
                    return pages
                        .iter()
                        .map(|image| to_jpeg_data_url(image, 1.0))
                        .collect();
                }
                tracing::warn!("{} not found, using embedded page scans", PDFTOPPM);
                let mut rendered = Vec::new();
                for (page_number, page_id) in doc.get_pages() {
                    let image = page_raster(&doc, page_id)?.ok_or_else(|| {
                        TutorError::Ingestion(format!("page {page_number} has no raster image"))
                    })?;
                    rendered.push(to_jpeg_data_url(&image, scale)?);
                }
                Ok(rendered)
            }
            SourceDocument::Images(pages) => pages
                .iter()
                .map(|bytes| {
                    let image = image::load_from_memory(bytes)
                        .map_err(|e| TutorError::Ingestion(format!("unreadable image: {e}")))?;
                    to_jpeg_data_url(&image, scale)
                })
                .collect(),
        }
    }
}

/// Renders every page with `pdftoppm`, in page order. `Ok(None)` when the
/// tool is not installed.
fn rasterize_with_pdftoppm(bytes: &[u8], scale: f32) -> Result<Option<Vec<DynamicImage>>> {
    let dir = tempfile::Builder::new().prefix("rulebook_pages_").tempdir()?;
    let input = dir.path().join("rulebook.pdf");
    std::fs::write(&input, bytes)?;
    let prefix = dir.path().join("page");
    let dpi = (PDF_POINTS_PER_INCH * scale).round() as u32;

    let output = match Command::new(PDFTOPPM)
        .arg("-png")
        .arg("-r")
        .arg(dpi.to_string())
        .arg(&input)
        .arg(&prefix)
        .output()
    {
        Ok(output) => output,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !output.status.success() {
        return Err(TutorError::Ingestion(format!(
            "{PDFTOPPM} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    // pdftoppm names pages `page-1.png` or `page-01.png` depending on count.
    let mut page_files: Vec<(usize, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir.path())? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        let number = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.rsplit_once('-'))
            .and_then(|(_, n)| n.parse::<usize>().ok());
        if let Some(number) = number {
            page_files.push((number, path));
        }
    }
    page_files.sort_by_key(|(number, _)| *number);
    if page_files.is_empty() {
        return Err(TutorError::Ingestion(format!("{PDFTOPPM} rendered no pages")));
    }
    tracing::debug!("Rendered {} pages at {} dpi", page_files.len(), dpi);

    page_files
        .iter()
        .map(|(number, path)| {
            image::open(path)
                .map_err(|e| TutorError::Ingestion(format!("rendered page {number}: {e}")))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn load_pdf(bytes: &[u8]) -> Result<Document> {
    Document::load_mem(bytes).map_err(|e| TutorError::Ingestion(format!("unreadable PDF: {e}")))
}

fn pdf_err(e: lopdf::Error) -> TutorError {
    TutorError::Ingestion(e.to_string())
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Result<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).map_err(pdf_err),
        other => Ok(other),
    }
}

/// The resources dictionary of a page, inherited from its ancestors if needed.
fn page_resources(doc: &Document, page_id: ObjectId) -> Result<Option<&lopdf::Dictionary>> {
    let mut node = doc.get_dictionary(page_id).map_err(pdf_err)?;
    // Page trees are shallow; the bound only protects against cycles.
    for _ in 0..32 {
        if let Ok(resources) = node.get(b"Resources") {
            return Ok(Some(resolve(doc, resources)?.as_dict().map_err(pdf_err)?));
        }
        match node.get(b"Parent").and_then(Object::as_reference) {
            Ok(parent) => node = doc.get_dictionary(parent).map_err(pdf_err)?,
            Err(_) => return Ok(None),
        }
    }
    Ok(None)
}

/// The largest decodable image drawn on the page.
fn page_raster(doc: &Document, page_id: ObjectId) -> Result<Option<DynamicImage>> {
    let Some(resources) = page_resources(doc, page_id)? else {
        return Ok(None);
    };
    let Ok(xobjects) = resources.get(b"XObject") else {
        return Ok(None);
    };
    let xobjects = resolve(doc, xobjects)?.as_dict().map_err(pdf_err)?;

    let mut best: Option<DynamicImage> = None;
    for (_, object) in xobjects.iter() {
        let Ok(stream) = resolve(doc, object)?.as_stream() else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .is_ok_and(|name| name == b"Image");
        if !is_image {
            continue;
        }
        match decode_image_stream(doc, stream) {
            Some(image) => {
                let area = image.width() as u64 * image.height() as u64;
                let best_area = best
                    .as_ref()
                    .map(|b| b.width() as u64 * b.height() as u64)
                    .unwrap_or(0);
                if area > best_area {
                    best = Some(image);
                }
            }
            None => tracing::debug!("Skipping undecodable image on page {:?}", page_id),
        }
    }
    Ok(best)
}

fn stream_filters(doc: &Document, stream: &Stream) -> Vec<Vec<u8>> {
    let Ok(filter) = stream.dict.get(b"Filter") else {
        return Vec::new();
    };
    match resolve(doc, filter) {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().ok().map(|name| name.to_vec()))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_image_stream(doc: &Document, stream: &Stream) -> Option<DynamicImage> {
    let filters = stream_filters(doc, stream);
    match filters.as_slice() {
        [only] if only.as_slice() == b"DCTDecode" => {
            image::load_from_memory_with_format(&stream.content, image::ImageFormat::Jpeg).ok()
        }
        [] | [_] => {
            let raw = if filters.is_empty() {
                stream.content.clone()
            } else if filters[0].as_slice() == b"FlateDecode" {
                stream.decompressed_content().ok()?
            } else {
                return None;
            };
            let (width, height) = (
                dict_u32(doc, stream, b"Width")?,
                dict_u32(doc, stream, b"Height")?,
            );
            if dict_u32(doc, stream, b"BitsPerComponent")? != 8 {
                return None;
            }
            let color_space = stream
                .dict
                .get(b"ColorSpace")
                .ok()
                .and_then(|cs| resolve(doc, cs).ok())
                .and_then(|cs| cs.as_name().ok())
                .map(|name| name.to_vec())?;
            match color_space.as_slice() {
                b"DeviceRGB" => image::RgbImage::from_raw(width, height, raw)
                    .map(DynamicImage::ImageRgb8),
                b"DeviceGray" => image::GrayImage::from_raw(width, height, raw)
                    .map(DynamicImage::ImageLuma8),
                _ => None,
            }
        }
        _ => None,
    }
}

fn dict_u32(doc: &Document, stream: &Stream, key: &[u8]) -> Option<u32> {
    let value = resolve(doc, stream.dict.get(key).ok()?).ok()?.as_i64().ok()?;
    u32::try_from(value).ok()
}

fn to_jpeg_data_url(image: &DynamicImage, scale: f32) -> Result<String> {
    let width = ((image.width() as f32) * scale).round().max(1.0) as u32;
    let height = ((image.height() as f32) * scale).round().max(1.0) as u32;
    let rgb = image.resize_exact(width, height, FilterType::Triangle).to_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| TutorError::Ingestion(format!("JPEG encoding failed: {e}")))?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&jpeg)
    ))
}
