//! Document loaders for PDF and EPUB sources.
//!
//! Loaders turn file bytes into a [`LoadedDocument`]: a page sequence plus
//! whatever bibliographic metadata the format carries. The PDF loader uses
//! native text extraction and falls back to an optional [`OcrBackend`]
//! collaborator when a document yields too few printable characters. The
//! EPUB loader walks the OPF spine and concatenates chapter text into a
//! single page, so EPUB chunks carry no page numbers.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Upper bound on input file size.
const MAX_FILE_BYTES: u64 = 200 * 1024 * 1024;
/// Maximum decompressed bytes read from a single EPUB zip entry.
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Below this many printable characters per page, PDF extraction is treated
/// as failed and the OCR collaborator is consulted.
const MIN_PRINTABLE_PER_PAGE: usize = 16;

/// One page of extracted text. `page_number` is 1-indexed.
#[derive(Debug, Clone)]
pub struct DocPage {
    pub page_number: Option<u32>,
    pub text: String,
}

/// Bibliographic fields captured at load time. All optional; the pipeline
/// backfills the title from the filename when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub publisher: Option<String>,
    pub isbn: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub venue: Option<String>,
    pub keywords: Vec<String>,
    pub abstract_text: Option<String>,
}

/// A loaded document: non-empty page list plus metadata.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub pages: Vec<DocPage>,
    pub metadata: DocMetadata,
}

impl LoadedDocument {
    /// Full document text, pages joined by blank lines.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Optical character recognition collaborator for scanned PDFs.
pub trait OcrBackend: Send + Sync {
    /// Returns recognized text and a confidence in `[0, 1]`.
    fn ocr(&self, image: &[u8]) -> Result<(String, f32)>;
}

/// Loads one document format from disk.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Lower-case extensions this loader accepts, without the dot.
    fn extensions(&self) -> &[&'static str];

    async fn load(&self, path: &Path) -> Result<LoadedDocument>;
}

fn read_file_bounded(path: &Path) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > MAX_FILE_BYTES {
        return Err(EngineError::Validation(format!(
            "{} exceeds size limit ({} bytes)",
            path.display(),
            MAX_FILE_BYTES
        )));
    }
    Ok(std::fs::read(path)?)
}

// ============ PDF ============

/// PDF loader backed by native text extraction, with optional OCR fallback.
pub struct PdfLoader {
    ocr: Option<Arc<dyn OcrBackend>>,
}

impl PdfLoader {
    pub fn new(ocr: Option<Arc<dyn OcrBackend>>) -> Self {
        Self { ocr }
    }
}

#[async_trait]
impl DocumentLoader for PdfLoader {
    fn extensions(&self) -> &[&'static str] {
        &["pdf"]
    }

    async fn load(&self, path: &Path) -> Result<LoadedDocument> {
        let bytes = read_file_bounded(path)?;
        let path = path.to_path_buf();
        let ocr = self.ocr.clone();

        // Extraction is CPU-bound; keep it off the async workers.
        tokio::task::spawn_blocking(move || load_pdf_blocking(&path, &bytes, ocr.as_deref()))
            .await
            .map_err(|e| EngineError::Dependency(format!("pdf task: {}", e)))?
    }
}

fn load_pdf_blocking(
    path: &Path,
    bytes: &[u8],
    ocr: Option<&dyn OcrBackend>,
) -> Result<LoadedDocument> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| EngineError::Parse(format!("pdf extraction: {}", e)))?;

    let mut pages = split_pdf_pages(&text);
    let printable: usize = pages
        .iter()
        .map(|p| p.text.chars().filter(|c| !c.is_whitespace()).count())
        .sum();

    if printable < MIN_PRINTABLE_PER_PAGE * pages.len().max(1) {
        match ocr {
            Some(backend) => {
                debug!(path = %path.display(), "native extraction sparse, trying OCR");
                let (ocr_text, confidence) = backend.ocr(bytes)?;
                if ocr_text.trim().is_empty() {
                    return Err(EngineError::Dependency(format!(
                        "OCR produced no text for {}",
                        path.display()
                    )));
                }
                warn!(path = %path.display(), confidence, "using OCR text");
                pages = vec![DocPage {
                    page_number: Some(1),
                    text: ocr_text,
                }];
            }
            None => {
                return Err(EngineError::Parse(format!(
                    "no extractable text in {}",
                    path.display()
                )))
            }
        }
    }

    let metadata = sniff_pdf_metadata(&pages);
    Ok(LoadedDocument { pages, metadata })
}

/// Split extractor output into pages on form feeds; a document without
/// form feeds becomes a single page.
fn split_pdf_pages(text: &str) -> Vec<DocPage> {
    let raw: Vec<&str> = text.split('\u{c}').collect();
    let mut pages = Vec::new();
    for part in &raw {
        if part.trim().is_empty() {
            continue;
        }
        pages.push(DocPage {
            page_number: Some(pages.len() as u32 + 1),
            text: part.trim().to_string(),
        });
    }
    if pages.is_empty() {
        pages.push(DocPage {
            page_number: Some(1),
            text: text.trim().to_string(),
        });
    }
    pages
}

/// Best-effort metadata sniffing over the opening pages: DOI and arXiv
/// identifiers plus a publication-year candidate.
fn sniff_pdf_metadata(pages: &[DocPage]) -> DocMetadata {
    let mut meta = DocMetadata::default();
    let head: String = pages
        .iter()
        .take(2)
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    for line in head.lines() {
        let lower = line.to_lowercase();
        if meta.doi.is_none() {
            if let Some(idx) = lower.find("doi:") {
                let tail = line[idx + 4..].trim();
                let token: String = tail
                    .chars()
                    .take_while(|c| !c.is_whitespace())
                    .collect();
                if token.starts_with("10.") {
                    meta.doi = Some(token);
                }
            }
        }
        if meta.arxiv_id.is_none() {
            if let Some(idx) = lower.find("arxiv:") {
                let tail = line[idx + 6..].trim();
                let token: String = tail
                    .chars()
                    .take_while(|c| !c.is_whitespace() && *c != ']')
                    .collect();
                if !token.is_empty() {
                    meta.arxiv_id = Some(token);
                }
            }
        }
    }

    if meta.year.is_none() {
        meta.year = sniff_year(&head);
    }
    meta
}

fn sniff_year(text: &str) -> Option<i32> {
    for token in text.split(|c: char| !c.is_ascii_digit()) {
        if token.len() == 4 {
            if let Ok(year) = token.parse::<i32>() {
                if (1900..=2100).contains(&year) {
                    return Some(year);
                }
            }
        }
    }
    None
}

// ============ EPUB ============

/// EPUB loader: container.xml → OPF → spine chapters, concatenated into a
/// single page.
pub struct EpubLoader;

#[async_trait]
impl DocumentLoader for EpubLoader {
    fn extensions(&self) -> &[&'static str] {
        &["epub"]
    }

    async fn load(&self, path: &Path) -> Result<LoadedDocument> {
        let bytes = read_file_bounded(path)?;
        tokio::task::spawn_blocking(move || load_epub_blocking(&bytes))
            .await
            .map_err(|e| EngineError::Dependency(format!("epub task: {}", e)))?
    }
}

fn load_epub_blocking(bytes: &[u8]) -> Result<LoadedDocument> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| EngineError::Parse(format!("epub zip: {}", e)))?;

    let container = read_zip_entry(&mut archive, "META-INF/container.xml")?;
    let opf_path = parse_container_rootfile(&container)?;
    let opf = read_zip_entry(&mut archive, &opf_path)?;
    let (metadata, spine_hrefs) = parse_opf(&opf)?;

    let opf_dir = match opf_path.rfind('/') {
        Some(idx) => &opf_path[..idx + 1],
        None => "",
    };

    let mut body = String::new();
    for href in &spine_hrefs {
        let entry_path = format!("{}{}", opf_dir, href);
        let xml = match read_zip_entry(&mut archive, &entry_path) {
            Ok(xml) => xml,
            Err(e) => {
                warn!(entry = %entry_path, error = %e, "skipping unreadable chapter");
                continue;
            }
        };
        let text = extract_xhtml_text(&xml)?;
        if !text.trim().is_empty() {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(text.trim());
        }
    }

    if body.trim().is_empty() {
        return Err(EngineError::Parse("epub spine produced no text".to_string()));
    }

    Ok(LoadedDocument {
        pages: vec![DocPage {
            page_number: None,
            text: body,
        }],
        metadata,
    })
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| EngineError::Parse(format!("epub entry {}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| EngineError::Parse(format!("epub entry {}: {}", name, e)))?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        return Err(EngineError::Validation(format!(
            "epub entry {} exceeds size limit",
            name
        )));
    }
    Ok(out)
}

/// Pull the `full-path` attribute off the first `rootfile` element.
fn parse_container_rootfile(xml: &[u8]) -> Result<String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"rootfile" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"full-path" {
                            return Ok(String::from_utf8_lossy(attr.value.as_ref()).into_owned());
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(EngineError::Parse(format!("container.xml: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Err(EngineError::Parse(
        "container.xml has no rootfile entry".to_string(),
    ))
}

/// Parse the OPF package document: Dublin Core metadata, the manifest
/// id→href map, and the spine reading order.
fn parse_opf(xml: &[u8]) -> Result<(DocMetadata, Vec<String>)> {
    use std::collections::HashMap;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut metadata = DocMetadata::default();
    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut spine_idrefs: Vec<String> = Vec::new();
    let mut current_dc: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                current_dc = match e.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("creator"),
                    b"publisher" => Some("publisher"),
                    b"date" => Some("date"),
                    b"identifier" => Some("identifier"),
                    b"subject" => Some("subject"),
                    b"description" => Some("description"),
                    _ => None,
                };
            }
            Ok(quick_xml::events::Event::Empty(e)) => {
                collect_opf_item(&e, &mut manifest, &mut spine_idrefs);
            }
            Ok(quick_xml::events::Event::Text(t)) => {
                if let Some(field) = current_dc {
                    let value = t.unescape().unwrap_or_default().trim().to_string();
                    if !value.is_empty() {
                        apply_dc_field(&mut metadata, field, value);
                    }
                }
            }
            Ok(quick_xml::events::Event::End(_)) => {
                current_dc = None;
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(EngineError::Parse(format!("opf: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    let hrefs: Vec<String> = spine_idrefs
        .iter()
        .filter_map(|idref| manifest.get(idref).cloned())
        .collect();
    if hrefs.is_empty() {
        return Err(EngineError::Parse("opf spine is empty".to_string()));
    }
    Ok((metadata, hrefs))
}

fn collect_opf_item(
    e: &quick_xml::events::BytesStart<'_>,
    manifest: &mut std::collections::HashMap<String, String>,
    spine_idrefs: &mut Vec<String>,
) {
    match e.local_name().as_ref() {
        b"item" => {
            let mut id = None;
            let mut href = None;
            for attr in e.attributes().flatten() {
                match attr.key.as_ref() {
                    b"id" => id = Some(String::from_utf8_lossy(attr.value.as_ref()).into_owned()),
                    b"href" => {
                        href = Some(String::from_utf8_lossy(attr.value.as_ref()).into_owned())
                    }
                    _ => {}
                }
            }
            if let (Some(id), Some(href)) = (id, href) {
                manifest.insert(id, href);
            }
        }
        b"itemref" => {
            for attr in e.attributes().flatten() {
                if attr.key.as_ref() == b"idref" {
                    spine_idrefs.push(String::from_utf8_lossy(attr.value.as_ref()).into_owned());
                }
            }
        }
        _ => {}
    }
}

fn apply_dc_field(metadata: &mut DocMetadata, field: &str, value: String) {
    match field {
        "title" if metadata.title.is_none() => metadata.title = Some(value),
        "creator" => {
            if metadata.author.is_none() {
                metadata.author = Some(value.clone());
            }
            metadata.authors.push(value);
        }
        "publisher" if metadata.publisher.is_none() => metadata.publisher = Some(value),
        "date" if metadata.year.is_none() => metadata.year = sniff_year(&value),
        "identifier" if metadata.isbn.is_none() => {
            let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.len() == 10 || digits.len() == 13 {
                metadata.isbn = Some(digits);
            }
        }
        "subject" => metadata.keywords.push(value),
        "description" if metadata.abstract_text.is_none() => metadata.abstract_text = Some(value),
        _ => {}
    }
}

/// Collect text nodes from a chapter document, skipping script and style.
fn extract_xhtml_text(xml: &[u8]) -> Result<String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut skip_depth: usize = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if matches!(e.local_name().as_ref(), b"script" | b"style") {
                    skip_depth += 1;
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if matches!(e.local_name().as_ref(), b"script" | b"style") {
                    skip_depth = skip_depth.saturating_sub(1);
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if skip_depth == 0 => {
                let text = t.unescape().unwrap_or_default();
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(trimmed);
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(EngineError::Parse(format!("xhtml: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ Selection ============

/// Pick a loader by file extension.
pub fn loader_for(
    path: &Path,
    ocr: Option<Arc<dyn OcrBackend>>,
) -> Option<Box<dyn DocumentLoader>> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "pdf" => Some(Box::new(PdfLoader::new(ocr))),
        "epub" => Some(Box::new(EpubLoader)),
        _ => None,
    }
}

/// Turn a filename stem into a display title: separators to spaces.
pub fn title_from_filename(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
