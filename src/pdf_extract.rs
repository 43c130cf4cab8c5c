// src/pdf_extract.rs

use crate::error::{IntrastatError, Result};
use lopdf::{Dictionary, Document, Object};
use std::path::Path;
use tracing::{debug, info, warn};

/// What one PDF page offers to the extraction request.
#[derive(Debug, Clone, PartialEq)]
pub enum PageContent {
    /// The page carries extractable text.
    Text(String),
    /// Scanned page: the embedded image, sent to the model as-is.
    Image { mime: &'static str, data: Vec<u8> },
    /// Neither usable text nor a supported image.
    Unreadable(String),
}

/// Minimum number of non-whitespace characters we expect from a
/// "real" text page. Below this threshold we look for a scan.
const MIN_TEXT_CHARS: usize = 30;

/// Read a PDF from disk, refusing files over `max_size_mb`.
pub fn read_pdf(path: &Path, max_size_mb: u64) -> Result<Vec<u8>> {
    let size = std::fs::metadata(path)?.len();
    let limit = max_size_mb * 1024 * 1024;
    if size > limit {
        return Err(IntrastatError::InvoiceFailed {
            file: path.display().to_string(),
            message: format!("PDF is {:.1} MB, limit is {max_size_mb} MB", size as f64 / 1_048_576.0),
        });
    }
    Ok(std::fs::read(path)?)
}

/// Split raw PDF bytes into per-page content, in page order.
pub fn load_pages(pdf_bytes: &[u8]) -> Result<Vec<PageContent>> {
    let doc = Document::load_mem(pdf_bytes)?;
    let pages = pages_from_document(&doc);
    info!(pages = pages.len(), "PDF split into pages");
    Ok(pages)
}

pub fn pages_from_document(doc: &Document) -> Vec<PageContent> {
    doc.get_pages()
        .into_iter()
        .map(|(page_number, object_id)| {
            let text = match doc.extract_text(&[page_number]) {
                Ok(text) => text,
                Err(e) => {
                    debug!(page = page_number, error = %e, "No text layer");
                    String::new()
                }
            };

            let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
            if meaningful >= MIN_TEXT_CHARS {
                debug!(page = page_number, chars = meaningful, "Text page");
                return PageContent::Text(text);
            }

            match doc
                .get_object(object_id)
                .and_then(Object::as_dict)
                .ok()
                .and_then(|page| find_jpeg(doc, page))
            {
                Some(data) => {
                    debug!(page = page_number, bytes = data.len(), "Scanned page");
                    PageContent::Image { mime: "image/jpeg", data }
                }
                None => {
                    warn!(page = page_number, chars = meaningful, "Page has no usable text or JPEG image");
                    PageContent::Unreadable(format!(
                        "page {page_number} has no text layer and no supported image"
                    ))
                }
            }
        })
        .collect()
}

/// Walk up the page tree until a `Resources` dictionary is found.
fn resources_of<'a>(doc: &'a Document, page: &'a Dictionary) -> Option<&'a Dictionary> {
    let mut node = page;
    for _ in 0..16 {
        if let Some(res) = node
            .get(b"Resources")
            .ok()
            .and_then(|r| doc.dereference(r).ok())
            .and_then(|(_, resolved)| resolved.as_dict().ok())
        {
            return Some(res);
        }
        node = node
            .get(b"Parent")
            .ok()
            .and_then(|p| doc.dereference(p).ok())
            .and_then(|(_, resolved)| resolved.as_dict().ok())?;
    }
    None
}

/// First DCT-encoded (JPEG) image XObject on the page; its stream content is
/// a complete JPEG file.
fn find_jpeg(doc: &Document, page: &Dictionary) -> Option<Vec<u8>> {
    let xobjects = resources_of(doc, page)?
        .get(b"XObject")
        .ok()
        .and_then(|x| doc.dereference(x).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())?;

    xobjects.iter().find_map(|(_, obj)| {
        let (_, resolved) = doc.dereference(obj).ok()?;
        let stream = resolved.as_stream().ok()?;
        let is_image = matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == b"Image");
        let is_jpeg = stream.dict.get(b"Filter").is_ok_and(|f| names_filter(f, b"DCTDecode"));
        (is_image && is_jpeg).then(|| stream.content.clone())
    })
}

fn names_filter(filter: &Object, wanted: &[u8]) -> bool {
    match filter {
        Object::Name(name) => name.as_slice() == wanted,
        Object::Array(items) => items.iter().any(|f| names_filter(f, wanted)),
        _ => false,
    }
}
