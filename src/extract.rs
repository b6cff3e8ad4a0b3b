//! Document text extraction, dispatched on file extension.
//!
//! Plain-text formats must be valid UTF-8; nothing is decoded lossily. PDF goes
//! through `pdf-extract`, HTML is parsed with `scraper`, DOCX and PPTX are
//! unpacked with `zip` and their text runs read with `quick-xml`.

use std::io::Read;
use std::path::Path;

use quick_xml::events::Event;
use scraper::{ElementRef, Html, Node};
use thiserror::Error;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: .{0}")]
    UnsupportedExtension(String),
    #[error("content is not valid UTF-8 (byte {0})")]
    InvalidUtf8(usize),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Html,
    Pdf,
    Docx,
    Pptx,
}

fn detect(name: &str) -> Result<Format, ExtractError> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        None | Some("txt" | "md" | "markdown" | "csv" | "json" | "log") => Ok(Format::Text),
        Some("html" | "htm") => Ok(Format::Html),
        Some("pdf") => Ok(Format::Pdf),
        Some("docx") => Ok(Format::Docx),
        Some("pptx") => Ok(Format::Pptx),
        Some(other) => Err(ExtractError::UnsupportedExtension(other.to_string())),
    }
}

/// True if `name` has an extension this module can read.
pub fn is_supported(name: &str) -> bool {
    detect(name).is_ok()
}

/// Extract plain text from a document named `name`.
pub fn extract_text(name: &str, bytes: &[u8]) -> Result<String, ExtractError> {
    match detect(name)? {
        Format::Text => decode_utf8(bytes),
        Format::Html => decode_utf8(bytes).map(|html| strip_html(&html)),
        Format::Pdf => extract_pdf(bytes),
        Format::Docx => extract_docx(bytes),
        Format::Pptx => extract_pptx(bytes),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| ExtractError::InvalidUtf8(e.valid_up_to()))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry_bounded(&mut archive, "word/document.xml")?;
    collect_runs(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    slides.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = Vec::new();
    for name in slides {
        let xml = read_entry_bounded(&mut archive, &name)?;
        let text = collect_runs(&xml)?;
        if !text.trim().is_empty() {
            out.push(text);
        }
    }
    Ok(out.join("\n\n"))
}

/// Concatenate `<*:t>` text runs; each `<*:p>` paragraph ends a line.
fn collect_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

/// Text content of an HTML document. Scripts, styles and comments are
/// dropped; block elements end a line.
fn strip_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::with_capacity(html.len());
    collect_html_text(document.root_element(), &mut raw);

    let mut out = String::with_capacity(raw.len());
    let mut blank = true;
    for line in raw.lines().map(|l| l.replace('\u{a0}', " ")) {
        let line = line.trim();
        if line.is_empty() {
            if !blank {
                out.push('\n');
                blank = true;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
        blank = false;
    }
    out.trim_end().to_string()
}

fn collect_html_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            let name = child_element.value().name();
            if matches!(name, "script" | "style" | "noscript" | "template" | "head") {
                continue;
            }
            let block = matches!(
                name,
                "p" | "br" | "div" | "li" | "tr" | "section" | "article" | "pre" | "blockquote"
                    | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
            );
            if block {
                out.push('\n');
            }
            collect_html_text(child_element, out);
            if block {
                out.push('\n');
            }
        } else if let Node::Text(text) = child.value() {
            out.push_str(text);
        }
    }
}
