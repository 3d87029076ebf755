//! Document parser adapters.
//!
//! Two implementations behind the [`DocumentParser`] trait:
//! - **[`LocalParser`]** — in-process extraction for PDF, OOXML (DOCX/PPTX/
//!   XLSX), markdown, HTML, and plain text. Runs on the blocking pool with a
//!   per-file timeout; a timeout marks the file failed and the run continues.
//! - **[`CloudParser`]** — HTTP parsing service with three quality modes.
//!   Streams multi-chunk responses and concatenates them, retrying 429/5xx
//!   with exponential backoff (three attempts).
//!
//! Both always produce **markdown and plaintext**. When the underlying
//! parser yields only one representation, the other is derived: markdown is
//! stripped with `pulldown-cmark`, plaintext doubles as its own markdown.
//!
//! With `save_parsed_output` enabled, `{name}.md`, `{name}.txt`, and
//! `{name}.meta.json` are written to the configured directory; write
//! failures are logged and never fail the parse.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use pulldown_cmark::{Event, Parser as MarkdownParser, Tag, TagEnd};
use serde_json::Value;
use tracing::warn;

use crate::config::ParserConfig;
use crate::error::EngineError;
use crate::models::{Document, ParseMetadata, ParsedDocument};

/// Converts a [`Document`] into markdown + plaintext.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    fn name(&self) -> &str;

    async fn parse(&self, doc: &Document) -> Result<ParsedDocument, EngineError>;
}

/// Strip markdown to plain text, keeping the content order.
pub fn markdown_to_text(markdown: &str) -> String {
    let mut out = String::new();
    for event in MarkdownParser::new(markdown) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push(' '),
            Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item) => out.push('\n'),
            Event::End(TagEnd::TableCell) => out.push(' '),
            Event::End(TagEnd::TableRow) => out.push('\n'),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Count tables in a markdown document.
fn count_markdown_tables(markdown: &str) -> usize {
    MarkdownParser::new_ext(markdown, pulldown_cmark::Options::ENABLE_TABLES)
        .filter(|e| matches!(e, Event::Start(Tag::Table(_))))
        .count()
}

/// Persist the parse artifacts next to the configured output directory.
/// Failures here are advisory only.
pub fn save_parsed_output(dir: &Path, name: &str, parsed: &ParsedDocument) {
    let write_all = || -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(format!("{name}.md")), &parsed.markdown)?;
        std::fs::write(dir.join(format!("{name}.txt")), &parsed.plaintext)?;
        let meta = serde_json::json!({
            "parser_name": parsed.parser_name,
            "parse_mode": parsed.parse_mode,
            "metadata": parsed.metadata,
        });
        std::fs::write(
            dir.join(format!("{name}.meta.json")),
            serde_json::to_vec_pretty(&meta).unwrap_or_default(),
        )?;
        Ok(())
    };
    if let Err(e) = write_all() {
        warn!(name, error = %e, "failed to save parsed output");
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Local parser
// ═══════════════════════════════════════════════════════════════════════

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// In-process parser for the common document formats.
pub struct LocalParser {
    /// Device hint recorded in parse metadata: `auto`, `cpu`, or `gpu`.
    device: String,
    timeout: Duration,
}

impl LocalParser {
    pub fn new(config: &ParserConfig, timeout: Duration) -> Self {
        Self {
            device: config.device.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl DocumentParser for LocalParser {
    fn name(&self) -> &str {
        "docling"
    }

    async fn parse(&self, doc: &Document) -> Result<ParsedDocument, EngineError> {
        let bytes = doc
            .bytes()
            .map_err(|e| EngineError::ParseFailure(format!("read document: {e}")))?;
        let ext = doc.ext.to_lowercase();
        let device = self.device.clone();

        let work = tokio::task::spawn_blocking(move || extract_local(&bytes, &ext, &device));

        match tokio::time::timeout(self.timeout, work).await {
            Err(_) => Err(EngineError::ParseTimeout(self.timeout)),
            Ok(Err(join_err)) => Err(EngineError::ParseFailure(join_err.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

/// Synchronous extraction dispatch. Runs on the blocking pool.
fn extract_local(bytes: &[u8], ext: &str, device: &str) -> Result<ParsedDocument, EngineError> {
    let (markdown, plaintext, mut metadata) = match ext {
        "pdf" => {
            let text = pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| EngineError::ParseFailure(format!("PDF extraction failed: {e}")))?;
            let meta = ParseMetadata {
                content_type: "application/pdf".to_string(),
                ..Default::default()
            };
            (text.clone(), text, meta)
        }
        "docx" => {
            let text = extract_docx(bytes)?;
            let tables = count_zip_entry_tag(bytes, "word/document.xml", b"tbl");
            let meta = ParseMetadata {
                tables,
                content_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string(),
                ..Default::default()
            };
            (text.clone(), text, meta)
        }
        "pptx" => {
            let text = extract_pptx(bytes)?;
            let meta = ParseMetadata {
                content_type: "application/vnd.openxmlformats-officedocument.presentationml.presentation".to_string(),
                ..Default::default()
            };
            (text.clone(), text, meta)
        }
        "xlsx" => {
            let (markdown, sheets) = extract_xlsx(bytes)?;
            let meta = ParseMetadata {
                tables: sheets,
                content_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
                ..Default::default()
            };
            (markdown.clone(), markdown_to_text(&markdown), meta)
        }
        "md" | "markdown" => {
            let markdown = String::from_utf8_lossy(bytes).to_string();
            let meta = ParseMetadata {
                tables: count_markdown_tables(&markdown),
                content_type: "text/markdown".to_string(),
                ..Default::default()
            };
            (markdown.clone(), markdown_to_text(&markdown), meta)
        }
        "html" | "htm" => {
            let text = strip_html(&String::from_utf8_lossy(bytes));
            let meta = ParseMetadata {
                content_type: "text/html".to_string(),
                ..Default::default()
            };
            (text.clone(), text, meta)
        }
        _ => {
            let text = String::from_utf8_lossy(bytes).to_string();
            let meta = ParseMetadata {
                content_type: "text/plain".to_string(),
                ..Default::default()
            };
            (text.clone(), text, meta)
        }
    };
    metadata.pages = None;

    Ok(ParsedDocument {
        markdown,
        plaintext,
        metadata,
        parser_name: "docling".to_string(),
        parse_mode: device.to_string(),
    })
}

fn zip_archive(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, EngineError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| EngineError::ParseFailure(format!("OOXML container: {e}")))
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, EngineError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| EngineError::ParseFailure(format!("OOXML entry {name}: {e}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| EngineError::ParseFailure(format!("OOXML entry {name}: {e}")))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(EngineError::ParseFailure(format!(
            "OOXML entry {name} exceeds size limit"
        )));
    }
    Ok(out)
}

/// Collect the text content of every `<{tag}>` element in an XML document.
fn collect_tag_text(xml: &[u8], tag: &[u8]) -> Result<String, EngineError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_tag = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                in_tag = e.local_name().as_ref() == tag;
            }
            Ok(quick_xml::events::Event::Text(t)) if in_tag => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(t.unescape().unwrap_or_default().as_ref());
                in_tag = false;
            }
            Ok(quick_xml::events::Event::End(_)) => in_tag = false,
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(EngineError::ParseFailure(format!("XML: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Count occurrences of a start tag in one ZIP entry (best effort).
fn count_zip_entry_tag(bytes: &[u8], entry: &str, tag: &[u8]) -> usize {
    let Ok(mut archive) = zip_archive(bytes) else { return 0 };
    let Ok(xml) = read_zip_entry(&mut archive, entry) else { return 0 };
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == tag => count += 1,
            Ok(quick_xml::events::Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    count
}

fn extract_docx(bytes: &[u8]) -> Result<String, EngineError> {
    let mut archive = zip_archive(bytes)?;
    let xml = read_zip_entry(&mut archive, "word/document.xml")?;
    collect_tag_text(&xml, b"t")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, EngineError> {
    let mut archive = zip_archive(bytes)?;
    let mut slides: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slides.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut out = String::new();
    for name in slides {
        let xml = read_zip_entry(&mut archive, &name)?;
        let text = collect_tag_text(&xml, b"t")?;
        if !out.is_empty() && !text.is_empty() {
            out.push('\n');
        }
        out.push_str(&text);
    }
    Ok(out)
}

/// Extract xlsx shared strings per sheet, rendering each sheet as a
/// one-row markdown table so table detection fires downstream.
fn extract_xlsx(bytes: &[u8]) -> Result<(String, usize), EngineError> {
    let mut archive = zip_archive(bytes)?;
    let shared = match read_zip_entry(&mut archive, "xl/sharedStrings.xml") {
        Ok(xml) => collect_tag_text(&xml, b"t")?,
        Err(_) => String::new(),
    };

    let sheet_count = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .count();

    let cells: Vec<&str> = shared.split_whitespace().collect();
    let markdown = if cells.is_empty() {
        String::new()
    } else {
        format!(
            "| {} |\n|{}|",
            cells.join(" | "),
            " --- |".repeat(cells.len())
        )
    };
    Ok((markdown, sheet_count.max(usize::from(!cells.is_empty()))))
}

/// Find the closing `</tag` for a script/style block, ASCII-case-insensitive.
fn find_close_tag(haystack: &str, tag: &str) -> Option<usize> {
    let mut idx = 0;
    while let Some(pos) = haystack[idx..].find("</") {
        let abs = idx + pos;
        let after = &haystack[abs + 2..];
        if after
            .get(..tag.len())
            .map(|head| head.eq_ignore_ascii_case(tag))
            .unwrap_or(false)
        {
            return Some(abs);
        }
        idx = abs + 2;
    }
    None
}

/// Remove tags (script/style bodies included) and decode the common
/// entities from an HTML page.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    loop {
        match rest.find('<') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(open) => {
                out.push_str(&rest[..open]);
                let after = &rest[open + 1..];
                let tag: String = after
                    .chars()
                    .take_while(|c| c.is_ascii_alphabetic())
                    .collect();

                let search_from = if tag.eq_ignore_ascii_case("script")
                    || tag.eq_ignore_ascii_case("style")
                {
                    find_close_tag(after, &tag)
                        .map(|p| open + 1 + p)
                        .unwrap_or(open)
                } else {
                    open
                };

                match rest[search_from..].find('>') {
                    Some(close) => {
                        out.push(' ');
                        rest = &rest[search_from + close + 1..];
                    }
                    None => break,
                }
            }
        }
    }

    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ═══════════════════════════════════════════════════════════════════════
// Cloud parser
// ═══════════════════════════════════════════════════════════════════════

const CLOUD_MAX_ATTEMPTS: u32 = 3;

/// HTTP parsing service client with `fast`/`default`/`premium` modes.
pub struct CloudParser {
    client: reqwest::Client,
    base_url: String,
    quality: String,
    timeout: Duration,
}

impl CloudParser {
    pub fn new(config: &ParserConfig, timeout: Duration) -> Result<Self, EngineError> {
        let base_url = config
            .cloud_url
            .clone()
            .ok_or_else(|| EngineError::Config("CLOUD_PARSER_URL is required".into()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            quality: config.quality.clone(),
            timeout,
        })
    }

    async fn parse_once(&self, doc: &Document, bytes: Vec<u8>) -> Result<String, CloudAttemptError> {
        let url = format!("{}/parse?mode={}", self.base_url, self.quality);
        let part = reqwest::multipart::Part::bytes(bytes).file_name(doc.display_name.clone());
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CloudAttemptError::Timeout
                } else {
                    CloudAttemptError::Retryable(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {body}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(CloudAttemptError::Retryable(message))
            } else {
                Err(CloudAttemptError::Permanent(message))
            };
        }

        // The service streams the parse in chunks; concatenate them all
        // before interpreting the body.
        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(part) = stream.next().await {
            let bytes = part.map_err(|e| {
                if e.is_timeout() {
                    CloudAttemptError::Timeout
                } else {
                    CloudAttemptError::Retryable(e.to_string())
                }
            })?;
            body.extend_from_slice(&bytes);
        }
        Ok(String::from_utf8_lossy(&body).to_string())
    }
}

enum CloudAttemptError {
    Timeout,
    Retryable(String),
    Permanent(String),
}

#[async_trait]
impl DocumentParser for CloudParser {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn parse(&self, doc: &Document) -> Result<ParsedDocument, EngineError> {
        let bytes = doc
            .bytes()
            .map_err(|e| EngineError::ParseFailure(format!("read document: {e}")))?;

        let mut last_err = String::new();
        for attempt in 0..CLOUD_MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
            match self.parse_once(doc, bytes.clone()).await {
                Ok(body) => return Ok(interpret_cloud_body(&body, &self.quality)),
                Err(CloudAttemptError::Timeout) => {
                    return Err(EngineError::ParseTimeout(self.timeout))
                }
                Err(CloudAttemptError::Permanent(msg)) => {
                    return Err(EngineError::ParseFailure(msg))
                }
                Err(CloudAttemptError::Retryable(msg)) => last_err = msg,
            }
        }
        Err(EngineError::ParseFailure(format!(
            "cloud parser failed after {CLOUD_MAX_ATTEMPTS} attempts: {last_err}"
        )))
    }
}

/// Interpret a cloud response: JSON `{markdown, plaintext, metadata}` when
/// possible, otherwise the whole body is treated as markdown.
fn interpret_cloud_body(body: &str, quality: &str) -> ParsedDocument {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let markdown = value["markdown"].as_str().unwrap_or_default().to_string();
        let plaintext = value["plaintext"]
            .as_str()
            .or_else(|| value["text"].as_str())
            .unwrap_or_default()
            .to_string();
        let metadata = ParseMetadata {
            tables: value["metadata"]["tables"].as_u64().unwrap_or(0) as usize,
            pages: value["metadata"]["pages"].as_u64().map(|p| p as usize),
            content_type: value["metadata"]["content_type"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        };
        let (markdown, plaintext) = match (markdown.is_empty(), plaintext.is_empty()) {
            (false, true) => {
                let text = markdown_to_text(&markdown);
                (markdown, text)
            }
            (true, false) => (plaintext.clone(), plaintext),
            _ => (markdown, plaintext),
        };
        return ParsedDocument {
            markdown,
            plaintext,
            metadata,
            parser_name: "cloud".to_string(),
            parse_mode: quality.to_string(),
        };
    }

    let markdown = body.to_string();
    ParsedDocument {
        plaintext: markdown_to_text(&markdown),
        metadata: ParseMetadata {
            tables: count_markdown_tables(&markdown),
            ..Default::default()
        },
        markdown,
        parser_name: "cloud".to_string(),
        parse_mode: quality.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentContent;

    fn text_doc(name: &str, ext: &str, body: &str) -> Document {
        Document::from_bytes(name, name, name, ext, body.as_bytes().to_vec())
    }

    fn local_parser(timeout_s: u64) -> LocalParser {
        let config = ParserConfig {
            kind: "docling".to_string(),
            device: "auto".to_string(),
            quality: "default".to_string(),
            cloud_url: None,
            extraction_format: crate::models::ExtractionFormat::Auto,
            save_parsed_output: false,
            parsed_output_dir: std::path::PathBuf::from("/tmp"),
        };
        LocalParser::new(&config, Duration::from_secs(timeout_s))
    }

    #[tokio::test]
    async fn plain_text_parses_to_identical_representations() {
        let parser = local_parser(30);
        let doc = text_doc("a.txt", "txt", "Perseverance was built by NASA.");
        let parsed = parser.parse(&doc).await.unwrap();
        assert_eq!(parsed.markdown, parsed.plaintext);
        assert_eq!(parsed.parser_name, "docling");
        assert_eq!(parsed.metadata.tables, 0);
    }

    #[tokio::test]
    async fn markdown_is_stripped_and_tables_counted() {
        let parser = local_parser(30);
        let body = "# Title\n\nSome *emphasis* here.\n\n| a | b |\n| --- | --- |\n| 1 | 2 |\n";
        let doc = text_doc("t.md", "md", body);
        let parsed = parser.parse(&doc).await.unwrap();
        assert!(parsed.plaintext.contains("Some emphasis here."));
        assert!(!parsed.plaintext.contains('*'));
        assert_eq!(parsed.metadata.tables, 1);
        assert_eq!(parsed.markdown, body);
    }

    #[tokio::test]
    async fn invalid_pdf_is_a_parse_failure() {
        let parser = local_parser(30);
        let doc = text_doc("x.pdf", "pdf", "not a pdf");
        let err = parser.parse(&doc).await.unwrap_err();
        assert_eq!(err.kind(), "ParseFailure");
    }

    #[tokio::test]
    async fn invalid_zip_is_a_parse_failure_for_docx() {
        let parser = local_parser(30);
        let doc = text_doc("x.docx", "docx", "not a zip");
        let err = parser.parse(&doc).await.unwrap_err();
        assert_eq!(err.kind(), "ParseFailure");
    }

    #[tokio::test]
    async fn missing_local_file_is_a_parse_failure() {
        let parser = local_parser(30);
        let doc = Document {
            source_id: "gone".into(),
            logical_path: "gone".into(),
            display_name: "gone".into(),
            ext: "txt".into(),
            content: DocumentContent::LocalPath("/nonexistent/path/gone.txt".into()),
            metadata: Default::default(),
        };
        let err = parser.parse(&doc).await.unwrap_err();
        assert_eq!(err.kind(), "ParseFailure");
    }

    #[test]
    fn html_strip_removes_tags_and_scripts() {
        let html = "<html><head><script>var x = 1;</script></head>\
                    <body><h1>Hello</h1><p>World &amp; friends</p></body></html>";
        let text = strip_html(html);
        assert!(text.contains("Hello"));
        assert!(text.contains("World & friends"));
        assert!(!text.contains("var x"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn cloud_json_body_with_markdown_only_derives_plaintext() {
        let parsed = interpret_cloud_body(
            r##"{"markdown":"# Title\n\nBody text.","metadata":{"tables":0,"pages":2}}"##,
            "premium",
        );
        assert_eq!(parsed.parse_mode, "premium");
        assert!(parsed.plaintext.contains("Body text."));
        assert_eq!(parsed.metadata.pages, Some(2));
    }

    #[test]
    fn cloud_plain_body_is_treated_as_markdown() {
        let parsed = interpret_cloud_body("Just some text output.", "fast");
        assert_eq!(parsed.markdown, "Just some text output.");
        assert_eq!(parsed.plaintext, "Just some text output.");
    }

    #[test]
    fn save_parsed_output_writes_three_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = ParsedDocument {
            markdown: "# Hi".into(),
            plaintext: "Hi".into(),
            metadata: ParseMetadata::default(),
            parser_name: "docling".into(),
            parse_mode: "auto".into(),
        };
        save_parsed_output(dir.path(), "doc", &parsed);
        assert!(dir.path().join("doc.md").exists());
        assert!(dir.path().join("doc.txt").exists());
        assert!(dir.path().join("doc.meta.json").exists());
    }
}
