//! Text-based document converter.

use std::path::Path;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

use docket_core::{ConvertedDocument, DocumentConverter, Error, Result};

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").expect("valid regex"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").expect("valid regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("valid regex"));
static SPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").expect("valid regex"));

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];
const HTML_EXTENSIONS: &[&str] = &["html", "htm"];

/// Converts plain text, markdown and HTML files.
///
/// Binary office formats (pdf, docx, pptx) are rejected with a conversion
/// error; deployments that need them plug in a different converter.
#[derive(Debug, Clone, Default)]
pub struct TextFileConverter;

impl TextFileConverter {
    pub fn new() -> Self {
        Self
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn is_supported(ext: &str) -> bool {
    TEXT_EXTENSIONS.contains(&ext) || HTML_EXTENSIONS.contains(&ext)
}

/// Reduce HTML to its visible text.
pub fn strip_html(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, " ");
    let text = STYLE_RE.replace_all(&text, " ");
    let text = TAG_RE.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let text = SPACE_RUN_RE.replace_all(&text, " ");
    let text = BLANK_RUN_RE.replace_all(&text, "\n\n");

    text.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[async_trait]
impl DocumentConverter for TextFileConverter {
    #[instrument(skip(self), fields(subsystem = "jobs", component = "converter", op = "convert"))]
    async fn convert(&self, path: &Path) -> Result<ConvertedDocument> {
        let format = extension(path)
            .filter(|ext| is_supported(ext))
            .ok_or_else(|| {
                Error::Conversion(format!("unsupported file type: {}", path.display()))
            })?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Conversion(format!("cannot read {}: {}", path.display(), e)))?;
        let raw = String::from_utf8_lossy(&bytes);

        let text = if HTML_EXTENSIONS.contains(&format.as_str()) {
            strip_html(&raw)
        } else {
            raw.into_owned()
        };

        debug!(format = %format, chars = text.chars().count(), "Converted document");

        Ok(ConvertedDocument {
            text,
            page_count: 1,
            format,
        })
    }

    fn supports(&self, path: &Path) -> bool {
        extension(path).is_some_and(|ext| is_supported(&ext))
    }
}
