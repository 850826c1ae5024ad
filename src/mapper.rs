//! Markdown to structured JSON.
//!
//! Splits a converted document into titled sections, derives a stable
//! document id from the file name and pulls a few facts (date,
//! classification, originating agency) out of the opening sections.
//!
//! The fact extraction is a regex heuristic over typed archival memos. It
//! is right often enough to be useful for filtering and wrong often enough
//! that nothing downstream should treat it as authoritative.

use crate::error::HarvestError;
use crate::output::{DocumentRecord, RecordMetadata, Section};
use crate::pipeline::postprocess::collapse_newlines;
use crate::storage::write_atomic;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::{debug, warn};

pub const SOURCE: &str = "National Archives";
pub const COLLECTION: &str = "JFK Files";
pub const FORMAT: &str = "PDF to Markdown to JSON";

/// Sections scanned for metadata.
const METADATA_SECTIONS: usize = 3;
const IMPLICIT_SECTION: &str = "Document Content";

static RE_RECORD_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+-\d+-\d+)").unwrap());
static RE_DOCID: Lazy<Regex> = Lazy::new(|| Regex::new(r"docid[-\s]?(\d+)").unwrap());
static RE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").unwrap());
static RE_PAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^#+\s+Page\s+(\d+)").unwrap());

static RE_DATES: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)(?:Date|Dated):\s*(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})").unwrap(),
        Regex::new(
            r"(?i)(\d{1,2}\s+(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{4})",
        )
        .unwrap(),
        Regex::new(r"(\d{1,2}/\d{1,2}/\d{2,4})").unwrap(),
    ]
});
static RE_CLASSIFICATION: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)(?:Classification|Classified):\s*(\w+\s+\w+|\w+)").unwrap(),
        Regex::new(r"(?i)(TOP SECRET|CONFIDENTIAL|SECRET|UNCLASSIFIED)").unwrap(),
    ]
});
static RE_AGENCY_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:Agency|From|Originator):[ \t]*([\w \t]+)").unwrap());
static RE_AGENCY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(CIA|FBI|HSCA|NSA|DOS|DOD)\b").unwrap());

/// Derive the document id from a title or file stem.
///
/// `104-10003-10041_part2` → `104-10003-10041`, `DOCID-32204484` →
/// `docid-32204484`, anything else is used unchanged.
pub fn doc_id_for(title: &str) -> String {
    if let Some(c) = RE_RECORD_NUMBER.captures(title) {
        return c[1].to_string();
    }
    let lower = title.to_lowercase();
    if lower.contains("docid") {
        if let Some(c) = RE_DOCID.captures(&lower) {
            return format!("docid-{}", &c[1]);
        }
    }
    title.to_string()
}

fn timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

fn base_metadata() -> RecordMetadata {
    RecordMetadata {
        source: SOURCE.to_string(),
        collection: COLLECTION.to_string(),
        format: FORMAT.to_string(),
        date: None,
        classification: None,
        agency: None,
        conversion_timestamp: timestamp(),
        page_count: 0,
        conversion_method: None,
        error: None,
        warning: None,
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Map a Markdown file to a [`DocumentRecord`]. Never fails; read errors are
/// reported in `metadata.error`.
pub fn to_document(markdown_path: &Path, title: Option<&str>) -> DocumentRecord {
    let title = title.map(str::to_string).unwrap_or_else(|| stem_of(markdown_path));
    match std::fs::read_to_string(markdown_path) {
        Ok(markdown) => {
            if markdown.trim().is_empty() {
                warn!("empty markdown file: {}", markdown_path.display());
            }
            to_document_from_str(&markdown, &title)
        }
        Err(e) => {
            warn!("cannot read {}: {}", markdown_path.display(), e);
            let mut metadata = base_metadata();
            metadata.error = Some(format!("Conversion error: {}", e));
            DocumentRecord {
                doc_id: doc_id_for(&title),
                title,
                metadata,
                sections: Vec::new(),
                full_text: String::new(),
            }
        }
    }
}

/// Map Markdown text to a [`DocumentRecord`].
pub fn to_document_from_str(markdown: &str, title: &str) -> DocumentRecord {
    let doc_id = doc_id_for(title);
    let mut metadata = base_metadata();

    if markdown.trim().is_empty() {
        metadata.warning = Some("Empty source file".to_string());
        return DocumentRecord {
            doc_id,
            title: title.to_string(),
            metadata,
            sections: Vec::new(),
            full_text: String::new(),
        };
    }

    let sections = split_sections(markdown);
    let search = sections
        .iter()
        .take(METADATA_SECTIONS)
        .map(|s| format!("{}\n{}", s.title, s.content))
        .collect::<Vec<_>>()
        .join("\n");
    let search = format!("{}\n{}", title, search);

    metadata.date = first_capture(RE_DATES.iter(), &search);
    metadata.classification =
        first_capture(RE_CLASSIFICATION.iter(), &search).map(|c| c.to_uppercase());
    metadata.agency = find_agency(&search);
    metadata.page_count = sections.iter().filter(|s| s.title.contains("Page")).count();
    debug!(
        doc_id = %doc_id,
        sections = sections.len(),
        pages = metadata.page_count,
        "mapped markdown"
    );

    DocumentRecord {
        doc_id,
        title: title.to_string(),
        metadata,
        sections,
        full_text: markdown.to_string(),
    }
}

fn first_capture<'a>(patterns: impl Iterator<Item = &'a Regex>, text: &str) -> Option<String> {
    patterns
        .filter_map(|re| re.captures(text))
        .map(|c| c[1].trim().to_string())
        .find(|s| !s.is_empty())
}

fn find_agency(text: &str) -> Option<String> {
    if let Some(c) = RE_AGENCY_LABEL.captures(text) {
        let value = c[1].trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    RE_AGENCY_NAME.captures(text).map(|c| c[1].to_uppercase())
}

#[derive(Default)]
struct Pending {
    title: String,
    level: u8,
    lines: Vec<String>,
}

impl Pending {
    fn is_open(&self) -> bool {
        !self.title.is_empty()
    }

    fn has_content(&self) -> bool {
        !self.lines.is_empty()
    }

    fn finish(self) -> Section {
        let joined = collapse_newlines(&self.lines.join("\n"));
        Section {
            title: self.title,
            level: self.level,
            content: joined.trim_end_matches('\n').to_string(),
        }
    }
}

/// Split Markdown into sections at ATX headers, ignoring headers inside
/// fenced code blocks.
fn split_sections(markdown: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = Pending::default();
    let mut in_fence = false;

    for line in markdown.split('\n') {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            if current.is_open() {
                current.lines.push(line.to_string());
            }
            continue;
        }
        if in_fence {
            if current.is_open() {
                current.lines.push(line.to_string());
            }
            continue;
        }

        if let Some(c) = RE_HEADER.captures(line) {
            let previous = std::mem::take(&mut current);
            if previous.is_open() && previous.has_content() {
                sections.push(previous.finish());
            }
            let title = match RE_PAGE.captures(line) {
                Some(p) => format!("Page {}", &p[1]),
                None => c[2].trim().to_string(),
            };
            current = Pending {
                title,
                level: c[1].len() as u8,
                lines: Vec::new(),
            };
        } else if !line.trim().is_empty() {
            if current.is_open() {
                current.lines.push(line.to_string());
            } else if sections.is_empty() {
                current = Pending {
                    title: IMPLICIT_SECTION.to_string(),
                    level: 1,
                    lines: vec![line.to_string()],
                };
            }
        } else if current.is_open() && current.has_content() {
            current.lines.push(String::new());
        }
    }
    if current.is_open() && current.has_content() {
        sections.push(current.finish());
    }

    if sections.is_empty() {
        let all = Pending {
            title: IMPLICIT_SECTION.to_string(),
            level: 1,
            lines: markdown.split('\n').map(str::to_string).collect(),
        };
        sections.push(all.finish());
    }
    sections
}

/// Write `record` as pretty JSON, atomically.
pub async fn write_document(record: &DocumentRecord, json_path: &Path) -> Result<(), HarvestError> {
    let json = serde_json::to_vec_pretty(record).map_err(|e| HarvestError::InvalidOutput {
        path: json_path.to_path_buf(),
        detail: e.to_string(),
    })?;
    write_atomic(json_path, &json).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_ids() {
        assert_eq!(doc_id_for("104-10003-10041"), "104-10003-10041");
        assert_eq!(doc_id_for("104-10003-10041_a"), "104-10003-10041");
        assert_eq!(doc_id_for("DOCID-32204484"), "docid-32204484");
        assert_eq!(doc_id_for("docid 123"), "docid-123");
        assert_eq!(doc_id_for("memo"), "memo");
    }

    #[test]
    fn page_scenario() {
        let md = "# Doc\n\n## Page 1\n\nHello world.\n\n## Page 2\n\nBye.\n";
        let rec = to_document_from_str(md, "104-10003-10041");
        assert_eq!(rec.doc_id, "104-10003-10041");
        assert_eq!(rec.sections.len(), 2);
        assert_eq!(rec.sections[0].title, "Page 1");
        assert_eq!(rec.sections[0].level, 2);
        assert_eq!(rec.sections[0].content, "Hello world.");
        assert_eq!(rec.sections[1].content, "Bye.");
        assert_eq!(rec.metadata.page_count, 2);
        assert_eq!(rec.full_text, md);
    }

    #[test]
    fn header_followed_by_header_yields_no_section() {
        let rec = to_document_from_str("# A\n# B\ntext\n", "x");
        assert_eq!(rec.sections.len(), 1);
        assert_eq!(rec.sections[0].title, "B");
    }

    #[test]
    fn page_header_retitled() {
        let rec = to_document_from_str("### PAGE 7 of 9\ncontent\n", "x");
        assert_eq!(rec.sections[0].title, "Page 7");
    }

    #[test]
    fn leading_text_gets_implicit_section() {
        let rec = to_document_from_str("Loose text\nmore\n\n## Next\nbody", "x");
        assert_eq!(rec.sections[0].title, "Document Content");
        assert_eq!(rec.sections[0].content, "Loose text\nmore");
        assert_eq!(rec.sections[1].title, "Next");
    }

    #[test]
    fn fenced_headers_are_content() {
        let md = "## Code\n```\n# not a header\n```\nafter";
        let rec = to_document_from_str(md, "x");
        assert_eq!(rec.sections.len(), 1);
        assert_eq!(rec.sections[0].content, "```\n# not a header\n```\nafter");
    }

    #[test]
    fn headers_only_fall_back_to_whole_text() {
        let rec = to_document_from_str("# Only\n# Headers", "x");
        assert_eq!(rec.sections.len(), 1);
        assert_eq!(rec.sections[0].title, "Document Content");
        assert_eq!(rec.sections[0].content, "# Only\n# Headers");
    }

    #[test]
    fn blank_runs_collapsed() {
        let rec = to_document_from_str("## S\none\n\n\n\ntwo", "x");
        assert_eq!(rec.sections[0].content, "one\n\ntwo");
    }

    #[test]
    fn metadata_heuristics() {
        let md = "## Page 1\nDate: 11/22/63\nClassification: top secret\nFrom: Mexico City Station\nbody";
        let rec = to_document_from_str(md, "104-10003-10041");
        assert_eq!(rec.metadata.date.as_deref(), Some("11/22/63"));
        assert_eq!(rec.metadata.classification.as_deref(), Some("TOP SECRET"));
        assert_eq!(rec.metadata.agency.as_deref(), Some("Mexico City Station"));
        assert_eq!(rec.metadata.source, "National Archives");
        assert_eq!(rec.metadata.collection, "JFK Files");
    }

    #[test]
    fn metadata_fallback_patterns() {
        let md = "## Cable\nSent 22 November 1963 by the FBI field office. SECRET";
        let rec = to_document_from_str(md, "x");
        assert_eq!(rec.metadata.date.as_deref(), Some("22 November 1963"));
        assert_eq!(rec.metadata.classification.as_deref(), Some("SECRET"));
        assert_eq!(rec.metadata.agency.as_deref(), Some("FBI"));
    }

    #[test]
    fn empty_input_warns() {
        let rec = to_document_from_str("  \n", "DOCID-1");
        assert_eq!(rec.metadata.warning.as_deref(), Some("Empty source file"));
        assert!(rec.sections.is_empty());
        assert_eq!(rec.full_text, "");
    }

    #[test]
    fn unreadable_file_reports_error() {
        let rec = to_document(Path::new("/definitely/not/here.md"), None);
        assert_eq!(rec.title, "here");
        assert!(rec
            .metadata
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Conversion error:")));
    }

    #[test]
    fn mapping_is_idempotent_apart_from_timestamp() {
        let md = "# Doc\n\n## Page 1\n\nDate: 1/2/1964\n";
        let mut a = to_document_from_str(md, "t");
        let mut b = to_document_from_str(md, "t");
        a.metadata.conversion_timestamp.clear();
        b.metadata.conversion_timestamp.clear();
        assert_eq!(a, b);
    }
}
