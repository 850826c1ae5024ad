//! Knowledge-base aggregation of per-document JSON records.
//!
//! The output is one JSON array: a metadata header followed by one flattened
//! entry per unique document id. Re-adding an id replaces the earlier entry
//! in place, so the array keeps first-appearance order.

use crate::error::HarvestError;
use crate::output::DocumentRecord;
use crate::storage::write_atomic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const KB_NAME: &str = "JFK Files Archive";
pub const KB_DESCRIPTION: &str = "Declassified documents from the JFK Assassination Records Collection";
pub const KB_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbHeader {
    pub knowledge_base_name: String,
    pub description: String,
    pub document_count: usize,
    pub created_at: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbDocumentMetadata {
    pub source: String,
    pub timestamp: String,
    pub total_pages: usize,
    pub conversion_method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    pub metadata: KbDocumentMetadata,
}

/// One element of the serialised array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KbEntry {
    Metadata(KbHeader),
    Document(KbDocument),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeBase {
    header: KbHeader,
    documents: Vec<KbDocument>,
    index: HashMap<String, usize>,
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self {
            header: KbHeader {
                knowledge_base_name: KB_NAME.to_string(),
                description: KB_DESCRIPTION.to_string(),
                document_count: 0,
                created_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                version: KB_VERSION.to_string(),
            },
            documents: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DocumentRecord>) -> Self {
        let mut kb = Self::new();
        for record in records {
            kb.add(record);
        }
        kb
    }

    pub fn header(&self) -> &KbHeader {
        &self.header
    }

    pub fn documents(&self) -> &[KbDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Add or replace the entry for `record.doc_id`.
    pub fn add(&mut self, record: &DocumentRecord) {
        let doc = flatten(record);
        match self.index.get(&doc.id) {
            Some(&pos) => {
                warn!("duplicate document {}, keeping the newer record", doc.id);
                self.documents[pos] = doc;
            }
            None => {
                self.index.insert(doc.id.clone(), self.documents.len());
                self.documents.push(doc);
            }
        }
        self.header.document_count = self.documents.len();
    }

    /// Load every `*.json` record in `json_dir` (sorted by file name).
    /// Unparseable files are skipped with a warning.
    pub async fn merge_dir(json_dir: &Path) -> Result<Self, HarvestError> {
        let mut paths = json_files(json_dir).await?;
        paths.sort();

        let mut kb = Self::new();
        for path in &paths {
            let raw = match tokio::fs::read(path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_slice::<DocumentRecord>(&raw) {
                Ok(record) => kb.add(&record),
                Err(e) => warn!("skipping {}: not a document record ({})", path.display(), e),
            }
        }
        info!(
            "merged {} documents from {} files in {}",
            kb.len(),
            paths.len(),
            json_dir.display()
        );
        Ok(kb)
    }

    fn entries(&self) -> Vec<KbEntry> {
        std::iter::once(KbEntry::Metadata(self.header.clone()))
            .chain(self.documents.iter().cloned().map(KbEntry::Document))
            .collect()
    }

    pub fn to_json(&self) -> Result<String, HarvestError> {
        serde_json::to_string_pretty(&self.entries())
            .map_err(|e| HarvestError::Internal(format!("knowledge base serialisation: {}", e)))
    }

    /// Write the array atomically.
    pub async fn write(&self, path: &Path) -> Result<(), HarvestError> {
        write_atomic(path, self.to_json()?.as_bytes()).await?;
        info!("wrote knowledge base with {} documents to {}", self.len(), path.display());
        Ok(())
    }

    pub async fn read(path: &Path) -> Result<Self, HarvestError> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| HarvestError::StorageFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        let invalid = |detail: String| HarvestError::InvalidOutput {
            path: path.to_path_buf(),
            detail,
        };
        let entries: Vec<KbEntry> =
            serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))?;

        let mut iter = entries.into_iter();
        let header = match iter.next() {
            Some(KbEntry::Metadata(h)) => h,
            _ => return Err(invalid("first element must be the metadata header".into())),
        };
        let mut kb = Self {
            header,
            documents: Vec::new(),
            index: HashMap::new(),
        };
        for entry in iter {
            match entry {
                KbEntry::Document(doc) => {
                    kb.index.insert(doc.id.clone(), kb.documents.len());
                    kb.documents.push(doc);
                }
                KbEntry::Metadata(_) => {
                    return Err(invalid("metadata header repeated".into()));
                }
            }
        }
        Ok(kb)
    }

    /// Structural problems; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.header.document_count != self.documents.len() {
            errors.push(format!(
                "Document count mismatch: metadata says {}, but found {} documents",
                self.header.document_count,
                self.documents.len()
            ));
        }
        let mut seen = HashSet::new();
        for doc in &self.documents {
            if !seen.insert(doc.id.as_str()) {
                errors.push(format!("Duplicate document ID: {}", doc.id));
            }
        }
        errors
    }
}

/// Check an arbitrary JSON value against the knowledge-base layout.
pub fn validate_value(data: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(items) = data.as_array() else {
        return vec!["JSON data must be an array".to_string()];
    };
    let Some(first) = items.first() else {
        return vec!["JSON array is empty".to_string()];
    };

    for field in [
        "type",
        "knowledge_base_name",
        "description",
        "document_count",
        "created_at",
        "version",
    ] {
        if first.get(field).is_none() {
            errors.push(format!("Metadata missing required field: {}", field));
        }
    }
    if first.get("type").and_then(Value::as_str) != Some("metadata") {
        errors.push("Metadata 'type' field must be 'metadata'".to_string());
    }
    if let Some(count) = first.get("document_count").and_then(Value::as_u64) {
        if count as usize != items.len() - 1 {
            errors.push(format!(
                "Document count mismatch: metadata says {}, but found {} documents",
                count,
                items.len() - 1
            ));
        }
    }

    let mut ids = HashSet::new();
    for (i, doc) in items.iter().enumerate().skip(1) {
        for field in ["type", "id", "title", "content", "metadata"] {
            if doc.get(field).is_none() {
                errors.push(format!("Document at index {} missing required field: {}", i, field));
            }
        }
        if doc.get("type").and_then(Value::as_str) != Some("document") {
            errors.push(format!("Document at index {} has incorrect 'type' value", i));
        }
        if let Some(id) = doc.get("id").and_then(Value::as_str) {
            if !ids.insert(id.to_string()) {
                errors.push(format!("Duplicate document ID: {}", id));
            }
        }
        if let Some(meta) = doc.get("metadata") {
            for field in ["source", "timestamp", "total_pages"] {
                if meta.get(field).is_none() {
                    errors.push(format!(
                        "Document at index {} metadata missing required field: {}",
                        i, field
                    ));
                }
            }
        }
    }
    errors
}

fn flatten(record: &DocumentRecord) -> KbDocument {
    let own_heading = format!("# {}", record.doc_id);
    let mut parts = Vec::new();
    for section in &record.sections {
        if !section.title.is_empty() && section.title != "Unknown" {
            parts.push(format!("## {}", section.title));
        }
        let content = match section.content.strip_prefix(own_heading.as_str()) {
            Some(rest) => rest.trim_start(),
            None => section.content.as_str(),
        };
        let content = content.trim();
        if !content.is_empty() {
            parts.push(content.to_string());
        }
    }

    KbDocument {
        id: record.doc_id.clone(),
        title: record.title.clone(),
        content: parts.join("\n\n").trim().to_string(),
        metadata: KbDocumentMetadata {
            source: format!("{}.json", record.doc_id),
            timestamp: record.metadata.conversion_timestamp.clone(),
            total_pages: record.metadata.page_count,
            conversion_method: record
                .metadata
                .conversion_method
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        },
    }
}

async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, HarvestError> {
    let storage = |e| HarvestError::StorageFailed {
        path: dir.to_path_buf(),
        source: e,
    };
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await.map_err(storage)?;
    while let Some(entry) = rd.next_entry().await.map_err(storage)? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            out.push(path);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::to_document_from_str;

    fn record(id: &str, body: &str) -> DocumentRecord {
        to_document_from_str(&format!("## Page 1\n\n{}\n", body), id)
    }

    #[test]
    fn duplicate_ids_keep_last_record_in_first_position() {
        let a = record("104-1-1", "first");
        let b = record("104-2-2", "other");
        let a2 = record("104-1-1", "second");
        let kb = KnowledgeBase::from_records([&a, &b, &a2]);

        assert_eq!(kb.len(), 2);
        assert_eq!(kb.header().document_count, 2);
        assert_eq!(kb.documents()[0].id, "104-1-1");
        assert!(kb.documents()[0].content.contains("second"));
        assert!(kb.validate().is_empty());
    }

    #[test]
    fn content_flattens_sections() {
        let rec = to_document_from_str("# 104-1-1\n\n## Page 1\n\nalpha\n\n## Page 2\n\nbeta\n", "104-1-1");
        let doc = flatten(&rec);
        assert_eq!(doc.content, "## Page 1\n\nalpha\n\n## Page 2\n\nbeta");
        assert_eq!(doc.metadata.source, "104-1-1.json");
        assert_eq!(doc.metadata.total_pages, 2);
        assert_eq!(doc.metadata.conversion_method, "unknown");
    }

    #[test]
    fn serialised_layout() {
        let kb = KnowledgeBase::from_records([&record("a-1-1", "x")]);
        let value: Value = serde_json::from_str(&kb.to_json().unwrap()).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items[0]["type"], "metadata");
        assert_eq!(items[0]["knowledge_base_name"], KB_NAME);
        assert_eq!(items[0]["version"], "1.0");
        assert_eq!(items[0]["document_count"], 1);
        assert_eq!(items[1]["type"], "document");
        assert_eq!(items[1]["metadata"]["source"], "a-1-1.json");
        assert!(validate_value(&value).is_empty());
    }

    #[test]
    fn validator_flags_count_mismatch_and_duplicates() {
        let value = serde_json::json!([
            {"type": "metadata", "knowledge_base_name": "k", "description": "d",
             "document_count": 5, "created_at": "now", "version": "1.0"},
            {"type": "document", "id": "x", "title": "t", "content": "c",
             "metadata": {"source": "x.json", "timestamp": "", "total_pages": 0}},
            {"type": "document", "id": "x", "title": "t", "content": "c",
             "metadata": {"source": "x.json", "timestamp": ""}}
        ]);
        let errors = validate_value(&value);
        assert!(errors.iter().any(|e| e.starts_with("Document count mismatch")));
        assert!(errors.iter().any(|e| e == "Duplicate document ID: x"));
        assert!(errors.iter().any(|e| e.contains("total_pages")));
    }

    #[test]
    fn validator_rejects_non_arrays() {
        assert_eq!(
            validate_value(&serde_json::json!({})),
            vec!["JSON data must be an array".to_string()]
        );
    }
}
