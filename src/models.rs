//! Core data types flowing through the indexing and retrieval pipeline.
//!
//! ```text
//! collection scan → add_or_update_document() → Document (active row)
//!                                                   ↓
//!                                      chunk() → embed() → vectors_vec_<ns>
//!                                                   ↓
//!                        search / vsearch / query → SearchHit
//! ```
//!
//! Identity is content-addressed: a document's `content_hash` is the
//! SHA-256 of its body, and its `docid` is the first six hex characters of
//! that hash (displayed as `#xxxxxx`). Docids may collide; lookups resolve
//! collisions through the full hash and report ambiguity.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// A named set of files rooted at a filesystem path under a glob mask.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub path: String,
    pub mask: String,
    /// Number of active documents.
    pub active_count: usize,
    pub last_modified: Option<String>,
}

/// Outcome of indexing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Added,
    Unchanged,
    Updated,
}

/// Result of [`crate::store::Store::add_or_update_document`].
#[derive(Debug, Clone)]
pub struct DocDiff {
    pub kind: DiffKind,
    /// Content hash of the (possibly new) active row.
    pub hash: String,
}

/// An indexed document snapshot, with or without its body.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResult {
    pub docid: String,
    pub collection: String,
    pub filepath: String,
    pub title: String,
    pub content_hash: String,
    pub modified_at: String,
    pub body_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Most specific matching path context, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl DocumentResult {
    /// `collection/filepath`, the display form used everywhere.
    pub fn display_path(&self) -> String {
        format!("{}/{}", self.collection, self.filepath)
    }

    /// `qmd://collection/filepath`.
    pub fn virtual_path(&self) -> String {
        build_virtual_path(&self.collection, &self.filepath)
    }
}

/// One ranked result from any of the three search modes.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub docid: String,
    pub collection: String,
    pub filepath: String,
    pub title: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl SearchHit {
    pub fn display_path(&self) -> String {
        format!("{}/{}", self.collection, self.filepath)
    }
}

/// Per-collection outcome of `update`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionUpdate {
    pub collection: String,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// Files that could not be read; counted, never fatal.
    pub errors: usize,
}

/// Outcome of an `embed` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbedReport {
    pub documents: usize,
    pub chunks_embedded: usize,
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
}

/// Vector count for one provider/model namespace.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceCount {
    pub model: String,
    pub vectors: usize,
}

/// Output of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub collections: Vec<CollectionInfo>,
    pub total_documents: usize,
    pub total_chunks: usize,
    pub vectors: Vec<NamespaceCount>,
    pub active_provider: String,
    /// Active documents missing vectors in the active namespace.
    pub needs_embedding: usize,
    /// Loaded/released state per model slot, e.g. `("embedder", true)`.
    pub model_slots: Vec<(String, bool)>,
}

/// One failed element of a `multi-get` request.
#[derive(Debug, Clone, Serialize)]
pub struct GetError {
    pub path: String,
    pub kind: String,
    pub message: String,
}

/// Result of `multi-get`: resolved documents plus per-element failures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MultiGetResult {
    pub docs: Vec<DocumentResult>,
    pub errors: Vec<GetError>,
}

/// SHA-256 of a document body, lowercase hex.
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First six hex characters of a content hash.
pub fn docid_from_hash(hash: &str) -> String {
    hash.chars().take(6).collect()
}

/// Title of a markdown document: the first top-level heading, else the
/// filename stem.
pub fn extract_title(body: &str, filepath: &str) -> String {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("# ") {
            let title = rest.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    std::path::Path::new(filepath)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filepath.to_string())
}

/// Whether a string looks like a docid (`#a1b2c3` or `a1b2c3`).
pub fn is_docid(s: &str) -> bool {
    let clean = s.trim_start_matches('#');
    clean.len() == 6 && clean.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Build `qmd://collection/path` (`qmd://collection` when path is empty).
pub fn build_virtual_path(collection: &str, path: &str) -> String {
    if path.is_empty() {
        format!("qmd://{collection}")
    } else {
        format!("qmd://{collection}/{path}")
    }
}

/// Parse `qmd://collection[/path]` into `(collection, path)`.
pub fn parse_virtual_path(input: &str) -> Option<(String, String)> {
    let stripped = normalize_virtual_path(input);
    let rest = stripped.strip_prefix("qmd://")?;
    let mut parts = rest.splitn(2, '/');
    let collection = parts.next()?.to_string();
    if collection.is_empty() {
        return None;
    }
    let path = parts.next().unwrap_or("").to_string();
    Some((collection, path))
}

/// Accept `qmd:coll/p`, `//coll/p`, and `qmd://coll/p` spellings.
pub fn normalize_virtual_path(input: &str) -> String {
    let path = input.trim();

    if let Some(rest) = path.strip_prefix("qmd:") {
        let rest = rest.trim_start_matches('/');
        return format!("qmd://{rest}");
    }

    if path.starts_with("//") {
        let rest = path.trim_start_matches('/');
        return format!("qmd://{rest}");
    }

    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256_hex() {
        let hash = content_hash("# Title\nhello world");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls
        assert_eq!(hash, content_hash("# Title\nhello world"));
    }

    #[test]
    fn docid_is_six_hex_prefix() {
        let hash = content_hash("anything");
        let docid = docid_from_hash(&hash);
        assert_eq!(docid.len(), 6);
        assert!(hash.starts_with(&docid));
    }

    #[test]
    fn title_from_heading() {
        assert_eq!(extract_title("# My Notes\nbody", "a.md"), "My Notes");
        assert_eq!(extract_title("intro\n\n# Later Heading\n", "a.md"), "Later Heading");
    }

    #[test]
    fn title_falls_back_to_stem() {
        assert_eq!(extract_title("no heading here", "notes/daily.md"), "daily");
        assert_eq!(extract_title("", "x.md"), "x");
    }

    #[test]
    fn docid_detection() {
        assert!(is_docid("#a1b2c3"));
        assert!(is_docid("a1b2c3"));
        assert!(!is_docid("A1B2C3"));
        assert!(!is_docid("a1b2c"));
        assert!(!is_docid("notes/a.md"));
    }

    #[test]
    fn virtual_path_roundtrip() {
        let vp = build_virtual_path("notes", "daily/a.md");
        assert_eq!(vp, "qmd://notes/daily/a.md");
        let (c, p) = parse_virtual_path(&vp).unwrap();
        assert_eq!(c, "notes");
        assert_eq!(p, "daily/a.md");
    }

    #[test]
    fn virtual_path_spellings() {
        assert_eq!(normalize_virtual_path("qmd:notes/a.md"), "qmd://notes/a.md");
        assert_eq!(normalize_virtual_path("//notes/a.md"), "qmd://notes/a.md");
        let (c, p) = parse_virtual_path("qmd://notes").unwrap();
        assert_eq!(c, "notes");
        assert_eq!(p, "");
    }
}
