//! Document resolution: the `get` and `multi-get` flows.
//!
//! A reference resolves in order of strictness: exact `#docid`, exact
//! `collection/filepath` (or `qmd://` virtual path), then nearest active
//! path by edit distance. A near miss within [`AUTO_RESOLVE_DISTANCE`]
//! resolves silently; anything farther is a not-found carrying up to
//! [`MAX_SUGGESTIONS`] nearby paths.

use globset::Glob;

use crate::config::DEFAULT_MAX_BYTES;
use crate::error::{QmdError, Result};
use crate::models::{is_docid, parse_virtual_path, DocumentResult, GetError, MultiGetResult};
use crate::store::Store;

/// Edit distance at or under which a typo resolves to its nearest path.
pub const AUTO_RESOLVE_DISTANCE: usize = 2;

/// Suggestions attached to a not-found error.
pub const MAX_SUGGESTIONS: usize = 5;

/// Resolve one document reference.
pub async fn find_document(
    store: &Store,
    reference: &str,
    include_body: bool,
) -> Result<DocumentResult> {
    let reference = reference.trim();

    if is_docid(reference) {
        let clean = reference.trim_start_matches('#');
        return match store.documents_by_docid(clean, include_body).await? {
            Some(doc) => Ok(doc),
            None => Err(QmdError::NotFound {
                what: format!("document #{clean}"),
                suggestions: Vec::new(),
            }),
        };
    }

    // Virtual paths pin the collection explicitly.
    if let Some((collection, path)) = parse_virtual_path(reference) {
        return match store.document_by_path(&collection, &path, include_body).await? {
            Some(doc) => Ok(doc),
            None => not_found(store, reference).await,
        };
    }

    // `collection/filepath` exact form.
    if let Some((collection, path)) = reference.split_once('/') {
        if let Some(doc) = store.document_by_path(collection, path, include_body).await? {
            return Ok(doc);
        }
    }

    // Bare filepath, searched across collections.
    for coll in store.collections().await? {
        if let Some(doc) = store
            .document_by_path(&coll.name, reference, include_body)
            .await?
        {
            return Ok(doc);
        }
    }

    // Nearest-neighbour fallback.
    let ranked = ranked_candidates(store, reference).await?;
    if let Some((distance, collection, path)) = ranked.first() {
        if *distance <= AUTO_RESOLVE_DISTANCE {
            if let Some(doc) = store.document_by_path(collection, path, include_body).await? {
                return Ok(doc);
            }
        }
    }

    Err(QmdError::NotFound {
        what: format!("document '{reference}'"),
        suggestions: ranked
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, c, p)| format!("{c}/{p}"))
            .collect(),
    })
}

async fn not_found(store: &Store, reference: &str) -> Result<DocumentResult> {
    let ranked = ranked_candidates(store, reference).await?;
    Err(QmdError::NotFound {
        what: format!("document '{reference}'"),
        suggestions: ranked
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, c, p)| format!("{c}/{p}"))
            .collect(),
    })
}

/// Active paths ranked by edit distance to the reference (display form
/// and bare filepath, whichever is closer).
async fn ranked_candidates(
    store: &Store,
    reference: &str,
) -> Result<Vec<(usize, String, String)>> {
    let mut ranked: Vec<(usize, String, String)> = store
        .all_active_paths()
        .await?
        .into_iter()
        .map(|(collection, path)| {
            let display = format!("{collection}/{path}");
            let d = levenshtein(reference, &display).min(levenshtein(reference, &path));
            (d, collection, path)
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| (a.1.as_str(), a.2.as_str()).cmp(&(b.1.as_str(), b.2.as_str()))));
    Ok(ranked)
}

/// Resolve a `multi-get` pattern: comma-separated elements, each a glob,
/// a `#docid`, or a path. Oversized bodies land under `errors` with kind
/// `oversize` instead of being returned.
pub async fn find_documents(
    store: &Store,
    pattern: &str,
    max_bytes: Option<usize>,
) -> Result<MultiGetResult> {
    let max_bytes = max_bytes.unwrap_or(DEFAULT_MAX_BYTES);
    let mut result = MultiGetResult::default();
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

    for element in pattern.split(',') {
        let element = element.trim();
        if element.is_empty() {
            continue;
        }

        if is_glob(element) {
            let glob = match Glob::new(element) {
                Ok(g) => g.compile_matcher(),
                Err(e) => {
                    result.errors.push(GetError {
                        path: element.to_string(),
                        kind: "invalid_config".into(),
                        message: format!("bad glob: {e}"),
                    });
                    continue;
                }
            };
            let mut matched = false;
            for (collection, path) in store.all_active_paths().await? {
                let display = format!("{collection}/{path}");
                if !(glob.is_match(&display) || glob.is_match(&path)) {
                    continue;
                }
                matched = true;
                if seen.contains(&(collection.clone(), path.clone())) {
                    continue;
                }
                if let Some(doc) = store.document_by_path(&collection, &path, true).await? {
                    push_checked(&mut result, &mut seen, doc, max_bytes);
                }
            }
            if !matched {
                result.errors.push(GetError {
                    path: element.to_string(),
                    kind: "not_found".into(),
                    message: format!("no documents match '{element}'"),
                });
            }
            continue;
        }

        match find_document(store, element, true).await {
            Ok(doc) => {
                if !seen.contains(&(doc.collection.clone(), doc.filepath.clone())) {
                    push_checked(&mut result, &mut seen, doc, max_bytes);
                }
            }
            Err(e) => result.errors.push(GetError {
                path: element.to_string(),
                kind: e.kind().to_string(),
                message: e.to_string(),
            }),
        }
    }

    Ok(result)
}

fn push_checked(
    result: &mut MultiGetResult,
    seen: &mut std::collections::HashSet<(String, String)>,
    doc: DocumentResult,
    max_bytes: usize,
) {
    seen.insert((doc.collection.clone(), doc.filepath.clone()));
    if doc.body_length > max_bytes {
        let err = QmdError::Oversize {
            path: doc.display_path(),
            size: doc.body_length,
            max_bytes,
        };
        result.errors.push(GetError {
            path: doc.display_path(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    } else {
        result.docs.push(doc);
    }
}

fn is_glob(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.collection_add("notes", "/n", "**/*.md").await.unwrap();
        store
            .add_or_update_document("notes", "daily.md", "# Daily\ntoday's notes")
            .await
            .unwrap();
        store
            .add_or_update_document("notes", "ideas.md", "# Ideas\nbig plans")
            .await
            .unwrap();
        store
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("abc", "abd"), 1);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[tokio::test]
    async fn exact_path_and_docid_resolution() {
        let store = seeded_store().await;

        let by_path = find_document(&store, "notes/daily.md", true).await.unwrap();
        assert_eq!(by_path.title, "Daily");
        assert_eq!(by_path.body.as_deref(), Some("# Daily\ntoday's notes"));

        let by_docid = find_document(&store, &format!("#{}", by_path.docid), false)
            .await
            .unwrap();
        assert_eq!(by_docid.filepath, "daily.md");

        let by_bare = find_document(&store, "ideas.md", false).await.unwrap();
        assert_eq!(by_bare.title, "Ideas");

        let by_virtual = find_document(&store, "qmd://notes/daily.md", false)
            .await
            .unwrap();
        assert_eq!(by_virtual.filepath, "daily.md");
    }

    #[tokio::test]
    async fn one_char_typo_auto_resolves() {
        let store = seeded_store().await;
        let doc = find_document(&store, "notes/daly.md", false).await.unwrap();
        assert_eq!(doc.filepath, "daily.md");
    }

    #[tokio::test]
    async fn far_miss_suggests_nearby_paths() {
        let store = seeded_store().await;
        let err = find_document(&store, "notes/quarterly-report.md", false)
            .await
            .unwrap_err();
        match err {
            QmdError::NotFound { suggestions, .. } => {
                assert!(!suggestions.is_empty());
                assert!(suggestions.len() <= MAX_SUGGESTIONS);
                assert!(suggestions.iter().all(|s| s.starts_with("notes/")));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multi_get_glob_and_oversize() {
        let store = seeded_store().await;
        // "today's notes" body is well over 10 bytes.
        let result = find_documents(&store, "notes/*.md", Some(10)).await.unwrap();
        assert!(result.docs.is_empty());
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().all(|e| e.kind == "oversize"));

        let result = find_documents(&store, "notes/*.md", Some(10_000)).await.unwrap();
        assert_eq!(result.docs.len(), 2);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn multi_get_comma_list_mixes_forms() {
        let store = seeded_store().await;
        let daily = find_document(&store, "notes/daily.md", false).await.unwrap();

        let pattern = format!("#{}, notes/ideas.md, notes/missing.md", daily.docid);
        let result = find_documents(&store, &pattern, None).await.unwrap();
        assert_eq!(result.docs.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, "not_found");
    }

    #[tokio::test]
    async fn multi_get_dedups_repeated_matches() {
        let store = seeded_store().await;
        let result = find_documents(&store, "notes/daily.md, notes/*.md", None)
            .await
            .unwrap();
        assert_eq!(result.docs.len(), 2);
    }
}
