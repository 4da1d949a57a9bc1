//! Collection scanning: the `update` flow.
//!
//! Walks every collection root under its glob mask, indexes each matching
//! file through the content-addressed diff, and deactivates rows whose
//! file disappeared. Unreadable files are counted and logged, never fatal.

use std::collections::HashSet;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{QmdError, Result};
use crate::models::{CollectionUpdate, DiffKind};
use crate::store::Store;

/// Re-scan collections (all, or just `only`). Returns one report per
/// collection in name order.
pub async fn run_update(store: &Store, only: Option<&str>) -> Result<Vec<CollectionUpdate>> {
    let collections = store.collections().await?;

    if let Some(name) = only {
        if !collections.iter().any(|c| c.name == name) {
            return Err(QmdError::UnknownCollection { name: name.into() });
        }
    }

    let mut reports = Vec::new();
    for coll in collections {
        if let Some(name) = only {
            if coll.name != name {
                continue;
            }
        }
        reports.push(update_collection(store, &coll.name, &coll.path, &coll.mask).await?);
    }
    Ok(reports)
}

async fn update_collection(
    store: &Store,
    name: &str,
    root: &str,
    mask: &str,
) -> Result<CollectionUpdate> {
    let mut report = CollectionUpdate {
        collection: name.to_string(),
        ..Default::default()
    };

    let root_path = Path::new(root);
    if !root_path.is_dir() {
        tracing::warn!(collection = name, root, "collection root missing, skipping scan");
        report.errors += 1;
        return Ok(report);
    }

    let matcher = build_mask(mask)?;
    let mut seen: HashSet<String> = HashSet::new();

    for entry in WalkDir::new(root_path).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(collection = name, error = %e, "skipping unreadable entry");
                report.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root_path) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        // Dotfiles and anything under a hidden directory stay out.
        if rel.split('/').any(|c| c.starts_with('.')) {
            continue;
        }
        if !matcher.is_match(&rel) {
            continue;
        }

        let body = match std::fs::read_to_string(entry.path()) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(collection = name, file = %rel, error = %e, "could not read file");
                report.errors += 1;
                continue;
            }
        };

        seen.insert(rel.clone());
        let diff = store.add_or_update_document(name, &rel, &body).await?;
        match diff.kind {
            DiffKind::Added => report.added += 1,
            DiffKind::Updated => report.updated += 1,
            DiffKind::Unchanged => report.unchanged += 1,
        }
    }

    // Files that vanished since the last scan.
    for path in store.active_paths(name).await? {
        if !seen.contains(&path) {
            if store.deactivate_document(name, &path).await? {
                report.removed += 1;
            }
        }
    }

    Ok(report)
}

/// A mask is one glob, or several separated by commas.
fn build_mask(mask: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for part in mask.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let glob = Glob::new(part).map_err(|e| QmdError::InvalidConfig {
            field: "mask".into(),
            reason: format!("bad glob '{part}': {e}"),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| QmdError::InvalidConfig {
        field: "mask".into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    async fn store_with_dir() -> (Store, tempfile::TempDir) {
        let store = Store::open_in_memory().await.unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn update_adds_then_noop_then_removes() {
        let (store, dir) = store_with_dir().await;
        fs::write(dir.path().join("a.md"), "# A\nalpha notes").unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.md"), "# B\nbeta notes").unwrap();
        fs::write(dir.path().join("ignored.txt"), "not markdown").unwrap();

        store
            .collection_add("notes", &dir.path().to_string_lossy(), "**/*.md")
            .await
            .unwrap();

        let reports = run_update(&store, None).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].added, 2);
        assert_eq!(reports[0].removed, 0);

        // Second run with nothing changed.
        let reports = run_update(&store, None).await.unwrap();
        assert_eq!(reports[0].added, 0);
        assert_eq!(reports[0].unchanged, 2);

        // Delete a file; its row goes inactive.
        fs::remove_file(dir.path().join("a.md")).unwrap();
        let reports = run_update(&store, None).await.unwrap();
        assert_eq!(reports[0].removed, 1);
        assert!(store.document_by_path("notes", "a.md", false).await.unwrap().is_none());
        assert!(store
            .document_by_path("notes", "sub/b.md", false)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn update_counts_modified_files() {
        let (store, dir) = store_with_dir().await;
        fs::write(dir.path().join("a.md"), "first version").unwrap();
        store
            .collection_add("notes", &dir.path().to_string_lossy(), "**/*.md")
            .await
            .unwrap();
        run_update(&store, None).await.unwrap();

        fs::write(dir.path().join("a.md"), "second version").unwrap();
        let reports = run_update(&store, None).await.unwrap();
        assert_eq!(reports[0].updated, 1);
    }

    #[tokio::test]
    async fn update_unknown_collection_errors() {
        let store = Store::open_in_memory().await.unwrap();
        let err = run_update(&store, Some("missing")).await.unwrap_err();
        assert!(matches!(err, QmdError::UnknownCollection { .. }));
    }

    #[tokio::test]
    async fn update_missing_root_is_counted_not_fatal() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .collection_add("gone", "/definitely/not/here", "**/*.md")
            .await
            .unwrap();
        let reports = run_update(&store, None).await.unwrap();
        assert_eq!(reports[0].errors, 1);
        assert_eq!(reports[0].removed, 0);
    }

    #[tokio::test]
    async fn comma_separated_mask() {
        let (store, dir) = store_with_dir().await;
        fs::write(dir.path().join("a.md"), "md file").unwrap();
        fs::write(dir.path().join("b.txt"), "txt file").unwrap();
        fs::write(dir.path().join("c.rs"), "code file").unwrap();
        store
            .collection_add("mixed", &dir.path().to_string_lossy(), "**/*.md, **/*.txt")
            .await
            .unwrap();

        let reports = run_update(&store, None).await.unwrap();
        assert_eq!(reports[0].added, 2);
    }
}
