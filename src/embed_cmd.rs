//! The `embed` flow: chunk and embed active documents into the
//! provider's namespace.
//!
//! The chunk-level `(content_hash, seq, model)` primary key makes a run
//! resumable: an interrupted `embed` keeps the vectors it already wrote,
//! and the next run only embeds the missing chunks. A failed batch marks
//! its chunks failed and continues; it never aborts the run.

use std::collections::HashSet;

use crate::chunker;
use crate::embedding::Provider;
use crate::error::Result;
use crate::models::EmbedReport;
use crate::store::Store;

/// Embed every active document (optionally one collection) into the
/// provider's namespace. `force` clears the namespace first.
pub async fn run_embed(
    store: &Store,
    provider: &Provider,
    force: bool,
    collection: Option<&str>,
) -> Result<EmbedReport> {
    let model_key = provider.model_key();
    store.ensure_vector_table(&model_key).await?;

    if force {
        let cleared = store.clear_namespace(&model_key).await?;
        if cleared > 0 {
            tracing::info!(namespace = %model_key, cleared, "cleared namespace for re-embed");
        }
    }

    let policy = provider.chunk_policy();
    let docs = store.active_docs_with_bodies(collection).await?;
    let mut report = EmbedReport::default();

    for (hash, title, body) in docs {
        let chunks = chunker::chunk(&body, &policy);
        if chunks.is_empty() {
            continue;
        }

        let existing: HashSet<i64> = store
            .existing_seqs(&model_key, &hash)
            .await?
            .into_iter()
            .collect();

        let missing: Vec<(usize, &chunker::Chunk)> = chunks
            .iter()
            .enumerate()
            .filter(|(seq, _)| !existing.contains(&(*seq as i64)))
            .collect();

        if missing.is_empty() {
            report.chunks_skipped += chunks.len();
            continue;
        }
        report.documents += 1;
        report.chunks_skipped += chunks.len() - missing.len();

        let texts: Vec<String> = missing
            .iter()
            .map(|(_, c)| provider.format_document(Some(&title), &c.text))
            .collect();

        let vectors = match provider.embed_batch(&texts, false).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(hash = %hash, error = %e, "embedding batch failed");
                report.chunks_failed += missing.len();
                continue;
            }
        };

        for ((seq, chunk), vector) in missing.iter().zip(vectors) {
            match vector {
                Some(v) => {
                    store
                        .insert_vector(&model_key, &hash, *seq, chunk.pos, &v)
                        .await?;
                    report.chunks_embedded += 1;
                }
                None => report.chunks_failed += 1,
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Provider-independent pieces of the flow; end-to-end embedding is
    // exercised in the integration tests with synthetic vectors.

    #[tokio::test]
    async fn resume_skips_already_embedded_chunks() {
        let store = Store::open_in_memory().await.unwrap();
        store.collection_add("notes", "/n", "**/*.md").await.unwrap();
        let diff = store
            .add_or_update_document("notes", "long.md", &"words ".repeat(1200))
            .await
            .unwrap();

        let ns = "local/nomic-embed-text-v1.5";
        store.ensure_vector_table(ns).await.unwrap();
        // Pretend a previous run embedded the first chunk before stopping.
        store.insert_vector(ns, &diff.hash, 0, 0, &[0.5; 4]).await.unwrap();

        let existing = store.existing_seqs(ns, &diff.hash).await.unwrap();
        assert_eq!(existing, vec![0]);

        let policy = crate::chunker::ChunkPolicy::tokens();
        let chunks = chunker::chunk(&"words ".repeat(1200), &policy);
        assert!(chunks.len() > 1);
        let missing: Vec<usize> = chunks
            .iter()
            .enumerate()
            .map(|(seq, _)| seq)
            .filter(|seq| !existing.contains(&(*seq as i64)))
            .collect();
        assert!(!missing.contains(&0));
        assert_eq!(missing.len(), chunks.len() - 1);
    }
}
