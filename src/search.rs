//! The two retrieval primitives: BM25 keyword search and vector k-NN.
//!
//! Both return per-document [`SearchHit`]s. BM25 runs entirely in SQL
//! against the FTS5 index; vector search embeds the query, scans the
//! active namespace's BLOB table, and collapses chunk-level similarities
//! into per-document maxima.

use std::collections::HashMap;

use sqlx::Row;

use crate::embedding::Provider;
use crate::error::{QmdError, Result};
use crate::models::SearchHit;
use crate::store::{blob_to_vec, vector_table_name, Store};

/// Over-fetch factor for chunk-level vector hits: several chunks of one
/// document collapse into a single result.
const CHUNK_OVERFETCH: usize = 4;

/// Keyword search over the FTS5 index. BM25 scores are negative by
/// convention; they are surfaced as positive magnitudes. Snippets carry
/// `>>>`/`<<<` highlighting around matched terms.
pub async fn fts_search(
    store: &Store,
    query: &str,
    limit: usize,
    collection: Option<&str>,
) -> Result<Vec<SearchHit>> {
    let match_expr = fts_match_expr(query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let sql = if collection.is_some() {
        r#"
        SELECT d.collection, d.filepath, d.title, d.docid,
               bm25(documents_fts) AS score,
               snippet(documents_fts, -1, '>>>', '<<<', '…', 24) AS snippet
        FROM documents_fts
        JOIN documents d ON d.id = documents_fts.rowid
        WHERE documents_fts MATCH ?
          AND d.collection = ?
        ORDER BY bm25(documents_fts)
        LIMIT ?
        "#
    } else {
        r#"
        SELECT d.collection, d.filepath, d.title, d.docid,
               bm25(documents_fts) AS score,
               snippet(documents_fts, -1, '>>>', '<<<', '…', 24) AS snippet
        FROM documents_fts
        JOIN documents d ON d.id = documents_fts.rowid
        WHERE documents_fts MATCH ?
        ORDER BY bm25(documents_fts)
        LIMIT ?
        "#
    };

    let query_builder = sqlx::query(sql).bind(&match_expr);
    let query_builder = match collection {
        Some(coll) => query_builder.bind(coll.to_string()).bind(limit as i64),
        None => query_builder.bind(limit as i64),
    };

    let rows = query_builder.fetch_all(store.pool()).await?;

    let mut hits = Vec::with_capacity(rows.len());
    for row in rows {
        let raw: f64 = row.get("score");
        let mut hit = SearchHit {
            docid: row.get("docid"),
            collection: row.get("collection"),
            filepath: row.get("filepath"),
            title: row.get("title"),
            score: raw.abs(),
            snippet: Some(row.get("snippet")),
            context: None,
        };
        hit.context = store.context_for(&hit.collection, &hit.filepath).await?;
        hits.push(hit);
    }
    Ok(hits)
}

/// Semantic search: embed the query with `provider` and rank against its
/// namespace.
pub async fn vec_search(
    store: &Store,
    provider: &Provider,
    query: &str,
    limit: usize,
    collection: Option<&str>,
) -> Result<Vec<SearchHit>> {
    let formatted = provider.format_query(query);
    let embedding = provider.embed(&formatted, true).await?.ok_or_else(|| {
        QmdError::ProviderUnavailable {
            provider: provider.name().into(),
            reason: "query embedding failed".into(),
        }
    })?;
    vec_search_with_embedding(store, &provider.model_key(), &embedding, limit, collection).await
}

/// Rank documents in one namespace against a pre-computed query vector.
///
/// Chunk scores are cosine distance `d` converted to `1/(1+d)` ∈ (0, 1],
/// collapsed per document by max. A namespace with no vector table yields
/// no results rather than an error.
pub async fn vec_search_with_embedding(
    store: &Store,
    model_key: &str,
    query_vec: &[f32],
    limit: usize,
    collection: Option<&str>,
) -> Result<Vec<SearchHit>> {
    let table = vector_table_name(model_key);
    let table_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
    )
    .bind(&table)
    .fetch_one(store.pool())
    .await?;
    if !table_exists {
        return Ok(Vec::new());
    }

    let sql = if collection.is_some() {
        format!(
            r#"
            SELECT d.collection, d.filepath, d.title, d.docid, v.embedding
            FROM content_vectors cv
            JOIN {table} v ON v.hash_seq = cv.content_hash || '_' || cv.seq
            JOIN documents d ON d.content_hash = cv.content_hash AND d.active = 1
            WHERE cv.model = ? AND d.collection = ?
            "#
        )
    } else {
        format!(
            r#"
            SELECT d.collection, d.filepath, d.title, d.docid, v.embedding
            FROM content_vectors cv
            JOIN {table} v ON v.hash_seq = cv.content_hash || '_' || cv.seq
            JOIN documents d ON d.content_hash = cv.content_hash AND d.active = 1
            WHERE cv.model = ?
            "#
        )
    };

    let query_builder = sqlx::query(&sql).bind(model_key);
    let query_builder = match collection {
        Some(coll) => query_builder.bind(coll.to_string()),
        None => query_builder,
    };
    let rows = query_builder.fetch_all(store.pool()).await?;

    // Chunk-level similarities first.
    struct ChunkScore {
        collection: String,
        filepath: String,
        title: String,
        docid: String,
        score: f64,
    }

    let mut chunk_scores: Vec<ChunkScore> = Vec::with_capacity(rows.len());
    for row in &rows {
        let blob: Vec<u8> = row.get("embedding");
        let doc_vec = blob_to_vec(&blob);
        if doc_vec.len() != query_vec.len() {
            // Stale rows from a dimension change; cleanup repairs these.
            continue;
        }
        let distance = 1.0 - f64::from(cosine_similarity(query_vec, &doc_vec));
        chunk_scores.push(ChunkScore {
            collection: row.get("collection"),
            filepath: row.get("filepath"),
            title: row.get("title"),
            docid: row.get("docid"),
            score: 1.0 / (1.0 + distance),
        });
    }

    chunk_scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    chunk_scores.truncate(limit * CHUNK_OVERFETCH);

    // Collapse to per-document maxima.
    let mut best: HashMap<(String, String), ChunkScore> = HashMap::new();
    for cs in chunk_scores {
        let key = (cs.collection.clone(), cs.filepath.clone());
        match best.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                if cs.score > e.get().score {
                    e.insert(cs);
                }
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(cs);
            }
        }
    }

    let mut docs: Vec<ChunkScore> = best.into_values().collect();
    docs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.docid.cmp(&b.docid))
    });
    docs.truncate(limit);

    let mut hits = Vec::with_capacity(docs.len());
    for d in docs {
        let context = store.context_for(&d.collection, &d.filepath).await?;
        hits.push(SearchHit {
            docid: d.docid,
            collection: d.collection,
            filepath: d.filepath,
            title: d.title,
            score: d.score,
            snippet: None,
            context,
        });
    }
    Ok(hits)
}

/// Cosine similarity of two equal-length vectors; 0.0 on mismatch or
/// zero norms.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Quote each whitespace-separated term so punctuation cannot break the
/// FTS5 query grammar. Terms are implicitly ANDed.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.collection_add("notes", "/n", "**/*.md").await.unwrap();
        store
            .add_or_update_document("notes", "a.md", "# Title\nhello world")
            .await
            .unwrap();
        store
            .add_or_update_document("notes", "b.md", "# Other\nnothing to see")
            .await
            .unwrap();
        store
    }

    #[test]
    fn match_expr_quotes_terms() {
        assert_eq!(fts_match_expr("hello world"), "\"hello\" \"world\"");
        assert_eq!(fts_match_expr("c'est-la-vie"), "\"c'est-la-vie\"");
        assert_eq!(fts_match_expr(""), "");
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn fts_scores_are_positive() {
        let store = seeded_store().await;
        let hits = fts_search(&store, "hello", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);
        assert_eq!(hits[0].filepath, "a.md");
        assert!(hits[0].snippet.as_deref().unwrap().contains(">>>hello<<<"));
    }

    #[tokio::test]
    async fn fts_respects_collection_filter() {
        let store = seeded_store().await;
        store.collection_add("work", "/w", "**/*.md").await.unwrap();
        store
            .add_or_update_document("work", "w.md", "hello from work")
            .await
            .unwrap();

        let all = fts_search(&store, "hello", 10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let scoped = fts_search(&store, "hello", 10, Some("work")).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].collection, "work");
    }

    #[tokio::test]
    async fn fts_ignores_inactive_rows() {
        let store = seeded_store().await;
        store
            .add_or_update_document("notes", "a.md", "# Title\ngoodbye world")
            .await
            .unwrap();

        let hello = fts_search(&store, "hello", 10, None).await.unwrap();
        assert!(hello.is_empty());
        let goodbye = fts_search(&store, "goodbye", 10, None).await.unwrap();
        assert_eq!(goodbye.len(), 1);
    }

    #[tokio::test]
    async fn vector_search_collapses_chunks_to_documents() {
        let store = seeded_store().await;
        let ns = "local/nomic-embed-text-v1.5";
        store.ensure_vector_table(ns).await.unwrap();

        let diff = store
            .add_or_update_document("notes", "c.md", "multi chunk doc")
            .await
            .unwrap();
        // Two chunks of the same document: only the best survives.
        store.insert_vector(ns, &diff.hash, 0, 0, &[1.0, 0.0]).await.unwrap();
        store.insert_vector(ns, &diff.hash, 1, 3200, &[0.0, 1.0]).await.unwrap();

        let hits = vec_search_with_embedding(&store, ns, &[1.0, 0.0], 10, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filepath, "c.md");
        // Identical direction: distance 0 → similarity 1.
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn vector_search_empty_namespace_returns_nothing() {
        let store = seeded_store().await;
        let hits = vec_search_with_embedding(
            &store,
            "openai/text-embedding-3-small",
            &[1.0, 0.0],
            10,
            None,
        )
        .await
        .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn vector_search_skips_dimension_mismatches() {
        let store = seeded_store().await;
        let ns = "local/nomic-embed-text-v1.5";
        store.ensure_vector_table(ns).await.unwrap();
        let diff = store
            .add_or_update_document("notes", "d.md", "dims doc")
            .await
            .unwrap();
        store.insert_vector(ns, &diff.hash, 0, 0, &[1.0, 0.0, 0.0]).await.unwrap();

        let hits = vec_search_with_embedding(&store, ns, &[1.0, 0.0], 10, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn vector_similarity_is_bounded() {
        let store = seeded_store().await;
        let ns = "local/nomic-embed-text-v1.5";
        store.ensure_vector_table(ns).await.unwrap();
        let diff = store
            .add_or_update_document("notes", "e.md", "opposite doc")
            .await
            .unwrap();
        store.insert_vector(ns, &diff.hash, 0, 0, &[-1.0, 0.0]).await.unwrap();

        let hits = vec_search_with_embedding(&store, ns, &[1.0, 0.0], 10, None)
            .await
            .unwrap();
        // Opposite direction: distance 2 → similarity 1/3; still positive.
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0 && hits[0].score <= 1.0);
        assert!((hits[0].score - 1.0 / 3.0).abs() < 1e-6);
    }
}
