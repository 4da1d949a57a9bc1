//! The hybrid `query` pipeline.
//!
//! ```text
//! query ──▶ expand ──▶ { original ×2, variant1, variant2 }
//!                              │ (parallel per query)
//!                   ┌──────────┴──────────┐
//!                   ▼                     ▼
//!               fts_search            vec_search
//!                   └──────────┬──────────┘
//!                              ▼
//!          weighted RRF fusion + top-rank bonus, keep 30
//!                              ▼
//!              cross-encoder rerank (original query)
//!                              ▼
//!        position-aware blend ─▶ sort, min-score, limit
//! ```
//!
//! The blend pins the top retrieval slots: expansion can introduce noise
//! the reranker sometimes overweights against strong literal matches, so
//! ranks 1–3 keep 75% of their fused score and only the tail hands the
//! majority to the reranker. Expansion failure degrades to the original
//! query alone; reranker failure degrades to fusion-only ordering.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::embedding::Provider;
use crate::error::Result;
use crate::host::LlmHost;
use crate::models::SearchHit;
use crate::store::Store;
use crate::{expand, rerank, search};

/// RRF smoothing constant.
pub const RRF_K: f64 = 60.0;

/// Weight of the original query relative to expansion variants.
pub const ORIGINAL_WEIGHT: f64 = 2.0;

/// Bonus for appearing at rank 1 of any list.
pub const TOP_RANK_BONUS_FIRST: f64 = 0.05;

/// Bonus for a best rank of 2–3.
pub const TOP_RANK_BONUS_EARLY: f64 = 0.02;

/// Candidates kept after fusion (and sent to the reranker).
pub const FUSION_KEEP: usize = 30;

/// Per-list retrieval cap.
pub const RETRIEVAL_LIMIT: usize = 20;

/// One ranked list entering fusion, weighted by its query's importance.
#[derive(Debug, Clone)]
pub struct WeightedList<K> {
    pub weight: f64,
    pub keys: Vec<K>,
}

/// A fused candidate: summed weighted RRF plus the top-rank bonus.
#[derive(Debug, Clone)]
pub struct FusedDoc<K> {
    pub key: K,
    pub score: f64,
    /// Best (0-based) rank across all lists.
    pub best_rank: usize,
}

/// Reciprocal Rank Fusion over weighted lists:
/// `score(d) = Σ_L w_L / (k + rank_L(d) + 1)`, plus a bonus of
/// [`TOP_RANK_BONUS_FIRST`] when the document led any list and
/// [`TOP_RANK_BONUS_EARLY`] when its best rank was second or third.
/// Sorted descending, ties broken by key.
pub fn rrf_fuse<K: Eq + Hash + Ord + Clone>(lists: &[WeightedList<K>]) -> Vec<FusedDoc<K>> {
    let mut scores: HashMap<K, (f64, usize)> = HashMap::new();

    for list in lists {
        for (rank, key) in list.keys.iter().enumerate() {
            let entry = scores.entry(key.clone()).or_insert((0.0, usize::MAX));
            entry.0 += list.weight / (RRF_K + rank as f64 + 1.0);
            entry.1 = entry.1.min(rank);
        }
    }

    let mut fused: Vec<FusedDoc<K>> = scores
        .into_iter()
        .map(|(key, (mut score, best_rank))| {
            if best_rank == 0 {
                score += TOP_RANK_BONUS_FIRST;
            } else if best_rank <= 2 {
                score += TOP_RANK_BONUS_EARLY;
            }
            FusedDoc {
                key,
                score,
                best_rank,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    fused
}

/// Blend weights `(retrieval, rerank)` by pre-rerank rank (0-based).
/// The top three retrieval slots stay retrieval-dominated; the tail
/// defers to the reranker.
pub fn blend_weights(rank_index: usize) -> (f64, f64) {
    if rank_index < 3 {
        (0.75, 0.25)
    } else if rank_index < 10 {
        (0.60, 0.40)
    } else {
        (0.40, 0.60)
    }
}

/// Options for [`run_query`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub limit: usize,
    pub collection: Option<String>,
    pub min_score: f64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: crate::config::DEFAULT_LIMIT,
            collection: None,
            min_score: 0.0,
        }
    }
}

type DocKey = (String, String);

/// Run the full hybrid pipeline. `provider` may be `None` when no
/// embedding backend is usable; retrieval then rides on BM25 alone.
pub async fn run_query(
    store: &Store,
    host: &Arc<LlmHost>,
    provider: Option<Arc<Provider>>,
    query: &str,
    opts: &QueryOptions,
) -> Result<Vec<SearchHit>> {
    let variants = expand::expand_query(store, host, query).await;

    let mut queries: Vec<(f64, String)> = Vec::with_capacity(1 + variants.len());
    if variants.is_empty() {
        queries.push((1.0, query.to_string()));
    } else {
        queries.push((ORIGINAL_WEIGHT, query.to_string()));
        for v in variants {
            queries.push((1.0, v));
        }
    }

    // Fan out one BM25 and one vector lookup per query. JoinSet aborts
    // everything in flight if this future is dropped.
    let mut tasks: JoinSet<(usize, usize, Vec<SearchHit>)> = JoinSet::new();
    for (qi, (_, q)) in queries.iter().enumerate() {
        let store_fts = store.clone();
        let q_fts = q.clone();
        let collection = opts.collection.clone();
        tasks.spawn(async move {
            let hits = search::fts_search(
                &store_fts,
                &q_fts,
                RETRIEVAL_LIMIT,
                collection.as_deref(),
            )
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "keyword retrieval failed for one query");
                Vec::new()
            });
            (qi, 0, hits)
        });

        if let Some(provider) = provider.clone() {
            let store_vec = store.clone();
            let q_vec = q.clone();
            let collection = opts.collection.clone();
            tasks.spawn(async move {
                let hits = search::vec_search(
                    &store_vec,
                    &provider,
                    &q_vec,
                    RETRIEVAL_LIMIT,
                    collection.as_deref(),
                )
                .await
                .unwrap_or_else(|e| {
                    tracing::debug!(error = %e, "vector retrieval unavailable for one query");
                    Vec::new()
                });
                (qi, 1, hits)
            });
        }
    }

    let mut slots: Vec<Vec<Vec<SearchHit>>> = vec![vec![Vec::new(), Vec::new()]; queries.len()];
    while let Some(joined) = tasks.join_next().await {
        let (qi, mode, hits) =
            joined.map_err(|e| crate::error::QmdError::Internal(format!("retrieval task: {e}")))?;
        slots[qi][mode] = hits;
    }

    // Deterministic list order: q0-fts, q0-vec, q1-fts, ...
    let mut lists: Vec<WeightedList<DocKey>> = Vec::new();
    let mut meta: HashMap<DocKey, SearchHit> = HashMap::new();
    for (qi, (weight, _)) in queries.iter().enumerate() {
        for mode_hits in &slots[qi] {
            if mode_hits.is_empty() {
                continue;
            }
            let keys: Vec<DocKey> = mode_hits
                .iter()
                .map(|h| (h.collection.clone(), h.filepath.clone()))
                .collect();
            for hit in mode_hits {
                let key = (hit.collection.clone(), hit.filepath.clone());
                meta.entry(key)
                    .and_modify(|existing| {
                        if existing.snippet.is_none() {
                            existing.snippet = hit.snippet.clone();
                        }
                    })
                    .or_insert_with(|| hit.clone());
            }
            lists.push(WeightedList {
                weight: *weight,
                keys,
            });
        }
    }

    let mut fused = rrf_fuse(&lists);
    fused.truncate(FUSION_KEEP);
    if fused.is_empty() {
        return Ok(Vec::new());
    }

    // One rerank call over the kept candidates, against the original query.
    let mut excerpts = Vec::with_capacity(fused.len());
    for doc in &fused {
        let body = store
            .document_by_path(&doc.key.0, &doc.key.1, true)
            .await?
            .and_then(|d| d.body);
        let excerpt = match body {
            Some(body) => rerank::excerpt_of(&body, rerank::EXCERPT_CHARS),
            None => meta
                .get(&doc.key)
                .map(|h| h.title.clone())
                .unwrap_or_default(),
        };
        excerpts.push(excerpt);
    }

    let rerank_scores = match rerank::rerank_scores(store, host, query, &excerpts).await {
        Ok(scores) => Some(scores),
        Err(e) => {
            tracing::debug!(error = %e, "reranker unavailable, keeping fusion order");
            None
        }
    };

    let max_fused = fused.first().map(|d| d.score).unwrap_or(1.0).max(f64::MIN_POSITIVE);

    let mut results: Vec<SearchHit> = Vec::with_capacity(fused.len());
    for (idx, doc) in fused.iter().enumerate() {
        let normalized = doc.score / max_fused;
        let blended = match &rerank_scores {
            Some(scores) => {
                let (w_retrieval, w_rerank) = blend_weights(idx);
                w_retrieval * normalized + w_rerank * scores[idx]
            }
            None => normalized,
        };
        let Some(hit) = meta.get(&doc.key) else { continue };
        let mut hit = hit.clone();
        hit.score = blended;
        results.push(hit);
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.docid.cmp(&b.docid))
    });
    results.retain(|h| h.score >= opts.min_score);
    results.truncate(opts.limit);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(weight: f64, keys: &[&str]) -> WeightedList<String> {
        WeightedList {
            weight,
            keys: keys.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn rrf_single_list_preserves_order() {
        let fused = rrf_fuse(&[list(1.0, &["a", "b", "c"])]);
        let keys: Vec<&str> = fused.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn rrf_dominance_is_monotone() {
        // a strictly dominates b in every list, so fused(a) > fused(b).
        let fused = rrf_fuse(&[
            list(1.0, &["x", "a", "b"]),
            list(1.0, &["a", "y", "b"]),
            list(2.0, &["y", "a", "b"]),
        ]);
        let score = |k: &str| fused.iter().find(|d| d.key == k).unwrap().score;
        assert!(score("a") > score("b"));
    }

    #[test]
    fn rrf_weight_two_equals_duplicated_list() {
        let l1 = ["a", "b", "c"];
        let l2 = ["c", "a", "d"];

        let weighted = rrf_fuse(&[list(2.0, &l1), list(1.0, &l2)]);
        let duplicated = rrf_fuse(&[list(1.0, &l1), list(1.0, &l1), list(1.0, &l2)]);

        assert_eq!(weighted.len(), duplicated.len());
        for (w, d) in weighted.iter().zip(duplicated.iter()) {
            assert_eq!(w.key, d.key);
            assert!((w.score - d.score).abs() < 1e-12);
        }
    }

    #[test]
    fn rrf_top_rank_bonus_tiers() {
        let fused = rrf_fuse(&[list(1.0, &["first", "second", "third", "fourth"])]);
        let doc = |k: &str| fused.iter().find(|d| d.key == k).unwrap();

        let base = |rank: usize| 1.0 / (RRF_K + rank as f64 + 1.0);
        assert!((doc("first").score - (base(0) + TOP_RANK_BONUS_FIRST)).abs() < 1e-12);
        assert!((doc("second").score - (base(1) + TOP_RANK_BONUS_EARLY)).abs() < 1e-12);
        assert!((doc("third").score - (base(2) + TOP_RANK_BONUS_EARLY)).abs() < 1e-12);
        assert!((doc("fourth").score - base(3)).abs() < 1e-12);
    }

    #[test]
    fn rrf_bonus_uses_best_rank_across_lists() {
        // "b" is buried in one list but leads another.
        let fused = rrf_fuse(&[list(1.0, &["a", "b"]), list(1.0, &["b", "a"])]);
        for d in &fused {
            assert_eq!(d.best_rank, 0);
        }
        // Equal sums and equal bonuses: tie broken lexicographically.
        assert_eq!(fused[0].key, "a");
        assert_eq!(fused[1].key, "b");
    }

    #[test]
    fn blend_weight_bands() {
        assert_eq!(blend_weights(0), (0.75, 0.25));
        assert_eq!(blend_weights(2), (0.75, 0.25));
        assert_eq!(blend_weights(3), (0.60, 0.40));
        assert_eq!(blend_weights(9), (0.60, 0.40));
        assert_eq!(blend_weights(10), (0.40, 0.60));
        assert_eq!(blend_weights(100), (0.40, 0.60));
    }

    #[test]
    fn top_three_blend_floor_holds_with_zero_rerank() {
        // A top-3 document whose rerank score is 0 keeps at least 75% of
        // its normalized fused score.
        let normalized = 0.8f64;
        let (w_retrieval, w_rerank) = blend_weights(1);
        let blended = w_retrieval * normalized + w_rerank * 0.0;
        assert!(blended >= 0.75 * normalized - 1e-12);
    }

    #[tokio::test]
    async fn pipeline_degrades_to_fusion_only() {
        // No generator, no embedding provider, no reranker: the pipeline
        // still answers from BM25 fusion with blended = normalized score.
        let store = Store::open_in_memory().await.unwrap();
        store.collection_add("notes", "/n", "**/*.md").await.unwrap();
        store.add_or_update_document("notes", "one.md", "alpha").await.unwrap();
        store
            .add_or_update_document("notes", "two.md", "alpha beta")
            .await
            .unwrap();
        store
            .add_or_update_document("notes", "three.md", "beta gamma")
            .await
            .unwrap();

        let host = Arc::new(LlmHost::new());
        let opts = QueryOptions::default();
        let hits = run_query(&store, &host, None, "alpha", &opts).await.unwrap();

        assert!(!hits.is_empty());
        // Best hit is normalized to exactly 1.0 in the fallback blend.
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn pipeline_min_score_and_limit() {
        let store = Store::open_in_memory().await.unwrap();
        store.collection_add("notes", "/n", "**/*.md").await.unwrap();
        for i in 0..5 {
            store
                .add_or_update_document("notes", &format!("f{i}.md"), &format!("common term {i}"))
                .await
                .unwrap();
        }

        let host = Arc::new(LlmHost::new());
        let opts = QueryOptions {
            limit: 2,
            collection: None,
            min_score: 0.0,
        };
        let hits = run_query(&store, &host, None, "common", &opts).await.unwrap();
        assert_eq!(hits.len(), 2);

        let opts = QueryOptions {
            limit: 10,
            collection: None,
            min_score: 2.0,
        };
        let hits = run_query(&store, &host, None, "common", &opts).await.unwrap();
        assert!(hits.is_empty());
    }
}
