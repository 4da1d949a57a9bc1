//! Cross-encoder reranking.
//!
//! Each (query, excerpt) pair is judged jointly by the local cross-encoder;
//! the raw relevance logit maps through a sigmoid into `[0, 1]`. Output
//! order matches input order. Pairs are cached in `llm_cache` under purpose
//! `rerank`, so re-running a query only scores excerpts it has not seen.

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::host::{LlmHost, RERANK_MODEL_ID};
use crate::store::Store;

const PURPOSE: &str = "rerank";

/// Characters of document body fed to the cross-encoder per candidate.
pub const EXCERPT_CHARS: usize = 800;

/// Map a raw relevance logit into `[0, 1]`.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Leading excerpt of a body, truncated on a character boundary.
pub fn excerpt_of(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => body[..byte_idx].to_string(),
        None => body.to_string(),
    }
}

/// Score `excerpts` against `query`, one score per excerpt in input order.
///
/// Errors when the reranker itself is unavailable; the caller falls back
/// to fusion-only ordering.
pub async fn rerank_scores(
    store: &Store,
    host: &LlmHost,
    query: &str,
    excerpts: &[String],
) -> Result<Vec<f64>> {
    if excerpts.is_empty() {
        return Ok(Vec::new());
    }

    let mut scores: Vec<Option<f64>> = vec![None; excerpts.len()];
    let mut missing: Vec<usize> = Vec::new();

    for (i, excerpt) in excerpts.iter().enumerate() {
        let key = pair_hash(query, excerpt);
        match store.llm_cache_get(RERANK_MODEL_ID, PURPOSE, &key).await {
            Ok(Some(cached)) => match cached.parse::<f64>() {
                Ok(score) => scores[i] = Some(score),
                Err(_) => missing.push(i),
            },
            Ok(None) => missing.push(i),
            Err(e) => {
                tracing::debug!(error = %e, "rerank cache lookup failed");
                missing.push(i);
            }
        }
    }

    if !missing.is_empty() {
        let docs: Vec<String> = missing.iter().map(|&i| excerpts[i].clone()).collect();
        let raw = host.rerank(query.to_string(), docs).await?;

        for (&i, &logit) in missing.iter().zip(raw.iter()) {
            let score = f64::from(sigmoid(logit));
            scores[i] = Some(score);
            let key = pair_hash(query, &excerpts[i]);
            if let Err(e) = store
                .llm_cache_put(RERANK_MODEL_ID, PURPOSE, &key, &score.to_string())
                .await
            {
                tracing::debug!(error = %e, "rerank cache write failed");
            }
        }
    }

    Ok(scores.into_iter().map(|s| s.unwrap_or(0.0)).collect())
}

fn pair_hash(query: &str, excerpt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update([0u8]);
    hasher.update(excerpt.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_midpoint_and_extremes() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn sigmoid_symmetry() {
        let x = 2.5f32;
        assert!((sigmoid(x) + sigmoid(-x) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt_of("short", 100), "short");
        let long = "é".repeat(100);
        let cut = excerpt_of(&long, 10);
        assert_eq!(cut.chars().count(), 10);
    }

    #[test]
    fn pair_hash_distinguishes_both_sides() {
        assert_ne!(pair_hash("q", "doc"), pair_hash("q2", "doc"));
        assert_ne!(pair_hash("q", "doc"), pair_hash("q", "doc2"));
        // Separator prevents boundary ambiguity.
        assert_ne!(pair_hash("ab", "c"), pair_hash("a", "bc"));
    }

    #[tokio::test]
    async fn cached_pairs_skip_the_model() {
        let store = Store::open_in_memory().await.unwrap();
        let host = LlmHost::new();

        let excerpts = vec!["first excerpt".to_string(), "second excerpt".to_string()];
        for (excerpt, score) in excerpts.iter().zip(["0.9", "0.1"]) {
            store
                .llm_cache_put(RERANK_MODEL_ID, PURPOSE, &pair_hash("greeting", excerpt), score)
                .await
                .unwrap();
        }

        // Every pair is cached, so the (absent) local model is never needed.
        let scores = rerank_scores(&store, &host, "greeting", &excerpts).await.unwrap();
        assert_eq!(scores, vec![0.9, 0.1]);
    }

    #[cfg(not(feature = "local-embeddings"))]
    #[tokio::test]
    async fn uncached_pairs_without_model_error() {
        let store = Store::open_in_memory().await.unwrap();
        let host = LlmHost::new();
        let excerpts = vec!["never seen".to_string()];
        assert!(rerank_scores(&store, &host, "q", &excerpts).await.is_err());
    }
}
