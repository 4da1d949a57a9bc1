//! Query expansion via the generator model.
//!
//! Produces two alternative phrasings of the user query to widen recall.
//! Results are deterministic per (generator model, query): the parsed
//! variants are cached in `llm_cache` under purpose `expand`. When the
//! generator is unreachable the expansion is simply empty and the hybrid
//! pipeline falls back to the original query alone.

use sha2::{Digest, Sha256};

use crate::host::LlmHost;
use crate::store::Store;

/// Number of alternative phrasings requested.
pub const EXPANSION_COUNT: usize = 2;

const PURPOSE: &str = "expand";

/// Expand `query` into up to [`EXPANSION_COUNT`] alternative phrasings.
/// Never fails: any problem yields an empty list.
pub async fn expand_query(store: &Store, host: &LlmHost, query: &str) -> Vec<String> {
    let model = host.generator_model().to_string();
    let input_hash = hash_input(query);

    match store.llm_cache_get(&model, PURPOSE, &input_hash).await {
        Ok(Some(cached)) => return parse_expansions(&cached),
        Ok(None) => {}
        Err(e) => tracing::debug!(error = %e, "expansion cache lookup failed"),
    }

    let prompt = build_prompt(query);
    let response = match host.generate(&prompt).await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "query expansion unavailable");
            return Vec::new();
        }
    };

    let variants = parse_expansions(&response);
    if !variants.is_empty() {
        let canonical = serde_json::to_string(&variants).unwrap_or_default();
        if let Err(e) = store.llm_cache_put(&model, PURPOSE, &input_hash, &canonical).await {
            tracing::debug!(error = %e, "expansion cache write failed");
        }
    }
    variants
}

fn build_prompt(query: &str) -> String {
    format!(
        "You are a document search query expander. Given a search query, generate exactly 2 \
         alternative phrasings that capture different aspects or synonyms of the intent. \
         The alternatives should help find relevant notes the original query might miss.\n\n\
         Original query: \"{query}\"\n\n\
         Respond with ONLY a JSON array of 2 strings. No explanation.\n\
         Example: [\"alternative phrasing 1\", \"alternative phrasing 2\"]"
    )
}

fn hash_input(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract a JSON string array from the model output, tolerating
/// surrounding prose and code fences. Unparseable output means no
/// expansion, not an error.
fn parse_expansions(content: &str) -> Vec<String> {
    let json_str = match (content.find('['), content.rfind(']')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content,
    };

    match serde_json::from_str::<Vec<String>>(json_str) {
        Ok(variants) => variants
            .into_iter()
            .filter(|v| !v.trim().is_empty())
            .take(EXPANSION_COUNT)
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "could not parse expansion output");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_clean_array() {
        let out = parse_expansions(r#"["meeting notes from standup", "daily sync summary"]"#);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], "meeting notes from standup");
    }

    #[test]
    fn parse_array_embedded_in_prose() {
        let out = parse_expansions(
            "Here you go:\n[\"error handling\", \"exception management\"]\nHope that helps!",
        );
        assert_eq!(out, vec!["error handling", "exception management"]);
    }

    #[test]
    fn parse_fenced_array() {
        let out = parse_expansions("```json\n[\"database backup\", \"snapshot restore\"]\n```");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn parse_truncates_to_two() {
        let out = parse_expansions(r#"["a", "b", "c", "d"]"#);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn parse_garbage_is_empty() {
        assert!(parse_expansions("I cannot answer that.").is_empty());
        assert!(parse_expansions("[\"unterminated").is_empty());
        assert!(parse_expansions("").is_empty());
    }

    #[test]
    fn parse_drops_blank_variants() {
        let out = parse_expansions(r#"["", "real phrasing"]"#);
        assert_eq!(out, vec!["real phrasing"]);
    }

    #[test]
    fn input_hash_is_stable() {
        assert_eq!(hash_input("greeting"), hash_input("greeting"));
        assert_ne!(hash_input("greeting"), hash_input("farewell"));
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_generation() {
        let store = Store::open_in_memory().await.unwrap();
        let host = LlmHost::new();
        let model = host.generator_model().to_string();
        store
            .llm_cache_put(&model, PURPOSE, &hash_input("greeting"), r#"["hello","salutation"]"#)
            .await
            .unwrap();

        // Generator endpoint is unreachable in tests; only the cache can
        // produce variants.
        let out = expand_query(&store, &host, "greeting").await;
        assert_eq!(out, vec!["hello", "salutation"]);
    }

    #[tokio::test]
    async fn unavailable_generator_yields_empty() {
        let store = Store::open_in_memory().await.unwrap();
        let host = LlmHost::new();
        let out = expand_query(&store, &host, "anything at all").await;
        assert!(out.is_empty());
    }
}
