//! Embedding providers.
//!
//! A tagged [`Provider`] covers the three backends behind one capability
//! surface:
//!
//! | Variant | Backend | Dimensions | Tokenizer |
//! |---------|---------|------------|-----------|
//! | `Local` | in-process model via the LLM host | 768 | yes |
//! | `OpenAi` | `POST {base}/embeddings` | 1536/3072 or auto-detected | no |
//! | `Gemini` | batch-embed endpoint with `taskType` | 768/3072 or auto-detected | no |
//!
//! Provider name and model id form the storage namespace key
//! `<name>/<model>`; each namespace owns its own vector table, so models
//! with different dimensions coexist without interference.
//!
//! Misconfiguration (missing API key, unknown local model) fails at
//! construction. At call time, transient network failures yield `None`
//! per input text so a bulk `embed` can record the miss and keep going;
//! a malformed response body is an error, not a silent null. HTTP 429 is
//! retried up to [`MAX_RETRIES`] times, honouring `Retry-After`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;

use crate::chunker::ChunkPolicy;
use crate::config;
use crate::error::{QmdError, Result};
use crate::host::{self, LlmHost};
use crate::store;

/// Provider names as stored in settings.
pub const LOCAL_PROVIDER: &str = "local";
pub const OPENAI_PROVIDER: &str = "openai";
pub const GEMINI_PROVIDER: &str = "gemini";

/// Maximum texts per remote API call.
pub const MAX_BATCH: usize = 100;

/// Retry budget for HTTP 429 responses.
pub const MAX_RETRIES: u32 = 3;

/// Default model id for a provider name.
pub fn default_model_for(provider: &str) -> &'static str {
    match provider {
        OPENAI_PROVIDER => "text-embedding-3-small",
        GEMINI_PROVIDER => "text-embedding-004",
        _ => host::EMBED_MODEL_ID,
    }
}

/// Known dimensionalities; unknown models auto-detect from the first
/// response.
fn known_dimensions(provider: &str, model: &str) -> Option<usize> {
    match (provider, model) {
        (LOCAL_PROVIDER, _) => Some(host::EMBED_DIMENSIONS),
        (OPENAI_PROVIDER, "text-embedding-3-small") => Some(1536),
        (OPENAI_PROVIDER, "text-embedding-3-large") => Some(3072),
        (OPENAI_PROVIDER, "text-embedding-ada-002") => Some(1536),
        (GEMINI_PROVIDER, "text-embedding-004") => Some(768),
        (GEMINI_PROVIDER, "gemini-embedding-001") => Some(3072),
        _ => None,
    }
}

/// An embedding backend, constructed validated and ready to call.
pub enum Provider {
    Local(LocalProvider),
    OpenAi(HttpProvider),
    Gemini(HttpProvider),
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Local(_) => f.write_str("Provider::Local"),
            Provider::OpenAi(_) => f.write_str("Provider::OpenAi"),
            Provider::Gemini(_) => f.write_str("Provider::Gemini"),
        }
    }
}

/// In-process embedding through the LLM host.
pub struct LocalProvider {
    host: Arc<LlmHost>,
}

/// Remote embedding over HTTP (OpenAI-compatible or Gemini).
pub struct HttpProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key: String,
    dims: OnceLock<usize>,
}

impl Provider {
    /// Construct a provider, validating configuration up front.
    pub fn create(name: &str, model: Option<&str>, llm_host: &Arc<LlmHost>) -> Result<Provider> {
        let model = model
            .map(str::to_string)
            .unwrap_or_else(|| default_model_for(name).to_string());

        match name {
            LOCAL_PROVIDER => {
                if !cfg!(feature = "local-embeddings") {
                    return Err(QmdError::ProviderUnavailable {
                        provider: name.into(),
                        reason: "built without the local-embeddings feature".into(),
                    });
                }
                if model != host::EMBED_MODEL_ID {
                    return Err(QmdError::InvalidConfig {
                        field: "model".into(),
                        reason: format!(
                            "local provider only serves {}, got '{model}'",
                            host::EMBED_MODEL_ID
                        ),
                    });
                }
                Ok(Provider::Local(LocalProvider {
                    host: Arc::clone(llm_host),
                }))
            }
            OPENAI_PROVIDER => {
                let api_key = std::env::var(config::OPENAI_API_KEY).map_err(|_| {
                    QmdError::ProviderUnavailable {
                        provider: name.into(),
                        reason: format!("{} not set", config::OPENAI_API_KEY),
                    }
                })?;
                let base_url = std::env::var(config::OPENAI_BASE_URL)
                    .unwrap_or_else(|_| config::OPENAI_DEFAULT_BASE_URL.to_string());
                Ok(Provider::OpenAi(HttpProvider::new(model, base_url, api_key)))
            }
            GEMINI_PROVIDER => {
                let api_key = std::env::var(config::GEMINI_API_KEY).map_err(|_| {
                    QmdError::ProviderUnavailable {
                        provider: name.into(),
                        reason: format!("{} not set", config::GEMINI_API_KEY),
                    }
                })?;
                let base_url = "https://generativelanguage.googleapis.com/v1beta".to_string();
                Ok(Provider::Gemini(HttpProvider::new(model, base_url, api_key)))
            }
            other => Err(QmdError::InvalidConfig {
                field: "provider".into(),
                reason: format!("unknown provider '{other}' (expected local, openai, or gemini)"),
            }),
        }
    }

    /// Construct the active provider from settings, or a per-call
    /// override as a fresh instance.
    pub async fn active(
        store: &store::Store,
        llm_host: &Arc<LlmHost>,
        override_provider: Option<&str>,
        override_model: Option<&str>,
    ) -> Result<Provider> {
        match override_provider {
            Some(name) => Provider::create(name, override_model, llm_host),
            None => {
                let (name, model) = store.active_provider_setting().await?;
                Provider::create(&name, Some(&model), llm_host)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Local(_) => LOCAL_PROVIDER,
            Provider::OpenAi(_) => OPENAI_PROVIDER,
            Provider::Gemini(_) => GEMINI_PROVIDER,
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Provider::Local(_) => host::EMBED_MODEL_ID,
            Provider::OpenAi(p) | Provider::Gemini(p) => &p.model,
        }
    }

    /// `<name>/<model>`: the storage namespace key.
    pub fn model_key(&self) -> String {
        format!("{}/{}", self.name(), self.model_id())
    }

    /// Known or detected dimensionality; `None` until the first response
    /// of an unknown remote model.
    pub fn dimensions(&self) -> Option<usize> {
        match self {
            Provider::Local(_) => Some(host::EMBED_DIMENSIONS),
            Provider::OpenAi(p) | Provider::Gemini(p) => known_dimensions(self.name(), &p.model)
                .or_else(|| p.dims.get().copied()),
        }
    }

    pub fn has_tokenizer(&self) -> bool {
        matches!(self, Provider::Local(_))
    }

    pub fn chunk_policy(&self) -> ChunkPolicy {
        if self.has_tokenizer() {
            ChunkPolicy::tokens()
        } else {
            ChunkPolicy::chars()
        }
    }

    /// Input formatting for queries. Remote APIs take the raw text.
    pub fn format_query(&self, query: &str) -> String {
        match self {
            Provider::Local(_) => format!("task: search result | query: {query}"),
            _ => query.to_string(),
        }
    }

    /// Input formatting for document chunks.
    pub fn format_document(&self, title: Option<&str>, text: &str) -> String {
        match self {
            Provider::Local(_) => {
                format!("title: {} | text: {text}", title.unwrap_or("none"))
            }
            _ => text.to_string(),
        }
    }

    /// Embed one pre-formatted text.
    pub async fn embed(&self, text: &str, is_query: bool) -> Result<Option<Vec<f32>>> {
        let mut out = self.embed_batch(&[text.to_string()], is_query).await?;
        Ok(out.pop().flatten())
    }

    /// Embed a batch of pre-formatted texts. Per-item `None` marks a
    /// transient failure; the output always has one slot per input.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        is_query: bool,
    ) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Provider::Local(p) => {
                let vectors = p.host.embed_texts(texts.to_vec()).await?;
                Ok(vectors.into_iter().map(Some).collect())
            }
            Provider::OpenAi(p) => {
                let mut out = Vec::with_capacity(texts.len());
                for batch in texts.chunks(MAX_BATCH) {
                    out.extend(p.embed_openai_batch(batch).await?);
                }
                Ok(out)
            }
            Provider::Gemini(p) => {
                let mut out = Vec::with_capacity(texts.len());
                for batch in texts.chunks(MAX_BATCH) {
                    out.extend(p.embed_gemini_batch(batch, is_query).await?);
                }
                Ok(out)
            }
        }
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingItem>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct GeminiBatchResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

impl HttpProvider {
    fn new(model: String, base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            model,
            base_url,
            api_key,
            dims: OnceLock::new(),
        }
    }

    async fn embed_openai_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = match self
            .send_with_retry(|| {
                self.client
                    .post(format!("{}/embeddings", self.base_url))
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(&body)
            })
            .await
        {
            Ok(resp) => resp,
            Err(RetryOutcome::Overloaded) => {
                return Err(QmdError::ProviderOverload {
                    provider: OPENAI_PROVIDER.into(),
                });
            }
            Err(RetryOutcome::Transient(reason)) => {
                tracing::warn!(provider = OPENAI_PROVIDER, %reason, "embedding batch failed");
                return Ok(vec![None; texts.len()]);
            }
        };

        let parsed: OpenAiEmbeddingResponse = resp.json().await.map_err(|e| {
            QmdError::Internal(format!("malformed OpenAI embeddings response: {e}"))
        })?;
        if parsed.data.len() != texts.len() {
            return Err(QmdError::Internal(format!(
                "OpenAI returned {} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for item in parsed.data {
            let _ = self.dims.set(item.embedding.len());
            if let Some(slot) = out.get_mut(item.index) {
                *slot = Some(item.embedding);
            }
        }
        Ok(out)
    }

    async fn embed_gemini_batch(
        &self,
        texts: &[String],
        is_query: bool,
    ) -> Result<Vec<Option<Vec<f32>>>> {
        let task_type = if is_query {
            "RETRIEVAL_QUERY"
        } else {
            "RETRIEVAL_DOCUMENT"
        };
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": t }] },
                    "taskType": task_type,
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });
        let url = format!(
            "{}/models/{}:batchEmbedContents?key={}",
            self.base_url, self.model, self.api_key
        );

        let resp = match self.send_with_retry(|| self.client.post(&url).json(&body)).await {
            Ok(resp) => resp,
            Err(RetryOutcome::Overloaded) => {
                return Err(QmdError::ProviderOverload {
                    provider: GEMINI_PROVIDER.into(),
                });
            }
            Err(RetryOutcome::Transient(reason)) => {
                tracing::warn!(provider = GEMINI_PROVIDER, %reason, "embedding batch failed");
                return Ok(vec![None; texts.len()]);
            }
        };

        let parsed: GeminiBatchResponse = resp.json().await.map_err(|e| {
            QmdError::Internal(format!("malformed Gemini embeddings response: {e}"))
        })?;
        if parsed.embeddings.len() != texts.len() {
            return Err(QmdError::Internal(format!(
                "Gemini returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }

        Ok(parsed
            .embeddings
            .into_iter()
            .map(|e| {
                let _ = self.dims.set(e.values.len());
                Some(e.values)
            })
            .collect())
    }

    /// Send a request, retrying 429 up to [`MAX_RETRIES`] times with
    /// `Retry-After` (1s default). Network errors and other HTTP failures
    /// are transient; the caller records nulls and moves on.
    async fn send_with_retry<F>(
        &self,
        make_request: F,
    ) -> std::result::Result<reqwest::Response, RetryOutcome>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            match make_request().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if attempt >= MAX_RETRIES {
                        return Err(RetryOutcome::Overloaded);
                    }
                    let delay = resp
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(1);
                    tracing::debug!(attempt, delay, "rate limited, backing off");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(RetryOutcome::Transient(format!("HTTP {status}: {text}")));
                }
                Err(e) => return Err(RetryOutcome::Transient(e.to_string())),
            }
        }
    }
}

enum RetryOutcome {
    /// 429 persisted past the retry budget.
    Overloaded,
    /// Network or non-429 HTTP failure; per-item nulls, not an error.
    Transient(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_models() {
        assert_eq!(default_model_for("local"), "nomic-embed-text-v1.5");
        assert_eq!(default_model_for("openai"), "text-embedding-3-small");
        assert_eq!(default_model_for("gemini"), "text-embedding-004");
    }

    #[test]
    fn known_dimension_table() {
        assert_eq!(known_dimensions("local", "nomic-embed-text-v1.5"), Some(768));
        assert_eq!(known_dimensions("openai", "text-embedding-3-small"), Some(1536));
        assert_eq!(known_dimensions("openai", "text-embedding-3-large"), Some(3072));
        assert_eq!(known_dimensions("gemini", "text-embedding-004"), Some(768));
        assert_eq!(known_dimensions("openai", "some-future-model"), None);
    }

    #[test]
    fn unknown_provider_rejected_at_construction() {
        let llm_host = Arc::new(LlmHost::new());
        let err = Provider::create("cohere", None, &llm_host).unwrap_err();
        assert!(matches!(err, QmdError::InvalidConfig { .. }));
    }

    #[test]
    fn openai_without_key_rejected_at_construction() {
        // Only meaningful when the variable is absent from the test
        // environment; skip otherwise rather than mutating global env.
        if std::env::var(config::OPENAI_API_KEY).is_ok() {
            return;
        }
        let llm_host = Arc::new(LlmHost::new());
        let err = Provider::create("openai", None, &llm_host).unwrap_err();
        assert!(matches!(err, QmdError::ProviderUnavailable { .. }));
    }

    #[cfg(feature = "local-embeddings")]
    #[test]
    fn local_formatting() {
        let llm_host = Arc::new(LlmHost::new());
        let p = Provider::create("local", None, &llm_host).unwrap();
        assert_eq!(
            p.format_query("greeting"),
            "task: search result | query: greeting"
        );
        assert_eq!(
            p.format_document(Some("Notes"), "hello"),
            "title: Notes | text: hello"
        );
        assert_eq!(p.format_document(None, "hello"), "title: none | text: hello");
        assert!(p.has_tokenizer());
        assert_eq!(p.model_key(), "local/nomic-embed-text-v1.5");
        assert_eq!(p.dimensions(), Some(768));
    }
}
