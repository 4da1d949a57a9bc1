//! Process-wide manager of loaded model instances.
//!
//! One [`LlmHost`] exists per process, created by the caller and passed
//! explicitly. It owns three slots: the local embedding model, the local
//! cross-encoder reranker (both in-process, behind the `local-embeddings`
//! feature), and the generator (an Ollama-compatible HTTP endpoint used
//! for query expansion).
//!
//! Each slot is built lazily on first use and serialized by an async
//! mutex, so concurrent requests for the same model queue rather than
//! contend. An idle sweeper releases the in-memory instance after
//! [`IDLE_TIMEOUT`] without use; the model weights stay cached on disk,
//! so the next request transparently rebuilds the instance (~1s).
//! Acquisition is scoped: the lock is released on every exit path,
//! including failures and cancelled futures. If an inference task panics
//! the instance is dropped with it and the slot rebuilds on the next use.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config;
use crate::error::{QmdError, Result};

/// Idle time after which a slot's in-memory instance is released.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the idle sweeper wakes up.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Local embedding model identifier.
pub const EMBED_MODEL_ID: &str = "nomic-embed-text-v1.5";
/// Local embedding dimensionality.
pub const EMBED_DIMENSIONS: usize = 768;
/// Local reranker model identifier.
pub const RERANK_MODEL_ID: &str = "bge-reranker-base";

/// A lazily-built, serialized, idle-evictable model instance.
pub struct ModelSlot<T> {
    name: &'static str,
    state: Mutex<SlotState<T>>,
}

struct SlotState<T> {
    instance: Option<T>,
    last_used: Option<Instant>,
}

impl<T: Send + 'static> ModelSlot<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(SlotState {
                instance: None,
                last_used: None,
            }),
        }
    }

    /// Acquire the slot, building the instance if absent, and run `op` on
    /// it on the blocking pool. Requests for the same slot serialize on
    /// the internal mutex; the lock is dropped on every exit path.
    pub async fn run<B, F, R>(&self, build: B, op: F) -> Result<R>
    where
        R: Send + 'static,
        B: FnOnce() -> std::result::Result<T, String> + Send + 'static,
        F: FnOnce(&mut T) -> std::result::Result<R, String> + Send + 'static,
    {
        let mut state = self.state.lock().await;

        let instance = match state.instance.take() {
            Some(instance) => instance,
            None => {
                tracing::debug!(slot = self.name, "building model instance");
                let built = tokio::task::spawn_blocking(build).await.map_err(|e| {
                    QmdError::Internal(format!("{} build task failed: {e}", self.name))
                })?;
                built.map_err(|reason| QmdError::ProviderUnavailable {
                    provider: self.name.to_string(),
                    reason,
                })?
            }
        };

        let joined = tokio::task::spawn_blocking(move || {
            let mut instance = instance;
            let out = op(&mut instance);
            (instance, out)
        })
        .await;

        match joined {
            Ok((instance, out)) => {
                state.instance = Some(instance);
                state.last_used = Some(Instant::now());
                out.map_err(|reason| QmdError::Internal(format!("{}: {reason}", self.name)))
            }
            // The instance went down with the panicked task; the slot
            // stays empty and rebuilds on the next acquire.
            Err(e) => Err(QmdError::Internal(format!(
                "{} inference task failed: {e}",
                self.name
            ))),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.lock().await.instance.is_some()
    }

    /// Drop the instance if it has been idle for at least `idle`.
    /// Returns whether a release happened.
    pub async fn release_if_idle(&self, idle: Duration) -> bool {
        let mut state = self.state.lock().await;
        let expired = match (&state.instance, state.last_used) {
            (Some(_), Some(at)) => at.elapsed() >= idle,
            (Some(_), None) => true,
            _ => false,
        };
        if expired {
            tracing::debug!(slot = self.name, "releasing idle model instance");
            state.instance = None;
        }
        expired
    }
}

/// Ollama-compatible chat endpoint used as the generator model.
struct Generator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    /// Serializes generations and tracks warm/cold for status.
    state: Mutex<Option<Instant>>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl Generator {
    fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config::generator_url(),
            model: config::generator_model(),
            state: Mutex::new(None),
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut state = self.state.lock().await;

        let req = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&req)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| QmdError::ProviderUnavailable {
                provider: "generator".into(),
                reason: format!("cannot reach {} ({e})", self.base_url),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(QmdError::ProviderUnavailable {
                provider: "generator".into(),
                reason: format!("endpoint returned {status}: {body}"),
            });
        }

        let body: ChatResponse = resp.json().await?;
        *state = Some(Instant::now());
        Ok(body.message.content)
    }
}

/// The process-wide LLM host. See the module docs for the lifecycle.
pub struct LlmHost {
    #[cfg(feature = "local-embeddings")]
    embedder: ModelSlot<fastembed::TextEmbedding>,
    #[cfg(feature = "local-embeddings")]
    reranker: ModelSlot<fastembed::TextRerank>,
    generator: Generator,
}

impl Default for LlmHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmHost {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "local-embeddings")]
            embedder: ModelSlot::new("embedder"),
            #[cfg(feature = "local-embeddings")]
            reranker: ModelSlot::new("reranker"),
            generator: Generator::new(),
        }
    }

    /// Identifier of the generator model (used as the expansion cache key).
    pub fn generator_model(&self) -> &str {
        &self.generator.model
    }

    /// Embed pre-formatted texts with the local embedding model.
    #[cfg(feature = "local-embeddings")]
    pub async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let cache_dir = config::models_dir();
        self.embedder
            .run(
                move || {
                    fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(fastembed::EmbeddingModel::NomicEmbedTextV15)
                            .with_cache_dir(cache_dir)
                            .with_show_download_progress(false),
                    )
                    .map_err(|e| e.to_string())
                },
                move |model| model.embed(texts, None).map_err(|e| e.to_string()),
            )
            .await
    }

    #[cfg(not(feature = "local-embeddings"))]
    pub async fn embed_texts(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Err(local_models_unavailable("embedder"))
    }

    /// Score (query, document) pairs with the local cross-encoder.
    /// Returns raw relevance logits in input order.
    #[cfg(feature = "local-embeddings")]
    pub async fn rerank(&self, query: String, documents: Vec<String>) -> Result<Vec<f32>> {
        let n = documents.len();
        let cache_dir = config::models_dir();
        self.reranker
            .run(
                move || {
                    fastembed::TextRerank::try_new(
                        fastembed::RerankInitOptions::new(
                            fastembed::RerankerModel::BGERerankerBase,
                        )
                        .with_cache_dir(cache_dir)
                        .with_show_download_progress(false),
                    )
                    .map_err(|e| e.to_string())
                },
                move |model| {
                    let results = model
                        .rerank(query, documents, false, None)
                        .map_err(|e| e.to_string())?;
                    // Results come back sorted by score; restore input order.
                    let mut scores = vec![0.0f32; n];
                    for r in results {
                        if let Some(slot) = scores.get_mut(r.index) {
                            *slot = r.score;
                        }
                    }
                    Ok(scores)
                },
            )
            .await
    }

    #[cfg(not(feature = "local-embeddings"))]
    pub async fn rerank(&self, _query: String, _documents: Vec<String>) -> Result<Vec<f32>> {
        Err(local_models_unavailable("reranker"))
    }

    /// One generation from the generator model.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        self.generator.generate(prompt).await
    }

    /// Loaded/released state per slot, for `status`.
    pub async fn slot_states(&self) -> Vec<(String, bool)> {
        let mut states = Vec::new();
        #[cfg(feature = "local-embeddings")]
        {
            states.push(("embedder".to_string(), self.embedder.is_loaded().await));
            states.push(("reranker".to_string(), self.reranker.is_loaded().await));
        }
        #[cfg(not(feature = "local-embeddings"))]
        {
            states.push(("embedder".to_string(), false));
            states.push(("reranker".to_string(), false));
        }
        states.push((
            "generator".to_string(),
            self.generator.state.lock().await.is_some(),
        ));
        states
    }

    /// Release any slot idle longer than `idle`.
    pub async fn release_idle(&self, idle: Duration) {
        #[cfg(feature = "local-embeddings")]
        {
            self.embedder.release_if_idle(idle).await;
            self.reranker.release_if_idle(idle).await;
        }
        let mut gen_state = self.generator.state.lock().await;
        if let Some(at) = *gen_state {
            if at.elapsed() >= idle {
                *gen_state = None;
            }
        }
    }

    /// Background sweeper for long-lived processes. The handle aborts
    /// with its owner; dropping it does not leak the host.
    pub fn start_idle_sweeper(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let host = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                host.release_idle(IDLE_TIMEOUT).await;
            }
        })
    }
}

#[cfg(not(feature = "local-embeddings"))]
fn local_models_unavailable(which: &str) -> QmdError {
    QmdError::ProviderUnavailable {
        provider: which.to_string(),
        reason: "built without the local-embeddings feature".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingModel {
        generation: usize,
    }

    #[tokio::test]
    async fn slot_builds_lazily_and_reuses() {
        let builds = Arc::new(AtomicUsize::new(0));
        let slot = ModelSlot::<CountingModel>::new("test");
        assert!(!slot.is_loaded().await);

        for _ in 0..3 {
            let builds = Arc::clone(&builds);
            let gen = slot
                .run(
                    move || {
                        let g = builds.fetch_add(1, Ordering::SeqCst);
                        Ok(CountingModel { generation: g })
                    },
                    |m| Ok(m.generation),
                )
                .await
                .unwrap();
            assert_eq!(gen, 0, "instance must be reused, not rebuilt");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(slot.is_loaded().await);
    }

    #[tokio::test]
    async fn slot_release_and_rebuild() {
        let builds = Arc::new(AtomicUsize::new(0));
        let slot = ModelSlot::<CountingModel>::new("test");

        let b = Arc::clone(&builds);
        slot.run(
            move || Ok(CountingModel {
                generation: b.fetch_add(1, Ordering::SeqCst),
            }),
            |_| Ok(()),
        )
        .await
        .unwrap();

        // Not yet idle long enough.
        assert!(!slot.release_if_idle(Duration::from_secs(300)).await);
        assert!(slot.is_loaded().await);

        // Idle threshold of zero releases immediately.
        assert!(slot.release_if_idle(Duration::ZERO).await);
        assert!(!slot.is_loaded().await);

        // Next acquire rebuilds transparently.
        let b = Arc::clone(&builds);
        let gen = slot
            .run(
                move || Ok(CountingModel {
                    generation: b.fetch_add(1, Ordering::SeqCst),
                }),
                |m| Ok(m.generation),
            )
            .await
            .unwrap();
        assert_eq!(gen, 1);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slot_build_failure_surfaces_and_slot_stays_usable() {
        let slot = ModelSlot::<CountingModel>::new("test");
        let err = slot
            .run(
                || Err::<CountingModel, _>("weights missing".to_string()),
                |_| Ok(()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QmdError::ProviderUnavailable { .. }));
        assert!(!slot.is_loaded().await);

        // A later build may succeed.
        let out = slot
            .run(|| Ok(CountingModel { generation: 7 }), |m| Ok(m.generation))
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn slot_serializes_concurrent_access() {
        let slot = Arc::new(ModelSlot::<Vec<usize>>::new("test"));
        let mut handles = Vec::new();
        for i in 0..8 {
            let slot = Arc::clone(&slot);
            handles.push(tokio::spawn(async move {
                slot.run(
                    || Ok(Vec::new()),
                    move |log| {
                        log.push(i);
                        Ok(log.len())
                    },
                )
                .await
                .unwrap()
            }));
        }
        let mut sizes = Vec::new();
        for h in handles {
            sizes.push(h.await.unwrap());
        }
        sizes.sort_unstable();
        // Every op saw a strictly growing log: no interleaving, no loss.
        assert_eq!(sizes, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn host_reports_slot_states() {
        let host = LlmHost::new();
        let states = host.slot_states().await;
        assert_eq!(states.len(), 3);
        assert!(states.iter().all(|(_, loaded)| !loaded));
    }
}
