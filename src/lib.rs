//! # qmd
//!
//! **On-device hybrid search for personal markdown corpora.**
//!
//! qmd indexes user-declared *collections* of markdown files into a single
//! SQLite database and answers queries through three search modes that
//! share one storage layer: exact-keyword BM25, vector-semantic, and a
//! hybrid pipeline with query expansion and cross-encoder reranking.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Collections │──▶│ Chunk + Embed │──▶│    SQLite     │
//! │ (glob scan) │   │  (providers)  │   │ FTS5 + BLOBs  │
//! └─────────────┘   └──────┬───────┘   └───────┬───────┘
//!                          │                   │
//!                     ┌────┴────┐         ┌────┴─────┐
//!                     │ LLM host │         │  search  │
//!                     │ 3 slots  │◀────────│  vsearch │
//!                     └─────────┘          │  query   │
//!                                          └──────────┘
//! ```
//!
//! ## Data flow for `query`
//!
//! 1. The [`expand`] module asks the generator for two alternative
//!    phrasings (cached; absent generator means no expansion).
//! 2. Each phrasing fans out to BM25 ([`search::fts_search`]) and vector
//!    ([`search::vec_search`]) retrieval in parallel, with the original
//!    query counted twice.
//! 3. [`hybrid`] fuses the ranked lists with Reciprocal Rank Fusion plus
//!    a top-rank bonus and keeps the best 30.
//! 4. The [`rerank`] cross-encoder scores (query, excerpt) pairs; a
//!    position-aware blend combines fused and rerank scores so strong
//!    literal matches stay on top.
//!
//! ## Identity
//!
//! Documents are content-addressed: `content_hash` is the SHA-256 of the
//! body and `docid` its first six hex characters, shown as `#xxxxxx`.
//! Re-indexing an unchanged file is a no-op; changes deactivate the old
//! row and insert a new one. Vectors live in one table per
//! provider/model namespace, so differently-dimensioned models coexist.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | cache paths, environment variables, defaults |
//! | [`error`] | `QmdError` taxonomy and exit-code mapping |
//! | [`db`] / [`migrate`] | SQLite pool and idempotent schema |
//! | [`models`] | row/result types, hashing and path helpers |
//! | [`store`] | collections, documents, vectors, caches, settings |
//! | [`chunker`] | fixed-size chunks with overlap |
//! | [`embedding`] | local / OpenAI / Gemini providers |
//! | [`host`] | process-wide model slots with idle release |
//! | [`search`] | BM25 and vector retrieval primitives |
//! | [`expand`] | cached two-variant query expansion |
//! | [`rerank`] | cached cross-encoder scoring |
//! | [`hybrid`] | RRF fusion, blending, the `query` pipeline |
//! | [`ingest`] | `update`: scan collections, diff, deactivate |
//! | [`embed_cmd`] | `embed`: resumable chunk embedding |
//! | [`get`] | `get`/`multi-get` resolution with suggestions |

pub mod chunker;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod expand;
pub mod get;
pub mod host;
pub mod hybrid;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod rerank;
pub mod search;
pub mod store;

pub use error::{QmdError, Result};
pub use host::LlmHost;
pub use store::Store;
