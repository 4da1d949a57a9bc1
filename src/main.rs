//! # qmd CLI
//!
//! The `qmd` binary searches personal markdown corpora from the terminal.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qmd collection add <name> <path>` | Declare a collection under a glob mask |
//! | `qmd update` | Re-scan collections and index changed files |
//! | `qmd embed` | Chunk and embed documents with the active provider |
//! | `qmd search "<query>"` | Keyword (BM25) search |
//! | `qmd vsearch "<query>"` | Vector-semantic search |
//! | `qmd query "<query>"` | Hybrid pipeline: expansion, fusion, rerank |
//! | `qmd get <ref>` | Fetch one document by path or `#docid` |
//! | `qmd multi-get <pattern>` | Fetch documents by glob or comma list |
//! | `qmd context add <vpath> <text>` | Attach a description to a subtree |
//! | `qmd provider [name]` | Show or switch the active embedding provider |
//! | `qmd status` | Index statistics |
//! | `qmd cleanup` | Reap inactive rows, orphaned vectors, caches |
//!
//! Exit codes: `0` success, `1` user error (unknown collection, not
//! found), `2` I/O or system error.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use qmd::embedding::Provider;
use qmd::error::{QmdError, Result};
use qmd::hybrid::QueryOptions;
use qmd::models::{MultiGetResult, SearchHit};
use qmd::store::{SETTING_MODEL, SETTING_PROVIDER};
use qmd::{config, embed_cmd, get, hybrid, ingest, search, LlmHost, Store};

/// On-device hybrid search for personal markdown corpora.
#[derive(Parser)]
#[command(
    name = "qmd",
    about = "On-device hybrid search for personal markdown corpora",
    version
)]
struct Cli {
    /// Use a specific index database instead of the default under
    /// `${XDG_CACHE_HOME:-~/.cache}/qmd/`.
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    /// Verbose logging (debug level, full error chains).
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keyword search over the BM25 full-text index.
    Search {
        query: String,
        #[command(flatten)]
        opts: SearchFlags,
    },

    /// Vector-semantic search against the active provider's namespace.
    Vsearch {
        query: String,
        #[command(flatten)]
        opts: SearchFlags,
    },

    /// Hybrid search: query expansion, BM25 + vector fusion, reranking.
    Query {
        query: String,
        #[command(flatten)]
        opts: SearchFlags,
    },

    /// Fetch one document by path, `qmd://` virtual path, or `#docid`.
    Get {
        /// Document reference.
        reference: String,
        /// Print the full body (default prints metadata and body).
        #[arg(long)]
        full: bool,
        /// Number body lines.
        #[arg(long)]
        line_numbers: bool,
        #[arg(long)]
        json: bool,
    },

    /// Fetch several documents by glob or comma-separated list.
    #[command(name = "multi-get")]
    MultiGet {
        /// Glob (`notes/*.md`) or comma list of paths and `#docid`s.
        pattern: String,
        /// Skip files larger than this many bytes (listed under errors).
        #[arg(long)]
        max_bytes: Option<usize>,
        #[arg(long)]
        json: bool,
    },

    /// Manage collections.
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Manage path contexts (`qmd://collection[/subpath]` descriptions).
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Re-scan collections and index added/changed/removed files.
    Update {
        /// Only this collection.
        #[arg(long, short = 'c')]
        collection: Option<String>,
    },

    /// Chunk and embed active documents with the active provider.
    Embed {
        /// Re-embed everything in the namespace from scratch.
        #[arg(long)]
        force: bool,
        /// Only this collection.
        #[arg(long, short = 'c')]
        collection: Option<String>,
    },

    /// Show index statistics.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Reap inactive documents, orphaned vectors, and the LLM cache.
    Cleanup,

    /// Show the active embedding provider, or switch to another.
    Provider {
        /// Provider to activate: local, openai, or gemini.
        name: Option<String>,
        /// Model id override for the provider.
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(clap::Args)]
struct SearchFlags {
    /// Maximum results.
    #[arg(long, short = 'n', default_value_t = config::DEFAULT_LIMIT)]
    limit: usize,

    /// Restrict to one collection.
    #[arg(long, short = 'c')]
    collection: Option<String>,

    /// Search every collection (overrides -c).
    #[arg(long)]
    all: bool,

    /// Drop results scoring below this value.
    #[arg(long, default_value_t = 0.0)]
    min_score: f64,

    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,
}

impl SearchFlags {
    fn collection_filter(&self) -> Option<&str> {
        if self.all {
            None
        } else {
            self.collection.as_deref()
        }
    }
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Declare a new collection rooted at a path.
    Add {
        name: String,
        path: PathBuf,
        /// Glob mask relative to the root (comma-separated globs allowed).
        #[arg(long, default_value = config::DEFAULT_MASK)]
        mask: String,
    },
    /// List collections with document counts.
    List,
    /// Remove a collection; its documents are reaped by `cleanup`.
    Remove { name: String },
    /// Rename a collection, preserving its documents.
    Rename { old: String, new: String },
}

#[derive(Subcommand)]
enum ContextAction {
    /// Attach a description to `/` or `qmd://collection[/subpath]`.
    Add { vpath: String, text: String },
    /// List all path contexts.
    List,
    /// Remove a path context.
    Rm { vpath: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "qmd=debug" } else { "qmd=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        if let QmdError::NotFound { suggestions, .. } = &e {
            if !suggestions.is_empty() {
                eprintln!("Did you mean:");
                for s in suggestions {
                    eprintln!("  {s}");
                }
            }
        }
        std::process::exit(e.exit_code());
    }
}

async fn open_store(cli_index: &Option<PathBuf>) -> Result<Store> {
    match cli_index {
        Some(path) => Store::open(path).await,
        None => Store::open_default().await,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = open_store(&cli.index).await?;

    match cli.command {
        Commands::Search { query, opts } => {
            let mut hits =
                search::fts_search(&store, &query, opts.limit, opts.collection_filter()).await?;
            hits.retain(|h| h.score >= opts.min_score);
            print_hits(&hits, opts.json)?;
        }

        Commands::Vsearch { query, opts } => {
            let host = Arc::new(LlmHost::new());
            let provider = Provider::active(&store, &host, None, None).await?;
            let mut hits = search::vec_search(
                &store,
                &provider,
                &query,
                opts.limit,
                opts.collection_filter(),
            )
            .await?;
            hits.retain(|h| h.score >= opts.min_score);
            print_hits(&hits, opts.json)?;
        }

        Commands::Query { query, opts } => {
            let host = Arc::new(LlmHost::new());
            // Degrade to keyword-only retrieval when no provider is usable.
            let provider = match Provider::active(&store, &host, None, None).await {
                Ok(p) => Some(Arc::new(p)),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding provider unavailable, keyword-only retrieval");
                    None
                }
            };
            let options = QueryOptions {
                limit: opts.limit,
                collection: opts.collection_filter().map(str::to_string),
                min_score: opts.min_score,
            };
            let hits = hybrid::run_query(&store, &host, provider, &query, &options).await?;
            print_hits(&hits, opts.json)?;
        }

        Commands::Get {
            reference,
            full,
            line_numbers,
            json,
        } => {
            let doc = get::find_document(&store, &reference, true).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&doc).map_err(to_internal)?);
            } else {
                println!("# {} (#{})", doc.display_path(), doc.docid);
                println!("title:    {}", doc.title);
                println!("modified: {}", doc.modified_at);
                if let Some(ref ctx) = doc.context {
                    println!("context:  {ctx}");
                }
                if let Some(ref body) = doc.body {
                    println!();
                    let text: &str = if full {
                        body
                    } else {
                        // Default view truncates very long bodies.
                        &body[..body.char_indices().nth(4000).map_or(body.len(), |(i, _)| i)]
                    };
                    if line_numbers {
                        for (i, line) in text.lines().enumerate() {
                            println!("{:>5} | {line}", i + 1);
                        }
                    } else {
                        println!("{text}");
                    }
                    if !full && text.len() < body.len() {
                        println!("… (truncated, use --full)");
                    }
                }
            }
        }

        Commands::MultiGet {
            pattern,
            max_bytes,
            json,
        } => {
            let result = get::find_documents(&store, &pattern, max_bytes).await?;
            print_multi_get(&result, json)?;
        }

        Commands::Collection { action } => match action {
            CollectionAction::Add { name, path, mask } => {
                let canonical = std::fs::canonicalize(&path).map_err(|e| {
                    QmdError::InvalidConfig {
                        field: "path".into(),
                        reason: format!("{}: {e}", path.display()),
                    }
                })?;
                store
                    .collection_add(&name, &canonical.to_string_lossy(), &mask)
                    .await?;
                println!("Added collection '{name}' at {} ({mask})", canonical.display());
                println!("Run `qmd update` to index it.");
            }
            CollectionAction::List => {
                let collections = store.collections().await?;
                if collections.is_empty() {
                    println!("No collections. Add one with `qmd collection add <name> <path>`.");
                }
                for c in collections {
                    println!(
                        "{}  {} docs  {}  ({})",
                        c.name, c.active_count, c.path, c.mask
                    );
                }
            }
            CollectionAction::Remove { name } => {
                let removed = store.collection_remove(&name).await?;
                println!("Removed collection '{name}' ({removed} documents deactivated).");
                println!("Run `qmd cleanup` to reclaim space.");
            }
            CollectionAction::Rename { old, new } => {
                store.collection_rename(&old, &new).await?;
                println!("Renamed collection '{old}' to '{new}'.");
            }
        },

        Commands::Context { action } => match action {
            ContextAction::Add { vpath, text } => {
                let vpath = normalize_context_vpath(&vpath)?;
                store.context_set(&vpath, &text).await?;
                println!("Context set for {vpath}");
            }
            ContextAction::List => {
                for (vpath, text) in store.context_list().await? {
                    println!("{vpath}\n    {text}");
                }
            }
            ContextAction::Rm { vpath } => {
                let vpath = normalize_context_vpath(&vpath)?;
                if store.context_remove(&vpath).await? {
                    println!("Context removed for {vpath}");
                } else {
                    return Err(QmdError::NotFound {
                        what: format!("context '{vpath}'"),
                        suggestions: Vec::new(),
                    });
                }
            }
        },

        Commands::Update { collection } => {
            let reports = ingest::run_update(&store, collection.as_deref()).await?;
            for r in &reports {
                println!("{}", r.collection);
                println!("  added:     {}", r.added);
                println!("  updated:   {}", r.updated);
                println!("  unchanged: {}", r.unchanged);
                println!("  removed:   {}", r.removed);
                if r.errors > 0 {
                    println!("  errors:    {}", r.errors);
                }
            }
            if reports.is_empty() {
                println!("No collections to update.");
            }
        }

        Commands::Embed { force, collection } => {
            let host = Arc::new(LlmHost::new());
            let provider = Provider::active(&store, &host, None, None).await?;
            println!("Embedding with {} …", provider.model_key());
            let report = embed_cmd::run_embed(&store, &provider, force, collection.as_deref()).await?;
            println!("  documents: {}", report.documents);
            println!("  embedded:  {}", report.chunks_embedded);
            println!("  skipped:   {}", report.chunks_skipped);
            if report.chunks_failed > 0 {
                println!("  failed:    {}", report.chunks_failed);
            }
        }

        Commands::Status { json } => {
            let host = Arc::new(LlmHost::new());
            let mut status = store.status().await?;
            status.model_slots = host.slot_states().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status).map_err(to_internal)?);
            } else {
                println!("documents: {}", status.total_documents);
                println!("chunks:    {}", status.total_chunks);
                println!("provider:  {}", status.active_provider);
                if status.needs_embedding > 0 {
                    println!("pending:   {} documents need embedding", status.needs_embedding);
                }
                println!("collections:");
                for c in &status.collections {
                    println!("  {}  {} docs  ({})", c.name, c.active_count, c.path);
                }
                if !status.vectors.is_empty() {
                    println!("vectors:");
                    for ns in &status.vectors {
                        println!("  {}  {}", ns.model, ns.vectors);
                    }
                }
                println!("models:");
                for (slot, loaded) in &status.model_slots {
                    println!("  {slot}  {}", if *loaded { "loaded" } else { "released" });
                }
            }
        }

        Commands::Cleanup => {
            let docs = store.delete_inactive().await?;
            let vectors = store.cleanup_orphaned_vectors().await?;
            let cache = store.delete_llm_cache().await?;
            store.vacuum().await?;
            println!("cleanup");
            println!("  inactive documents removed: {docs}");
            println!("  orphaned vector rows removed: {vectors}");
            println!("  cached LLM responses removed: {cache}");
        }

        Commands::Provider { name, model } => {
            let host = Arc::new(LlmHost::new());
            match name {
                None => {
                    let (provider, model) = store.active_provider_setting().await?;
                    println!("active provider: {provider}/{model}");
                    for ns in store.namespaces().await? {
                        println!("  {}  {} vectors", ns.model, ns.vectors);
                    }
                }
                Some(name) => {
                    // Constructing validates configuration up front.
                    let provider = Provider::create(&name, model.as_deref(), &host)?;
                    store.set_setting(SETTING_PROVIDER, provider.name()).await?;
                    store.set_setting(SETTING_MODEL, provider.model_id()).await?;
                    println!("active provider: {}", provider.model_key());
                    println!("Run `qmd embed` to build its vector namespace.");
                }
            }
        }
    }

    Ok(())
}

fn print_hits(hits: &[SearchHit], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(hits).map_err(to_internal)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (#{})",
            i + 1,
            hit.score,
            hit.display_path(),
            hit.docid
        );
        println!("   {}", hit.title);
        if let Some(ref ctx) = hit.context {
            println!("   context: {ctx}");
        }
        if let Some(ref snippet) = hit.snippet {
            println!("   {}", snippet.replace('\n', " "));
        }
    }
    Ok(())
}

fn print_multi_get(result: &MultiGetResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result).map_err(to_internal)?);
        return Ok(());
    }
    for doc in &result.docs {
        println!("==> {} (#{})", doc.display_path(), doc.docid);
        if let Some(ref body) = doc.body {
            println!("{body}");
        }
        println!();
    }
    if !result.errors.is_empty() {
        println!("errors:");
        for e in &result.errors {
            println!("  {} [{}]: {}", e.path, e.kind, e.message);
        }
    }
    if result.docs.is_empty() && result.errors.is_empty() {
        println!("No documents.");
    }
    Ok(())
}

/// Accept `/` (global) or any `qmd://` spelling for context vpaths.
fn normalize_context_vpath(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed == "/" {
        return Ok("/".to_string());
    }
    let normalized = qmd::models::normalize_virtual_path(trimmed);
    if qmd::models::parse_virtual_path(&normalized).is_none() {
        return Err(QmdError::InvalidConfig {
            field: "vpath".into(),
            reason: format!("'{input}' is not '/' or qmd://<collection>[/subpath]"),
        });
    }
    Ok(normalized)
}

fn to_internal(e: serde_json::Error) -> QmdError {
    QmdError::Internal(format!("JSON encoding failed: {e}"))
}
