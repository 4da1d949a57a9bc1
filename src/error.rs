//! Error taxonomy shared across the crate.
//!
//! Library functions return [`Result`]; the CLI maps each variant to an
//! exit code (`1` for user errors, `2` for I/O and system errors) via
//! [`QmdError::exit_code`]. Retrieval and indexing are deliberately
//! forgiving: a single unreadable file or unembeddable chunk is counted
//! and reported, never fatal. Only configuration and database-open
//! failures abort startup.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QmdError>;

#[derive(Debug, thiserror::Error)]
pub enum QmdError {
    /// A document, collection, or context lookup found nothing.
    /// `suggestions` carries up to five nearby paths for `get`-style misses.
    #[error("{what} not found")]
    NotFound {
        what: String,
        suggestions: Vec<String>,
    },

    /// A short docid prefix matched more than one distinct content hash.
    #[error("docid #{docid} is ambiguous ({count} matches); use a path instead")]
    AmbiguousDocid { docid: String, count: usize },

    /// `collection add` with a name that already exists.
    #[error("collection '{name}' already exists")]
    DuplicateCollection { name: String },

    /// A `-c`/`--collection` filter or collection verb named an unknown collection.
    #[error("unknown collection '{name}'")]
    UnknownCollection { name: String },

    /// An embedding/generation backend cannot be used at all
    /// (missing API key, feature not compiled in, endpoint unreachable).
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    /// The provider kept answering HTTP 429 after all retries.
    #[error("provider '{provider}' overloaded (rate limited after retries)")]
    ProviderOverload { provider: String },

    /// A file exceeded the `--max-bytes` guard in `multi-get`.
    #[error("{path} is {size} bytes (limit {max_bytes})")]
    Oversize {
        path: String,
        size: usize,
        max_bytes: usize,
    },

    /// Stored data is inconsistent (dimension mismatch, orphaned vectors).
    /// `cleanup` repairs by deletion.
    #[error("index corruption: {detail}")]
    Corruption { detail: String },

    /// A configuration value or argument is invalid.
    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected condition; the message is the stable description.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QmdError {
    /// Process exit code for the CLI: `1` for user errors, `2` for
    /// I/O and system errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            QmdError::Db(_)
            | QmdError::Io(_)
            | QmdError::Http(_)
            | QmdError::Corruption { .. }
            | QmdError::Internal(_) => 2,
            _ => 1,
        }
    }

    /// Stable machine-readable kind, used in `--json` error output.
    pub fn kind(&self) -> &'static str {
        match self {
            QmdError::NotFound { .. } => "not_found",
            QmdError::AmbiguousDocid { .. } => "ambiguous",
            QmdError::DuplicateCollection { .. } => "conflict",
            QmdError::UnknownCollection { .. } => "unknown_collection",
            QmdError::ProviderUnavailable { .. } => "provider_unavailable",
            QmdError::ProviderOverload { .. } => "provider_overload",
            QmdError::Oversize { .. } => "oversize",
            QmdError::Corruption { .. } => "corruption",
            QmdError::InvalidConfig { .. } => "invalid_config",
            QmdError::Db(_) => "database",
            QmdError::Io(_) => "io",
            QmdError::Http(_) => "http",
            QmdError::Internal(_) => "internal",
        }
    }
}
