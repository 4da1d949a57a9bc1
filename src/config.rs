//! Filesystem locations, environment variables, and tunable defaults.
//!
//! Everything lives under `${XDG_CACHE_HOME:-~/.cache}/qmd/`:
//!
//! | Path | Purpose |
//! |------|---------|
//! | `index.sqlite` | the single index database |
//! | `models/` | downloaded local model weights |
//!
//! Runtime settings that must survive across runs (the active embedding
//! provider and model) are stored in the database `settings` table, not in
//! a config file.

use std::path::PathBuf;

/// Default glob mask for new collections.
pub const DEFAULT_MASK: &str = "**/*.md";

/// Default result limit for the search verbs.
pub const DEFAULT_LIMIT: usize = 10;

/// Default `--max-bytes` guard for `multi-get`.
pub const DEFAULT_MAX_BYTES: usize = 102_400;

/// API key environment variable for the OpenAI-compatible provider.
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
/// Base URL override for the OpenAI-compatible provider.
pub const OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
/// Default OpenAI endpoint.
pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// API key environment variable for the Gemini provider.
pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";

/// Endpoint override for the local generator (query expansion).
pub const GENERATOR_URL: &str = "QMD_GENERATOR_URL";
/// Default Ollama-compatible endpoint for the local generator.
pub const GENERATOR_DEFAULT_URL: &str = "http://localhost:11434";
/// Model override for the local generator.
pub const GENERATOR_MODEL: &str = "QMD_GENERATOR_MODEL";
/// Default generator model.
pub const GENERATOR_DEFAULT_MODEL: &str = "qwen2.5:1.5b-instruct";

/// Root cache directory: `$XDG_CACHE_HOME/qmd` or `~/.cache/qmd`.
pub fn cache_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            home.join(".cache")
        });
    base.join("qmd")
}

/// Path of the index database.
pub fn index_db_path() -> PathBuf {
    cache_dir().join("index.sqlite")
}

/// Directory for downloaded model weights.
pub fn models_dir() -> PathBuf {
    cache_dir().join("models")
}

/// Ollama-compatible endpoint for the generator model.
pub fn generator_url() -> String {
    std::env::var(GENERATOR_URL).unwrap_or_else(|_| GENERATOR_DEFAULT_URL.to_string())
}

/// Generator model identifier.
pub fn generator_model() -> String {
    std::env::var(GENERATOR_MODEL).unwrap_or_else(|_| GENERATOR_DEFAULT_MODEL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_dir_ends_with_qmd() {
        assert!(cache_dir().ends_with("qmd"));
    }

    #[test]
    fn index_path_under_cache_dir() {
        let p = index_db_path();
        assert!(p.starts_with(cache_dir()));
        assert_eq!(p.file_name().unwrap(), "index.sqlite");
    }
}
