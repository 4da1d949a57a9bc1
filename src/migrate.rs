//! Database schema creation.
//!
//! All tables are created at open time if absent; running the migration
//! repeatedly is safe. The FTS5 index over active documents is kept in
//! sync by triggers, so search never sees an inactive row.
//!
//! # Schema
//!
//! ```text
//! collections(name PK, path, mask)
//! path_contexts(vpath PK, text)
//! documents(id PK, collection, filepath, title, content_hash, docid,
//!           body, active, created_at, modified_at)
//!   UNIQUE(collection, filepath) WHERE active = 1
//! documents_fts(title, body)                      -- FTS5, rowid = documents.id
//! content_vectors(content_hash, seq, pos, model, embedded_at,
//!                 PK(content_hash, seq, model))
//! vectors_vec_<ns>(hash_seq PK, embedding BLOB)   -- one table per namespace
//! llm_cache(model, purpose, input_hash, response, created_at,
//!           PK(model, purpose, input_hash))
//! settings(key PK, value)
//! ```

use sqlx::SqlitePool;

use crate::error::Result;

/// Create all tables, indexes, triggers, and the FTS5 virtual table.
/// Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            mask TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS path_contexts (
            vpath TEXT PRIMARY KEY,
            text TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            filepath TEXT NOT NULL,
            title TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            docid TEXT NOT NULL,
            body TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_active_path
        ON documents(collection, filepath) WHERE active = 1
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(content_hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_docid ON documents(docid, active)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, active)",
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table (not idempotent natively, check first)
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                title, body,
                tokenize='porter unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    create_fts_triggers(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_vectors (
            content_hash TEXT NOT NULL,
            seq INTEGER NOT NULL,
            pos INTEGER NOT NULL,
            model TEXT NOT NULL,
            embedded_at TEXT NOT NULL,
            PRIMARY KEY (content_hash, seq, model)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_cache (
            model TEXT NOT NULL,
            purpose TEXT NOT NULL,
            input_hash TEXT NOT NULL,
            response TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (model, purpose, input_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Mirror active documents into the FTS index. Inserts, deactivation,
/// and hard deletes each keep `documents_fts` holding exactly the active
/// set.
async fn create_fts_triggers(pool: &SqlitePool) -> Result<()> {
    let trigger_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='trigger' AND name='documents_ai'",
    )
    .fetch_one(pool)
    .await?;

    if trigger_exists {
        return Ok(());
    }

    sqlx::query(
        r#"
        CREATE TRIGGER documents_ai AFTER INSERT ON documents
        WHEN new.active = 1
        BEGIN
            INSERT INTO documents_fts(rowid, title, body)
            VALUES (new.id, new.title, new.body);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER documents_ad AFTER DELETE ON documents
        WHEN old.active = 1
        BEGIN
            DELETE FROM documents_fts WHERE rowid = old.id;
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER documents_au AFTER UPDATE OF active ON documents
        WHEN old.active = 1 AND new.active = 0
        BEGIN
            DELETE FROM documents_fts WHERE rowid = old.id;
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER documents_ar AFTER UPDATE OF active ON documents
        WHEN old.active = 0 AND new.active = 1
        BEGIN
            INSERT INTO documents_fts(rowid, title, body)
            VALUES (new.id, new.title, new.body);
        END
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
