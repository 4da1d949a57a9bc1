//! The persistent index: collections, documents, vectors, caches, settings.
//!
//! A [`Store`] wraps the SQLite pool and translates every operation into
//! SQL against the schema created by [`crate::migrate`]. Reads run
//! concurrently on the pool; writes serialize on a process-wide async
//! mutex so an `update`/`embed` cycle commits in file order.
//!
//! Documents are content-addressed. Re-indexing an unchanged file is a
//! no-op; a changed file deactivates the previous row and inserts a fresh
//! active one. Inactive rows linger until `cleanup` so stale vectors can
//! still resolve their parent, then both are reaped together.

use std::path::Path;
use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::error::{QmdError, Result};
use crate::models::{
    content_hash, docid_from_hash, extract_title, CollectionInfo, DiffKind, DocDiff,
    DocumentResult, IndexStatus, NamespaceCount,
};
use crate::{config, db, migrate};

/// Settings key holding the active embedding provider name.
pub const SETTING_PROVIDER: &str = "embedding_provider";
/// Settings key holding the active embedding model id.
pub const SETTING_MODEL: &str = "embedding_model";

/// Fold a `provider/model` key into a table-name-safe namespace:
/// every non-alphanumeric character becomes `_`.
pub fn fold_namespace(model_key: &str) -> String {
    model_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Name of the vector table for a `provider/model` key.
pub fn vector_table_name(model_key: &str) -> String {
    format!("vectors_vec_{}", fold_namespace(model_key))
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Encode a float vector as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Handle on the index database. Cheap to clone; clones share the pool
/// and the write lock.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Open the default index at `${XDG_CACHE_HOME:-~/.cache}/qmd/index.sqlite`.
    pub async fn open_default() -> Result<Self> {
        Self::open(&config::index_db_path()).await
    }

    /// Open a private in-memory index (tests and dry runs).
    pub async fn open_in_memory() -> Result<Self> {
        let pool = db::connect_in_memory().await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // === Collections ===

    pub async fn collection_add(&self, name: &str, path: &str, mask: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            return Err(QmdError::DuplicateCollection { name: name.into() });
        }
        sqlx::query("INSERT INTO collections (name, path, mask) VALUES (?, ?, ?)")
            .bind(name)
            .bind(path)
            .bind(mask)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Collection row, if present: `(path, mask)`.
    pub async fn collection(&self, name: &str) -> Result<Option<(String, String)>> {
        let row = sqlx::query("SELECT path, mask FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("path"), r.get("mask"))))
    }

    pub async fn collections(&self) -> Result<Vec<CollectionInfo>> {
        let rows = sqlx::query("SELECT name, path, mask FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            let stats = sqlx::query(
                r#"
                SELECT COUNT(*) AS count, MAX(modified_at) AS last_modified
                FROM documents WHERE collection = ? AND active = 1
                "#,
            )
            .bind(&name)
            .fetch_one(&self.pool)
            .await?;
            let count: i64 = stats.get("count");
            out.push(CollectionInfo {
                name,
                path: row.get("path"),
                mask: row.get("mask"),
                active_count: count as usize,
                last_modified: stats.get("last_modified"),
            });
        }
        Ok(out)
    }

    /// Remove the collection and deactivate its documents. Inactive rows
    /// (and their vectors) are reaped by `cleanup`.
    pub async fn collection_remove(&self, name: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let deleted = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(QmdError::UnknownCollection { name: name.into() });
        }
        let deactivated =
            sqlx::query("UPDATE documents SET active = 0 WHERE collection = ? AND active = 1")
                .bind(name)
                .execute(&self.pool)
                .await?;
        Ok(deactivated.rows_affected() as usize)
    }

    /// Rename a collection; document ownership follows the new name.
    pub async fn collection_rename(&self, old: &str, new: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let new_exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
                .bind(new)
                .fetch_one(&self.pool)
                .await?;
        if new_exists {
            return Err(QmdError::DuplicateCollection { name: new.into() });
        }
        let updated = sqlx::query("UPDATE collections SET name = ? WHERE name = ?")
            .bind(new)
            .bind(old)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(QmdError::UnknownCollection { name: old.into() });
        }
        sqlx::query("UPDATE documents SET collection = ? WHERE collection = ?")
            .bind(new)
            .bind(old)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Documents ===

    /// Index one file's current contents. Content-addressed diffing:
    /// unchanged bodies are a no-op, changed bodies deactivate the old row
    /// and insert a new active one (FTS follows via triggers).
    pub async fn add_or_update_document(
        &self,
        collection: &str,
        filepath: &str,
        body: &str,
    ) -> Result<DocDiff> {
        let hash = content_hash(body);
        let title = extract_title(body, filepath);
        let now = now_iso();

        let _guard = self.write_lock.lock().await;

        let existing = sqlx::query(
            "SELECT id, content_hash FROM documents WHERE collection = ? AND filepath = ? AND active = 1",
        )
        .bind(collection)
        .bind(filepath)
        .fetch_optional(&self.pool)
        .await?;

        let kind = match existing {
            Some(row) => {
                let old_hash: String = row.get("content_hash");
                if old_hash == hash {
                    return Ok(DocDiff {
                        kind: DiffKind::Unchanged,
                        hash,
                    });
                }
                let old_id: i64 = row.get("id");
                let mut tx = self.pool.begin().await?;
                sqlx::query("UPDATE documents SET active = 0 WHERE id = ?")
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    r#"
                    INSERT INTO documents
                        (collection, filepath, title, content_hash, docid, body, active, created_at, modified_at)
                    VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                    "#,
                )
                .bind(collection)
                .bind(filepath)
                .bind(&title)
                .bind(&hash)
                .bind(docid_from_hash(&hash))
                .bind(body)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                DiffKind::Updated
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO documents
                        (collection, filepath, title, content_hash, docid, body, active, created_at, modified_at)
                    VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                    "#,
                )
                .bind(collection)
                .bind(filepath)
                .bind(&title)
                .bind(&hash)
                .bind(docid_from_hash(&hash))
                .bind(body)
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                DiffKind::Added
            }
        };

        Ok(DocDiff { kind, hash })
    }

    /// Mark a document inactive (file removed or renamed).
    pub async fn deactivate_document(&self, collection: &str, filepath: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query(
            "UPDATE documents SET active = 0 WHERE collection = ? AND filepath = ? AND active = 1",
        )
        .bind(collection)
        .bind(filepath)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Active filepaths of one collection.
    pub async fn active_paths(&self, collection: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT filepath FROM documents WHERE collection = ? AND active = 1 ORDER BY filepath",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("filepath")).collect())
    }

    /// Every active `(collection, filepath)` pair.
    pub async fn all_active_paths(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT collection, filepath FROM documents WHERE active = 1 ORDER BY collection, filepath",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("collection"), r.get("filepath")))
            .collect())
    }

    /// Fetch an active document by exact collection and path.
    pub async fn document_by_path(
        &self,
        collection: &str,
        filepath: &str,
        include_body: bool,
    ) -> Result<Option<DocumentResult>> {
        let row = sqlx::query(
            r#"
            SELECT collection, filepath, title, content_hash, docid, modified_at,
                   LENGTH(body) AS body_length, body
            FROM documents
            WHERE collection = ? AND filepath = ? AND active = 1
            "#,
        )
        .bind(collection)
        .bind(filepath)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let mut doc = row_to_document(&row, include_body);
        doc.context = self.context_for(&doc.collection, &doc.filepath).await?;
        Ok(Some(doc))
    }

    /// Resolve a six-hex docid against active rows. Several rows sharing
    /// one content hash resolve to the first by path order; more than one
    /// distinct hash is an explicit ambiguity error.
    pub async fn documents_by_docid(
        &self,
        docid: &str,
        include_body: bool,
    ) -> Result<Option<DocumentResult>> {
        let clean = docid.trim_start_matches('#');
        let rows = sqlx::query(
            r#"
            SELECT collection, filepath, title, content_hash, docid, modified_at,
                   LENGTH(body) AS body_length, body
            FROM documents
            WHERE docid = ? AND active = 1
            ORDER BY collection, filepath
            "#,
        )
        .bind(clean)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut hashes: Vec<String> = rows
            .iter()
            .map(|r| r.get::<String, _>("content_hash"))
            .collect();
        hashes.sort();
        hashes.dedup();
        if hashes.len() > 1 {
            return Err(QmdError::AmbiguousDocid {
                docid: clean.into(),
                count: hashes.len(),
            });
        }

        let mut doc = row_to_document(&rows[0], include_body);
        doc.context = self.context_for(&doc.collection, &doc.filepath).await?;
        Ok(Some(doc))
    }

    /// Active document bodies, one row per distinct content hash.
    /// Optionally restricted to a collection.
    pub async fn active_docs_with_bodies(
        &self,
        collection: Option<&str>,
    ) -> Result<Vec<(String, String, String)>> {
        let rows = match collection {
            Some(coll) => {
                sqlx::query(
                    r#"
                    SELECT content_hash, MIN(title) AS title, MIN(body) AS body
                    FROM documents WHERE active = 1 AND collection = ?
                    GROUP BY content_hash ORDER BY content_hash
                    "#,
                )
                .bind(coll)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT content_hash, MIN(title) AS title, MIN(body) AS body
                    FROM documents WHERE active = 1
                    GROUP BY content_hash ORDER BY content_hash
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows
            .iter()
            .map(|r| (r.get("content_hash"), r.get("title"), r.get("body")))
            .collect())
    }

    // === Path contexts ===

    pub async fn context_set(&self, vpath: &str, text: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO path_contexts (vpath, text) VALUES (?, ?)
            ON CONFLICT(vpath) DO UPDATE SET text = excluded.text
            "#,
        )
        .bind(vpath)
        .bind(text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn context_list(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT vpath, text FROM path_contexts ORDER BY vpath")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| (r.get("vpath"), r.get("text"))).collect())
    }

    pub async fn context_remove(&self, vpath: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query("DELETE FROM path_contexts WHERE vpath = ?")
            .bind(vpath)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Most specific context for a document: the longest `vpath` that is a
    /// prefix of `qmd://collection/filepath`, falling back to the global `/`.
    pub async fn context_for(&self, collection: &str, filepath: &str) -> Result<Option<String>> {
        let contexts = self.context_list().await?;
        if contexts.is_empty() {
            return Ok(None);
        }
        let full = crate::models::build_virtual_path(collection, filepath);
        let mut best: Option<(usize, String)> = None;
        for (vpath, text) in contexts {
            let matches = if vpath == "/" {
                true
            } else {
                let v = crate::models::normalize_virtual_path(&vpath);
                full == v || full.starts_with(&format!("{v}/"))
            };
            if matches {
                let len = if vpath == "/" { 0 } else { vpath.len() };
                if best.as_ref().map_or(true, |(l, _)| len > *l) {
                    best = Some((len, text));
                }
            }
        }
        Ok(best.map(|(_, text)| text))
    }

    // === Settings ===

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === LLM cache ===

    pub async fn llm_cache_get(
        &self,
        model: &str,
        purpose: &str,
        input_hash: &str,
    ) -> Result<Option<String>> {
        let value = sqlx::query_scalar(
            "SELECT response FROM llm_cache WHERE model = ? AND purpose = ? AND input_hash = ?",
        )
        .bind(model)
        .bind(purpose)
        .bind(input_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    pub async fn llm_cache_put(
        &self,
        model: &str,
        purpose: &str,
        input_hash: &str,
        response: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO llm_cache (model, purpose, input_hash, response, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(model, purpose, input_hash) DO UPDATE SET response = excluded.response
            "#,
        )
        .bind(model)
        .bind(purpose)
        .bind(input_hash)
        .bind(response)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === Vectors ===

    /// Create the namespace's vector table if absent.
    pub async fn ensure_vector_table(&self, model_key: &str) -> Result<()> {
        let table = vector_table_name(model_key);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (hash_seq TEXT PRIMARY KEY, embedding BLOB NOT NULL)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn vector_table_exists(&self, model_key: &str) -> Result<bool> {
        let table = vector_table_name(model_key);
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
        )
        .bind(&table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Store one chunk vector: metadata row plus the BLOB in the
    /// namespace table. Idempotent on `(content_hash, seq, model)`.
    pub async fn insert_vector(
        &self,
        model_key: &str,
        hash: &str,
        seq: usize,
        pos: usize,
        embedding: &[f32],
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO content_vectors (content_hash, seq, pos, model, embedded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(hash)
        .bind(seq as i64)
        .bind(pos as i64)
        .bind(model_key)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;

        let table = vector_table_name(model_key);
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {table} (hash_seq, embedding) VALUES (?, ?)"
        ))
        .bind(format!("{hash}_{seq}"))
        .bind(vec_to_blob(embedding))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Chunk sequence numbers already embedded for `(hash, model)`.
    pub async fn existing_seqs(&self, model_key: &str, hash: &str) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT seq FROM content_vectors WHERE content_hash = ? AND model = ? ORDER BY seq",
        )
        .bind(hash)
        .bind(model_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("seq")).collect())
    }

    /// Rows in the namespace's vector table (0 when the table is absent).
    pub async fn vector_count(&self, model_key: &str) -> Result<usize> {
        if !self.vector_table_exists(model_key).await? {
            return Ok(0);
        }
        let table = vector_table_name(model_key);
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Every namespace with vectors, with its count.
    pub async fn namespaces(&self) -> Result<Vec<NamespaceCount>> {
        let rows = sqlx::query("SELECT DISTINCT model FROM content_vectors ORDER BY model")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let model: String = row.get("model");
            let vectors = self.vector_count(&model).await?;
            out.push(NamespaceCount { model, vectors });
        }
        Ok(out)
    }

    /// Drop all vectors in one namespace (used by `embed --force`).
    pub async fn clear_namespace(&self, model_key: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query("DELETE FROM content_vectors WHERE model = ?")
            .bind(model_key)
            .execute(&self.pool)
            .await?;
        if self.vector_table_exists(model_key).await? {
            let table = vector_table_name(model_key);
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(res.rows_affected() as usize)
    }

    // === Maintenance ===

    /// Delete rows marked inactive. Returns the number removed.
    pub async fn delete_inactive(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query("DELETE FROM documents WHERE active = 0")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() as usize)
    }

    /// Remove vectors whose parent document is gone, vectors without a
    /// matching chunk row, and rows whose embedding length disagrees with
    /// the rest of their table. Returns total rows deleted.
    pub async fn cleanup_orphaned_vectors(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut deleted = 0usize;

        let models: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT model FROM content_vectors ORDER BY model")
                .fetch_all(&self.pool)
                .await?;

        let res = sqlx::query(
            r#"
            DELETE FROM content_vectors
            WHERE content_hash NOT IN (SELECT content_hash FROM documents WHERE active = 1)
            "#,
        )
        .execute(&self.pool)
        .await?;
        deleted += res.rows_affected() as usize;

        for model in models {
            if !self.vector_table_exists(&model).await? {
                continue;
            }
            let table = vector_table_name(&model);

            // hash_seq is "<64-hex-hash>_<seq>"
            let res = sqlx::query(&format!(
                r#"
                DELETE FROM {table}
                WHERE substr(hash_seq, 1, 64) NOT IN
                    (SELECT content_hash FROM documents WHERE active = 1)
                "#
            ))
            .execute(&self.pool)
            .await?;
            deleted += res.rows_affected() as usize;

            let res = sqlx::query(&format!(
                r#"
                DELETE FROM {table}
                WHERE hash_seq NOT IN
                    (SELECT content_hash || '_' || seq FROM content_vectors WHERE model = ?)
                "#
            ))
            .bind(&model)
            .execute(&self.pool)
            .await?;
            deleted += res.rows_affected() as usize;

            // Dimension check: rows disagreeing with the table's dominant
            // embedding length are corrupt.
            let dominant: Option<i64> = sqlx::query_scalar(&format!(
                r#"
                SELECT LENGTH(embedding) AS len FROM {table}
                GROUP BY len ORDER BY COUNT(*) DESC LIMIT 1
                "#
            ))
            .fetch_optional(&self.pool)
            .await?;
            if let Some(len) = dominant {
                let res = sqlx::query(&format!(
                    "DELETE FROM {table} WHERE LENGTH(embedding) != ?"
                ))
                .bind(len)
                .execute(&self.pool)
                .await?;
                let n = res.rows_affected() as usize;
                if n > 0 {
                    tracing::warn!(
                        namespace = %model,
                        removed = n,
                        "removed dimension-mismatched vectors"
                    );
                }
                deleted += n;
            }
        }

        Ok(deleted)
    }

    pub async fn delete_llm_cache(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let res = sqlx::query("DELETE FROM llm_cache")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() as usize)
    }

    pub async fn vacuum(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    // === Status ===

    /// Active provider/model pair from settings, with defaults.
    pub async fn active_provider_setting(&self) -> Result<(String, String)> {
        let provider = self
            .get_setting(SETTING_PROVIDER)
            .await?
            .unwrap_or_else(|| crate::embedding::LOCAL_PROVIDER.to_string());
        let model = match self.get_setting(SETTING_MODEL).await? {
            Some(m) => m,
            None => crate::embedding::default_model_for(&provider).to_string(),
        };
        Ok((provider, model))
    }

    /// Index statistics. Model-slot states are filled in by the caller,
    /// which owns the LLM host.
    pub async fn status(&self) -> Result<IndexStatus> {
        let collections = self.collections().await?;

        let total_documents: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;

        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_vectors")
            .fetch_one(&self.pool)
            .await?;

        let (provider, model) = self.active_provider_setting().await?;
        let model_key = format!("{provider}/{model}");

        let needs_embedding: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT d.content_hash)
            FROM documents d
            LEFT JOIN content_vectors v
                ON v.content_hash = d.content_hash AND v.seq = 0 AND v.model = ?
            WHERE d.active = 1 AND v.content_hash IS NULL
            "#,
        )
        .bind(&model_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(IndexStatus {
            collections,
            total_documents: total_documents as usize,
            total_chunks: total_chunks as usize,
            vectors: self.namespaces().await?,
            active_provider: model_key,
            needs_embedding: needs_embedding as usize,
            model_slots: Vec::new(),
        })
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow, include_body: bool) -> DocumentResult {
    let body_length: i64 = row.get("body_length");
    DocumentResult {
        docid: row.get("docid"),
        collection: row.get("collection"),
        filepath: row.get("filepath"),
        title: row.get("title"),
        content_hash: row.get("content_hash"),
        modified_at: row.get("modified_at"),
        body_length: body_length as usize,
        body: if include_body {
            Some(row.get("body"))
        } else {
            None
        },
        context: None,
    }
}
