//! Persistent embedding cache.
//!
//! Keys are `(content hash, model id)`, so one store can hold vectors for several models side by
//! side. Rows are insert-or-ignore: once a vector is stored for a key it never changes, which
//! keeps a model's vector space stable across concurrent index builds.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, error};

use crate::error::{CacheError, CacheResult};
use crate::textutil::content_hash;

/// SQLite's default parameter limit is 999; stay under it with room for the model id.
const MAX_KEYS_PER_QUERY: usize = 900;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    hash TEXT NOT NULL,
    model_id TEXT NOT NULL,
    vector BLOB NOT NULL,
    PRIMARY KEY (hash, model_id)
);
CREATE TABLE IF NOT EXISTS model_dims (
    model_id TEXT PRIMARY KEY,
    dim INTEGER NOT NULL
);
";

pub struct EmbeddingCache {
    conn: Mutex<Connection>,
}

impl EmbeddingCache {
    pub fn open(path: &Path) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> CacheResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> CacheResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CacheError::Poisoned)
    }

    /// Looks up cached vectors for `texts`. Failures are logged and reported as misses.
    #[must_use]
    pub fn get_vectors(&self, texts: &[String], model_id: &str) -> HashMap<String, Vec<f32>> {
        match self.try_get_vectors(texts, model_id) {
            Ok(found) => found,
            Err(e) => {
                error!(model_id, error = %e, "embedding cache read failed; treating as miss");
                HashMap::new()
            }
        }
    }

    pub fn try_get_vectors(
        &self,
        texts: &[String],
        model_id: &str,
    ) -> CacheResult<HashMap<String, Vec<f32>>> {
        let mut by_hash: HashMap<String, Vec<&String>> = HashMap::new();
        for t in texts {
            by_hash.entry(content_hash(t)).or_default().push(t);
        }
        let hashes: Vec<&String> = by_hash.keys().collect();

        let mut out = HashMap::new();
        let conn = self.lock()?;
        for chunk in hashes.chunks(MAX_KEYS_PER_QUERY) {
            let marks = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT hash, vector FROM embeddings WHERE model_id = ? AND hash IN ({marks})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let args = std::iter::once(model_id).chain(chunk.iter().map(|h| h.as_str()));
            let rows = stmt.query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (hash, blob) = row?;
                let vector = blob_to_vector(&blob)?;
                if let Some(owners) = by_hash.get(&hash) {
                    for text in owners {
                        out.insert((*text).clone(), vector.clone());
                    }
                }
            }
        }
        debug!(model_id, requested = texts.len(), hits = out.len(), "embedding cache lookup");
        Ok(out)
    }

    /// Stores vectors that are not cached yet. Returns how many rows were inserted; failures are
    /// logged and count as zero.
    pub fn save_vectors(&self, vectors: &HashMap<String, Vec<f32>>, model_id: &str) -> usize {
        match self.try_save_vectors(vectors, model_id) {
            Ok(n) => n,
            Err(e) => {
                error!(model_id, error = %e, "embedding cache write failed");
                0
            }
        }
    }

    pub fn try_save_vectors(
        &self,
        vectors: &HashMap<String, Vec<f32>>,
        model_id: &str,
    ) -> CacheResult<usize> {
        if vectors.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO embeddings (hash, model_id, vector) VALUES (?1, ?2, ?3)",
            )?;
            for (text, vector) in vectors {
                inserted += stmt.execute(params![content_hash(text), model_id, vector_to_blob(vector)])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn recorded_dim(&self, model_id: &str) -> CacheResult<Option<usize>> {
        let conn = self.lock()?;
        let dim: Option<i64> = conn
            .query_row(
                "SELECT dim FROM model_dims WHERE model_id = ?1",
                params![model_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(dim.and_then(|d| usize::try_from(d).ok()))
    }

    /// Records the dimension for `model_id` unless one is already recorded.
    pub fn record_dim(&self, model_id: &str, dim: usize) -> CacheResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO model_dims (model_id, dim) VALUES (?1, ?2)",
            params![model_id, dim as i64],
        )?;
        Ok(())
    }

    pub fn count(&self, model_id: &str) -> CacheResult<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE model_id = ?1",
            params![model_id],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    pub fn clear_model(&self, model_id: &str) -> CacheResult<usize> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM embeddings WHERE model_id = ?1", params![model_id])?;
        conn.execute("DELETE FROM model_dims WHERE model_id = ?1", params![model_id])?;
        Ok(n)
    }

    pub fn clear_all(&self) -> CacheResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM embeddings; DELETE FROM model_dims;")?;
        Ok(())
    }
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> CacheResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(CacheError::CorruptVector { len: blob.len() });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
