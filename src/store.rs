//! SQLite-backed vector store for the tool catalog.
//!
//! One logical table, `tool_entries`, keyed by the compound `tool_id`.
//! Vectors are stored as little-endian `f32` BLOBs and searched with a
//! brute-force squared-L2 scan; the catalog is small (hundreds of tools),
//! so a scan beats maintaining an ANN index.
//!
//! # Initialisation
//!
//! First use creates the table, inserts a sentinel row whose vector length
//! equals the currently resolved embedding dimension, records that
//! dimension in `store_meta`, and deletes the sentinel. An existing
//! table's recorded dimension is trusted as-is — no migration — but a
//! live-resolved dimension that disagrees fails fast so the operator
//! learns about the model change before inserts start bouncing.
//!
//! Initialisation is guarded by a [`OnceCell`], so concurrent first
//! callers share a single in-flight future.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::embedding::Embedder;
use crate::models::{ScoredEntry, ToolEntry};

const SENTINEL_ID: &str = "__sentinel__";

pub struct VectorStore {
    pool: SqlitePool,
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    init: OnceCell<usize>,
}

impl VectorStore {
    /// Open (or create) the store at `path`.
    ///
    /// Schema initialisation is deferred to first use so that opening the
    /// store never requires the embedding service.
    pub async fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory: {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            embedder,
            init: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The store's schema dimension, initialising the table on first call.
    pub async fn dimension(&self) -> Result<usize> {
        self.init
            .get_or_try_init(|| self.init_store())
            .await
            .map(|dims| *dims)
    }

    async fn init_store(&self) -> Result<usize> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'tool_entries'",
        )
        .fetch_optional(&self.pool)
        .await?;

        if exists.is_some() {
            let recorded: Option<String> =
                sqlx::query_scalar("SELECT value FROM store_meta WHERE key = 'dimension'")
                    .fetch_optional(&self.pool)
                    .await?;
            let dims: usize = recorded
                .with_context(|| {
                    format!(
                        "store at {} has no recorded dimension",
                        self.path.display()
                    )
                })?
                .parse()
                .context("stored dimension is not a number")?;

            if let Some(live) = self.embedder.dims() {
                if live != dims {
                    bail!(
                        "embedding model produces {live}-dim vectors but the store at {} \
                         was built with {dims}-dim vectors; delete the store and re-index",
                        self.path.display()
                    );
                }
            }
            return Ok(dims);
        }

        let dims = self.embedder.probe_dims().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tool_entries (
                tool_id         TEXT PRIMARY KEY,
                server_name     TEXT NOT NULL,
                tool_name       TEXT NOT NULL,
                description     TEXT NOT NULL,
                parameters_json TEXT NOT NULL,
                vector          BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tool_entries_server ON tool_entries(server_name)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS store_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.pool)
            .await?;

        // Sentinel row pins the schema dimension, then goes away.
        sqlx::query(
            "INSERT INTO tool_entries (tool_id, server_name, tool_name, description, parameters_json, vector) \
             VALUES (?, '', '', '', '', ?)",
        )
        .bind(SENTINEL_ID)
        .bind(vec_to_blob(&vec![0.0; dims]))
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM tool_entries WHERE tool_id = ?")
            .bind(SENTINEL_ID)
            .execute(&self.pool)
            .await?;

        sqlx::query("INSERT INTO store_meta (key, value) VALUES ('dimension', ?)")
            .bind(dims.to_string())
            .execute(&self.pool)
            .await?;

        Ok(dims)
    }

    /// Replace the row with the same `tool_id`, then insert the entry.
    ///
    /// The delete predicate goes through a bound parameter, so `tool_id`
    /// values containing single quotes round-trip correctly.
    pub async fn upsert_tool(&self, entry: &ToolEntry) -> Result<()> {
        self.dimension().await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tool_entries WHERE tool_id = ?")
            .bind(&entry.tool_id)
            .execute(&mut *tx)
            .await?;
        insert_entry(&mut tx, entry).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete all rows for one `(server, tool)` pair — every chunk.
    pub async fn delete_tool_chunks(&self, server: &str, tool: &str) -> Result<()> {
        self.dimension().await?;
        sqlx::query("DELETE FROM tool_entries WHERE server_name = ? AND tool_name = ?")
            .bind(server)
            .bind(tool)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Batch append without any delete. No-op on empty input.
    pub async fn add_tool_entries(&self, entries: &[ToolEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.dimension().await?;
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            insert_entry(&mut tx, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete all rows belonging to one server.
    pub async fn delete_server(&self, server: &str) -> Result<()> {
        self.dimension().await?;
        sqlx::query("DELETE FROM tool_entries WHERE server_name = ?")
            .bind(server)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_tools(&self) -> Result<u64> {
        self.dimension().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tool_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn count_tools_by_server(&self) -> Result<Vec<(String, u64)>> {
        self.dimension().await?;
        let rows = sqlx::query(
            "SELECT server_name, COUNT(*) AS n FROM tool_entries GROUP BY server_name ORDER BY server_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("server_name"), row.get::<i64, _>("n") as u64))
            .collect())
    }

    /// Distinct `(server, tool, description)` triples, for catalog listings.
    pub async fn list_tools(&self) -> Result<Vec<(String, String, String)>> {
        self.dimension().await?;
        let rows = sqlx::query(
            "SELECT DISTINCT server_name, tool_name, description FROM tool_entries \
             ORDER BY server_name, tool_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("server_name"),
                    row.get::<String, _>("tool_name"),
                    row.get::<String, _>("description"),
                )
            })
            .collect())
    }

    /// Nearest-neighbour search.
    ///
    /// Scans every row, scores it as `1/(1 + d)` for squared-L2 distance
    /// `d`, drops scores below `min_score`, and returns the best `top_k`
    /// in descending score order. Multiple chunks of the same tool may
    /// appear; the search operator deduplicates per `(server, tool)`.
    pub async fn search_tools(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredEntry>> {
        self.dimension().await?;
        let rows = sqlx::query(
            "SELECT tool_id, server_name, tool_name, description, parameters_json, vector \
             FROM tool_entries",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<ScoredEntry> = rows
            .into_iter()
            .filter_map(|row| {
                let vector = blob_to_vec(row.get::<Vec<u8>, _>("vector").as_slice());
                if vector.len() != query.len() {
                    return None;
                }
                let score = 1.0 / (1.0 + squared_l2(query, &vector));
                if score < min_score {
                    return None;
                }
                Some(ScoredEntry {
                    entry: ToolEntry {
                        tool_id: row.get("tool_id"),
                        server_name: row.get("server_name"),
                        tool_name: row.get("tool_name"),
                        description: row.get("description"),
                        parameters_json: row.get("parameters_json"),
                        vector,
                    },
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.tool_id.cmp(&b.entry.tool_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &ToolEntry,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO tool_entries (tool_id, server_name, tool_name, description, parameters_json, vector) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.tool_id)
    .bind(&entry.server_name)
    .bind(&entry.tool_name)
    .bind(&entry.description)
    .bind(&entry.parameters_json)
    .bind(vec_to_blob(&entry.vector))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Encode a float vector as little-endian `f32` bytes.
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

fn squared_l2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum()
}
