//! Core data models used throughout the router.
//!
//! These types represent the tool catalog entries, chunks, and indexing
//! results that flow through the pipeline. The data lifecycle is:
//!
//! ```text
//! McpClient → RemoteTool → chunk() → ToolChunk
//!                                        ↓
//!                                   embed() → ToolEntry → VectorStore
//!                                        ↓
//!                              search_tools() → ScoredEntry
//! ```
//!
//! Per-server outcomes are aggregated into an [`IndexSummary`] and
//! persisted as a [`StatusFile`] next to the vector store.

use serde::{Deserialize, Serialize};

/// A tool advertised by a remote capability server.
///
/// Produced by `list_tools` on a transport session. A missing description
/// is normalized to an empty string and a missing input schema to an
/// empty JSON object, so downstream code never handles absence.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    /// Tool name as advertised by the server.
    pub name: String,
    /// Human-readable description (may be empty).
    pub description: String,
    /// JSON Schema for the tool's input, always an object.
    pub input_schema: serde_json::Value,
}

/// A row stored in the vector database.
///
/// Identified by a stable compound `tool_id`:
///
/// - single-chunk description: `"{server}::{tool}"`
/// - multi-chunk description: `"{server}::{tool}::chunk{i}"` (zero-based)
///
/// All rows of one `(server_name, tool_name)` pair share the same
/// `description` and `parameters_json`; only the vectors differ.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolEntry {
    /// Stable compound key.
    pub tool_id: String,
    /// Name of the owning server.
    pub server_name: String,
    /// Tool name within the server.
    pub tool_name: String,
    /// Full original description (identical across chunks).
    pub description: String,
    /// Input schema serialized as a JSON string (identical across chunks).
    pub parameters_json: String,
    /// Fixed-length embedding; length equals the store's schema dimension.
    pub vector: Vec<f32>,
}

impl ToolEntry {
    /// Compound key for a single-chunk entry.
    pub fn single_id(server: &str, tool: &str) -> String {
        format!("{server}::{tool}")
    }

    /// Compound key for chunk `index` of a multi-chunk entry.
    pub fn chunk_id(server: &str, tool: &str, index: usize) -> String {
        format!("{server}::{tool}::chunk{index}")
    }
}

/// A bounded slice of a tool's embedding text.
///
/// Transient: lives only for the duration of one tool-indexing step.
/// Chunks after the first carry a continuation prefix so the embedding
/// model always sees the tool name.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolChunk {
    /// Zero-based position within the chunk sequence.
    pub index: usize,
    /// Total number of chunks produced for this text.
    pub total: usize,
    /// Chunk text content.
    pub text: String,
}

/// A search hit returned by the vector store.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    /// The stored row.
    pub entry: ToolEntry,
    /// Similarity in `(0, 1]`, derived from squared-L2 distance `d` as `1/(1+d)`.
    pub score: f64,
}

/// Per-server outcome of one indexing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIndexResult {
    /// Server name.
    pub name: String,
    /// Tools successfully indexed.
    pub indexed: u64,
    /// Tools (or the whole server, on terminal connect failure) that failed.
    pub failed: u64,
    /// Terminal error for the server, when the run never reached the tool loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of a full indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexSummary {
    /// Total tools indexed across all servers.
    pub indexed: u64,
    /// Total failures across all servers.
    pub failed: u64,
    /// Per-server detail.
    pub servers: Vec<ServerIndexResult>,
}

impl IndexSummary {
    /// Fold per-server results into aggregate counters.
    pub fn from_servers(servers: Vec<ServerIndexResult>) -> Self {
        let indexed = servers.iter().map(|s| s.indexed).sum();
        let failed = servers.iter().map(|s| s.failed).sum();
        Self {
            indexed,
            failed,
            servers,
        }
    }
}

/// Status summary written next to the vector store after each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    /// RFC 3339 timestamp of the run that produced (or last merged into) the file.
    pub timestamp: String,
    /// Per-server results; partial runs merge into the existing list.
    pub servers: Vec<ServerIndexResult>,
}
