//! Semantic tool search: embed the query, scan the store, deduplicate,
//! rank, and render tool cards.
//!
//! The store returns chunk-level rows, so one tool may surface several
//! times; results collapse per `(server, tool)` keeping the best score.
//! To compensate, the store is over-fetched (`min(60, limit·3)`) before
//! deduplication — the same over-fetch-then-group shape used for
//! document search grouping.

use std::collections::HashMap;
use tracing::warn;

use crate::context::RouterContext;
use crate::models::ScoredEntry;

/// Hard ceiling on rows requested from the store per search.
const MAX_FETCH: usize = 60;
/// Schema JSON longer than this is cut with an ellipsis marker.
const MAX_SCHEMA_CHARS: usize = 2000;

/// Rendered outcome of one search invocation.
#[derive(Debug)]
pub struct SearchResponse {
    /// Full rendered card text (or the error card).
    pub text: String,
    /// Number of surviving tool cards.
    pub count: usize,
    /// Whether schemas were appended to the cards.
    pub include_schema: bool,
    /// True for invalid input or embedding failure.
    pub is_error: bool,
}

impl SearchResponse {
    fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            count: 0,
            include_schema: false,
            is_error: true,
        }
    }
}

/// Execute a search. `limit` is clamped to `[1, 20]`; `include_schema`
/// falls back to the configured default.
pub async fn run_search(
    ctx: &RouterContext,
    query: &str,
    limit: Option<i64>,
    include_schema: Option<bool>,
) -> SearchResponse {
    let query = query.trim();
    if query.is_empty() {
        return SearchResponse::error("A search query is required.");
    }

    let include_schema =
        include_schema.unwrap_or(ctx.settings.search.include_parameters_default);
    let limit = limit
        .map(|l| l.clamp(1, 20) as usize)
        .unwrap_or(ctx.settings.search.top_k);

    let query_vector = match ctx.embedder.embed(query).await {
        Ok(v) => v,
        Err(e) => {
            return SearchResponse::error(format!(
                "Tool search is unavailable: {e}. Start the embedding service and run \
                 the indexer again (`mcp-router index`) if the catalog is stale."
            ));
        }
    };

    let hits = match ctx
        .store
        .search_tools(&query_vector, fetch_limit(limit), ctx.settings.search.min_score)
        .await
    {
        Ok(hits) => hits,
        Err(e) => {
            warn!(error = %e, "vector store search failed");
            return SearchResponse::error(format!("Tool search failed: {e}"));
        }
    };

    let ranked = dedup_rank(hits, limit);
    if ranked.is_empty() {
        return SearchResponse {
            text: format!("No tools matched \"{query}\". Try rephrasing your query."),
            count: 0,
            include_schema,
            is_error: false,
        };
    }

    let mut text = format!("Found {} tools matching \"{query}\":\n", ranked.len());
    for (i, hit) in ranked.iter().enumerate() {
        text.push('\n');
        text.push_str(&render_card(i + 1, hit, include_schema));
    }

    SearchResponse {
        count: ranked.len(),
        text,
        include_schema,
        is_error: false,
    }
}

/// Rows to over-fetch from the store for a final result of `limit`.
fn fetch_limit(limit: usize) -> usize {
    (limit * 3).min(MAX_FETCH)
}

/// Collapse chunk-level hits per `(server, tool)` keeping the highest
/// score, then sort descending and truncate.
fn dedup_rank(hits: Vec<ScoredEntry>, limit: usize) -> Vec<ScoredEntry> {
    let mut best: HashMap<(String, String), ScoredEntry> = HashMap::new();
    for hit in hits {
        let key = (hit.entry.server_name.clone(), hit.entry.tool_name.clone());
        match best.get(&key) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }

    let mut ranked: Vec<ScoredEntry> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entry.tool_name.cmp(&b.entry.tool_name))
    });
    ranked.truncate(limit);
    ranked
}

fn render_card(index: usize, hit: &ScoredEntry, include_schema: bool) -> String {
    let entry = &hit.entry;
    let percent = (hit.score * 100.0).round() as i64;

    let mut card = format!(
        "{index}. {} — server: {} (score: {percent}%)\n",
        entry.tool_name, entry.server_name
    );
    if !entry.description.is_empty() {
        card.push_str(&format!("   {}\n", entry.description));
    }

    let signature = render_signature(&entry.parameters_json);
    if !signature.is_empty() {
        card.push_str("   signature:\n");
        for line in signature {
            card.push_str(&format!("     {line}\n"));
        }
    }

    card.push_str(&format!(
        "   invoke: mcp_call with tool_name=\"{}\"\n",
        entry.tool_name
    ));

    if include_schema {
        card.push_str(&format!(
            "   parameters: {}\n",
            truncate_chars(&entry.parameters_json, MAX_SCHEMA_CHARS)
        ));
    }
    card
}

/// Parse a JSON Schema object into `name: type` lines, with `?` marking
/// optional parameters. Unparseable or property-less schemas render
/// nothing.
fn render_signature(parameters_json: &str) -> Vec<String> {
    let Ok(schema) = serde_json::from_str::<serde_json::Value>(parameters_json) else {
        return Vec::new();
    };
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, spec)| {
            let ty = spec.get("type").and_then(|t| t.as_str()).unwrap_or("any");
            if required.contains(&name.as_str()) {
                format!("{name}: {ty}")
            } else {
                format!("{name}?: {ty}")
            }
        })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut} …")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolEntry;

    fn hit(server: &str, tool: &str, tool_id: &str, score: f64) -> ScoredEntry {
        ScoredEntry {
            entry: ToolEntry {
                tool_id: tool_id.to_string(),
                server_name: server.to_string(),
                tool_name: tool.to_string(),
                description: String::new(),
                parameters_json: "{}".to_string(),
                vector: Vec::new(),
            },
            score,
        }
    }

    #[test]
    fn fetch_limit_triples_and_caps() {
        assert_eq!(fetch_limit(5), 15);
        assert_eq!(fetch_limit(1), 3);
        assert_eq!(fetch_limit(20), 60);
    }

    #[test]
    fn dedup_keeps_best_chunk_per_tool() {
        let hits = vec![
            hit("fs", "read_file", "fs::read_file::chunk0", 0.85),
            hit("fs", "read_file", "fs::read_file::chunk1", 0.92),
            hit("git", "git_log", "git::git_log", 0.80),
        ];
        let ranked = dedup_rank(hits, 5);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].entry.tool_name, "read_file");
        assert!((ranked[0].score - 0.92).abs() < 1e-9);
        assert_eq!(ranked[1].entry.tool_name, "git_log");
    }

    #[test]
    fn dedup_keeps_same_name_on_different_servers_apart() {
        let hits = vec![
            hit("fs", "status", "fs::status", 0.9),
            hit("git", "status", "git::status", 0.8),
        ];
        assert_eq!(dedup_rank(hits, 5).len(), 2);
    }

    #[test]
    fn dedup_truncates_to_limit() {
        let hits = (0..10)
            .map(|i| hit("s", &format!("tool{i}"), &format!("s::tool{i}"), 0.5 + i as f64 / 100.0))
            .collect();
        let ranked = dedup_rank(hits, 3);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].entry.tool_name, "tool9");
    }

    #[test]
    fn signature_marks_optional_parameters() {
        let schema = r#"{
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "limit": { "type": "number" }
            },
            "required": ["path"]
        }"#;
        let lines = render_signature(schema);
        assert!(lines.contains(&"path: string".to_string()));
        assert!(lines.contains(&"limit?: number".to_string()));
    }

    #[test]
    fn signature_handles_garbage_schema() {
        assert!(render_signature("not json").is_empty());
        assert!(render_signature("{}").is_empty());
        assert!(render_signature("{\"properties\": 3}").is_empty());
    }

    #[test]
    fn schema_truncates_with_marker() {
        let long = format!("{{\"x\": \"{}\"}}", "y".repeat(5000));
        let cut = truncate_chars(&long, MAX_SCHEMA_CHARS);
        assert!(cut.chars().count() < long.chars().count());
        assert!(cut.ends_with(" …"));
    }

    #[test]
    fn card_renders_score_percent() {
        let card = render_card(1, &hit("fs", "read_file", "fs::read_file", 0.92), false);
        assert!(card.starts_with("1. read_file — server: fs (score: 92%)"));
        assert!(card.contains("mcp_call"));
        assert!(!card.contains("parameters:"));
    }

    #[test]
    fn card_appends_schema_on_request() {
        let mut with_schema = hit("fs", "read_file", "fs::read_file", 0.9);
        with_schema.entry.parameters_json =
            r#"{"type":"object","properties":{"path":{"type":"string"}}}"#.to_string();
        let card = render_card(1, &with_schema, true);
        assert!(card.contains("parameters: {\"type\":\"object\""));
    }
}
