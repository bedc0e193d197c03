//! Concurrent indexing of capability-server tool catalogs.
//!
//! One task per configured server, joined settle-all so a failing server
//! never cancels its peers. Each task retries its connection with capped
//! exponential backoff, then walks the server's tools sequentially:
//! chunk → embed → upsert, registering ownership as it goes.
//!
//! # Cancellation
//!
//! The run accepts a [`CancellationToken`]. It is observed before each
//! attempt, before each tool, before each chunk embedding, and inside the
//! backoff sleep; transport teardown runs on every exit path. A
//! pre-cancelled token finishes the run without waiting out any timeout
//! or backoff.
//!
//! # Failure policy
//!
//! Per-tool failures are warned and counted, never fatal to the server.
//! Connect failures are retried within the budget and become the server's
//! terminal `error` after the final attempt. Nothing propagates out of
//! the run except the aggregate summary.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::chunk_text;
use crate::config::ServerConfig;
use crate::context::RouterContext;
use crate::embedding::EmbeddingError;
use crate::models::{IndexSummary, RemoteTool, ServerIndexResult, ToolEntry};
use crate::transport::ToolTransport;

/// Index every configured server concurrently.
pub async fn run_indexer(ctx: &RouterContext, cancel: CancellationToken) -> IndexSummary {
    let servers = ctx.settings.servers.clone();
    run_indexer_for(ctx, &servers, cancel).await
}

/// Index the given subset of servers (single-server partial re-index uses
/// a one-element slice).
pub async fn run_indexer_for(
    ctx: &RouterContext,
    servers: &[ServerConfig],
    cancel: CancellationToken,
) -> IndexSummary {
    let mut tasks = JoinSet::new();
    for server in servers {
        let ctx = ctx.clone();
        let server = server.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { index_server(&ctx, &server, &cancel).await });
    }

    let mut results = Vec::with_capacity(servers.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => results.push(ServerIndexResult {
                name: "<unknown>".to_string(),
                indexed: 0,
                failed: 1,
                error: Some(format!("indexing task panicked: {e}")),
            }),
        }
    }
    results.sort_by(|a, b| a.name.cmp(&b.name));
    IndexSummary::from_servers(results)
}

/// Index one server with the retry budget, settling to a result.
async fn index_server(
    ctx: &RouterContext,
    server: &ServerConfig,
    cancel: &CancellationToken,
) -> ServerIndexResult {
    let retry = &ctx.settings.indexer;
    let timeout = Duration::from_millis(server.timeout_ms.unwrap_or(retry.connect_timeout));

    for attempt in 0..=retry.max_retries {
        if cancel.is_cancelled() {
            return cancelled_result(server);
        }

        if attempt > 0 {
            let delay = backoff_delay(attempt, retry.initial_retry_delay, retry.max_retry_delay);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled_result(server),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut client = ctx.transports.open(server);
        let connected = connect_attempt(ctx, client.as_mut(), timeout, cancel).await;

        match connected {
            Err(e) => {
                client.disconnect().await;
                if cancel.is_cancelled() {
                    return cancelled_result(server);
                }
                if attempt == retry.max_retries {
                    if is_embedding_unreachable(&e) {
                        warn!(
                            server = %server.name,
                            error = %e,
                            "failed to index server; the embedding service is unavailable — \
                             start it and run the indexer again"
                        );
                    } else {
                        warn!(server = %server.name, error = %e, "failed to index server");
                    }
                    return ServerIndexResult {
                        name: server.name.clone(),
                        indexed: 0,
                        failed: 1,
                        error: Some(e.to_string()),
                    };
                }
                debug!(
                    server = %server.name,
                    attempt,
                    error = %e,
                    "server not ready — retrying"
                );
            }
            Ok(()) => {
                ctx.registry.register_server(server);
                let outcome = index_tools(ctx, server, client.as_mut(), cancel).await;
                client.disconnect().await;
                return match outcome {
                    Ok((indexed, failed)) => ServerIndexResult {
                        name: server.name.clone(),
                        indexed,
                        failed,
                        error: None,
                    },
                    Err(_) if cancel.is_cancelled() => cancelled_result(server),
                    Err(e) => {
                        warn!(server = %server.name, error = %e, "failed to index server");
                        ServerIndexResult {
                            name: server.name.clone(),
                            indexed: 0,
                            failed: 1,
                            error: Some(e.to_string()),
                        }
                    }
                };
            }
        }
    }

    // The loop always returns from its final attempt.
    cancelled_result(server)
}

/// One connection attempt. Resolving the store dimension first means an
/// unreachable embedding service surfaces here as a retryable fault with
/// the right category, instead of failing every tool later.
async fn connect_attempt(
    ctx: &RouterContext,
    client: &mut dyn ToolTransport,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    ctx.store.dimension().await?;
    client.connect(timeout, cancel).await?;
    Ok(())
}

/// Walk the server's tools in listing order.
async fn index_tools(
    ctx: &RouterContext,
    server: &ServerConfig,
    client: &mut dyn ToolTransport,
    cancel: &CancellationToken,
) -> Result<(u64, u64)> {
    let tools = client.list_tools().await?;
    let mut indexed = 0u64;
    let mut failed = 0u64;

    for tool in &tools {
        if cancel.is_cancelled() {
            bail!("indexing cancelled");
        }
        match index_tool(ctx, server, tool, cancel).await {
            Ok(()) => {
                ctx.registry.register_tool_owner(&tool.name, &server.name);
                indexed += 1;
            }
            Err(e) if cancel.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(
                    server = %server.name,
                    tool = %tool.name,
                    error = %e,
                    "failed to index tool"
                );
                failed += 1;
            }
        }
    }

    Ok((indexed, failed))
}

/// Chunk, embed, and store one tool.
///
/// Single-chunk descriptions use the delete-by-id upsert; multi-chunk
/// descriptions delete the whole `(server, tool)` chunk set first, then
/// append the fresh batch, so no orphan chunks from a previous run
/// survive a re-index.
async fn index_tool(
    ctx: &RouterContext,
    server: &ServerConfig,
    tool: &RemoteTool,
    cancel: &CancellationToken,
) -> Result<()> {
    let retry = &ctx.settings.indexer;
    let text = embedding_text(tool);
    let chunks = chunk_text(&text, &tool.name, retry.max_chunk_chars, retry.overlap_chars);
    let parameters_json =
        serde_json::to_string(&tool.input_schema).context("failed to serialize input schema")?;

    if chunks.len() == 1 {
        if cancel.is_cancelled() {
            bail!("indexing cancelled");
        }
        let vector = ctx.embedder.embed(&chunks[0].text).await?;
        ctx.store
            .upsert_tool(&ToolEntry {
                tool_id: ToolEntry::single_id(&server.name, &tool.name),
                server_name: server.name.clone(),
                tool_name: tool.name.clone(),
                description: tool.description.clone(),
                parameters_json,
                vector,
            })
            .await?;
        return Ok(());
    }

    ctx.store
        .delete_tool_chunks(&server.name, &tool.name)
        .await?;

    let mut batch = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        if cancel.is_cancelled() {
            bail!("indexing cancelled");
        }
        let vector = ctx.embedder.embed(&chunk.text).await?;
        batch.push(ToolEntry {
            tool_id: ToolEntry::chunk_id(&server.name, &tool.name, chunk.index),
            server_name: server.name.clone(),
            tool_name: tool.name.clone(),
            description: tool.description.clone(),
            parameters_json: parameters_json.clone(),
            vector,
        });
    }
    ctx.store.add_tool_entries(&batch).await?;
    Ok(())
}

/// Text handed to the chunker: name-prefixed so the first chunk carries
/// the tool name just like the continuation prefix does for later ones.
fn embedding_text(tool: &RemoteTool) -> String {
    if tool.description.is_empty() {
        tool.name.clone()
    } else {
        format!("{}: {}", tool.name, tool.description)
    }
}

/// Exponential backoff with cap: `min(initial · 2^(attempt-1), max)`.
fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64 << (attempt - 1).min(20);
    Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
}

fn cancelled_result(server: &ServerConfig) -> ServerIndexResult {
    ServerIndexResult {
        name: server.name.clone(),
        indexed: 0,
        failed: 1,
        error: Some("cancelled".to_string()),
    }
}

/// True when the error chain bottoms out in an unreachable embedding
/// service, which merits the re-index hint instead of a generic failure.
fn is_embedding_unreachable(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<EmbeddingError>(),
            Some(EmbeddingError::Unreachable { .. })
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1, 2000, 30_000), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2, 2000, 30_000), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3, 2000, 30_000), Duration::from_millis(8000));
        assert_eq!(backoff_delay(5, 2000, 30_000), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(40, 2000, 30_000), Duration::from_millis(30_000));
    }

    #[test]
    fn embedding_unreachable_is_detected_through_context() {
        let base: anyhow::Error = EmbeddingError::Unreachable {
            base_url: "http://localhost:11434/v1".to_string(),
            message: "connection refused".to_string(),
        }
        .into();
        let wrapped = base.context("store initialisation failed");
        assert!(is_embedding_unreachable(&wrapped));

        let other = anyhow::anyhow!("plain connect failure");
        assert!(!is_embedding_unreachable(&other));
    }

    #[test]
    fn embedding_text_prefixes_the_tool_name() {
        let tool = RemoteTool {
            name: "read_file".to_string(),
            description: "Read a file from disk".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        assert_eq!(embedding_text(&tool), "read_file: Read a file from disk");

        let bare = RemoteTool {
            name: "ping".to_string(),
            description: String::new(),
            input_schema: serde_json::json!({}),
        };
        assert_eq!(embedding_text(&bare), "ping");
    }
}
