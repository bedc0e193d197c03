//! Call operator: resolve a tool's owning server and dispatch to it over
//! a fresh transport session.
//!
//! Invalid caller input (empty name, non-object params) comes back as an
//! error result, never as a warning in the logs. Transport teardown runs
//! on every path, including failed connects.

use rmcp::model::{CallToolResult, Content};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::context::RouterContext;

/// Dispatch `tool_name` with the given JSON-object payload.
///
/// `params_json` defaults to `"{}"` and must decode to a JSON object —
/// arrays and `null` are rejected.
pub async fn run_call(
    ctx: &RouterContext,
    tool_name: &str,
    params_json: Option<&str>,
) -> CallToolResult {
    let tool_name = tool_name.trim();
    if tool_name.is_empty() {
        return error_card("tool_name is required");
    }

    let params = match parse_params(params_json.unwrap_or("{}")) {
        Ok(params) => params,
        Err(message) => return error_card(&message),
    };

    let Some(server) = ctx.registry.resolve_server(tool_name) else {
        return error_card(&format!(
            "Unknown tool '{tool_name}'. Use mcp_search to discover available tools first."
        ));
    };

    let timeout = Duration::from_millis(ctx.settings.indexer.connect_timeout);
    let cancel = CancellationToken::new();
    let mut client = ctx.transports.open(&server);

    let result = async {
        client.connect(timeout, &cancel).await?;
        client.call_tool(tool_name, params).await
    }
    .await;
    client.disconnect().await;

    match result {
        Ok(result) => result,
        Err(e) => {
            warn!(tool = tool_name, server = %server.name, error = %e, "tool call failed");
            error_card(&format!(
                "Failed to call '{tool_name}' on server '{}': {e}",
                server.name
            ))
        }
    }
}

/// Decode the params payload, requiring a JSON object.
fn parse_params(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "invalid params_json: expected a JSON object, got {}",
            json_kind(&other)
        )),
        Err(e) => Err(format!("invalid params_json: {e}")),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn error_card(message: &str) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.to_string())])
}
