//! MCP surface of the router.
//!
//! Exposes exactly two meta-tools instead of every downstream schema:
//!
//! - `mcp_search` — semantic retrieval over the indexed tool catalog.
//! - `mcp_call` — dispatch a chosen tool to its owning server.
//!
//! Served over stdio (the standard host integration) or streamable HTTP.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::call::run_call;
use crate::context::RouterContext;
use crate::search::run_search;

/// Parameters for the `mcp_search` meta-tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Natural-language description of the capability you need.
    pub query: String,

    /// Maximum number of results, clamped to 1–20.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,

    /// Include each tool's full parameter schema in the result cards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_schema: Option<bool>,
}

/// Parameters for the `mcp_call` meta-tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CallParams {
    /// Exact tool name, as returned by mcp_search.
    pub tool_name: String,

    /// Tool arguments as a JSON object string. Defaults to "{}".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_json: Option<String>,
}

/// The router's MCP server.
///
/// Every session shares the same [`RouterContext`] (all components are
/// behind `Arc`), so catalog and registry state is shared across
/// connections.
#[derive(Clone)]
pub struct RouterServer {
    ctx: RouterContext,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl RouterServer {
    pub fn new(ctx: RouterContext) -> Self {
        Self {
            ctx,
            tool_router: Self::tool_router(),
        }
    }

    /// Semantic search over the indexed tool catalog.
    #[tool(
        name = "mcp_search",
        description = "Search the indexed MCP tool catalog by semantic similarity. Returns ranked tool cards with name, owning server, match score, description, and call signature. Use this before mcp_call to discover which tool to invoke."
    )]
    async fn mcp_search(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let response = run_search(
            &self.ctx,
            &params.query,
            params.limit,
            params.include_schema,
        )
        .await;

        let content = vec![Content::text(response.text)];
        Ok(if response.is_error {
            CallToolResult::error(content)
        } else {
            CallToolResult::success(content)
        })
    }

    /// Dispatch a tool call to the server that owns it.
    #[tool(
        name = "mcp_call",
        description = "Invoke a tool discovered via mcp_search. Opens a session to the tool's owning MCP server, forwards the call, and relays the result. params_json must be a JSON object string matching the tool's signature."
    )]
    async fn mcp_call(
        &self,
        Parameters(params): Parameters<CallParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(run_call(&self.ctx, &params.tool_name, params.params_json.as_deref()).await)
    }
}

#[tool_handler]
impl ServerHandler for RouterServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "mcp-router".to_string(),
                title: Some("MCP Tool Router".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Dynamic tool discovery router. Instead of loading every MCP server's \
                 full schema, use mcp_search to find relevant tools by describing what \
                 you need, then mcp_call to invoke the chosen tool on its owning server."
                    .to_string(),
            ),
        }
    }
}

/// Serve over stdio. The host reads JSON-RPC from our stdout, so all
/// logging must go to stderr.
pub async fn serve_stdio(server: RouterServer) -> anyhow::Result<()> {
    let service = server.serve(rmcp::transport::io::stdio()).await?;
    service.waiting().await?;
    Ok(())
}

/// Serve over streamable HTTP at `http://{bind}/mcp`.
pub async fn serve_http(server: RouterServer, bind: &str) -> anyhow::Result<()> {
    use rmcp::transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    };

    let ct = tokio_util::sync::CancellationToken::new();

    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "MCP router listening on /mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            ct.cancel();
        })
        .await?;

    Ok(())
}
