//! MCP transport client: one session with one capability server.
//!
//! Wraps the rmcp client SDK behind the [`ToolTransport`] trait so the
//! indexer and the call operator stay testable without spawning real
//! servers. Three transports are supported:
//!
//! - **stdio** — spawn `command` with `args`, merging the server's `env`
//!   on top of the parent environment, and speak over standard streams.
//! - **sse** — connect to `url` as a server-sent-events client.
//! - **streamable-http** — connect to `url` with a streamable HTTP body.
//!
//! Configured `headers` attach to the initial request of both HTTP
//! transports. Sessions are never shared: each indexing attempt and each
//! dispatched call opens its own client and tears it down afterwards.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use rmcp::service::RunningService;
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{
    ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use rmcp::{RoleClient, ServiceExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{ServerConfig, TransportKind};
use crate::models::RemoteTool;

/// A single connect → interact → disconnect session.
#[async_trait]
pub trait ToolTransport: Send {
    /// Open the session, racing the handshake against `timeout` and `cancel`.
    async fn connect(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<()>;

    /// List the server's tools, normalizing missing fields.
    async fn list_tools(&mut self) -> Result<Vec<RemoteTool>>;

    /// Invoke a tool. Transport errors are wrapped into an error result,
    /// never propagated as `Err`.
    async fn call_tool(
        &mut self,
        name: &str,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult>;

    /// Tear down the session. Idempotent; never fails; safe to call from
    /// a cleanup path even when `connect` failed.
    async fn disconnect(&mut self);
}

/// Opens fresh transport sessions for server descriptors.
pub trait TransportFactory: Send + Sync {
    fn open(&self, server: &ServerConfig) -> Box<dyn ToolTransport>;
}

/// Production factory backed by the rmcp client SDK.
pub struct RmcpTransportFactory;

impl TransportFactory for RmcpTransportFactory {
    fn open(&self, server: &ServerConfig) -> Box<dyn ToolTransport> {
        Box::new(McpClient::new(server.clone()))
    }
}

/// rmcp-backed [`ToolTransport`].
pub struct McpClient {
    server: ServerConfig,
    service: Option<RunningService<RoleClient, ()>>,
}

impl McpClient {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            service: None,
        }
    }

    async fn open_service(&self) -> Result<RunningService<RoleClient, ()>> {
        match self.server.transport {
            TransportKind::Stdio => {
                let command = self
                    .server
                    .command
                    .as_ref()
                    .with_context(|| format!("server '{}' has no command", self.server.name))?;
                let transport = TokioChildProcess::new(Command::new(command).configure(|cmd| {
                    for arg in &self.server.args {
                        cmd.arg(arg);
                    }
                    for (key, value) in &self.server.env {
                        cmd.env(key, value);
                    }
                }))?;
                Ok(().serve(transport).await?)
            }
            TransportKind::Sse => {
                let url = self.require_url()?;
                let client = http_client(&self.server.headers)?;
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig {
                        sse_endpoint: url.into(),
                        ..Default::default()
                    },
                )
                .await?;
                Ok(().serve(transport).await?)
            }
            TransportKind::StreamableHttp => {
                let url = self.require_url()?;
                let client = http_client(&self.server.headers)?;
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig {
                        uri: url.into(),
                        ..Default::default()
                    },
                );
                Ok(().serve(transport).await?)
            }
        }
    }

    fn require_url(&self) -> Result<String> {
        self.server
            .url
            .clone()
            .with_context(|| format!("server '{}' has no url", self.server.name))
    }
}

#[async_trait]
impl ToolTransport for McpClient {
    async fn connect(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let service = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                bail!("connect to '{}' cancelled", self.server.name)
            }
            result = tokio::time::timeout(timeout, self.open_service()) => {
                result
                    .map_err(|_| {
                        anyhow!(
                            "connect to '{}' timed out after {}ms",
                            self.server.name,
                            timeout.as_millis()
                        )
                    })?
                    .with_context(|| format!("connect to '{}' failed", self.server.name))?
            }
        };
        self.service = Some(service);
        Ok(())
    }

    async fn list_tools(&mut self) -> Result<Vec<RemoteTool>> {
        let service = self
            .service
            .as_ref()
            .with_context(|| format!("server '{}' is not connected", self.server.name))?;

        let tools = service.list_all_tools().await?;
        Ok(tools
            .into_iter()
            .map(|tool| RemoteTool {
                name: tool.name.to_string(),
                description: tool
                    .description
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
            })
            .collect())
    }

    async fn call_tool(
        &mut self,
        name: &str,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult> {
        let service = self
            .service
            .as_ref()
            .with_context(|| format!("server '{}' is not connected", self.server.name))?;

        let result = service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(args),
            })
            .await;

        match result {
            Ok(result) => Ok(result),
            Err(e) => Ok(CallToolResult::error(vec![rmcp::model::Content::text(
                format!("tool '{name}' failed: {e}"),
            )])),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(service) = self.service.take() {
            let _ = service.cancel().await;
        }
    }
}

/// reqwest client carrying the server's configured headers on every request.
fn http_client(headers: &HashMap<String, String>) -> Result<reqwest::Client> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: '{name}'"))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header '{name:?}'"))?;
        map.insert(name, value);
    }
    Ok(reqwest::Client::builder().default_headers(map).build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_server() -> ServerConfig {
        ServerConfig {
            name: "fs".to_string(),
            transport: TransportKind::Stdio,
            command: Some("definitely-not-a-real-binary".to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_without_connect() {
        let mut client = McpClient::new(stdio_server());
        client.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn operations_require_a_connection() {
        let mut client = McpClient::new(stdio_server());
        assert!(client.list_tools().await.is_err());
        assert!(client
            .call_tool("x", serde_json::Map::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn pre_cancelled_connect_returns_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut client = McpClient::new(stdio_server());
        let started = std::time::Instant::now();
        let err = client
            .connect(Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn header_names_are_validated() {
        let mut headers = HashMap::new();
        headers.insert("X-Ok".to_string(), "yes".to_string());
        assert!(http_client(&headers).is_ok());

        headers.insert("bad header name".to_string(), "nope".to_string());
        assert!(http_client(&headers).is_err());
    }
}
