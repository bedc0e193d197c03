//! # MCP Router CLI (`mcp-router`)
//!
//! The `mcp-router` binary is the primary interface for the tool router.
//! It provides commands for indexing server catalogs, searching and
//! calling tools, serving the MCP surface, and managing the configured
//! server list.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mcp-router index` | Index every configured server's tool catalog |
//! | `mcp-router index --server NAME` | Re-index a single server (merged status) |
//! | `mcp-router search "<query>"` | Semantic search over the indexed catalog |
//! | `mcp-router call <tool> --params '<json>'` | Invoke a tool on its owning server |
//! | `mcp-router serve` | Index at startup, then serve `mcp_search`/`mcp_call` over stdio |
//! | `mcp-router serve --http 127.0.0.1:7373` | Serve over streamable HTTP instead |
//! | `mcp-router status` | Print the last indexing status summary |
//! | `mcp-router servers <list\|enable\|disable\|remove>` | Manage the configured server list |
//!
//! Configuration comes from `CONFIG_PATH`, falling back to
//! `STATE_DIR/config.json`, then `~/.mcp-router/config.json`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_router::config::{config_path, Settings};
use mcp_router::context::RouterContext;
use mcp_router::search::run_search;
use mcp_router::server::{serve_http, serve_stdio, RouterServer};
use mcp_router::supervisor::{read_status, Supervisor};
use mcp_router::{call, models::IndexSummary};

/// MCP Router — dynamic tool discovery for MCP servers.
#[derive(Parser)]
#[command(
    name = "mcp-router",
    about = "Dynamic tool-discovery router for MCP servers",
    version,
    long_about = "Indexes the tool catalogs of your configured MCP servers into a local \
    vector store and exposes two meta-tools, mcp_search and mcp_call, so agent hosts can \
    discover and invoke tools on demand instead of loading every schema up front."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index configured servers' tool catalogs into the vector store.
    ///
    /// Connects to every enabled server concurrently, embeds each tool's
    /// description, and writes a status summary next to the store.
    Index {
        /// Re-index only this server; its entry is merged into the
        /// existing status summary.
        #[arg(long)]
        server: Option<String>,
    },

    /// Search the indexed tool catalog by semantic similarity.
    Search {
        /// Natural-language description of the capability you need.
        query: String,

        /// Maximum number of results (clamped to 1-20).
        #[arg(long)]
        limit: Option<i64>,

        /// Include each tool's full parameter schema in the results.
        #[arg(long)]
        schema: bool,
    },

    /// Invoke an indexed tool on its owning server.
    Call {
        /// Exact tool name, as returned by search.
        tool_name: String,

        /// Tool arguments as a JSON object string (defaults to "{}").
        #[arg(long)]
        params: Option<String>,
    },

    /// Start the MCP surface, indexing the catalog at startup.
    ///
    /// Defaults to stdio (the standard host integration). Logging goes to
    /// stderr so stdout stays clean for the protocol.
    Serve {
        /// Serve over streamable HTTP on this address instead of stdio.
        #[arg(long)]
        http: Option<String>,
    },

    /// Print the status summary of the last indexing run.
    Status,

    /// Manage the configured server list.
    Servers {
        #[command(subcommand)]
        action: ServersAction,
    },
}

/// Server-list management subcommands.
///
/// These edit the `mcpServers` map in the configuration file in place.
/// Exit code 1 when the named server does not exist.
#[derive(Subcommand)]
enum ServersAction {
    /// List configured servers and their transports.
    List,
    /// Clear a server's disabled flag.
    Enable { name: String },
    /// Mark a server disabled (excluded from indexing).
    Disable { name: String },
    /// Remove a server from the configuration.
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_router=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index { server } => cmd_index(server).await,
        Commands::Search {
            query,
            limit,
            schema,
        } => cmd_search(&query, limit, schema).await,
        Commands::Call { tool_name, params } => cmd_call(&tool_name, params.as_deref()).await,
        Commands::Serve { http } => cmd_serve(http.as_deref()).await,
        Commands::Status => cmd_status(),
        Commands::Servers { action } => cmd_servers(action),
    }
}

async fn cmd_index(server: Option<String>) -> Result<()> {
    let settings = Settings::load()?;
    let ctx = RouterContext::from_settings(settings).await?;
    let supervisor = Supervisor::new(ctx.clone());

    let handle = match server {
        Some(name) => {
            let server = ctx
                .settings
                .server(&name)
                .cloned()
                .with_context(|| format!("server '{name}' is not configured"))?;
            supervisor.start_partial(server)
        }
        None => supervisor.start(),
    };

    let summary = handle.await.context("indexer task failed")?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &IndexSummary) {
    println!("index");
    println!("  indexed: {} tools", summary.indexed);
    println!("  failed:  {}", summary.failed);
    for server in &summary.servers {
        match &server.error {
            Some(error) => println!("  {} — error: {}", server.name, error),
            None => println!(
                "  {} — {} indexed, {} failed",
                server.name, server.indexed, server.failed
            ),
        }
    }
}

async fn cmd_search(query: &str, limit: Option<i64>, schema: bool) -> Result<()> {
    let settings = Settings::load()?;
    let ctx = RouterContext::from_settings(settings).await?;

    let response = run_search(&ctx, query, limit, if schema { Some(true) } else { None }).await;
    println!("{}", response.text);
    Ok(())
}

async fn cmd_call(tool_name: &str, params: Option<&str>) -> Result<()> {
    let settings = Settings::load()?;
    let ctx = RouterContext::from_settings(settings).await?;
    ctx.hydrate_registry().await?;

    let result = call::run_call(&ctx, tool_name, params).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_serve(http: Option<&str>) -> Result<()> {
    let settings = Settings::load()?;
    let ctx = RouterContext::from_settings(settings).await?;

    // Serve a possibly-stale catalog right away; the startup index run
    // refreshes it in the background.
    if let Err(e) = ctx.hydrate_registry().await {
        tracing::warn!(error = %e, "could not hydrate registry from the existing catalog");
    }

    let supervisor = Arc::new(Supervisor::new(ctx.clone()));
    let _run = supervisor.start();

    let server = RouterServer::new(ctx);
    let result = match http {
        Some(bind) => serve_http(server, bind).await,
        None => serve_stdio(server).await,
    };
    supervisor.stop();
    result
}

fn cmd_status() -> Result<()> {
    let settings = Settings::load()?;
    match read_status(&settings.vector_db.path)? {
        Some(status) => {
            println!("last run: {}", status.timestamp);
            for server in &status.servers {
                match &server.error {
                    Some(error) => println!("  {} — error: {}", server.name, error),
                    None => println!(
                        "  {} — {} indexed, {} failed",
                        server.name, server.indexed, server.failed
                    ),
                }
            }
        }
        None => println!("no indexing run recorded yet"),
    }
    Ok(())
}

/// Edit the `mcpServers` map of the config file in place.
fn cmd_servers(action: ServersAction) -> Result<()> {
    let path = config_path();
    let mut root: serde_json::Value = match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?,
        Err(_) => serde_json::json!({}),
    };

    match action {
        ServersAction::List => {
            let servers = root.get("mcpServers").and_then(|v| v.as_object());
            match servers {
                Some(map) if !map.is_empty() => {
                    for (name, entry) in map {
                        let disabled = entry
                            .get("disabled")
                            .and_then(|d| d.as_bool())
                            .unwrap_or(false);
                        let target = entry
                            .get("command")
                            .or_else(|| entry.get("url"))
                            .or_else(|| entry.get("serverUrl"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("?");
                        let flag = if disabled { " [disabled]" } else { "" };
                        println!("  {name} — {target}{flag}");
                    }
                }
                _ => println!("no servers configured"),
            }
            return Ok(());
        }
        ServersAction::Enable { name } => {
            let Some(entry) = server_entry_mut(&mut root, &name) else {
                eprintln!("server '{name}' not found");
                std::process::exit(1);
            };
            entry.remove("disabled");
            println!("enabled '{name}'");
        }
        ServersAction::Disable { name } => {
            let Some(entry) = server_entry_mut(&mut root, &name) else {
                eprintln!("server '{name}' not found");
                std::process::exit(1);
            };
            entry.insert("disabled".to_string(), serde_json::Value::Bool(true));
            println!("disabled '{name}'");
        }
        ServersAction::Remove { name } => {
            let removed = root
                .get_mut("mcpServers")
                .and_then(|v| v.as_object_mut())
                .and_then(|map| map.remove(&name));
            if removed.is_none() {
                eprintln!("server '{name}' not found");
                std::process::exit(1);
            }
            println!("removed '{name}'");
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&root)?)
        .with_context(|| format!("failed to write config file: {}", path.display()))?;
    Ok(())
}

fn server_entry_mut<'a>(
    root: &'a mut serde_json::Value,
    name: &str,
) -> Option<&'a mut serde_json::Map<String, serde_json::Value>> {
    root.get_mut("mcpServers")?
        .as_object_mut()?
        .get_mut(name)?
        .as_object_mut()
}
