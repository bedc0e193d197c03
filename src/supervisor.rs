//! Service lifecycle: owns the one outstanding indexer run and the
//! post-run status file.
//!
//! Starting a run cancels any previous run's token first, so at most one
//! indexer is ever making progress. After any run a best-effort status
//! summary is written next to the vector-store path; a partial
//! (single-server) run merges its per-server entries into the existing
//! summary instead of replacing it.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::context::RouterContext;
use crate::indexer::{run_indexer, run_indexer_for};
use crate::models::{IndexSummary, ServerIndexResult, StatusFile};

pub struct Supervisor {
    ctx: RouterContext,
    current: Mutex<Option<CancellationToken>>,
}

impl Supervisor {
    pub fn new(ctx: RouterContext) -> Self {
        Self {
            ctx,
            current: Mutex::new(None),
        }
    }

    /// Start a full indexing run, cancelling any run still outstanding.
    pub fn start(&self) -> JoinHandle<IndexSummary> {
        let cancel = self.swap_token();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let summary = run_indexer(&ctx, cancel).await;
            finish_run(&ctx, &summary, false).await;
            summary
        })
    }

    /// Re-index a single server, merging its result into the status file.
    pub fn start_partial(&self, server: ServerConfig) -> JoinHandle<IndexSummary> {
        let cancel = self.swap_token();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let summary = run_indexer_for(&ctx, std::slice::from_ref(&server), cancel).await;
            finish_run(&ctx, &summary, true).await;
            summary
        })
    }

    /// Signal and clear the outstanding run, if any.
    pub fn stop(&self) {
        if let Some(token) = self.current.lock().expect("token lock poisoned").take() {
            token.cancel();
        }
    }

    fn swap_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut current = self.current.lock().expect("token lock poisoned");
        if let Some(previous) = current.replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

async fn finish_run(ctx: &RouterContext, summary: &IndexSummary, merge: bool) {
    info!(
        indexed = summary.indexed,
        failed = summary.failed,
        servers = summary.servers.len(),
        "indexer run finished"
    );
    if let Err(e) = write_status(&ctx.settings.vector_db.path, &summary.servers, merge) {
        warn!(error = %e, "failed to write index status file");
    }
    if ctx.settings.indexer.generate_cli_artifacts {
        if let Err(e) = write_tools_artifact(ctx).await {
            warn!(error = %e, "failed to write tools artifact");
        }
    }
}

/// Status file lives next to the vector store.
pub fn status_path(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("index-status.json")
}

/// Write (or, for partial runs, merge) the per-server summary.
pub fn write_status(db_path: &Path, results: &[ServerIndexResult], merge: bool) -> Result<()> {
    let path = status_path(db_path);

    let mut servers = if merge {
        read_status(db_path)?.map(|s| s.servers).unwrap_or_default()
    } else {
        Vec::new()
    };

    for result in results {
        match servers.iter_mut().find(|s| s.name == result.name) {
            Some(existing) => *existing = result.clone(),
            None => servers.push(result.clone()),
        }
    }

    let status = StatusFile {
        timestamp: chrono::Utc::now().to_rfc3339(),
        servers,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&status)?)
        .with_context(|| format!("failed to write status file: {}", path.display()))?;
    Ok(())
}

/// Read the current status summary, if one has been written.
pub fn read_status(db_path: &Path) -> Result<Option<StatusFile>> {
    let path = status_path(db_path);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content).with_context(|| {
            format!("failed to parse status file: {}", path.display())
        })?)),
        Err(_) => Ok(None),
    }
}

/// Human-readable tool catalog, written when `generateCliArtifacts` is on.
async fn write_tools_artifact(ctx: &RouterContext) -> Result<()> {
    let tools = ctx.store.list_tools().await?;
    let path = ctx
        .settings
        .vector_db
        .path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("tools.md");

    let mut out = String::from("# Indexed tools\n");
    let mut current_server = String::new();
    for (server, tool, description) in &tools {
        if *server != current_server {
            current_server = server.clone();
            out.push_str(&format!("\n## {server}\n\n"));
        }
        if description.is_empty() {
            out.push_str(&format!("- `{tool}`\n"));
        } else {
            out.push_str(&format!("- `{tool}` — {description}\n"));
        }
    }

    std::fs::write(&path, out)
        .with_context(|| format!("failed to write tools artifact: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, indexed: u64, failed: u64) -> ServerIndexResult {
        ServerIndexResult {
            name: name.to_string(),
            indexed,
            failed,
            error: None,
        }
    }

    #[test]
    fn status_file_sits_next_to_the_store() {
        let path = status_path(Path::new("/var/state/tool-index.sqlite"));
        assert_eq!(path, PathBuf::from("/var/state/index-status.json"));
    }

    #[test]
    fn full_run_replaces_the_summary() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tool-index.sqlite");

        write_status(&db, &[result("fs", 3, 0), result("git", 2, 1)], false).unwrap();
        write_status(&db, &[result("fs", 4, 0)], false).unwrap();

        let status = read_status(&db).unwrap().unwrap();
        assert_eq!(status.servers.len(), 1);
        assert_eq!(status.servers[0].indexed, 4);
    }

    #[test]
    fn partial_run_merges_into_existing_summary() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tool-index.sqlite");

        write_status(&db, &[result("fs", 3, 0), result("git", 2, 1)], false).unwrap();
        write_status(&db, &[result("git", 5, 0)], true).unwrap();

        let status = read_status(&db).unwrap().unwrap();
        assert_eq!(status.servers.len(), 2);
        let git = status.servers.iter().find(|s| s.name == "git").unwrap();
        assert_eq!(git.indexed, 5);
        assert_eq!(git.failed, 0);
        let fs = status.servers.iter().find(|s| s.name == "fs").unwrap();
        assert_eq!(fs.indexed, 3);
    }

    #[test]
    fn merge_without_existing_file_still_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tool-index.sqlite");

        write_status(&db, &[result("solo", 1, 0)], true).unwrap();
        let status = read_status(&db).unwrap().unwrap();
        assert_eq!(status.servers.len(), 1);
    }

    #[test]
    fn status_is_pretty_printed_json() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tool-index.sqlite");
        write_status(&db, &[result("fs", 1, 0)], false).unwrap();

        let raw = std::fs::read_to_string(status_path(&db)).unwrap();
        assert!(raw.contains('\n'));
        assert!(raw.contains("\"timestamp\""));
    }
}
