//! Layered configuration resolution.
//!
//! The host hands the router a JSON configuration tree. `resolve` merges
//! the layered server sources into a validated, typed [`Settings`]:
//!
//! 1. `mcpServersFile` — external JSON file, either a bare `{name → entry}`
//!    map or an `{"mcpServers": {…}}` wrapper.
//! 2. `mcpServers` — inline map; wins on name collision (including a
//!    disabled inline entry hiding a file-based enable).
//! 3. `servers` — legacy positional array, consulted only when neither of
//!    the above contributed any entry.
//!
//! Disabled entries are dropped during parsing. `${NAME}` tokens inside
//! `env` and `headers` values are expanded from the process environment
//! (empty string when unset), and a leading `~/` in paths expands to the
//! user's home directory.
//!
//! Malformed input fails the entire resolution; *missing* input is treated
//! as empty — the router may start with zero servers.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Default local OpenAI-compatible embedding endpoint.
pub const DEFAULT_EMBEDDING_BASE_URL: &str = "http://localhost:11434/v1";
/// Default embedding model served by the default endpoint.
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// How a session to a capability server is transported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Spawn `command` and speak over its standard streams.
    Stdio,
    /// Server-sent events endpoint.
    Sse,
    /// Streamable HTTP endpoint.
    StreamableHttp,
}

impl TransportKind {
    /// Parse an explicit `type` value, accepting the common aliases.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stdio" | "childproc" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "streamable-http" | "streaming-http" | "http" => Ok(Self::StreamableHttp),
            other => bail!("unknown transport type: '{other}'"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

/// A fully resolved capability-server descriptor.
///
/// Exactly one of `command` (stdio) or `url` (sse / streamable-http) is
/// set, depending on the transport.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Extra environment merged on top of the parent process environment.
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    /// Request headers for the HTTP transports.
    pub headers: HashMap<String, String>,
    /// Per-server connect timeout override (milliseconds).
    pub timeout_ms: Option<u64>,
}

/// Embedding endpoint settings (OpenAI-compatible `/embeddings`).
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Vector database location.
#[derive(Debug, Clone)]
pub struct VectorDbSettings {
    pub path: PathBuf,
}

/// Search operator settings.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Default result count, clamped to `[1, 20]`.
    pub top_k: usize,
    /// Minimum similarity score, clamped to `[0, 1]`.
    pub min_score: f64,
    /// Whether `mcp_search` includes full parameter schemas by default.
    pub include_parameters_default: bool,
}

/// Indexer pipeline settings. All durations are in milliseconds.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub connect_timeout: u64,
    pub max_retries: u32,
    pub initial_retry_delay: u64,
    pub max_retry_delay: u64,
    pub max_chunk_chars: usize,
    pub overlap_chars: usize,
    pub generate_cli_artifacts: bool,
}

/// The fully resolved router configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub servers: Vec<ServerConfig>,
    pub embedding: EmbeddingSettings,
    pub vector_db: VectorDbSettings,
    pub search: SearchSettings,
    pub indexer: IndexerSettings,
}

// ── Raw (serde) shapes ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
    mcp_servers: Option<HashMap<String, RawServerEntry>>,
    mcp_servers_file: Option<String>,
    servers: Option<Vec<RawLegacyServer>>,
    embedding: Option<RawEmbedding>,
    memory_search: Option<RawMemorySearch>,
    vector_db: Option<RawVectorDb>,
    search: Option<RawSearch>,
    indexer: Option<RawIndexer>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawServerEntry {
    command: Option<String>,
    args: Option<Vec<String>>,
    env: Option<HashMap<String, String>>,
    url: Option<String>,
    server_url: Option<String>,
    headers: Option<HashMap<String, String>>,
    #[serde(rename = "type")]
    kind: Option<String>,
    timeout: Option<i64>,
    disabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLegacyServer {
    name: String,
    transport: String,
    #[serde(flatten)]
    entry: RawServerEntry,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawEmbedding {
    provider: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    url: Option<String>,
    api_key: Option<String>,
    headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawMemorySearch {
    embedding: Option<RawEmbedding>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawVectorDb {
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawSearch {
    top_k: Option<i64>,
    min_score: Option<f64>,
    include_parameters_default: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawIndexer {
    connect_timeout: Option<i64>,
    max_retries: Option<i64>,
    initial_retry_delay: Option<i64>,
    max_retry_delay: Option<i64>,
    max_chunk_chars: Option<i64>,
    overlap_chars: Option<i64>,
    generate_cli_artifacts: Option<bool>,
}

// ── Resolution ───────────────────────────────────────────────────────────

impl Settings {
    /// Read and resolve the configuration from the default location
    /// (`CONFIG_PATH` > `STATE_DIR/config.json` > `~/.mcp-router/config.json`).
    ///
    /// A missing file resolves to the empty tree; unreadable JSON is fatal.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let root = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?,
            Err(_) => serde_json::Value::Object(serde_json::Map::new()),
        };
        Self::resolve(&root)
    }

    /// Merge the layered sources of a host configuration tree into a
    /// validated `Settings`. Any malformed section fails the whole
    /// resolution; no partial config is emitted.
    pub fn resolve(root: &serde_json::Value) -> Result<Self> {
        let raw: RawConfig =
            serde_json::from_value(root.clone()).context("invalid configuration shape")?;

        let servers = resolve_servers(&raw)?;
        let embedding = resolve_embedding(&raw);
        let vector_db = resolve_vector_db(&raw);
        let search = resolve_search(&raw);
        let indexer = resolve_indexer(&raw);

        Ok(Self {
            servers,
            embedding,
            vector_db,
            search,
            indexer,
        })
    }

    /// Find a configured server by name.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

fn resolve_servers(raw: &RawConfig) -> Result<Vec<ServerConfig>> {
    // BTreeMap keeps resolution order deterministic across runs.
    let mut merged: BTreeMap<String, RawServerEntry> = BTreeMap::new();

    if let Some(file) = &raw.mcp_servers_file {
        for (name, entry) in load_servers_file(Path::new(&expand_tilde(file)))? {
            merged.insert(name, entry);
        }
    }
    if let Some(inline) = &raw.mcp_servers {
        for (name, entry) in inline {
            merged.insert(name.clone(), entry.clone());
        }
    }

    let mut servers = Vec::new();
    if merged.is_empty() {
        // Legacy positional list, consulted only when the maps contributed nothing.
        if let Some(legacy) = &raw.servers {
            for item in legacy {
                let mut entry = item.entry.clone();
                entry.kind = Some(item.transport.clone());
                if let Some(server) = parse_server(&item.name, &entry)? {
                    servers.push(server);
                }
            }
        }
    } else {
        for (name, entry) in &merged {
            if let Some(server) = parse_server(name, entry)? {
                servers.push(server);
            }
        }
    }
    Ok(servers)
}

/// Load an external server-list file: either a bare `{name → entry}` map
/// or an `{"mcpServers": {…}}` wrapper. A missing file is empty.
fn load_servers_file(path: &Path) -> Result<HashMap<String, RawServerEntry>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Ok(HashMap::new()),
    };
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse servers file: {}", path.display()))?;
    let map_value = value.get("mcpServers").cloned().unwrap_or(value);
    serde_json::from_value(map_value)
        .with_context(|| format!("invalid server entries in: {}", path.display()))
}

/// Parse one raw entry into a descriptor. Returns `None` for disabled
/// entries. Transport inference: `command` ⇒ stdio, `url`/`serverUrl` ⇒
/// streamable-http, an explicit `type` overrides.
fn parse_server(name: &str, entry: &RawServerEntry) -> Result<Option<ServerConfig>> {
    if entry.disabled.unwrap_or(false) {
        return Ok(None);
    }

    let url = entry.url.clone().or_else(|| entry.server_url.clone());
    let transport = match &entry.kind {
        Some(kind) => TransportKind::parse(kind)
            .with_context(|| format!("server '{name}': invalid transport"))?,
        None if entry.command.is_some() => TransportKind::Stdio,
        None if url.is_some() => TransportKind::StreamableHttp,
        None => bail!("server '{name}': entry must set either 'command' or 'url'"),
    };

    match transport {
        TransportKind::Stdio if entry.command.is_none() => {
            bail!("server '{name}': stdio transport requires 'command'")
        }
        TransportKind::Sse | TransportKind::StreamableHttp if url.is_none() => {
            bail!(
                "server '{name}': {} transport requires 'url'",
                transport.as_str()
            )
        }
        _ => {}
    }

    let env = entry
        .env
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, expand_env_tokens(&v)))
        .collect();
    let headers = entry
        .headers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, expand_env_tokens(&v)))
        .collect();

    Ok(Some(ServerConfig {
        name: name.to_string(),
        transport,
        command: entry.command.clone(),
        args: entry.args.clone().unwrap_or_default(),
        env,
        url,
        headers,
        timeout_ms: entry.timeout.map(|t| t.max(0) as u64),
    }))
}

fn resolve_embedding(raw: &RawConfig) -> EmbeddingSettings {
    let block = raw
        .embedding
        .clone()
        .or_else(|| raw.memory_search.as_ref().and_then(|m| m.embedding.clone()));

    match block {
        Some(block) => {
            let base_url = match (&block.base_url, &block.url) {
                (Some(base), _) => base.clone(),
                (None, Some(legacy)) => migrate_legacy_url(legacy),
                (None, None) => DEFAULT_EMBEDDING_BASE_URL.to_string(),
            };
            EmbeddingSettings {
                provider: block.provider.unwrap_or_else(|| "openai".to_string()),
                model: block
                    .model
                    .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
                base_url,
                api_key: block.api_key,
                headers: block
                    .headers
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, expand_env_tokens(&v)))
                    .collect(),
            }
        }
        None => EmbeddingSettings {
            provider: "local".to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            base_url: DEFAULT_EMBEDDING_BASE_URL.to_string(),
            api_key: None,
            headers: HashMap::new(),
        },
    }
}

/// Legacy `url` values predate the `/v1` suffix convention.
fn migrate_legacy_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

fn resolve_vector_db(raw: &RawConfig) -> VectorDbSettings {
    let path = raw
        .vector_db
        .as_ref()
        .and_then(|v| v.path.clone())
        .map(|p| PathBuf::from(expand_tilde(&p)))
        .unwrap_or_else(|| state_dir().join("tool-index.sqlite"));
    VectorDbSettings { path }
}

fn resolve_search(raw: &RawConfig) -> SearchSettings {
    let r = raw.search.as_ref();
    let top_k = r
        .and_then(|s| s.top_k)
        .map(|v| v.clamp(1, 20) as usize)
        .unwrap_or(5);
    let min_score = r
        .and_then(|s| s.min_score)
        .map(|v| v.clamp(0.0, 1.0))
        .unwrap_or(0.3);
    SearchSettings {
        top_k,
        min_score,
        include_parameters_default: r
            .and_then(|s| s.include_parameters_default)
            .unwrap_or(false),
    }
}

fn resolve_indexer(raw: &RawConfig) -> IndexerSettings {
    let r = raw.indexer.as_ref();
    let pick = |f: fn(&RawIndexer) -> Option<i64>, default: u64| -> u64 {
        r.and_then(f).map(|v| v.max(0) as u64).unwrap_or(default)
    };
    IndexerSettings {
        connect_timeout: pick(|i| i.connect_timeout, 60_000),
        max_retries: pick(|i| i.max_retries, 3) as u32,
        initial_retry_delay: pick(|i| i.initial_retry_delay, 2_000),
        max_retry_delay: pick(|i| i.max_retry_delay, 30_000),
        max_chunk_chars: pick(|i| i.max_chunk_chars, 500) as usize,
        overlap_chars: pick(|i| i.overlap_chars, 100) as usize,
        generate_cli_artifacts: r.and_then(|i| i.generate_cli_artifacts).unwrap_or(false),
    }
}

// ── Paths & expansion ────────────────────────────────────────────────────

/// The router's state directory: `STATE_DIR` when set, else `~/.mcp-router`.
pub fn state_dir() -> PathBuf {
    match std::env::var("STATE_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(expand_tilde(&dir)),
        _ => home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mcp-router"),
    }
}

/// The configuration file: `CONFIG_PATH` when set, else `{state_dir}/config.json`.
pub fn config_path() -> PathBuf {
    match std::env::var("CONFIG_PATH") {
        Ok(path) if !path.is_empty() => PathBuf::from(expand_tilde(&path)),
        _ => state_dir().join("config.json"),
    }
}

/// Replace every `${NAME}` token with the process environment lookup
/// (empty string when unset). Unterminated tokens pass through verbatim.
fn expand_env_tokens(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand `~` at the start of a path to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = home_dir() {
            return format!(
                "{}{}",
                home.display(),
                path.strip_prefix('~').unwrap_or("")
            );
        }
    }
    path.to_string()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_tree_resolves_with_defaults() {
        let settings = Settings::resolve(&json!({})).unwrap();
        assert!(settings.servers.is_empty());
        assert_eq!(settings.embedding.model, DEFAULT_EMBEDDING_MODEL);
        assert_eq!(settings.embedding.base_url, DEFAULT_EMBEDDING_BASE_URL);
        assert_eq!(settings.search.top_k, 5);
        assert!((settings.search.min_score - 0.3).abs() < 1e-9);
        assert_eq!(settings.indexer.connect_timeout, 60_000);
        assert_eq!(settings.indexer.max_retries, 3);
        assert_eq!(settings.indexer.initial_retry_delay, 2_000);
        assert_eq!(settings.indexer.max_retry_delay, 30_000);
        assert_eq!(settings.indexer.max_chunk_chars, 500);
        assert_eq!(settings.indexer.overlap_chars, 100);
        assert!(!settings.indexer.generate_cli_artifacts);
    }

    #[test]
    fn transport_inferred_from_entry_shape() {
        let settings = Settings::resolve(&json!({
            "mcpServers": {
                "fs": { "command": "fs-server", "args": ["--root", "/tmp"] },
                "web": { "url": "http://localhost:9000/mcp" },
                "events": { "serverUrl": "http://localhost:9001/sse", "type": "sse" }
            }
        }))
        .unwrap();

        let fs = settings.server("fs").unwrap();
        assert_eq!(fs.transport, TransportKind::Stdio);
        assert_eq!(fs.args, vec!["--root", "/tmp"]);

        let web = settings.server("web").unwrap();
        assert_eq!(web.transport, TransportKind::StreamableHttp);

        let events = settings.server("events").unwrap();
        assert_eq!(events.transport, TransportKind::Sse);
        assert_eq!(events.url.as_deref(), Some("http://localhost:9001/sse"));
    }

    #[test]
    fn entry_without_command_or_url_is_an_error() {
        let err = Settings::resolve(&json!({
            "mcpServers": { "broken": { "env": { "X": "1" } } }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn disabled_entries_are_dropped() {
        let settings = Settings::resolve(&json!({
            "mcpServers": {
                "on": { "command": "a" },
                "off": { "command": "b", "disabled": true }
            }
        }))
        .unwrap();
        assert_eq!(settings.servers.len(), 1);
        assert_eq!(settings.servers[0].name, "on");
    }

    #[test]
    fn inline_wins_over_file_including_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("servers.json");
        std::fs::write(
            &file,
            json!({
                "mcpServers": {
                    "shared": { "command": "from-file" },
                    "file-only": { "command": "keeper" }
                }
            })
            .to_string(),
        )
        .unwrap();

        let settings = Settings::resolve(&json!({
            "mcpServersFile": file.to_str().unwrap(),
            "mcpServers": {
                "shared": { "command": "from-file", "disabled": true }
            }
        }))
        .unwrap();

        // The inline disable hides the file-based enable.
        assert!(settings.server("shared").is_none());
        assert!(settings.server("file-only").is_some());
    }

    #[test]
    fn legacy_array_only_when_maps_are_empty() {
        let settings = Settings::resolve(&json!({
            "servers": [
                { "name": "old", "transport": "stdio", "command": "old-server" }
            ]
        }))
        .unwrap();
        assert_eq!(settings.servers.len(), 1);
        assert_eq!(settings.servers[0].name, "old");

        let settings = Settings::resolve(&json!({
            "mcpServers": { "new": { "command": "new-server" } },
            "servers": [
                { "name": "old", "transport": "stdio", "command": "old-server" }
            ]
        }))
        .unwrap();
        assert!(settings.server("old").is_none());
        assert!(settings.server("new").is_some());
    }

    #[test]
    fn env_and_header_tokens_expand() {
        std::env::set_var("MCP_ROUTER_TEST_TOKEN", "sekrit");
        let settings = Settings::resolve(&json!({
            "mcpServers": {
                "api": {
                    "url": "http://localhost:9000/mcp",
                    "headers": { "Authorization": "Bearer ${MCP_ROUTER_TEST_TOKEN}" },
                    "env": { "UNSET": "${MCP_ROUTER_TEST_MISSING}" }
                }
            }
        }))
        .unwrap();
        let api = settings.server("api").unwrap();
        assert_eq!(api.headers["Authorization"], "Bearer sekrit");
        assert_eq!(api.env["UNSET"], "");
    }

    #[test]
    fn legacy_embedding_url_gains_v1_suffix() {
        let settings = Settings::resolve(&json!({
            "embedding": { "url": "http://localhost:8080/", "model": "custom-model" }
        }))
        .unwrap();
        assert_eq!(settings.embedding.base_url, "http://localhost:8080/v1");
        assert_eq!(settings.embedding.model, "custom-model");

        let settings = Settings::resolve(&json!({
            "embedding": { "url": "http://localhost:8080/v1" }
        }))
        .unwrap();
        assert_eq!(settings.embedding.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn memory_search_block_is_adopted() {
        let settings = Settings::resolve(&json!({
            "memorySearch": {
                "embedding": { "baseUrl": "http://localhost:7000/v1", "model": "all-minilm" }
            }
        }))
        .unwrap();
        assert_eq!(settings.embedding.base_url, "http://localhost:7000/v1");
        assert_eq!(settings.embedding.model, "all-minilm");
    }

    #[test]
    fn search_and_indexer_values_clamp() {
        let settings = Settings::resolve(&json!({
            "search": { "topK": 99, "minScore": -0.5 },
            "indexer": { "maxRetries": -2, "connectTimeout": -1 }
        }))
        .unwrap();
        assert_eq!(settings.search.top_k, 20);
        assert_eq!(settings.search.min_score, 0.0);
        assert_eq!(settings.indexer.max_retries, 0);
        assert_eq!(settings.indexer.connect_timeout, 0);

        let settings = Settings::resolve(&json!({ "search": { "topK": 0 } })).unwrap();
        assert_eq!(settings.search.top_k, 1);
    }

    #[test]
    fn malformed_section_fails_resolution() {
        assert!(Settings::resolve(&json!({ "mcpServers": [1, 2, 3] })).is_err());
        assert!(Settings::resolve(&json!({
            "mcpServers": { "x": { "command": "c", "type": "carrier-pigeon" } }
        }))
        .is_err());
    }

    #[test]
    fn tilde_expands_in_vector_db_path() {
        let settings = Settings::resolve(&json!({
            "vectorDb": { "path": "~/state/tools.sqlite" }
        }))
        .unwrap();
        let rendered = settings.vector_db.path.to_string_lossy().to_string();
        assert!(!rendered.starts_with('~'));
        assert!(rendered.ends_with("state/tools.sqlite"));
    }

    #[test]
    fn unterminated_token_passes_through() {
        assert_eq!(expand_env_tokens("${OOPS"), "${OOPS");
        assert_eq!(expand_env_tokens("plain"), "plain");
    }
}
