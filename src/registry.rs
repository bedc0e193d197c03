//! In-memory registry mapping tool names to their owning servers.
//!
//! Populated by the indexer; read concurrently by the call operator.
//! Name collisions across servers resolve last-writer-wins with a
//! warning — collisions are rare and operator-visible, and rejecting
//! them at ingest would turn a soft error into a hard one.

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

use crate::config::ServerConfig;

#[derive(Default)]
pub struct ToolRegistry {
    /// tool name → owning server name.
    owners: RwLock<HashMap<String, String>>,
    /// server name → descriptor.
    servers: RwLock<HashMap<String, ServerConfig>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a server descriptor.
    pub fn register_server(&self, server: &ServerConfig) {
        self.servers
            .write()
            .expect("servers lock poisoned")
            .insert(server.name.clone(), server.clone());
    }

    /// Bind `tool` to `server`, overwriting any existing binding.
    pub fn register_tool_owner(&self, tool: &str, server: &str) {
        let mut owners = self.owners.write().expect("owners lock poisoned");
        if let Some(previous) = owners.insert(tool.to_string(), server.to_string()) {
            if previous != server {
                warn!(
                    tool,
                    previous_server = %previous,
                    new_server = %server,
                    "tool name collision; last writer wins"
                );
            }
        }
    }

    /// Resolve the descriptor of the server owning `tool`.
    pub fn resolve_server(&self, tool: &str) -> Option<ServerConfig> {
        let owners = self.owners.read().expect("owners lock poisoned");
        let server_name = owners.get(tool)?;
        self.servers
            .read()
            .expect("servers lock poisoned")
            .get(server_name)
            .cloned()
    }

    /// The owning server's name, without the descriptor.
    pub fn owner_of(&self, tool: &str) -> Option<String> {
        self.owners
            .read()
            .expect("owners lock poisoned")
            .get(tool)
            .cloned()
    }

    pub fn tool_count(&self) -> usize {
        self.owners.read().expect("owners lock poisoned").len()
    }

    /// Drop every binding owned by `server` (used when a server is removed).
    pub fn forget_server(&self, server: &str) {
        self.owners
            .write()
            .expect("owners lock poisoned")
            .retain(|_, owner| owner != server);
        self.servers
            .write()
            .expect("servers lock poisoned")
            .remove(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    fn server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            command: Some("server-bin".to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout_ms: None,
        }
    }

    #[test]
    fn resolves_registered_owner() {
        let registry = ToolRegistry::new();
        registry.register_server(&server("fs"));
        registry.register_tool_owner("read_file", "fs");

        let resolved = registry.resolve_server("read_file").unwrap();
        assert_eq!(resolved.name, "fs");
        assert!(registry.resolve_server("unknown").is_none());
    }

    #[test]
    fn collision_is_last_writer_wins() {
        let registry = ToolRegistry::new();
        registry.register_server(&server("fs"));
        registry.register_server(&server("git"));
        registry.register_tool_owner("status", "fs");
        registry.register_tool_owner("status", "git");

        assert_eq!(registry.owner_of("status").as_deref(), Some("git"));
        assert_eq!(registry.tool_count(), 1);
    }

    #[test]
    fn forget_server_drops_its_bindings() {
        let registry = ToolRegistry::new();
        registry.register_server(&server("fs"));
        registry.register_server(&server("git"));
        registry.register_tool_owner("read_file", "fs");
        registry.register_tool_owner("git_log", "git");

        registry.forget_server("fs");
        assert!(registry.resolve_server("read_file").is_none());
        assert!(registry.resolve_server("git_log").is_some());
    }
}
