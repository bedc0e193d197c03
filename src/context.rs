//! Shared dependency bag for the indexer and the operators.
//!
//! All side-effecting components are passed explicitly — there are no
//! global singletons — so tests can swap in stub embedders and mock
//! transports.

use anyhow::Result;
use std::sync::Arc;

use crate::config::Settings;
use crate::embedding::{Embedder, EmbeddingClient};
use crate::registry::ToolRegistry;
use crate::store::VectorStore;
use crate::transport::{RmcpTransportFactory, TransportFactory};

#[derive(Clone)]
pub struct RouterContext {
    pub settings: Arc<Settings>,
    pub store: Arc<VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub registry: Arc<ToolRegistry>,
    pub transports: Arc<dyn TransportFactory>,
}

impl RouterContext {
    /// Production wiring: HTTP embedding client, SQLite store at the
    /// configured path, rmcp transports.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(&settings.embedding));
        let store = Arc::new(VectorStore::open(&settings.vector_db.path, embedder.clone()).await?);

        Ok(Self {
            settings,
            store,
            embedder,
            registry: Arc::new(ToolRegistry::new()),
            transports: Arc::new(RmcpTransportFactory),
        })
    }

    /// Rebuild the in-memory registry from the persisted catalog, so the
    /// previous index keeps serving while a fresh run is in flight.
    /// Entries whose server is no longer configured are skipped.
    pub async fn hydrate_registry(&self) -> Result<usize> {
        let mut bound = 0;
        for (server, tool, _) in self.store.list_tools().await? {
            if let Some(config) = self.settings.server(&server) {
                self.registry.register_server(config);
                self.registry.register_tool_owner(&tool, &server);
                bound += 1;
            }
        }
        Ok(bound)
    }
}
