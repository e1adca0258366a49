//! HTTP server for the delta tracking service.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::enrich::EnrichmentProxy;
use crate::error::{DeltaError, ErrorCode};
use crate::registry::{DriverRegistry, MemoryDriverRegistry};
use crate::router::{create_router, AppState};
use crate::store::{DeltaStore, MemoryDeltaStore};

/// Delta tracking server.
pub struct DeltaServer {
    config: Arc<Config>,
    store: Arc<dyn DeltaStore>,
    registry: Arc<dyn DriverRegistry>,
}

impl DeltaServer {
    /// Creates a new server with in-memory storage and an empty registry.
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn DeltaStore> = Arc::new(MemoryDeltaStore::new());
        let registry: Arc<dyn DriverRegistry> = Arc::new(MemoryDriverRegistry::new());

        Self {
            config: Arc::new(config),
            store,
            registry,
        }
    }

    /// Creates a new server over the given store and registry.
    pub fn with_backends(
        config: Config,
        store: Arc<dyn DeltaStore>,
        registry: Arc<dyn DriverRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            registry,
        }
    }

    /// Runs the server.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = self.config.bind_address().parse()?;

        let proxy = EnrichmentProxy::new(self.config.enrich_timeout)
            .map_err(|e| DeltaError::with_message(ErrorCode::InternalError, e.to_string()))?;

        let state = AppState {
            config: self.config.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            proxy: Arc::new(proxy),
        };

        // Create router with middleware
        let app = create_router(state)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
                    .expose_headers(Any),
            )
            .layer(TraceLayer::new_for_http());

        info!("Delta tracking service is starting at http://{}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Returns the bind address.
    pub fn bind_address(&self) -> String {
        self.config.bind_address()
    }

    /// Returns the base URL for the API service.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.bind_address())
    }
}

/// Builder for creating a delta server.
pub struct DeltaServerBuilder {
    config: Config,
    store: Option<Arc<dyn DeltaStore>>,
    registry: Option<Arc<dyn DriverRegistry>>,
}

impl DeltaServerBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            store: None,
            registry: None,
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the host address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the API service port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the delta record store.
    pub fn store(mut self, store: Arc<dyn DeltaStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the driver registry.
    pub fn registry(mut self, registry: Arc<dyn DriverRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the server.
    pub fn build(self) -> DeltaServer {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryDeltaStore::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(MemoryDriverRegistry::new()));

        DeltaServer::with_backends(self.config, store, registry)
    }
}

impl Default for DeltaServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
