//! Process assembly for the bellows controller.
//!
//! Wires the store, watcher bus, coordination cache, and coordinator
//! together and runs them until shutdown.

use std::sync::Arc;

use bellows_core::config::BellowsConfig;
use bellows_core::error::Result;
use bellows_core::provider::{Provider, ProviderRegistry};
use bellows_core::store::Store;
use bellows_runtime::{Bus, Cache, CacheSync, CallMetrics, Coordinator, PgStore, WatchedStore};

/// Builder for a [`Bellows`] process.
pub struct BellowsBuilder {
    config: BellowsConfig,
    providers: ProviderRegistry,
}

impl BellowsBuilder {
    pub fn new(config: BellowsConfig) -> Self {
        Self {
            config,
            providers: ProviderRegistry::new(),
        }
    }

    /// Register an infrastructure provider plug-in.
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.register(name, provider);
        self
    }

    pub fn build(self) -> Bellows {
        Bellows {
            config: Arc::new(self.config),
            providers: self.providers,
        }
    }
}

/// The assembled controller process.
pub struct Bellows {
    config: Arc<BellowsConfig>,
    providers: ProviderRegistry,
}

impl Bellows {
    pub fn builder(config: BellowsConfig) -> BellowsBuilder {
        BellowsBuilder::new(config)
    }

    pub fn config(&self) -> &BellowsConfig {
        &self.config
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.names()
    }

    /// Run until the process receives an interrupt.
    pub async fn run(self) -> Result<()> {
        if self.providers.names().is_empty() {
            tracing::warn!(
                "no providers registered; scale set workers will fail until one is configured"
            );
        }

        let pool = bellows_runtime::connect(&self.config.database).await?;
        let bus = Bus::new();
        let store: Arc<dyn Store> =
            Arc::new(WatchedStore::new(Arc::new(PgStore::new(pool)), bus.clone()));
        let cache = Cache::new();
        let metrics = CallMetrics::new();

        let cache_sync = CacheSync::new(cache.clone(), bus.clone());
        cache_sync.hydrate(&store).await?;
        cache_sync.start()?;

        let coordinator = Coordinator::new(
            store,
            cache,
            self.providers,
            self.config.clone(),
            bus,
            metrics,
        );
        coordinator.start().await?;
        tracing::info!(controller_id = %self.config.controller.id, "bellows is up");

        tokio::signal::ctrl_c()
            .await
            .map_err(bellows_core::BellowsError::Io)?;
        tracing::info!("interrupt received, shutting down");

        coordinator.stop().await;
        cache_sync.stop().await;
        Ok(())
    }
}
