//! Process-wide coordinator.
//!
//! Spawns one entity controller per forge entity, follows entity lifecycle
//! events on the watcher, and runs the periodic consolidation pass that
//! reconciles forge-visible runners back into the workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bellows_core::config::BellowsConfig;
use bellows_core::error::Result;
use bellows_core::events::{
    with_all, with_any, with_entity_type_filter, with_operation_filter, ChangeEvent, EventPayload,
    EventType, OperationType,
};
use bellows_core::forge::ForgeEntity;
use bellows_core::provider::ProviderRegistry;
use bellows_core::store::Store;

use crate::cache::Cache;
use crate::controller::EntityController;
use crate::metrics::CallMetrics;
use crate::watcher::Bus;

/// Owns every entity controller in the process.
pub struct Coordinator {
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    providers: ProviderRegistry,
    config: Arc<BellowsConfig>,
    bus: Arc<Bus>,
    metrics: CallMetrics,
    controllers: Mutex<HashMap<Uuid, Arc<EntityController>>>,
    cancel: Mutex<Option<CancellationToken>>,
    loops_exited: Mutex<Vec<oneshot::Receiver<()>>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<Cache>,
        providers: ProviderRegistry,
        config: Arc<BellowsConfig>,
        bus: Arc<Bus>,
        metrics: CallMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            providers,
            config,
            bus,
            metrics,
            controllers: Mutex::new(HashMap::new()),
            cancel: Mutex::new(None),
            loops_exited: Mutex::new(Vec::new()),
        })
    }

    /// Number of live entity controllers.
    pub fn controller_count(&self) -> usize {
        self.controllers.lock().unwrap().len()
    }

    /// Load entities, spawn controllers, and start the event and
    /// consolidation loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let cancel = {
            let mut cancel_slot = self.cancel.lock().unwrap();
            if cancel_slot.is_some() {
                return Ok(());
            }
            let cancel = CancellationToken::new();
            *cancel_slot = Some(cancel.clone());
            cancel
        };

        let entities = self.store.list_entities().await?;
        for entity in entities {
            self.spawn_controller(entity).await;
        }

        let filter = with_all(vec![
            with_entity_type_filter(EventType::Entity),
            with_any(vec![
                with_operation_filter(OperationType::Create),
                with_operation_filter(OperationType::Delete),
            ]),
        ]);
        let consumer = self.bus.register_consumer("coordinator", filter)?;

        let (event_tx, event_rx) = oneshot::channel();
        let coordinator = self.clone();
        let event_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = event_cancel.cancelled() => break,
                    event = consumer.recv() => {
                        let Some(event) = event else { break };
                        coordinator.handle_event(event).await;
                    }
                }
            }
            consumer.close();
            let _ = event_tx.send(());
        });

        let (consolidation_tx, consolidation_rx) = oneshot::channel();
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.consolidation_loop(cancel).await;
            let _ = consolidation_tx.send(());
        });

        let mut exited = self.loops_exited.lock().unwrap();
        exited.push(event_rx);
        exited.push(consolidation_rx);

        tracing::info!("coordinator started");
        Ok(())
    }

    /// Stop every loop and controller. Idempotent.
    pub async fn stop(&self) {
        let cancel = self.cancel.lock().unwrap().take();
        let Some(cancel) = cancel else { return };
        cancel.cancel();
        let exited: Vec<_> = self.loops_exited.lock().unwrap().drain(..).collect();
        for rx in exited {
            let _ = rx.await;
        }
        let controllers: Vec<Arc<EntityController>> = self
            .controllers
            .lock()
            .unwrap()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for controller in controllers {
            controller.stop().await;
        }
        tracing::info!("coordinator stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: ChangeEvent) {
        let EventPayload::Entity(entity) = event.payload else {
            return;
        };
        match event.operation {
            OperationType::Create => {
                self.cache.entities.set_entity(entity.clone());
                self.spawn_controller(entity).await;
            }
            OperationType::Delete => {
                let controller = self.controllers.lock().unwrap().remove(&entity.id);
                if let Some(controller) = controller {
                    controller.stop().await;
                    tracing::info!(entity = %entity, "entity controller dropped");
                }
                self.cache.entities.delete_entity(entity.id);
            }
            OperationType::Update => {}
        }
    }

    async fn spawn_controller(self: &Arc<Self>, entity: ForgeEntity) {
        {
            let controllers = self.controllers.lock().unwrap();
            if controllers.contains_key(&entity.id) {
                return;
            }
        }
        let controller = EntityController::new(
            entity.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.providers.clone(),
            self.config.clone(),
            self.bus.clone(),
            self.metrics.clone(),
        );
        if let Err(e) = controller.start().await {
            tracing::error!(entity = %entity, error = %e, "failed to start entity controller");
            return;
        }
        self.controllers.lock().unwrap().insert(entity.id, controller);
    }

    /// Periodic consolidation: one pass over every entity.
    ///
    /// A failing entity does not abort the pass; shutdown does, via the
    /// coordinator's cancellation token.
    async fn consolidation_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.intervals.consolidation();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let controllers: Vec<Arc<EntityController>> = self
                .controllers
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for controller in controllers {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = controller.consolidate() => {
                        if let Err(e) = result {
                            tracing::warn!(
                                entity = %controller.entity_id(),
                                error = %e,
                                "entity consolidation failed"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeForge;
    use crate::watcher::WatchedStore;
    use bellows_core::forge::EntityKind;
    use bellows_core::testing::{MemStore, RecordingProvider};
    use std::time::Duration;

    struct Harness {
        forge: FakeForge,
        store: Arc<WatchedStore>,
        bus: Arc<Bus>,
        coordinator: Arc<Coordinator>,
    }

    async fn harness() -> Harness {
        let forge = FakeForge::start().await;
        let bus = Bus::new();
        let store = Arc::new(WatchedStore::new(Arc::new(MemStore::new()), bus.clone()));
        let cache = Cache::new();
        let mut providers = ProviderRegistry::new();
        providers.register("test-provider", Arc::new(RecordingProvider::new()));
        let coordinator = Coordinator::new(
            store.clone() as Arc<dyn Store>,
            cache,
            providers,
            forge.config(),
            bus.clone(),
            CallMetrics::new(),
        );
        Harness {
            forge,
            store,
            bus,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_cold_start_with_empty_store() {
        let h = harness().await;
        h.coordinator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // No entities, no controllers, and nothing was asked of the forge.
        assert_eq!(h.coordinator.controller_count(), 0);
        assert!(h.forge.server.received_requests().await.unwrap().is_empty());
        h.coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_entity_lifecycle_spawns_and_drops_controllers() {
        let h = harness().await;
        h.coordinator.start().await.unwrap();

        let entity = h.forge.entity(EntityKind::Organization);
        h.store.create_credentials(entity.credentials.clone()).await.unwrap();
        h.store.create_entity(entity.clone()).await.unwrap();

        for _ in 0..100 {
            if h.coordinator.controller_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.coordinator.controller_count(), 1);

        h.store.delete_entity(entity.id).await.unwrap();
        for _ in 0..100 {
            if h.coordinator.controller_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.coordinator.controller_count(), 0);
        h.coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_consumer() {
        let h = harness().await;
        h.coordinator.start().await.unwrap();
        h.coordinator.stop().await;
        h.coordinator.stop().await;
        assert_eq!(h.bus.consumer_count(), 0);
        // The consumer ID is free for a restart.
        h.coordinator.start().await.unwrap();
        h.coordinator.stop().await;
    }
}
