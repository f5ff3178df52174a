//! Per-entity controller.
//!
//! Owns the forge clients and one worker per scale set. Subscribes to the
//! watcher for scale set lifecycle events, entity updates, and credential
//! rotations, and propagates them to its workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bellows_core::config::BellowsConfig;
use bellows_core::error::Result;
use bellows_core::events::{
    with_all, with_any, with_credentials_filter, with_entity_filter, with_entity_scale_set_filter,
    with_entity_type_filter, with_operation_filter, ChangeEvent, EventPayload, EventType,
    OperationType,
};
use bellows_core::forge::ForgeEntity;
use bellows_core::provider::ProviderRegistry;
use bellows_core::scaleset::ScaleSet;
use bellows_core::store::Store;

use crate::actions::ActionsClient;
use crate::cache::Cache;
use crate::metrics::CallMetrics;
use crate::rest::ForgeRestClient;
use crate::scaleset::{parse_scale_set_label, ScaleSetWorker, WorkerStatus};
use crate::watcher::Bus;

/// Drives all scale sets of one forge entity.
pub struct EntityController {
    entity: RwLock<ForgeEntity>,
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    providers: ProviderRegistry,
    config: Arc<BellowsConfig>,
    bus: Arc<Bus>,
    actions: Arc<ActionsClient>,
    workers: Mutex<HashMap<i64, Arc<ScaleSetWorker>>>,
    cancel: Mutex<Option<CancellationToken>>,
    loop_exited: Mutex<Option<oneshot::Receiver<()>>>,
}

impl EntityController {
    pub fn new(
        entity: ForgeEntity,
        store: Arc<dyn Store>,
        cache: Arc<Cache>,
        providers: ProviderRegistry,
        config: Arc<BellowsConfig>,
        bus: Arc<Bus>,
        metrics: CallMetrics,
    ) -> Arc<Self> {
        let rest = Arc::new(ForgeRestClient::new(
            entity.clone(),
            metrics,
            cache.runner_groups.clone(),
        ));
        let actions = ActionsClient::new(rest);
        Arc::new(Self {
            entity: RwLock::new(entity),
            store,
            cache,
            providers,
            config,
            bus,
            actions,
            workers: Mutex::new(HashMap::new()),
            cancel: Mutex::new(None),
            loop_exited: Mutex::new(None),
        })
    }

    pub fn entity_id(&self) -> Uuid {
        self.entity.read().unwrap().id
    }

    /// Status of one scale set's worker, if it exists.
    pub fn scale_set_status(&self, scale_set_id: i64) -> Option<WorkerStatus> {
        let workers = self.workers.lock().unwrap();
        workers.get(&scale_set_id).map(|w| w.status())
    }

    /// Load scale sets, subscribe to the watcher, and spawn the event loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut cancel_slot = self.cancel.lock().unwrap();
            if cancel_slot.is_some() {
                return Ok(());
            }
            *cancel_slot = Some(CancellationToken::new());
        }

        let entity = self.entity.read().unwrap().clone();
        let scale_sets = self.store.list_entity_scale_sets(entity.id).await?;
        for scale_set in scale_sets {
            self.handle_scale_set_create(scale_set);
        }

        let filter = with_any(vec![
            with_entity_scale_set_filter(entity.id),
            with_all(vec![
                with_entity_type_filter(EventType::Entity),
                with_entity_filter(entity.id),
                with_operation_filter(OperationType::Update),
            ]),
            with_all(vec![
                with_credentials_filter(entity.credentials.id),
                with_operation_filter(OperationType::Update),
            ]),
        ]);
        let consumer = self
            .bus
            .register_consumer(&format!("entity-controller-{}", entity.id), filter)?;

        let cancel = self.cancel.lock().unwrap().clone().unwrap();
        let (exited_tx, exited_rx) = oneshot::channel();
        *self.loop_exited.lock().unwrap() = Some(exited_rx);

        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = consumer.recv() => {
                        let Some(event) = event else { break };
                        controller.handle_event(event).await;
                    }
                }
            }
            consumer.close();
            let _ = exited_tx.send(());
        });

        tracing::info!(entity = %entity, "entity controller started");
        Ok(())
    }

    /// Stop the event loop and every worker. Idempotent.
    pub async fn stop(&self) {
        let cancel = self.cancel.lock().unwrap().take();
        let Some(cancel) = cancel else { return };
        cancel.cancel();
        let exited = self.loop_exited.lock().unwrap().take();
        if let Some(exited) = exited {
            let _ = exited.await;
        }
        let workers: Vec<Arc<ScaleSetWorker>> =
            self.workers.lock().unwrap().drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.stop().await;
        }
        tracing::info!(entity = %self.entity.read().unwrap(), "entity controller stopped");
    }

    async fn handle_event(&self, event: ChangeEvent) {
        match event.payload {
            EventPayload::ScaleSet(scale_set) => match event.operation {
                OperationType::Create => self.handle_scale_set_create(scale_set),
                OperationType::Update => self.handle_scale_set_update(scale_set),
                OperationType::Delete => self.handle_scale_set_delete(scale_set.id).await,
            },
            EventPayload::Entity(entity) => {
                self.propagate_entity(entity);
            }
            EventPayload::Credentials(credentials) => {
                // Apply the rotation to the cache first; the fan-out
                // callback rewrites every cached entity referencing these
                // credentials. Then push the refreshed entity into the
                // clients.
                self.cache.credentials.set_credentials(credentials);
                let id = self.entity_id();
                let refreshed = match self.cache.entities.get_entity(id) {
                    Some(entity) => Some(entity),
                    None => self.store.get_entity(id).await.ok(),
                };
                if let Some(entity) = refreshed {
                    self.propagate_entity(entity);
                }
            }
            other => {
                tracing::debug!(payload = ?other, "ignoring unexpected event payload");
            }
        }
    }

    fn propagate_entity(&self, entity: ForgeEntity) {
        *self.entity.write().unwrap() = entity.clone();
        self.actions.rest().update_entity(entity.clone());
        let workers: Vec<Arc<ScaleSetWorker>> =
            self.workers.lock().unwrap().values().cloned().collect();
        for worker in workers {
            worker.entity_updated(entity.clone());
        }
    }

    /// Create and start a worker for a scale set.
    ///
    /// A failure to build the worker is reported but not fatal; a later
    /// update retries the creation.
    fn handle_scale_set_create(&self, scale_set: ScaleSet) {
        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(&scale_set.id) {
            return;
        }
        let entity = self.entity.read().unwrap().clone();
        match ScaleSetWorker::new(
            entity,
            scale_set.clone(),
            self.store.clone(),
            self.cache.clone(),
            &self.providers,
            self.actions.clone(),
            self.config.clone(),
        ) {
            Ok(worker) => {
                worker.start();
                workers.insert(scale_set.id, worker);
            }
            Err(e) => {
                tracing::error!(
                    scale_set = scale_set.id,
                    error = %e,
                    "failed to create scale set worker"
                );
            }
        }
    }

    /// Propagate an update, or recreate the worker when it is missing.
    ///
    /// A running worker is never recreated just because fields changed; it
    /// reconciles against the new snapshot on its next tick.
    fn handle_scale_set_update(&self, scale_set: ScaleSet) {
        let existing = {
            let workers = self.workers.lock().unwrap();
            workers.get(&scale_set.id).cloned()
        };
        match existing {
            Some(worker) if worker.status().is_running => {
                worker.scale_set_updated(scale_set);
            }
            Some(_) | None => {
                let mut workers = self.workers.lock().unwrap();
                workers.remove(&scale_set.id);
                drop(workers);
                self.handle_scale_set_create(scale_set);
            }
        }
    }

    async fn handle_scale_set_delete(&self, scale_set_id: i64) {
        let worker = self.workers.lock().unwrap().remove(&scale_set_id);
        if let Some(worker) = worker {
            worker.stop().await;
            tracing::info!(scale_set = scale_set_id, "scale set worker dropped");
        }
        self.cache
            .entities
            .delete_scale_set(self.entity_id(), scale_set_id);
    }

    /// One consolidation round: list forge-side runners once, bucket them
    /// by the scale set ownership label, and hand each bucket to its
    /// worker.
    pub async fn consolidate(&self) -> Result<()> {
        let runners = self.actions.list_all_runners().await?.value;
        let workers: Vec<(i64, Arc<ScaleSetWorker>)> = self
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, w)| (*id, w.clone()))
            .collect();

        let mut buckets: HashMap<i64, Vec<bellows_core::actions::RunnerReference>> =
            workers.iter().map(|(id, _)| (*id, Vec::new())).collect();
        for runner in runners {
            let owner = runner
                .labels
                .iter()
                .find_map(|l| parse_scale_set_label(&l.name));
            if let Some(scale_set_id) = owner {
                buckets.entry(scale_set_id).or_default().push(runner);
            }
        }

        for (scale_set_id, bucket) in buckets {
            let Some((_, worker)) = workers.iter().find(|(id, _)| *id == scale_set_id) else {
                continue;
            };
            if let Err(e) = worker.consolidate_runner_state(&bucket).await {
                tracing::warn!(
                    scale_set = scale_set_id,
                    error = %e,
                    "scale set consolidation failed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeForge;
    use crate::watcher::WatchedStore;
    use bellows_core::forge::{EntityKind, EntityScope};
    use bellows_core::store::NewScaleSet;
    use bellows_core::testing::{MemStore, RecordingProvider};
    use std::time::Duration;

    struct Harness {
        forge: FakeForge,
        store: Arc<WatchedStore>,
        bus: Arc<Bus>,
        cache: Arc<Cache>,
        providers: ProviderRegistry,
        entity: ForgeEntity,
    }

    async fn harness() -> Harness {
        let forge = FakeForge::start().await;
        let bus = Bus::new();
        let store = Arc::new(WatchedStore::new(Arc::new(MemStore::new()), bus.clone()));
        let cache = Cache::new();
        let entity = forge.entity(EntityKind::Organization);
        store.create_credentials(entity.credentials.clone()).await.unwrap();
        store.create_entity(entity.clone()).await.unwrap();
        cache.credentials.set_credentials(entity.credentials.clone());
        cache.entities.set_entity(entity.clone());

        let mut providers = ProviderRegistry::new();
        providers.register("test-provider", Arc::new(RecordingProvider::new()));

        Harness {
            forge,
            store,
            bus,
            cache,
            providers,
            entity,
        }
    }

    fn new_scale_set(entity: &ForgeEntity) -> NewScaleSet {
        NewScaleSet {
            name: "scale-set".to_string(),
            scope: EntityScope::for_entity(entity),
            provider_name: "test-provider".to_string(),
            min_runners: 0,
            max_runners: 5,
            image: "ubuntu:24.04".to_string(),
            flavor: "default".to_string(),
            os_type: bellows_core::os::OsType::Linux,
            os_arch: bellows_core::os::OsArch::Amd64,
            runner_group: "Default".to_string(),
            enabled: true,
            runner_bootstrap_timeout_minutes: 20,
            runner_prefix: "bellows".to_string(),
            extra_specs: serde_json::Value::Null,
        }
    }

    fn controller(h: &Harness) -> Arc<EntityController> {
        EntityController::new(
            h.entity.clone(),
            h.store.clone() as Arc<dyn Store>,
            h.cache.clone(),
            h.providers.clone(),
            h.forge.config(),
            h.bus.clone(),
            CallMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_existing_scale_sets_get_workers_on_start() {
        let h = harness().await;
        h.forge.mount_scale_set_create(42, 1).await;
        let row = h.store.create_scale_set(new_scale_set(&h.entity)).await.unwrap();

        let controller = controller(&h);
        controller.start().await.unwrap();

        for _ in 0..100 {
            if controller.scale_set_status(row.id).map(|s| s.is_running) == Some(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            controller.scale_set_status(row.id).map(|s| s.is_running),
            Some(true)
        );
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_scale_set_create_event_spawns_worker() {
        let h = harness().await;
        h.forge.mount_scale_set_create(42, 1).await;

        let controller = controller(&h);
        controller.start().await.unwrap();

        // Created through the watched store after the controller started.
        let row = h.store.create_scale_set(new_scale_set(&h.entity)).await.unwrap();

        for _ in 0..100 {
            if controller.scale_set_status(row.id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(controller.scale_set_status(row.id).is_some());

        // Deleting drops the worker.
        h.store.delete_scale_set(row.id).await.unwrap();
        for _ in 0..100 {
            if controller.scale_set_status(row.id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(controller.scale_set_status(row.id).is_none());
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_create_event_is_ignored() {
        let h = harness().await;
        h.forge.mount_scale_set_create(42, 1).await;
        let row = h.store.create_scale_set(new_scale_set(&h.entity)).await.unwrap();

        let controller = controller(&h);
        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Replaying the create must not spawn a second worker.
        h.bus.publish(ChangeEvent::new(
            OperationType::Create,
            EventPayload::ScaleSet(row.clone()),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.workers.lock().unwrap().len(), 1);
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_credentials_rotation_reaches_clients() {
        let h = harness().await;
        let controller = controller(&h);
        controller.start().await.unwrap();

        let mut rotated = h.entity.credentials.clone();
        rotated.secret = "ghp_rotated".to_string();
        h.store.update_credentials(rotated).await.unwrap();

        for _ in 0..100 {
            if controller.actions.rest().entity().credentials.secret == "ghp_rotated" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            controller.actions.rest().entity().credentials.secret,
            "ghp_rotated"
        );
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness().await;
        let controller = controller(&h);
        controller.start().await.unwrap();
        controller.stop().await;
        controller.stop().await;
        // The consumer slot is free again after stop.
        assert_eq!(h.bus.consumer_count(), 0);
    }
}
