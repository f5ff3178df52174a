//! Keeps the coordination cache in step with the watcher bus.
//!
//! One subscriber with an accept-everything filter applies each change
//! event to the matching sub-cache. On startup the caller hydrates the
//! cache from the store; from then on this task keeps the mirror warm.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use bellows_core::error::Result;
use bellows_core::events::{with_everything, ChangeEvent, EventPayload, OperationType};
use bellows_core::store::Store;

use crate::cache::Cache;
use crate::watcher::Bus;

/// Applies watcher events to the coordination cache.
pub struct CacheSync {
    cache: Arc<Cache>,
    bus: Arc<Bus>,
    cancel: Mutex<Option<CancellationToken>>,
    loop_exited: Mutex<Option<oneshot::Receiver<()>>>,
}

impl CacheSync {
    pub fn new(cache: Arc<Cache>, bus: Arc<Bus>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            bus,
            cancel: Mutex::new(None),
            loop_exited: Mutex::new(None),
        })
    }

    /// Fill the cache from the store. Called once before starting.
    pub async fn hydrate(&self, store: &Arc<dyn Store>) -> Result<()> {
        for endpoint in store.list_endpoints().await? {
            self.cache.endpoints.set_endpoint(endpoint);
        }
        for credentials in store.list_credentials().await? {
            self.cache.credentials.set_credentials(credentials);
        }
        for entity in store.list_entities().await? {
            self.cache.entities.set_entity(entity.clone());
            for pool in store.list_entity_pools(entity.id).await? {
                self.cache.entities.set_pool(pool);
            }
            for scale_set in store.list_entity_scale_sets(entity.id).await? {
                self.cache.entities.set_scale_set(scale_set);
            }
        }
        for instance in store.list_instances().await? {
            self.cache.instances.set_instance(instance);
        }
        tracing::info!("coordination cache hydrated");
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut cancel_slot = self.cancel.lock().unwrap();
            if cancel_slot.is_some() {
                return Ok(());
            }
            *cancel_slot = Some(CancellationToken::new());
        }
        let consumer = self.bus.register_consumer("cache-sync", with_everything())?;
        let cancel = self.cancel.lock().unwrap().clone().unwrap();
        let (exited_tx, exited_rx) = oneshot::channel();
        *self.loop_exited.lock().unwrap() = Some(exited_rx);

        let sync = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = consumer.recv() => {
                        let Some(event) = event else { break };
                        sync.apply(event);
                    }
                }
            }
            consumer.close();
            let _ = exited_tx.send(());
        });
        Ok(())
    }

    pub async fn stop(&self) {
        let cancel = self.cancel.lock().unwrap().take();
        let Some(cancel) = cancel else { return };
        cancel.cancel();
        let exited = self.loop_exited.lock().unwrap().take();
        if let Some(exited) = exited {
            let _ = exited.await;
        }
    }

    fn apply(&self, event: ChangeEvent) {
        let deleted = event.operation == OperationType::Delete;
        match event.payload {
            EventPayload::Endpoint(endpoint) => {
                if deleted {
                    self.cache.endpoints.delete_endpoint(&endpoint.name);
                } else {
                    self.cache.endpoints.set_endpoint(endpoint);
                }
            }
            EventPayload::Credentials(credentials) => {
                if deleted {
                    self.cache
                        .credentials
                        .delete_credentials(credentials.forge_kind(), credentials.id);
                } else {
                    self.cache.credentials.set_credentials(credentials);
                }
            }
            EventPayload::Entity(entity) => {
                if deleted {
                    self.cache.tools.delete_tools(entity.id);
                    self.cache.entities.delete_entity(entity.id);
                } else {
                    self.cache.entities.set_entity(entity);
                }
            }
            EventPayload::Pool(pool) => {
                if deleted {
                    self.cache
                        .entities
                        .delete_pool(pool.scope.entity_id(), pool.id);
                } else {
                    self.cache.entities.set_pool(pool);
                }
            }
            EventPayload::ScaleSet(scale_set) => {
                if deleted {
                    self.cache
                        .entities
                        .delete_scale_set(scale_set.scope.entity_id(), scale_set.id);
                } else {
                    self.cache.entities.set_scale_set(scale_set);
                }
            }
            EventPayload::Instance(instance) => {
                if deleted {
                    self.cache.instances.delete_instance(&instance.name);
                } else {
                    self.cache.instances.set_instance(instance);
                }
            }
            EventPayload::Job(_) => {}
        }
    }
}
