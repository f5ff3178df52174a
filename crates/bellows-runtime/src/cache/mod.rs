//! Process-wide coordination cache.
//!
//! A read-mostly mirror of the database, repopulated from the change
//! watcher. A miss is never an error on its own; callers fall back to the
//! store. No cache lock is ever held across a network call.

mod credentials;
mod entities;
mod instances;
mod misc;
mod tools;

pub use credentials::{CredentialsCache, CredentialsCallback};
pub use entities::EntityCache;
pub use instances::InstanceCache;
pub use misc::{EndpointCache, RunnerGroupCache};
pub use tools::ToolsCache;

use std::sync::Arc;

use uuid::Uuid;

/// All coordination caches wired together.
///
/// Credential updates fan out to cached entities through the credentials
/// cache's callback; the callback runs under the entity cache's lock, never
/// the credentials cache's.
pub struct Cache {
    pub credentials: Arc<CredentialsCache>,
    pub entities: Arc<EntityCache>,
    pub endpoints: Arc<EndpointCache>,
    pub instances: Arc<InstanceCache>,
    pub tools: Arc<ToolsCache>,
    pub runner_groups: Arc<RunnerGroupCache>,
}

impl Cache {
    pub fn new() -> Arc<Self> {
        let credentials = Arc::new(CredentialsCache::new());
        let entities = Arc::new(EntityCache::new(credentials.clone()));

        let fanout = Arc::downgrade(&entities);
        credentials.on_update(Box::new(move |creds| {
            if let Some(entities) = fanout.upgrade() {
                entities.apply_credentials(creds);
            }
        }));

        Arc::new(Self {
            credentials,
            entities,
            endpoints: Arc::new(EndpointCache::new()),
            instances: Arc::new(InstanceCache::new()),
            tools: Arc::new(ToolsCache::new()),
            runner_groups: Arc::new(RunnerGroupCache::new()),
        })
    }

    /// Resolve the entity owning an instance, via its scale set first and
    /// its pool second.
    pub fn entity_for_instance(&self, name: &str) -> Option<Uuid> {
        let instance = self.instances.get_instance(name)?;
        if let Some(scale_set_id) = instance.scale_set_id {
            if let Some((entity_id, _)) = self.entities.scale_set_by_id(scale_set_id) {
                return Some(entity_id);
            }
        }
        if let Some(pool_id) = instance.pool_id {
            if let Some((entity_id, _)) = self.entities.pool_by_id(pool_id) {
                return Some(entity_id);
            }
        }
        None
    }
}
