use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use bellows_core::instance::Instance;

/// Process-wide instance mirror, keyed by instance name.
pub struct InstanceCache {
    inner: RwLock<HashMap<String, Instance>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_instance(&self, instance: Instance) {
        let mut inner = self.inner.write().unwrap();
        inner.insert(instance.name.clone(), instance);
    }

    pub fn get_instance(&self, name: &str) -> Option<Instance> {
        self.inner.read().unwrap().get(name).cloned()
    }

    pub fn delete_instance(&self, name: &str) {
        self.inner.write().unwrap().remove(name);
    }

    /// All cached instances, sorted by name.
    pub fn all_instances(&self) -> Vec<Instance> {
        let mut instances: Vec<_> = self.inner.read().unwrap().values().cloned().collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        instances
    }

    /// Instances owned by one scale set, sorted by name.
    pub fn scale_set_instances(&self, scale_set_id: i64) -> Vec<Instance> {
        let mut instances: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|i| i.scale_set_id == Some(scale_set_id))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        instances
    }

    /// Instances owned by one pool, sorted by name.
    pub fn pool_instances(&self, pool_id: Uuid) -> Vec<Instance> {
        let mut instances: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|i| i.pool_id == Some(pool_id))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        instances
    }
}

impl Default for InstanceCache {
    fn default() -> Self {
        Self::new()
    }
}
