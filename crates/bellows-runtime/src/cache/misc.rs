use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use bellows_core::forge::ForgeEndpoint;

/// Process-wide endpoint mirror, keyed by endpoint name.
pub struct EndpointCache {
    inner: RwLock<HashMap<String, ForgeEndpoint>>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_endpoint(&self, endpoint: ForgeEndpoint) {
        let mut inner = self.inner.write().unwrap();
        inner.insert(endpoint.name.clone(), endpoint);
    }

    pub fn get_endpoint(&self, name: &str) -> Option<ForgeEndpoint> {
        self.inner.read().unwrap().get(name).cloned()
    }

    pub fn delete_endpoint(&self, name: &str) {
        self.inner.write().unwrap().remove(name);
    }

    /// All cached endpoints, sorted by name.
    pub fn all_endpoints(&self) -> Vec<ForgeEndpoint> {
        let mut endpoints: Vec<_> = self.inner.read().unwrap().values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }
}

impl Default for EndpointCache {
    fn default() -> Self {
        Self::new()
    }
}

/// How long a resolved runner group ID stays valid.
const RUNNER_GROUP_TTL: i64 = 3600;

struct RunnerGroupEntry {
    id: i64,
    cached_at: DateTime<Utc>,
}

/// Cache of resolved runner group IDs, keyed by entity and group name.
///
/// Group IDs are stable but groups can be recreated; entries age out after
/// an hour and are re-resolved against the forge.
pub struct RunnerGroupCache {
    inner: RwLock<HashMap<(Uuid, String), RunnerGroupEntry>>,
}

impl RunnerGroupCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_group_id(&self, entity_id: Uuid, group_name: &str, id: i64) {
        self.set_group_id_at(entity_id, group_name, id, Utc::now());
    }

    fn set_group_id_at(&self, entity_id: Uuid, group_name: &str, id: i64, now: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap();
        inner.insert(
            (entity_id, group_name.to_string()),
            RunnerGroupEntry { id, cached_at: now },
        );
    }

    pub fn get_group_id(&self, entity_id: Uuid, group_name: &str) -> Option<i64> {
        self.get_group_id_at(entity_id, group_name, Utc::now())
    }

    fn get_group_id_at(
        &self,
        entity_id: Uuid,
        group_name: &str,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        let inner = self.inner.read().unwrap();
        let entry = inner.get(&(entity_id, group_name.to_string()))?;
        if now - entry.cached_at >= Duration::seconds(RUNNER_GROUP_TTL) {
            return None;
        }
        Some(entry.id)
    }
}

impl Default for RunnerGroupCache {
    fn default() -> Self {
        Self::new()
    }
}
