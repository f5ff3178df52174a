use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use bellows_core::forge::ForgeEntity;
use bellows_core::pool::Pool;
use bellows_core::scaleset::ScaleSet;

use super::credentials::CredentialsCache;

struct EntityEntry {
    entity: ForgeEntity,
    pools: HashMap<Uuid, Pool>,
    scale_sets: HashMap<i64, ScaleSet>,
}

/// Process-wide entity mirror with pools and scale sets nested per entity.
///
/// Reads refresh the embedded credentials from the credentials cache, so a
/// credential edit is visible on the next `get_entity` without any entity
/// row being rewritten.
pub struct EntityCache {
    inner: RwLock<HashMap<Uuid, EntityEntry>>,
    credentials: Arc<CredentialsCache>,
}

impl EntityCache {
    pub fn new(credentials: Arc<CredentialsCache>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            credentials,
        }
    }

    /// Insert or replace an entity, preserving any nested pools and scale
    /// sets already cached for it.
    pub fn set_entity(&self, entity: ForgeEntity) {
        let mut inner = self.inner.write().unwrap();
        match inner.get_mut(&entity.id) {
            Some(entry) => entry.entity = entity,
            None => {
                inner.insert(
                    entity.id,
                    EntityEntry {
                        entity,
                        pools: HashMap::new(),
                        scale_sets: HashMap::new(),
                    },
                );
            }
        }
    }

    /// Fetch an entity with its credentials refreshed from the credentials
    /// cache.
    pub fn get_entity(&self, id: Uuid) -> Option<ForgeEntity> {
        let mut entity = {
            let inner = self.inner.read().unwrap();
            inner.get(&id)?.entity.clone()
        };
        if let Some(creds) = self
            .credentials
            .get_credentials(entity.forge_kind(), entity.credentials.id)
        {
            entity.credentials = creds;
        }
        Some(entity)
    }

    pub fn delete_entity(&self, id: Uuid) {
        self.inner.write().unwrap().remove(&id);
    }

    /// All cached entities, sorted by creation time.
    pub fn all_entities(&self) -> Vec<ForgeEntity> {
        let mut entities: Vec<_> = {
            let inner = self.inner.read().unwrap();
            inner.values().map(|e| e.entity.clone()).collect()
        };
        entities.sort_by_key(|e| e.created_at);
        entities
    }

    /// Entities referencing the given credentials.
    pub fn using_credentials(&self, credentials_id: i64) -> Vec<ForgeEntity> {
        let inner = self.inner.read().unwrap();
        let mut entities: Vec<_> = inner
            .values()
            .filter(|e| e.entity.credentials.id == credentials_id)
            .map(|e| e.entity.clone())
            .collect();
        entities.sort_by_key(|e| e.created_at);
        entities
    }

    /// Rewrite the embedded credentials on every entity that references
    /// them. Invoked by the credentials cache's update callback.
    pub fn apply_credentials(&self, credentials: &bellows_core::forge::ForgeCredentials) {
        let mut inner = self.inner.write().unwrap();
        for entry in inner.values_mut() {
            if entry.entity.credentials.id == credentials.id {
                entry.entity.credentials = credentials.clone();
            }
        }
    }

    /// Cache a pool under its owning entity. A miss on the entity is not an
    /// error; the pool is dropped and re-read from the store later.
    pub fn set_pool(&self, pool: Pool) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.get_mut(&pool.scope.entity_id()) {
            entry.pools.insert(pool.id, pool);
        }
    }

    pub fn delete_pool(&self, entity_id: Uuid, pool_id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.get_mut(&entity_id) {
            entry.pools.remove(&pool_id);
        }
    }

    /// Cache a scale set under its owning entity.
    pub fn set_scale_set(&self, scale_set: ScaleSet) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.get_mut(&scale_set.scope.entity_id()) {
            entry.scale_sets.insert(scale_set.id, scale_set);
        }
    }

    pub fn delete_scale_set(&self, entity_id: Uuid, scale_set_id: i64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.get_mut(&entity_id) {
            entry.scale_sets.remove(&scale_set_id);
        }
    }

    /// Pools cached for one entity, sorted by creation time.
    pub fn entity_pools(&self, entity_id: Uuid) -> Vec<Pool> {
        let mut pools: Vec<_> = {
            let inner = self.inner.read().unwrap();
            inner
                .get(&entity_id)
                .map(|e| e.pools.values().cloned().collect())
                .unwrap_or_default()
        };
        pools.sort_by_key(|p| p.created_at);
        pools
    }

    /// Scale sets cached for one entity, sorted by ID.
    pub fn entity_scale_sets(&self, entity_id: Uuid) -> Vec<ScaleSet> {
        let mut scale_sets: Vec<_> = {
            let inner = self.inner.read().unwrap();
            inner
                .get(&entity_id)
                .map(|e| e.scale_sets.values().cloned().collect())
                .unwrap_or_default()
        };
        scale_sets.sort_by_key(|s| s.id);
        scale_sets
    }

    /// Resolve a pool to its owning entity by pool ID.
    pub fn pool_by_id(&self, pool_id: Uuid) -> Option<(Uuid, Pool)> {
        let inner = self.inner.read().unwrap();
        for (entity_id, entry) in inner.iter() {
            if let Some(pool) = entry.pools.get(&pool_id) {
                return Some((*entity_id, pool.clone()));
            }
        }
        None
    }

    /// Resolve a scale set to its owning entity by scale set ID.
    pub fn scale_set_by_id(&self, scale_set_id: i64) -> Option<(Uuid, ScaleSet)> {
        let inner = self.inner.read().unwrap();
        for (entity_id, entry) in inner.iter() {
            if let Some(scale_set) = entry.scale_sets.get(&scale_set_id) {
                return Some((*entity_id, scale_set.clone()));
            }
        }
        None
    }

    /// Enabled pools of an entity whose tag set contains every requested
    /// label, case-insensitive.
    pub fn find_pools_matching_all_tags(&self, entity_id: Uuid, labels: &[String]) -> Vec<Pool> {
        self.entity_pools(entity_id)
            .into_iter()
            .filter(|p| p.enabled && p.has_required_labels(labels))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bellows_core::forge::{EntityKind, EntityScope, ForgeKind};
    use bellows_core::os::{OsArch, OsType};
    use bellows_core::testing::{sample_credentials, sample_entity, sample_scale_set};
    use chrono::Utc;

    fn cache() -> (Arc<CredentialsCache>, EntityCache) {
        let credentials = Arc::new(CredentialsCache::new());
        let entities = EntityCache::new(credentials.clone());
        (credentials, entities)
    }

    fn pool_with_tags(entity: &ForgeEntity, tags: &[&str], enabled: bool) -> Pool {
        Pool {
            id: Uuid::new_v4(),
            scope: EntityScope::for_entity(entity),
            provider_name: "test".to_string(),
            min_idle_runners: 0,
            max_runners: 4,
            image: "ubuntu:24.04".to_string(),
            flavor: "default".to_string(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            enabled,
            runner_group: String::new(),
            runner_bootstrap_timeout_minutes: 20,
            extra_specs: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_set_entity_preserves_children() {
        let (_, cache) = cache();
        let creds = sample_credentials(1, ForgeKind::Github);
        let mut entity = sample_entity(EntityKind::Organization, creds);
        cache.set_entity(entity.clone());
        cache.set_scale_set(sample_scale_set(1, &entity));

        entity.webhook_secret = "rotated".to_string();
        cache.set_entity(entity.clone());

        assert_eq!(cache.entity_scale_sets(entity.id).len(), 1);
        assert_eq!(
            cache.get_entity(entity.id).unwrap().webhook_secret,
            "rotated"
        );
    }

    #[test]
    fn test_get_entity_refreshes_credentials() {
        let (credentials, cache) = cache();
        let creds = sample_credentials(1, ForgeKind::Github);
        let entity = sample_entity(EntityKind::Organization, creds.clone());
        cache.set_entity(entity.clone());

        let mut rotated = creds.clone();
        rotated.secret = "ghp_rotated".to_string();
        credentials.set_credentials(rotated);

        let fetched = cache.get_entity(entity.id).unwrap();
        assert_eq!(fetched.credentials.secret, "ghp_rotated");
    }

    #[test]
    fn test_back_indices() {
        let (_, cache) = cache();
        let creds = sample_credentials(1, ForgeKind::Github);
        let entity = sample_entity(EntityKind::Organization, creds);
        cache.set_entity(entity.clone());

        let pool = pool_with_tags(&entity, &["self-hosted"], true);
        cache.set_pool(pool.clone());
        let scale_set = sample_scale_set(9, &entity);
        cache.set_scale_set(scale_set.clone());

        assert_eq!(cache.pool_by_id(pool.id).unwrap().0, entity.id);
        assert_eq!(cache.scale_set_by_id(9).unwrap().0, entity.id);
        assert!(cache.pool_by_id(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_find_pools_matching_all_tags() {
        let (_, cache) = cache();
        let creds = sample_credentials(1, ForgeKind::Github);
        let entity = sample_entity(EntityKind::Organization, creds);
        cache.set_entity(entity.clone());

        let gpu = pool_with_tags(&entity, &["self-hosted", "Linux", "GPU"], true);
        let plain = pool_with_tags(&entity, &["self-hosted", "linux"], true);
        let disabled = pool_with_tags(&entity, &["self-hosted", "linux", "gpu"], false);
        cache.set_pool(gpu.clone());
        cache.set_pool(plain);
        cache.set_pool(disabled);

        let matched =
            cache.find_pools_matching_all_tags(entity.id, &["gpu".to_string(), "linux".to_string()]);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, gpu.id);

        let all = cache.find_pools_matching_all_tags(entity.id, &["self-hosted".to_string()]);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_all_entities_sorted_by_creation() {
        let (_, cache) = cache();
        let creds = sample_credentials(1, ForgeKind::Github);
        let mut first = sample_entity(EntityKind::Organization, creds.clone());
        first.created_at = Utc::now() - chrono::Duration::hours(1);
        let second = sample_entity(EntityKind::Repository, creds);
        cache.set_entity(second.clone());
        cache.set_entity(first.clone());

        let all = cache.all_entities();
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[1].id, second.id);
    }
}
