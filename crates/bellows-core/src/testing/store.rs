use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{BellowsError, Result};
use crate::forge::{ForgeCredentials, ForgeEndpoint, ForgeEntity, GITHUB_COM_ENDPOINT};
use crate::instance::{Instance, InstanceUpdate, StatusMessage};
use crate::job::Job;
use crate::pool::Pool;
use crate::scaleset::{ScaleSet, ScaleSetUpdate};
use crate::store::{NewScaleSet, Store};

#[derive(Default)]
struct Inner {
    endpoints: HashMap<String, ForgeEndpoint>,
    credentials: HashMap<i64, ForgeCredentials>,
    entities: HashMap<Uuid, ForgeEntity>,
    pools: HashMap<Uuid, Pool>,
    scale_sets: HashMap<i64, ScaleSet>,
    instances: HashMap<String, Instance>,
    jobs: HashMap<i64, Job>,
    next_credentials_id: i64,
    next_scale_set_id: i64,
}

/// In-memory [`Store`] implementation for tests.
///
/// Mutations take a single writer lock, so per-instance update ordering is
/// trivially serialised.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_credentials_id: 1,
                next_scale_set_id: 1,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_endpoint(&self, endpoint: ForgeEndpoint) -> Result<ForgeEndpoint> {
        let mut inner = self.inner.write().unwrap();
        if inner.endpoints.contains_key(&endpoint.name) {
            return Err(BellowsError::Conflict(format!(
                "endpoint {} already exists",
                endpoint.name
            )));
        }
        inner.endpoints.insert(endpoint.name.clone(), endpoint.clone());
        Ok(endpoint)
    }

    async fn get_endpoint(&self, name: &str) -> Result<ForgeEndpoint> {
        let inner = self.inner.read().unwrap();
        inner
            .endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| BellowsError::NotFound(format!("endpoint {}", name)))
    }

    async fn list_endpoints(&self) -> Result<Vec<ForgeEndpoint>> {
        let inner = self.inner.read().unwrap();
        let mut endpoints: Vec<_> = inner.endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(endpoints)
    }

    async fn delete_endpoint(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.endpoints.contains_key(name) {
            return Err(BellowsError::NotFound(format!("endpoint {}", name)));
        }
        if name == GITHUB_COM_ENDPOINT {
            return Err(BellowsError::BadRequest(
                "the github.com endpoint is reserved".to_string(),
            ));
        }
        if inner.credentials.values().any(|c| c.endpoint.name == name) {
            return Err(BellowsError::Conflict(format!(
                "endpoint {} still has credentials attached",
                name
            )));
        }
        inner.endpoints.remove(name);
        Ok(())
    }

    async fn create_credentials(&self, mut credentials: ForgeCredentials) -> Result<ForgeCredentials> {
        let mut inner = self.inner.write().unwrap();
        if credentials.id == 0 {
            credentials.id = inner.next_credentials_id;
        }
        if inner.credentials.contains_key(&credentials.id) {
            return Err(BellowsError::Conflict(format!(
                "credentials {} already exist",
                credentials.id
            )));
        }
        if inner
            .credentials
            .values()
            .any(|c| c.endpoint.name == credentials.endpoint.name && c.name == credentials.name)
        {
            return Err(BellowsError::Conflict(format!(
                "credentials named {} already exist for endpoint {}",
                credentials.name, credentials.endpoint.name
            )));
        }
        inner.next_credentials_id = inner.next_credentials_id.max(credentials.id) + 1;
        inner.credentials.insert(credentials.id, credentials.clone());
        Ok(credentials)
    }

    async fn get_credentials(&self, id: i64) -> Result<ForgeCredentials> {
        let inner = self.inner.read().unwrap();
        inner
            .credentials
            .get(&id)
            .cloned()
            .ok_or_else(|| BellowsError::NotFound(format!("credentials {}", id)))
    }

    async fn list_credentials(&self) -> Result<Vec<ForgeCredentials>> {
        let inner = self.inner.read().unwrap();
        let mut credentials: Vec<_> = inner.credentials.values().cloned().collect();
        credentials.sort_by_key(|c| c.id);
        Ok(credentials)
    }

    async fn update_credentials(&self, mut credentials: ForgeCredentials) -> Result<ForgeCredentials> {
        let mut inner = self.inner.write().unwrap();
        if !inner.credentials.contains_key(&credentials.id) {
            return Err(BellowsError::NotFound(format!("credentials {}", credentials.id)));
        }
        credentials.updated_at = Utc::now();
        inner.credentials.insert(credentials.id, credentials.clone());
        Ok(credentials)
    }

    async fn delete_credentials(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.entities.values().any(|e| e.credentials.id == id) {
            return Err(BellowsError::Conflict(format!(
                "credentials {} are referenced by an entity",
                id
            )));
        }
        inner
            .credentials
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BellowsError::NotFound(format!("credentials {}", id)))
    }

    async fn create_entity(&self, entity: ForgeEntity) -> Result<ForgeEntity> {
        let mut inner = self.inner.write().unwrap();
        if inner.entities.contains_key(&entity.id) {
            return Err(BellowsError::Conflict(format!("entity {} already exists", entity.id)));
        }
        inner.entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn get_entity(&self, id: Uuid) -> Result<ForgeEntity> {
        let inner = self.inner.read().unwrap();
        inner
            .entities
            .get(&id)
            .cloned()
            .ok_or_else(|| BellowsError::NotFound(format!("entity {}", id)))
    }

    async fn list_entities(&self) -> Result<Vec<ForgeEntity>> {
        let inner = self.inner.read().unwrap();
        let mut entities: Vec<_> = inner.entities.values().cloned().collect();
        entities.sort_by_key(|e| e.created_at);
        Ok(entities)
    }

    async fn update_entity(&self, mut entity: ForgeEntity) -> Result<ForgeEntity> {
        let mut inner = self.inner.write().unwrap();
        if !inner.entities.contains_key(&entity.id) {
            return Err(BellowsError::NotFound(format!("entity {}", entity.id)));
        }
        entity.updated_at = Utc::now();
        inner.entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn delete_entity(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .entities
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BellowsError::NotFound(format!("entity {}", id)))
    }

    async fn create_pool(&self, pool: Pool) -> Result<Pool> {
        let mut inner = self.inner.write().unwrap();
        if inner.pools.contains_key(&pool.id) {
            return Err(BellowsError::Conflict(format!("pool {} already exists", pool.id)));
        }
        inner.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    async fn get_pool(&self, id: Uuid) -> Result<Pool> {
        let inner = self.inner.read().unwrap();
        inner
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| BellowsError::NotFound(format!("pool {}", id)))
    }

    async fn list_entity_pools(&self, entity_id: Uuid) -> Result<Vec<Pool>> {
        let inner = self.inner.read().unwrap();
        let mut pools: Vec<_> = inner
            .pools
            .values()
            .filter(|p| p.scope.entity_id() == entity_id)
            .cloned()
            .collect();
        pools.sort_by_key(|p| p.created_at);
        Ok(pools)
    }

    async fn delete_pool(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .pools
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BellowsError::NotFound(format!("pool {}", id)))
    }

    async fn create_scale_set(&self, scale_set: NewScaleSet) -> Result<ScaleSet> {
        let mut inner = self.inner.write().unwrap();
        let id = inner.next_scale_set_id;
        inner.next_scale_set_id += 1;
        let now = Utc::now();
        let row = ScaleSet {
            id,
            scale_set_id: 0,
            name: scale_set.name,
            scope: scale_set.scope,
            provider_name: scale_set.provider_name,
            min_runners: scale_set.min_runners,
            max_runners: scale_set.max_runners,
            image: scale_set.image,
            flavor: scale_set.flavor,
            os_type: scale_set.os_type,
            os_arch: scale_set.os_arch,
            runner_group: scale_set.runner_group,
            last_message_id: 0,
            desired_runner_count: 0,
            enabled: scale_set.enabled,
            runner_bootstrap_timeout_minutes: scale_set.runner_bootstrap_timeout_minutes,
            runner_prefix: scale_set.runner_prefix,
            extra_specs: scale_set.extra_specs,
            created_at: now,
            updated_at: now,
        };
        inner.scale_sets.insert(id, row.clone());
        Ok(row)
    }

    async fn get_scale_set(&self, id: i64) -> Result<ScaleSet> {
        let inner = self.inner.read().unwrap();
        inner
            .scale_sets
            .get(&id)
            .cloned()
            .ok_or_else(|| BellowsError::NotFound(format!("scale set {}", id)))
    }

    async fn list_entity_scale_sets(&self, entity_id: Uuid) -> Result<Vec<ScaleSet>> {
        let inner = self.inner.read().unwrap();
        let mut scale_sets: Vec<_> = inner
            .scale_sets
            .values()
            .filter(|s| s.scope.entity_id() == entity_id)
            .cloned()
            .collect();
        scale_sets.sort_by_key(|s| s.id);
        Ok(scale_sets)
    }

    async fn list_scale_sets(&self) -> Result<Vec<ScaleSet>> {
        let inner = self.inner.read().unwrap();
        let mut scale_sets: Vec<_> = inner.scale_sets.values().cloned().collect();
        scale_sets.sort_by_key(|s| s.id);
        Ok(scale_sets)
    }

    async fn update_scale_set(&self, id: i64, update: ScaleSetUpdate) -> Result<ScaleSet> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .scale_sets
            .get_mut(&id)
            .ok_or_else(|| BellowsError::NotFound(format!("scale set {}", id)))?;
        if let Some(name) = update.name {
            row.name = name;
        }
        if let Some(min_runners) = update.min_runners {
            row.min_runners = min_runners;
        }
        if let Some(max_runners) = update.max_runners {
            row.max_runners = max_runners;
        }
        if let Some(image) = update.image {
            row.image = image;
        }
        if let Some(flavor) = update.flavor {
            row.flavor = flavor;
        }
        if let Some(runner_group) = update.runner_group {
            row.runner_group = runner_group;
        }
        if let Some(enabled) = update.enabled {
            row.enabled = enabled;
        }
        if let Some(extra_specs) = update.extra_specs {
            row.extra_specs = extra_specs;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn set_scale_set_forge_id(&self, id: i64, scale_set_id: i64) -> Result<ScaleSet> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .scale_sets
            .get_mut(&id)
            .ok_or_else(|| BellowsError::NotFound(format!("scale set {}", id)))?;
        row.scale_set_id = scale_set_id;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn set_scale_set_message_cursor(
        &self,
        id: i64,
        last_message_id: i64,
        desired_runner_count: u32,
    ) -> Result<ScaleSet> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .scale_sets
            .get_mut(&id)
            .ok_or_else(|| BellowsError::NotFound(format!("scale set {}", id)))?;
        row.last_message_id = last_message_id;
        row.desired_runner_count = desired_runner_count;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn delete_scale_set(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .scale_sets
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BellowsError::NotFound(format!("scale set {}", id)))
    }

    async fn create_instance(&self, instance: Instance) -> Result<Instance> {
        let mut inner = self.inner.write().unwrap();
        if inner.instances.contains_key(&instance.name) {
            return Err(BellowsError::Conflict(format!(
                "instance {} already exists",
                instance.name
            )));
        }
        inner.instances.insert(instance.name.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, name: &str) -> Result<Instance> {
        let inner = self.inner.read().unwrap();
        inner
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| BellowsError::NotFound(format!("instance {}", name)))
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let inner = self.inner.read().unwrap();
        let mut instances: Vec<_> = inner.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>> {
        let inner = self.inner.read().unwrap();
        let mut instances: Vec<_> = inner
            .instances
            .values()
            .filter(|i| i.pool_id == Some(pool_id))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn list_scale_set_instances(&self, scale_set_id: i64) -> Result<Vec<Instance>> {
        let inner = self.inner.read().unwrap();
        let mut instances: Vec<_> = inner
            .instances
            .values()
            .filter(|i| i.scale_set_id == Some(scale_set_id))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn update_instance(&self, name: &str, update: InstanceUpdate) -> Result<Instance> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .instances
            .get_mut(name)
            .ok_or_else(|| BellowsError::NotFound(format!("instance {}", name)))?;
        if let Some(provider_id) = update.provider_id {
            row.provider_id = Some(provider_id);
        }
        if let Some(agent_id) = update.agent_id {
            row.agent_id = agent_id;
        }
        if let Some(os_name) = update.os_name {
            row.os_name = os_name;
        }
        if let Some(os_version) = update.os_version {
            row.os_version = os_version;
        }
        if let Some(addresses) = update.addresses {
            row.addresses = addresses;
        }
        if let Some(provider_status) = update.provider_status {
            row.provider_status = provider_status;
        }
        if let Some(runner_status) = update.runner_status {
            row.runner_status = runner_status;
        }
        if let Some(provider_fault) = update.provider_fault {
            row.provider_fault = Some(provider_fault);
        }
        if let Some(message) = update.status_message {
            row.status_messages.push(StatusMessage {
                created_at: Utc::now(),
                message,
                event_level: "info".to_string(),
            });
        }
        if let Some(create_attempt) = update.create_attempt {
            row.create_attempt = create_attempt;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .instances
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BellowsError::NotFound(format!("instance {}", name)))
    }

    async fn record_job(&self, job: Job) -> Result<Job> {
        let mut inner = self.inner.write().unwrap();
        inner.jobs.insert(job.runner_request_id, job.clone());
        Ok(job)
    }

    async fn list_entity_jobs(&self, entity_id: Uuid) -> Result<Vec<Job>> {
        let inner = self.inner.read().unwrap();
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.entity_id == entity_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.runner_request_id);
        Ok(jobs)
    }

    async fn delete_job(&self, runner_request_id: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.jobs.remove(&runner_request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::{EntityKind, ForgeKind};
    use crate::instance::{ProviderStatus, RunnerStatus};
    use crate::testing::{sample_credentials, sample_endpoint, sample_entity, sample_instance};

    #[tokio::test]
    async fn test_reserved_endpoint_refuses_deletion() {
        let store = MemStore::new();
        store
            .create_endpoint(sample_endpoint(ForgeKind::Github))
            .await
            .unwrap();
        let err = store.delete_endpoint("github.com").await.unwrap_err();
        assert!(matches!(err, BellowsError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_endpoint_with_credentials_refuses_deletion() {
        let store = MemStore::new();
        store
            .create_endpoint(sample_endpoint(ForgeKind::Gitea))
            .await
            .unwrap();
        store
            .create_credentials(sample_credentials(1, ForgeKind::Gitea))
            .await
            .unwrap();
        let err = store.delete_endpoint("gitea.internal").await.unwrap_err();
        assert!(matches!(err, BellowsError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_referenced_credentials_refuse_deletion() {
        let store = MemStore::new();
        let creds = store
            .create_credentials(sample_credentials(1, ForgeKind::Github))
            .await
            .unwrap();
        store
            .create_entity(sample_entity(EntityKind::Organization, creds.clone()))
            .await
            .unwrap();
        let err = store.delete_credentials(creds.id).await.unwrap_err();
        assert!(matches!(err, BellowsError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_instance_update_appends_status_message() {
        let store = MemStore::new();
        store
            .create_instance(sample_instance("r1", 1))
            .await
            .unwrap();

        let updated = store
            .update_instance(
                "r1",
                InstanceUpdate {
                    provider_status: Some(ProviderStatus::Running),
                    runner_status: Some(RunnerStatus::Idle),
                    status_message: Some("runner installed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.provider_status, ProviderStatus::Running);
        assert_eq!(updated.runner_status, RunnerStatus::Idle);
        assert_eq!(updated.status_messages.len(), 1);
    }

    #[tokio::test]
    async fn test_scale_set_cursor_updates() {
        let store = MemStore::new();
        let creds = sample_credentials(1, ForgeKind::Github);
        let entity = sample_entity(EntityKind::Organization, creds);
        let row = store
            .create_scale_set(NewScaleSet {
                name: "default".to_string(),
                scope: crate::forge::EntityScope::for_entity(&entity),
                provider_name: "test".to_string(),
                min_runners: 0,
                max_runners: 5,
                image: "ubuntu".to_string(),
                flavor: "small".to_string(),
                os_type: crate::os::OsType::Linux,
                os_arch: crate::os::OsArch::Amd64,
                runner_group: "Default".to_string(),
                enabled: true,
                runner_bootstrap_timeout_minutes: 20,
                runner_prefix: "bellows".to_string(),
                extra_specs: serde_json::Value::Null,
            })
            .await
            .unwrap();
        assert_eq!(row.scale_set_id, 0);

        let row = store.set_scale_set_forge_id(row.id, 42).await.unwrap();
        assert_eq!(row.scale_set_id, 42);

        let row = store
            .set_scale_set_message_cursor(row.id, 7, 2)
            .await
            .unwrap();
        assert_eq!(row.last_message_id, 7);
        assert_eq!(row.desired_runner_count, 2);
    }
}
