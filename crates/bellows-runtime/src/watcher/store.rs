use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use bellows_core::error::Result;
use bellows_core::events::{ChangeEvent, EventPayload, OperationType};
use bellows_core::forge::{ForgeCredentials, ForgeEndpoint, ForgeEntity};
use bellows_core::instance::{Instance, InstanceUpdate};
use bellows_core::job::Job;
use bellows_core::pool::Pool;
use bellows_core::scaleset::{ScaleSet, ScaleSetUpdate};
use bellows_core::store::{NewScaleSet, Store};

use super::Bus;

/// Store decorator that publishes change events after each successful
/// mutation.
///
/// Deletes snapshot the row before removing it so the payload carries the
/// last committed state.
pub struct WatchedStore {
    inner: Arc<dyn Store>,
    bus: Arc<Bus>,
}

impl WatchedStore {
    pub fn new(inner: Arc<dyn Store>, bus: Arc<Bus>) -> Self {
        Self { inner, bus }
    }

    fn publish(&self, operation: OperationType, payload: EventPayload) {
        self.bus.publish(ChangeEvent::new(operation, payload));
    }
}

#[async_trait]
impl Store for WatchedStore {
    async fn create_endpoint(&self, endpoint: ForgeEndpoint) -> Result<ForgeEndpoint> {
        let created = self.inner.create_endpoint(endpoint).await?;
        self.publish(OperationType::Create, EventPayload::Endpoint(created.clone()));
        Ok(created)
    }

    async fn get_endpoint(&self, name: &str) -> Result<ForgeEndpoint> {
        self.inner.get_endpoint(name).await
    }

    async fn list_endpoints(&self) -> Result<Vec<ForgeEndpoint>> {
        self.inner.list_endpoints().await
    }

    async fn delete_endpoint(&self, name: &str) -> Result<()> {
        let snapshot = self.inner.get_endpoint(name).await?;
        self.inner.delete_endpoint(name).await?;
        self.publish(OperationType::Delete, EventPayload::Endpoint(snapshot));
        Ok(())
    }

    async fn create_credentials(&self, credentials: ForgeCredentials) -> Result<ForgeCredentials> {
        let created = self.inner.create_credentials(credentials).await?;
        self.publish(
            OperationType::Create,
            EventPayload::Credentials(created.clone()),
        );
        Ok(created)
    }

    async fn get_credentials(&self, id: i64) -> Result<ForgeCredentials> {
        self.inner.get_credentials(id).await
    }

    async fn list_credentials(&self) -> Result<Vec<ForgeCredentials>> {
        self.inner.list_credentials().await
    }

    async fn update_credentials(&self, credentials: ForgeCredentials) -> Result<ForgeCredentials> {
        let updated = self.inner.update_credentials(credentials).await?;
        self.publish(
            OperationType::Update,
            EventPayload::Credentials(updated.clone()),
        );
        Ok(updated)
    }

    async fn delete_credentials(&self, id: i64) -> Result<()> {
        let snapshot = self.inner.get_credentials(id).await?;
        self.inner.delete_credentials(id).await?;
        self.publish(OperationType::Delete, EventPayload::Credentials(snapshot));
        Ok(())
    }

    async fn create_entity(&self, entity: ForgeEntity) -> Result<ForgeEntity> {
        let created = self.inner.create_entity(entity).await?;
        self.publish(OperationType::Create, EventPayload::Entity(created.clone()));
        Ok(created)
    }

    async fn get_entity(&self, id: Uuid) -> Result<ForgeEntity> {
        self.inner.get_entity(id).await
    }

    async fn list_entities(&self) -> Result<Vec<ForgeEntity>> {
        self.inner.list_entities().await
    }

    async fn update_entity(&self, entity: ForgeEntity) -> Result<ForgeEntity> {
        let updated = self.inner.update_entity(entity).await?;
        self.publish(OperationType::Update, EventPayload::Entity(updated.clone()));
        Ok(updated)
    }

    async fn delete_entity(&self, id: Uuid) -> Result<()> {
        let snapshot = self.inner.get_entity(id).await?;
        self.inner.delete_entity(id).await?;
        self.publish(OperationType::Delete, EventPayload::Entity(snapshot));
        Ok(())
    }

    async fn create_pool(&self, pool: Pool) -> Result<Pool> {
        let created = self.inner.create_pool(pool).await?;
        self.publish(OperationType::Create, EventPayload::Pool(created.clone()));
        Ok(created)
    }

    async fn get_pool(&self, id: Uuid) -> Result<Pool> {
        self.inner.get_pool(id).await
    }

    async fn list_entity_pools(&self, entity_id: Uuid) -> Result<Vec<Pool>> {
        self.inner.list_entity_pools(entity_id).await
    }

    async fn delete_pool(&self, id: Uuid) -> Result<()> {
        let snapshot = self.inner.get_pool(id).await?;
        self.inner.delete_pool(id).await?;
        self.publish(OperationType::Delete, EventPayload::Pool(snapshot));
        Ok(())
    }

    async fn create_scale_set(&self, scale_set: NewScaleSet) -> Result<ScaleSet> {
        let created = self.inner.create_scale_set(scale_set).await?;
        self.publish(
            OperationType::Create,
            EventPayload::ScaleSet(created.clone()),
        );
        Ok(created)
    }

    async fn get_scale_set(&self, id: i64) -> Result<ScaleSet> {
        self.inner.get_scale_set(id).await
    }

    async fn list_entity_scale_sets(&self, entity_id: Uuid) -> Result<Vec<ScaleSet>> {
        self.inner.list_entity_scale_sets(entity_id).await
    }

    async fn list_scale_sets(&self) -> Result<Vec<ScaleSet>> {
        self.inner.list_scale_sets().await
    }

    async fn update_scale_set(&self, id: i64, update: ScaleSetUpdate) -> Result<ScaleSet> {
        let updated = self.inner.update_scale_set(id, update).await?;
        self.publish(
            OperationType::Update,
            EventPayload::ScaleSet(updated.clone()),
        );
        Ok(updated)
    }

    async fn set_scale_set_forge_id(&self, id: i64, scale_set_id: i64) -> Result<ScaleSet> {
        let updated = self.inner.set_scale_set_forge_id(id, scale_set_id).await?;
        self.publish(
            OperationType::Update,
            EventPayload::ScaleSet(updated.clone()),
        );
        Ok(updated)
    }

    async fn set_scale_set_message_cursor(
        &self,
        id: i64,
        last_message_id: i64,
        desired_runner_count: u32,
    ) -> Result<ScaleSet> {
        // Cursor advances happen on every message; they update the mirror
        // but are not worth a bus event per message.
        self.inner
            .set_scale_set_message_cursor(id, last_message_id, desired_runner_count)
            .await
    }

    async fn delete_scale_set(&self, id: i64) -> Result<()> {
        let snapshot = self.inner.get_scale_set(id).await?;
        self.inner.delete_scale_set(id).await?;
        self.publish(OperationType::Delete, EventPayload::ScaleSet(snapshot));
        Ok(())
    }

    async fn create_instance(&self, instance: Instance) -> Result<Instance> {
        let created = self.inner.create_instance(instance).await?;
        self.publish(
            OperationType::Create,
            EventPayload::Instance(created.clone()),
        );
        Ok(created)
    }

    async fn get_instance(&self, name: &str) -> Result<Instance> {
        self.inner.get_instance(name).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.inner.list_instances().await
    }

    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>> {
        self.inner.list_pool_instances(pool_id).await
    }

    async fn list_scale_set_instances(&self, scale_set_id: i64) -> Result<Vec<Instance>> {
        self.inner.list_scale_set_instances(scale_set_id).await
    }

    async fn update_instance(&self, name: &str, update: InstanceUpdate) -> Result<Instance> {
        let updated = self.inner.update_instance(name, update).await?;
        self.publish(
            OperationType::Update,
            EventPayload::Instance(updated.clone()),
        );
        Ok(updated)
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let snapshot = self.inner.get_instance(name).await?;
        self.inner.delete_instance(name).await?;
        self.publish(OperationType::Delete, EventPayload::Instance(snapshot));
        Ok(())
    }

    async fn record_job(&self, job: Job) -> Result<Job> {
        let recorded = self.inner.record_job(job).await?;
        self.publish(OperationType::Update, EventPayload::Job(recorded.clone()));
        Ok(recorded)
    }

    async fn list_entity_jobs(&self, entity_id: Uuid) -> Result<Vec<Job>> {
        self.inner.list_entity_jobs(entity_id).await
    }

    async fn delete_job(&self, runner_request_id: i64) -> Result<()> {
        self.inner.delete_job(runner_request_id).await
    }
}
