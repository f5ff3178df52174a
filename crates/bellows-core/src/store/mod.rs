//! Persistence contract for the controller.
//!
//! The database is authoritative; the coordination cache is a read-mostly
//! mirror rebuilt from it. Implementations publish change events after
//! commit through the watcher bus (see the runtime's watched-store
//! decorator).

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::forge::{ForgeCredentials, ForgeEndpoint, ForgeEntity};
use crate::instance::{Instance, InstanceUpdate};
use crate::job::Job;
use crate::pool::Pool;
use crate::scaleset::{ScaleSet, ScaleSetUpdate};

/// New scale set parameters accepted by [`Store::create_scale_set`].
#[derive(Debug, Clone)]
pub struct NewScaleSet {
    pub name: String,
    pub scope: crate::forge::EntityScope,
    pub provider_name: String,
    pub min_runners: u32,
    pub max_runners: u32,
    pub image: String,
    pub flavor: String,
    pub os_type: crate::os::OsType,
    pub os_arch: crate::os::OsArch,
    pub runner_group: String,
    pub enabled: bool,
    pub runner_bootstrap_timeout_minutes: u32,
    pub runner_prefix: String,
    pub extra_specs: serde_json::Value,
}

/// Storage operations the reconciliation engine depends on.
#[async_trait]
pub trait Store: Send + Sync {
    // Endpoints. The reserved github.com endpoint and endpoints with
    // credentials attached refuse deletion.
    async fn create_endpoint(&self, endpoint: ForgeEndpoint) -> Result<ForgeEndpoint>;
    async fn get_endpoint(&self, name: &str) -> Result<ForgeEndpoint>;
    async fn list_endpoints(&self) -> Result<Vec<ForgeEndpoint>>;
    async fn delete_endpoint(&self, name: &str) -> Result<()>;

    // Credentials. Credentials referenced by an entity refuse deletion.
    async fn create_credentials(&self, credentials: ForgeCredentials) -> Result<ForgeCredentials>;
    async fn get_credentials(&self, id: i64) -> Result<ForgeCredentials>;
    async fn list_credentials(&self) -> Result<Vec<ForgeCredentials>>;
    async fn update_credentials(&self, credentials: ForgeCredentials) -> Result<ForgeCredentials>;
    async fn delete_credentials(&self, id: i64) -> Result<()>;

    // Entities.
    async fn create_entity(&self, entity: ForgeEntity) -> Result<ForgeEntity>;
    async fn get_entity(&self, id: Uuid) -> Result<ForgeEntity>;
    async fn list_entities(&self) -> Result<Vec<ForgeEntity>>;
    async fn update_entity(&self, entity: ForgeEntity) -> Result<ForgeEntity>;
    async fn delete_entity(&self, id: Uuid) -> Result<()>;

    // Pools.
    async fn create_pool(&self, pool: Pool) -> Result<Pool>;
    async fn get_pool(&self, id: Uuid) -> Result<Pool>;
    async fn list_entity_pools(&self, entity_id: Uuid) -> Result<Vec<Pool>>;
    async fn delete_pool(&self, id: Uuid) -> Result<()>;

    // Scale sets.
    async fn create_scale_set(&self, scale_set: NewScaleSet) -> Result<ScaleSet>;
    async fn get_scale_set(&self, id: i64) -> Result<ScaleSet>;
    async fn list_entity_scale_sets(&self, entity_id: Uuid) -> Result<Vec<ScaleSet>>;
    async fn list_scale_sets(&self) -> Result<Vec<ScaleSet>>;
    async fn update_scale_set(&self, id: i64, update: ScaleSetUpdate) -> Result<ScaleSet>;
    /// Record the forge-side scale set ID once the scale set exists there.
    async fn set_scale_set_forge_id(&self, id: i64, scale_set_id: i64) -> Result<ScaleSet>;
    /// Advance the replay cursor and the assigned-job statistic together;
    /// both come from the same message.
    async fn set_scale_set_message_cursor(
        &self,
        id: i64,
        last_message_id: i64,
        desired_runner_count: u32,
    ) -> Result<ScaleSet>;
    async fn delete_scale_set(&self, id: i64) -> Result<()>;

    // Instances. Updates for the same name are serialised.
    async fn create_instance(&self, instance: Instance) -> Result<Instance>;
    async fn get_instance(&self, name: &str) -> Result<Instance>;
    async fn list_instances(&self) -> Result<Vec<Instance>>;
    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>>;
    async fn list_scale_set_instances(&self, scale_set_id: i64) -> Result<Vec<Instance>>;
    async fn update_instance(&self, name: &str, update: InstanceUpdate) -> Result<Instance>;
    async fn delete_instance(&self, name: &str) -> Result<()>;

    // Jobs. Upserted by runner-request ID; informational only.
    async fn record_job(&self, job: Job) -> Result<Job>;
    async fn list_entity_jobs(&self, entity_id: Uuid) -> Result<Vec<Job>>;
    async fn delete_job(&self, runner_request_id: i64) -> Result<()>;
}
