use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bellows_core::error::{BellowsError, Result};
use bellows_core::forge::{
    AuthKind, EntityKind, EntityScope, ForgeCredentials, ForgeEndpoint, ForgeEntity,
    GITHUB_COM_ENDPOINT,
};
use bellows_core::instance::{Instance, InstanceUpdate, ProviderStatus, RunnerStatus, StatusMessage};
use bellows_core::job::{Job, JobStatus};
use bellows_core::os::{OsArch, OsType};
use bellows_core::pool::Pool;
use bellows_core::scaleset::{ScaleSet, ScaleSetUpdate};
use bellows_core::store::{NewScaleSet, Store};

fn db_err(e: sqlx::Error) -> BellowsError {
    match e {
        sqlx::Error::RowNotFound => BellowsError::NotFound("row not found".to_string()),
        other => BellowsError::Database(other.to_string()),
    }
}

fn json_col<T: serde::de::DeserializeOwned>(row: &PgRow, col: &str) -> Result<T> {
    let value: serde_json::Value = row.try_get(col).map_err(db_err)?;
    serde_json::from_value(value).map_err(Into::into)
}

/// Postgres implementation of the [`Store`] contract.
///
/// Queries are bound at runtime; the schema is managed by the external
/// migration tooling. Instance updates are serialised per instance name
/// through a named lock set.
pub struct PgStore {
    pool: PgPool,
    instance_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            instance_locks: Mutex::new(HashMap::new()),
        }
    }

    fn instance_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.instance_locks.lock().unwrap();
        locks.entry(name.to_string()).or_default().clone()
    }

    fn drop_instance_lock(&self, name: &str) {
        self.instance_locks.lock().unwrap().remove(name);
    }

    fn row_to_endpoint(row: &PgRow) -> Result<ForgeEndpoint> {
        let kind: String = row.try_get("kind").map_err(db_err)?;
        Ok(ForgeEndpoint {
            name: row.try_get("name").map_err(db_err)?,
            description: row.try_get("description").map_err(db_err)?,
            kind: kind.parse()?,
            base_url: row.try_get("base_url").map_err(db_err)?,
            api_base_url: row.try_get("api_base_url").map_err(db_err)?,
            upload_base_url: row.try_get("upload_base_url").map_err(db_err)?,
            ca_cert_bundle: row.try_get("ca_cert_bundle").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    async fn fetch_credentials(&self, id: i64) -> Result<ForgeCredentials> {
        let row = sqlx::query(
            r#"
            SELECT c.id, c.name, c.description, c.auth_kind, c.secret, c.rate_limit,
                   c.created_at, c.updated_at,
                   e.name AS ep_name, e.description AS ep_description, e.kind AS ep_kind,
                   e.base_url AS ep_base_url, e.api_base_url AS ep_api_base_url,
                   e.upload_base_url AS ep_upload_base_url, e.ca_cert_bundle AS ep_ca_cert_bundle,
                   e.created_at AS ep_created_at, e.updated_at AS ep_updated_at
            FROM forge_credentials c
            JOIN forge_endpoints e ON e.name = c.endpoint_name
            WHERE c.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| BellowsError::NotFound(format!("credentials {}", id)))?;
        Self::row_to_credentials(&row)
    }

    fn row_to_credentials(row: &PgRow) -> Result<ForgeCredentials> {
        let kind: String = row.try_get("ep_kind").map_err(db_err)?;
        let auth_kind: String = row.try_get("auth_kind").map_err(db_err)?;
        let rate_limit: Option<serde_json::Value> = row.try_get("rate_limit").map_err(db_err)?;
        Ok(ForgeCredentials {
            id: row.try_get("id").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            description: row.try_get("description").map_err(db_err)?,
            endpoint: ForgeEndpoint {
                name: row.try_get("ep_name").map_err(db_err)?,
                description: row.try_get("ep_description").map_err(db_err)?,
                kind: kind.parse()?,
                base_url: row.try_get("ep_base_url").map_err(db_err)?,
                api_base_url: row.try_get("ep_api_base_url").map_err(db_err)?,
                upload_base_url: row.try_get("ep_upload_base_url").map_err(db_err)?,
                ca_cert_bundle: row.try_get("ep_ca_cert_bundle").map_err(db_err)?,
                created_at: row.try_get("ep_created_at").map_err(db_err)?,
                updated_at: row.try_get("ep_updated_at").map_err(db_err)?,
            },
            auth_kind: auth_kind.parse::<AuthKind>()?,
            secret: row.try_get("secret").map_err(db_err)?,
            rate_limit: rate_limit
                .map(serde_json::from_value)
                .transpose()
                .map_err(BellowsError::from)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    async fn row_to_entity(&self, row: &PgRow) -> Result<ForgeEntity> {
        let kind: String = row.try_get("kind").map_err(db_err)?;
        let credentials_id: i64 = row.try_get("credentials_id").map_err(db_err)?;
        Ok(ForgeEntity {
            id: row.try_get("id").map_err(db_err)?,
            kind: kind.parse::<EntityKind>()?,
            owner: row.try_get("owner").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            credentials: self.fetch_credentials(credentials_id).await?,
            webhook_secret: row.try_get("webhook_secret").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    fn row_to_pool(row: &PgRow) -> Result<Pool> {
        let os_type: String = row.try_get("os_type").map_err(db_err)?;
        let os_arch: String = row.try_get("os_arch").map_err(db_err)?;
        Ok(Pool {
            id: row.try_get("id").map_err(db_err)?,
            scope: json_col::<EntityScope>(row, "scope")?,
            provider_name: row.try_get("provider_name").map_err(db_err)?,
            min_idle_runners: row.try_get::<i32, _>("min_idle_runners").map_err(db_err)? as u32,
            max_runners: row.try_get::<i32, _>("max_runners").map_err(db_err)? as u32,
            image: row.try_get("image").map_err(db_err)?,
            flavor: row.try_get("flavor").map_err(db_err)?,
            os_type: os_type.parse::<OsType>()?,
            os_arch: os_arch.parse::<OsArch>()?,
            tags: json_col(row, "tags")?,
            enabled: row.try_get("enabled").map_err(db_err)?,
            runner_group: row.try_get("runner_group").map_err(db_err)?,
            runner_bootstrap_timeout_minutes: row
                .try_get::<i32, _>("runner_bootstrap_timeout_minutes")
                .map_err(db_err)? as u32,
            extra_specs: row.try_get("extra_specs").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    fn row_to_scale_set(row: &PgRow) -> Result<ScaleSet> {
        let os_type: String = row.try_get("os_type").map_err(db_err)?;
        let os_arch: String = row.try_get("os_arch").map_err(db_err)?;
        Ok(ScaleSet {
            id: row.try_get("id").map_err(db_err)?,
            scale_set_id: row.try_get("scale_set_id").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            scope: json_col::<EntityScope>(row, "scope")?,
            provider_name: row.try_get("provider_name").map_err(db_err)?,
            min_runners: row.try_get::<i32, _>("min_runners").map_err(db_err)? as u32,
            max_runners: row.try_get::<i32, _>("max_runners").map_err(db_err)? as u32,
            image: row.try_get("image").map_err(db_err)?,
            flavor: row.try_get("flavor").map_err(db_err)?,
            os_type: os_type.parse::<OsType>()?,
            os_arch: os_arch.parse::<OsArch>()?,
            runner_group: row.try_get("runner_group").map_err(db_err)?,
            last_message_id: row.try_get("last_message_id").map_err(db_err)?,
            desired_runner_count: row
                .try_get::<i32, _>("desired_runner_count")
                .map_err(db_err)? as u32,
            enabled: row.try_get("enabled").map_err(db_err)?,
            runner_bootstrap_timeout_minutes: row
                .try_get::<i32, _>("runner_bootstrap_timeout_minutes")
                .map_err(db_err)? as u32,
            runner_prefix: row.try_get("runner_prefix").map_err(db_err)?,
            extra_specs: row.try_get("extra_specs").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    fn row_to_instance(row: &PgRow) -> Result<Instance> {
        let os_type: String = row.try_get("os_type").map_err(db_err)?;
        let os_arch: String = row.try_get("os_arch").map_err(db_err)?;
        let provider_status: String = row.try_get("provider_status").map_err(db_err)?;
        let runner_status: String = row.try_get("runner_status").map_err(db_err)?;
        Ok(Instance {
            name: row.try_get("name").map_err(db_err)?,
            provider_id: row.try_get("provider_id").map_err(db_err)?,
            agent_id: row.try_get("agent_id").map_err(db_err)?,
            os_type: os_type.parse::<OsType>()?,
            os_name: row.try_get("os_name").map_err(db_err)?,
            os_version: row.try_get("os_version").map_err(db_err)?,
            os_arch: os_arch.parse::<OsArch>()?,
            addresses: json_col(row, "addresses")?,
            provider_status: provider_status.parse::<ProviderStatus>()?,
            runner_status: runner_status.parse::<RunnerStatus>()?,
            pool_id: row.try_get("pool_id").map_err(db_err)?,
            scale_set_id: row.try_get("scale_set_id").map_err(db_err)?,
            provider_fault: row.try_get("provider_fault").map_err(db_err)?,
            jit_configuration: row.try_get("jit_configuration").map_err(db_err)?,
            status_messages: json_col(row, "status_messages")?,
            create_attempt: row.try_get::<i32, _>("create_attempt").map_err(db_err)? as u32,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }

    fn row_to_job(row: &PgRow) -> Result<Job> {
        let status: String = row.try_get("status").map_err(db_err)?;
        Ok(Job {
            runner_request_id: row.try_get("runner_request_id").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            workflow_ref: row.try_get("workflow_ref").map_err(db_err)?,
            labels: json_col(row, "labels")?,
            runner_name: row.try_get("runner_name").map_err(db_err)?,
            entity_id: row.try_get("entity_id").map_err(db_err)?,
            status: status.parse::<JobStatus>()?,
            conclusion: row.try_get("conclusion").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_endpoint(&self, endpoint: ForgeEndpoint) -> Result<ForgeEndpoint> {
        sqlx::query(
            r#"
            INSERT INTO forge_endpoints
                (name, description, kind, base_url, api_base_url, upload_base_url,
                 ca_cert_bundle, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&endpoint.name)
        .bind(&endpoint.description)
        .bind(endpoint.kind.as_str())
        .bind(&endpoint.base_url)
        .bind(&endpoint.api_base_url)
        .bind(&endpoint.upload_base_url)
        .bind(&endpoint.ca_cert_bundle)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BellowsError::Conflict(format!("endpoint {} already exists", endpoint.name))
            }
            _ => db_err(e),
        })?;
        Ok(endpoint)
    }

    async fn get_endpoint(&self, name: &str) -> Result<ForgeEndpoint> {
        let row = sqlx::query("SELECT * FROM forge_endpoints WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| BellowsError::NotFound(format!("endpoint {}", name)))?;
        Self::row_to_endpoint(&row)
    }

    async fn list_endpoints(&self) -> Result<Vec<ForgeEndpoint>> {
        let rows = sqlx::query("SELECT * FROM forge_endpoints ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_endpoint).collect()
    }

    async fn delete_endpoint(&self, name: &str) -> Result<()> {
        if name == GITHUB_COM_ENDPOINT {
            return Err(BellowsError::BadRequest(
                "the github.com endpoint is reserved".to_string(),
            ));
        }
        let attached: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM forge_credentials WHERE endpoint_name = $1")
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
                .try_get("count")
                .map_err(db_err)?;
        if attached > 0 {
            return Err(BellowsError::Conflict(format!(
                "endpoint {} still has credentials attached",
                name
            )));
        }
        let result = sqlx::query("DELETE FROM forge_endpoints WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("endpoint {}", name)));
        }
        Ok(())
    }

    async fn create_credentials(&self, credentials: ForgeCredentials) -> Result<ForgeCredentials> {
        let rate_limit = credentials
            .rate_limit
            .map(serde_json::to_value)
            .transpose()?;
        let row = sqlx::query(
            r#"
            INSERT INTO forge_credentials
                (name, description, endpoint_name, auth_kind, secret, rate_limit,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&credentials.name)
        .bind(&credentials.description)
        .bind(&credentials.endpoint.name)
        .bind(credentials.auth_kind.as_str())
        .bind(&credentials.secret)
        .bind(rate_limit)
        .bind(credentials.created_at)
        .bind(credentials.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => BellowsError::Conflict(
                format!(
                    "credentials named {} already exist for endpoint {}",
                    credentials.name, credentials.endpoint.name
                ),
            ),
            _ => db_err(e),
        })?;
        let id: i64 = row.try_get("id").map_err(db_err)?;
        self.fetch_credentials(id).await
    }

    async fn get_credentials(&self, id: i64) -> Result<ForgeCredentials> {
        self.fetch_credentials(id).await
    }

    async fn list_credentials(&self) -> Result<Vec<ForgeCredentials>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name, c.description, c.auth_kind, c.secret, c.rate_limit,
                   c.created_at, c.updated_at,
                   e.name AS ep_name, e.description AS ep_description, e.kind AS ep_kind,
                   e.base_url AS ep_base_url, e.api_base_url AS ep_api_base_url,
                   e.upload_base_url AS ep_upload_base_url, e.ca_cert_bundle AS ep_ca_cert_bundle,
                   e.created_at AS ep_created_at, e.updated_at AS ep_updated_at
            FROM forge_credentials c
            JOIN forge_endpoints e ON e.name = c.endpoint_name
            ORDER BY c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_credentials).collect()
    }

    async fn update_credentials(&self, credentials: ForgeCredentials) -> Result<ForgeCredentials> {
        let rate_limit = credentials
            .rate_limit
            .map(serde_json::to_value)
            .transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE forge_credentials
            SET name = $2, description = $3, auth_kind = $4, secret = $5,
                rate_limit = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(credentials.id)
        .bind(&credentials.name)
        .bind(&credentials.description)
        .bind(credentials.auth_kind.as_str())
        .bind(&credentials.secret)
        .bind(rate_limit)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!(
                "credentials {}",
                credentials.id
            )));
        }
        self.fetch_credentials(credentials.id).await
    }

    async fn delete_credentials(&self, id: i64) -> Result<()> {
        let referenced: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM forge_entities WHERE credentials_id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
                .try_get("count")
                .map_err(db_err)?;
        if referenced > 0 {
            return Err(BellowsError::Conflict(format!(
                "credentials {} are referenced by an entity",
                id
            )));
        }
        let result = sqlx::query("DELETE FROM forge_credentials WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("credentials {}", id)));
        }
        Ok(())
    }

    async fn create_entity(&self, entity: ForgeEntity) -> Result<ForgeEntity> {
        sqlx::query(
            r#"
            INSERT INTO forge_entities
                (id, kind, owner, name, credentials_id, webhook_secret, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entity.id)
        .bind(entity.kind.as_str())
        .bind(&entity.owner)
        .bind(&entity.name)
        .bind(entity.credentials.id)
        .bind(&entity.webhook_secret)
        .bind(entity.created_at)
        .bind(entity.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BellowsError::Conflict(format!("entity {} already exists", entity.id))
            }
            _ => db_err(e),
        })?;
        self.get_entity(entity.id).await
    }

    async fn get_entity(&self, id: Uuid) -> Result<ForgeEntity> {
        let row = sqlx::query("SELECT * FROM forge_entities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| BellowsError::NotFound(format!("entity {}", id)))?;
        self.row_to_entity(&row).await
    }

    async fn list_entities(&self) -> Result<Vec<ForgeEntity>> {
        let rows = sqlx::query("SELECT * FROM forge_entities ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            entities.push(self.row_to_entity(row).await?);
        }
        Ok(entities)
    }

    async fn update_entity(&self, entity: ForgeEntity) -> Result<ForgeEntity> {
        let result = sqlx::query(
            r#"
            UPDATE forge_entities
            SET credentials_id = $2, webhook_secret = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(entity.id)
        .bind(entity.credentials.id)
        .bind(&entity.webhook_secret)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("entity {}", entity.id)));
        }
        self.get_entity(entity.id).await
    }

    async fn delete_entity(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM forge_entities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("entity {}", id)));
        }
        Ok(())
    }

    async fn create_pool(&self, pool: Pool) -> Result<Pool> {
        sqlx::query(
            r#"
            INSERT INTO pools
                (id, scope, provider_name, min_idle_runners, max_runners, image, flavor,
                 os_type, os_arch, tags, enabled, runner_group,
                 runner_bootstrap_timeout_minutes, extra_specs, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(pool.id)
        .bind(serde_json::to_value(pool.scope)?)
        .bind(&pool.provider_name)
        .bind(pool.min_idle_runners as i32)
        .bind(pool.max_runners as i32)
        .bind(&pool.image)
        .bind(&pool.flavor)
        .bind(pool.os_type.as_str())
        .bind(pool.os_arch.as_str())
        .bind(serde_json::to_value(&pool.tags)?)
        .bind(pool.enabled)
        .bind(&pool.runner_group)
        .bind(pool.runner_bootstrap_timeout_minutes as i32)
        .bind(&pool.extra_specs)
        .bind(pool.created_at)
        .bind(pool.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(pool)
    }

    async fn get_pool(&self, id: Uuid) -> Result<Pool> {
        let row = sqlx::query("SELECT * FROM pools WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| BellowsError::NotFound(format!("pool {}", id)))?;
        Self::row_to_pool(&row)
    }

    async fn list_entity_pools(&self, entity_id: Uuid) -> Result<Vec<Pool>> {
        let rows = sqlx::query("SELECT * FROM pools WHERE scope->>'id' = $1 ORDER BY created_at")
            .bind(entity_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_pool).collect()
    }

    async fn delete_pool(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM pools WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("pool {}", id)));
        }
        Ok(())
    }

    async fn create_scale_set(&self, scale_set: NewScaleSet) -> Result<ScaleSet> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO scale_sets
                (scale_set_id, name, scope, provider_name, min_runners, max_runners,
                 image, flavor, os_type, os_arch, runner_group, last_message_id,
                 desired_runner_count, enabled, runner_bootstrap_timeout_minutes,
                 runner_prefix, extra_specs, created_at, updated_at)
            VALUES (0, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, 0, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(&scale_set.name)
        .bind(serde_json::to_value(scale_set.scope)?)
        .bind(&scale_set.provider_name)
        .bind(scale_set.min_runners as i32)
        .bind(scale_set.max_runners as i32)
        .bind(&scale_set.image)
        .bind(&scale_set.flavor)
        .bind(scale_set.os_type.as_str())
        .bind(scale_set.os_arch.as_str())
        .bind(&scale_set.runner_group)
        .bind(scale_set.enabled)
        .bind(scale_set.runner_bootstrap_timeout_minutes as i32)
        .bind(&scale_set.runner_prefix)
        .bind(&scale_set.extra_specs)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let id: i64 = row.try_get("id").map_err(db_err)?;
        self.get_scale_set(id).await
    }

    async fn get_scale_set(&self, id: i64) -> Result<ScaleSet> {
        let row = sqlx::query("SELECT * FROM scale_sets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| BellowsError::NotFound(format!("scale set {}", id)))?;
        Self::row_to_scale_set(&row)
    }

    async fn list_entity_scale_sets(&self, entity_id: Uuid) -> Result<Vec<ScaleSet>> {
        let rows = sqlx::query("SELECT * FROM scale_sets WHERE scope->>'id' = $1 ORDER BY id")
            .bind(entity_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_scale_set).collect()
    }

    async fn list_scale_sets(&self) -> Result<Vec<ScaleSet>> {
        let rows = sqlx::query("SELECT * FROM scale_sets ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_scale_set).collect()
    }

    async fn update_scale_set(&self, id: i64, update: ScaleSetUpdate) -> Result<ScaleSet> {
        let current = self.get_scale_set(id).await?;
        let extra_specs = update.extra_specs.unwrap_or(current.extra_specs);
        sqlx::query(
            r#"
            UPDATE scale_sets
            SET name = $2, min_runners = $3, max_runners = $4, image = $5, flavor = $6,
                runner_group = $7, enabled = $8, extra_specs = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.name.unwrap_or(current.name))
        .bind(update.min_runners.unwrap_or(current.min_runners) as i32)
        .bind(update.max_runners.unwrap_or(current.max_runners) as i32)
        .bind(update.image.unwrap_or(current.image))
        .bind(update.flavor.unwrap_or(current.flavor))
        .bind(update.runner_group.unwrap_or(current.runner_group))
        .bind(update.enabled.unwrap_or(current.enabled))
        .bind(extra_specs)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.get_scale_set(id).await
    }

    async fn set_scale_set_forge_id(&self, id: i64, scale_set_id: i64) -> Result<ScaleSet> {
        let result =
            sqlx::query("UPDATE scale_sets SET scale_set_id = $2, updated_at = $3 WHERE id = $1")
                .bind(id)
                .bind(scale_set_id)
                .bind(Utc::now())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("scale set {}", id)));
        }
        self.get_scale_set(id).await
    }

    async fn set_scale_set_message_cursor(
        &self,
        id: i64,
        last_message_id: i64,
        desired_runner_count: u32,
    ) -> Result<ScaleSet> {
        let result = sqlx::query(
            r#"
            UPDATE scale_sets
            SET last_message_id = $2, desired_runner_count = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_message_id)
        .bind(desired_runner_count as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("scale set {}", id)));
        }
        self.get_scale_set(id).await
    }

    async fn delete_scale_set(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM scale_sets WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("scale set {}", id)));
        }
        Ok(())
    }

    async fn create_instance(&self, instance: Instance) -> Result<Instance> {
        sqlx::query(
            r#"
            INSERT INTO instances
                (name, provider_id, agent_id, os_type, os_name, os_version, os_arch,
                 addresses, provider_status, runner_status, pool_id, scale_set_id,
                 provider_fault, jit_configuration, status_messages, create_attempt,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18)
            "#,
        )
        .bind(&instance.name)
        .bind(&instance.provider_id)
        .bind(instance.agent_id)
        .bind(instance.os_type.as_str())
        .bind(&instance.os_name)
        .bind(&instance.os_version)
        .bind(instance.os_arch.as_str())
        .bind(serde_json::to_value(&instance.addresses)?)
        .bind(instance.provider_status.as_str())
        .bind(instance.runner_status.as_str())
        .bind(instance.pool_id)
        .bind(instance.scale_set_id)
        .bind(&instance.provider_fault)
        .bind(&instance.jit_configuration)
        .bind(serde_json::to_value(&instance.status_messages)?)
        .bind(instance.create_attempt as i32)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BellowsError::Conflict(format!("instance {} already exists", instance.name))
            }
            _ => db_err(e),
        })?;
        Ok(instance)
    }

    async fn get_instance(&self, name: &str) -> Result<Instance> {
        let row = sqlx::query("SELECT * FROM instances WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| BellowsError::NotFound(format!("instance {}", name)))?;
        Self::row_to_instance(&row)
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances WHERE pool_id = $1 ORDER BY name")
            .bind(pool_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn list_scale_set_instances(&self, scale_set_id: i64) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances WHERE scale_set_id = $1 ORDER BY name")
            .bind(scale_set_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn update_instance(&self, name: &str, update: InstanceUpdate) -> Result<Instance> {
        // Serialise read-modify-write cycles per instance name.
        let lock = self.instance_lock(name);
        let _guard = lock.lock().await;

        let mut instance = self.get_instance(name).await?;
        if let Some(provider_id) = update.provider_id {
            instance.provider_id = Some(provider_id);
        }
        if let Some(agent_id) = update.agent_id {
            instance.agent_id = agent_id;
        }
        if let Some(os_name) = update.os_name {
            instance.os_name = os_name;
        }
        if let Some(os_version) = update.os_version {
            instance.os_version = os_version;
        }
        if let Some(addresses) = update.addresses {
            instance.addresses = addresses;
        }
        if let Some(provider_status) = update.provider_status {
            instance.provider_status = provider_status;
        }
        if let Some(runner_status) = update.runner_status {
            instance.runner_status = runner_status;
        }
        if let Some(provider_fault) = update.provider_fault {
            instance.provider_fault = Some(provider_fault);
        }
        if let Some(message) = update.status_message {
            instance.status_messages.push(StatusMessage {
                created_at: Utc::now(),
                message,
                event_level: "info".to_string(),
            });
        }
        if let Some(create_attempt) = update.create_attempt {
            instance.create_attempt = create_attempt;
        }
        instance.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE instances
            SET provider_id = $2, agent_id = $3, os_name = $4, os_version = $5,
                addresses = $6, provider_status = $7, runner_status = $8,
                provider_fault = $9, status_messages = $10, create_attempt = $11,
                updated_at = $12
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(&instance.provider_id)
        .bind(instance.agent_id)
        .bind(&instance.os_name)
        .bind(&instance.os_version)
        .bind(serde_json::to_value(&instance.addresses)?)
        .bind(instance.provider_status.as_str())
        .bind(instance.runner_status.as_str())
        .bind(&instance.provider_fault)
        .bind(serde_json::to_value(&instance.status_messages)?)
        .bind(instance.create_attempt as i32)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(instance)
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM instances WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BellowsError::NotFound(format!("instance {}", name)));
        }
        self.drop_instance_lock(name);
        Ok(())
    }

    async fn record_job(&self, job: Job) -> Result<Job> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (runner_request_id, name, workflow_ref, labels, runner_name, entity_id,
                 status, conclusion, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (runner_request_id) DO UPDATE
            SET name = EXCLUDED.name, workflow_ref = EXCLUDED.workflow_ref,
                labels = EXCLUDED.labels, runner_name = EXCLUDED.runner_name,
                status = EXCLUDED.status, conclusion = EXCLUDED.conclusion,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job.runner_request_id)
        .bind(&job.name)
        .bind(&job.workflow_ref)
        .bind(serde_json::to_value(&job.labels)?)
        .bind(&job.runner_name)
        .bind(job.entity_id)
        .bind(job.status.as_str())
        .bind(&job.conclusion)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(job)
    }

    async fn list_entity_jobs(&self, entity_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE entity_id = $1 ORDER BY runner_request_id",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn delete_job(&self, runner_request_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE runner_request_id = $1")
            .bind(runner_request_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
