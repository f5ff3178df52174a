//! Entity-aware façade over the forge's REST surface.
//!
//! One client per entity. GitHub and Gitea share the client; only the API
//! base path and the hook payload differ. Every call bumps a
//! `{operation, scope}` counter, and failures bump a matching failure
//! counter.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use bellows_core::actions::RegistrationToken;
use bellows_core::error::{BellowsError, Result};
use bellows_core::forge::{EntityKind, ForgeEntity, ForgeKind, RateLimitSnapshot};
use bellows_core::tools::RunnerApplicationDownload;

use crate::cache::RunnerGroupCache;
use crate::http::{check_response, error_from_transport};
use crate::metrics::CallMetrics;

/// The default runner group every repository (and unnamed group) maps to.
const DEFAULT_RUNNER_GROUP_ID: i64 = 1;

/// A webhook as the forge reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeHook {
    pub id: i64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub config: HookConfig,
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub insecure_ssl: String,
}

/// A runner as the forge's REST API reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeRunner {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<ForgeRunnerLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeRunnerLabel {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct RunnersPage {
    total_count: i64,
    #[serde(default)]
    runners: Vec<ForgeRunner>,
}

#[derive(Debug, Deserialize)]
struct RunnerGroupsPage {
    total_count: i64,
    #[serde(default)]
    runner_groups: Vec<RunnerGroup>,
}

#[derive(Debug, Clone, Deserialize)]
struct RunnerGroup {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct JitConfigResponse {
    runner: ForgeRunner,
    encoded_jit_config: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitCore,
}

#[derive(Debug, Deserialize)]
struct RateLimitCore {
    limit: i64,
    remaining: i64,
    reset: i64,
}

/// Entity-aware forge REST client.
///
/// The entity snapshot is swapped by the owning controller when entity or
/// credential updates arrive, so the next call picks up new secrets without
/// rebuilding the client.
pub struct ForgeRestClient {
    http: reqwest::Client,
    entity: RwLock<ForgeEntity>,
    metrics: CallMetrics,
    runner_groups: Arc<RunnerGroupCache>,
}

impl ForgeRestClient {
    pub fn new(
        entity: ForgeEntity,
        metrics: CallMetrics,
        runner_groups: Arc<RunnerGroupCache>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            entity: RwLock::new(entity),
            metrics,
            runner_groups,
        }
    }

    /// Swap the entity snapshot; subsequent calls use its credentials.
    pub fn update_entity(&self, entity: ForgeEntity) {
        *self.entity.write().unwrap() = entity;
    }

    /// A copy of the current entity snapshot.
    pub fn entity(&self) -> ForgeEntity {
        self.entity.read().unwrap().clone()
    }

    fn api_base(&self, entity: &ForgeEntity) -> String {
        let base = entity.credentials.endpoint.api_base_url.trim_end_matches('/');
        match entity.forge_kind() {
            ForgeKind::Github => base.to_string(),
            // Gitea serves its REST API under /api/v1.
            ForgeKind::Gitea => format!("{}/api/v1", base),
        }
    }

    fn entity_url(&self, entity: &ForgeEntity, suffix: &str) -> String {
        format!(
            "{}/{}/{}",
            self.api_base(entity),
            entity.forge_path(),
            suffix
        )
    }

    fn record(&self, operation: &str, scope: &str) {
        self.metrics.record_call(operation, scope);
    }

    fn record_failure(&self, operation: &str, scope: &str) {
        self.metrics.record_failure(operation, scope);
    }

    async fn send(
        &self,
        operation: &str,
        entity: &ForgeEntity,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let scope = entity.label_scope();
        self.record(operation, &scope);
        let result = builder
            .bearer_auth(&entity.credentials.secret)
            .header("Accept", "application/json")
            .send()
            .await;
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(operation, &scope);
                return Err(error_from_transport(e, operation));
            }
        };
        match check_response(response, operation).await {
            Ok(r) => Ok(r),
            Err(e) => {
                self.record_failure(operation, &scope);
                Err(e)
            }
        }
    }

    /// List the entity's webhooks.
    pub async fn list_entity_hooks(&self) -> Result<Vec<ForgeHook>> {
        let entity = self.entity();
        let url = self.entity_url(&entity, "hooks");
        let response = self
            .send("ListEntityHooks", &entity, self.http.get(&url))
            .await?;
        Ok(response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "ListEntityHooks"))?)
    }

    /// Create a webhook pointing at `url`.
    pub async fn create_entity_hook(
        &self,
        url: &str,
        events: &[String],
        secret: Option<&str>,
    ) -> Result<ForgeHook> {
        let entity = self.entity();
        let endpoint = self.entity_url(&entity, "hooks");
        let config = serde_json::json!({
            "url": url,
            "content_type": "json",
            "secret": secret,
            "insecure_ssl": "0",
        });
        // Gitea validates a `type` discriminator where GitHub expects the
        // legacy `name: web`.
        let payload = match entity.forge_kind() {
            ForgeKind::Github => serde_json::json!({
                "name": "web",
                "active": true,
                "events": events,
                "config": config,
            }),
            ForgeKind::Gitea => serde_json::json!({
                "type": "gitea",
                "active": true,
                "events": events,
                "config": config,
            }),
        };
        let response = self
            .send(
                "CreateEntityHook",
                &entity,
                self.http.post(&endpoint).json(&payload),
            )
            .await?;
        Ok(response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "CreateEntityHook"))?)
    }

    /// Delete a webhook by ID.
    pub async fn delete_entity_hook(&self, hook_id: i64) -> Result<()> {
        let entity = self.entity();
        let url = self.entity_url(&entity, &format!("hooks/{}", hook_id));
        self.send("DeleteEntityHook", &entity, self.http.delete(&url))
            .await?;
        Ok(())
    }

    /// Ask the forge to deliver a test ping on a webhook.
    pub async fn ping_entity_hook(&self, hook_id: i64) -> Result<()> {
        let entity = self.entity();
        let suffix = match entity.forge_kind() {
            ForgeKind::Github => format!("hooks/{}/pings", hook_id),
            ForgeKind::Gitea => format!("hooks/{}/tests", hook_id),
        };
        let url = self.entity_url(&entity, &suffix);
        self.send("PingEntityHook", &entity, self.http.post(&url))
            .await?;
        Ok(())
    }

    /// List every runner registered for this entity, following pagination.
    pub async fn list_entity_runners(&self) -> Result<Vec<ForgeRunner>> {
        let entity = self.entity();
        let url = self.entity_url(&entity, "actions/runners");
        let mut runners = Vec::new();
        let mut page = 1u32;
        loop {
            let response = self
                .send(
                    "ListEntityRunners",
                    &entity,
                    self.http
                        .get(&url)
                        .query(&[("per_page", "100"), ("page", &page.to_string())]),
                )
                .await?;
            let body: RunnersPage = response
                .json()
                .await
                .map_err(|e| error_from_transport(e, "ListEntityRunners"))?;
            let page_len = body.runners.len();
            runners.extend(body.runners);
            if page_len == 0 || runners.len() as i64 >= body.total_count {
                break;
            }
            page += 1;
        }
        Ok(runners)
    }

    /// Remove a runner from the forge by ID.
    pub async fn remove_entity_runner(&self, runner_id: i64) -> Result<()> {
        let entity = self.entity();
        let url = self.entity_url(&entity, &format!("actions/runners/{}", runner_id));
        self.send("RemoveEntityRunner", &entity, self.http.delete(&url))
            .await?;
        Ok(())
    }

    /// Create a short-lived runner registration token.
    pub async fn create_entity_registration_token(&self) -> Result<RegistrationToken> {
        let entity = self.entity();
        let url = self.entity_url(&entity, "actions/runners/registration-token");
        let response = self
            .send(
                "CreateEntityRegistrationToken",
                &entity,
                self.http.post(&url),
            )
            .await?;
        Ok(response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "CreateEntityRegistrationToken"))?)
    }

    /// List runner application downloads for this entity.
    pub async fn list_entity_runner_application_downloads(
        &self,
    ) -> Result<Vec<RunnerApplicationDownload>> {
        let entity = self.entity();
        let url = self.entity_url(&entity, "actions/runners/downloads");
        let response = self
            .send(
                "ListEntityRunnerApplicationDownloads",
                &entity,
                self.http.get(&url),
            )
            .await?;
        Ok(response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "ListEntityRunnerApplicationDownloads"))?)
    }

    /// Generate a JIT config for a new runner.
    ///
    /// Returns the decoded config file map and the runner reference. If
    /// decoding fails after the runner was created forge-side, the runner is
    /// removed again, best-effort.
    pub async fn get_entity_jit_config(
        &self,
        runner_name: &str,
        labels: &[String],
        runner_group: &str,
    ) -> Result<(HashMap<String, String>, ForgeRunner)> {
        let entity = self.entity();
        let runner_group_id = self.resolve_runner_group_named(&entity, runner_group).await?;
        let url = self.entity_url(&entity, "actions/runners/generate-jitconfig");
        let payload = serde_json::json!({
            "name": runner_name,
            "runner_group_id": runner_group_id,
            "labels": labels,
            "work_folder": "_work",
        });
        let response = self
            .send(
                "GetEntityJITConfig",
                &entity,
                self.http.post(&url).json(&payload),
            )
            .await?;
        let body: JitConfigResponse = response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "GetEntityJITConfig"))?;

        match decode_jit_config(&body.encoded_jit_config) {
            Ok(config) => Ok((config, body.runner)),
            Err(e) => {
                // The forge-side runner exists but we cannot hand anyone its
                // config; reap it so it does not linger as an offline ghost.
                if let Err(cleanup) = self.remove_entity_runner(body.runner.id).await {
                    tracing::warn!(
                        runner = %runner_name,
                        error = %cleanup,
                        "failed to remove runner after JIT config decode error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Current rate limit for the entity's credentials. Gitea has no rate
    /// limit endpoint and reports NotFound.
    pub async fn rate_limit(&self) -> Result<RateLimitSnapshot> {
        let entity = self.entity();
        if entity.forge_kind() == ForgeKind::Gitea {
            return Err(BellowsError::NotFound(
                "gitea does not expose a rate limit".to_string(),
            ));
        }
        let url = format!("{}/rate_limit", self.api_base(&entity));
        let response = self
            .send("RateLimit", &entity, self.http.get(&url))
            .await?;
        let body: RateLimitResponse = response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "RateLimit"))?;
        Ok(RateLimitSnapshot {
            limit: body.resources.core.limit,
            remaining: body.resources.core.remaining,
            reset: body.resources.core.reset,
        })
    }

    /// Resolve a runner group name to a forge-side group ID.
    ///
    /// Repositories always register into the default group. Elsewhere the
    /// name is resolved through the runner-group cache, then by paging the
    /// forge; a resolved ID is cached for an hour.
    pub async fn resolve_runner_group_named(
        &self,
        entity: &ForgeEntity,
        group_name: &str,
    ) -> Result<i64> {
        if entity.kind == EntityKind::Repository
            || group_name.is_empty()
            || group_name.eq_ignore_ascii_case("default")
        {
            return Ok(DEFAULT_RUNNER_GROUP_ID);
        }
        if let Some(id) = self.runner_groups.get_group_id(entity.id, group_name) {
            return Ok(id);
        }

        let url = self.entity_url(entity, "actions/runner-groups");
        let mut seen = 0i64;
        let mut page = 1u32;
        loop {
            let response = self
                .send(
                    "ListRunnerGroups",
                    entity,
                    self.http
                        .get(&url)
                        .query(&[("per_page", "100"), ("page", &page.to_string())]),
                )
                .await?;
            let body: RunnerGroupsPage = response
                .json()
                .await
                .map_err(|e| error_from_transport(e, "ListRunnerGroups"))?;
            seen += body.runner_groups.len() as i64;
            if let Some(group) = body.runner_groups.iter().find(|g| g.name == group_name) {
                self.runner_groups.set_group_id(entity.id, group_name, group.id);
                return Ok(group.id);
            }
            if seen >= body.total_count || body.runner_groups.is_empty() {
                return Err(BellowsError::NotFound(format!(
                    "runner group {} not found for {}",
                    group_name, entity
                )));
            }
            page += 1;
        }
    }
}

/// Decode a base64 JIT config blob into its file map.
fn decode_jit_config(encoded: &str) -> Result<HashMap<String, String>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| BellowsError::Serialization(format!("invalid JIT config: {}", e)))?;
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    let object = value.as_object().ok_or_else(|| {
        BellowsError::Serialization("JIT config is not a JSON object".to_string())
    })?;
    Ok(object
        .iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bellows_core::forge::EntityKind;
    use bellows_core::testing::{sample_credentials, sample_entity};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entity_for(server: &MockServer, kind: ForgeKind, entity_kind: EntityKind) -> ForgeEntity {
        let mut creds = sample_credentials(1, kind);
        creds.endpoint.api_base_url = server.uri();
        creds.endpoint.base_url = server.uri();
        sample_entity(entity_kind, creds)
    }

    fn client(entity: ForgeEntity) -> ForgeRestClient {
        ForgeRestClient::new(entity, CallMetrics::new(), Arc::new(RunnerGroupCache::new()))
    }

    #[tokio::test]
    async fn test_list_runners_follows_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 2,
                "runners": [{"id": 1, "name": "r1"}],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 2,
                "runners": [{"id": 2, "name": "r2"}],
            })))
            .mount(&server)
            .await;

        let client = client(entity_for(&server, ForgeKind::Github, EntityKind::Organization));
        let runners = client.list_entity_runners().await.unwrap();
        assert_eq!(runners.len(), 2);
        assert_eq!(runners[1].name, "r2");
    }

    #[tokio::test]
    async fn test_gitea_paths_get_api_v1_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/acme/widgets/hooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = client(entity_for(&server, ForgeKind::Gitea, EntityKind::Repository));
        let hooks = client.list_entity_hooks().await.unwrap();
        assert!(hooks.is_empty());
    }

    #[tokio::test]
    async fn test_error_taxonomy_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/orgs/acme/actions/runners/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(entity_for(&server, ForgeKind::Github, EntityKind::Organization));
        let err = client.remove_entity_runner(42).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_metrics_count_calls_and_failures() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/orgs/acme/actions/runners/42"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let metrics = CallMetrics::new();
        let client = ForgeRestClient::new(
            entity_for(&server, ForgeKind::Github, EntityKind::Organization),
            metrics.clone(),
            Arc::new(RunnerGroupCache::new()),
        );
        let _ = client.remove_entity_runner(42).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].operation, "RemoveEntityRunner");
        assert_eq!(snapshot[0].scope, "org:acme");
        assert_eq!(snapshot[0].calls, 1);
        assert_eq!(snapshot[0].failures, 1);
    }

    #[tokio::test]
    async fn test_jit_config_decodes_file_map() {
        let server = MockServer::start().await;
        let encoded = STANDARD.encode(
            serde_json::json!({".runner": "runner-config", ".credentials": "creds"}).to_string(),
        );
        Mock::given(method("POST"))
            .and(path("/orgs/acme/actions/runners/generate-jitconfig"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "runner": {"id": 7, "name": "bellows-aaaa"},
                "encoded_jit_config": encoded,
            })))
            .mount(&server)
            .await;

        let client = client(entity_for(&server, ForgeKind::Github, EntityKind::Organization));
        let (config, runner) = client
            .get_entity_jit_config("bellows-aaaa", &["self-hosted".to_string()], "Default")
            .await
            .unwrap();
        assert_eq!(runner.id, 7);
        assert_eq!(config.get(".runner").unwrap(), "runner-config");
    }

    #[tokio::test]
    async fn test_runner_group_resolution_pages_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runner-groups"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 2,
                "runner_groups": [{"id": 1, "name": "Default"}],
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runner-groups"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 2,
                "runner_groups": [{"id": 9, "name": "gpu"}],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let entity = entity_for(&server, ForgeKind::Github, EntityKind::Organization);
        let client = client(entity.clone());

        let id = client
            .resolve_runner_group_named(&entity, "gpu")
            .await
            .unwrap();
        assert_eq!(id, 9);

        // Second resolution hits the cache; the expect(1) mounts verify no
        // further HTTP calls happen.
        let id = client
            .resolve_runner_group_named(&entity, "gpu")
            .await
            .unwrap();
        assert_eq!(id, 9);
    }

    #[tokio::test]
    async fn test_update_entity_swaps_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners"))
            .and(wiremock::matchers::header("authorization", "Bearer ghp_rotated"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 0,
                "runners": [],
            })))
            .mount(&server)
            .await;

        let mut entity = entity_for(&server, ForgeKind::Github, EntityKind::Organization);
        let client = client(entity.clone());

        entity.credentials.secret = "ghp_rotated".to_string();
        client.update_entity(entity);

        // Succeeds only because the rotated bearer matches the mock.
        let runners = client.list_entity_runners().await.unwrap();
        assert!(runners.is_empty());
    }
}
