//! Client for the forge's Actions service.
//!
//! Access is gated by two short-lived artefacts: a runner registration
//! token (exchanged through the REST façade) and the actions-service admin
//! info (pipeline URL plus bearer JWT). Both refresh when within two
//! minutes of expiry, at most once per window, under a single mutex.

mod session;

pub use session::MessageSession;

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use url::Url;

use bellows_core::actions::{
    ActionsList, ActionsServiceAdminInfo, RegistrationToken, RunnerReference, RunnerScaleSet,
    RunnerScaleSetJitRunnerConfig, RunnerScaleSetMessage, RunnerScaleSetSession,
    RunnerScaleSetSpec,
};
use bellows_core::error::{BellowsError, Result};
use bellows_core::forge::ForgeKind;

use crate::http::{check_response, error_from_status, error_from_transport};
use crate::rest::ForgeRestClient;

/// Artefacts refresh this close to expiry.
const REFRESH_MARGIN_SECS: i64 = 120;

/// Forced when a request carries no explicit API version.
const API_VERSION: &str = "6.0-preview";

#[derive(Default)]
struct AdminState {
    registration_token: Option<RegistrationToken>,
    admin_info: Option<ActionsServiceAdminInfo>,
}

/// Entity-scoped Actions service client.
pub struct ActionsClient {
    http: reqwest::Client,
    rest: Arc<ForgeRestClient>,
    state: Mutex<AdminState>,
}

impl ActionsClient {
    pub fn new(rest: Arc<ForgeRestClient>) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            rest,
            state: Mutex::new(AdminState::default()),
        })
    }

    /// The REST façade this client piggybacks on.
    pub fn rest(&self) -> &Arc<ForgeRestClient> {
        &self.rest
    }

    /// Fetch (or reuse) the actions-service admin info.
    ///
    /// Called before every request; the mutex makes sure a refresh happens
    /// at most once per expiry window even with concurrent callers.
    async fn ensure_admin_info(&self) -> Result<ActionsServiceAdminInfo> {
        let mut state = self.state.lock().await;

        if let Some(info) = &state.admin_info {
            if let Some(expires_at) = info.expires_at() {
                if expires_at - Utc::now() > Duration::seconds(REFRESH_MARGIN_SECS) {
                    return Ok(info.clone());
                }
            }
        }

        let registration_token = match &state.registration_token {
            Some(token) if token.expires_at - Utc::now() > Duration::seconds(REFRESH_MARGIN_SECS) => {
                token.clone()
            }
            _ => {
                let token = self.rest.create_entity_registration_token().await?;
                state.registration_token = Some(token.clone());
                token
            }
        };

        let entity = self.rest.entity();
        let api_base = entity.credentials.endpoint.api_base_url.trim_end_matches('/');
        let url = match entity.forge_kind() {
            ForgeKind::Github => format!("{}/actions/runner-registration", api_base),
            ForgeKind::Gitea => format!("{}/api/v1/actions/runner-registration", api_base),
        };
        let payload = serde_json::json!({
            "url": entity.registration_url(),
            "runner_event": "register",
        });
        let response = self
            .http
            .post(&url)
            .header(
                "Authorization",
                format!("RemoteAuth {}", registration_token.token),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| error_from_transport(e, "runner-registration"))?;
        let response = check_response(response, "runner-registration").await?;
        let info: ActionsServiceAdminInfo = response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "runner-registration"))?;

        tracing::debug!(entity = %entity, "refreshed actions service admin info");
        state.admin_info = Some(info.clone());
        Ok(info)
    }

    /// Build a request against the pipeline URL.
    ///
    /// Joins the relative path onto the admin URL and forces
    /// `api-version=6.0-preview` when the caller set none.
    async fn new_actions_request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<(reqwest::RequestBuilder, ActionsServiceAdminInfo)> {
        let info = self.ensure_admin_info().await?;
        let url = join_pipeline_url(&info.url, path)?;
        let builder = self
            .http
            .request(method, url)
            .bearer_auth(&info.token)
            .header("Accept", "application/json");
        Ok((builder, info))
    }

    async fn do_request<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = builder
            .send()
            .await
            .map_err(|e| error_from_transport(e, context))?;
        let response = check_response(response, context).await?;
        response
            .json()
            .await
            .map_err(|e| error_from_transport(e, context))
    }

    /// Create a runner scale set on the forge.
    pub async fn create_scale_set(&self, spec: &RunnerScaleSetSpec) -> Result<RunnerScaleSet> {
        let (builder, _) = self
            .new_actions_request(reqwest::Method::POST, "_apis/runtime/runnerscalesets")
            .await?;
        self.do_request("CreateScaleSet", builder.json(spec)).await
    }

    /// Fetch a runner scale set by forge-side ID.
    pub async fn get_scale_set(&self, scale_set_id: i64) -> Result<RunnerScaleSet> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::GET,
                &format!("_apis/runtime/runnerscalesets/{}", scale_set_id),
            )
            .await?;
        self.do_request("GetScaleSet", builder).await
    }

    /// Update a scale set's name, runner group, or enablement.
    pub async fn update_scale_set(
        &self,
        scale_set_id: i64,
        spec: &RunnerScaleSetSpec,
    ) -> Result<RunnerScaleSet> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::PUT,
                &format!("_apis/runtime/runnerscalesets/{}", scale_set_id),
            )
            .await?;
        self.do_request("UpdateScaleSet", builder.json(spec)).await
    }

    /// Delete a scale set from the forge.
    pub async fn delete_scale_set(&self, scale_set_id: i64) -> Result<()> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::DELETE,
                &format!("_apis/runtime/runnerscalesets/{}", scale_set_id),
            )
            .await?;
        let response = builder
            .send()
            .await
            .map_err(|e| error_from_transport(e, "DeleteScaleSet"))?;
        check_response(response, "DeleteScaleSet").await?;
        Ok(())
    }

    /// Generate a JIT runner config bound to a scale set.
    pub async fn generate_jit_runner_config(
        &self,
        runner_name: &str,
        scale_set_id: i64,
    ) -> Result<RunnerScaleSetJitRunnerConfig> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::POST,
                &format!("_apis/runtime/runnerscalesets/{}/generatejitconfig", scale_set_id),
            )
            .await?;
        let payload = serde_json::json!({
            "name": runner_name,
            "workFolder": "_work",
        });
        self.do_request("GenerateJitRunnerConfig", builder.json(&payload))
            .await
    }

    /// List every runner the Actions service knows for this entity.
    pub async fn list_all_runners(&self) -> Result<ActionsList<RunnerReference>> {
        let (builder, _) = self
            .new_actions_request(reqwest::Method::GET, "_apis/runtime/runners")
            .await?;
        self.do_request("ListAllRunners", builder).await
    }

    /// Fetch one runner by ID.
    pub async fn get_runner(&self, runner_id: i64) -> Result<RunnerReference> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::GET,
                &format!("_apis/runtime/runners/{}", runner_id),
            )
            .await?;
        self.do_request("GetRunner", builder).await
    }

    /// Fetch one runner by name.
    pub async fn get_runner_by_name(&self, name: &str) -> Result<RunnerReference> {
        let (builder, _) = self
            .new_actions_request(reqwest::Method::GET, "_apis/runtime/runners")
            .await?;
        let list: ActionsList<RunnerReference> = self
            .do_request("GetRunnerByName", builder.query(&[("agentName", name)]))
            .await?;
        list.value
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| BellowsError::NotFound(format!("runner {}", name)))
    }

    /// Remove a runner from the Actions service.
    pub async fn remove_runner(&self, runner_id: i64) -> Result<()> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::DELETE,
                &format!("_apis/runtime/runners/{}", runner_id),
            )
            .await?;
        let response = builder
            .send()
            .await
            .map_err(|e| error_from_transport(e, "RemoveRunner"))?;
        check_response(response, "RemoveRunner").await?;
        Ok(())
    }

    /// Open a message session on a scale set.
    pub async fn create_message_session(
        &self,
        scale_set_id: i64,
        owner: &str,
    ) -> Result<RunnerScaleSetSession> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::POST,
                &format!("_apis/runtime/runnerscalesets/{}/sessions", scale_set_id),
            )
            .await?;
        let payload = serde_json::json!({ "ownerName": owner });
        self.do_request("CreateMessageSession", builder.json(&payload))
            .await
    }

    /// Refresh a message session, obtaining a new queue access token.
    pub async fn refresh_session(
        &self,
        scale_set_id: i64,
        session_id: uuid::Uuid,
    ) -> Result<RunnerScaleSetSession> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::PATCH,
                &format!(
                    "_apis/runtime/runnerscalesets/{}/sessions/{}",
                    scale_set_id, session_id
                ),
            )
            .await?;
        self.do_request("RefreshSession", builder).await
    }

    /// Delete a message session.
    pub async fn delete_message_session(
        &self,
        scale_set_id: i64,
        session_id: uuid::Uuid,
    ) -> Result<()> {
        let (builder, _) = self
            .new_actions_request(
                reqwest::Method::DELETE,
                &format!(
                    "_apis/runtime/runnerscalesets/{}/sessions/{}",
                    scale_set_id, session_id
                ),
            )
            .await?;
        let response = builder
            .send()
            .await
            .map_err(|e| error_from_transport(e, "DeleteMessageSession"))?;
        check_response(response, "DeleteMessageSession").await?;
        Ok(())
    }

    /// Long-poll the message queue.
    ///
    /// Returns `None` when the poll times out with no content (HTTP 202).
    /// Authenticates with the session's queue token, not the service JWT.
    pub async fn get_message(
        &self,
        queue_url: &str,
        queue_token: &str,
        last_message_id: i64,
        max_capacity: u32,
    ) -> Result<Option<RunnerScaleSetMessage>> {
        let mut url = Url::parse(queue_url)
            .map_err(|e| BellowsError::BadRequest(format!("invalid queue URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("lastMessageId", &last_message_id.to_string());

        let response = self
            .http
            .get(url)
            .bearer_auth(queue_token)
            .header("Accept", "application/json")
            .header("X-ScaleSetMaxCapacity", max_capacity.to_string())
            .send()
            .await
            .map_err(|e| error_from_transport(e, "GetMessage"))?;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status, "GetMessage", &body));
        }
        let message = response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "GetMessage"))?;
        Ok(Some(message))
    }

    /// Acknowledge (delete) a processed message.
    pub async fn delete_message(
        &self,
        queue_url: &str,
        queue_token: &str,
        message_id: i64,
    ) -> Result<()> {
        let mut url = Url::parse(queue_url)
            .map_err(|e| BellowsError::BadRequest(format!("invalid queue URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| BellowsError::BadRequest("queue URL cannot be a base".to_string()))?
            .push(&message_id.to_string());

        let response = self
            .http
            .delete(url)
            .bearer_auth(queue_token)
            .send()
            .await
            .map_err(|e| error_from_transport(e, "DeleteMessage"))?;
        check_response(response, "DeleteMessage").await?;
        Ok(())
    }

    /// Acquire a batch of jobs for this scale set.
    ///
    /// Authenticates with the queue access token; the acquired job IDs come
    /// back as a list.
    pub async fn acquire_jobs(
        &self,
        scale_set_id: i64,
        queue_token: &str,
        request_ids: &[i64],
    ) -> Result<Vec<i64>> {
        let info = self.ensure_admin_info().await?;
        let url = join_pipeline_url(
            &info.url,
            &format!("_apis/runtime/runnerscalesets/{}/acquirejobs", scale_set_id),
        )?;
        let response = self
            .http
            .post(url)
            .bearer_auth(queue_token)
            .header("Accept", "application/json")
            .json(&request_ids)
            .send()
            .await
            .map_err(|e| error_from_transport(e, "AcquireJobs"))?;
        let response = check_response(response, "AcquireJobs").await?;
        let list: ActionsList<i64> = response
            .json()
            .await
            .map_err(|e| error_from_transport(e, "AcquireJobs"))?;
        Ok(list.value)
    }
}

/// Join a relative path onto the pipeline URL, preserving its base path and
/// forcing the default API version when none is set.
fn join_pipeline_url(base: &str, path: &str) -> Result<Url> {
    let mut base = base.trim_end_matches('/').to_string();
    base.push('/');
    let base = Url::parse(&base)
        .map_err(|e| BellowsError::BadRequest(format!("invalid pipeline URL: {}", e)))?;
    let mut url = base
        .join(path.trim_start_matches('/'))
        .map_err(|e| BellowsError::BadRequest(format!("invalid request path: {}", e)))?;
    let has_version = url.query_pairs().any(|(k, _)| k == "api-version");
    if !has_version {
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
    }
    Ok(url)
}
