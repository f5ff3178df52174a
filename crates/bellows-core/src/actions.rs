//! Wire types for the forge's Actions service.
//!
//! The Actions service is the message-driven subsystem behind runner scale
//! sets: scale set CRUD, message sessions, the long-polled job queue, and
//! just-in-time runner configs. Field names follow the service's camelCase
//! JSON convention.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Admin access to the Actions service, exchanged from a registration token.
///
/// `url` is the pipeline URL all scale set endpoints hang off of; `token` is
/// a short-lived bearer JWT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionsServiceAdminInfo {
    pub url: String,
    pub token: String,
}

impl ActionsServiceAdminInfo {
    /// Expiry of the admin JWT, read from its `exp` claim.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        jwt_expiry(&self.token)
    }
}

/// A short-lived runner registration token from the forge REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A label attached to a runner or scale set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl Label {
    /// A user-defined label.
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "User".to_string(),
        }
    }
}

/// Job statistics the forge reports for a scale set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetStatistic {
    #[serde(default)]
    pub total_available_jobs: i64,
    #[serde(default)]
    pub total_acquired_jobs: i64,
    /// Drives the desired runner count during reconciliation.
    #[serde(default)]
    pub total_assigned_jobs: i64,
    #[serde(default)]
    pub total_running_jobs: i64,
    #[serde(default)]
    pub total_registered_runners: i64,
    #[serde(default)]
    pub total_busy_runners: i64,
    #[serde(default)]
    pub total_idle_runners: i64,
}

/// A runner scale set as the Actions service sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSet {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub runner_group_id: i64,
    #[serde(default)]
    pub runner_group_name: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub statistics: Option<RunnerScaleSetStatistic>,
}

/// Payload for scale set creation and updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetSpec {
    pub name: Option<String>,
    pub runner_group_id: Option<i64>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub enabled: Option<bool>,
}

/// Paged list wrapper the Actions service uses for collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionsList<T> {
    pub count: i64,
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
}

/// A runner registered against a scale set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReference {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub runner_scale_set_id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl RunnerReference {
    /// Whether this runner carries the given label.
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

/// A just-in-time runner config: one runner, one shot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetJitRunnerConfig {
    pub runner: RunnerReference,
    pub encoded_jit_config: String,
}

/// A message session bound to one scale set.
///
/// The queue URL and access token are distinct from the admin info; queue
/// requests authenticate with `message_queue_access_token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetSession {
    pub session_id: Uuid,
    pub owner_name: String,
    #[serde(default)]
    pub runner_scale_set: Option<RunnerScaleSet>,
    pub message_queue_url: String,
    pub message_queue_access_token: String,
}

impl RunnerScaleSetSession {
    /// Expiry of the queue access token, read from its `exp` claim.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        jwt_expiry(&self.message_queue_access_token)
    }
}

/// One message popped from a scale set's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetMessage {
    pub message_id: i64,
    pub message_type: String,
    #[serde(default)]
    pub statistics: Option<RunnerScaleSetStatistic>,
    /// JSON-encoded list of job messages.
    #[serde(default)]
    pub body: Option<String>,
}

impl RunnerScaleSetMessage {
    /// Decode the body into individual job messages.
    ///
    /// An absent or empty body decodes to an empty list; statistics-only
    /// messages carry no jobs.
    pub fn jobs(&self) -> crate::error::Result<Vec<ScaleSetJobMessage>> {
        match self.body.as_deref() {
            None | Some("") => Ok(Vec::new()),
            Some(body) => Ok(serde_json::from_str(body)?),
        }
    }
}

/// Job event types carried inside a scale set message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobMessageType {
    #[serde(rename = "JobAvailable")]
    JobAvailable,
    #[serde(rename = "JobAssigned")]
    JobAssigned,
    #[serde(rename = "JobStarted")]
    JobStarted,
    #[serde(rename = "JobCompleted")]
    JobCompleted,
}

/// A single job event decoded from a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetJobMessage {
    pub message_type: JobMessageType,
    pub runner_request_id: i64,
    #[serde(default)]
    pub job_display_name: String,
    #[serde(default)]
    pub job_workflow_ref: String,
    #[serde(default)]
    pub requested_labels: Vec<String>,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub runner_assign_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
}

/// Read the `exp` claim out of a JWT without verifying the signature.
///
/// The controller only needs expiry for proactive refresh; the forge is the
/// one verifying these tokens.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}
