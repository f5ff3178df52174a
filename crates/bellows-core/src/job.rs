use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a forge job as seen through the message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Assigned,
    InProgress,
    Completed,
}

impl JobStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::BellowsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(crate::error::BellowsError::BadRequest(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// A workflow job observed on the message stream.
///
/// Job rows are informational; reconciliation is driven by the forge's
/// assigned-job statistics, never by this table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// The forge's runner-request ID for this job.
    pub runner_request_id: i64,
    pub name: String,
    #[serde(default)]
    pub workflow_ref: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Name of the runner the job landed on, once known.
    #[serde(default)]
    pub runner_name: Option<String>,
    /// Entity whose scale set or pool services this job.
    pub entity_id: Uuid,
    pub status: JobStatus,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
