use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::os::{OsArch, OsType};

/// Where an instance stands with its infrastructure provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    PendingCreate,
    Creating,
    Running,
    PendingDelete,
    Deleting,
    Error,
}

impl ProviderStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingCreate => "pending_create",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::PendingDelete => "pending_delete",
            Self::Deleting => "deleting",
            Self::Error => "error",
        }
    }

    /// Whether the instance still counts towards the scale set's live
    /// capacity.
    pub fn counts_as_active(&self) -> bool {
        !matches!(self, Self::PendingDelete | Self::Deleting | Self::Error)
    }
}

impl std::str::FromStr for ProviderStatus {
    type Err = crate::error::BellowsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_create" => Ok(Self::PendingCreate),
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "pending_delete" => Ok(Self::PendingDelete),
            "deleting" => Ok(Self::Deleting),
            "error" => Ok(Self::Error),
            other => Err(crate::error::BellowsError::BadRequest(format!(
                "unknown provider status: {}",
                other
            ))),
        }
    }
}

/// Where the runner agent on an instance stands with the forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Pending,
    Installing,
    Idle,
    Active,
    Failed,
    Terminated,
}

impl RunnerStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

impl std::str::FromStr for RunnerStatus {
    type Err = crate::error::BellowsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "installing" => Ok(Self::Installing),
            "idle" => Ok(Self::Idle),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(crate::error::BellowsError::BadRequest(format!(
                "unknown runner status: {}",
                other
            ))),
        }
    }
}

/// Network address class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Public,
    Private,
}

/// One address reported by the provider for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub kind: AddressKind,
}

/// A timestamped status line appended while an instance boots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub created_at: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub event_level: String,
}

/// A VM running (or intended to run) a single runner agent.
///
/// Exactly one of `pool_id` and `scale_set_id` is set; an instance belongs
/// to a pool or to a scale set, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique generated name; also the runner's name on the forge.
    pub name: String,
    /// ID the provider knows this instance by, once it has been created.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// The forge's runner (agent) ID; 0 until the runner registers.
    #[serde(default)]
    pub agent_id: i64,
    pub os_type: OsType,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    pub os_arch: OsArch,
    #[serde(default)]
    pub addresses: Vec<Address>,
    pub provider_status: ProviderStatus,
    pub runner_status: RunnerStatus,
    #[serde(default)]
    pub pool_id: Option<Uuid>,
    /// Local DB ID of the owning scale set.
    #[serde(default)]
    pub scale_set_id: Option<i64>,
    /// Opaque fault blob recorded when the provider fails the instance.
    #[serde(default)]
    pub provider_fault: Option<String>,
    /// Base64 JIT runner config issued for this instance, reused when a
    /// failed boot is retried.
    #[serde(default)]
    pub jit_configuration: Option<String>,
    #[serde(default)]
    pub status_messages: Vec<StatusMessage>,
    /// Consecutive provider boot failures for this slot.
    #[serde(default)]
    pub create_attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// Check the pool-xor-scale-set ownership invariant.
    pub fn has_exactly_one_owner(&self) -> bool {
        self.pool_id.is_some() != self.scale_set_id.is_some()
    }
}

/// Partial update applied to an instance row.
///
/// `None` fields are left untouched. Updates for the same instance name are
/// serialised by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    pub provider_id: Option<String>,
    pub agent_id: Option<i64>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub addresses: Option<Vec<Address>>,
    pub provider_status: Option<ProviderStatus>,
    pub runner_status: Option<RunnerStatus>,
    pub provider_fault: Option<String>,
    pub status_message: Option<String>,
    pub create_attempt: Option<u32>,
}
