use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::forge::EntityScope;
use crate::os::{OsArch, OsType};

/// An elastic runner group driven by the forge's Actions service.
///
/// Unlike pools, scale sets do not match labels locally; the forge assigns
/// jobs to the scale set and streams them over the message queue. The
/// `scale_set_id` is the forge-side identity and must be recorded before the
/// listener starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSet {
    /// Local database ID.
    pub id: i64,
    /// Forge-side scale set ID; 0 until the scale set has been created on
    /// the forge. Unique per entity and runner group.
    pub scale_set_id: i64,
    pub name: String,
    pub scope: EntityScope,
    /// Name of the provider plug-in that boots this scale set's instances.
    pub provider_name: String,
    pub min_runners: u32,
    pub max_runners: u32,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    #[serde(default = "default_runner_group")]
    pub runner_group: String,
    /// Last acknowledged message ID; the replay cursor into the forge's
    /// message queue. Monotonic.
    pub last_message_id: i64,
    /// Assigned-job count reported by the forge's last statistics snapshot.
    pub desired_runner_count: u32,
    pub enabled: bool,
    /// How long a booting runner may stay unregistered before it is reaped.
    pub runner_bootstrap_timeout_minutes: u32,
    /// Prefix for generated runner names.
    #[serde(default = "default_runner_prefix")]
    pub runner_prefix: String,
    /// Opaque provider-specific settings, passed through untouched.
    #[serde(default)]
    pub extra_specs: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_runner_group() -> String {
    "Default".to_string()
}

fn default_runner_prefix() -> String {
    "bellows".to_string()
}

impl ScaleSet {
    /// Whether the forge-side scale set has been created yet.
    pub fn exists_on_forge(&self) -> bool {
        self.scale_set_id != 0
    }

    /// Desired runner count clamped to the configured bounds.
    pub fn clamped_desired_count(&self) -> u32 {
        self.desired_runner_count
            .clamp(self.min_runners, self.max_runners)
    }
}

/// Mutable fields accepted by scale set updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleSetUpdate {
    pub name: Option<String>,
    pub min_runners: Option<u32>,
    pub max_runners: Option<u32>,
    pub image: Option<String>,
    pub flavor: Option<String>,
    pub runner_group: Option<String>,
    pub enabled: Option<bool>,
    pub extra_specs: Option<serde_json::Value>,
}
