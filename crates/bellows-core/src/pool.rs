use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::forge::EntityScope;
use crate::os::{OsArch, OsType};

/// A static, label-matched runner group driven by webhook events.
///
/// Pools keep `min_idle` runners warm at all times and cap out at
/// `max_runners`. Jobs are routed to a pool when the pool is enabled and its
/// tag set contains every label the job requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: Uuid,
    pub scope: EntityScope,
    /// Name of the provider plug-in that boots this pool's instances.
    pub provider_name: String,
    pub min_idle_runners: u32,
    pub max_runners: u32,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    /// Ordered label set used for job matching.
    pub tags: Vec<String>,
    pub enabled: bool,
    #[serde(default)]
    pub runner_group: String,
    /// How long a booting runner may stay unregistered before it is reaped.
    pub runner_bootstrap_timeout_minutes: u32,
    /// Opaque provider-specific settings, passed through untouched.
    #[serde(default)]
    pub extra_specs: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    /// Whether this pool can service a job requesting `labels`.
    ///
    /// Matching is case-insensitive and requires every requested label to be
    /// present in the pool's tag set.
    pub fn has_required_labels(&self, labels: &[String]) -> bool {
        let tags: Vec<String> = self.tags.iter().map(|t| t.to_lowercase()).collect();
        labels.iter().all(|l| tags.contains(&l.to_lowercase()))
    }
}
