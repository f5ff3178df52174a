use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::credentials::ForgeCredentials;
use super::endpoint::ForgeKind;

/// The kind of forge object an entity maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Repository,
    Organization,
    Enterprise,
}

impl EntityKind {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Organization => "organization",
            Self::Enterprise => "enterprise",
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = crate::error::BellowsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repository" => Ok(Self::Repository),
            "organization" => Ok(Self::Organization),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(crate::error::BellowsError::BadRequest(format!(
                "unknown entity kind: {}",
                other
            ))),
        }
    }
}

/// A repository, organization, or enterprise the controller manages
/// runners for.
///
/// The embedded credentials are a snapshot; readers going through the
/// coordination cache always see the latest credentials without the entity
/// row being rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeEntity {
    pub id: Uuid,
    pub kind: EntityKind,
    /// Repository owner, organization name, or enterprise slug.
    pub owner: String,
    /// Repository name; empty for organizations and enterprises.
    #[serde(default)]
    pub name: String,
    pub credentials: ForgeCredentials,
    /// Shared secret used to validate incoming webhooks.
    pub webhook_secret: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ForgeEntity {
    /// The kind of forge this entity lives on.
    pub fn forge_kind(&self) -> ForgeKind {
        self.credentials.forge_kind()
    }

    /// Stable label used to scope metrics and log lines.
    pub fn label_scope(&self) -> String {
        match self.kind {
            EntityKind::Repository => format!("repo:{}/{}", self.owner, self.name),
            EntityKind::Organization => format!("org:{}", self.owner),
            EntityKind::Enterprise => format!("enterprise:{}", self.owner),
        }
    }

    /// REST resource root for this entity.
    pub fn forge_path(&self) -> String {
        match self.kind {
            EntityKind::Repository => format!("repos/{}/{}", self.owner, self.name),
            EntityKind::Organization => format!("orgs/{}", self.owner),
            EntityKind::Enterprise => format!("enterprises/{}", self.owner),
        }
    }

    /// The web URL runners register against.
    pub fn registration_url(&self) -> String {
        let base = self.credentials.endpoint.base_url.trim_end_matches('/');
        match self.kind {
            EntityKind::Repository => format!("{}/{}/{}", base, self.owner, self.name),
            EntityKind::Organization => format!("{}/{}", base, self.owner),
            EntityKind::Enterprise => format!("{}/enterprises/{}", base, self.owner),
        }
    }
}

impl std::fmt::Display for ForgeEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label_scope())
    }
}
