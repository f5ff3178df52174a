use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::endpoint::{ForgeEndpoint, ForgeKind};

/// How the controller authenticates against a forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    /// Personal access token.
    Pat,
    /// GitHub App installation.
    App,
}

impl AuthKind {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pat => "pat",
            Self::App => "app",
        }
    }
}

impl std::str::FromStr for AuthKind {
    type Err = crate::error::BellowsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pat" => Ok(Self::Pat),
            "app" => Ok(Self::App),
            other => Err(crate::error::BellowsError::BadRequest(format!(
                "unknown auth kind: {}",
                other
            ))),
        }
    }
}

/// Point-in-time view of the forge's rate limit for a credential.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: i64,
    pub remaining: i64,
    /// Unix timestamp at which the limit window resets.
    pub reset: i64,
}

/// Credentials used to talk to one forge endpoint.
///
/// Credentials referenced by any entity may not be deleted; the store
/// enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeCredentials {
    /// Numeric unique ID.
    pub id: i64,
    /// Human name, unique per endpoint.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// The endpoint these credentials are valid for.
    pub endpoint: ForgeEndpoint,
    pub auth_kind: AuthKind,
    /// Secret material (PAT or app private key), stored encrypted at rest.
    pub secret: String,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ForgeCredentials {
    /// The kind of forge these credentials authenticate against.
    pub fn forge_kind(&self) -> ForgeKind {
        self.endpoint.kind
    }
}
