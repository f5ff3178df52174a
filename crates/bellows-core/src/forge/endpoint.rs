use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The endpoint name reserved for the hosted github.com deployment.
/// It is seeded at install time and can never be deleted.
pub const GITHUB_COM_ENDPOINT: &str = "github.com";

/// The kind of forge a deployment speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForgeKind {
    Github,
    Gitea,
}

impl ForgeKind {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitea => "gitea",
        }
    }
}

impl std::str::FromStr for ForgeKind {
    type Err = crate::error::BellowsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "gitea" => Ok(Self::Gitea),
            other => Err(crate::error::BellowsError::BadRequest(format!(
                "unknown forge kind: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ForgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A forge deployment reachable by the controller.
///
/// Endpoints are identified by a stable, unique name. Credentials reference
/// an endpoint by name, so an endpoint with credentials attached cannot be
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeEndpoint {
    /// Stable unique name (e.g. "github.com", "gitea.internal").
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Kind of forge behind this endpoint.
    pub kind: ForgeKind,
    /// Base URL of the web UI (used for runner registration URLs).
    pub base_url: String,
    /// Base URL of the REST API.
    pub api_base_url: String,
    /// Base URL for artifact uploads, when distinct from the API base.
    #[serde(default)]
    pub upload_base_url: Option<String>,
    /// PEM bundle appended to the system trust store for this endpoint.
    #[serde(default)]
    pub ca_cert_bundle: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ForgeEndpoint {
    /// Whether this endpoint is the reserved github.com entry.
    pub fn is_reserved(&self) -> bool {
        self.name == GITHUB_COM_ENDPOINT
    }
}
