mod credentials;
mod endpoint;
mod entity;

pub use credentials::{AuthKind, ForgeCredentials, RateLimitSnapshot};
pub use endpoint::{ForgeEndpoint, ForgeKind, GITHUB_COM_ENDPOINT};
pub use entity::{EntityKind, ForgeEntity};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Back-reference from a pool or scale set to the entity that owns it.
///
/// Exactly one of the three entity kinds owns any given group; modelling the
/// reference as an enum makes that invariant structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityScope {
    Repository(Uuid),
    Organization(Uuid),
    Enterprise(Uuid),
}

impl EntityScope {
    /// Build a scope pointing at the given entity.
    pub fn for_entity(entity: &ForgeEntity) -> Self {
        match entity.kind {
            EntityKind::Repository => Self::Repository(entity.id),
            EntityKind::Organization => Self::Organization(entity.id),
            EntityKind::Enterprise => Self::Enterprise(entity.id),
        }
    }

    /// The owning entity's ID.
    pub fn entity_id(&self) -> Uuid {
        match self {
            Self::Repository(id) | Self::Organization(id) | Self::Enterprise(id) => *id,
        }
    }

    /// The owning entity's kind.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::Repository(_) => EntityKind::Repository,
            Self::Organization(_) => EntityKind::Organization,
            Self::Enterprise(_) => EntityKind::Enterprise,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trip() {
        let id = Uuid::new_v4();
        let scope = EntityScope::Organization(id);
        let encoded = serde_json::to_string(&scope).unwrap();
        let decoded: EntityScope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, scope);
        assert_eq!(decoded.entity_id(), id);
        assert_eq!(decoded.entity_kind(), EntityKind::Organization);
    }
}
