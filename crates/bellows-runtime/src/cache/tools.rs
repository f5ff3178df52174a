use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use bellows_core::error::{BellowsError, Result};
use bellows_core::forge::{ForgeEntity, ForgeKind};
use bellows_core::tools::RunnerApplicationDownload;

/// Validity window for github.com tool downloads. The hosted forge signs
/// download URLs with a one hour lifetime.
const TOOLS_TTL: i64 = 3600;

/// Margin before expiry at which entries are already treated as stale, so
/// a runner booting right at the edge never receives dead URLs.
const STALE_MARGIN: i64 = 300;

struct ToolsEntry {
    tools: Vec<RunnerApplicationDownload>,
    #[allow(dead_code)]
    updated_at: DateTime<Utc>,
    /// Only github entries expire; other forges sign nothing.
    expires_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// Per-entity cache of runner application downloads.
pub struct ToolsCache {
    inner: RwLock<HashMap<Uuid, ToolsEntry>>,
}

impl ToolsCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Cache a fresh tool set for an entity. Clears any sticky error.
    pub fn set_tools(&self, entity: &ForgeEntity, tools: Vec<RunnerApplicationDownload>) {
        self.set_tools_at(entity, tools, Utc::now());
    }

    fn set_tools_at(
        &self,
        entity: &ForgeEntity,
        tools: Vec<RunnerApplicationDownload>,
        now: DateTime<Utc>,
    ) {
        let expires_at = match entity.forge_kind() {
            ForgeKind::Github => Some(now + Duration::seconds(TOOLS_TTL)),
            ForgeKind::Gitea => None,
        };
        let mut inner = self.inner.write().unwrap();
        inner.insert(
            entity.id,
            ToolsEntry {
                tools,
                updated_at: now,
                expires_at,
                error: None,
            },
        );
    }

    /// Record a sticky fetch error without wiping any cached tools, so
    /// subsequent reads fail fast instead of hammering the forge.
    pub fn set_tools_error(&self, entity: &ForgeEntity, error: impl Into<String>) {
        self.set_tools_error_at(entity, error, Utc::now());
    }

    fn set_tools_error_at(
        &self,
        entity: &ForgeEntity,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let expires_at = match entity.forge_kind() {
            ForgeKind::Github => Some(now + Duration::seconds(TOOLS_TTL)),
            ForgeKind::Gitea => None,
        };
        let mut inner = self.inner.write().unwrap();
        let entry = inner.entry(entity.id).or_insert(ToolsEntry {
            tools: Vec::new(),
            updated_at: now,
            expires_at,
            error: None,
        });
        entry.error = Some(error.into());
        entry.updated_at = now;
        entry.expires_at = expires_at;
    }

    /// Fetch the cached tool set for an entity.
    ///
    /// Fails when nothing is cached, when a sticky error is recorded, or
    /// when the entry is within [`STALE_MARGIN`] of expiry.
    pub fn get_tools(&self, entity_id: Uuid) -> Result<Vec<RunnerApplicationDownload>> {
        self.get_tools_at(entity_id, Utc::now())
    }

    fn get_tools_at(
        &self,
        entity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunnerApplicationDownload>> {
        let inner = self.inner.read().unwrap();
        let entry = inner
            .get(&entity_id)
            .ok_or_else(|| BellowsError::NotFound(format!("no tools cached for entity {}", entity_id)))?;

        if let Some(error) = &entry.error {
            return Err(BellowsError::Transient(format!(
                "tools fetch for entity {} failed: {}",
                entity_id, error
            )));
        }
        if let Some(expires_at) = entry.expires_at {
            if now >= expires_at - Duration::seconds(STALE_MARGIN) {
                return Err(BellowsError::Transient(format!(
                    "tools for entity {} are stale",
                    entity_id
                )));
            }
        }
        Ok(entry.tools.clone())
    }

    /// Whether the entry should be fetched again.
    ///
    /// Missing and stale entries want a refresh; an unexpired sticky error
    /// does not, so callers fail fast instead of hammering the forge.
    pub fn needs_refresh(&self, entity_id: Uuid) -> bool {
        self.needs_refresh_at(entity_id, Utc::now())
    }

    fn needs_refresh_at(&self, entity_id: Uuid, now: DateTime<Utc>) -> bool {
        let inner = self.inner.read().unwrap();
        let Some(entry) = inner.get(&entity_id) else {
            return true;
        };
        match (&entry.error, entry.expires_at) {
            (Some(_), Some(expires_at)) => now >= expires_at,
            // Errors on forges without a TTL may be retried immediately.
            (Some(_), None) => true,
            (None, Some(expires_at)) => now >= expires_at - Duration::seconds(STALE_MARGIN),
            (None, None) => false,
        }
    }

    pub fn delete_tools(&self, entity_id: Uuid) {
        self.inner.write().unwrap().remove(&entity_id);
    }
}

impl Default for ToolsCache {
    fn default() -> Self {
        Self::new()
    }
}
