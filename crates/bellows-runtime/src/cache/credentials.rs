use std::collections::HashMap;
use std::sync::RwLock;

use bellows_core::forge::{ForgeCredentials, ForgeKind};

/// Invoked after a credentials update has been stored, outside the cache's
/// own lock. Used to fan the update out to cached entities.
pub type CredentialsCallback = Box<dyn Fn(&ForgeCredentials) + Send + Sync>;

/// Process-wide credentials mirror, one map per forge kind.
pub struct CredentialsCache {
    by_kind: RwLock<HashMap<ForgeKind, HashMap<i64, ForgeCredentials>>>,
    callback: RwLock<Option<CredentialsCallback>>,
}

impl CredentialsCache {
    pub fn new() -> Self {
        Self {
            by_kind: RwLock::new(HashMap::new()),
            callback: RwLock::new(None),
        }
    }

    /// Register the fan-out callback. Replaces any previous one.
    pub fn on_update(&self, callback: CredentialsCallback) {
        *self.callback.write().unwrap() = Some(callback);
    }

    /// Store credentials and fan the update out.
    ///
    /// The callback runs after the cache lock is released; it takes the
    /// callee's locks, never this cache's.
    pub fn set_credentials(&self, credentials: ForgeCredentials) {
        {
            let mut by_kind = self.by_kind.write().unwrap();
            by_kind
                .entry(credentials.forge_kind())
                .or_default()
                .insert(credentials.id, credentials.clone());
        }
        let callback = self.callback.read().unwrap();
        if let Some(cb) = callback.as_ref() {
            cb(&credentials);
        }
    }

    pub fn get_credentials(&self, kind: ForgeKind, id: i64) -> Option<ForgeCredentials> {
        let by_kind = self.by_kind.read().unwrap();
        by_kind.get(&kind)?.get(&id).cloned()
    }

    pub fn delete_credentials(&self, kind: ForgeKind, id: i64) {
        let mut by_kind = self.by_kind.write().unwrap();
        if let Some(creds) = by_kind.get_mut(&kind) {
            creds.remove(&id);
        }
    }

    /// All credentials of one forge kind, sorted by ID.
    pub fn all_credentials(&self, kind: ForgeKind) -> Vec<ForgeCredentials> {
        let by_kind = self.by_kind.read().unwrap();
        let mut credentials: Vec<_> = by_kind
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        credentials.sort_by_key(|c| c.id);
        credentials
    }
}

impl Default for CredentialsCache {
    fn default() -> Self {
        Self::new()
    }
}
