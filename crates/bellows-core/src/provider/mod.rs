//! Contract between the controller and infrastructure provider plug-ins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BellowsError, Result};
use crate::instance::{Address, ProviderStatus};
use crate::os::{OsArch, OsType};
use crate::tools::RunnerApplicationDownload;

/// Everything a provider needs to boot one runner VM.
///
/// `jit_config` and `registration_token` are a union: scale sets and GitHub
/// pools populate the JIT blob, Gitea pools fall back to a shared
/// registration token. The provider consumes whichever is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInstance {
    /// Runner name; also the instance name in the database.
    pub name: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub image: String,
    pub flavor: String,
    /// Opaque provider-specific settings, passed through untouched.
    #[serde(default)]
    pub extra_specs: serde_json::Value,
    #[serde(default)]
    pub ca_cert_bundle: Option<Vec<u8>>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub runner_group: String,
    /// URL the booting runner reports status to.
    pub callback_url: String,
    /// URL the booting runner fetches instance metadata from.
    pub metadata_url: String,
    /// Bearer the instance uses against the callback and metadata URLs.
    pub instance_token: String,
    /// Base64 JIT runner config, when the forge issued one.
    #[serde(default)]
    pub jit_config: Option<String>,
    /// Shared registration token, when JIT configs are unavailable.
    #[serde(default)]
    pub registration_token: Option<String>,
    /// Runner application downloads for the instance's OS and arch.
    #[serde(default)]
    pub tools: Vec<RunnerApplicationDownload>,
}

/// What a provider reports back about an instance it manages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstance {
    /// ID the provider knows the instance by.
    pub provider_id: String,
    pub name: String,
    pub status: ProviderStatus,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub provider_fault: Option<String>,
}

/// An infrastructure provider plug-in.
///
/// Calls may block for minutes; implementations must honor cancellation via
/// the caller dropping the future.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Boot a VM for one runner.
    async fn create_instance(&self, bootstrap: &BootstrapInstance) -> Result<ProviderInstance>;

    /// Tear down a VM. Deleting an unknown instance is not an error.
    async fn delete_instance(&self, provider_id: &str) -> Result<()>;
}

/// The static set of providers configured at process start.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under a name. Later registrations replace
    /// earlier ones.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Look up a provider. A miss is terminal: the provider set is static
    /// for the life of the process.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers.get(name).cloned().ok_or_else(|| {
            BellowsError::Terminal(format!("no provider registered under name {}", name))
        })
    }

    /// Registered provider names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullProvider;

    #[async_trait]
    impl Provider for NullProvider {
        async fn create_instance(
            &self,
            bootstrap: &BootstrapInstance,
        ) -> Result<ProviderInstance> {
            Ok(ProviderInstance {
                provider_id: format!("null-{}", bootstrap.name),
                name: bootstrap.name.clone(),
                status: ProviderStatus::Running,
                os_name: String::new(),
                os_version: String::new(),
                addresses: Vec::new(),
                provider_fault: None,
            })
        }

        async fn delete_instance(&self, _provider_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register("null", Arc::new(NullProvider));

        assert!(registry.get("null").is_ok());
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, BellowsError::Terminal(_)));
        assert_eq!(registry.names(), vec!["null".to_string()]);
    }
}
