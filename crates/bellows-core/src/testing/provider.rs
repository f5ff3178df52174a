use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{BellowsError, Result};
use crate::instance::ProviderStatus;
use crate::provider::{BootstrapInstance, Provider, ProviderInstance};

/// One call observed by a [`RecordingProvider`].
#[derive(Debug, Clone)]
pub enum ProviderCall {
    Create(BootstrapInstance),
    Delete(String),
}

/// A provider that records calls and boots imaginary VMs.
///
/// `fail_next_creates` makes the next N create calls return a transient
/// error, for exercising the reconciler's retry path.
#[derive(Debug, Clone, Default)]
pub struct RecordingProvider {
    calls: Arc<Mutex<Vec<ProviderCall>>>,
    fail_next_creates: Arc<Mutex<u32>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls seen so far, in order.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of instances created so far.
    pub fn created(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ProviderCall::Create(b) => Some(b.name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Provider IDs deleted so far.
    pub fn deleted(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ProviderCall::Delete(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: u32) {
        *self.fail_next_creates.lock().unwrap() = n;
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn create_instance(&self, bootstrap: &BootstrapInstance) -> Result<ProviderInstance> {
        self.calls
            .lock()
            .unwrap()
            .push(ProviderCall::Create(bootstrap.clone()));

        {
            let mut failures = self.fail_next_creates.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(BellowsError::Transient("boot failed".to_string()));
            }
        }

        Ok(ProviderInstance {
            provider_id: format!("prov-{}", bootstrap.name),
            name: bootstrap.name.clone(),
            status: ProviderStatus::Running,
            os_name: "ubuntu".to_string(),
            os_version: "24.04".to_string(),
            addresses: Vec::new(),
            provider_fault: None,
        })
    }

    async fn delete_instance(&self, provider_id: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(ProviderCall::Delete(provider_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_instance;

    fn bootstrap(name: &str) -> BootstrapInstance {
        let instance = sample_instance(name, 1);
        BootstrapInstance {
            name: instance.name,
            os_type: instance.os_type,
            os_arch: instance.os_arch,
            image: "ubuntu:24.04".to_string(),
            flavor: "default".to_string(),
            extra_specs: serde_json::Value::Null,
            ca_cert_bundle: None,
            labels: Vec::new(),
            runner_group: String::new(),
            callback_url: "https://bellows.internal/callbacks".to_string(),
            metadata_url: "https://bellows.internal/metadata".to_string(),
            instance_token: "token".to_string(),
            jit_config: Some("e30=".to_string()),
            registration_token: None,
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_recording_and_failure_injection() {
        let provider = RecordingProvider::new();
        provider.fail_next_creates(1);

        let err = provider.create_instance(&bootstrap("r1")).await.unwrap_err();
        assert!(err.is_transient());

        let ok = provider.create_instance(&bootstrap("r2")).await.unwrap();
        assert_eq!(ok.provider_id, "prov-r2");

        provider.delete_instance("prov-r2").await.unwrap();

        assert_eq!(provider.created(), vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(provider.deleted(), vec!["prov-r2".to_string()]);
    }
}
