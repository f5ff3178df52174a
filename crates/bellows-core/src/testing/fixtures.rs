use chrono::Utc;
use uuid::Uuid;

use crate::forge::{
    AuthKind, EntityKind, EntityScope, ForgeCredentials, ForgeEndpoint, ForgeEntity, ForgeKind,
};
use crate::instance::{Instance, ProviderStatus, RunnerStatus};
use crate::os::{OsArch, OsType};
use crate::scaleset::ScaleSet;

/// A github.com endpoint.
pub fn sample_endpoint(kind: ForgeKind) -> ForgeEndpoint {
    let now = Utc::now();
    match kind {
        ForgeKind::Github => ForgeEndpoint {
            name: "github.com".to_string(),
            description: String::new(),
            kind,
            base_url: "https://github.com".to_string(),
            api_base_url: "https://api.github.com".to_string(),
            upload_base_url: Some("https://uploads.github.com".to_string()),
            ca_cert_bundle: None,
            created_at: now,
            updated_at: now,
        },
        ForgeKind::Gitea => ForgeEndpoint {
            name: "gitea.internal".to_string(),
            description: String::new(),
            kind,
            base_url: "https://gitea.internal".to_string(),
            api_base_url: "https://gitea.internal".to_string(),
            upload_base_url: None,
            ca_cert_bundle: None,
            created_at: now,
            updated_at: now,
        },
    }
}

/// PAT credentials against the sample endpoint of the given kind.
pub fn sample_credentials(id: i64, kind: ForgeKind) -> ForgeCredentials {
    let now = Utc::now();
    ForgeCredentials {
        id,
        name: format!("creds-{}", id),
        description: String::new(),
        endpoint: sample_endpoint(kind),
        auth_kind: AuthKind::Pat,
        secret: "ghp_testtoken".to_string(),
        rate_limit: None,
        created_at: now,
        updated_at: now,
    }
}

/// An organization entity wired to the sample credentials.
pub fn sample_entity(kind: EntityKind, credentials: ForgeCredentials) -> ForgeEntity {
    let now = Utc::now();
    let (owner, name) = match kind {
        EntityKind::Repository => ("acme", "widgets"),
        EntityKind::Organization | EntityKind::Enterprise => ("acme", ""),
    };
    ForgeEntity {
        id: Uuid::new_v4(),
        kind,
        owner: owner.to_string(),
        name: name.to_string(),
        credentials,
        webhook_secret: "hush".to_string(),
        created_at: now,
        updated_at: now,
    }
}

/// A disabled-by-default scale set scoped to the given entity.
pub fn sample_scale_set(id: i64, entity: &ForgeEntity) -> ScaleSet {
    let now = Utc::now();
    let scope = EntityScope::for_entity(entity);
    ScaleSet {
        id,
        scale_set_id: 0,
        name: format!("scale-set-{}", id),
        scope,
        provider_name: "test-provider".to_string(),
        min_runners: 0,
        max_runners: 5,
        image: "ubuntu:24.04".to_string(),
        flavor: "default".to_string(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        runner_group: "Default".to_string(),
        last_message_id: 0,
        desired_runner_count: 0,
        enabled: true,
        runner_bootstrap_timeout_minutes: 20,
        runner_prefix: "bellows".to_string(),
        extra_specs: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    }
}

/// A pending instance owned by the given scale set.
pub fn sample_instance(name: &str, scale_set_id: i64) -> Instance {
    let now = Utc::now();
    Instance {
        name: name.to_string(),
        provider_id: None,
        agent_id: 0,
        os_type: OsType::Linux,
        os_name: String::new(),
        os_version: String::new(),
        os_arch: OsArch::Amd64,
        addresses: Vec::new(),
        provider_status: ProviderStatus::PendingCreate,
        runner_status: RunnerStatus::Pending,
        pool_id: None,
        scale_set_id: Some(scale_set_id),
        provider_fault: None,
        jit_configuration: None,
        status_messages: Vec::new(),
        create_attempt: 0,
        created_at: now,
        updated_at: now,
    }
}
