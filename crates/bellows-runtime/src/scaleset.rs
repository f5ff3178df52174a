//! Per-scale-set worker.
//!
//! Owns the listener and the reconciler for one scale set: makes sure the
//! forge-side scale set exists, keeps tools cached, and converges the
//! instance inventory to the assigned-job count reported by the forge.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bellows_core::actions::{Label, RunnerReference, RunnerScaleSetSpec};
use bellows_core::config::BellowsConfig;
use bellows_core::error::{BellowsError, Result};
use bellows_core::forge::ForgeEntity;
use bellows_core::instance::{Instance, InstanceUpdate, ProviderStatus, RunnerStatus};
use bellows_core::provider::{BootstrapInstance, Provider, ProviderRegistry};
use bellows_core::scaleset::ScaleSet;
use bellows_core::store::Store;
use bellows_core::tools::download_for;

use crate::actions::ActionsClient;
use crate::cache::Cache;
use crate::listener::ScaleSetListener;

/// Label prefix stamping runners with the controller that owns them.
pub const CONTROLLER_ID_LABEL: &str = "bellows-controller-id";

/// Label prefix carrying the owning scale set's database ID.
pub const SCALE_SET_ID_LABEL: &str = "scale-set-id";

/// Provider boots are retried up to this many times per instance.
const MAX_CREATE_ATTEMPTS: u32 = 3;

/// Minimum wait between boot retries for the same instance.
const CREATE_RETRY_COOLDOWN_SECS: i64 = 60;

/// Build the controller ownership label for runners.
pub fn controller_label(controller_id: Uuid) -> String {
    format!("{}:{}", CONTROLLER_ID_LABEL, controller_id)
}

/// Build the scale set ownership label for runners.
pub fn scale_set_label(scale_set_id: i64) -> String {
    format!("{}:{}", SCALE_SET_ID_LABEL, scale_set_id)
}

/// Extract the scale set database ID out of an ownership label.
pub fn parse_scale_set_label(label: &str) -> Option<i64> {
    label
        .strip_prefix(SCALE_SET_ID_LABEL)?
        .strip_prefix(':')?
        .parse()
        .ok()
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

/// User-visible worker status.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub failure_reason: Option<String>,
}

/// Reconciles one scale set.
pub struct ScaleSetWorker {
    entity: RwLock<ForgeEntity>,
    scale_set: Arc<RwLock<ScaleSet>>,
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    provider: Arc<dyn Provider>,
    actions: Arc<ActionsClient>,
    listener: Arc<ScaleSetListener>,
    config: Arc<BellowsConfig>,
    wake: Arc<Notify>,
    status: RwLock<WorkerStatus>,
    forge_ensured: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    loop_exited: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ScaleSetWorker {
    /// Build a worker, resolving its provider.
    ///
    /// A missing provider is terminal: the provider set is fixed at process
    /// start, so there is nothing to retry.
    pub fn new(
        entity: ForgeEntity,
        scale_set: ScaleSet,
        store: Arc<dyn Store>,
        cache: Arc<Cache>,
        providers: &ProviderRegistry,
        actions: Arc<ActionsClient>,
        config: Arc<BellowsConfig>,
    ) -> Result<Arc<Self>> {
        let provider = providers.get(&scale_set.provider_name)?;
        let scale_set = Arc::new(RwLock::new(scale_set));
        let wake = Arc::new(Notify::new());
        let listener = ScaleSetListener::new(
            actions.clone(),
            store.clone(),
            scale_set.clone(),
            wake.clone(),
        );
        Ok(Arc::new(Self {
            entity: RwLock::new(entity),
            scale_set,
            store,
            cache,
            provider,
            actions,
            listener,
            config,
            wake,
            status: RwLock::new(WorkerStatus::default()),
            forge_ensured: AtomicBool::new(false),
            cancel: Mutex::new(None),
            loop_exited: Mutex::new(None),
        }))
    }

    /// Database ID of the scale set this worker owns.
    pub fn scale_set_id(&self) -> i64 {
        self.scale_set.read().unwrap().id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.read().unwrap().clone()
    }

    fn set_failure(&self, reason: impl Into<String>) {
        self.status.write().unwrap().failure_reason = Some(reason.into());
    }

    fn clear_failure(&self) {
        self.status.write().unwrap().failure_reason = None;
    }

    /// Start the reconcile loop. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut cancel_slot = self.cancel.lock().unwrap();
        if cancel_slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());
        drop(cancel_slot);

        self.status.write().unwrap().is_running = true;
        let (exited_tx, exited_rx) = oneshot::channel();
        *self.loop_exited.lock().unwrap() = Some(exited_rx);

        let worker = self.clone();
        tokio::spawn(async move {
            worker.run_loop(cancel).await;
            let _ = exited_tx.send(());
        });
        tracing::info!(
            scale_set = self.scale_set.read().unwrap().id,
            "scale set worker started"
        );
    }

    /// Stop the loop and the listener. Idempotent.
    pub async fn stop(&self) {
        let cancel = self.cancel.lock().unwrap().take();
        let Some(cancel) = cancel else { return };
        cancel.cancel();
        self.wake.notify_one();
        let exited = self.loop_exited.lock().unwrap().take();
        if let Some(exited) = exited {
            let _ = exited.await;
        }
        self.listener.stop().await;
        self.status.write().unwrap().is_running = false;
        tracing::info!(
            scale_set = self.scale_set.read().unwrap().id,
            "scale set worker stopped"
        );
    }

    /// Push an updated snapshot into the worker; the next tick reconciles
    /// against it. The message cursor never moves backwards.
    pub fn scale_set_updated(&self, mut snapshot: ScaleSet) {
        {
            let mut current = self.scale_set.write().unwrap();
            if snapshot.last_message_id < current.last_message_id {
                snapshot.last_message_id = current.last_message_id;
                snapshot.desired_runner_count = current.desired_runner_count;
            }
            if snapshot.scale_set_id == 0 {
                snapshot.scale_set_id = current.scale_set_id;
            }
            *current = snapshot;
        }
        self.wake.notify_one();
    }

    /// Swap the entity snapshot (credential rotation, webhook edits).
    pub fn entity_updated(&self, entity: ForgeEntity) {
        self.actions.rest().update_entity(entity.clone());
        *self.entity.write().unwrap() = entity;
        self.wake.notify_one();
    }

    async fn run_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.intervals.reconcile();
        loop {
            match self.tick().await {
                Ok(()) => self.clear_failure(),
                Err(e) => {
                    tracing::warn!(
                        scale_set = self.scale_set.read().unwrap().id,
                        error = %e,
                        "reconcile tick failed"
                    );
                    self.set_failure(e.to_string());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            if cancel.is_cancelled() {
                break;
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        self.ensure_forge_scale_set().await?;
        self.ensure_tools().await?;
        if !self.listener.is_running() {
            self.listener.start().await?;
        }
        self.reconcile().await
    }

    /// Make sure the forge-side scale set exists and matches the local row.
    async fn ensure_forge_scale_set(&self) -> Result<()> {
        if self.forge_ensured.load(Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = self.scale_set.read().unwrap().clone();
        let entity = self.entity.read().unwrap().clone();
        let controller_id = self.config.controller.id;

        if snapshot.scale_set_id == 0 {
            let runner_group_id = self
                .actions
                .rest()
                .resolve_runner_group_named(&entity, &snapshot.runner_group)
                .await?;
            let spec = RunnerScaleSetSpec {
                name: Some(snapshot.name.clone()),
                runner_group_id: Some(runner_group_id),
                labels: vec![
                    Label::user(controller_label(controller_id)),
                    Label::user(scale_set_label(snapshot.id)),
                ],
                enabled: Some(true),
            };
            let created = self.actions.create_scale_set(&spec).await?;
            let updated = self
                .store
                .set_scale_set_forge_id(snapshot.id, created.id)
                .await?;
            self.scale_set.write().unwrap().scale_set_id = updated.scale_set_id;
            tracing::info!(
                scale_set = snapshot.id,
                forge_id = created.id,
                "created runner scale set on forge"
            );
        } else {
            let remote = self.actions.get_scale_set(snapshot.scale_set_id).await?;
            let name_matches = remote.name == snapshot.name;
            let group_matches = remote.runner_group_name.is_empty()
                || remote.runner_group_name.eq_ignore_ascii_case(&snapshot.runner_group);
            if !name_matches || !group_matches {
                let runner_group_id = self
                    .actions
                    .rest()
                    .resolve_runner_group_named(&entity, &snapshot.runner_group)
                    .await?;
                let spec = RunnerScaleSetSpec {
                    name: Some(snapshot.name.clone()),
                    runner_group_id: Some(runner_group_id),
                    labels: Vec::new(),
                    enabled: Some(snapshot.enabled),
                };
                self.actions
                    .update_scale_set(snapshot.scale_set_id, &spec)
                    .await?;
            }
        }
        self.forge_ensured.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Keep runner application downloads cached for this entity.
    async fn ensure_tools(&self) -> Result<()> {
        let entity = self.entity.read().unwrap().clone();
        if !self.cache.tools.needs_refresh(entity.id) {
            return Ok(());
        }
        match self
            .actions
            .rest()
            .list_entity_runner_application_downloads()
            .await
        {
            Ok(tools) => {
                self.cache.tools.set_tools(&entity, tools);
                Ok(())
            }
            Err(e) => {
                self.cache.tools.set_tools_error(&entity, e.to_string());
                Err(e)
            }
        }
    }

    /// One reconcile pass: converge the inventory to the desired count.
    async fn reconcile(&self) -> Result<()> {
        let snapshot = self.scale_set.read().unwrap().clone();

        self.process_errored(&snapshot).await?;
        self.process_deletions(&snapshot).await?;

        let instances = self.store.list_scale_set_instances(snapshot.id).await?;
        let active: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.provider_status.counts_as_active())
            .collect();
        let desired = if snapshot.enabled {
            snapshot.clamped_desired_count() as usize
        } else {
            0
        };

        if active.len() < desired {
            self.scale_up(&snapshot, desired - active.len()).await?;
        } else if active.len() > desired {
            self.scale_down(&snapshot, active.len() - desired, &active)
                .await?;
        }
        Ok(())
    }

    /// Retry or escalate instances whose provider boot failed.
    async fn process_errored(&self, snapshot: &ScaleSet) -> Result<()> {
        let instances = self.store.list_scale_set_instances(snapshot.id).await?;
        let now = Utc::now();
        for instance in instances
            .iter()
            .filter(|i| i.provider_status == ProviderStatus::Error)
        {
            if instance.create_attempt >= MAX_CREATE_ATTEMPTS {
                tracing::error!(
                    instance = %instance.name,
                    attempts = instance.create_attempt,
                    "giving up on instance after repeated boot failures"
                );
                self.store
                    .update_instance(
                        &instance.name,
                        InstanceUpdate {
                            provider_status: Some(ProviderStatus::PendingDelete),
                            status_message: Some("exceeded boot attempts".to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                continue;
            }
            if now - instance.updated_at < ChronoDuration::seconds(CREATE_RETRY_COOLDOWN_SECS) {
                continue;
            }
            let refreshed = self
                .store
                .update_instance(
                    &instance.name,
                    InstanceUpdate {
                        provider_status: Some(ProviderStatus::PendingCreate),
                        status_message: Some("retrying provider boot".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            self.boot_instance(snapshot, &refreshed).await?;
        }
        Ok(())
    }

    /// Tear down instances marked for deletion.
    ///
    /// Forge-side removal and provider teardown are best-effort; a failed
    /// step leaves the row pending_delete for the next tick.
    async fn process_deletions(&self, snapshot: &ScaleSet) -> Result<()> {
        let instances = self.store.list_scale_set_instances(snapshot.id).await?;
        for instance in instances
            .iter()
            .filter(|i| i.provider_status == ProviderStatus::PendingDelete)
        {
            if instance.agent_id != 0 {
                match self.actions.remove_runner(instance.agent_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!(
                            instance = %instance.name,
                            error = %e,
                            "failed to remove forge runner, will retry"
                        );
                        continue;
                    }
                }
            }
            self.store
                .update_instance(
                    &instance.name,
                    InstanceUpdate {
                        provider_status: Some(ProviderStatus::Deleting),
                        ..Default::default()
                    },
                )
                .await?;
            if let Some(provider_id) = &instance.provider_id {
                if let Err(e) = self.provider.delete_instance(provider_id).await {
                    tracing::warn!(
                        instance = %instance.name,
                        error = %e,
                        "provider teardown failed, will retry"
                    );
                    self.store
                        .update_instance(
                            &instance.name,
                            InstanceUpdate {
                                provider_status: Some(ProviderStatus::PendingDelete),
                                ..Default::default()
                            },
                        )
                        .await?;
                    continue;
                }
            }
            self.store.delete_instance(&instance.name).await?;
            self.cache.instances.delete_instance(&instance.name);
            tracing::info!(instance = %instance.name, "instance torn down");
        }
        Ok(())
    }

    /// Boot `count` new instances.
    async fn scale_up(&self, snapshot: &ScaleSet, count: usize) -> Result<()> {
        for _ in 0..count {
            let name = format!("{}-{}", snapshot.runner_prefix, random_hex(8));
            let jit = self
                .actions
                .generate_jit_runner_config(&name, snapshot.scale_set_id)
                .await?;
            let now = Utc::now();
            let instance = Instance {
                name: name.clone(),
                provider_id: None,
                agent_id: jit.runner.id,
                os_type: snapshot.os_type,
                os_name: String::new(),
                os_version: String::new(),
                os_arch: snapshot.os_arch,
                addresses: Vec::new(),
                provider_status: ProviderStatus::PendingCreate,
                runner_status: RunnerStatus::Pending,
                pool_id: None,
                scale_set_id: Some(snapshot.id),
                provider_fault: None,
                jit_configuration: Some(jit.encoded_jit_config.clone()),
                status_messages: Vec::new(),
                create_attempt: 0,
                created_at: now,
                updated_at: now,
            };
            let instance = self.store.create_instance(instance).await?;
            self.cache.instances.set_instance(instance.clone());
            self.boot_instance(snapshot, &instance).await?;
        }
        Ok(())
    }

    /// Ask the provider for one VM; record the outcome on the row.
    async fn boot_instance(&self, snapshot: &ScaleSet, instance: &Instance) -> Result<()> {
        let entity = self.entity.read().unwrap().clone();
        let tools = self.cache.tools.get_tools(entity.id)?;
        let download = download_for(&tools, snapshot.os_type, snapshot.os_arch)
            .cloned()
            .ok_or_else(|| {
                BellowsError::Terminal(format!(
                    "no runner download for {}/{}",
                    snapshot.os_type.as_str(),
                    snapshot.os_arch.as_str()
                ))
            })?;

        let bootstrap = BootstrapInstance {
            name: instance.name.clone(),
            os_type: snapshot.os_type,
            os_arch: snapshot.os_arch,
            image: snapshot.image.clone(),
            flavor: snapshot.flavor.clone(),
            extra_specs: snapshot.extra_specs.clone(),
            ca_cert_bundle: entity.credentials.endpoint.ca_cert_bundle.clone(),
            labels: vec![
                controller_label(self.config.controller.id),
                scale_set_label(snapshot.id),
            ],
            runner_group: snapshot.runner_group.clone(),
            callback_url: self.config.controller.callback_url.clone(),
            metadata_url: self.config.controller.metadata_url.clone(),
            instance_token: random_hex(32),
            jit_config: instance.jit_configuration.clone(),
            registration_token: None,
            tools: vec![download],
        };

        self.store
            .update_instance(
                &instance.name,
                InstanceUpdate {
                    provider_status: Some(ProviderStatus::Creating),
                    ..Default::default()
                },
            )
            .await?;

        match self.provider.create_instance(&bootstrap).await {
            Ok(created) => {
                let updated = self
                    .store
                    .update_instance(
                        &instance.name,
                        InstanceUpdate {
                            provider_id: Some(created.provider_id),
                            provider_status: Some(created.status),
                            os_name: Some(created.os_name),
                            os_version: Some(created.os_version),
                            addresses: Some(created.addresses),
                            status_message: Some("instance created by provider".to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.cache.instances.set_instance(updated);
                Ok(())
            }
            Err(e) => {
                let updated = self
                    .store
                    .update_instance(
                        &instance.name,
                        InstanceUpdate {
                            provider_status: Some(ProviderStatus::Error),
                            provider_fault: Some(e.to_string()),
                            create_attempt: Some(instance.create_attempt + 1),
                            status_message: Some("provider boot failed".to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.cache.instances.set_instance(updated);
                tracing::warn!(instance = %instance.name, error = %e, "provider boot failed");
                Ok(())
            }
        }
    }

    /// Tear down `count` surplus runners, longest idle first.
    ///
    /// Only idle runners are eligible; busy runners finish their job and
    /// leave through the completion path.
    async fn scale_down(
        &self,
        _snapshot: &ScaleSet,
        count: usize,
        active: &[&Instance],
    ) -> Result<()> {
        let mut idle: Vec<&&Instance> = active
            .iter()
            .filter(|i| i.runner_status == RunnerStatus::Idle)
            .collect();
        idle.sort_by_key(|i| i.updated_at);

        for instance in idle.into_iter().take(count) {
            self.store
                .update_instance(
                    &instance.name,
                    InstanceUpdate {
                        provider_status: Some(ProviderStatus::PendingDelete),
                        status_message: Some("scaling down".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::info!(instance = %instance.name, "marked surplus runner for deletion");
        }
        Ok(())
    }

    /// Reconcile forge-visible runners against database-visible instances.
    ///
    /// Called by the coordinator with the runners the forge reports for this
    /// scale set.
    pub async fn consolidate_runner_state(&self, refs: &[RunnerReference]) -> Result<()> {
        let snapshot = self.scale_set.read().unwrap().clone();
        let instances = self.store.list_scale_set_instances(snapshot.id).await?;
        let ours = controller_label(self.config.controller.id);

        let db_names: HashSet<&str> = instances.iter().map(|i| i.name.as_str()).collect();
        let forge_names: HashSet<&str> = refs.iter().map(|r| r.name.as_str()).collect();

        for runner in refs.iter().filter(|r| !db_names.contains(r.name.as_str())) {
            if !runner.has_label(&ours) {
                continue;
            }
            match self.actions.remove_runner(runner.id).await {
                Ok(()) => {
                    tracing::info!(runner = %runner.name, "removed orphaned forge runner")
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(runner = %runner.name, error = %e, "failed to remove orphaned runner");
                }
            }
        }

        let timeout = ChronoDuration::minutes(snapshot.runner_bootstrap_timeout_minutes as i64);
        let now = Utc::now();
        for instance in instances
            .iter()
            .filter(|i| !forge_names.contains(i.name.as_str()))
        {
            if !instance.provider_status.counts_as_active() {
                continue;
            }
            if now - instance.created_at < timeout {
                continue;
            }
            self.store
                .update_instance(
                    &instance.name,
                    InstanceUpdate {
                        provider_status: Some(ProviderStatus::PendingDelete),
                        status_message: Some("runner never registered with the forge".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::info!(instance = %instance.name, "reaping unregistered instance");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeForge;
    use bellows_core::actions::Label;
    use bellows_core::forge::{EntityKind, EntityScope};
    use bellows_core::store::NewScaleSet;
    use bellows_core::testing::{sample_instance, MemStore, RecordingProvider};
    use std::time::Duration;

    struct Harness {
        forge: FakeForge,
        store: Arc<MemStore>,
        provider: RecordingProvider,
        worker: Arc<ScaleSetWorker>,
        scale_set_db_id: i64,
    }

    async fn harness(min_runners: u32, forge_id_preset: Option<i64>) -> Harness {
        let forge = FakeForge::start().await;
        let entity = forge.entity(EntityKind::Organization);
        let store = Arc::new(MemStore::new());
        store.create_entity(entity.clone()).await.unwrap();
        let mut row = store
            .create_scale_set(NewScaleSet {
                name: "scale-set".to_string(),
                scope: EntityScope::for_entity(&entity),
                provider_name: "test-provider".to_string(),
                min_runners,
                max_runners: 5,
                image: "ubuntu:24.04".to_string(),
                flavor: "default".to_string(),
                os_type: bellows_core::os::OsType::Linux,
                os_arch: bellows_core::os::OsArch::Amd64,
                runner_group: "Default".to_string(),
                enabled: true,
                runner_bootstrap_timeout_minutes: 20,
                runner_prefix: "bellows".to_string(),
                extra_specs: serde_json::Value::Null,
            })
            .await
            .unwrap();
        if let Some(forge_id) = forge_id_preset {
            row = store.set_scale_set_forge_id(row.id, forge_id).await.unwrap();
        }

        let provider = RecordingProvider::new();
        let mut providers = ProviderRegistry::new();
        providers.register("test-provider", Arc::new(provider.clone()));

        let cache = Cache::new();
        let rest = Arc::new(crate::rest::ForgeRestClient::new(
            entity.clone(),
            crate::metrics::CallMetrics::new(),
            cache.runner_groups.clone(),
        ));
        let actions = ActionsClient::new(rest);

        let scale_set_db_id = row.id;
        let worker = ScaleSetWorker::new(
            entity.clone(),
            row,
            store.clone() as Arc<dyn Store>,
            cache,
            &providers,
            actions,
            forge.config(),
        )
        .unwrap();

        Harness {
            forge,
            store,
            provider,
            worker,
            scale_set_db_id,
        }
    }

    async fn wait_until<F, Fut>(mut condition: F, timeout_ms: u64)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..(timeout_ms / 20) {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within {}ms", timeout_ms);
    }

    #[tokio::test]
    async fn test_missing_provider_is_terminal() {
        let forge = FakeForge::start().await;
        let entity = forge.entity(EntityKind::Organization);
        let store = Arc::new(MemStore::new());
        let row = store
            .create_scale_set(NewScaleSet {
                name: "scale-set".to_string(),
                scope: EntityScope::for_entity(&entity),
                provider_name: "nonexistent".to_string(),
                min_runners: 0,
                max_runners: 5,
                image: "ubuntu:24.04".to_string(),
                flavor: "default".to_string(),
                os_type: bellows_core::os::OsType::Linux,
                os_arch: bellows_core::os::OsArch::Amd64,
                runner_group: "Default".to_string(),
                enabled: true,
                runner_bootstrap_timeout_minutes: 20,
                runner_prefix: "bellows".to_string(),
                extra_specs: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let cache = Cache::new();
        let rest = Arc::new(crate::rest::ForgeRestClient::new(
            entity.clone(),
            crate::metrics::CallMetrics::new(),
            cache.runner_groups.clone(),
        ));
        let actions = ActionsClient::new(rest);
        let err = ScaleSetWorker::new(
            entity,
            row,
            store as Arc<dyn Store>,
            cache,
            &ProviderRegistry::new(),
            actions,
            forge.config(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BellowsError::Terminal(_)));
    }

    #[tokio::test]
    async fn test_startup_creates_forge_scale_set_once() {
        let h = harness(0, None).await;
        h.forge.mount_scale_set_create(42, 1).await;

        h.worker.start();
        let id = h.scale_set_db_id;
        wait_until(
            || {
                let store = h.store.clone();
                async move {
                    store
                        .get_scale_set(id)
                        .await
                        .map(|s| s.scale_set_id == 42)
                        .unwrap_or(false)
                }
            },
            5000,
        )
        .await;

        assert!(h.worker.status().is_running);
        assert!(h.worker.status().failure_reason.is_none());
        h.worker.stop().await;
        // The expect(1) on the create mount verifies the scale set was
        // created exactly once across ticks.
    }

    #[tokio::test]
    async fn test_scale_up_boots_desired_instances() {
        let h = harness(2, Some(42)).await;
        h.worker.start();

        wait_until(
            || {
                let provider = h.provider.clone();
                async move { provider.created().len() == 2 }
            },
            5000,
        )
        .await;
        h.worker.stop().await;

        let instances = h.store.list_scale_set_instances(h.scale_set_db_id).await.unwrap();
        assert_eq!(instances.len(), 2);
        for instance in &instances {
            assert!(instance.name.starts_with("bellows-"));
            assert_eq!(instance.provider_status, ProviderStatus::Running);
            assert!(instance.jit_configuration.is_some());
            assert_ne!(instance.agent_id, 0);
            assert!(instance.has_exactly_one_owner());
        }

        // The bootstrap carried labels, URLs, and the JIT blob.
        let calls = h.provider.calls();
        let bellows_core::testing::ProviderCall::Create(bootstrap) = &calls[0] else {
            panic!("expected a create call");
        };
        assert!(bootstrap
            .labels
            .contains(&scale_set_label(h.scale_set_db_id)));
        assert!(bootstrap.jit_config.is_some());
        assert_eq!(bootstrap.tools.len(), 1);
        assert_eq!(bootstrap.callback_url, "https://bellows.test/callbacks");
    }

    #[tokio::test]
    async fn test_scale_down_tears_down_longest_idle() {
        let h = harness(2, Some(42)).await;
        h.worker.start();
        wait_until(
            || {
                let provider = h.provider.clone();
                async move { provider.created().len() == 2 }
            },
            5000,
        )
        .await;

        // Runners registered and sat idle; the first one for longer.
        let instances = h.store.list_scale_set_instances(h.scale_set_db_id).await.unwrap();
        for instance in &instances {
            h.store
                .update_instance(
                    &instance.name,
                    InstanceUpdate {
                        runner_status: Some(RunnerStatus::Idle),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        let oldest_idle = instances[0].name.clone();

        // Shrink the floor to one runner.
        let mut snapshot = h.store.get_scale_set(h.scale_set_db_id).await.unwrap();
        snapshot.min_runners = 1;
        h.worker.scale_set_updated(snapshot);

        let id = h.scale_set_db_id;
        wait_until(
            || {
                let store = h.store.clone();
                async move {
                    store
                        .list_scale_set_instances(id)
                        .await
                        .map(|list| list.len() == 1)
                        .unwrap_or(false)
                }
            },
            5000,
        )
        .await;
        h.worker.stop().await;

        let remaining = h.store.list_scale_set_instances(h.scale_set_db_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].name, oldest_idle);
        assert_eq!(h.provider.deleted().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_records_fault_and_replaces() {
        let h = harness(1, Some(42)).await;
        h.provider.fail_next_creates(1);
        h.worker.start();

        let id = h.scale_set_db_id;
        wait_until(
            || {
                let store = h.store.clone();
                async move {
                    store
                        .list_scale_set_instances(id)
                        .await
                        .map(|list| {
                            list.iter()
                                .any(|i| i.provider_status == ProviderStatus::Running)
                        })
                        .unwrap_or(false)
                }
            },
            5000,
        )
        .await;
        h.worker.stop().await;

        let instances = h.store.list_scale_set_instances(h.scale_set_db_id).await.unwrap();
        let errored: Vec<_> = instances
            .iter()
            .filter(|i| i.provider_status == ProviderStatus::Error)
            .collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].create_attempt, 1);
        assert!(errored[0].provider_fault.as_deref().unwrap().contains("boot failed"));
    }

    #[tokio::test]
    async fn test_consolidation_removes_orphans_and_reaps_stuck() {
        let h = harness(0, Some(42)).await;
        let ours = controller_label(h.forge.config().controller.id);

        // A healthy instance known to both sides.
        h.store
            .create_instance(sample_instance("bellows-known", h.scale_set_db_id))
            .await
            .unwrap();
        // A stuck instance that never registered, well past its timeout.
        let mut stuck = sample_instance("bellows-stuck", h.scale_set_db_id);
        stuck.created_at = Utc::now() - ChronoDuration::minutes(45);
        h.store.create_instance(stuck).await.unwrap();

        let refs = vec![
            RunnerReference {
                id: 1,
                name: "bellows-known".to_string(),
                runner_scale_set_id: 42,
                status: None,
                labels: vec![Label::user(ours.clone())],
            },
            RunnerReference {
                id: 2,
                name: "bellows-orphan".to_string(),
                runner_scale_set_id: 42,
                status: None,
                labels: vec![Label::user(ours)],
            },
            RunnerReference {
                id: 3,
                name: "someone-elses".to_string(),
                runner_scale_set_id: 42,
                status: None,
                labels: Vec::new(),
            },
        ];

        h.worker.consolidate_runner_state(&refs).await.unwrap();

        // The known instance is untouched; the stuck one is marked for
        // deletion. Orphan removal went to the forge, not the database.
        let known = h.store.get_instance("bellows-known").await.unwrap();
        assert_eq!(known.provider_status, ProviderStatus::PendingCreate);
        let stuck = h.store.get_instance("bellows-stuck").await.unwrap();
        assert_eq!(stuck.provider_status, ProviderStatus::PendingDelete);
        assert_eq!(
            h.store.list_scale_set_instances(h.scale_set_db_id).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness(0, Some(42)).await;
        h.worker.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.worker.stop().await;
        h.worker.stop().await;
        assert!(!h.worker.status().is_running);
    }
}
