//! Per-scale-set message listener.
//!
//! Owns one message session and drives the long-poll loop. The listener
//! runs on a private cancellation token decoupled from its worker, so a
//! dead listener can be restarted without tearing the worker down.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use bellows_core::actions::{JobMessageType, RunnerScaleSetMessage};
use bellows_core::error::Result;
use bellows_core::instance::{InstanceUpdate, ProviderStatus, RunnerStatus};
use bellows_core::job::{Job, JobStatus};
use bellows_core::scaleset::ScaleSet;
use bellows_core::store::Store;

use crate::actions::{ActionsClient, MessageSession};

/// Listener lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Long-poll listener for one scale set.
pub struct ScaleSetListener {
    client: Arc<ActionsClient>,
    store: Arc<dyn Store>,
    /// Shared with the worker; the worker pushes snapshot updates in.
    scale_set: Arc<RwLock<ScaleSet>>,
    /// Woken after every handled message so the worker reconciles promptly.
    wake: Arc<Notify>,
    state: Mutex<ListenerState>,
    cancel: Mutex<Option<CancellationToken>>,
    session: Mutex<Option<Arc<MessageSession>>>,
    loop_exited: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ScaleSetListener {
    pub fn new(
        client: Arc<ActionsClient>,
        store: Arc<dyn Store>,
        scale_set: Arc<RwLock<ScaleSet>>,
        wake: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            store,
            scale_set,
            wake,
            state: Mutex::new(ListenerState::Stopped),
            cancel: Mutex::new(None),
            session: Mutex::new(None),
            loop_exited: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ListenerState::Running | ListenerState::Starting)
    }

    /// The last session refresh failure, for status reporting.
    pub fn last_session_error(&self) -> Option<String> {
        let session = self.session.lock().unwrap();
        session.as_ref().and_then(|s| s.last_error())
    }

    /// Open a session and start the long-poll loop.
    ///
    /// The forge-side scale set must exist before this is called.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ListenerState::Stopped {
                return Ok(());
            }
            *state = ListenerState::Starting;
        }

        let (scale_set_id, name) = {
            let scale_set = self.scale_set.read().unwrap();
            (scale_set.scale_set_id, scale_set.name.clone())
        };
        let owner = format!("bellows-{}", name);
        let session = match MessageSession::open(self.client.clone(), scale_set_id, &owner).await {
            Ok(session) => session,
            Err(e) => {
                *self.state.lock().unwrap() = ListenerState::Stopped;
                return Err(e);
            }
        };
        *self.session.lock().unwrap() = Some(session);

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let (exited_tx, exited_rx) = oneshot::channel();
        *self.loop_exited.lock().unwrap() = Some(exited_rx);

        let listener = self.clone();
        tokio::spawn(async move {
            listener.run_loop(cancel).await;
            let _ = exited_tx.send(());
        });

        *self.state.lock().unwrap() = ListenerState::Running;
        tracing::info!(scale_set = %name, scale_set_id, "scale set listener started");
        Ok(())
    }

    /// Stop the loop and close the session. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ListenerState::Stopped | ListenerState::Stopping => return,
                _ => *state = ListenerState::Stopping,
            }
        }

        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let exited = self.loop_exited.lock().unwrap().take();
        if let Some(exited) = exited {
            let _ = exited.await;
        }
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            session.close().await;
        }
        *self.state.lock().unwrap() = ListenerState::Stopped;
        tracing::info!(
            scale_set_id = self.scale_set.read().unwrap().scale_set_id,
            "scale set listener stopped"
        );
    }

    fn current_session(&self) -> Option<Arc<MessageSession>> {
        self.session.lock().unwrap().clone()
    }

    async fn run_loop(self: &Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(session) = self.current_session() else { break };
            let (last_message_id, max_runners) = {
                let scale_set = self.scale_set.read().unwrap();
                (scale_set.last_message_id, scale_set.max_runners)
            };

            let poll = tokio::select! {
                _ = cancel.cancelled() => break,
                result = session.get_message(last_message_id, max_runners) => result,
            };

            let message = match poll {
                Ok(message) => message,
                Err(e) if e.is_unauthorized() => {
                    // The refresher races with a blocking long-poll; one
                    // retry picks up the new token.
                    if let Err(refresh_err) = session.refresh().await {
                        tracing::warn!(error = %refresh_err, "session refresh after 401 failed");
                        break;
                    }
                    match session.get_message(last_message_id, max_runners).await {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(error = %e, "long-poll failed after token refresh");
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "long-poll failed, exiting listener loop");
                    break;
                }
            };

            let Some(message) = message else { continue };
            if let Err(e) = self.handle_message(&session, message).await {
                tracing::warn!(error = %e, "failed to handle scale set message");
            }
        }

        // A natural exit (poll error) leaves state Running; flip it so the
        // worker knows to restart. An exit via stop() is already Stopping.
        let mut state = self.state.lock().unwrap();
        if *state == ListenerState::Running {
            *state = ListenerState::Stopped;
        }
    }

    /// Handle one message: acquire, record, persist the cursor, delete.
    async fn handle_message(
        &self,
        session: &Arc<MessageSession>,
        message: RunnerScaleSetMessage,
    ) -> Result<()> {
        let guard = session.lock().await;

        let (db_id, last_message_id, entity_id, desired) = {
            let scale_set = self.scale_set.read().unwrap();
            (
                scale_set.id,
                scale_set.last_message_id,
                scale_set.scope.entity_id(),
                scale_set.desired_runner_count,
            )
        };

        // Replay after a reconnect; already handled, no side effects.
        if message.message_id <= last_message_id {
            return Ok(());
        }

        let jobs = message.jobs()?;
        let available: Vec<i64> = jobs
            .iter()
            .filter(|j| j.message_type == JobMessageType::JobAvailable)
            .map(|j| j.runner_request_id)
            .collect();

        // Job acquisition goes over the network; drop the handling lock
        // around it and re-take it afterwards.
        drop(guard);
        if !available.is_empty() {
            let acquired = session.acquire_jobs(&available).await?;
            tracing::debug!(
                scale_set_id = db_id,
                requested = available.len(),
                acquired = acquired.len(),
                "acquired jobs"
            );
        }
        let _guard = session.lock().await;

        for job in &jobs {
            match job.message_type {
                JobMessageType::JobAvailable | JobMessageType::JobAssigned => {
                    self.record_job(entity_id, job, JobStatus::Assigned).await?;
                }
                JobMessageType::JobStarted => {
                    self.record_job(entity_id, job, JobStatus::InProgress).await?;
                    if let Some(runner_name) = &job.runner_name {
                        let update = InstanceUpdate {
                            runner_status: Some(RunnerStatus::Active),
                            status_message: Some(format!("job {} started", job.runner_request_id)),
                            ..Default::default()
                        };
                        match self.store.update_instance(runner_name, update).await {
                            Ok(_) => {}
                            // Another controller's runner; not ours to track.
                            Err(e) if e.is_not_found() => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
                JobMessageType::JobCompleted => {
                    self.record_job(entity_id, job, JobStatus::Completed).await?;
                    if let Some(runner_name) = &job.runner_name {
                        let update = InstanceUpdate {
                            provider_status: Some(ProviderStatus::PendingDelete),
                            runner_status: Some(RunnerStatus::Terminated),
                            status_message: Some(format!(
                                "job {} completed: {}",
                                job.runner_request_id,
                                job.result.as_deref().unwrap_or("unknown")
                            )),
                            ..Default::default()
                        };
                        match self.store.update_instance(runner_name, update).await {
                            Ok(_) => {}
                            Err(e) if e.is_not_found() => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        let desired = message
            .statistics
            .map(|s| s.total_assigned_jobs.max(0) as u32)
            .unwrap_or(desired);
        let updated = self
            .store
            .set_scale_set_message_cursor(db_id, message.message_id, desired)
            .await?;
        {
            let mut scale_set = self.scale_set.write().unwrap();
            scale_set.last_message_id = updated.last_message_id;
            scale_set.desired_runner_count = updated.desired_runner_count;
        }

        session.delete_message(message.message_id).await?;
        self.wake.notify_one();
        Ok(())
    }

    async fn record_job(
        &self,
        entity_id: uuid::Uuid,
        job: &bellows_core::actions::ScaleSetJobMessage,
        status: JobStatus,
    ) -> Result<()> {
        let now = Utc::now();
        self.store
            .record_job(Job {
                runner_request_id: job.runner_request_id,
                name: job.job_display_name.clone(),
                workflow_ref: job.job_workflow_ref.clone(),
                labels: job.requested_labels.clone(),
                runner_name: job.runner_name.clone(),
                entity_id,
                status,
                conclusion: job.result.clone(),
                created_at: now,
                updated_at: now,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionsClient;
    use crate::cache::RunnerGroupCache;
    use crate::metrics::CallMetrics;
    use crate::rest::ForgeRestClient;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use bellows_core::forge::{EntityKind, ForgeKind};
    use bellows_core::testing::{
        sample_credentials, sample_entity, sample_instance, MemStore,
    };
    use chrono::Duration as ChronoDuration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fake_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp).as_bytes());
        format!("{}.{}.sig", header, payload)
    }

    struct Harness {
        server: MockServer,
        store: Arc<MemStore>,
        listener: Arc<ScaleSetListener>,
        scale_set: Arc<RwLock<ScaleSet>>,
        entity_id: uuid::Uuid,
    }

    async fn harness() -> Harness {
        let server = MockServer::start().await;
        let expires = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
        Mock::given(method("POST"))
            .and(path("/orgs/acme/actions/runners/registration-token"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "REGTOKEN",
                "expires_at": expires,
            })))
            .mount(&server)
            .await;
        let admin_jwt = fake_jwt((Utc::now() + ChronoDuration::hours(1)).timestamp());
        let pipeline = format!("{}/pipeline", server.uri());
        Mock::given(method("POST"))
            .and(path("/actions/runner-registration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": pipeline,
                "token": admin_jwt,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/pipeline/_apis/runtime/runnerscalesets/42/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sessionId": "550e8400-e29b-41d4-a716-446655440000",
                "ownerName": "bellows",
                "messageQueueUrl": format!("{}/queue", server.uri()),
                "messageQueueAccessToken": fake_jwt((Utc::now() + ChronoDuration::hours(1)).timestamp()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(
                "/pipeline/_apis/runtime/runnerscalesets/42/sessions/550e8400-e29b-41d4-a716-446655440000",
            ))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let mut creds = sample_credentials(1, ForgeKind::Github);
        creds.endpoint.api_base_url = server.uri();
        creds.endpoint.base_url = server.uri();
        let entity = sample_entity(EntityKind::Organization, creds);

        let store = Arc::new(MemStore::new());
        store.create_entity(entity.clone()).await.unwrap();
        let row = store
            .create_scale_set(bellows_core::store::NewScaleSet {
                name: "default".to_string(),
                scope: bellows_core::forge::EntityScope::for_entity(&entity),
                provider_name: "test".to_string(),
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
        let row = store.set_scale_set_forge_id(row.id, 42).await.unwrap();

        let rest = Arc::new(ForgeRestClient::new(
            entity.clone(),
            CallMetrics::new(),
            Arc::new(RunnerGroupCache::new()),
        ));
        let client = ActionsClient::new(rest);
        let scale_set = Arc::new(RwLock::new(row));
        let listener = ScaleSetListener::new(
            client,
            store.clone() as Arc<dyn Store>,
            scale_set.clone(),
            Arc::new(Notify::new()),
        );

        Harness {
            server,
            store,
            listener,
            scale_set,
            entity_id: entity.id,
        }
    }

    fn job_message(
        message_id: i64,
        assigned: i64,
        body: serde_json::Value,
    ) -> serde_json::Value {
        serde_json::json!({
            "messageId": message_id,
            "messageType": "RunnerScaleSetJobMessages",
            "statistics": {"totalAssignedJobs": assigned},
            "body": body.to_string(),
        })
    }

    async fn drain_session(h: &Harness) {
        // After the message sequence, keep the long-poll quiet. The delay
        // stands in for the real queue's blocking behaviour.
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(
                ResponseTemplate::new(202).set_delay(std::time::Duration::from_millis(200)),
            )
            .mount(&h.server)
            .await;
    }

    #[tokio::test]
    async fn test_job_lifecycle_updates_instance_and_cursor() {
        let h = harness().await;
        h.store
            .create_instance(sample_instance("r1", h.scale_set.read().unwrap().id))
            .await
            .unwrap();

        // Three messages in sequence, then quiet.
        Mock::given(method("GET"))
            .and(path("/queue"))
            .and(query_param("lastMessageId", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_message(
                1,
                1,
                serde_json::json!([{
                    "messageType": "JobAvailable",
                    "runnerRequestId": 71,
                    "jobDisplayName": "build",
                }]),
            )))
            .mount(&h.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/pipeline/_apis/runtime/runnerscalesets/42/acquirejobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 1,
                "value": [71],
            })))
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .and(query_param("lastMessageId", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_message(
                2,
                1,
                serde_json::json!([{
                    "messageType": "JobStarted",
                    "runnerRequestId": 71,
                    "runnerName": "r1",
                }]),
            )))
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .and(query_param("lastMessageId", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_message(
                3,
                0,
                serde_json::json!([{
                    "messageType": "JobCompleted",
                    "runnerRequestId": 71,
                    "runnerName": "r1",
                    "result": "succeeded",
                }]),
            )))
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .and(query_param("lastMessageId", "3"))
            .respond_with(
                ResponseTemplate::new(202).set_delay(std::time::Duration::from_millis(200)),
            )
            .mount(&h.server)
            .await;
        for id in 1..=3 {
            Mock::given(method("DELETE"))
                .and(path(format!("/queue/{}", id)))
                .respond_with(ResponseTemplate::new(204))
                .mount(&h.server)
                .await;
        }
        drain_session(&h).await;

        h.listener.start().await.unwrap();

        // Wait until the cursor reaches message 3.
        for _ in 0..100 {
            if h.scale_set.read().unwrap().last_message_id >= 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        h.listener.stop().await;

        let scale_set = h
            .store
            .get_scale_set(h.scale_set.read().unwrap().id)
            .await
            .unwrap();
        assert_eq!(scale_set.last_message_id, 3);
        assert_eq!(scale_set.desired_runner_count, 0);

        let instance = h.store.get_instance("r1").await.unwrap();
        assert_eq!(instance.provider_status, ProviderStatus::PendingDelete);
        assert_eq!(instance.runner_status, RunnerStatus::Terminated);

        let jobs = h.store.list_entity_jobs(h.entity_id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_replayed_message_is_ignored() {
        let h = harness().await;
        {
            // Pretend message 5 was already handled.
            let id = h.scale_set.read().unwrap().id;
            let row = h.store.set_scale_set_message_cursor(id, 5, 1).await.unwrap();
            *h.scale_set.write().unwrap() = row;
        }

        // The queue replays message 5; it must not be acquired, recorded,
        // or deleted.
        Mock::given(method("GET"))
            .and(path("/queue"))
            .and(query_param("lastMessageId", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_message(
                5,
                9,
                serde_json::json!([{
                    "messageType": "JobAvailable",
                    "runnerRequestId": 99,
                }]),
            )))
            .up_to_n_times(1)
            .mount(&h.server)
            .await;
        drain_session(&h).await;

        h.listener.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        h.listener.stop().await;

        let scale_set = h
            .store
            .get_scale_set(h.scale_set.read().unwrap().id)
            .await
            .unwrap();
        assert_eq!(scale_set.last_message_id, 5);
        assert_eq!(scale_set.desired_runner_count, 1);
        assert!(h.store.list_entity_jobs(h.entity_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness().await;
        drain_session(&h).await;
        h.listener.start().await.unwrap();
        assert!(h.listener.is_running());
        h.listener.stop().await;
        h.listener.stop().await;
        assert_eq!(h.listener.state(), ListenerState::Stopped);
    }
}
