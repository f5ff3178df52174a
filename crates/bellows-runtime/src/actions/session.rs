use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bellows_core::actions::{RunnerScaleSetMessage, RunnerScaleSetSession};
use bellows_core::error::Result;

use super::ActionsClient;

/// Sessions refresh when the queue token is within this window of expiry.
const REFRESH_WINDOW_SECS: i64 = 600;

/// Random extra window so many scale sets do not refresh in lockstep.
const REFRESH_JITTER_SECS: i64 = 30;

/// How often the refresh task checks the token.
const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// One message session on one scale set.
///
/// Owns the queue access token and its refresh task. Message handling is
/// serialised by [`MessageSession::lock`]; the listener holds it while
/// processing a message so two messages cannot interleave.
pub struct MessageSession {
    client: Arc<ActionsClient>,
    scale_set_id: i64,
    session: RwLock<RunnerScaleSetSession>,
    handling: tokio::sync::Mutex<()>,
    last_error: RwLock<Option<String>>,
    cancel: CancellationToken,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MessageSession {
    /// Open a session on the scale set and start the refresh task.
    pub async fn open(
        client: Arc<ActionsClient>,
        scale_set_id: i64,
        owner: &str,
    ) -> Result<Arc<Self>> {
        let session = client.create_message_session(scale_set_id, owner).await?;
        tracing::info!(
            scale_set_id,
            session_id = %session.session_id,
            owner,
            "message session opened"
        );
        let session = Arc::new(Self {
            client,
            scale_set_id,
            session: RwLock::new(session),
            handling: tokio::sync::Mutex::new(()),
            last_error: RwLock::new(None),
            cancel: CancellationToken::new(),
            refresh_handle: Mutex::new(None),
        });
        session.spawn_refresh_task();
        Ok(session)
    }

    fn spawn_refresh_task(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let jitter = rand::thread_rng().gen_range(0..=REFRESH_JITTER_SECS);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(REFRESH_CHECK_INTERVAL) => {}
                }
                let Some(session) = weak.upgrade() else { break };
                if session.expires_within(REFRESH_WINDOW_SECS + jitter) {
                    if let Err(e) = session.refresh().await {
                        tracing::warn!(
                            scale_set_id = session.scale_set_id,
                            error = %e,
                            "message session refresh failed"
                        );
                    }
                }
            }
        });
        *self.refresh_handle.lock().unwrap() = Some(handle);
    }

    fn expires_within(&self, seconds: i64) -> bool {
        let session = self.session.read().unwrap();
        match session.expires_at() {
            Some(expires_at) => (expires_at - Utc::now()).num_seconds() <= seconds,
            // Tokens without a readable expiry are refreshed on 401 only.
            None => false,
        }
    }

    /// Serialise message handling. Held across decode and persistence,
    /// released around job acquisition.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.handling.lock().await
    }

    /// The last refresh failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().unwrap().clone()
    }

    fn queue_coords(&self) -> (String, String) {
        let session = self.session.read().unwrap();
        (
            session.message_queue_url.clone(),
            session.message_queue_access_token.clone(),
        )
    }

    /// Replace the session with a freshly refreshed one.
    pub async fn refresh(&self) -> Result<()> {
        let session_id = self.session.read().unwrap().session_id;
        match self
            .client
            .refresh_session(self.scale_set_id, session_id)
            .await
        {
            Ok(refreshed) => {
                *self.session.write().unwrap() = refreshed;
                *self.last_error.write().unwrap() = None;
                tracing::debug!(scale_set_id = self.scale_set_id, "message session refreshed");
                Ok(())
            }
            Err(e) => {
                *self.last_error.write().unwrap() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Long-poll the queue for the next message.
    pub async fn get_message(
        &self,
        last_message_id: i64,
        max_capacity: u32,
    ) -> Result<Option<RunnerScaleSetMessage>> {
        let (url, token) = self.queue_coords();
        self.client
            .get_message(&url, &token, last_message_id, max_capacity)
            .await
    }

    /// Acknowledge a processed message.
    pub async fn delete_message(&self, message_id: i64) -> Result<()> {
        let (url, token) = self.queue_coords();
        self.client.delete_message(&url, &token, message_id).await
    }

    /// Acquire jobs with the queue access token.
    pub async fn acquire_jobs(&self, request_ids: &[i64]) -> Result<Vec<i64>> {
        let (_, token) = self.queue_coords();
        self.client
            .acquire_jobs(self.scale_set_id, &token, request_ids)
            .await
    }

    /// Close the session: stop the refresh task and delete the session on
    /// the forge, best-effort. Idempotent.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let handle = self.refresh_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let session_id = self.session.read().unwrap().session_id;
        if let Err(e) = self
            .client
            .delete_message_session(self.scale_set_id, session_id)
            .await
        {
            tracing::warn!(
                scale_set_id = self.scale_set_id,
                error = %e,
                "failed to delete message session"
            );
        }
    }
}
