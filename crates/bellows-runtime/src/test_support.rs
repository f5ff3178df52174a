//! Shared wiremock backend for in-crate tests: a fake forge exposing the
//! REST surface, the Actions service, and a message queue.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use bellows_core::config::BellowsConfig;
use bellows_core::forge::{EntityKind, ForgeEntity, ForgeKind};
use bellows_core::testing::{sample_credentials, sample_entity};

pub(crate) fn fake_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp).as_bytes());
    format!("{}.{}.sig", header, payload)
}

/// Serves JIT configs with unique runner IDs.
struct JitResponder {
    next_id: AtomicI64,
}

impl Respond for JitResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let name = body
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("runner")
            .to_string();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::json!({".runner": name}).to_string());
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "runner": {"id": id, "name": name},
            "encodedJitConfig": encoded,
        }))
    }
}

/// A fake forge backend with the common happy-path mounts in place.
pub(crate) struct FakeForge {
    pub server: MockServer,
}

impl FakeForge {
    pub async fn start() -> Self {
        let server = MockServer::start().await;

        let expires = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
        Mock::given(method("POST"))
            .and(path_regex(
                r"^/(orgs|enterprises)/[^/]+/actions/runners/registration-token$",
            ))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "REGTOKEN",
                "expires_at": expires,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(
                r"^/repos/[^/]+/[^/]+/actions/runners/registration-token$",
            ))
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

        // Runner application downloads.
        Mock::given(method("GET"))
            .and(path_regex(r"/actions/runners/downloads$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "os": "linux",
                    "architecture": "x64",
                    "download_url": format!("{}/dl/runner-linux-x64.tar.gz", server.uri()),
                    "filename": "runner-linux-x64.tar.gz",
                },
            ])))
            .mount(&server)
            .await;

        // Message sessions on any scale set.
        let queue_token = fake_jwt((Utc::now() + ChronoDuration::hours(1)).timestamp());
        Mock::given(method("POST"))
            .and(path_regex(
                r"^/pipeline/_apis/runtime/runnerscalesets/\d+/sessions$",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sessionId": uuid::Uuid::new_v4(),
                "ownerName": "bellows",
                "messageQueueUrl": format!("{}/queue", server.uri()),
                "messageQueueAccessToken": queue_token,
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(
                r"^/pipeline/_apis/runtime/runnerscalesets/\d+/sessions/[0-9a-f-]+$",
            ))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        // Scale set reads for workers whose forge ID is already recorded.
        Mock::given(method("GET"))
            .and(path_regex(r"^/pipeline/_apis/runtime/runnerscalesets/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 42,
                "name": "scale-set",
                "runnerGroupId": 1,
                "runnerGroupName": "Default",
            })))
            .mount(&server)
            .await;

        // Actions-service runner inventory, empty by default.
        Mock::given(method("GET"))
            .and(path("/pipeline/_apis/runtime/runners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 0,
                "value": [],
            })))
            .mount(&server)
            .await;

        // JIT configs with unique runner IDs.
        Mock::given(method("POST"))
            .and(path_regex(
                r"^/pipeline/_apis/runtime/runnerscalesets/\d+/generatejitconfig$",
            ))
            .respond_with(JitResponder {
                next_id: AtomicI64::new(1000),
            })
            .mount(&server)
            .await;

        // Forge-side runner removal.
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/pipeline/_apis/runtime/runners/\d+$"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        // Quiet queue: long-polls time out with no content. The delay keeps
        // the listener from spinning against the mock.
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(
                ResponseTemplate::new(202).set_delay(std::time::Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        Self { server }
    }

    /// Mount the scale set creation endpoint, answering with `forge_id`.
    pub async fn mount_scale_set_create(&self, forge_id: i64, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/pipeline/_apis/runtime/runnerscalesets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": forge_id,
                "name": "scale-set",
                "runnerGroupId": 1,
            })))
            .expect(expected_calls)
            .mount(&self.server)
            .await;
    }

    /// An entity whose endpoint points at this fake forge.
    pub fn entity(&self, kind: EntityKind) -> ForgeEntity {
        let mut creds = sample_credentials(1, ForgeKind::Github);
        creds.endpoint.api_base_url = self.server.uri();
        creds.endpoint.base_url = self.server.uri();
        sample_entity(kind, creds)
    }

    /// A controller config with short intervals for tests.
    pub fn config(&self) -> Arc<BellowsConfig> {
        Arc::new(
            BellowsConfig::parse_toml(
                r#"
                [controller]
                id = "3f2c64a1-8fb4-4d9e-9f70-6c2c2f5b3a10"
                callback_url = "https://bellows.test/callbacks"
                metadata_url = "https://bellows.test/metadata"

                [database]
                url = "postgres://unused/test"

                [intervals]
                reconcile_secs = 1
                consolidation_secs = 1
                "#,
            )
            .unwrap(),
        )
    }
}
