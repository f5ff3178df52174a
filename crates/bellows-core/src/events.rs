//! Typed change events published by the store layer.
//!
//! Consumers subscribe through the watcher bus with a filter predicate;
//! the payload is always the post-commit snapshot of the row.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::forge::{ForgeCredentials, ForgeEndpoint, ForgeEntity};
use crate::instance::Instance;
use crate::job::Job;
use crate::pool::Pool;
use crate::scaleset::ScaleSet;

/// What kind of row changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Endpoint,
    Credentials,
    Entity,
    Pool,
    ScaleSet,
    Instance,
    Job,
}

/// What happened to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// Post-commit snapshot carried by a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EventPayload {
    Endpoint(ForgeEndpoint),
    Credentials(ForgeCredentials),
    Entity(ForgeEntity),
    Pool(Pool),
    ScaleSet(ScaleSet),
    Instance(Instance),
    Job(Job),
}

/// One change event on the watcher bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_type: EventType,
    pub operation: OperationType,
    pub payload: EventPayload,
}

impl ChangeEvent {
    pub fn new(operation: OperationType, payload: EventPayload) -> Self {
        let entity_type = match &payload {
            EventPayload::Endpoint(_) => EventType::Endpoint,
            EventPayload::Credentials(_) => EventType::Credentials,
            EventPayload::Entity(_) => EventType::Entity,
            EventPayload::Pool(_) => EventType::Pool,
            EventPayload::ScaleSet(_) => EventType::ScaleSet,
            EventPayload::Instance(_) => EventType::Instance,
            EventPayload::Job(_) => EventType::Job,
        };
        Self {
            entity_type,
            operation,
            payload,
        }
    }
}

/// Predicate deciding whether a consumer receives an event.
pub type EventFilter = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// Accept every event.
pub fn with_everything() -> EventFilter {
    Arc::new(|_| true)
}

/// Accept events whose payload is about the given entity: the entity's own
/// row, or pools and scale sets scoped to it.
pub fn with_entity_filter(entity_id: Uuid) -> EventFilter {
    Arc::new(move |event| match &event.payload {
        EventPayload::Entity(e) => e.id == entity_id,
        EventPayload::Pool(p) => p.scope.entity_id() == entity_id,
        EventPayload::ScaleSet(s) => s.scope.entity_id() == entity_id,
        _ => false,
    })
}

/// Accept scale set events scoped to the given entity.
pub fn with_entity_scale_set_filter(entity_id: Uuid) -> EventFilter {
    Arc::new(move |event| match &event.payload {
        EventPayload::ScaleSet(s) => s.scope.entity_id() == entity_id,
        _ => false,
    })
}

/// Accept credentials events for the given credentials ID.
pub fn with_credentials_filter(credentials_id: i64) -> EventFilter {
    Arc::new(move |event| match &event.payload {
        EventPayload::Credentials(c) => c.id == credentials_id,
        _ => false,
    })
}

/// Accept events with the given operation.
pub fn with_operation_filter(operation: OperationType) -> EventFilter {
    Arc::new(move |event| event.operation == operation)
}

/// Accept events with the given entity type.
pub fn with_entity_type_filter(entity_type: EventType) -> EventFilter {
    Arc::new(move |event| event.entity_type == entity_type)
}

/// Accept events passing at least one of the given filters.
pub fn with_any(filters: Vec<EventFilter>) -> EventFilter {
    Arc::new(move |event| filters.iter().any(|f| f(event)))
}

/// Accept events passing all of the given filters.
pub fn with_all(filters: Vec<EventFilter>) -> EventFilter {
    Arc::new(move |event| filters.iter().all(|f| f(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::{AuthKind, EntityKind, EntityScope, ForgeKind};
    use crate::os::{OsArch, OsType};
    use chrono::Utc;

    fn entity(id: Uuid) -> ForgeEntity {
        ForgeEntity {
            id,
            kind: EntityKind::Organization,
            owner: "acme".to_string(),
            name: String::new(),
            credentials: credentials(5),
            webhook_secret: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn credentials(id: i64) -> ForgeCredentials {
        ForgeCredentials {
            id,
            name: "default".to_string(),
            description: String::new(),
            endpoint: ForgeEndpoint {
                name: "github.com".to_string(),
                description: String::new(),
                kind: ForgeKind::Github,
                base_url: "https://github.com".to_string(),
                api_base_url: "https://api.github.com".to_string(),
                upload_base_url: None,
                ca_cert_bundle: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            auth_kind: AuthKind::Pat,
            secret: "ghp_test".to_string(),
            rate_limit: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn scale_set(entity_id: Uuid) -> ScaleSet {
        ScaleSet {
            id: 1,
            scale_set_id: 0,
            name: "default".to_string(),
            scope: EntityScope::Organization(entity_id),
            provider_name: "incus".to_string(),
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_entity_filter_matches_scoped_payloads() {
        let id = Uuid::new_v4();
        let filter = with_entity_filter(id);

        let event = ChangeEvent::new(OperationType::Update, EventPayload::Entity(entity(id)));
        assert!(filter(&event));

        let event = ChangeEvent::new(
            OperationType::Create,
            EventPayload::ScaleSet(scale_set(id)),
        );
        assert!(filter(&event));

        let event = ChangeEvent::new(
            OperationType::Create,
            EventPayload::ScaleSet(scale_set(Uuid::new_v4())),
        );
        assert!(!filter(&event));
    }

    #[test]
    fn test_combinators() {
        let id = Uuid::new_v4();
        let filter = with_all(vec![
            with_entity_scale_set_filter(id),
            with_operation_filter(OperationType::Delete),
        ]);

        let create = ChangeEvent::new(
            OperationType::Create,
            EventPayload::ScaleSet(scale_set(id)),
        );
        let delete = ChangeEvent::new(
            OperationType::Delete,
            EventPayload::ScaleSet(scale_set(id)),
        );
        assert!(!filter(&create));
        assert!(filter(&delete));

        let either = with_any(vec![
            with_operation_filter(OperationType::Create),
            with_operation_filter(OperationType::Delete),
        ]);
        assert!(either(&create));
        assert!(either(&delete));
    }

    #[test]
    fn test_credentials_filter() {
        let filter = with_credentials_filter(5);
        let event = ChangeEvent::new(
            OperationType::Update,
            EventPayload::Credentials(credentials(5)),
        );
        assert!(filter(&event));
        let event = ChangeEvent::new(
            OperationType::Update,
            EventPayload::Credentials(credentials(6)),
        );
        assert!(!filter(&event));
    }

    #[test]
    fn test_event_type_derived_from_payload() {
        let event = ChangeEvent::new(
            OperationType::Create,
            EventPayload::Credentials(credentials(1)),
        );
        assert_eq!(event.entity_type, EventType::Credentials);
    }
}
