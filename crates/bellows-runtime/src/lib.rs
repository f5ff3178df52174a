//! Runtime for the bellows runner controller: the coordination cache, the
//! change watcher, the forge clients, and the reconciliation engine
//! (listener, scale set worker, entity controller, coordinator).

pub mod actions;
pub mod cache;
pub mod cache_sync;
pub mod controller;
pub mod coordinator;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod rest;
pub mod scaleset;
pub mod store;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;

pub use actions::{ActionsClient, MessageSession};
pub use cache::Cache;
pub use cache_sync::CacheSync;
pub use controller::EntityController;
pub use coordinator::Coordinator;
pub use listener::{ListenerState, ScaleSetListener};
pub use metrics::{CallMetrics, OperationMetric};
pub use rest::{ForgeHook, ForgeRestClient, ForgeRunner};
pub use scaleset::{ScaleSetWorker, WorkerStatus};
pub use store::{connect, PgStore};
pub use watcher::{Bus, Consumer, WatchedStore};
