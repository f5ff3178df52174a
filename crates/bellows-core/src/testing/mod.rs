//! Test doubles for the reconciliation engine.
//!
//! Available in unit tests and behind the `testing` feature so downstream
//! crates can drive the engine without a database or a provider plug-in.

mod fixtures;
mod provider;
mod store;

pub use fixtures::{
    sample_credentials, sample_endpoint, sample_entity, sample_instance, sample_scale_set,
};
pub use provider::{ProviderCall, RecordingProvider};
pub use store::MemStore;
