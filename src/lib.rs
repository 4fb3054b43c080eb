//! An in-memory, versioned watch cache that fronts a durable key-value
//! store.
//!
//! A [`Cacher`] keeps a bounded history of recent changes under one key
//! prefix, answers reads from memory once it has synchronised with the
//! backing [`Storage`], and fans live changes out to many concurrent
//! watchers. Requests the cache cannot answer correctly are forwarded to
//! the backing store unchanged.
mod cacher;
mod config;
mod constants;
mod errors;
mod metrics;
mod storage;
mod types;
mod utils;

pub use cacher::*;
pub use config::*;
pub use constants::FIELD_METADATA_NAME;
pub use constants::FIELD_METADATA_NAMESPACE;
pub use constants::INITIAL_EVENTS_END_ANNOTATION;
pub use errors::*;
pub use metrics::gather_metrics;
pub use metrics::register_custom_metrics;
pub use storage::*;
pub use types::*;
pub(crate) use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
mod test_utils;
