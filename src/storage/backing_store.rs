//! Backing Store
//!
//! The durable key-value store the cache sits in front of. The cache only
//! ever reads from it:
//! - listing a prefix to seed or re-seed the ring buffer
//! - watching a prefix to keep the ring buffer current
//! - serving requests the cache decides to bypass
//!
//! Errors returned here are handed to callers of bypassed requests unchanged.

#[cfg(test)]
use mockall::automock;

use async_trait::async_trait;

use crate::GetOptions;
use crate::ListOptions;
use crate::Object;
use crate::ObjectList;
use crate::Result;
use crate::WatchStream;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Returns `Ok(None)` for a missing key only when `ignore_not_found` is set.
    async fn get(
        &self,
        key: &str,
        opts: &GetOptions,
    ) -> Result<Option<Object>>;

    async fn get_list(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<ObjectList>;

    /// Streams mutations with a resource version greater than `opts.resource_version`.
    async fn watch(
        &self,
        key: &str,
        opts: &ListOptions,
    ) -> Result<WatchStream>;

    /// Latest resource version committed by the store.
    async fn current_resource_version(&self) -> Result<u64>;
}
