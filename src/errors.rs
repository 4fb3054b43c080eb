//! Watch Cache Error Hierarchy
//!
//! Errors are grouped by the layer that produced them: the in-memory cache,
//! the backing store it fronts, and configuration loading.
//!
//! Errors returned by the backing store on a bypassed request travel through
//! the cache unchanged, so callers can match on [`StorageError`] no matter
//! which path served them.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failures raised by the watch cache itself
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Failures reported by the backing store
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The requested resource version has already been evicted from the ring buffer
    #[error("Too old resource version: {requested} (oldest retained: {oldest})")]
    CacheIncomplete { requested: u64, oldest: u64 },

    /// An interval's position was overwritten while it was still being consumed
    #[error("Watch cache interval invalidated at index {start_index}")]
    IntervalInvalidated { start_index: u64 },

    /// The cache did not catch up to the requested resource version in time
    #[error("Too large resource version: {requested}, current: {current}")]
    TooLargeResourceVersion { requested: u64, current: u64 },

    /// The cache has not completed its initial list yet
    #[error("Watch cache is not ready")]
    NotReady,

    /// The cache has been stopped and rejects every request
    #[error("Watch cache is stopped")]
    Stopped,

    /// Caller gave up before the cache became ready
    #[error("Watch cache initialization was canceled by the caller")]
    InitializationTimeout,

    /// Caller canceled a blocking wait
    #[error("Request canceled")]
    Cancelled,

    #[error("Invalid resource version: {0:?}")]
    InvalidResourceVersion(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// A watcher could not keep up within the shared dispatch budget and was dropped.
    /// Only used for logging; never returned to the writer.
    #[error("Watcher {watcher_id} overrun its buffer and was terminated")]
    WatcherOverrun { watcher_id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Key already exists: {key}")]
    AlreadyExists { key: String },

    /// Backing store cannot serve the request right now
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The requested version has been compacted away by the backing store
    #[error("Too old resource version: {requested} (compacted: {compacted})")]
    TooOldResourceVersion { requested: u64, compacted: u64 },

    #[error("Storage internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by the caller abandoning the request.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Cache(CacheError::InitializationTimeout) | Error::Cache(CacheError::Cancelled)
        )
    }

    /// True for the "try again later" class of errors.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Cache(CacheError::NotReady)
                | Error::Cache(CacheError::Stopped)
                | Error::Storage(StorageError::Unavailable(_))
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Storage(StorageError::NotFound { .. }))
    }
}
