//! Objects, events, selectors and request options shared by the cache and
//! its backing store.
mod event;
mod object;
mod options;
mod predicate;
mod resource_version;
mod watch_stream;

pub use event::*;
pub use object::*;
pub use options::*;
pub use predicate::*;
pub use resource_version::*;
pub use watch_stream::*;
