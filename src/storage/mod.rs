mod adaptors;
mod backing_store;

pub use adaptors::*;
pub use backing_store::*;
