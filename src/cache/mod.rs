//! Named cache partitions for intercepted responses.
//!
//! Each worker version owns two partitions: a precache filled from a fixed
//! manifest at install time, and a runtime cache filled while serving
//! requests. Partitions of older versions are deleted at activation.

mod storage;
mod traits;

pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CachedResponse, Partition, ResponseSource, ServedResponse};
