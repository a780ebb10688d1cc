//! Read-through caching with pattern-based invalidation for raid scheduling data.
//!
//! - [`keys`]: the cache key namespace
//! - [`store`]: the [`Cache`] capability with an in-process and a Redis backend
//! - [`with_cache`] / [`write_with_invalidation`]: read-through and
//!   write-then-invalidate helpers, both working with no cache at all
//! - [`invalidation`]: which keys go stale when an entity changes
//! - [`events`]: change events across processes, and a handler that turns
//!   them into local invalidation

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod invalidation;
pub mod keys;
pub mod metrics;
pub mod read_through;
pub mod store;
pub mod types;
pub mod write_through;

pub use error::{CacheError, Result};
pub use invalidation::{CacheInvalidation, EntityAttributes, EntityKind, InvalidationTarget};
pub use read_through::{with_cache, with_cache_result, ReadThroughOptions};
pub use store::{Cache, CacheExt, MemoizeOptions, MemoryCache, RedisCache};
pub use types::{CacheResult, CacheSource};
pub use write_through::write_with_invalidation;
