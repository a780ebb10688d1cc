//! Read-through result types
//!
//! - [`CacheSource`]: where a value came from (used as a log field and metric label)
//! - [`CacheResult`]: a value together with its source

use std::fmt;

/// Indicates where a read-through value came from.
///
/// ```
/// # use raid_cache::CacheSource;
/// assert_eq!(CacheSource::PositiveCache.to_string(), "positive_cache");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Value was found in the cache; the compute function did not run
    PositiveCache,
    /// Cache miss - value computed and stored
    LoaderCacheMiss,
    /// Cache miss - value computed but rejected by the ignore predicate, not stored
    LoaderIgnored,
    /// No cache configured - value computed directly
    NoCache,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheSource::PositiveCache => write!(f, "positive_cache"),
            CacheSource::LoaderCacheMiss => write!(f, "loader_cache_miss"),
            CacheSource::LoaderIgnored => write!(f, "loader_ignored"),
            CacheSource::NoCache => write!(f, "no_cache"),
        }
    }
}

/// Result of a read-through call with source information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult<V> {
    pub value: V,
    pub source: CacheSource,
}

impl<V> CacheResult<V> {
    pub fn new(value: V, source: CacheSource) -> Self {
        Self { value, source }
    }

    /// Check if this was served from the cache
    pub fn was_cached(&self) -> bool {
        matches!(self.source, CacheSource::PositiveCache)
    }

    /// Check if the compute function was invoked
    pub fn invoked_loader(&self) -> bool {
        !self.was_cached()
    }

    pub fn into_value(self) -> V {
        self.value
    }
}
