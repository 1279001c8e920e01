//! Cache configuration

use std::time::Duration;

/// Configuration for the paginated collection cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of pages kept across all resource kinds
    pub max_capacity: u64,
    /// Time-to-live for every stored page
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            ttl: Duration::from_secs(60), // 1 minute
        }
    }
}
