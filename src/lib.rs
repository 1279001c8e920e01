//! catalog-cache - Paginated list cache for the catalog API
//!
//! This library fronts the singer, record and song list endpoints with an
//! in-memory cache of serialized pages:
//! - One entry per `(resource kind, page, page size)`, expiring after a TTL
//! - Pages tagged by resource kind and invalidated in bulk after mutations
//! - Single-flight computation, so concurrent misses run one fetch
//! - Lenient pagination input that falls back to page 1 / page size 3

pub mod collection_cache;
mod config;
mod error;
mod pagination;
mod resource;
mod tagged_cache;

pub use collection_cache::{
    JsonSerializer, PageKey, PageSerializer, PaginatedCollectionCache, Payload, ResourceStore,
};
pub use config::CacheConfig;
pub use error::{BoxError, CacheError};
pub use pagination::{DEFAULT_PAGE, DEFAULT_PAGE_SIZE, Pagination};
pub use resource::{MutationKind, ResourceKind, UnknownResourceKind};
pub use tagged_cache::{CacheKey, Cacheable, TaggedCache};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
