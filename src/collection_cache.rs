//! Paginated collection cache for list endpoints
//!
//! Each list endpoint caches one serialized page per `(kind, page, page_size)`.
//! Every page is tagged with its resource kind, so a committed mutation on a
//! kind drops all of its pages at once.
//!
//! ## Cache Keys
//!
//! - Entry key: `{kind}:{page}:{page_size}`, e.g. `singer:1:3`
//! - Tags: `SingerCache`, `RecordCache`, `SongCache`

use crate::{
    BoxError, CacheConfig, CacheError, CacheKey, MutationKind, Pagination, ResourceKind,
    TaggedCache,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A serialized page as returned to list endpoints
pub type Payload = Arc<String>;

/// Cache key for one page of one resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub kind: ResourceKind,
    pub pagination: Pagination,
}

impl PageKey {
    pub fn new(kind: ResourceKind, pagination: Pagination) -> Self {
        Self { kind, pagination }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.kind,
            self.pagination.page(),
            self.pagination.page_size()
        )
    }
}

impl CacheKey for PageKey {
    type Tag = ResourceKind;

    fn tag(&self) -> ResourceKind {
        self.kind
    }
}

/// Trait for fetching one page of a resource collection.
///
/// Implementations return rows in a stable order (insertion / primary key),
/// skipping `pagination.offset()` rows and returning at most
/// `pagination.limit()`.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    type Record: Serialize + Send + Sync;

    /// The resource kind this store serves
    fn kind(&self) -> ResourceKind;

    async fn fetch_page(&self, pagination: Pagination) -> Result<Vec<Self::Record>, BoxError>;
}

/// Turns a page of records into the payload sent to clients
pub trait PageSerializer: Send + Sync {
    fn serialize<R: Serialize>(&self, records: &[R]) -> Result<String, BoxError>;
}

/// JSON array serializer
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl PageSerializer for JsonSerializer {
    fn serialize<R: Serialize>(&self, records: &[R]) -> Result<String, BoxError> {
        Ok(serde_json::to_string(records)?)
    }
}

/// Cache of serialized list pages for every resource kind.
///
/// Cheap to clone; build one at startup and hand clones to every handler.
#[derive(Clone)]
pub struct PaginatedCollectionCache {
    inner: TaggedCache<PageKey, String>,
}

impl Default for PaginatedCollectionCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl PaginatedCollectionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: TaggedCache::new(config),
        }
    }

    /// Time-to-live applied to every stored page
    pub fn ttl(&self) -> Duration {
        self.inner.config().ttl
    }

    /// Get a serialized page, running `compute` only if no fresh page is stored.
    ///
    /// Concurrent callers for the same page share a single `compute`. A failed
    /// `compute` is returned as [`CacheError::Compute`] and nothing is stored.
    pub async fn get_page<F, Fut, E>(
        &self,
        kind: ResourceKind,
        pagination: Pagination,
        compute: F,
    ) -> Result<Payload, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Into<BoxError>,
    {
        let key = PageKey::new(kind, pagination);
        self.inner.get_with(&key, compute).await
    }

    /// Drop every cached page of `kind`, across all pages and page sizes.
    pub async fn invalidate(&self, kind: ResourceKind) {
        debug!("Invalidating tag {}", kind.tag());
        self.inner.invalidate(&kind).await;
    }

    /// Serve a list endpoint: fetch and serialize the page on a miss.
    pub async fn list<S, Z>(
        &self,
        store: &S,
        pagination: Pagination,
        serializer: &Z,
    ) -> Result<Payload, CacheError>
    where
        S: ResourceStore,
        Z: PageSerializer,
    {
        self.get_page(store.kind(), pagination, || async move {
            let records = store.fetch_page(pagination).await?;
            serializer.serialize(&records)
        })
        .await
    }

    /// Run a mutation's commit and invalidate the affected kinds once it succeeds.
    ///
    /// Nothing is invalidated when the commit fails. Deletes also invalidate the
    /// kinds the removal cascades into.
    pub async fn commit_then_invalidate<Fut, T, E>(
        &self,
        kind: ResourceKind,
        mutation: MutationKind,
        commit: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let committed = commit.await?;

        let affected = kind.affected_by(mutation);
        debug!("{mutation:?} on {kind} committed, invalidating {affected:?}");
        join_all(affected.into_iter().map(|k| self.invalidate(k))).await;

        Ok(committed)
    }
}
