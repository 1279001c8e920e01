//! Cache error types

use std::sync::Arc;

/// Boxed error returned by compute closures and external collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
///
/// Cloneable so that a single outcome can be handed to every caller waiting
/// on the same in-flight computation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Compute error: {0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    pub(crate) fn compute(err: impl Into<BoxError>) -> Self {
        CacheError::Compute(Arc::from(err.into()))
    }
}
