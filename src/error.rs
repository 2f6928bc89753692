use thiserror::Error;

/// Error taxonomy for the cache engine.
///
/// Errors surface to callers unchanged unless the operation contract says
/// otherwise (bulk store helpers swallow `Unsupported` while iterating
/// collections they do not own, the bundler un-bundles exactly once on a
/// failed burst).
#[derive(Error, Debug)]
pub enum CacheError {
    /// Read-only store or unimplemented operation.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Bounds violation: negative threshold, unknown policy name, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Illegal bundle state transition or an operation on a released cache.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Index invariant breach during maintenance. Logged with rate limiting,
    /// never aborts the mutation.
    #[error("index conflict: {0}")]
    Conflict(String),

    /// Lock-count overflow or an unrepairable accounting violation.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A backing store call failed; propagated as-is.
    #[error("backing store failure: {0}")]
    StoreFailure(String),

    /// A trigger rejected the pending change; the cache keeps its
    /// pre-mutation state.
    #[error("mutation rejected by trigger: {0}")]
    RejectedByTrigger(String),

    /// A blocking wait was interrupted.
    #[error("interrupted while waiting: {0}")]
    Interrupted(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// True for errors the bulk store helpers are allowed to swallow.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, CacheError::Unsupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        let err = CacheError::InvalidArgument("sizeThreshold must be positive".into());
        assert!(err.to_string().contains("sizeThreshold"));
    }

    #[test]
    fn test_is_unsupported() {
        assert!(CacheError::Unsupported("erase".into()).is_unsupported());
        assert!(!CacheError::Fatal("units".into()).is_unsupported());
    }
}
