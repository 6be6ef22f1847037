// Typed, matchable error kinds for the synchronous API boundary (see
// spec §7 "Error Handling Design"). `crate::error::Error` remains the
// ambient catch-all used by obligation handlers and internal plumbing;
// `DomainError` exists specifically so API handlers can map a failure to
// an HTTP status and so the obligation dispatcher can decide whether a
// failure is retryable without string-matching a message.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient external failure: {0}")]
    TransientExternal(String),

    #[error("permanent external failure: {0}")]
    PermanentExternal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DomainError {
    /// Whether an obligation handler encountering this error should
    /// retry (vs. fail outright). Mirrors spec §7: only `TransientExternal`
    /// and `Internal` (which may be a transient bug trigger, but still
    /// bounded by `maxRetries`) are retried; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DomainError::TransientExternal(_) | DomainError::Internal(_))
    }

    /// The conventional HTTP status code for this error kind.
    pub fn http_status(&self) -> u16 {
        match self {
            DomainError::Validation(_) => 400,
            DomainError::NotFound(_) => 404,
            DomainError::Forbidden(_) => 403,
            DomainError::Conflict(_) => 409,
            DomainError::TransientExternal(_) => 503,
            DomainError::PermanentExternal(_) => 502,
            DomainError::Internal(_) => 500,
        }
    }

    /// A short machine-readable code, stable across releases, for the
    /// `{ok, error: {code, message}}` API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation",
            DomainError::NotFound(_) => "not_found",
            DomainError::Forbidden(_) => "forbidden",
            DomainError::Conflict(_) => "conflict",
            DomainError::TransientExternal(_) => "transient_external",
            DomainError::PermanentExternal(_) => "permanent_external",
            DomainError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(DomainError::TransientExternal("x".into()).is_retryable());
        assert!(DomainError::Internal("x".into()).is_retryable());
        assert!(!DomainError::Validation("x".into()).is_retryable());
        assert!(!DomainError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn status_codes() {
        assert_eq!(DomainError::NotFound("x".into()).http_status(), 404);
        assert_eq!(DomainError::Conflict("x".into()).http_status(), 409);
    }
}
