//! Application error model
//!
//! Defines the typed error hierarchy shared by every component. Variants map
//! directly to the error kinds named in the design: credential resolution,
//! upstream protocol failures, store unavailability, and transform
//! degradation all get distinct variants so callers can apply the right
//! propagation policy (swallow, surface, degrade) for each one.

use thiserror::Error;

/// Application error type
///
/// Each variant's doc comment names the component area it originates from.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Inbox id has no configured credentials (C1)
    #[error("not found: {0}")]
    NotFound(String),
    /// OAuth token past `token_expires_at` (C1)
    #[error("credential expired: {0}")]
    CredentialExpired(String),
    /// LOGIN/AUTH rejected by upstream; non-retryable within the request (C3/C4)
    #[error("upstream authentication failed: {0}")]
    UpstreamAuthFailed(String),
    /// Two rebuild attempts failed, or deadline exceeded (C3/C4); request-level retryable
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Tagged NO/BAD on an otherwise-legal command; handle is closed (C3/C4)
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),
    /// Session store unreachable; non-fatal, request proceeds without persistence (C2)
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
    /// Transform produced a best-effort result; non-fatal (C6)
    #[error("transform degraded: {0}")]
    TransformDegraded(String),
    /// A propagated deadline was exceeded; handle closed (C3/C4)
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// Unexpected failure, external crate error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Stable machine-readable kind
    ///
    /// Used for structured log fields and by the out-of-core HTTP adapter's
    /// status-code mapping; that mapping itself is adapter policy, not core.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::CredentialExpired(_) => "credential_expired",
            Self::UpstreamAuthFailed(_) => "upstream_auth_failed",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamProtocolError(_) => "upstream_protocol_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::TransformDegraded(_) => "transform_degraded",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Internal(_) => "internal",
        }
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;
