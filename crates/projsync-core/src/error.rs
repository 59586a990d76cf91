use projsync_events::FeedError;
use projsync_protocol::ErrorCode;

/// Failure taxonomy for the sync engine.
///
/// `AuthStale` is an internal trigger: the gateway answers it with a refresh
/// and it never reaches callers.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("credential is stale")]
    AuthStale,
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("session for `{0}` is closed")]
    Closed(String),
}

impl SyncError {
    /// Maps a mutation error code onto the taxonomy.
    pub fn from_code(code: ErrorCode, message: Option<String>) -> Self {
        let message = message.unwrap_or_else(|| code.as_str().to_string());
        match code {
            ErrorCode::Unauthenticated => SyncError::AuthStale,
            ErrorCode::Forbidden => SyncError::Forbidden(message),
            ErrorCode::Validation => SyncError::Validation(message),
            ErrorCode::NotFound => SyncError::NotFound(message),
            ErrorCode::Conflict => SyncError::Conflict(message),
            ErrorCode::Unavailable => SyncError::TransientNetwork(message),
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            SyncError::TransientNetwork(_) => "transient_network",
            SyncError::AuthStale => "auth_stale",
            SyncError::AuthFailure(_) => "auth_failure",
            SyncError::Forbidden(_) => "forbidden",
            SyncError::Validation(_) => "validation",
            SyncError::NotFound(_) => "not_found",
            SyncError::Conflict(_) => "conflict",
            SyncError::InvalidResponse(_) => "invalid_response",
            SyncError::Closed(_) => "closed",
        }
    }
}

impl From<FeedError> for SyncError {
    fn from(err: FeedError) -> Self {
        SyncError::TransientNetwork(err.to_string())
    }
}
