use socorro_store::StoreError;
use socorro_types::RequestStatus;
use thiserror::Error;

/// Result type for lifecycle, message log and coordination operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors surfaced to callers of the coordination core.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("emergency request '{0}' not found")]
    NotFound(String),
    #[error("{operation} is not allowed for request '{request_id}' in status {status}")]
    InvalidTransition {
        request_id: String,
        status: RequestStatus,
        operation: &'static str,
    },
    #[error("request '{request_id}' changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        request_id: String,
        expected: RequestStatus,
        actual: RequestStatus,
    },
    #[error("record store unavailable after {attempts} attempt(s): {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl LifecycleError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Maps a store failure that survived `attempts` tries.
    pub(crate) fn from_store(error: StoreError, attempts: u32) -> Self {
        match error {
            StoreError::RequestNotFound(request_id) => Self::NotFound(request_id),
            source => Self::Unavailable { attempts, source },
        }
    }

    /// Stable machine-readable code used by transports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Conflict { .. } => "conflict",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}
