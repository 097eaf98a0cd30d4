use serde::Serialize;
use std::fmt;

/// Engine error kinds for error handling and user feedback.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "message")]
pub enum EngineError {
    /// Timeout or connection failure talking to the reminder service
    Network(String),
    /// Entity already gone server-side
    NotFound(String),
    /// Duplicate taken-event inside the dedup window (local or server 409)
    Conflict(String),
    /// Authentication rejected; likely needs a fresh token
    Unauthorized(String),
    /// Server-side failure (5xx)
    Server(String),
    /// Rejected locally before any network call
    Validation(String),
    /// Offline cache read/write failure
    Storage(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Network(msg) => write!(f, "Network error: {}", msg),
            EngineError::NotFound(msg) => write!(f, "Not found: {}", msg),
            EngineError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            EngineError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            EngineError::Server(msg) => write!(f, "Server error: {}", msg),
            EngineError::Validation(msg) => write!(f, "Validation error: {}", msg),
            EngineError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

// Conversion to String for UI-facing return types
impl From<EngineError> for String {
    fn from(error: EngineError) -> Self {
        error.to_string()
    }
}

// Convenience constructors
impl EngineError {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        EngineError::Network(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        EngineError::Conflict(msg.into())
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        EngineError::Unauthorized(msg.into())
    }

    pub fn server<S: Into<String>>(msg: S) -> Self {
        EngineError::Server(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        EngineError::Storage(msg.into())
    }

    /// Transient conditions: absorbed locally, retried later, no user-facing alarm.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Network(_))
    }

    /// The mutation already landed server-side; accept local state and resync.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
