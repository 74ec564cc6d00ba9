use thiserror::Error;

/// Why an auth attempt failed — distinguishing permanent from transient is
/// what decides whether the connection machine gives up or retries
/// (spec.md §4.1, §6.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// HTTP 401/403 semantics: retrying will not help.
    Permanent(String),
    /// 5xx, network errors, or malformed responses: worth another try.
    Transient(String),
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::Permanent(reason) => write!(f, "permanent: {reason}"),
            AuthFailure::Transient(reason) => write!(f, "transient: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("authentication failed ({0})")]
    Auth(AuthFailure),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("throttle must be between {min} and {max} ms, got {value}")]
    InvalidThrottle { value: u64, min: u64, max: u64 },

    #[error("connection is not open")]
    NotOpen,

    #[error(transparent)]
    Storage(#[from] roomkit_storage::StorageError),

    #[error(transparent)]
    Protocol(#[from] roomkit_protocol::ProtocolError),

    #[error("{count} malformed frames/ops within the violation window, forcing reconnect")]
    TooManyViolations { count: usize },
}
