use thiserror::Error;

/// Result type for cable operations.
pub type Result<T> = std::result::Result<T, CableError>;

/// Typed failures raised by the cable core.
///
/// Application hooks (channel handlers, protocol lifecycle hooks) return
/// `anyhow::Result` instead; these variants are what the core itself
/// produces and what those hooks usually wrap.
#[derive(Debug, Error)]
pub enum CableError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("message for '{0}' has no action")]
    MissingAction(String),

    #[error("no channel registered under '{0}'")]
    UnknownChannel(String),

    #[error("channel '{0}' is not subscribed")]
    NotSubscribed(String),

    #[error("protocol was already initialized")]
    AlreadyInitialized,

    #[error("scheduler is stopped")]
    SchedulerStopped,

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CableError {
    fn from(err: redis::RedisError) -> Self {
        CableError::Transport(err.to_string())
    }
}
