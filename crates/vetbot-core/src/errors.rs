use crate::domain::{SessionId, Version};

/// Core error type for the vetting bot.
///
/// Adapter crates should map their specific errors into this type so the
/// engine can tell retryable failures (store) from dropped events
/// (not found, illegal transition).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("version conflict on {session}: expected {expected:?}, found {actual:?}")]
    Conflict {
        session: SessionId,
        expected: Option<Version>,
        actual: Option<Version>,
    },

    #[error("illegal transition for {session}: {event} in state {state}")]
    IllegalTransition {
        session: SessionId,
        state: String,
        event: String,
    },

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
}

impl Error {
    /// Errors that must leave the inbound delivery unacknowledged so the
    /// gateway redelivers it later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
