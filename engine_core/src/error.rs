use thiserror::Error;

/// Failures reported by the synthesis engine or its runtime.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Engine not reachable: connection refused, timeout, not started yet.
    #[error("engine unavailable at {endpoint}: {reason}")]
    Unavailable { endpoint: String, reason: String },

    /// The engine answered with a client error for this input.
    #[error("engine rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The engine answered but the payload was not usable.
    #[error("malformed engine response: {0}")]
    Malformed(String),

    /// Spawning or stopping a managed engine process failed.
    #[error("engine runtime error: {0}")]
    Runtime(String),
}

impl EngineError {
    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Unavailable { .. } | EngineError::Malformed(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
