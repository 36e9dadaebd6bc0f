use std::path::{Path, PathBuf};

use engine_core::EngineError;
use thiserror::Error;

/// Errors surfaced by the synthesis pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot split chapter {chapter} into chunks: {reason}")]
    Chunking { chapter: String, reason: String },

    #[error(
        "synthesis engine is not reachable at {endpoint} ({reason}). \
         Start the engine or fix its URL, then run again; finished chunks are kept."
    )]
    EngineUnavailable { endpoint: String, reason: String },

    #[error("engine rejected the chunk: {0}")]
    EngineRejected(String),

    #[error("engine failed after retries: {0}")]
    EngineFailed(String),

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chapter {chapter} is incomplete: {missing} of {total} chunks are not cached")]
    AssemblyIncomplete {
        chapter: String,
        missing: usize,
        total: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("encoder failed: {0}")]
    Encoder(String),

    #[error("invalid audio: {0}")]
    Audio(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    pub fn storage(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PipelineError::Storage {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<EngineError> for PipelineError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable { endpoint, reason } => {
                PipelineError::EngineUnavailable { endpoint, reason }
            }
            EngineError::Rejected { status, message } => {
                PipelineError::EngineRejected(format!("status {status}: {message}"))
            }
            EngineError::Malformed(message) => PipelineError::EngineFailed(message),
            EngineError::Runtime(message) => PipelineError::EngineUnavailable {
                endpoint: "engine runtime".to_string(),
                reason: message,
            },
        }
    }
}

impl From<hound::Error> for PipelineError {
    fn from(err: hound::Error) -> Self {
        PipelineError::Audio(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
