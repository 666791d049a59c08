use thiserror::Error;

use crate::error::ErrorKind;
use crate::llm::LLMError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker definition not found: {0}")]
    DefinitionNotFound(String),
    #[error("Worker instance not found: {0}")]
    InstanceNotFound(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Rate limit exceeded for definition {definition_id}: {reason}")]
    RateLimited {
        definition_id: String,
        reason: String,
    },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("LLM error: {0}")]
    LLM(#[from] LLMError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::DefinitionNotFound(_) | WorkerError::InstanceNotFound(_) => {
                ErrorKind::NotFound
            }
            WorkerError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            WorkerError::RateLimited { .. } => ErrorKind::RateLimited,
            WorkerError::Configuration(_) => ErrorKind::Configuration,
            WorkerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            WorkerError::NotImplemented(_) => ErrorKind::NotImplemented,
            WorkerError::Io { .. } | WorkerError::Serialization(_) | WorkerError::Internal(_) => {
                ErrorKind::Internal
            }
            WorkerError::LLM(e) => e.kind(),
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        WorkerError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
