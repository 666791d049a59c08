use thiserror::Error;

use crate::eval::evaluator::EvalError;
use crate::llm::LLMError;
use crate::tools::ToolError;
use crate::worker::error::WorkerError;

/// Kind of failure, independent of which subsystem raised it.
///
/// Scripts observe the numeric [`ErrorKind::code`] through `err_code` inside
/// `on_error` handlers and through the `code` entry of a `catch` binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
pub enum ErrorKind {
    NotFound,
    PreconditionFailed,
    RateLimited,
    ArgMismatch,
    InvalidArgument,
    Configuration,
    Internal,
    Type,
    Bounds,
    MustConditionFailed,
    ReadOnlyViolation,
    ClearViolation,
    DivisionByZero,
    NotImplemented,
    ResourceExhausted,
    LLM,
    UserFailure,
}

impl ErrorKind {
    pub fn code(&self) -> i64 {
        match self {
            ErrorKind::NotFound => 1,
            ErrorKind::PreconditionFailed => 2,
            ErrorKind::RateLimited => 3,
            ErrorKind::ArgMismatch => 4,
            ErrorKind::InvalidArgument => 5,
            ErrorKind::Configuration => 6,
            ErrorKind::Internal => 7,
            ErrorKind::Type => 8,
            ErrorKind::Bounds => 9,
            ErrorKind::MustConditionFailed => 10,
            ErrorKind::ReadOnlyViolation => 11,
            ErrorKind::ClearViolation => 12,
            ErrorKind::DivisionByZero => 13,
            ErrorKind::NotImplemented => 14,
            ErrorKind::ResourceExhausted => 15,
            ErrorKind::LLM => 16,
            ErrorKind::UserFailure => 17,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("LLM error: {0}")]
    LLM(#[from] LLMError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Eval(e) => e.kind(),
            Error::Tool(e) => e.kind(),
            Error::Worker(e) => e.kind(),
            Error::LLM(e) => e.kind(),
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::PreconditionFailed,
            ErrorKind::RateLimited,
            ErrorKind::ArgMismatch,
            ErrorKind::InvalidArgument,
            ErrorKind::Configuration,
            ErrorKind::Internal,
            ErrorKind::Type,
            ErrorKind::Bounds,
            ErrorKind::MustConditionFailed,
            ErrorKind::ReadOnlyViolation,
            ErrorKind::ClearViolation,
            ErrorKind::DivisionByZero,
            ErrorKind::NotImplemented,
            ErrorKind::ResourceExhausted,
            ErrorKind::LLM,
            ErrorKind::UserFailure,
        ];
        let codes: std::collections::HashSet<i64> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), kinds.len());
        assert_eq!(ErrorKind::RateLimited.to_string(), "RateLimited");
    }
}
