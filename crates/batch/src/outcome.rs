use std::fmt;
use std::future::Future;
use crate::error::OperationError;
use crate::job::Job;

/// Terminal result of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Skipped(String),
    Failed(String),
}

impl Outcome {
    /// Classify an operation result: the no-work sentinel skips, any other error fails
    pub fn from_result(result: Result<(), OperationError>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(OperationError::NoEligibleWork(reason)) => Outcome::Skipped(reason),
            Err(OperationError::Failed(err)) => Outcome::Failed(format!("{:#}", err)),
        }
    }
}

impl From<Result<(), OperationError>> for Outcome {
    fn from(result: Result<(), OperationError>) -> Self {
        Outcome::from_result(result)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            Outcome::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

/// The external per-file action driven by the engine.
///
/// Implementations must be safe to run concurrently on distinct paths and
/// must not share mutable state with the caller.
pub trait Operation: Send + Sync + 'static {
    fn process(&self, job: &Job) -> impl Future<Output = Result<(), OperationError>> + Send;
}
