//! Errors for execution.

use query_engine_sql::sql::evaluate::EvaluationError;

use crate::executor::BoxError;

/// An error raised while running a plan.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The plan was built with diagnostics; the first one is quoted.
    #[error("The query cannot be executed: {0}")]
    OutstandingDiagnostics(String),
    #[error(transparent)]
    Executor(BoxError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error("Sequence contains no elements")]
    NoElements,
    #[error("Sequence contains more than one element")]
    MoreThanOneElement,
    #[error("The query results cannot be enumerated more than once")]
    AlreadyEnumerated,
    #[error("Reading deferred results failed: {0}")]
    Deferred(String),
    #[error("Expected a sequence to apply the batch to, got {0}")]
    NotASequence(String),
    #[error("The row has {found} field(s), {expected} were expected")]
    FieldCount { expected: usize, found: usize },
    #[error("A nested query cannot run without a connection")]
    Detached,
}

impl Error {
    /// Unwrap an error that passed through the executor, e.g. one raised by a row
    /// projector.
    pub(crate) fn from_executor(error: BoxError) -> Error {
        match error.downcast::<Error>() {
            Ok(error) => *error,
            Err(error) => Error::Executor(error),
        }
    }
}
