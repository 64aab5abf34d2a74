//! Errors for translation.

use query_engine_metadata::metadata::{EntityId, MetadataError};
use query_engine_sql::sql::diagnostics::Diagnostic;
use query_engine_sql::sql::evaluate::EvaluationError;

/// A structural error: the input cannot be expressed against the mapping at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("The member '{member}' of '{type_name}' cannot be resolved")]
    MemberNotResolved { type_name: String, member: String },
    #[error("No constructor of '{0}' binds all of its read-only members")]
    UnbindableConstructor(String),
    #[error("The expression '{0}' is not a sequence")]
    NotASequence(&'static str),
    #[error("Argument {index} of '{operator}' must be a lambda with {arity} parameter(s)")]
    LambdaExpected {
        operator: String,
        index: usize,
        arity: usize,
    },
    #[error("'{operator}' expects {expected} argument(s)")]
    ArgumentCount { operator: String, expected: usize },
    #[error("The entity '{entity}' has no strategy to obtain the generated member '{member}'")]
    MissingGeneratedIdStrategy { entity: EntityId, member: String },
    #[error("The include path '{path}' is invalid: {reason}")]
    InvalidIncludePath { path: String, reason: String },
    #[error("Entity '{0}' has no primary key")]
    NoPrimaryKey(EntityId),
    #[error("Unsupported: {0}")]
    NotSupported(String),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

impl Error {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(self.to_string())
    }
}
