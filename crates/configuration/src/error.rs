//! Errors that can be thrown when processing configuration.

use std::path::PathBuf;

use query_engine_metadata::metadata::MetadataError;

/// The errors that can be thrown when parsing a configuration directory.
#[derive(Debug, thiserror::Error)]
pub enum ParseConfigurationError {
    #[error("parse error on {file_path}:{line}:{column}: {message}")]
    ParseError {
        file_path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("unsupported configuration version {0}")]
    UnsupportedVersion(u32),
    #[error("I/O error: {0}")]
    IoErrorButStringified(String),
}

/// The errors that can be thrown when writing a configuration directory.
#[derive(Debug, thiserror::Error)]
pub enum WriteParsedConfigurationError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The errors that can be thrown when turning a parsed configuration into a
/// runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum MakeRuntimeConfigurationError {
    #[error("invalid mapping: {0}")]
    InvalidMetadata(#[from] MetadataError),
    #[error("invalid include path: {0}")]
    InvalidIncludePath(query_engine_translation::translation::error::Error),
    #[error("unknown dialect '{value}' in {variable}")]
    UnknownDialect { variable: String, value: String },
    #[error(transparent)]
    Environment(#[from] crate::environment::Error),
}
