//! Policy loading error types.

use std::path::PathBuf;
use thiserror::Error;

/// A policy document was rejected.
///
/// Names the file and the offending field so operators can fix it. A rejected
/// document is skipped; the engine keeps running on the remaining documents.
#[derive(Debug, Clone, Error)]
#[error("Invalid policy {file}: {field}: {message}")]
pub struct PolicyValidationError {
    /// Document that failed validation.
    pub file: PathBuf,
    /// Dotted path of the failing field (`<document>` for parse failures).
    pub field: String,
    /// Description of the problem.
    pub message: String,
}

impl PolicyValidationError {
    pub(crate) fn new(file: impl Into<PathBuf>, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors that abort a whole policy load.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy directory could not be listed.
    #[error("Failed to read policy directory {path}: {source}")]
    ReadDir {
        /// Directory that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A single document failed validation.
    #[error(transparent)]
    Validation(#[from] PolicyValidationError),
}
