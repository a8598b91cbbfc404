//! The primary error type for all operations in the `triagekit` crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors fatal to the current unit of work. Parser format-rejection is
/// deliberately *not* a variant here — it is expected, non-fatal, and
/// carried by [`crate::parser::ParserError`] instead, per the dispatcher's
/// contract: a parser determining "not my format" must never look like a
/// `TriageError` to its caller.
#[derive(Debug, Error)]
pub enum TriageError {
    /// An I/O error occurred while reading or writing a path in the
    /// meta-directory store.
    #[error("I/O error on path '{path}': {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    /// The meta-directory store is missing an entry, denied a path outside
    /// its root, found a corrupt info record, or saw a hash mismatch on
    /// verification.
    #[error("meta-directory store error: {0}")]
    Store(String),

    /// A parser raised something other than a format-rejection: an internal
    /// invariant was violated while it believed the bytes were its format.
    #[error("parser '{parser}' failed fatally: {reason}")]
    ParserFatal { parser: String, reason: String },

    /// Malformed configuration or an out-of-range heuristic. Raised at
    /// startup; aborts the run.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to (de)serialize an info record or configuration document.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A worker thread panicked while processing a meta-directory.
    #[error("a worker thread panicked: {0}")]
    WorkerPanic(String),
}

impl TriageError {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        TriageError::Io {
            source,
            path: path.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        TriageError::Store(msg.into())
    }
}

// Generic IO error conversion that doesn't require a path.
impl From<std::io::Error> for TriageError {
    fn from(err: std::io::Error) -> Self {
        TriageError::Io {
            source: err,
            path: PathBuf::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TriageError>;
