//! Error Types
//!
//! Two layers of errors live here:
//!
//! - [`PathError`]: a malformed path specification, rejected before any
//!   cache access.
//! - [`Error`]: everything an accessor can report. Structural errors
//!   (`Path`, `Configuration`, `SyncGuard`, `Structural`) are returned
//!   synchronously from the accessor. Data errors (`Graph`, `Source`,
//!   `Cycle`, `Batch`) travel through the result channel.

use serde_json::Value;
use thiserror::Error;

use crate::path::Path;

/// Result type alias for Trellis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A malformed path specification.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PathError {
    #[error("path specification must contain at least one segment")]
    Empty,

    #[error("key set must contain at least one member")]
    EmptySet,

    #[error("invalid range: from {from} is greater than to {to}")]
    InvalidRange { from: i64, to: i64 },

    #[error("invalid range: length must be at least 1, got {0}")]
    InvalidLength(i64),

    #[error("range bounds must be integers, got {0}")]
    NonIntegerBound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// One failed path inside a multi-path request.
#[derive(Debug, Clone, PartialEq)]
pub struct PathFailure {
    pub path: Path,
    pub error: Error,
}

/// Comprehensive error type for cache operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed path specification.
    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    /// Reference resolution came back around to a location it already visited.
    #[error("reference cycle detected at {path}")]
    Cycle { path: Path },

    /// An error sentinel stored in the graph.
    #[error("graph error at {path}: {value}")]
    Graph { path: Path, value: Value },

    /// A synchronous accessor was used outside a permitted window.
    #[error("Model#{0} may only be called within the context of a request selector")]
    SyncGuard(&'static str),

    /// The model is not configured for the requested operation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The data source rejected a fetch, set or call.
    #[error("data source failure at {path}: {value}")]
    Source { path: Path, value: Value },

    /// A write would have to pass through a leaf.
    #[error("cannot write below the {kind} at {path}")]
    Structural { path: Path, kind: &'static str },

    /// Several paths of one request failed; the rest were delivered.
    #[error("{} requested path(s) failed", .0.len())]
    Batch(Vec<PathFailure>),
}

impl Error {
    /// The error payload as it would appear in a JSON Graph error sentinel.
    pub fn payload(&self) -> Value {
        match self {
            Error::Graph { value, .. } | Error::Source { value, .. } => value.clone(),
            other => Value::String(other.to_string()),
        }
    }

    /// Flatten a batch into its individual failures.
    pub fn failures(&self) -> Vec<PathFailure> {
        match self {
            Error::Batch(failures) => failures.clone(),
            Error::Cycle { path }
            | Error::Graph { path, .. }
            | Error::Source { path, .. }
            | Error::Structural { path, .. } => vec![PathFailure {
                path: path.clone(),
                error: self.clone(),
            }],
            _ => Vec::new(),
        }
    }
}
