//! Typed error taxonomy for the filestore and block controller.
//!
//! Internal code returns these enums so callers can match on kind (e.g. to
//! treat a truncate-of-a-missing-file as success). `anyhow::Error` is
//! reserved for the outer/ambient layer, per the teacher's own convention of
//! typed errors in the data-handling core and `anyhow` everywhere else.

use std::fmt;

use thiserror::Error;

/// Errors raised by [`crate::partstore`] and [`crate::filestore`].
#[derive(Debug, Error)]
pub enum FilestoreError {
    #[error("file not found: zone={zone} name={name}")]
    NotExist { zone: String, name: String },

    #[error("file already exists: zone={zone} name={name}")]
    AlreadyExists { zone: String, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation timed out")]
    Transient,

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl FilestoreError {
    pub fn not_exist(zone: &str, name: &str) -> Self {
        FilestoreError::NotExist { zone: zone.to_string(), name: name.to_string() }
    }

    pub fn already_exists(zone: &str, name: &str) -> Self {
        FilestoreError::AlreadyExists { zone: zone.to_string(), name: name.to_string() }
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(self, FilestoreError::NotExist { .. })
    }
}

pub type FilestoreResult<T> = Result<T, FilestoreError>;

/// Errors raised by [`crate::controller`].
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to start controller: {0}")]
    ControllerStart(String),

    #[error(transparent)]
    Filestore(#[from] FilestoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// A collection of errors, used by best-effort multi-item operations like
/// `delete_zone` that must attempt every item before reporting failure.
#[derive(Debug, Default)]
pub struct ErrorList<E>(pub Vec<E>);

impl<E: fmt::Display> fmt::Display for ErrorList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", joined.join("; "))
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ErrorList<E> {}
