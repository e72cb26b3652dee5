//! Error types.
//!
//! [`CallError`] is what an instrumented call site sees. Everything that goes
//! wrong inside the diagnostics machinery itself is logged and never surfaces
//! here.

use std::{error::Error, fmt, io};

use thiserror::Error;

use crate::call_key::{Backend, CallKey};

/// Result type of collaborator hooks.
pub type ManagerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Failure of a profiled call.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The wrapped operation failed; the error is passed through unchanged.
    #[error("{0}")]
    Failed(E),
    /// The backend's breaker is open and no fallback could take the call.
    #[error("no recovery path available for {key}: circuit open on {backend}")]
    NoRecoveryPath {
        /// Call site that was blocked.
        key: CallKey,
        /// Backend whose breaker rejected the call.
        backend: Backend,
    },
}

impl<E> CallError<E> {
    /// The wrapped operation's own error, if that is what failed.
    pub fn into_failure(self) -> Option<E> {
        match self {
            CallError::Failed(err) => Some(err),
            CallError::NoRecoveryPath { .. } => None,
        }
    }

    /// Whether the call was blocked without being executed.
    pub fn is_blocked(&self) -> bool {
        matches!(self, CallError::NoRecoveryPath { .. })
    }
}

/// Errors raised by engine setup and auxiliary sinks.
#[derive(Debug, Error)]
pub enum VigilError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Spawning a thread or writing an output file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The engine has been shut down.
    #[error("engine has been shut down")]
    ShutDown,
}

/// Error returned by default collaborator hooks that a manager does not implement.
#[derive(Debug, Clone, Copy)]
pub struct Unsupported(pub &'static str);

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not supported by this manager", self.0)
    }
}

impl Error for Unsupported {}

/// Shorthand for a [`ManagerResult`] failing with [`Unsupported`].
pub(crate) fn unsupported(operation: &'static str) -> ManagerResult {
    Err(Box::new(Unsupported(operation)))
}
