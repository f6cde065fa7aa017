//! Error types for parx.

use crate::outcome::UserError;
use thiserror::Error;

/// Main error type for parx.
#[derive(Error, Debug)]
pub enum ParxError {
    /// A callback or lifecycle hook failed; re-raised after cleanup.
    #[error("{0}")]
    User(UserError),

    /// A worker process vanished mid-conversation (broken pipe or EOF).
    #[error("Worker {pid} died: {reason}")]
    DeadWorker { pid: i32, reason: String },

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker handshake failed: {0}")]
    Handshake(String),

    #[error("Task '{0}' is not registered in the worker program")]
    UnknownTask(String),

    #[error("Progress reporting needs a source of known size (use a bounded source)")]
    ProgressRequiresBoundedSource,

    #[error("Interrupted by signal {0}")]
    Interrupted(nix::sys::signal::Signal),

    #[error("Too many nested parallel runs registered for interrupts (limit {0})")]
    TooManyNestedRuns(usize),

    #[error("Worker thread failed to start: {0}")]
    ThreadSpawn(std::io::Error),

    #[error("Wire codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

impl ParxError {
    /// Returns true if this error came from a worker process disappearing,
    /// as opposed to a failure raised by user code.
    pub fn is_dead_worker(&self) -> bool {
        matches!(self, Self::DeadWorker { .. })
    }

    /// The user error carried by this error, if any.
    pub fn as_user_error(&self) -> Option<&UserError> {
        match self {
            Self::User(err) => Some(err),
            _ => None,
        }
    }

    /// Consume the error, returning the carried user error if any.
    pub fn into_user_error(self) -> Result<UserError> {
        match self {
            Self::User(err) => Ok(err),
            other => Err(other),
        }
    }
}

impl From<UserError> for ParxError {
    fn from(err: UserError) -> Self {
        Self::User(err)
    }
}

/// Result type alias for parx operations.
pub type Result<T> = std::result::Result<T, ParxError>;
