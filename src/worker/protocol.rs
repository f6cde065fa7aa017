//! Messages exchanged with worker processes.
//!
//! Parent to worker: one [`Handshake`], then a [`WorkRequest`] per item.
//! Worker to parent: [`WorkResponse::Ready`] after the handshake, then one
//! answer per item.

use crate::outcome::{ControlSignal, UserError};
use serde::{Deserialize, Serialize};

/// Kind of the error a worker answers with when it does not know the task.
pub const UNKNOWN_TASK_KIND: &str = "parx::UnknownTask";

/// Kind of the error a worker answers with when the task state is unusable.
pub const BAD_STATE_KIND: &str = "parx::BadTaskState";

/// First message to a fresh worker: which task to serve, and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Registered task name.
    pub task: String,
    /// bincode encoding of the task value.
    pub state: Vec<u8>,
    /// Pool slot of this worker.
    pub worker_number: usize,
}

/// Request from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkRequest<T> {
    /// Run the task on one item.
    Item { index: usize, item: T },
    /// Graceful shutdown request.
    Exit,
}

/// Response from worker to parent.
#[derive(Debug, Serialize, Deserialize)]
pub enum WorkResponse<R> {
    /// The handshake succeeded; the worker takes requests.
    Ready,
    Value(R),
    Error(UserError),
    Break(Option<R>),
    Kill,
}

impl<R> WorkResponse<R> {
    /// The per-item outcome carried by this response; `None` for `Ready`.
    pub fn into_signal(self) -> Option<ControlSignal<R>> {
        match self {
            Self::Ready => None,
            Self::Value(value) => Some(ControlSignal::Value(value)),
            Self::Error(err) => Some(ControlSignal::UserError(err)),
            Self::Break(value) => Some(ControlSignal::Break(value)),
            Self::Kill => Some(ControlSignal::Kill),
        }
    }

    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Value(_) => "value",
            Self::Error(_) => "error",
            Self::Break(_) => "break",
            Self::Kill => "kill",
        }
    }
}

impl<R> From<ControlSignal<R>> for WorkResponse<R> {
    fn from(signal: ControlSignal<R>) -> Self {
        match signal {
            ControlSignal::Value(value) => Self::Value(value),
            ControlSignal::UserError(err) => Self::Error(err),
            ControlSignal::Break(value) => Self::Break(value),
            ControlSignal::Kill => Self::Kill,
        }
    }
}
