//! Process workers.
//!
//! In process mode every pool slot owns one worker subprocess, supervised
//! by the slot's thread in the parent:
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Parent Process │
//!                     │  (Dispatcher)   │
//!                     └────────┬────────┘
//!               ┌──────────────┼──────────────┐
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ slot 0    │  │ slot 1    │  │ slot N-1  │
//!         │ thread    │  │ thread    │  │ thread    │
//!         └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!          pipes│         pipes│         pipes│
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N-1│
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Workers are new executions of a worker program that registered the
//! task being run (see [`crate::task`]), never forks of a running parent.

pub(crate) mod executor;
pub(crate) mod ipc;
pub(crate) mod proc;
pub(crate) mod protocol;
pub(crate) mod signals;
pub(crate) mod spawn;
pub(crate) mod worker_main;

pub use protocol::{BAD_STATE_KIND, UNKNOWN_TASK_KIND};
pub use spawn::WORKER_FDS_ENV;
pub use worker_main::serve_if_worker;
