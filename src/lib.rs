//! parx - parallel map/each over threads or worker processes.
//!
//! One engine runs a callback over an [`ItemSource`] with a pool of
//! workers, either threads of the calling process or separate worker
//! processes, and returns the results in input order:
//!
//! ```
//! use parx::{ItemSource, Options, Outcome, run};
//!
//! let source = ItemSource::bounded(vec![1, 2, 3, 4]);
//! let outcome = run(source, 2, |n: &i32, _index| Ok(n * 10), Options::new()).unwrap();
//! assert!(matches!(outcome, Outcome::Completed(v) if v == vec![10, 20, 30, 40]));
//! ```
//!
//! Callbacks stop a run early by returning [`Halt::Break`] (finish what is
//! running, then stop) or [`Halt::Kill`] (stop everything now). Errors
//! raised by a callback are re-raised once every worker is gone.
//!
//! Process workers run a registered [`Task`]; see [`task`] for how a
//! program serves as its own worker.

pub mod context;
mod dispatch;
pub mod error;
pub mod interrupt;
pub mod logging;
pub mod options;
pub mod outcome;
pub mod progress;
mod results;
pub mod shell;
pub mod source;
pub mod task;
pub mod worker;

pub use dispatch::{run, run_task};
pub use error::{ParxError, Result};
pub use interrupt::{InterruptRegistry, MAX_NESTED_RUNS, ResourceSet};
pub use options::{Mode, Options, WorkerConfig};
pub use outcome::{ControlSignal, Halt, Outcome, UserError};
pub use progress::{IndicatifProgress, ProgressSink};
pub use shell::{JobFailed, JobOutput, ShellTask};
pub use source::{Feed, ItemSource, WorkItem};
pub use task::{Task, TaskRegistry};
pub use worker::{WORKER_FDS_ENV, serve_if_worker};
