//! Run configuration.

use crate::error::{ParxError, Result};
use crate::progress::ProgressSink;
use nix::sys::signal::Signal;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default time a killed worker process gets to disappear before the
/// dispatcher stops waiting for it.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Hook invoked right before an item's callback runs.
pub type StartHook<'a, T> = Box<dyn Fn(&T, usize) -> anyhow::Result<()> + Send + Sync + 'a>;

/// Hook invoked once an item's callback returned a value.
pub type FinishHook<'a, T, R> =
    Box<dyn Fn(&T, usize, &R) -> anyhow::Result<()> + Send + Sync + 'a>;

/// Where callbacks execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Pooled OS threads inside this process.
    #[default]
    Threads,
    /// One worker process per pool slot, each supervised by a thread.
    Processes,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "threads" | "thread" => Ok(Self::Threads),
            "processes" | "process" => Ok(Self::Processes),
            _ => Err(format!(
                "Invalid mode '{}'. Valid options: threads, processes",
                s
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threads => write!(f, "threads"),
            Self::Processes => write!(f, "processes"),
        }
    }
}

/// How worker processes are launched.
///
/// The program must call [`crate::worker::serve_if_worker`] early in `main`
/// with a registry containing the task being run.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    program: Option<PathBuf>,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `program` instead of the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn with_env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Resolve the worker program.
    pub fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| {
                ParxError::Spawn(format!("Failed to get current executable: {}", e))
            }),
        }
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }
}

/// Options for one run.
pub struct Options<'a, T, R> {
    pub(crate) preserve_results: bool,
    pub(crate) start: Option<StartHook<'a, T>>,
    pub(crate) finish: Option<FinishHook<'a, T, R>>,
    pub(crate) finish_in_order: bool,
    pub(crate) isolation: bool,
    pub(crate) progress: Option<Box<dyn ProgressSink + 'a>>,
    pub(crate) interrupt_signal: Signal,
    pub(crate) kill_timeout: Duration,
    pub(crate) worker: WorkerConfig,
}

impl<T, R> Default for Options<'_, T, R> {
    fn default() -> Self {
        Self {
            preserve_results: true,
            start: None,
            finish: None,
            finish_in_order: false,
            isolation: false,
            progress: None,
            interrupt_signal: Signal::SIGINT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            worker: WorkerConfig::default(),
        }
    }
}

impl<'a, T, R> Options<'a, T, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep (default) or discard per-item results. Discarding bounds memory
    /// for runs executed only for their side effects.
    pub fn with_preserve_results(mut self, preserve: bool) -> Self {
        self.preserve_results = preserve;
        self
    }

    pub fn with_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T, usize) -> anyhow::Result<()> + Send + Sync + 'a,
    {
        self.start = Some(Box::new(hook));
        self
    }

    pub fn with_finish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T, usize, &R) -> anyhow::Result<()> + Send + Sync + 'a,
    {
        self.finish = Some(Box::new(hook));
        self
    }

    /// Deliver `finish` strictly by increasing index.
    pub fn with_finish_in_order(mut self, in_order: bool) -> Self {
        self.finish_in_order = in_order;
        self
    }

    /// Give every item a fresh worker process (process mode only).
    pub fn with_isolation(mut self, isolation: bool) -> Self {
        self.isolation = isolation;
        self
    }

    /// Report progress to `sink`. Requires a bounded source.
    pub fn with_progress(mut self, sink: impl ProgressSink + 'a) -> Self {
        self.progress = Some(Box::new(sink));
        self
    }

    /// Signal that kills this run's workers (default SIGINT).
    pub fn with_interrupt_signal(mut self, signal: Signal) -> Self {
        self.interrupt_signal = signal;
        self
    }

    /// How long to wait for killed worker processes to exit.
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn preserve_results(&self) -> bool {
        self.preserve_results
    }

    pub fn isolation(&self) -> bool {
        self.isolation
    }

    pub fn interrupt_signal(&self) -> Signal {
        self.interrupt_signal
    }
}

impl<T, R> fmt::Debug for Options<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("preserve_results", &self.preserve_results)
            .field("start", &self.start.is_some())
            .field("finish", &self.finish.is_some())
            .field("finish_in_order", &self.finish_in_order)
            .field("isolation", &self.isolation)
            .field("progress", &self.progress.is_some())
            .field("interrupt_signal", &self.interrupt_signal)
            .field("kill_timeout", &self.kill_timeout)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options: Options<'_, i32, i32> = Options::new();
        assert!(options.preserve_results());
        assert!(!options.isolation());
        assert!(!options.finish_in_order);
        assert_eq!(options.interrupt_signal(), Signal::SIGINT);
        assert_eq!(options.kill_timeout, DEFAULT_KILL_TIMEOUT);
        assert!(options.start.is_none());
    }

    #[test]
    fn test_builder() {
        let options: Options<'_, i32, i32> = Options::new()
            .with_preserve_results(false)
            .with_finish_in_order(true)
            .with_isolation(true)
            .with_interrupt_signal(Signal::SIGUSR1)
            .with_finish(|_, _, _| Ok(()));
        assert!(!options.preserve_results());
        assert!(options.isolation());
        assert!(options.finish.is_some());
        assert_eq!(options.interrupt_signal(), Signal::SIGUSR1);

        let debug = format!("{:?}", options);
        assert!(debug.contains("finish: true"));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("threads".parse::<Mode>().unwrap(), Mode::Threads);
        assert_eq!("PROCESS".parse::<Mode>().unwrap(), Mode::Processes);
        assert!("fibers".parse::<Mode>().is_err());
        assert_eq!(Mode::Processes.to_string(), "processes");
    }

    #[test]
    fn test_worker_config() {
        let config = WorkerConfig::new()
            .with_program("/bin/worker")
            .with_arg("--quiet")
            .with_env("FOO", "bar");
        assert_eq!(config.program().unwrap(), PathBuf::from("/bin/worker"));
        assert_eq!(config.args(), &[OsString::from("--quiet")]);
        assert_eq!(config.env().len(), 1);

        assert!(WorkerConfig::new().program().is_ok());
    }
}
