//! The dispatcher: runs a pool of workers over an item source.
//!
//! Every pool slot is a scoped thread that pulls from the shared source,
//! runs the item through its executor (the callback itself, or a worker
//! process) and reports back. The first `Break`, `Kill` or error observed
//! by any slot halts dispatch:
//!
//! ```text
//! Running ─┬─> Completing ──────┐
//!          ├─> BreakObserved ───┤
//!          ├─> KillObserved ────┼─> Draining ─> Terminal
//!          └─> ErrorObserved ───┘
//! ```
//!
//! `Break` lets in-flight items finish. `Kill` and errors kill the run's
//! worker processes and raise the kill flag seen by callbacks. Every
//! slot thread is joined, and every worker process reaped, before a run
//! returns.

use crate::context;
use crate::error::{ParxError, Result};
use crate::interrupt::{InterruptRegistry, ResourceSet};
use crate::options::{Mode, Options};
use crate::outcome::{ControlSignal, Halt, Outcome, UserError, guarded};
use crate::results::Accumulator;
use crate::source::ItemSource;
use crate::task::Task;
use crate::worker::executor::{Executor, ProcessWorkforce, ThreadWorkforce, Workforce};
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Run `callback` over `source` on `count` threads.
///
/// With `count == 0` the items run one after the other on the calling
/// thread, without any pool machinery. Results are returned in input
/// order; a captured error is returned once every worker is gone.
///
/// # Errors
///
/// Besides the callback's own errors, a pooled run fails with
/// [`ParxError::TooManyNestedRuns`] when
/// [`MAX_NESTED_RUNS`](crate::MAX_NESTED_RUNS) pooled runs are already
/// active in this process, and with [`ParxError::Interrupted`] when the
/// interrupt signal killed it.
pub fn run<'a, T, R, F>(
    source: ItemSource<'a, T>,
    count: usize,
    callback: F,
    options: Options<'a, T, R>,
) -> Result<Outcome<R>>
where
    T: Send + 'a,
    R: Send + 'a,
    F: Fn(&T, usize) -> std::result::Result<R, Halt<R>> + Sync,
{
    check_progress(&source, &options)?;
    if count == 0 {
        return run_direct(&source, &callback, options);
    }
    let workforce = ThreadWorkforce::new(&callback);
    Dispatcher::new(&source, count, options).run(&workforce)
}

/// Run a registered task over `source` with `count` workers of `mode`.
///
/// In process mode each worker is a separate process started from the
/// options' [`WorkerConfig`](crate::WorkerConfig).
///
/// # Errors
///
/// As [`run`], plus worker failures: [`ParxError::Spawn`],
/// [`ParxError::Handshake`], [`ParxError::UnknownTask`] and
/// [`ParxError::DeadWorker`].
pub fn run_task<'a, K: Task>(
    source: ItemSource<'a, K::Item>,
    count: usize,
    mode: Mode,
    task: K,
    options: Options<'a, K::Item, K::Output>,
) -> Result<Outcome<K::Output>> {
    match mode {
        Mode::Processes if count > 0 => {
            check_progress(&source, &options)?;
            let workforce = ProcessWorkforce::new(
                &task,
                options.worker.clone(),
                options.isolation,
                options.kill_timeout,
            )?;
            Dispatcher::new(&source, count, options).run(&workforce)
        }
        _ => run(source, count, |item, index| task.call(item, index), options),
    }
}

fn check_progress<'a, T: Send + 'a, R>(
    source: &ItemSource<'a, T>,
    options: &Options<'a, T, R>,
) -> Result<()> {
    if options.progress.is_some() && source.known_size().is_none() {
        return Err(ParxError::ProgressRequiresBoundedSource);
    }
    Ok(())
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Completing,
    BreakObserved,
    KillObserved,
    ErrorObserved,
    Draining,
    Terminal,
}

/// Why dispatch stopped early.
enum Halted<R> {
    Break(Option<R>),
    Kill,
    Error(ParxError),
}

impl<R> Halted<R> {
    fn phase(&self) -> Phase {
        match self {
            Self::Break(_) => Phase::BreakObserved,
            Self::Kill => Phase::KillObserved,
            Self::Error(_) => Phase::ErrorObserved,
        }
    }

    fn aborts(&self) -> bool {
        !matches!(self, Self::Break(_))
    }
}

struct ControlState<R> {
    phase: Phase,
    first: Option<Halted<R>>,
}

/// The control-signal state machine shared by all slots.
struct Control<R> {
    halted: AtomicBool,
    state: Mutex<ControlState<R>>,
}

impl<R> Control<R> {
    fn new() -> Self {
        Self {
            halted: AtomicBool::new(false),
            state: Mutex::new(ControlState {
                phase: Phase::Running,
                first: None,
            }),
        }
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Record a halt. Only the first one counts; returns whether this was it.
    fn observe(&self, halted: Halted<R>) -> bool {
        let mut state = lock(&self.state);
        if state.first.is_some() {
            if let Halted::Error(err) = &halted {
                tracing::debug!(error = %err, "Ignoring error observed after halt");
            }
            return false;
        }
        transition(&mut state, halted.phase());
        state.first = Some(halted);
        self.halted.store(true, Ordering::Release);
        true
    }

    /// Move to `phase` unless a halt already decided the run.
    fn settle_running(&self, phase: Phase) {
        let mut state = lock(&self.state);
        if state.phase == Phase::Running {
            transition(&mut state, phase);
        }
    }

    fn advance(&self, phase: Phase) {
        transition(&mut lock(&self.state), phase);
    }

    fn into_first(self) -> Option<Halted<R>> {
        let state = match self.state.into_inner() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.first
    }
}

fn transition<R>(state: &mut ControlState<R>, next: Phase) {
    if state.phase != next {
        tracing::debug!(from = ?state.phase, to = ?next, "Dispatcher phase");
        state.phase = next;
    }
}

struct Dispatcher<'s, 'a, T, R> {
    source: &'s ItemSource<'a, T>,
    count: usize,
    acc: Accumulator<'a, T, R>,
    control: Control<R>,
    resources: Arc<ResourceSet>,
    signal: Signal,
}

impl<'s, 'a, T, R> Dispatcher<'s, 'a, T, R>
where
    T: Send + 'a,
    R: Send + 'a,
{
    fn new(source: &'s ItemSource<'a, T>, count: usize, mut options: Options<'a, T, R>) -> Self {
        // No more slots than items, when we know how many there are.
        let count = source.known_size().map_or(count, |size| count.min(size));
        let signal = options.interrupt_signal;
        Self {
            source,
            count,
            acc: Accumulator::new(&mut options, source.known_size()),
            control: Control::new(),
            resources: ResourceSet::new(signal, count),
            signal,
        }
    }

    fn run<W: Workforce<T, R>>(self, workforce: &W) -> Result<Outcome<R>> {
        let registration = InterruptRegistry::global().register(Arc::clone(&self.resources))?;
        tracing::debug!(workers = self.count, signal = %self.signal, "Starting pool");

        if let Some(total) = self.source.known_size() {
            self.acc.begin(total);
        }

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.count);
            for number in 0..self.count {
                let this = &self;
                let spawned = std::thread::Builder::new()
                    .name(format!("parx-worker-{}", number))
                    .spawn_scoped(scope, move || this.work(workforce, number));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        self.halt(Halted::Error(ParxError::ThreadSpawn(err)));
                        break;
                    }
                }
            }
            for handle in handles {
                if let Err(payload) = handle.join() {
                    self.halt(Halted::Error(UserError::from_panic(payload).into()));
                }
            }
        });

        self.control.advance(Phase::Draining);
        drop(registration);
        tracing::debug!(workers = self.count, "Pool stopped");

        let interrupted = self.resources.was_interrupted();
        let first = self.control.into_first();
        if interrupted {
            self.acc.end();
            tracing::debug!(to = ?Phase::Terminal, "Dispatcher phase");
            return Err(ParxError::Interrupted(self.signal));
        }
        let outcome = settle(self.acc, first);
        tracing::debug!(to = ?Phase::Terminal, "Dispatcher phase");
        outcome
    }

    fn stopped(&self) -> bool {
        self.control.is_halted() || self.resources.is_killed()
    }

    fn halt(&self, halted: Halted<R>) {
        let aborts = halted.aborts();
        if self.control.observe(halted) && aborts {
            self.resources.kill_all();
        }
    }

    /// Body of one pool slot.
    fn work<W: Workforce<T, R>>(&self, workforce: &W, number: usize) {
        let _context = context::enter_pool(number, &self.resources);

        let mut executor = match workforce.hire(number, &self.resources) {
            Ok(executor) => executor,
            Err(err) => {
                self.halt(Halted::Error(err));
                return;
            }
        };

        self.drive(&mut executor);

        if let Err(err) = executor.close() {
            tracing::warn!(worker = number, error = %err, "Failed to close worker");
        }
    }

    fn drive<E: Executor<T, R>>(&self, executor: &mut E) {
        while !self.stopped() {
            let Some(work) = self.source.pull(&|| self.stopped()) else {
                self.control.settle_running(Phase::Completing);
                return;
            };
            if self.stopped() {
                return;
            }

            if let Err(err) = self.acc.started(&work.item, work.index) {
                self.halt(Halted::Error(err.into()));
                return;
            }

            let signal = match executor.execute(&work) {
                Ok(signal) => signal,
                Err(err) => {
                    self.halt(Halted::Error(err));
                    return;
                }
            };

            match signal {
                ControlSignal::Value(value) => {
                    if let Err(err) = self.acc.completed(work, value) {
                        self.halt(Halted::Error(err.into()));
                        return;
                    }
                }
                ControlSignal::UserError(err) => {
                    self.halt(Halted::Error(err.into()));
                    return;
                }
                ControlSignal::Break(value) => {
                    self.halt(Halted::Break(value));
                    return;
                }
                ControlSignal::Kill => {
                    self.halt(Halted::Kill);
                    return;
                }
            }
        }
    }
}

/// Run every item on the calling thread, in source order.
fn run_direct<'a, T, R, F>(
    source: &ItemSource<'a, T>,
    callback: &F,
    mut options: Options<'a, T, R>,
) -> Result<Outcome<R>>
where
    T: Send + 'a,
    R: Send + 'a,
    F: Fn(&T, usize) -> std::result::Result<R, Halt<R>>,
{
    let acc = Accumulator::new(&mut options, source.known_size());
    let _context = context::enter(0, Arc::new(AtomicBool::new(false)));

    if let Some(total) = source.known_size() {
        acc.begin(total);
    }

    let first = direct_loop(source, callback, &acc);
    settle(acc, first)
}

fn direct_loop<'a, T, R, F>(
    source: &ItemSource<'a, T>,
    callback: &F,
    acc: &Accumulator<'a, T, R>,
) -> Option<Halted<R>>
where
    T: Send + 'a,
    F: Fn(&T, usize) -> std::result::Result<R, Halt<R>>,
{
    while let Some(work) = source.next() {
        if let Err(err) = acc.started(&work.item, work.index) {
            return Some(Halted::Error(err.into()));
        }
        match guarded(|| callback(&work.item, work.index)) {
            ControlSignal::Value(value) => {
                if let Err(err) = acc.completed(work, value) {
                    return Some(Halted::Error(err.into()));
                }
            }
            ControlSignal::UserError(err) => return Some(Halted::Error(err.into())),
            ControlSignal::Break(value) => return Some(Halted::Break(value)),
            ControlSignal::Kill => return Some(Halted::Kill),
        }
    }
    None
}

/// Turn the first halt (if any) into the run's result.
fn settle<T, R>(acc: Accumulator<'_, T, R>, first: Option<Halted<R>>) -> Result<Outcome<R>> {
    let outcome = match first {
        None => Ok(None),
        Some(Halted::Break(value)) => acc
            .release_pending()
            .map(|()| Some(Outcome::Broken(value)))
            .map_err(ParxError::from),
        Some(Halted::Kill) => acc
            .release_pending()
            .map(|()| Some(Outcome::Killed))
            .map_err(ParxError::from),
        Some(Halted::Error(err)) => Err(err),
    };
    acc.end();
    match outcome? {
        Some(stopped) => Ok(stopped),
        None => Ok(Outcome::Completed(acc.into_results())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::ThreadId;

    fn add_two(x: &i32, _: usize) -> std::result::Result<i32, Halt<i32>> {
        Ok(x + 2)
    }

    #[test]
    fn test_thread_pool_preserves_order() {
        let outcome = run(ItemSource::bounded(1..10), 4, add_two, Options::new()).unwrap();
        assert_eq!(outcome, Outcome::Completed(vec![3, 4, 5, 6, 7, 8, 9, 10, 11]));
    }

    #[test]
    fn test_direct_runs_on_caller_thread() {
        let caller = std::thread::current().id();
        let seen = Mutex::new(Vec::<(ThreadId, Option<usize>)>::new());
        let outcome = run(
            ItemSource::bounded(vec![1, 2, 3]),
            0,
            |x: &i32, _| {
                lock(&seen).push((std::thread::current().id(), context::worker_number()));
                Ok(x * 2)
            },
            Options::new(),
        )
        .unwrap();
        assert_eq!(outcome.results(), Some(vec![2, 4, 6]));
        assert!(
            lock(&seen)
                .iter()
                .all(|(id, number)| *id == caller && *number == Some(0))
        );
    }

    #[test]
    fn test_break_stops_dispatch() {
        let started = AtomicUsize::new(0);
        let outcome = run(
            ItemSource::bounded(0..1000),
            2,
            |x: &i32, _| {
                started.fetch_add(1, Ordering::SeqCst);
                if *x == 1 {
                    return Err(Halt::stop());
                }
                Ok(*x)
            },
            Options::new(),
        )
        .unwrap();
        assert_eq!(outcome, Outcome::Broken(None));
        assert!(started.load(Ordering::SeqCst) < 1000);
    }

    #[test]
    fn test_break_with_value() {
        let outcome = run(
            ItemSource::bounded(vec!["a", "b"]),
            0,
            |item: &&str, _| match *item {
                "b" => Err(Halt::stop_with(item.to_uppercase())),
                _ => Ok(item.to_string()),
            },
            Options::new(),
        )
        .unwrap();
        assert_eq!(outcome, Outcome::Broken(Some("B".to_string())));
    }

    #[test]
    fn test_kill_raises_flag_for_siblings() {
        let outcome = run(
            ItemSource::bounded(0..4),
            4,
            |x: &i32, _| {
                if *x == 0 {
                    return Err(Halt::Kill);
                }
                // Siblings wake up as soon as the kill is raised.
                context::sleep(std::time::Duration::from_secs(30));
                Ok(*x)
            },
            Options::new(),
        )
        .unwrap();
        assert_eq!(outcome, Outcome::Killed);
    }

    #[test]
    fn test_first_error_is_returned_after_join() {
        let result = run(
            ItemSource::bounded(0..50),
            3,
            |x: &i32, _| -> std::result::Result<i32, Halt<i32>> {
                if *x == 7 {
                    return Err(std::io::Error::other("seven is unlucky").into());
                }
                Ok(*x)
            },
            Options::new(),
        );
        let err = result.unwrap_err();
        let user = err.as_user_error().expect("user error");
        assert_eq!(user.message(), "seven is unlucky");
        assert!(user.downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn test_panic_becomes_user_error() {
        let result = run(
            ItemSource::bounded(vec![1]),
            2,
            |_: &i32, _| -> std::result::Result<i32, Halt<i32>> { panic!("no way") },
            Options::new(),
        );
        let err = result.unwrap_err();
        assert_eq!(
            err.as_user_error().map(|e| e.kind()),
            Some(crate::outcome::PANIC_KIND)
        );
    }

    #[test]
    fn test_progress_needs_bounded_source() {
        let (_tx, rx) = crossbeam_channel::unbounded::<crate::source::Feed<i32>>();
        let options = Options::new().with_progress(crate::progress::IndicatifProgress::new());
        let result = run(ItemSource::streaming(rx), 2, add_two, options);
        assert!(matches!(
            result,
            Err(ParxError::ProgressRequiresBoundedSource)
        ));
    }

    #[test]
    fn test_worker_numbers_are_pool_slots() {
        let numbers = Mutex::new(std::collections::BTreeSet::new());
        run(
            ItemSource::bounded(0..40),
            3,
            |x: &i32, _| {
                lock(&numbers).insert(context::worker_number());
                std::thread::sleep(std::time::Duration::from_millis(2));
                Ok(*x)
            },
            Options::new(),
        )
        .unwrap();
        assert!(
            lock(&numbers)
                .iter()
                .all(|n| matches!(n, Some(0..=2)))
        );
        assert_eq!(context::worker_number(), None);
    }

    #[test]
    fn test_empty_source() {
        let outcome = run(ItemSource::bounded(Vec::<i32>::new()), 4, add_two, Options::new());
        assert_eq!(outcome.unwrap(), Outcome::Completed(vec![]));
    }
}
