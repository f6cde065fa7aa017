//! Thread-local context for code running inside a worker.
//!
//! Every pooled worker thread (and the serving thread of a worker process)
//! knows its worker number, `0..count`, and can see the run's kill flag.
//! Threads cannot be killed from outside, so callbacks that wait for a
//! long time should use [`sleep`] or poll [`killed`] to leave early once a
//! sibling has raised `Kill`.
//!
//! Callbacks that start a child process in a pooled thread can hand its
//! pid to [`track_job`]; the child's process group is then killed with
//! the run, by `Kill`, an error or the interrupt signal.

use crate::interrupt::ResourceSet;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity of [`sleep`]'s kill checks.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Clone)]
struct WorkerContext {
    number: usize,
    killed: Arc<AtomicBool>,
    jobs: Option<Arc<ResourceSet>>,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Clears the context when dropped.
pub(crate) struct ContextGuard {
    previous: Option<WorkerContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

fn install(context: WorkerContext) -> ContextGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(context));
    ContextGuard { previous }
}

/// Enter a worker context on the current thread until the guard drops.
pub(crate) fn enter(number: usize, killed: Arc<AtomicBool>) -> ContextGuard {
    install(WorkerContext {
        number,
        killed,
        jobs: None,
    })
}

/// Enter the context of pool slot `number`, whose jobs are tracked in the
/// slot's entry of `resources`.
pub(crate) fn enter_pool(number: usize, resources: &Arc<ResourceSet>) -> ContextGuard {
    install(WorkerContext {
        number,
        killed: resources.kill_flag(),
        jobs: Some(Arc::clone(resources)),
    })
}

/// Number of the worker running the current callback, or `None` outside a run.
pub fn worker_number() -> Option<usize> {
    CURRENT.with(|current| current.borrow().as_ref().map(|ctx| ctx.number))
}

/// True once the current run has been killed.
pub fn killed() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|ctx| ctx.killed.load(Ordering::Acquire))
    })
}

/// True if [`track_job`] would track a child process. Callbacks should
/// then start the child as the leader of a new process group.
pub fn tracks_jobs() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|ctx| ctx.jobs.is_some())
    })
}

/// Kill `pid`'s process group along with the run until [`untrack_job`].
/// Returns `false` outside a pooled thread.
pub fn track_job(pid: Pid) -> bool {
    CURRENT.with(|current| match current.borrow().as_ref() {
        Some(WorkerContext {
            number,
            jobs: Some(resources),
            ..
        }) => {
            resources.track(*number, pid);
            true
        }
        _ => false,
    })
}

pub fn untrack_job() {
    CURRENT.with(|current| {
        if let Some(WorkerContext {
            number,
            jobs: Some(resources),
            ..
        }) = current.borrow().as_ref()
        {
            resources.untrack(*number);
        }
    })
}

/// Sleep for `duration`, waking early if the run is killed.
///
/// Returns `true` if the full duration elapsed.
pub fn sleep(duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if killed() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_context_outside_run() {
        assert_eq!(worker_number(), None);
        assert!(!killed());
    }

    #[test]
    fn test_enter_and_leave() {
        let flag = Arc::new(AtomicBool::new(false));
        {
            let _guard = enter(3, Arc::clone(&flag));
            assert_eq!(worker_number(), Some(3));
            assert!(!killed());
            flag.store(true, Ordering::Release);
            assert!(killed());
        }
        assert_eq!(worker_number(), None);
    }

    #[test]
    fn test_nested_context_restores_outer() {
        let flag = Arc::new(AtomicBool::new(false));
        let _outer = enter(0, Arc::clone(&flag));
        {
            let _inner = enter(7, Arc::clone(&flag));
            assert_eq!(worker_number(), Some(7));
        }
        assert_eq!(worker_number(), Some(0));
    }

    #[test]
    fn test_sleep_wakes_on_kill() {
        let flag = Arc::new(AtomicBool::new(true));
        let _guard = enter(0, flag);
        let started = Instant::now();
        assert!(!sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_jobs_are_tracked_only_in_pools() {
        assert!(!tracks_jobs());
        assert!(!track_job(Pid::from_raw(1)));

        let resources = ResourceSet::new(nix::sys::signal::Signal::SIGINT, 2);
        let _guard = enter_pool(1, &resources);
        assert!(tracks_jobs());
        assert_eq!(worker_number(), Some(1));
        {
            let _plain = enter(0, Arc::new(AtomicBool::new(false)));
            assert!(!tracks_jobs());
        }
        assert!(tracks_jobs());
        resources.kill_all();
        assert!(killed());
    }

    #[test]
    fn test_sleep_completes() {
        assert!(sleep(Duration::from_millis(20)));
    }
}
