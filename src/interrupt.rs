//! Process-wide interrupt handling for running pools.
//!
//! While at least one run is registered for a signal (SIGINT by default),
//! parx owns that signal's disposition. When the signal arrives, every
//! registered [`ResourceSet`] for it is killed: the process group of every
//! tracked worker process or job gets SIGKILL, worker threads see their
//! kill flag. The previously installed
//! handler is then invoked, or the default action is performed. When the
//! last registration for a signal goes away the previous disposition is
//! restored exactly.
//!
//! The handler itself only touches atomics and calls `kill`, `sigaction`
//! and `raise`, all async-signal-safe. It therefore reads a fixed table of
//! registered sets rather than the mutex-protected registry.

use crate::error::{ParxError, Result};
use nix::errno::Errno;
use nix::libc::{c_int, c_void, siginfo_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Maximum number of runs registered at the same time, across all threads.
/// Starting one more fails with [`ParxError::TooManyNestedRuns`].
pub const MAX_NESTED_RUNS: usize = 64;

/// One past the highest signal number we may be asked to handle.
const SIGNAL_SLOTS: usize = 65;

const DISPOSITION_DEFAULT: usize = 0;
const DISPOSITION_IGNORE: usize = 1;

static ACTIVE: [AtomicPtr<ResourceSet>; MAX_NESTED_RUNS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_NESTED_RUNS];
static PREVIOUS_HANDLER: [AtomicUsize; SIGNAL_SLOTS] =
    [const { AtomicUsize::new(DISPOSITION_DEFAULT) }; SIGNAL_SLOTS];
static PREVIOUS_SIGINFO: [AtomicBool; SIGNAL_SLOTS] =
    [const { AtomicBool::new(false) }; SIGNAL_SLOTS];
/// Handler invocations currently walking `ACTIVE`.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// SIGKILL the process group led by `pid`, or `pid` alone when it leads
/// none. Async-signal-safe.
pub(crate) fn kill_tree(pid: Pid) -> nix::Result<()> {
    match signal::killpg(pid, Signal::SIGKILL) {
        Err(Errno::ESRCH) => signal::kill(pid, Signal::SIGKILL),
        other => other,
    }
}

/// The killable resources of one run: one pid slot per worker, holding the
/// worker process or the job a worker thread is waiting on, plus the kill
/// flag seen by worker threads.
#[derive(Debug)]
pub struct ResourceSet {
    signal: Signal,
    pids: Box<[AtomicI32]>,
    killed: Arc<AtomicBool>,
    interrupted: AtomicBool,
}

impl ResourceSet {
    /// Create a set with `slots` pid slots, killed on `signal`.
    pub fn new(signal: Signal, slots: usize) -> Arc<Self> {
        Arc::new(Self {
            signal,
            pids: (0..slots).map(|_| AtomicI32::new(0)).collect(),
            killed: Arc::new(AtomicBool::new(false)),
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Record the process currently occupying `slot`. Its whole process
    /// group is killed with the set.
    pub fn track(&self, slot: usize, pid: Pid) {
        if let Some(entry) = self.pids.get(slot) {
            entry.store(pid.as_raw(), Ordering::SeqCst);
        }
    }

    /// Forget the process in `slot`; call before reaping it.
    pub fn untrack(&self, slot: usize) {
        if let Some(entry) = self.pids.get(slot) {
            entry.store(0, Ordering::SeqCst);
        }
    }

    /// Flag shared with worker threads.
    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.killed)
    }

    /// True once [`kill_all`](Self::kill_all) ran. A process tracked before
    /// this reads `true` has been or will be killed by the sweep.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// True if the set was killed by the interrupt signal.
    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Kill everything in the set. Safe to call from a signal handler.
    pub fn kill_all(&self) {
        self.killed.store(true, Ordering::SeqCst);
        for entry in self.pids.iter() {
            let pid = entry.load(Ordering::SeqCst);
            if pid > 0 {
                let _ = kill_tree(Pid::from_raw(pid));
            }
        }
    }
}

struct Entry {
    id: u64,
    slot: usize,
    resources: Arc<ResourceSet>,
}

struct Installed {
    previous: SigAction,
    users: usize,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Entry>,
    installed: HashMap<Signal, Installed>,
    /// Popped sets seen while a handler was running; it may still hold a
    /// pointer to them.
    retired: Vec<Arc<ResourceSet>>,
    next_id: u64,
}

/// Reference-counted registry of the resource sets of all running pools.
pub struct InterruptRegistry {
    state: Mutex<RegistryState>,
}

/// Keeps a resource set registered; unregisters on drop.
#[must_use = "dropping the registration unregisters the resources immediately"]
pub struct Registration {
    registry: &'static InterruptRegistry,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

impl InterruptRegistry {
    /// The registry of this process.
    pub fn global() -> &'static InterruptRegistry {
        static REGISTRY: OnceLock<InterruptRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| InterruptRegistry {
            state: Mutex::new(RegistryState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `resources`, installing the signal handler if this is the
    /// first registration for its signal.
    pub fn register(&'static self, resources: Arc<ResourceSet>) -> Result<Registration> {
        let mut state = self.lock();
        let signal = resources.signal();

        let slot = ACTIVE
            .iter()
            .position(|entry| entry.load(Ordering::SeqCst).is_null())
            .ok_or(ParxError::TooManyNestedRuns(MAX_NESTED_RUNS))?;

        if let Some(installed) = state.installed.get_mut(&signal) {
            installed.users += 1;
        } else {
            let previous = install_handler(signal)?;
            state.installed.insert(signal, Installed { previous, users: 1 });
            tracing::debug!(signal = %signal, "Installed interrupt handler");
        }

        ACTIVE[slot].store(Arc::as_ptr(&resources).cast_mut(), Ordering::SeqCst);

        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Entry {
            id,
            slot,
            resources,
        });

        Ok(Registration { registry: self, id })
    }

    fn unregister(&self, id: u64) {
        let mut state = self.lock();
        let Some(position) = state.entries.iter().position(|entry| entry.id == id) else {
            return;
        };
        let entry = state.entries.remove(position);
        ACTIVE[entry.slot].store(ptr::null_mut(), Ordering::SeqCst);

        let signal = entry.resources.signal();
        // A handler that starts after the store above cannot see the set.
        if IN_FLIGHT.load(Ordering::SeqCst) == 0 {
            state.retired.clear();
        } else {
            state.retired.push(entry.resources);
        }

        let last_user = match state.installed.get_mut(&signal) {
            Some(installed) => {
                installed.users -= 1;
                installed.users == 0
            }
            None => false,
        };
        if last_user && let Some(installed) = state.installed.remove(&signal) {
            // SAFETY: restores the disposition that was in place before we
            // installed ours.
            match unsafe { signal::sigaction(signal, &installed.previous) } {
                Ok(_) => tracing::debug!(signal = %signal, "Restored previous interrupt handler"),
                Err(e) => tracing::warn!(signal = %signal, error = %e, "Failed to restore handler"),
            }
        }

        if state.entries.is_empty() {
            state.retired.clear();
        }
    }

    /// Number of currently registered runs.
    pub fn active_runs(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    fn retired_sets(&self) -> usize {
        self.lock().retired.len()
    }
}

fn install_handler(signal: Signal) -> Result<SigAction> {
    let action = SigAction::new(
        SigHandler::SigAction(on_interrupt),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: `on_interrupt` only performs async-signal-safe operations.
    let previous = unsafe { signal::sigaction(signal, &action) }?;

    let (handler, siginfo) = match previous.handler() {
        SigHandler::SigDfl => (DISPOSITION_DEFAULT, false),
        SigHandler::SigIgn => (DISPOSITION_IGNORE, false),
        SigHandler::Handler(f) => (f as usize, false),
        SigHandler::SigAction(f) => (f as usize, true),
    };
    let index = signal as usize;
    if index < SIGNAL_SLOTS {
        PREVIOUS_HANDLER[index].store(handler, Ordering::Release);
        PREVIOUS_SIGINFO[index].store(siginfo, Ordering::Release);
    }
    Ok(previous)
}

extern "C" fn on_interrupt(signo: c_int, info: *mut siginfo_t, context: *mut c_void) {
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    for entry in &ACTIVE {
        let set = entry.load(Ordering::SeqCst);
        if set.is_null() {
            continue;
        }
        // SAFETY: pointers in ACTIVE come from live `Arc<ResourceSet>`s that
        // the registry keeps alive (registered, or retired while IN_FLIGHT
        // is non-zero).
        let set = unsafe { &*set };
        if set.signal as c_int == signo {
            set.interrupted.store(true, Ordering::Release);
            set.kill_all();
        }
    }
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    forward(signo, info, context);
}

fn forward(signo: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let Ok(index) = usize::try_from(signo) else {
        return;
    };
    if index >= SIGNAL_SLOTS {
        return;
    }
    match PREVIOUS_HANDLER[index].load(Ordering::Acquire) {
        DISPOSITION_IGNORE => {}
        DISPOSITION_DEFAULT => {
            let Ok(signal) = Signal::try_from(signo) else {
                return;
            };
            let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            // SAFETY: resetting to the default disposition; the pending
            // raise then performs the platform default action once this
            // handler returns.
            unsafe {
                let _ = signal::sigaction(signal, &default);
            }
            let _ = signal::raise(signal);
        }
        address if PREVIOUS_SIGINFO[index].load(Ordering::Acquire) => {
            // SAFETY: the address was read from a `SigHandler::SigAction`
            // returned by sigaction.
            let handler = unsafe {
                std::mem::transmute::<usize, extern "C" fn(c_int, *mut siginfo_t, *mut c_void)>(
                    address,
                )
            };
            handler(signo, info, context);
        }
        address => {
            // SAFETY: the address was read from a `SigHandler::Handler`
            // returned by sigaction.
            let handler = unsafe { std::mem::transmute::<usize, extern "C" fn(c_int)>(address) };
            handler(signo);
        }
    }
}
