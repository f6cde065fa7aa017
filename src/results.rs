//! Instrumentation and result accumulation.
//!
//! `start`, `finish` and progress events are serialized under one lock, so
//! hooks observing shared state never run concurrently. Values land in a
//! dense table indexed by item index, under a second lock.

use crate::options::{FinishHook, Options, StartHook};
use crate::outcome::UserError;
use crate::progress::ProgressSink;
use crate::source::WorkItem;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};

/// Completed items waiting for their turn in `finish_in_order` mode.
struct Reorder<T, R> {
    next: usize,
    pending: BTreeMap<usize, (T, R)>,
}

struct Hooks<'a, T, R> {
    progress: Option<Box<dyn ProgressSink + 'a>>,
    reorder: Option<Reorder<T, R>>,
}

pub(crate) struct Accumulator<'a, T, R> {
    start: Option<StartHook<'a, T>>,
    finish: Option<FinishHook<'a, T, R>>,
    preserve_results: bool,
    hooks: Mutex<Hooks<'a, T, R>>,
    table: Mutex<Vec<Option<R>>>,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn call_hook(hook: impl FnOnce() -> anyhow::Result<()>) -> Result<(), UserError> {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(UserError::from_anyhow(err)),
        Err(payload) => Err(UserError::from_panic(payload)),
    }
}

impl<'a, T, R> Accumulator<'a, T, R> {
    /// Take the instrumentation parts out of `options`. `size` presizes the
    /// result table when the source length is known.
    pub(crate) fn new(options: &mut Options<'a, T, R>, size: Option<usize>) -> Self {
        let preserve_results = options.preserve_results;
        let table = match (preserve_results, size) {
            (true, Some(size)) => Vec::with_capacity(size),
            _ => Vec::new(),
        };
        Self {
            start: options.start.take(),
            finish: options.finish.take(),
            preserve_results,
            hooks: Mutex::new(Hooks {
                progress: options.progress.take(),
                reorder: options.finish_in_order.then(|| Reorder {
                    next: 0,
                    pending: BTreeMap::new(),
                }),
            }),
            table: Mutex::new(table),
        }
    }

    /// Announce the total to the progress sink, if any.
    pub(crate) fn begin(&self, total: usize) {
        if let Some(progress) = lock(&self.hooks).progress.as_mut() {
            progress.begin(total);
        }
    }

    pub(crate) fn end(&self) {
        if let Some(progress) = lock(&self.hooks).progress.as_mut() {
            progress.end();
        }
    }

    /// Run the `start` hook for a dispatched item.
    pub(crate) fn started(&self, item: &T, index: usize) -> Result<(), UserError> {
        let Some(start) = &self.start else {
            return Ok(());
        };
        let _hooks = lock(&self.hooks);
        call_hook(|| start(item, index))
    }

    /// Record a completed item: run `finish` (now, or once every earlier
    /// index finished when delivering in order), then store the value.
    pub(crate) fn completed(&self, work: WorkItem<T>, value: R) -> Result<(), UserError> {
        let mut hooks = lock(&self.hooks);
        let Hooks { progress, reorder } = &mut *hooks;

        let Some(reorder) = reorder else {
            return self.deliver(progress, work.item, work.index, value);
        };

        reorder.pending.insert(work.index, (work.item, value));
        while let Some(entry) = reorder.pending.first_entry() {
            if *entry.key() != reorder.next {
                break;
            }
            let (item, value) = entry.remove();
            let index = reorder.next;
            reorder.next += 1;
            self.deliver(progress, item, index, value)?;
        }
        Ok(())
    }

    /// Deliver whatever is still buffered, in index order, skipping the
    /// gaps left by items that never completed. Used when a run stops early.
    pub(crate) fn release_pending(&self) -> Result<(), UserError> {
        let mut hooks = lock(&self.hooks);
        let Hooks { progress, reorder } = &mut *hooks;
        let Some(reorder) = reorder else {
            return Ok(());
        };
        while let Some((index, (item, value))) = reorder.pending.pop_first() {
            reorder.next = index + 1;
            self.deliver(progress, item, index, value)?;
        }
        Ok(())
    }

    fn deliver(
        &self,
        progress: &mut Option<Box<dyn ProgressSink + 'a>>,
        item: T,
        index: usize,
        value: R,
    ) -> Result<(), UserError> {
        if let Some(finish) = &self.finish {
            call_hook(|| finish(&item, index, &value))?;
        }
        if let Some(progress) = progress.as_mut() {
            progress.advance(index);
        }
        if self.preserve_results {
            let mut table = lock(&self.table);
            if table.len() <= index {
                table.resize_with(index + 1, || None);
            }
            debug_assert!(table[index].is_none(), "result slot {index} written twice");
            table[index] = Some(value);
        }
        Ok(())
    }

    /// The stored values in index order.
    pub(crate) fn into_results(self) -> Vec<R> {
        let table = match self.table.into_inner() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.into_iter().flatten().collect()
    }
}
