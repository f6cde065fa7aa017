//! Executors: what a pool slot uses to run one item.
//!
//! A [`Workforce`] hires one [`Executor`] per pool slot, on the slot's own
//! thread. Thread executors call the callback in place. Process executors
//! own a worker process and forward each item over its pipes.

use super::proc::Proc;
use super::protocol::{Handshake, UNKNOWN_TASK_KIND, WorkRequest, WorkResponse};
use super::spawn::spawn_worker;
use crate::error::{ParxError, Result};
use crate::interrupt::ResourceSet;
use crate::options::WorkerConfig;
use crate::outcome::{ControlSignal, Halt, guarded};
use crate::source::WorkItem;
use crate::task::Task;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub(crate) trait Executor<T, R> {
    /// Run one item. `Err` is an infrastructure failure, never a user error.
    fn execute(&mut self, work: &WorkItem<T>) -> Result<ControlSignal<R>>;

    /// Release whatever the executor holds.
    fn close(&mut self) -> Result<()>;
}

pub(crate) trait Workforce<T, R>: Sync {
    type Executor: Executor<T, R>;

    fn hire(&self, worker_number: usize, resources: &Arc<ResourceSet>) -> Result<Self::Executor>;
}

/// Runs the callback on the pool thread itself.
pub(crate) struct ThreadWorkforce<'f, F> {
    callback: &'f F,
}

impl<'f, F> ThreadWorkforce<'f, F> {
    pub(crate) fn new(callback: &'f F) -> Self {
        Self { callback }
    }
}

pub(crate) struct ThreadExecutor<'f, F> {
    callback: &'f F,
}

impl<'f, T, R, F> Workforce<T, R> for ThreadWorkforce<'f, F>
where
    F: Fn(&T, usize) -> std::result::Result<R, Halt<R>> + Sync,
{
    type Executor = ThreadExecutor<'f, F>;

    fn hire(&self, _worker_number: usize, _resources: &Arc<ResourceSet>) -> Result<Self::Executor> {
        Ok(ThreadExecutor {
            callback: self.callback,
        })
    }
}

impl<T, R, F> Executor<T, R> for ThreadExecutor<'_, F>
where
    F: Fn(&T, usize) -> std::result::Result<R, Halt<R>> + Sync,
{
    fn execute(&mut self, work: &WorkItem<T>) -> Result<ControlSignal<R>> {
        Ok(guarded(|| (self.callback)(&work.item, work.index)))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// What every worker process of a run is started with.
struct ProcessPlan {
    state: Vec<u8>,
    config: WorkerConfig,
    isolation: bool,
    kill_timeout: Duration,
}

/// Runs a registered task in worker processes.
pub(crate) struct ProcessWorkforce<K> {
    plan: Arc<ProcessPlan>,
    task: PhantomData<fn() -> K>,
}

impl<K: Task> ProcessWorkforce<K> {
    pub(crate) fn new(
        task: &K,
        config: WorkerConfig,
        isolation: bool,
        kill_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            plan: Arc::new(ProcessPlan {
                state: bincode::serialize(task)?,
                config,
                isolation,
                kill_timeout,
            }),
            task: PhantomData,
        })
    }
}

impl<K: Task> Workforce<K::Item, K::Output> for ProcessWorkforce<K> {
    type Executor = ProcessExecutor<K>;

    fn hire(&self, worker_number: usize, resources: &Arc<ResourceSet>) -> Result<Self::Executor> {
        let mut executor = ProcessExecutor {
            plan: Arc::clone(&self.plan),
            worker_number,
            resources: Arc::clone(resources),
            proc: None,
            task: PhantomData,
        };
        if !self.plan.isolation {
            executor.proc = executor.start()?;
        }
        Ok(executor)
    }
}

/// One pool slot's worker process. With isolation, a fresh process is
/// started for every item and closed right after it.
pub(crate) struct ProcessExecutor<K> {
    plan: Arc<ProcessPlan>,
    worker_number: usize,
    resources: Arc<ResourceSet>,
    proc: Option<Proc>,
    task: PhantomData<fn() -> K>,
}

impl<K: Task> ProcessExecutor<K> {
    /// Spawn a worker and complete the handshake. Returns `None` when the
    /// run was killed before the worker could be tracked.
    fn start(&self) -> Result<Option<Proc>> {
        let mut proc = spawn_worker(&self.plan.config)?;
        proc.track(Arc::clone(&self.resources), self.worker_number);
        if self.resources.is_killed() {
            // The kill sweep may have run before `track`.
            proc.kill()?;
            return Ok(None);
        }

        proc.send(&Handshake {
            task: K::NAME.to_string(),
            state: self.plan.state.clone(),
            worker_number: self.worker_number,
        })?;

        match proc.recv::<WorkResponse<K::Output>>()? {
            WorkResponse::Ready => {
                tracing::debug!(
                    pid = proc.pid().as_raw(),
                    worker = self.worker_number,
                    task = K::NAME,
                    "Worker ready"
                );
                Ok(Some(proc))
            }
            WorkResponse::Error(err) => {
                let _ = proc.close(self.plan.kill_timeout);
                if err.kind() == UNKNOWN_TASK_KIND {
                    Err(ParxError::UnknownTask(K::NAME.to_string()))
                } else {
                    Err(ParxError::Handshake(err.to_string()))
                }
            }
            other => {
                let _ = proc.close(self.plan.kill_timeout);
                Err(ParxError::Handshake(format!(
                    "Expected ready, worker answered {}",
                    other.label()
                )))
            }
        }
    }
}

impl<K: Task> Executor<K::Item, K::Output> for ProcessExecutor<K> {
    fn execute(&mut self, work: &WorkItem<K::Item>) -> Result<ControlSignal<K::Output>> {
        // Taken out while in use; a failed exchange drops (and kills) it.
        let proc = match self.proc.take() {
            Some(proc) => Some(proc),
            None => self.start()?,
        };
        let Some(mut proc) = proc else {
            return Ok(ControlSignal::Kill);
        };

        tracing::trace!(
            pid = proc.pid().as_raw(),
            index = work.index,
            "Sending item to worker"
        );
        proc.send(&WorkRequest::Item {
            index: work.index,
            item: &work.item,
        })?;
        let response = proc.recv::<WorkResponse<K::Output>>()?;
        tracing::trace!(
            pid = proc.pid().as_raw(),
            index = work.index,
            response = response.label(),
            "Worker answered"
        );

        let signal = response.into_signal().ok_or_else(|| {
            ParxError::Handshake("Worker answered ready in place of a result".to_string())
        })?;

        if self.plan.isolation {
            proc.close(self.plan.kill_timeout)?;
        } else {
            self.proc = Some(proc);
        }
        Ok(signal)
    }

    fn close(&mut self) -> Result<()> {
        match self.proc.take() {
            Some(mut proc) => proc.close(self.plan.kill_timeout),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use std::time::Instant;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Nothing;

    impl Task for Nothing {
        const NAME: &'static str = "test.nothing";
        type Item = ();
        type Output = ();
        fn call(&self, _: &(), _: usize) -> std::result::Result<(), Halt<()>> {
            Ok(())
        }
    }

    #[test]
    fn test_thread_executor_runs_callback() {
        let callback = |item: &i32, index: usize| -> std::result::Result<i32, Halt<i32>> {
            match item {
                0 => Err(Halt::Kill),
                _ => Ok(item * 100 + index as i32),
            }
        };
        let workforce = ThreadWorkforce::new(&callback);
        let resources = ResourceSet::new(Signal::SIGINT, 1);
        let mut executor = Workforce::<i32, i32>::hire(&workforce, 0, &resources).unwrap();

        let signal = executor
            .execute(&WorkItem { item: 3, index: 1 })
            .unwrap();
        assert!(matches!(signal, ControlSignal::Value(301)));

        let signal = executor
            .execute(&WorkItem { item: 0, index: 2 })
            .unwrap();
        assert!(matches!(signal, ControlSignal::Kill));
        executor.close().unwrap();
    }

    #[test]
    fn test_missing_worker_program_fails_hire() {
        let config = WorkerConfig::new().with_program("/nonexistent/parx-worker");
        let workforce =
            ProcessWorkforce::new(&Nothing, config, false, Duration::from_secs(1)).unwrap();
        let resources = ResourceSet::new(Signal::SIGINT, 1);
        assert!(matches!(
            Workforce::<(), ()>::hire(&workforce, 0, &resources),
            Err(ParxError::Spawn(_))
        ));
    }

    #[test]
    fn test_worker_started_after_kill_is_not_used() {
        // `sleep` never answers a handshake; reaching one would hang.
        let config = WorkerConfig::new().with_program("sleep").with_arg("30");
        let workforce =
            ProcessWorkforce::new(&Nothing, config, true, Duration::from_secs(1)).unwrap();
        let resources = ResourceSet::new(Signal::SIGINT, 1);
        resources.kill_all();

        let started = Instant::now();
        let mut executor = Workforce::<(), ()>::hire(&workforce, 0, &resources).unwrap();
        let signal = executor.execute(&WorkItem { item: (), index: 0 }).unwrap();
        assert!(matches!(signal, ControlSignal::Kill));
        executor.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
