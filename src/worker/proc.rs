//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its request and response pipes. A `Proc` is
//! owned by exactly one supervisor thread; nothing else touches its pipes.

use super::ipc::{FrameReader, FrameWriter, PipeFd, is_disconnect};
use super::signals::TerminationReason;
use crate::error::{ParxError, Result};
use crate::interrupt::{ResourceSet, kill_tree};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval while waiting for a worker to exit.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// How long a worker whose pipe broke gets to finish dying before we kill it.
const DEATH_GRACE: Duration = Duration::from_millis(500);

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    /// Request pipe; `None` once closed.
    writer: Option<FrameWriter>,
    reader: FrameReader,
    /// Whether the process has been reaped
    reaped: bool,
    tracker: Option<(Arc<ResourceSet>, usize)>,
}

impl Proc {
    /// Create a new process handle from its components.
    ///
    /// # Arguments
    /// * `pid` - The process ID
    /// * `requests` - Writing end of the worker's request pipe
    /// * `responses` - Reading end of the worker's response pipe
    pub fn new(pid: Pid, requests: PipeFd, responses: PipeFd) -> Self {
        Self {
            pid,
            writer: Some(FrameWriter::new(requests)),
            reader: FrameReader::new(responses),
            reaped: false,
            tracker: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Make the process killable through `resources` (slot `slot`) until it
    /// is reaped.
    pub fn track(&mut self, resources: Arc<ResourceSet>, slot: usize) {
        resources.track(slot, self.pid);
        self.tracker = Some((resources, slot));
    }

    fn untrack(&mut self) {
        if let Some((resources, slot)) = self.tracker.take() {
            resources.untrack(slot);
        }
    }

    /// Send a message to the worker.
    pub fn send<M: Serialize + ?Sized>(&mut self, message: &M) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(self.dead());
        };
        match writer.send(message) {
            Ok(()) => Ok(()),
            Err(ParxError::Io(err)) if is_disconnect(&err) => Err(self.dead()),
            Err(err) => Err(err),
        }
    }

    /// Receive a message from the worker. End-of-stream means the worker
    /// died and is reported as [`ParxError::DeadWorker`].
    pub fn recv<M: DeserializeOwned>(&mut self) -> Result<M> {
        match self.reader.recv() {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(self.dead()),
            Err(ParxError::Io(err)) if is_disconnect(&err) => Err(self.dead()),
            Err(ParxError::Codec(err)) if codec_hit_eof(&err) => Err(self.dead()),
            Err(err) => Err(err),
        }
    }

    /// Reap a worker whose pipe broke and describe how it ended.
    fn dead(&mut self) -> ParxError {
        let reason = match self.wait_timeout(DEATH_GRACE) {
            Ok(Some(status)) => TerminationReason::from(status),
            Ok(None) => {
                let _ = self.kill();
                TerminationReason::Unknown
            }
            Err(_) => TerminationReason::Unknown,
        };
        tracing::warn!(pid = self.pid.as_raw(), reason = %reason, "Worker died");
        ParxError::DeadWorker {
            pid: self.pid.as_raw(),
            reason: reason.to_string(),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(nix::errno::Errno::ECHILD.into());
        }
        self.untrack();
        let status = waitpid(self.pid, None)?;
        self.reaped = true;
        Ok(status)
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(nix::errno::Errno::ECHILD.into());
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.untrack();
                self.reaped = true;
                Ok(Some(status))
            }
        }
    }

    /// Poll for exit until `timeout` elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<WaitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Send SIGKILL to the process, and to the jobs in its process group,
    /// and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        self.untrack();
        kill_tree(self.pid)?;
        self.wait()?;
        Ok(())
    }

    /// Gracefully stop the worker: send exit, close the request pipe, wait
    /// up to `timeout`, then kill if needed.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.send(&super::protocol::WorkRequest::<()>::Exit);
        }

        match self.wait_timeout(timeout)? {
            Some(status) => {
                let reason = TerminationReason::from(status);
                if reason.is_success() {
                    tracing::debug!(pid = self.pid.as_raw(), "Worker stopped");
                } else {
                    tracing::warn!(pid = self.pid.as_raw(), reason = %reason, "Worker stopped abnormally");
                }
                Ok(())
            }
            None => {
                tracing::warn!(
                    pid = self.pid.as_raw(),
                    "Worker did not exit in {:?}, killing it",
                    timeout
                );
                self.kill()
            }
        }
    }
}

fn codec_hit_eof(err: &bincode::Error) -> bool {
    matches!(&**err, bincode::ErrorKind::Io(io) if is_disconnect(io))
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            self.untrack();
            let _ = kill_tree(self.pid);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}
