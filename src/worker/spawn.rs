//! Worker subprocess spawning.
//!
//! Workers are separate executions of a worker program (by default the
//! current executable), not forks of the running process. Requests and
//! responses travel over two dedicated pipes whose child-side descriptor
//! numbers are passed in [`WORKER_FDS_ENV`], so the worker's stdout and
//! stderr stay free for the task itself.

use super::ipc::PipeFd;
use super::proc::Proc;
use crate::error::{ParxError, Result};
use crate::options::WorkerConfig;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::Pid;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// Environment variable that turns a program into a worker:
/// `<request read fd>,<response write fd>`.
pub const WORKER_FDS_ENV: &str = "PARX_WORKER_FDS";

/// Create a pipe whose both ends are close-on-exec.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?)
}

/// Create a pipe whose both ends are close-on-exec.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    fcntl(&read, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(&write, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok((read, write))
}

/// Let `fd` survive exec. Runs in the forked child, before exec.
fn inherit_across_exec(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is open in the child; it was duplicated by fork.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

/// Parse the value of [`WORKER_FDS_ENV`].
pub fn parse_worker_fds(value: &str) -> Option<(RawFd, RawFd)> {
    let (read, write) = value.split_once(',')?;
    let read = read.trim().parse().ok()?;
    let write = write.trim().parse().ok()?;
    (read >= 0 && write >= 0).then_some((read, write))
}

/// Spawn a worker subprocess.
///
/// The child sees its ends of the two pipes and nothing else we opened;
/// stdin is `/dev/null`, stdout and stderr are inherited. It leads a new
/// process group, which the commands it starts join, so killing the group
/// leaves nothing of the worker behind.
pub fn spawn_worker(config: &WorkerConfig) -> Result<Proc> {
    let program = config.program()?;

    let (request_read, request_write) = pipe_cloexec()?;
    let (response_read, response_write) = pipe_cloexec()?;
    let child_read = request_read.as_raw_fd();
    let child_write = response_write.as_raw_fd();

    let mut cmd = Command::new(&program);
    cmd.args(config.args());
    for (key, value) in config.env() {
        cmd.env(key, value);
    }
    cmd.env(WORKER_FDS_ENV, format!("{},{}", child_read, child_write));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    cmd.process_group(0);

    // SAFETY: the closure only calls fcntl, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            inherit_across_exec(child_read)?;
            inherit_across_exec(child_write)
        });
    }

    let child = cmd.spawn().map_err(|e| {
        ParxError::Spawn(format!(
            "Failed to spawn worker {}: {}",
            program.display(),
            e
        ))
    })?;

    // The child holds its own copies now.
    drop(request_read);
    drop(response_write);

    let pid = Pid::from_raw(child.id() as i32);
    tracing::debug!(pid = child.id(), program = %program.display(), "Spawned worker");

    Ok(Proc::new(
        pid,
        PipeFd::new(request_write),
        PipeFd::new(response_read),
    ))
}
