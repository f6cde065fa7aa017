//! Worker subprocess main entry point.
//!
//! A program becomes a worker when it is started with
//! [`WORKER_FDS_ENV`](super::spawn::WORKER_FDS_ENV) set. It then reads a
//! handshake naming a registered task, answers `Ready`, and runs the task
//! on every item it is sent until the parent closes the request pipe.

use super::ipc::{FrameReader, FrameWriter, PipeFd};
use super::protocol::{BAD_STATE_KIND, Handshake, UNKNOWN_TASK_KIND, WorkRequest, WorkResponse};
use super::spawn::{WORKER_FDS_ENV, parse_worker_fds};
use crate::context;
use crate::error::{ParxError, Result};
use crate::outcome::{UNDUMPABLE_KIND, UserError, guarded};
use crate::task::{Task, TaskRegistry};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use serde::Serialize;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Serve as a worker if this process was started as one; otherwise return
/// immediately. Call it first thing in `main`, before parsing arguments.
pub fn serve_if_worker(registry: &TaskRegistry) {
    let Some(fds) = std::env::var(WORKER_FDS_ENV).ok() else {
        return;
    };
    run_worker_main(registry, &fds)
}

/// Run the worker subprocess main function.
///
/// Never returns: exits with 0 once the parent is done with us, 1 on a
/// protocol failure.
pub fn run_worker_main(registry: &TaskRegistry, fds: &str) -> ! {
    // SAFETY: called at startup of a worker process, before any thread is
    // spawned. Commands started by tasks must not mistake themselves for
    // workers.
    unsafe {
        std::env::remove_var(WORKER_FDS_ENV);
    }

    // Ignore SIGPIPE - we handle pipe errors via io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let Some((read_fd, write_fd)) = parse_worker_fds(fds) else {
        eprintln!("parx worker: malformed {}={:?}", WORKER_FDS_ENV, fds);
        std::process::exit(1);
    };

    // SAFETY: the parent passed us these descriptors and nobody else in
    // this process owns them.
    let claimed = unsafe { (claim_inherited(read_fd), claim_inherited(write_fd)) };
    let (read, write) = match claimed {
        (Ok(read), Ok(write)) => (read, write),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("parx worker: cannot take over {}: {}", fds, e);
            std::process::exit(1);
        }
    };
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);

    match worker_loop(registry, &mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("parx worker: {}", e);
            std::process::exit(1);
        }
    }
}

/// Own an inherited pipe end and mark it close-on-exec again, so commands
/// started by the task neither hold it open nor write into it.
///
/// # Safety
/// `fd` must be open and not owned by anything else in this process.
unsafe fn claim_inherited(fd: RawFd) -> Result<PipeFd> {
    let pipe = unsafe { PipeFd::from_raw(fd) };
    fcntl(&pipe, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(pipe)
}

/// Handshake, then hand the connection to the registered task.
fn worker_loop(
    registry: &TaskRegistry,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
) -> Result<()> {
    let Some(handshake) = reader.recv::<Handshake>()? else {
        // Parent went away before telling us anything.
        return Ok(());
    };

    let Some(serve) = registry.get(&handshake.task) else {
        let known: Vec<_> = registry.names().collect();
        let refusal = UserError::from_message(
            UNKNOWN_TASK_KIND,
            format!("'{}' (registered: {})", handshake.task, known.join(", ")),
        );
        writer.send(&WorkResponse::<()>::Error(refusal))?;
        return Err(ParxError::UnknownTask(handshake.task));
    };

    serve(&handshake, reader, writer)
}

/// Serve items for task `K` until the parent closes the request pipe.
pub(crate) fn serve<K: Task>(
    handshake: &Handshake,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
) -> Result<()> {
    let task: K = match bincode::deserialize(&handshake.state) {
        Ok(task) => task,
        Err(e) => {
            let refusal = UserError::from_message(BAD_STATE_KIND, e.to_string());
            writer.send(&WorkResponse::<K::Output>::Error(refusal))?;
            return Err(ParxError::Handshake(format!(
                "Cannot decode state of task '{}': {}",
                K::NAME,
                e
            )));
        }
    };

    let _context = context::enter(handshake.worker_number, Arc::new(AtomicBool::new(false)));
    writer.send(&WorkResponse::<K::Output>::Ready)?;

    while let Some(request) = reader.recv::<WorkRequest<K::Item>>()? {
        match request {
            WorkRequest::Exit => break,
            WorkRequest::Item { index, item } => {
                let signal = guarded(|| task.call(&item, index));
                respond::<K::Output>(writer, signal.into())?;
            }
        }
    }
    Ok(())
}

/// Send `response`, replacing it with an undumpable error if it cannot be
/// encoded.
fn respond<R: Serialize>(writer: &mut FrameWriter, response: WorkResponse<R>) -> Result<()> {
    match writer.send(&response) {
        Err(ParxError::Codec(err)) => {
            let fallback = UserError::from_message(
                UNDUMPABLE_KIND,
                format!(
                    "{} result of type {} could not be encoded: {}",
                    response.label(),
                    std::any::type_name::<R>(),
                    err
                ),
            );
            writer.send(&WorkResponse::<R>::Error(fallback))
        }
        other => other,
    }
}
