//! Shell command jobs, the task behind the `parx` binary.

use crate::context;
use crate::interrupt::kill_tree;
use crate::outcome::{Halt, UserError};
use crate::task::Task;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

/// Placeholder replaced by the (quoted) item.
pub const PLACEHOLDER: &str = "{}";

/// How often a running job checks whether the run was killed.
const KILL_POLL: Duration = Duration::from_millis(10);

/// Runs a command template through a shell, once per item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellTask {
    template: String,
    shell: String,
    capture: bool,
    halt_on_exit: Option<i32>,
    kill_on_exit: Option<i32>,
}

/// What one job did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub index: usize,
    pub item: String,
    /// Exit code; `None` when the job was killed by a signal.
    pub status: Option<i32>,
    /// Captured stdout; empty unless capturing.
    pub stdout: String,
}

/// A job exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("Job {index} {}: {command}", describe_status(.status))]
pub struct JobFailed {
    pub index: usize,
    pub command: String,
    pub status: Option<i32>,
}

fn describe_status(status: &Option<i32>) -> String {
    match *status {
        Some(code) => format!("exited with code {}", code),
        None => "was killed by a signal".to_string(),
    }
}

/// Quote `value` for a POSIX shell, leaving harmless words alone.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

impl ShellTask {
    /// A task running `template` with `shell -c`. The words of `template`
    /// are joined with spaces.
    pub fn new<S: AsRef<str>>(template: &[S], shell: impl Into<String>) -> Self {
        let template = template
            .iter()
            .map(|word| word.as_ref())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            template,
            shell: shell.into(),
            capture: false,
            halt_on_exit: None,
            kill_on_exit: None,
        }
    }

    /// Capture each job's stdout instead of letting it through.
    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// A job exiting with `code` breaks the run.
    pub fn with_halt_on_exit(mut self, code: Option<i32>) -> Self {
        self.halt_on_exit = code;
        self
    }

    /// A job exiting with `code` kills the run.
    pub fn with_kill_on_exit(mut self, code: Option<i32>) -> Self {
        self.kill_on_exit = code;
        self
    }

    pub fn captures(&self) -> bool {
        self.capture
    }

    /// The command line for `item`.
    pub fn render(&self, item: &str) -> String {
        let quoted = shell_quote(item);
        if self.template.contains(PLACEHOLDER) {
            self.template.replace(PLACEHOLDER, &quoted)
        } else {
            format!("{} {}", self.template, quoted)
        }
    }

    /// Start the shell. In a pooled thread the job leads its own process
    /// group, tracked by the run; inside a worker process it stays in the
    /// worker's group.
    fn spawn(&self, command: &str) -> std::io::Result<Job> {
        let stdout = if self.capture {
            Stdio::piped()
        } else {
            Stdio::inherit()
        };
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::inherit());
        let grouped = context::tracks_jobs();
        if grouped {
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        if grouped {
            context::track_job(Pid::from_raw(child.id() as i32));
        }
        Ok(Job { child, grouped })
    }
}

/// A running shell.
struct Job {
    child: Child,
    grouped: bool,
}

impl Job {
    fn kill(&mut self) {
        if self.grouped {
            let _ = kill_tree(Pid::from_raw(self.child.id() as i32));
        } else {
            let _ = self.child.kill();
        }
    }

    /// Wait for the job, killing it if the run gets killed first.
    /// Returns `None` when the job was cut short.
    fn wait_killable(&mut self) -> std::io::Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                // The run's kill sweep may have got to it first.
                if status.code().is_none() && context::killed() {
                    return Ok(None);
                }
                return Ok(Some(status));
            }
            if context::killed() {
                self.kill();
                self.child.wait()?;
                return Ok(None);
            }
            std::thread::sleep(KILL_POLL);
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.grouped {
            context::untrack_job();
        }
    }
}

impl Task for ShellTask {
    const NAME: &'static str = "parx.shell";
    type Item = String;
    type Output = JobOutput;

    fn call(&self, item: &String, index: usize) -> Result<JobOutput, Halt<JobOutput>> {
        let command = self.render(item);
        tracing::trace!(index, command = %command, "Starting job");

        let mut job = self.spawn(&command)?;
        let reader = job.child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).map(|_| buf)
            })
        });

        let status = job.wait_killable()?;
        drop(job);
        let stdout = match reader.map(|handle| handle.join()) {
            Some(Ok(read)) => String::from_utf8_lossy(&read?).into_owned(),
            Some(Err(_)) => {
                return Err(Halt::Error(UserError::from_message(
                    "parx::Capture",
                    "stdout reader panicked",
                )));
            }
            None => String::new(),
        };

        let Some(status) = status else {
            return Err(Halt::Kill);
        };

        let code = status.code();
        let job = JobOutput {
            index,
            item: item.clone(),
            status: code,
            stdout,
        };
        match code {
            Some(0) => Ok(job),
            Some(code) if Some(code) == self.halt_on_exit => Err(Halt::stop_with(job)),
            Some(code) if Some(code) == self.kill_on_exit => Err(Halt::Kill),
            _ => Err(Halt::Error(UserError::dumpable(JobFailed {
                index,
                command,
                status: code,
            }))),
        }
    }
}
