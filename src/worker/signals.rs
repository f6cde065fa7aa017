//! Why a worker process ended.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// How a reaped (or not yet reaped) worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled { signal: Signal, core_dumped: bool },
    /// `WNOHANG` wait found it still running.
    StillAlive,
    /// Stopped, continued, or otherwise not a termination.
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        *self == Self::Exited(0)
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, core_dumped) => Self::Signaled {
                signal,
                core_dumped,
            },
            WaitStatus::StillAlive => Self::StillAlive,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled {
                signal,
                core_dumped,
            } => {
                write!(f, "killed by signal {}", signal)?;
                if *core_dumped {
                    f.write_str(" (core dumped)")?;
                }
                Ok(())
            }
            Self::StillAlive => f.write_str("still running"),
            Self::Unknown => f.write_str("ended for an unknown reason"),
        }
    }
}
