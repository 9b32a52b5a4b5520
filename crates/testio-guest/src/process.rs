//! Process Supervisor: spawn a child, wait for its fate, classify it.
//!
//! A child moves through [`ChildState`]:
//!
//! ```text
//! Running --wait--> Exited | Signaled          (the wait also reaped it)
//! Running --wait--> Stopped --SIGKILL+wait--> Reaped
//! ```
//!
//! No child is ever abandoned: a stopped child is killed and reaped before
//! [`Child::supervise`] returns, and dropping a [`Child`] that is still
//! running or stopped does the same.

use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use testio_proto::ProcessStatus;
use tracing::{debug, warn};

use crate::error::ProcessError;

/// Which state changes a wait reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Exit or fatal signal only. A stopped child keeps the wait blocked.
    Termination,
    /// Termination and job-control stops (`WUNTRACED`).
    StopAware,
}

impl WaitMode {
    fn flags(self) -> Option<WaitPidFlag> {
        match self {
            Self::Termination => None,
            Self::StopAware => Some(WaitPidFlag::WUNTRACED),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Exited(i32),
    Signaled(i32),
    Stopped(i32),
    Reaped,
}

/// A spawned child owned until it has been reaped.
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    state: ChildState,
}

impl Child {
    pub fn spawn(command: &mut Command) -> Result<Self, ProcessError> {
        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: command.get_program().to_string_lossy().into_owned(),
            source,
        })?;
        // Linux PIDs are < 2^22, the cast never wraps. The std handle is
        // dropped here: it neither waits nor kills, waiting is ours.
        let pid = Pid::from_raw(child.id() as i32);
        debug!(pid = pid.as_raw(), "spawned child");
        Ok(Self {
            pid,
            state: ChildState::Running,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    /// One blocking wait for the next state change `mode` reports.
    pub fn wait(&mut self, mode: WaitMode) -> Result<ChildState, ProcessError> {
        let status = loop {
            match waitpid(self.pid, mode.flags()) {
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(ProcessError::Wait {
                        pid: self.pid.as_raw(),
                        source,
                    });
                }
                Ok(status) => break status,
            }
        };
        self.state = match status {
            WaitStatus::Exited(_, code) => ChildState::Exited(code),
            // The core-dump flag is not reported.
            WaitStatus::Signaled(_, signal, _) => ChildState::Signaled(signal as i32),
            WaitStatus::Stopped(_, signal) => ChildState::Stopped(signal as i32),
            other => {
                return Err(ProcessError::UnexpectedStatus {
                    pid: self.pid.as_raw(),
                    status: format!("{other:?}"),
                });
            }
        };
        Ok(self.state)
    }

    fn kill_and_reap(&mut self) -> Result<(), ProcessError> {
        kill(self.pid, Signal::SIGKILL).map_err(|source| ProcessError::Kill {
            pid: self.pid.as_raw(),
            source,
        })?;
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(ProcessError::Wait {
                        pid: self.pid.as_raw(),
                        source,
                    });
                }
                Ok(_) => break,
            }
        }
        self.state = ChildState::Reaped;
        Ok(())
    }

    /// Wait for the child and classify what happened to it.
    ///
    /// A stopped child is killed and reaped before this returns; the
    /// reported status is still `Stopped` with the stopping signal.
    pub fn supervise(mut self, mode: WaitMode) -> Result<ProcessStatus, ProcessError> {
        match self.wait(mode)? {
            ChildState::Exited(code) => Ok(ProcessStatus::Exited { code }),
            ChildState::Signaled(signal) => Ok(ProcessStatus::Signaled { signal }),
            ChildState::Stopped(signal) => {
                warn!(pid = self.pid.as_raw(), signal, "child stopped, killing it");
                self.kill_and_reap()?;
                Ok(ProcessStatus::Stopped { signal })
            }
            state @ (ChildState::Running | ChildState::Reaped) => {
                Err(ProcessError::UnexpectedStatus {
                    pid: self.pid.as_raw(),
                    status: format!("{state:?}"),
                })
            }
        }
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if !matches!(self.state, ChildState::Running | ChildState::Stopped(_)) {
            return;
        }
        if let Err(e) = self.kill_and_reap() {
            warn!(pid = self.pid.as_raw(), error = %e, "cannot dispose of child");
        }
    }
}

/// Reap every already-terminated child without blocking.
///
/// As PID 1 we inherit orphans from the whole system. Only call this from
/// the thread that owns every [`Child`], between commands, so it cannot
/// steal a status a supervisor is waiting for.
pub fn reap_orphans() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => {
                debug!(?status, "reaped orphan");
                reaped += 1;
            }
        }
    }
    reaped
}
