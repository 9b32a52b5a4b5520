//! PID 1 responsibilities: signal dispositions and orphan reaping.
//!
//! Orphans are reaped by the session between commands (see
//! `testio_guest::process::reap_orphans`), on the same thread as the
//! supervisor's own blocking waits, so the two never race for a status.
//!
//! SIGCHLD stays at SIG_DFL: ignoring it would make the kernel auto-reap
//! children and the supervisor's waitpid() would fail with ECHILD.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::{Pid, getpid};

use crate::error::InitError;

/// Whether we are the init process of this PID namespace.
pub fn is_pid1() -> bool {
    getpid() == Pid::from_raw(1)
}

/// Setup signal dispositions for PID 1 operation.
///
/// - SIGPIPE: Ignore so a vanished harness shows up as a write error on the
///   channel (fatal through the normal path) rather than killing init
pub fn setup_signal_handlers() -> Result<(), InitError> {
    ignore(Signal::SIGPIPE)
}

fn ignore(signal: Signal) -> Result<(), InitError> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: SIG_IGN installs no handler code.
    unsafe { sigaction(signal, &action) }
        .map(drop)
        .map_err(|source| InitError::Signal { signal, source })
}
