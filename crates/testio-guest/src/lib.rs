//! Guest side of the test-I/O protocol.
//!
//! A [`Session`] owns the channel (a serial device or the standard streams),
//! writes the boot beacon and then answers one command per line until the
//! harness sends `exit`. Children started by `system` and `shell` are
//! supervised until reaped before the reply goes out.
//!
//! Wire format and command grammar live in the `testio-proto` crate.

pub mod channel;
pub mod error;
mod handlers;
pub mod process;
pub mod session;

pub use channel::{Attach, Channel};
pub use error::{GuestError, ProcessError, TransportError};
pub use session::{DEFAULT_SHELL, Flow, Session};
