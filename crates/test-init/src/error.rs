use nix::sys::signal::Signal;
use testio_guest::{GuestError, TransportError};

use crate::bootstrap::BootstrapError;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] GuestError),

    #[error("cannot set disposition of {signal}: {source}")]
    Signal { signal: Signal, source: nix::Error },
}
