use std::io;
use std::path::PathBuf;

use testio_proto::ProtocolError;

/// Any failure of the session. All of them are fatal for the init process.
#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("cannot read command: {0}")]
    ReadCommand(#[source] io::Error),

    #[error("cannot read command: end of stream")]
    EndOfStream,

    #[error("cannot write reply: {0}")]
    WriteReply(#[source] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("cannot open file {}: {source}", path.display())]
    CreateFile { path: PathBuf, source: io::Error },

    #[error("cannot read file payload: {0}")]
    ReadPayload(#[source] io::Error),

    #[error("cannot write file payload to {}: {source}", path.display())]
    WritePayload { path: PathBuf, source: io::Error },

    #[error("cannot write everything (expected {expected} bytes, stream ended after {transferred})")]
    ShortTransfer { expected: u64, transferred: u64 },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Process Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("cannot spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("cannot wait for child process {pid}: {source}")]
    Wait { pid: i32, source: nix::Error },

    #[error("cannot kill stopped child process {pid}: {source}")]
    Kill { pid: i32, source: nix::Error },

    #[error("unexpected wait status for child process {pid}: {status}")]
    UnexpectedStatus { pid: i32, status: String },
}

/// Test-I/O transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot open serial port {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("cannot enable exclusive access mode on serial port: {0}")]
    Exclusive(#[source] nix::Error),

    #[error("cannot get serial port settings: {0}")]
    GetAttr(#[source] nix::Error),

    #[error("cannot set serial port settings: {0}")]
    SetAttr(#[source] nix::Error),

    #[error("cannot duplicate channel descriptor: {0}")]
    Duplicate(#[source] io::Error),
}
