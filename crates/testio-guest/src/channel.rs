//! Transport provider: the byte streams the session talks over.
//!
//! Either an exclusive, raw-mode serial device under `/dev` or the process's
//! own standard streams.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::Stdio;

use nix::sys::termios::{SetArg, cfmakeraw, tcgetattr, tcsetattr};
use tracing::info;

use crate::error::TransportError;

nix::ioctl_none_bad!(tiocexcl, libc::TIOCEXCL);

/// How an interactive shell is wired to the channel.
#[derive(Debug)]
pub enum Attach {
    /// The shell inherits the process's standard streams.
    Inherit,
    /// stdin, stdout and stderr all point at `/dev/null`.
    Null,
    /// stdin, stdout and stderr are duplicates of this descriptor.
    Descriptor(OwnedFd),
}

impl Attach {
    /// A fresh `Stdio` for one of the shell's standard streams.
    pub fn stdio(&self) -> Result<Stdio, TransportError> {
        match self {
            Self::Inherit => Ok(Stdio::inherit()),
            Self::Null => Ok(Stdio::null()),
            Self::Descriptor(fd) => fd
                .try_clone()
                .map(Stdio::from)
                .map_err(TransportError::Duplicate),
        }
    }
}

/// The session's endpoint pair.
pub struct Channel {
    pub input: Box<dyn BufRead>,
    pub output: Box<dyn Write>,
    pub attach: Attach,
}

impl Channel {
    /// Standard input and output; children inherit them as they are.
    ///
    /// Input is read from a duplicate of descriptor 0 rather than through
    /// `io::stdin()`, whose buffer would swallow bytes meant for a shell.
    pub fn stdio() -> Result<Self, TransportError> {
        Self::inheriting(io::stdin().as_fd())
    }

    fn inheriting(input: BorrowedFd<'_>) -> Result<Self, TransportError> {
        let input = input
            .try_clone_to_owned()
            .map_err(TransportError::Duplicate)?;
        Ok(Self {
            input: line_reader(File::from(input)),
            output: Box::new(io::stdout().lock()),
            attach: Attach::Inherit,
        })
    }

    /// Open `/dev/<name>`, claim it exclusively and switch it to raw mode.
    pub fn open_device(name: &str) -> Result<Self, TransportError> {
        let path = Path::new("/dev").join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_SYNC)
            .open(&path)
            .map_err(|source| TransportError::Open {
                path: path.clone(),
                source,
            })?;

        // Keep stray openers (a test poking at serial ports, a getty) off
        // the test-I/O line.
        // SAFETY: `file` owns an open descriptor for the duration of the call.
        unsafe { tiocexcl(file.as_raw_fd()) }.map_err(TransportError::Exclusive)?;

        let mut termios = tcgetattr(&file).map_err(TransportError::GetAttr)?;
        cfmakeraw(&mut termios);
        tcsetattr(&file, SetArg::TCSANOW, &termios).map_err(TransportError::SetAttr)?;
        info!(device = %path.display(), "opened test I/O serial port");

        Self::from_file(file)
    }

    /// Use an already open, bidirectional file as the channel.
    ///
    /// Input is read without read-ahead, as for [`Channel::stdio`].
    pub fn from_file(file: File) -> Result<Self, TransportError> {
        let reader = file.try_clone().map_err(TransportError::Duplicate)?;
        let attach = OwnedFd::from(file.try_clone().map_err(TransportError::Duplicate)?);
        Ok(Self {
            input: line_reader(reader),
            output: Box::new(file),
            attach: Attach::Descriptor(attach),
        })
    }
}

/// Input through a one-byte buffer: nothing past the current line is
/// consumed early, so a child sharing the descriptor sees every byte the
/// session has not read. Large payload reads bypass the buffer.
fn line_reader(file: File) -> Box<dyn BufRead> {
    Box::new(BufReader::with_capacity(1, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn null_attach_yields_stdio() {
        assert!(Attach::Null.stdio().is_ok());
        assert!(Attach::Inherit.stdio().is_ok());
    }

    #[test]
    fn descriptor_attach_duplicates() {
        let file = tempfile::tempfile().unwrap();
        let attach = Attach::Descriptor(OwnedFd::from(file));
        // Three streams, three independent duplicates.
        for _ in 0..3 {
            assert!(attach.stdio().is_ok());
        }
    }

    #[test]
    fn from_file_reads_without_read_ahead() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"ping\nrest").unwrap();
        let mut rewound = file.try_clone().unwrap();
        io::Seek::rewind(&mut rewound).unwrap();

        let mut channel = Channel::from_file(file).unwrap();
        let mut line = Vec::new();
        channel.input.read_until(b'\n', &mut line).unwrap();
        assert_eq!(line, b"ping\n");

        // The shared file offset sits right after the line.
        let mut rest = String::new();
        rewound.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "rest");
    }

    #[test]
    fn stdio_input_leaves_shell_bytes_unread() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shell\necho from-shell\nexit\n").unwrap();
        io::Seek::rewind(&mut file).unwrap();

        let mut channel = Channel::inheriting(file.as_fd()).unwrap();
        assert!(matches!(channel.attach, Attach::Inherit));
        let mut line = Vec::new();
        channel.input.read_until(b'\n', &mut line).unwrap();
        assert_eq!(line, b"shell\n");

        // Whatever inherits descriptor 0 next reads the shell's input.
        let mut rest = String::new();
        file.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "echo from-shell\nexit\n");
    }

    #[test]
    fn open_device_reports_missing_device() {
        let err = Channel::open_device("testio-does-not-exist").err().unwrap();
        assert!(matches!(err, TransportError::Open { .. }));
    }
}
