//! Per-command handlers. Each returns the reply for its command.

use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::Command;

use testio_proto::{Reply, WRITE_CHUNK_SIZE, WriteArgs};
use tracing::{debug, info};

use crate::channel::Attach;
use crate::error::GuestError;
use crate::process::{Child, WaitMode};

/// Interpreter for `system` command text.
const SYSTEM_SHELL: &str = "/bin/sh";

/// Maximum length for command preview in logs
const COMMAND_PREVIEW_MAX_LEN: usize = 100;

/// Truncate a command string for logging, preserving UTF-8 boundaries
fn truncate_preview(s: &str) -> String {
    if s.len() <= COMMAND_PREVIEW_MAX_LEN {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < COMMAND_PREVIEW_MAX_LEN)
        .last()
        .map_or(COMMAND_PREVIEW_MAX_LEN, |(i, c)| i + c.len_utf8());
    format!("{}...", s.get(..end).unwrap_or(s))
}

pub(crate) fn ping() -> Reply {
    debug!("ping");
    Reply::Ok
}

/// `system <text>`: `/bin/sh -c <text>`, blocking until it terminates.
///
/// The child inherits the process's own standard streams.
pub(crate) fn system(text: &OsStr) -> Result<Reply, GuestError> {
    info!(command = %truncate_preview(&text.to_string_lossy()), "system");
    let mut command = Command::new(SYSTEM_SHELL);
    command.arg("-c").arg(text);
    let status = Child::spawn(&mut command)?.supervise(WaitMode::Termination)?;
    info!(?status, "system finished");
    Ok(status.into())
}

/// `write <path> <mode> <size>`: copy exactly `size` bytes from `input`.
pub(crate) fn write_file<R: Read>(input: &mut R, args: &WriteArgs<'_>) -> Result<Reply, GuestError> {
    info!(
        path = %args.path.display(),
        mode = format_args!("{:o}", args.mode),
        size = args.size,
        "write"
    );
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(args.mode)
        .open(args.path)
        .map_err(|source| GuestError::CreateFile {
            path: args.path.to_path_buf(),
            source,
        })?;

    let capacity = usize::try_from(args.size).map_or(WRITE_CHUNK_SIZE, |s| s.min(WRITE_CHUNK_SIZE));
    let mut buf = vec![0u8; capacity];
    let mut transferred: u64 = 0;
    while transferred < args.size {
        let want = usize::try_from(args.size - transferred)
            .map_or(capacity, |remaining| remaining.min(capacity));
        let chunk = buf.get_mut(..want).unwrap_or_default();
        let n = match input.read(chunk) {
            Ok(0) => {
                return Err(GuestError::ShortTransfer {
                    expected: args.size,
                    transferred,
                });
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(GuestError::ReadPayload(e)),
        };
        file.write_all(chunk.get(..n).unwrap_or_default())
            .map_err(|source| GuestError::WritePayload {
                path: args.path.to_path_buf(),
                source,
            })?;
        transferred += n as u64;
    }

    debug!(path = %args.path.display(), transferred, "write finished");
    Ok(Reply::Written { size: transferred })
}

/// `shell`: an interactive shell wired to the channel, blocking until it
/// exits, dies or stops.
pub(crate) fn shell(program: &Path, attach: &Attach) -> Result<Reply, GuestError> {
    info!(program = %program.display(), "shell");
    let mut command = Command::new(program);
    command
        .stdin(attach.stdio()?)
        .stdout(attach.stdio()?)
        .stderr(attach.stdio()?);
    let status = Child::spawn(&mut command)?.supervise(WaitMode::StopAware)?;
    info!(?status, "shell finished");
    Ok(status.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::fs::PermissionsExt;
    use testio_proto::ProcessStatus;

    #[test]
    fn truncate_preview_keeps_short_commands() {
        assert_eq!(truncate_preview("echo hi"), "echo hi");
    }

    #[test]
    fn truncate_preview_respects_char_boundaries() {
        let long = "é".repeat(80);
        let preview = truncate_preview(&long);
        assert!(preview.ends_with("..."));
        assert!(preview.len() <= COMMAND_PREVIEW_MAX_LEN + 2 + 3);
    }

    #[test]
    fn system_reports_exit_code() {
        let reply = system(OsStr::new("exit 7")).unwrap();
        assert_eq!(reply, Reply::Process(ProcessStatus::Exited { code: 7 }));
    }

    #[test]
    fn write_file_copies_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let args = WriteArgs {
            path: &path,
            mode: 0o600,
            size: 5,
        };
        let mut input = Cursor::new(b"hellotrailing".to_vec());

        let reply = write_file(&mut input, &args).unwrap();
        assert_eq!(reply, Reply::Written { size: 5 });
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert_eq!(input.position(), 5);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn write_file_spans_several_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        let payload: Vec<u8> = (0..WRITE_CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let args = WriteArgs {
            path: &path,
            mode: 0o644,
            size: payload.len() as u64,
        };

        let reply = write_file(&mut Cursor::new(payload.clone()), &args).unwrap();
        assert_eq!(reply, Reply::Written { size: payload.len() as u64 });
        assert_eq!(std::fs::read(&path).unwrap(), payload);
    }

    #[test]
    fn write_file_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing");
        std::fs::write(&path, b"much longer old content").unwrap();
        let args = WriteArgs {
            path: &path,
            mode: 0o644,
            size: 3,
        };

        write_file(&mut Cursor::new(b"new".to_vec()), &args).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn write_file_fails_on_short_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        let args = WriteArgs {
            path: &path,
            mode: 0o644,
            size: 10,
        };

        let err = write_file(&mut Cursor::new(b"hello".to_vec()), &args).unwrap_err();
        assert!(matches!(
            err,
            GuestError::ShortTransfer {
                expected: 10,
                transferred: 5
            }
        ));
    }

    #[test]
    fn write_file_fails_when_path_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("file");
        let args = WriteArgs {
            path: &path,
            mode: 0o644,
            size: 0,
        };

        let err = write_file(&mut Cursor::new(Vec::new()), &args).unwrap_err();
        assert!(matches!(err, GuestError::CreateFile { .. }));
    }

    #[test]
    fn shell_on_null_exits_cleanly() {
        let reply = shell(Path::new("/bin/sh"), &Attach::Null).unwrap();
        assert_eq!(reply, Reply::Process(ProcessStatus::Exited { code: 0 }));
    }
}
