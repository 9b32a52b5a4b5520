//! Line-oriented test-I/O protocol between the guest init and the harness.
//!
//! ## Requests
//!
//! One command per line, terminated by `\n`:
//!
//! | Line                            | Effect |
//! |---------------------------------|--------|
//! | (empty)                         | ignored, no reply |
//! | `exit`                          | reply, then stop the session |
//! | `ping`                          | reply only |
//! | `system <text>`                 | run `<text>` with `/bin/sh -c` |
//! | `write <path> <mode> <size>`    | followed by exactly `size` raw bytes |
//! | `shell`                         | interactive shell on the channel |
//!
//! `mode` is octal, `size` is decimal. Anything else is a bad request.
//!
//! ## Replies
//!
//! Exactly one JSON object per line, members separated by `", "`:
//!
//! ```text
//! {"event": "boot-ok"}
//! {"result": "ok"}
//! {"result": "bad-request"}
//! {"result": "ok", "status": "exited", "code": N}
//! {"result": "ok", "status": "signaled", "signal": N}
//! {"result": "ok", "status": "stopped", "signal": N}
//! {"result": "ok", "size": N}
//! ```

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};

/// Largest slice of a `write` payload moved in one read/write step.
pub const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Highest permission value accepted by `write` (setuid/setgid/sticky + rwx).
pub const MAX_MODE: u32 = 0o7777;

const SYSTEM_PREFIX: &[u8] = b"system ";
const WRITE_PREFIX: &[u8] = b"write ";

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("cannot parse write command: missing {0}")]
    MissingArgument(&'static str),

    #[error("cannot parse write command: unexpected argument {0:?}")]
    UnexpectedArgument(String),

    #[error("cannot parse write command: invalid octal mode {0:?}")]
    InvalidMode(String),

    #[error("cannot parse write command: invalid size {0:?}")]
    InvalidSize(String),

    #[error("cannot encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Command verbs, in classification order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Empty,
    Exit,
    Ping,
    System,
    Write,
    Shell,
    Unrecognized,
}

#[derive(Debug, Clone, Copy)]
enum Matcher {
    Exact(&'static [u8]),
    Prefix(&'static [u8]),
}

impl Matcher {
    fn matches(self, line: &[u8]) -> bool {
        match self {
            Self::Exact(word) => line == word,
            Self::Prefix(prefix) => line.starts_with(prefix),
        }
    }
}

/// Classification table. Evaluated top to bottom, first match wins.
const ROUTES: &[(Matcher, Verb)] = &[
    (Matcher::Exact(b""), Verb::Empty),
    (Matcher::Exact(b"exit"), Verb::Exit),
    (Matcher::Exact(b"ping"), Verb::Ping),
    (Matcher::Prefix(SYSTEM_PREFIX), Verb::System),
    (Matcher::Prefix(WRITE_PREFIX), Verb::Write),
    (Matcher::Exact(b"shell"), Verb::Shell),
];

/// Classify a line that already had its newline removed.
pub fn classify(line: &[u8]) -> Verb {
    ROUTES
        .iter()
        .find(|(matcher, _)| matcher.matches(line))
        .map_or(Verb::Unrecognized, |(_, verb)| *verb)
}

/// Strip exactly one trailing `\n`, nothing else.
pub fn chomp(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\n").unwrap_or(line)
}

/// One command line, borrowed from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub verb: Verb,
    /// The full line (verb included) without its trailing newline.
    pub raw: &'a [u8],
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a [u8]) -> Self {
        let raw = chomp(line);
        Self {
            verb: classify(raw),
            raw,
        }
    }

    /// Shell command text of a `system` line: everything after `system `.
    /// Empty for any other verb.
    pub fn system_text(&self) -> &'a OsStr {
        let text: &[u8] = match self.verb {
            Verb::System => self.raw.strip_prefix(SYSTEM_PREFIX).unwrap_or_default(),
            _ => &[],
        };
        OsStr::from_bytes(text)
    }

    /// Arguments of a `write` line.
    pub fn write_args(&self) -> Result<WriteArgs<'a>, ProtocolError> {
        WriteArgs::parse(self.raw)
    }
}

/// Arguments of `write <path> <mode-octal> <size>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteArgs<'a> {
    pub path: &'a Path,
    pub mode: u32,
    pub size: u64,
}

impl<'a> WriteArgs<'a> {
    /// Parse a full `write` line. Tokens are separated by ASCII whitespace
    /// and there must be exactly three after the verb.
    pub fn parse(line: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut tokens = line
            .split(u8::is_ascii_whitespace)
            .filter(|token| !token.is_empty());
        // The verb itself.
        tokens.next().ok_or(ProtocolError::MissingArgument("verb"))?;

        let path = tokens
            .next()
            .ok_or(ProtocolError::MissingArgument("path"))?;
        let mode = tokens
            .next()
            .ok_or(ProtocolError::MissingArgument("mode"))?;
        let size = tokens
            .next()
            .ok_or(ProtocolError::MissingArgument("size"))?;
        if let Some(extra) = tokens.next() {
            return Err(ProtocolError::UnexpectedArgument(lossy(extra)));
        }

        let mode = std::str::from_utf8(mode)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| u32::from_str_radix(s, 8).ok())
            .filter(|m| *m <= MAX_MODE)
            .ok_or_else(|| ProtocolError::InvalidMode(lossy(mode)))?;
        let size = std::str::from_utf8(size)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| ProtocolError::InvalidSize(lossy(size)))?;

        Ok(Self {
            path: Path::new(OsStr::from_bytes(path)),
            mode,
            size,
        })
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Value of the `result` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Ok,
    BadRequest,
}

/// How a child process changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Exited { code: i32 },
    Signaled { signal: i32 },
    Stopped { signal: i32 },
}

impl ProcessStatus {
    /// `(status, member name, value)` as they appear on the wire.
    fn members(self) -> (&'static str, &'static str, i32) {
        match self {
            Self::Exited { code } => ("exited", "code", code),
            Self::Signaled { signal } => ("signaled", "signal", signal),
            Self::Stopped { signal } => ("stopped", "signal", signal),
        }
    }
}

/// The single reply written for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    BadRequest,
    Process(ProcessStatus),
    Written { size: u64 },
}

impl Reply {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::BadRequest => Outcome::BadRequest,
            Self::Ok | Self::Process(_) | Self::Written { .. } => Outcome::Ok,
        }
    }
}

impl From<ProcessStatus> for Reply {
    fn from(status: ProcessStatus) -> Self {
        Self::Process(status)
    }
}

impl Serialize for Reply {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("result", &self.outcome())?;
        match self {
            Self::Ok | Self::BadRequest => {}
            Self::Process(status) => {
                let (name, key, value) = status.members();
                map.serialize_entry("status", name)?;
                map.serialize_entry(key, &value)?;
            }
            Self::Written { size } => map.serialize_entry("size", size)?,
        }
        map.end()
    }
}

/// Unsolicited notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// First line ever written to the channel.
    BootOk,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Compact JSON with a space after every `,` and `:` of an object.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Encode a reply or event as one newline-terminated line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(64);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    value.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}
