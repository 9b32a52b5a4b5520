//! The session: owns the channel and runs the read-dispatch-reply loop.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use serde::Serialize;
use testio_proto::{Command, Event, Reply, Verb, encode_line};
use tracing::{debug, info};

use crate::channel::{Attach, Channel};
use crate::error::GuestError;
use crate::handlers;
use crate::process;

/// Program started by the `shell` command unless configured otherwise.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Whether the loop goes on after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Session<R, W> {
    input: R,
    output: W,
    attach: Attach,
    shell: PathBuf,
    reap_orphans: bool,
}

impl Session<Box<dyn BufRead>, Box<dyn Write>> {
    pub fn from_channel(channel: Channel) -> Self {
        Self::new(channel.input, channel.output, channel.attach)
    }
}

impl<R: BufRead, W: Write> Session<R, W> {
    pub fn new(input: R, output: W, attach: Attach) -> Self {
        Self {
            input,
            output,
            attach,
            shell: PathBuf::from(DEFAULT_SHELL),
            reap_orphans: false,
        }
    }

    /// Program run by the `shell` command.
    pub fn with_shell(mut self, program: impl Into<PathBuf>) -> Self {
        self.shell = program.into();
        self
    }

    /// Reap re-parented zombies after every command. Only for PID 1.
    pub fn with_orphan_reaping(mut self, enabled: bool) -> Self {
        self.reap_orphans = enabled;
        self
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    pub fn into_parts(self) -> (R, W) {
        (self.input, self.output)
    }

    pub fn flush(&mut self) -> Result<(), GuestError> {
        self.output.flush().map_err(GuestError::WriteReply)
    }

    /// Announce the boot, then serve commands until `exit`.
    ///
    /// Returns `Ok` only after `exit`; every other way out is fatal.
    pub fn run(&mut self) -> Result<(), GuestError> {
        self.send(&Event::BootOk)?;
        info!("boot-ok sent, waiting for commands");
        while self.step()? == Flow::Continue {}
        info!("exit requested");
        Ok(())
    }

    /// Read, dispatch and answer one command line.
    pub fn step(&mut self) -> Result<Flow, GuestError> {
        let line = self.read_line()?;
        let command = Command::parse(&line);
        debug!(verb = ?command.verb, "command");

        let (reply, flow) = self.dispatch(&command)?;
        if let Some(reply) = reply {
            self.send(&reply)?;
        }
        if self.reap_orphans {
            let reaped = process::reap_orphans();
            if reaped > 0 {
                debug!(reaped, "reaped orphans");
            }
        }
        Ok(flow)
    }

    fn dispatch(&mut self, command: &Command<'_>) -> Result<(Option<Reply>, Flow), GuestError> {
        let reply = match command.verb {
            Verb::Empty => return Ok((None, Flow::Continue)),
            Verb::Exit => return Ok((Some(Reply::Ok), Flow::Exit)),
            Verb::Ping => handlers::ping(),
            Verb::System => handlers::system(command.system_text())?,
            Verb::Write => handlers::write_file(&mut self.input, &command.write_args()?)?,
            Verb::Shell => handlers::shell(&self.shell, &self.attach)?,
            Verb::Unrecognized => {
                info!(line = %String::from_utf8_lossy(command.raw), "bad request");
                Reply::BadRequest
            }
        };
        Ok((Some(reply), Flow::Continue))
    }

    fn read_line(&mut self) -> Result<Vec<u8>, GuestError> {
        let mut line = Vec::new();
        match self.input.read_until(b'\n', &mut line) {
            Ok(0) => Err(GuestError::EndOfStream),
            Ok(_) => Ok(line),
            Err(e) => Err(GuestError::ReadCommand(e)),
        }
    }

    /// Write one line and flush it, so the harness sees it before the next
    /// command is read.
    fn send<T: Serialize>(&mut self, value: &T) -> Result<(), GuestError> {
        let line = encode_line(value)?;
        self.output
            .write_all(&line)
            .map_err(GuestError::WriteReply)?;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn session(input: &[u8]) -> Session<Cursor<Vec<u8>>, Vec<u8>> {
        Session::new(Cursor::new(input.to_vec()), Vec::new(), Attach::Null)
    }

    fn lines(session: &Session<Cursor<Vec<u8>>, Vec<u8>>) -> Vec<String> {
        String::from_utf8(session.output().clone())
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn boot_beacon_comes_first() {
        let mut s = session(b"exit\n");
        s.run().unwrap();
        assert!(s.output().starts_with(b"{\"event\": \"boot-ok\"}\n"));
    }

    #[test]
    fn ping_then_exit() {
        let mut s = session(b"ping\nexit\n");
        s.run().unwrap();
        assert_eq!(
            lines(&s),
            [
                "{\"event\": \"boot-ok\"}",
                "{\"result\": \"ok\"}",
                "{\"result\": \"ok\"}"
            ]
        );
    }

    #[test]
    fn empty_lines_are_silent() {
        let mut s = session(b"\n\nping\n\nexit\n");
        s.run().unwrap();
        assert_eq!(lines(&s).len(), 3);
    }

    #[test]
    fn unknown_verbs_are_bad_requests() {
        let mut s = session(b"reboot\nping\n");
        assert_eq!(s.step().unwrap(), Flow::Continue);
        assert_eq!(s.step().unwrap(), Flow::Continue);
        assert_eq!(
            lines(&s),
            ["{\"result\": \"bad-request\"}", "{\"result\": \"ok\"}"]
        );
    }

    #[test]
    fn exit_stops_reading() {
        let mut s = session(b"exit\nping\n");
        assert_eq!(s.step().unwrap(), Flow::Exit);
        let (input, output) = s.into_parts();
        assert_eq!(input.position(), 5);
        assert_eq!(output, b"{\"result\": \"ok\"}\n");
    }

    #[test]
    fn end_of_stream_is_fatal() {
        let mut s = session(b"ping\n");
        let err = s.run().unwrap_err();
        assert!(matches!(err, GuestError::EndOfStream));
        assert_eq!(lines(&s).len(), 2);
    }

    #[test]
    fn unterminated_last_line_is_still_served() {
        let mut s = session(b"ping");
        assert_eq!(s.step().unwrap(), Flow::Continue);
        assert!(matches!(s.step().unwrap_err(), GuestError::EndOfStream));
        assert_eq!(lines(&s), ["{\"result\": \"ok\"}"]);
    }

    #[test]
    fn write_payload_is_not_parsed_as_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut input = format!("write {} 644 10\n", path.display()).into_bytes();
        input.extend_from_slice(b"exit\nping\n");
        input.extend_from_slice(b"ping\n");

        let mut s = session(&input);
        assert_eq!(s.step().unwrap(), Flow::Continue);
        assert_eq!(s.step().unwrap(), Flow::Continue);
        assert_eq!(
            lines(&s),
            ["{\"result\": \"ok\", \"size\": 10}", "{\"result\": \"ok\"}"]
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"exit\nping\n");
    }

    #[test]
    fn malformed_write_is_fatal() {
        let mut s = session(b"write /tmp/f 644\n");
        assert!(matches!(s.step().unwrap_err(), GuestError::Protocol(_)));
        assert!(s.output().is_empty());
    }

    #[test]
    fn system_and_shell_replies() {
        let mut s = session(b"system exit 3\nshell\n");
        s.step().unwrap();
        s.step().unwrap();
        assert_eq!(
            lines(&s),
            [
                "{\"result\": \"ok\", \"status\": \"exited\", \"code\": 3}",
                "{\"result\": \"ok\", \"status\": \"exited\", \"code\": 0}"
            ]
        );
    }

    /// Keeps written bytes apart until they are flushed.
    #[derive(Default)]
    struct FlushTracker {
        pending: Vec<u8>,
        flushed: Vec<u8>,
        writes: usize,
    }

    impl Write for FlushTracker {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes += 1;
            self.pending.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.append(&mut self.pending);
            Ok(())
        }
    }

    #[test]
    fn every_reply_is_flushed_before_the_next_read() {
        let input = Cursor::new(b"ping\nbogus\nsystem exit 2\nexit\n".to_vec());
        let mut s = Session::new(input, FlushTracker::default(), Attach::Null);
        let expected = [
            "{\"result\": \"ok\"}\n",
            "{\"result\": \"bad-request\"}\n",
            "{\"result\": \"ok\", \"status\": \"exited\", \"code\": 2}\n",
            "{\"result\": \"ok\"}\n",
        ];

        let mut seen = String::new();
        for reply in expected {
            s.step().unwrap();
            assert!(s.output().pending.is_empty());
            seen.push_str(reply);
            assert_eq!(String::from_utf8_lossy(&s.output().flushed), seen);
        }
    }

    #[test]
    fn boot_beacon_is_flushed_before_the_first_read() {
        let mut s = Session::new(Cursor::new(Vec::new()), FlushTracker::default(), Attach::Null);
        assert!(matches!(s.run().unwrap_err(), GuestError::EndOfStream));
        assert!(s.output().pending.is_empty());
        assert_eq!(s.output().flushed, b"{\"event\": \"boot-ok\"}\n");
    }

    #[test]
    fn empty_line_writes_nothing() {
        let mut s = Session::new(Cursor::new(b"\n".to_vec()), FlushTracker::default(), Attach::Null);
        assert_eq!(s.step().unwrap(), Flow::Continue);
        assert_eq!(s.output().writes, 0);
        assert!(s.output().flushed.is_empty());
    }

    #[test]
    fn empty_system_text_still_runs() {
        let mut s = session(b"system \n");
        s.step().unwrap();
        assert_eq!(
            lines(&s),
            ["{\"result\": \"ok\", \"status\": \"exited\", \"code\": 0}"]
        );
    }

    #[test]
    fn missing_shell_program_is_fatal() {
        let mut s = session(b"shell\n").with_shell("/nonexistent/testio-shell");
        assert!(matches!(s.step().unwrap_err(), GuestError::Process(_)));
    }
}
