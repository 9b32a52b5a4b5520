//! Startup configuration from the command line and environment.
//!
//! The kernel hands init whatever follows `--` on its command line, so the
//! test-I/O device arrives as `testio=ttyS1`. Unknown arguments are ignored.

use std::ffi::OsString;
use std::path::PathBuf;

use testio_guest::DEFAULT_SHELL;

const TESTIO_ARG_PREFIX: &str = "testio=";

/// Overrides the program started by the `shell` command.
pub const SHELL_ENV: &str = "TESTIO_SHELL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Device name under `/dev`; `None` means use stdin/stdout.
    pub testio: Option<String>,
    pub shell: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self::parse(std::env::args_os().skip(1), std::env::var_os(SHELL_ENV))
    }

    /// The last `testio=` argument wins.
    pub fn parse<I>(args: I, shell: Option<OsString>) -> Self
    where
        I: IntoIterator<Item = OsString>,
    {
        let testio = args
            .into_iter()
            .filter_map(|arg| {
                arg.to_str()
                    .and_then(|s| s.strip_prefix(TESTIO_ARG_PREFIX))
                    .map(String::from)
            })
            .last();
        Self {
            testio,
            shell: shell
                .filter(|s| !s.is_empty())
                .map_or_else(|| PathBuf::from(DEFAULT_SHELL), PathBuf::from),
        }
    }
}
