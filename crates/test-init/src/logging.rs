//! Diagnostics go to stderr (the console), never to the test-I/O channel.

use std::fmt;
use std::io;
use std::time::Instant;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

/// Log filter, `EnvFilter` syntax.
pub const LOG_ENV: &str = "TESTIO_LOG";

/// Time since init started.
struct Uptime(Instant);

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(Uptime(Instant::now()))
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}
