//! PID 1 for disposable test virtual machines.
//!
//! A host-side harness drives the guest over a dedicated serial line with a
//! small line protocol (see `testio_proto`). This binary only prepares the
//! machine and hands the line to `testio_guest::Session`.
//!
//! Startup sequence:
//! 1. Install PID 1 signal dispositions (ignore SIGPIPE)
//! 2. With `testio=<dev>`: mount /dev, /proc, /sys and friends, then open
//!    `/dev/<dev>` exclusively in raw mode. Without it: use stdin/stdout
//! 3. Run the command loop until `exit` or a fatal error
//! 4. Stop the VM through isa-debug-exit with status 0 or 1

mod bootstrap;
mod config;
mod error;
mod exit;
mod logging;
mod pid1;

use testio_guest::{Channel, Session};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::InitError;

fn main() {
    logging::init();
    let config = Config::from_env();

    let code = match run(&config) {
        Ok(()) => 0,
        Err(e) => {
            error!("fatal error: {e}");
            1
        }
    };
    exit::terminate(code)
}

fn run(config: &Config) -> Result<(), InitError> {
    pid1::setup_signal_handlers()?;

    let channel = match config.testio.as_deref() {
        Some(name) => {
            bootstrap::early_mount()?;
            let channel = Channel::open_device(name)?;
            info!(device = name, "test I/O channel open");
            channel
        }
        None => {
            warn!(
                "cannot find name of test I/O serial port; \
                 please pass it to init using 'testio=ttySxxx' argument"
            );
            Channel::stdio()?
        }
    };

    let mut session = Session::from_channel(channel)
        .with_shell(&config.shell)
        .with_orphan_reaping(pid1::is_pid1());

    let result = session.run();
    let flushed = session.flush();
    result?;
    flushed?;
    Ok(())
}
