//! Early filesystem bootstrap.
//!
//! Brings an initramfs up to the point where the test-I/O device can be
//! opened and shell commands behave:
//! 1. Create the base directories
//! 2. Mount /sys and /proc, point /etc/mtab at /proc/mounts
//! 3. Mount devtmpfs on /dev, or a tmpfs with hand-made device nodes
//! 4. Mount /dev/pts and /run
//!
//! Every step is idempotent on directories; mount failures are fatal.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, symlink};
use std::path::Path;

use nix::mount::{MsFlags, mount};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use tracing::{info, warn};

/// Used when the kernel starts us without a `PATH`.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Errors that can occur during early bootstrap
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("cannot create directory {path}: {source}")]
    Mkdir { path: String, source: io::Error },

    #[error("cannot mount {source_name} at {target} (type {fstype}): {source}")]
    Mount {
        source_name: String,
        target: String,
        fstype: String,
        source: nix::Error,
    },

    #[error("cannot unlink {path}: {source}")]
    Unlink { path: String, source: io::Error },

    #[error("cannot symlink {link} -> {target}: {source}")]
    Symlink {
        target: String,
        link: String,
        source: io::Error,
    },

    #[error("cannot mknod {path} (mode {mode:o}, dev: {major}:{minor}): {source}")]
    Mknod {
        path: String,
        mode: u32,
        major: u64,
        minor: u64,
        source: nix::Error,
    },
}

/// Prepare /proc, /sys, /dev and /run.
pub fn early_mount() -> Result<(), BootstrapError> {
    info!("preparing early filesystem");

    mkdir("/dev", 0o755)?;
    mkdir("/root", 0o700)?;
    mkdir("/sys", 0o755)?;
    mkdir("/proc", 0o755)?;
    mkdir("/tmp", 0o755)?;
    mkdir("/var/lock", 0o755)?;

    let restricted = MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID;
    mount_fs("sysfs", "/sys", "sysfs", restricted, None)?;
    mount_fs("proc", "/proc", "proc", restricted, None)?;
    symlink_force("/proc/mounts", "/etc/mtab")?;

    if let Err(e) = mount(
        Some("udev"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=0755"),
    ) {
        warn!(error = %e, "cannot mount devtmpfs, falling back to tmpfs /dev");
        mount_fs("udev", "/dev", "tmpfs", MsFlags::MS_NOSUID, Some("mode=0755"))?;
        mknod_char("/dev/console", 0o600, 5, 1)?;
        mknod_char("/dev/null", 0o666, 1, 3)?;
    }

    mkdir("/dev/pts", 0o755)?;
    mount_fs(
        "devpts",
        "/dev/pts",
        "devpts",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
        Some("gid=5,mode=0620"),
    )?;
    mount_fs(
        "tmpfs",
        "/run",
        "tmpfs",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
        Some("size=10%,mode=0755"),
    )?;
    mkdir("/run/initramfs", 0o755)?;

    if std::env::var_os("PATH").is_none() {
        // SAFETY: we are PID 1 and no other threads have been started yet
        unsafe { std::env::set_var("PATH", DEFAULT_PATH) };
    }

    info!("early filesystem ready");
    Ok(())
}

fn mkdir(path: &str, mode: u32) -> Result<(), BootstrapError> {
    match DirBuilder::new().mode(mode).create(path) {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(BootstrapError::Mkdir {
            path: path.into(),
            source: e,
        }),
        _ => Ok(()),
    }
}

fn mount_fs(
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), BootstrapError> {
    mount(Some(source), target, Some(fstype), flags, data).map_err(|e| BootstrapError::Mount {
        source_name: source.into(),
        target: target.into(),
        fstype: fstype.into(),
        source: e,
    })
}

/// `ln -sf target link`
fn symlink_force(target: &str, link: &str) -> Result<(), BootstrapError> {
    if fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link).map_err(|source| BootstrapError::Unlink {
            path: link.into(),
            source,
        })?;
    }
    symlink(target, link).map_err(|source| BootstrapError::Symlink {
        target: target.into(),
        link: link.into(),
        source,
    })
}

fn mknod_char(path: &str, mode: u32, major: u64, minor: u64) -> Result<(), BootstrapError> {
    mknod(
        Path::new(path),
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(mode),
        makedev(major, minor),
    )
    .map_err(|source| BootstrapError::Mknod {
        path: path.into(),
        mode,
        major,
        minor,
        source,
    })
}
