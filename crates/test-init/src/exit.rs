//! Termination controller: end the virtual machine with a status code.
//!
//! QEMU's `isa-debug-exit` device turns a write to its I/O port into a
//! host-visible exit status. Without it (other hypervisors, other
//! architectures, a plain host) init exits normally instead.

use std::io::{self, Write};

use tracing::warn;

/// I/O port of QEMU's isa-debug-exit device.
#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
const ISA_DEBUG_EXIT_PORT: u16 = 0xf4;

/// Flush everything and hand `code` to the hypervisor. Never returns.
pub fn terminate(code: i32) -> ! {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    if let Err(e) = exit_hypervisor(code) {
        warn!(error = %e, "cannot set IO permissions");
    }
    warn!(code, "cannot exit qemu from the guest, exiting init");
    let _ = io::stderr().flush();
    std::process::exit(code)
}

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
fn exit_hypervisor(code: i32) -> io::Result<()> {
    let from = libc::c_ulong::from(ISA_DEBUG_EXIT_PORT);
    let num: libc::c_ulong = 4;
    let turn_on: libc::c_int = 1;
    // SAFETY: ioperm only changes this process's I/O permission bitmap.
    let ret = unsafe { libc::syscall(libc::SYS_ioperm, from, num, turn_on) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the port was just made accessible; a write to isa-debug-exit
    // stops the VM, anything else on that port ignores it.
    unsafe {
        std::arch::asm!(
            "out dx, eax",
            in("dx") ISA_DEBUG_EXIT_PORT,
            in("eax") code,
            options(nomem, nostack, preserves_flags),
        );
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))))]
fn exit_hypervisor(_code: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no port I/O on this architecture",
    ))
}
