// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wiring the process-wide [`DelayCopy`] up to the protection fault signal.
//!
//! Touching a page that a pending copy protected raises `SIGSEGV` (`SIGBUS` on some BSDs). The
//! kernel delivers it synchronously to the faulting thread and `fault_handler` forwards the
//! faulting address to [`DelayCopy::handle_fault`]. When the handler returns the faulting
//! instruction is restarted and succeeds against the now accessible page.
//!
//! Faults that no pending copy claims are genuine memory errors in the host program. We can't
//! safely continue past those, so the handler prints a fixed message and kills the process.

use core::ffi::c_void;
use core::{mem, ptr};
use std::io;
use std::sync::OnceLock;

use crate::address::VirtualAddress;
use crate::engine::DelayCopy;
use crate::error::Error;

const UNCLAIMED_MESSAGE: &[u8] = b"Segmentation fault!\n";
const PROTECT_MESSAGE: &[u8] = b"delay_memcpy: failed to restore access to a copied page\n";

pub(crate) struct Global(DelayCopy);

// Safety: deferred copies are single threaded by contract. The fault handler only ever runs on
// the thread that touched a protected page, and callers must not request copies from several
// threads at once.
unsafe impl Sync for Global {}

static GLOBAL: OnceLock<Global> = OnceLock::new();

/// Returns the process-wide engine, creating it with `init` on first use.
pub(crate) fn engine_or_init(init: impl FnOnce() -> DelayCopy) -> &'static DelayCopy {
    &GLOBAL.get_or_init(|| Global(init())).0
}

/// Returns the process-wide engine if [`crate::initialize`] ran.
pub(crate) fn engine() -> Option<&'static DelayCopy> {
    GLOBAL.get().map(|global| &global.0)
}

/// Points the protection fault signals at [`fault_handler`].
///
/// Installing the same handler again is harmless, so this may run any number of times.
pub(crate) fn install() -> crate::Result<()> {
    foreach_signal(|signal| {
        // Safety: `sigaction` is a plain C struct for which all zeroes is a valid value
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        // SA_SIGINFO gives us the faulting address.
        //
        // SA_ONSTACK runs the handler on the alternate signal stack where one is installed.
        //
        // SA_NODEFER lets a fault inside the handler re-enter it instead of having the kernel
        // kill us outright.
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        action.sa_sigaction = fault_handler as usize;

        // Safety: both pointers refer to live, properly initialized values
        let ret = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, ptr::null_mut())
        };

        if ret == 0 {
            Ok(())
        } else {
            Err(Error::InstallHandler {
                signal,
                source: io::Error::last_os_error(),
            })
        }
    })
}

fn foreach_signal(mut f: impl FnMut(libc::c_int) -> crate::Result<()>) -> crate::Result<()> {
    f(libc::SIGSEGV)?;

    // Darwin and FreeBSD report some protection violations as SIGBUS.
    if cfg!(target_os = "macos") || cfg!(target_os = "freebsd") {
        f(libc::SIGBUS)?;
    }

    Ok(())
}

unsafe extern "C" fn fault_handler(
    _signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    _context: *mut c_void,
) {
    // Safety: SA_SIGINFO makes the kernel pass a valid siginfo
    let addr = unsafe { fault_address(siginfo) };

    let Some(engine) = engine() else {
        fatal(UNCLAIMED_MESSAGE);
    };

    match engine.handle_fault(addr) {
        Ok(_) => {}
        Err(Error::Unclaimed(_)) => fatal(UNCLAIMED_MESSAGE),
        Err(_) => fatal(PROTECT_MESSAGE),
    }
}

unsafe fn fault_address(siginfo: *const libc::siginfo_t) -> VirtualAddress {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // Safety: ensured by the caller
            VirtualAddress::from_mut_ptr(unsafe { (*siginfo).si_addr() })
        } else {
            // Safety: ensured by the caller
            VirtualAddress::from_mut_ptr(unsafe { (*siginfo).si_addr })
        }
    }
}

/// Writes `message` to stderr and kills the process. Async-signal-safe.
fn fatal(message: &[u8]) -> ! {
    // Safety: write, raise and _exit are all async-signal-safe and get valid arguments
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
        libc::raise(libc::SIGKILL);
        libc::_exit(libc::EXIT_FAILURE)
    }
}
