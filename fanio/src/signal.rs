//! Signal-driven shutdown.
//!
//! The handler does nothing except store a flag; every loop in the runtime
//! polls it alongside the instance exit flag. All cleanup happens on the
//! threads that own the resources, never in signal context.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;

static SIGNAL_EXIT: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_exit(_sig: libc::c_int) {
    SIGNAL_EXIT.store(true, Ordering::Release);
}

/// Install the exit handler for `signum` (e.g. `libc::SIGINT`).
pub(crate) fn install(signum: i32) -> Result<(), Error> {
    let handler: extern "C" fn(libc::c_int) = handle_exit;
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;

        if libc::sigaction(signum, &sa, std::ptr::null_mut()) == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Whether a registered exit signal has fired. Process-wide, latching.
pub(crate) fn triggered() -> bool {
    SIGNAL_EXIT.load(Ordering::Acquire)
}
