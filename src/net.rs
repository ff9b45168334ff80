//! Process-wide socket subsystem lifecycle.
//!
//! Call [`init`] once before constructing any [`Server`](crate::Server) and
//! [`shutdown`] when the application is done with networking. Calls nest:
//! only the last `shutdown` matching the first `init` tears state down.
//!
//! On Unix the only process-wide state that matters for this server is the
//! `SIGPIPE` disposition. A reply written to a peer that already went away
//! must surface as `EPIPE` rather than terminate the process.

use std::io;
use std::sync::Mutex;
use tracing::debug;

struct Subsystem {
    refs: usize,
    #[cfg(unix)]
    saved_sigpipe: Option<libc::sighandler_t>,
}

static SUBSYSTEM: Mutex<Subsystem> = Mutex::new(Subsystem {
    refs: 0,
    #[cfg(unix)]
    saved_sigpipe: None,
});

/// Initialize the socket subsystem for this process.
pub fn init() -> io::Result<()> {
    let mut state = SUBSYSTEM.lock().unwrap_or_else(|e| e.into_inner());

    if state.refs == 0 {
        #[cfg(unix)]
        {
            // SAFETY: replacing the SIGPIPE disposition with SIG_IGN is
            // async-signal-safe and touches no Rust-managed state.
            let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
            if previous == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
            state.saved_sigpipe = Some(previous);
        }
        debug!("Socket subsystem initialized");
    }

    state.refs += 1;
    Ok(())
}

/// Release one [`init`] reference.
pub fn shutdown() {
    let mut state = SUBSYSTEM.lock().unwrap_or_else(|e| e.into_inner());

    match state.refs {
        0 => {}
        1 => {
            state.refs = 0;
            #[cfg(unix)]
            {
                if let Some(previous) = state.saved_sigpipe.take() {
                    // SAFETY: restores the disposition captured by `init`.
                    unsafe {
                        libc::signal(libc::SIGPIPE, previous);
                    }
                }
            }
            debug!("Socket subsystem shut down");
        }
        _ => state.refs -= 1,
    }
}

/// Whether [`init`] is currently in effect.
pub fn is_initialized() -> bool {
    SUBSYSTEM.lock().map(|s| s.refs > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_shutdown_nesting() {
        init().unwrap();
        init().unwrap();
        assert!(is_initialized());

        shutdown();
        assert!(is_initialized());

        shutdown();
        assert!(!is_initialized());

        // Unmatched shutdown is a no-op
        shutdown();
        assert!(!is_initialized());
    }
}
