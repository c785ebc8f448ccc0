//! Process lifecycle: the continue flag and signal handling.
//!
//! A single process-wide flag gates every loop in the framework. Signal
//! handlers do nothing but store to atomics; all logging about signals
//! happens later from loop context, where tracing is safe to call.
//!
//! Shutdown is idempotent: the first of SIGINT/SIGTERM/SIGQUIT (or an
//! explicit [`request_shutdown`]) clears the flag and records the signal,
//! repeats are no-ops. SIGHUP and SIGUSR1/2 are logged and ignored;
//! SIGPIPE is ignored outright. In debug builds a dump handler is
//! installed over SIGUSR1/2 after the no-op one, replacing it; the dump
//! is written by a reactor on its next iteration.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{info, warn};

use crate::error::{Error, Result};

static CONTINUE_FLAG: AtomicBool = AtomicBool::new(true);
static TERMINATING: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_SIGNAL: AtomicI32 = AtomicI32::new(0);
static SHUTDOWN_LOGGED: AtomicBool = AtomicBool::new(false);
static BENIGN_SIGNAL: AtomicI32 = AtomicI32::new(0);
#[cfg(debug_assertions)]
static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether service loops should keep running.
pub fn running() -> bool {
    CONTINUE_FLAG.load(Ordering::SeqCst)
}

/// Request an orderly shutdown. Idempotent; safe from any thread.
pub fn request_shutdown() {
    if !TERMINATING.swap(true, Ordering::SeqCst) {
        CONTINUE_FLAG.store(false, Ordering::SeqCst);
    }
}

/// Restore the lifecycle to its pre-start state so a service can be
/// initialized again in the same process. Intended for embedders that
/// restart in-process and for tests; do not call while a service is
/// still running.
pub fn reset() {
    CONTINUE_FLAG.store(true, Ordering::SeqCst);
    TERMINATING.store(false, Ordering::SeqCst);
    SHUTDOWN_SIGNAL.store(0, Ordering::SeqCst);
    SHUTDOWN_LOGGED.store(false, Ordering::SeqCst);
    BENIGN_SIGNAL.store(0, Ordering::SeqCst);
    #[cfg(debug_assertions)]
    DUMP_REQUESTED.store(false, Ordering::SeqCst);
}

extern "C" fn quit_signal_handler(sig: c_int) {
    if !TERMINATING.swap(true, Ordering::SeqCst) {
        SHUTDOWN_SIGNAL.store(sig, Ordering::SeqCst);
        CONTINUE_FLAG.store(false, Ordering::SeqCst);
    }
}

extern "C" fn benign_signal_handler(sig: c_int) {
    BENIGN_SIGNAL.store(sig, Ordering::SeqCst);
}

#[cfg(debug_assertions)]
extern "C" fn dump_signal_handler(_sig: c_int) {
    DUMP_REQUESTED.store(true, Ordering::SeqCst);
}

fn install(signal: Signal, handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: every handler above only stores to atomics, which is
    // async-signal-safe.
    unsafe { sigaction(signal, &action) }
        .map(|_| ())
        .map_err(|e| Error::os("sigaction", e))
}

/// Install the service signal disposition. Call once, before
/// [`Service::init`](crate::service::Service::init).
pub fn install_signal_handlers() -> Result<()> {
    install(Signal::SIGUSR1, SigHandler::Handler(benign_signal_handler))?;
    install(Signal::SIGUSR2, SigHandler::Handler(benign_signal_handler))?;
    install(Signal::SIGHUP, SigHandler::Handler(benign_signal_handler))?;
    install(Signal::SIGPIPE, SigHandler::SigIgn)?;
    install(Signal::SIGINT, SigHandler::Handler(quit_signal_handler))?;
    install(Signal::SIGTERM, SigHandler::Handler(quit_signal_handler))?;
    install(Signal::SIGQUIT, SigHandler::Handler(quit_signal_handler))?;
    // Debug builds replace the no-op USR disposition with a state dump.
    #[cfg(debug_assertions)]
    {
        install(Signal::SIGUSR1, SigHandler::Handler(dump_signal_handler))?;
        install(Signal::SIGUSR2, SigHandler::Handler(dump_signal_handler))?;
    }
    Ok(())
}

/// Log signal activity recorded by the handlers. Called from loop
/// context; each event is reported once, by whichever loop gets there
/// first.
pub(crate) fn log_pending_signal_events() {
    let benign = BENIGN_SIGNAL.swap(0, Ordering::SeqCst);
    if benign != 0 {
        info!(signal = benign, "caught signal, ignored");
    }
    if !running() && !SHUTDOWN_LOGGED.swap(true, Ordering::SeqCst) {
        let sig = SHUTDOWN_SIGNAL.load(Ordering::SeqCst);
        if sig != 0 {
            warn!(signal = sig, "caught signal, shutting down");
        } else {
            info!("shutdown requested");
        }
    }
}

/// Take a pending debug-dump request, if any. Always false in release
/// builds.
pub(crate) fn take_dump_request() -> bool {
    #[cfg(debug_assertions)]
    {
        DUMP_REQUESTED.swap(false, Ordering::SeqCst)
    }
    #[cfg(not(debug_assertions))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn shutdown_is_idempotent() {
        reset();
        assert!(running());
        request_shutdown();
        assert!(!running());
        // Repeats are no-ops.
        request_shutdown();
        assert!(!running());
        reset();
        assert!(running());
    }

    #[test]
    #[serial]
    fn benign_signal_is_taken_once() {
        reset();
        benign_signal_handler(1);
        assert_eq!(BENIGN_SIGNAL.swap(0, Ordering::SeqCst), 1);
        assert_eq!(BENIGN_SIGNAL.load(Ordering::SeqCst), 0);
        reset();
    }
}
