//! Signal-driven lifecycle tests.
//!
//! These raise real signals at the test process, so the handlers must be
//! installed first and the tests serialized.

use std::time::Duration;

use nix::sys::signal::{Signal, raise};
use serial_test::serial;

use mux_net::lifecycle;

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
#[serial]
fn sigterm_requests_shutdown() {
    lifecycle::reset();
    lifecycle::install_signal_handlers().unwrap();
    assert!(lifecycle::running());

    raise(Signal::SIGTERM).unwrap();
    assert!(wait_until(Duration::from_secs(1), || !lifecycle::running()));

    // A second shutdown signal is a no-op.
    raise(Signal::SIGINT).unwrap();
    assert!(!lifecycle::running());
    lifecycle::reset();
}

#[test]
#[serial]
fn sighup_is_ignored() {
    lifecycle::reset();
    lifecycle::install_signal_handlers().unwrap();

    raise(Signal::SIGHUP).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(lifecycle::running());
    lifecycle::reset();
}

#[test]
#[serial]
fn sigpipe_is_ignored() {
    lifecycle::reset();
    lifecycle::install_signal_handlers().unwrap();

    // Would kill the process under the default disposition.
    raise(Signal::SIGPIPE).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(lifecycle::running());
    lifecycle::reset();
}
