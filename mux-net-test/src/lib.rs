//! Test support for mux-net.
//!
//! Provides a reference embedder (a length-prefixed echo protocol), a
//! service harness for integration tests, and small client helpers for
//! driving a service over loopback TCP.

pub mod echo;
pub mod harness;

pub use echo::{EchoCounters, EchoHandler, HEADER_SIZE, encode_frame, read_frame};
pub use harness::TestService;
