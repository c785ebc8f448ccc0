//! Length-prefixed echo protocol.
//!
//! Frames are an 8-byte big-endian body length followed by the body. The
//! server echoes every frame back unchanged. Callback invocations are
//! counted so tests can observe the framework's behavior from the
//! embedder's side.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use mux_net::{Result, ServiceHandler, Task, TaskAction};

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 8;

/// Callback counters observed by tests.
#[derive(Debug, Default)]
pub struct EchoCounters {
    pub accepted: AtomicUsize,
    pub inner_accepted: AtomicUsize,
    pub requests: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub timeouts: AtomicUsize,
}

pub struct EchoHandler {
    counters: Arc<EchoCounters>,
}

impl EchoHandler {
    pub fn new() -> (Arc<Self>, Arc<EchoCounters>) {
        let counters = Arc::new(EchoCounters::default());
        (
            Arc::new(Self {
                counters: counters.clone(),
            }),
            counters,
        )
    }
}

impl ServiceHandler for EchoHandler {
    fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn body_length(&self, header: &[u8]) -> Result<usize> {
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(header);
        Ok(u64::from_be_bytes(raw) as usize)
    }

    fn process(&self, task: &mut Task) -> Result<TaskAction> {
        use std::sync::atomic::Ordering::SeqCst;
        self.counters.requests.fetch_add(1, SeqCst);
        let reply = encode_frame(task.body());
        task.respond(&reply)?;
        Ok(TaskAction::Respond)
    }

    fn accept_done(&self, _task: &mut Task, inner_listener: bool) {
        use std::sync::atomic::Ordering::SeqCst;
        self.counters.accepted.fetch_add(1, SeqCst);
        if inner_listener {
            self.counters.inner_accepted.fetch_add(1, SeqCst);
        }
    }

    fn cleanup(&self, _task: &mut Task) {
        use std::sync::atomic::Ordering::SeqCst;
        self.counters.cleanups.fetch_add(1, SeqCst);
    }

    fn timed_out(&self, _task: &mut Task) -> bool {
        use std::sync::atomic::Ordering::SeqCst;
        self.counters.timeouts.fetch_add(1, SeqCst);
        true
    }
}

/// Build a wire frame around `body`.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Read one complete frame, returning its body. An `UnexpectedEof` means
/// the server closed the connection.
pub fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let len = u64::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// Send one frame and read the echoed reply.
pub fn echo_round_trip(stream: &mut TcpStream, body: &[u8]) -> io::Result<Vec<u8>> {
    stream.write_all(&encode_frame(body))?;
    read_frame(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let frame = encode_frame(b"hello");
        assert_eq!(frame.len(), HEADER_SIZE + 5);
        assert_eq!(&frame[..HEADER_SIZE], &5u64.to_be_bytes());
        assert_eq!(&frame[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn handler_parses_its_own_header() {
        let (handler, _) = EchoHandler::new();
        let frame = encode_frame(&[0xAB; 300]);
        assert_eq!(handler.body_length(&frame[..HEADER_SIZE]).unwrap(), 300);
    }
}
