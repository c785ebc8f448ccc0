//! Per-connection task context.
//!
//! A [`Task`] is the unit the pool hands out and a reactor owns for the
//! lifetime of one connection: the socket, paired read/write buffers, the
//! message cursors, and the idle-timeout bookkeeping. Tasks are reused
//! across connections; buffers are zeroed only at allocation and driven by
//! explicit cursors afterwards.

use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::error::{Error, Result};

/// Receive-side state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadState {
    /// Reading until `header_size` bytes are buffered.
    AwaitingHeader,
    /// Header parsed; reading until the declared body is complete.
    AwaitingBody,
    /// A complete request has been handed to the embedder.
    Dispatched,
    /// The connection is being torn down and will not be re-registered.
    Closing,
}

/// Send-side state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    Sending,
}

/// Per-connection context drawn from the [`TaskPool`](crate::pool::TaskPool).
///
/// Owned by exactly one reactor once accepted; never shared between
/// threads except through the handoff pipe, which transfers ownership.
impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("reactor_index", &self.reactor_index)
            .field("header_size", &self.header_size)
            .field("read_state", &self.read_state)
            .field("write_state", &self.write_state)
            .field("read_done", &self.read_done)
            .field("body_len", &self.body_len)
            .field("write_len", &self.write_len)
            .field("write_done", &self.write_done)
            .field("close_after_write", &self.close_after_write)
            .field("last_active", &self.last_active)
            .field("timer_slot", &self.timer_slot)
            .field("max_buf", &self.max_buf)
            .finish_non_exhaustive()
    }
}

pub struct Task {
    pub(crate) fd: RawFd,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) reactor_index: usize,
    pub(crate) header_size: usize,
    pub(crate) read_state: ReadState,
    pub(crate) write_state: WriteState,
    pub(crate) read_buf: Vec<u8>,
    pub(crate) write_buf: Vec<u8>,
    /// Bytes of the current request received so far (header included).
    pub(crate) read_done: usize,
    /// Body length declared by the embedder for the current request.
    pub(crate) body_len: usize,
    /// Total bytes of the staged response.
    pub(crate) write_len: usize,
    /// Bytes of the staged response flushed so far.
    pub(crate) write_done: usize,
    pub(crate) close_after_write: bool,
    pub(crate) last_active: Instant,
    pub(crate) timer_slot: Option<usize>,
    max_buf: usize,
    arg: Option<Box<dyn Any + Send>>,
}

impl Task {
    pub(crate) fn new(min_buf: usize, max_buf: usize) -> Self {
        Self {
            fd: -1,
            peer: None,
            reactor_index: 0,
            header_size: 0,
            read_state: ReadState::AwaitingHeader,
            write_state: WriteState::Idle,
            read_buf: vec![0; min_buf],
            write_buf: vec![0; min_buf],
            read_done: 0,
            body_len: 0,
            write_len: 0,
            write_done: 0,
            close_after_write: false,
            last_active: Instant::now(),
            timer_slot: None,
            max_buf,
            arg: None,
        }
    }

    /// Bind this task to a freshly accepted connection.
    pub(crate) fn attach(
        &mut self,
        fd: RawFd,
        peer: SocketAddr,
        reactor_index: usize,
        header_size: usize,
    ) {
        self.fd = fd;
        self.peer = Some(peer);
        self.reactor_index = reactor_index;
        self.header_size = header_size;
        self.read_state = ReadState::AwaitingHeader;
        self.write_state = WriteState::Idle;
        self.read_done = 0;
        self.body_len = 0;
        self.write_len = 0;
        self.write_done = 0;
        self.close_after_write = false;
        self.last_active = Instant::now();
        self.timer_slot = None;
    }

    /// Unbind from the connection before returning to the pool.
    /// The socket must already be closed by the caller.
    pub(crate) fn detach(&mut self) {
        self.fd = -1;
        self.peer = None;
        self.timer_slot = None;
        self.arg = None;
    }

    /// Reset message cursors for the next request on a keep-alive
    /// connection. Buffer contents are retained.
    pub(crate) fn reset_for_next_request(&mut self) {
        self.read_state = ReadState::AwaitingHeader;
        self.write_state = WriteState::Idle;
        self.read_done = 0;
        self.body_len = 0;
        self.write_len = 0;
        self.write_done = 0;
    }

    /// Grow the read buffer to hold `needed` bytes. Returns false when
    /// `needed` exceeds the configured maximum.
    pub(crate) fn ensure_read_capacity(&mut self, needed: usize) -> bool {
        if needed > self.max_buf {
            return false;
        }
        if self.read_buf.len() < needed {
            self.read_buf.resize(needed, 0);
        }
        true
    }

    /// The connected socket, or -1 when the task is free.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Peer address of the current connection.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Index of the reactor that owns this connection.
    pub fn reactor_index(&self) -> usize {
        self.reactor_index
    }

    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    /// The request header. Valid once the header is complete.
    pub fn header(&self) -> &[u8] {
        &self.read_buf[..self.header_size]
    }

    /// The request body, `body_len` bytes past the header.
    pub fn body(&self) -> &[u8] {
        &self.read_buf[self.header_size..self.header_size + self.body_len]
    }

    /// The full request, header plus body.
    pub fn request(&self) -> &[u8] {
        &self.read_buf[..self.header_size + self.body_len]
    }

    /// Stage a response to be flushed when the handler returns
    /// [`TaskAction::Respond`](crate::handler::TaskAction::Respond).
    ///
    /// Fails when the response exceeds the configured maximum buffer size.
    pub fn respond(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_buf {
            return Err(Error::Protocol(format!(
                "response length {} exceeds max buffer size {}",
                payload.len(),
                self.max_buf
            )));
        }
        if self.write_buf.len() < payload.len() {
            self.write_buf.resize(payload.len(), 0);
        }
        self.write_buf[..payload.len()].copy_from_slice(payload);
        self.write_len = payload.len();
        self.write_done = 0;
        Ok(())
    }

    /// Close the connection once the staged response has been flushed,
    /// instead of keeping it alive.
    pub fn set_close_after_response(&mut self, close: bool) {
        self.close_after_write = close;
    }

    /// Attach embedder-owned per-connection state. Dropped automatically
    /// when the task returns to the pool.
    pub fn set_arg(&mut self, arg: Box<dyn Any + Send>) {
        self.arg = Some(arg);
    }

    pub fn arg(&self) -> Option<&(dyn Any + Send)> {
        self.arg.as_deref()
    }

    pub fn arg_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.arg.as_deref_mut()
    }

    pub fn take_arg(&mut self) -> Option<Box<dyn Any + Send>> {
        self.arg.take()
    }
}
