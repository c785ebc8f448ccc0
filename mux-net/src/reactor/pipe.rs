//! Handoff channel between accept threads and a reactor.
//!
//! One unidirectional kernel pipe per reactor. Accept threads write
//! pointer-sized values; POSIX guarantees writes up to PIPE_BUF are
//! atomic, so concurrent senders never interleave within one pointer.
//! The read end is non-blocking and drained in batches on readiness,
//! which makes accept-to-reactor latency one poll wake-up with no mutex
//! or condition variable anywhere on the path.
//!
//! Ownership of the boxed task transfers through the pipe: the sender
//! leaks the box into a raw pointer, the receiver reconstructs it. A task
//! is therefore always owned by exactly one side, never shared.

use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use arrayvec::ArrayVec;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tracing::warn;

use crate::error::{Error, Result};
use crate::task::Task;

/// Tasks drained from the pipe in one read.
pub(crate) const HANDOFF_BATCH: usize = 64;

const PTR_SIZE: usize = size_of::<usize>();

pub(crate) struct HandoffSender {
    wr: OwnedFd,
}

pub(crate) struct HandoffReceiver {
    rd: OwnedFd,
}

pub(crate) fn handoff_pair() -> Result<(HandoffSender, HandoffReceiver)> {
    let (rd, wr) = nix::unistd::pipe().map_err(|e| Error::os("pipe", e))?;
    fcntl(&rd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(|e| Error::os("fcntl", e))?;
    Ok((HandoffSender { wr }, HandoffReceiver { rd }))
}

impl HandoffSender {
    /// Transfer ownership of `task` to the receiving reactor.
    ///
    /// On failure (closed pipe, or the theoretically impossible short
    /// write of a pointer-sized value) the task is handed back so the
    /// caller can close the socket and release it.
    pub(crate) fn send(&self, task: Box<Task>) -> std::result::Result<(), Box<Task>> {
        let ptr = Box::into_raw(task);
        let bytes = (ptr as usize).to_ne_bytes();
        match nix::unistd::write(self.wr.as_fd(), &bytes) {
            Ok(n) if n == PTR_SIZE => Ok(()),
            // SAFETY: the pointer was produced by Box::into_raw above and
            // was not consumed by the receiver.
            _ => Err(unsafe { Box::from_raw(ptr) }),
        }
    }
}

impl HandoffReceiver {
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.rd.as_raw_fd()
    }

    /// Drain up to one batch of task pointers. Returns true when the pipe
    /// may still hold more, so the caller loops until it reports false.
    pub(crate) fn recv_batch(&self, out: &mut ArrayVec<Box<Task>, HANDOFF_BATCH>) -> bool {
        let mut buf = [0u8; HANDOFF_BATCH * PTR_SIZE];
        match nix::unistd::read(self.rd.as_fd(), &mut buf) {
            Ok(0) => false,
            Ok(n) => {
                // Atomic pointer-sized writes keep the stream aligned, so
                // n is always a whole number of pointers.
                for chunk in buf[..n].chunks_exact(PTR_SIZE) {
                    let mut raw = [0u8; PTR_SIZE];
                    raw.copy_from_slice(chunk);
                    let ptr = usize::from_ne_bytes(raw) as *mut Task;
                    // SAFETY: the sender produced this pointer with
                    // Box::into_raw and gave up ownership by writing it.
                    out.push(unsafe { Box::from_raw(ptr) });
                }
                n == buf.len()
            }
            Err(Errno::EAGAIN) => false,
            Err(Errno::EINTR) => true,
            Err(e) => {
                warn!(error = %e, "handoff pipe read failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task(marker: u32) -> Box<Task> {
        let mut task = Box::new(Task::new(64, 256));
        task.set_arg(Box::new(marker));
        task
    }

    fn marker_of(task: &Task) -> u32 {
        *task.arg().and_then(|a| a.downcast_ref::<u32>()).unwrap()
    }

    #[test]
    fn tasks_round_trip_in_order() {
        let (tx, rx) = handoff_pair().unwrap();
        tx.send(test_task(1)).unwrap();
        tx.send(test_task(2)).unwrap();
        tx.send(test_task(3)).unwrap();

        let mut batch = ArrayVec::new();
        let more = rx.recv_batch(&mut batch);
        assert!(!more);
        let markers: Vec<u32> = batch.iter().map(|t| marker_of(t)).collect();
        assert_eq!(markers, vec![1, 2, 3]);
    }

    #[test]
    fn empty_pipe_reports_no_more() {
        let (_tx, rx) = handoff_pair().unwrap();
        let mut batch = ArrayVec::new();
        assert!(!rx.recv_batch(&mut batch));
        assert!(batch.is_empty());
    }

    #[test]
    fn send_after_receiver_drop_returns_task() {
        let (tx, rx) = handoff_pair().unwrap();
        drop(rx);
        // The Rust runtime ignores SIGPIPE, so the write fails with EPIPE
        // and the task comes back.
        let task = test_task(9);
        match tx.send(task) {
            Err(task) => assert_eq!(marker_of(&task), 9),
            Ok(()) => panic!("send to closed pipe succeeded"),
        }
    }

    #[test]
    fn full_batch_signals_more() {
        let (tx, rx) = handoff_pair().unwrap();
        for i in 0..(HANDOFF_BATCH as u32 + 5) {
            tx.send(test_task(i)).unwrap();
        }
        let mut batch = ArrayVec::new();
        assert!(rx.recv_batch(&mut batch));
        assert_eq!(batch.len(), HANDOFF_BATCH);
        batch.clear();
        assert!(!rx.recv_batch(&mut batch));
        assert_eq!(batch.len(), 5);
    }
}
