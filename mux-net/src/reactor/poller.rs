//! Level-triggered epoll wrapper.
//!
//! Each reactor owns one [`Poller`]. Event payloads carry the raw fd so
//! the reactor can look the connection up in its task map without any
//! shared registry.

use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::{Error, Result};

pub(crate) struct Poller {
    epoll: Epoll,
}

/// Borrow a descriptor the caller guarantees is open for the duration of
/// the epoll_ctl call.
fn fd_ref(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: callers pass fds owned by the reactor's task map (or its
    // handoff pipe), which stay open until deregistered.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn interest_flags(readable: bool, writable: bool) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if readable {
        flags |= EpollFlags::EPOLLIN;
    }
    if writable {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::os("epoll_create", e))?;
        Ok(Self { epoll })
    }

    /// Register a descriptor for read readiness.
    pub(crate) fn register_read(&self, fd: RawFd) -> Result<()> {
        self.epoll
            .add(fd_ref(fd), EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
            .map_err(|e| Error::os("epoll_ctl add", e))
    }

    /// Replace the interest set of a registered descriptor.
    pub(crate) fn set_interest(&self, fd: RawFd, readable: bool, writable: bool) -> Result<()> {
        let mut event = EpollEvent::new(interest_flags(readable, writable), fd as u64);
        self.epoll
            .modify(fd_ref(fd), &mut event)
            .map_err(|e| Error::os("epoll_ctl mod", e))
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> Result<()> {
        self.epoll
            .delete(fd_ref(fd))
            .map_err(|e| Error::os("epoll_ctl del", e))
    }

    /// Wait for events, up to `timeout_ms`. A signal interruption reports
    /// zero events so the loop can observe the continue flag.
    pub(crate) fn wait(&self, events: &mut [EpollEvent], timeout_ms: u64) -> Result<usize> {
        let timeout = EpollTimeout::from(timeout_ms.min(u64::from(u16::MAX)) as u16);
        match self.epoll.wait(events, timeout) {
            Ok(n) => Ok(n),
            Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(Error::os("epoll_wait", e)),
        }
    }
}
