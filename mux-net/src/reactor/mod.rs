//! The reactor: one single-threaded event loop per worker.
//!
//! Each reactor owns a readiness poller, a timer wheel, the read end of
//! its handoff pipe, and every connection that was hashed to it. A
//! connection is touched by exactly one reactor from handoff to close,
//! so the per-connection state machine runs without any locking.
//!
//! # Loop shape
//!
//! 1. Wait on the poller, bounded by `poll_timeout_ms`.
//! 2. Dispatch ready events: the handoff pipe delivers new connections,
//!    sockets drive the read/write state machine.
//! 3. Advance the timer wheel and expire idle connections.
//! 4. Run the embedder's per-iteration hook.
//! 5. Re-check the continue flag.
//!
//! The reactor is the error firewall: anything that does not corrupt the
//! pool or reactor state stays connection-local and ends, at worst, in
//! that one connection closing.

mod pipe;
mod poller;
mod timer;

pub(crate) use pipe::{HANDOFF_BATCH, HandoffReceiver, HandoffSender, handoff_pair};

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use nix::errno::Errno;
use nix::sys::epoll::{EpollEvent, EpollFlags};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::handler::{ReactorContext, ServiceHandler, TaskAction};
use crate::pool::TaskPool;
use crate::service::lifecycle;
use crate::task::{ReadState, Task, WriteState};

use poller::Poller;
use timer::TimerWheel;

/// Events collected per poller wait.
const EVENT_BATCH: usize = 256;

/// Borrow a connection descriptor for one syscall. The reactor's task map
/// keeps it open.
fn fd_ref(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: the fd belongs to a task currently owned by this reactor
    // and is not closed until the task leaves the map.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

pub(crate) struct Reactor {
    index: usize,
    handler: Arc<dyn ServiceHandler>,
    pool: Arc<TaskPool>,
    poller: Poller,
    timer: TimerWheel,
    handoff: HandoffReceiver,
    tasks: HashMap<RawFd, Box<Task>>,
    extra: Option<Box<dyn std::any::Any + Send>>,
    net_timeout: Duration,
    poll_timeout_ms: u64,
    max_buf: usize,
    /// Service start instant; the timer wheel's coarse clock counts
    /// seconds from here.
    epoch: Instant,
    expired_scratch: Vec<RawFd>,
}

impl Reactor {
    pub(crate) fn new(
        index: usize,
        config: &ServiceConfig,
        handler: Arc<dyn ServiceHandler>,
        pool: Arc<TaskPool>,
        handoff: HandoffReceiver,
        epoch: Instant,
    ) -> Result<Self> {
        let poller = Poller::new()?;
        poller.register_read(handoff.raw_fd())?;
        let now = epoch.elapsed().as_secs();
        let timer = TimerWheel::new(config.net_timeout.as_secs().max(1), now);
        let extra = handler.alloc_reactor_extra(index);
        Ok(Self {
            index,
            handler,
            pool,
            poller,
            timer,
            handoff,
            tasks: HashMap::new(),
            extra,
            net_timeout: config.net_timeout,
            poll_timeout_ms: config.poll_timeout_ms,
            max_buf: config.max_buf_size,
            epoch,
            expired_scratch: Vec::new(),
        })
    }

    fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Run until the continue flag clears, then sweep remaining
    /// connections back into the pool.
    pub(crate) fn run(mut self) {
        debug!(reactor = self.index, "reactor started");
        let mut events: Vec<EpollEvent> = (0..EVENT_BATCH).map(|_| EpollEvent::empty()).collect();
        while lifecycle::running() {
            let ready = match self.poller.wait(&mut events, self.poll_timeout_ms) {
                Ok(n) => n,
                Err(e) => {
                    warn!(reactor = self.index, error = %e, "poller wait failed, stopping");
                    break;
                }
            };
            for event in &events[..ready] {
                let fd = event.data() as RawFd;
                if fd == self.handoff.raw_fd() {
                    self.drain_handoff();
                } else {
                    self.handle_event(fd, event.events());
                }
            }
            self.expire_timers();
            lifecycle::log_pending_signal_events();
            if lifecycle::take_dump_request() {
                self.dump_state();
            }
            let handler = self.handler.clone();
            handler.reactor_tick(ReactorContext {
                index: self.index,
                extra: self.extra.as_deref_mut(),
            });
        }
        self.shutdown_sweep();
        debug!(reactor = self.index, "reactor stopped");
    }

    /// Pull newly accepted connections off the handoff pipe and register
    /// them for read readiness.
    fn drain_handoff(&mut self) {
        let mut batch: ArrayVec<Box<Task>, HANDOFF_BATCH> = ArrayVec::new();
        loop {
            let more = self.handoff.recv_batch(&mut batch);
            for task in batch.drain(..) {
                self.register_task(task);
            }
            if !more {
                break;
            }
        }
    }

    fn register_task(&mut self, mut task: Box<Task>) {
        let fd = task.fd;
        task.last_active = Instant::now();
        if let Err(e) = self.poller.register_read(fd) {
            warn!(reactor = self.index, fd, error = %e, "failed to register connection");
            self.close_task(task);
            return;
        }
        let expires = self.now_secs() + self.net_timeout.as_secs();
        task.timer_slot = Some(self.timer.insert(expires, fd));
        debug!(reactor = self.index, fd, peer = ?task.peer, "connection registered");
        self.tasks.insert(fd, task);
    }

    fn handle_event(&mut self, fd: RawFd, flags: EpollFlags) {
        // A connection closed earlier in this batch may leave a stale
        // event behind.
        let Some(mut task) = self.tasks.remove(&fd) else {
            return;
        };
        let mut alive = true;
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            debug!(reactor = self.index, fd, "socket error or hangup");
            alive = false;
        }
        if alive && flags.contains(EpollFlags::EPOLLIN) && task.write_state != WriteState::Sending {
            alive = self.do_read(&mut task);
        }
        if alive && flags.contains(EpollFlags::EPOLLOUT) && task.write_state == WriteState::Sending
        {
            alive = self.do_write(&mut task);
        }
        if alive {
            self.tasks.insert(fd, task);
        } else {
            self.close_task(task);
        }
    }

    /// Drive the receive side. Returns false when the connection must
    /// close.
    fn do_read(&mut self, task: &mut Box<Task>) -> bool {
        let fd = task.fd;
        loop {
            let target = match task.read_state {
                ReadState::AwaitingHeader => task.header_size,
                ReadState::AwaitingBody => task.header_size + task.body_len,
                ReadState::Dispatched | ReadState::Closing => return true,
            };
            if task.read_done < target {
                let buf = &mut task.read_buf[task.read_done..target];
                match nix::unistd::read(fd_ref(fd), buf) {
                    Ok(0) => {
                        debug!(reactor = self.index, fd, "peer closed connection");
                        return false;
                    }
                    Ok(n) => {
                        task.read_done += n;
                        task.last_active = Instant::now();
                        if task.read_done < target {
                            continue;
                        }
                    }
                    Err(Errno::EAGAIN) => return true,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        warn!(reactor = self.index, fd, error = %e, "read failed");
                        return false;
                    }
                }
            }
            match task.read_state {
                ReadState::AwaitingHeader => {
                    let body_len = match self.handler.body_length(task.header()) {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(reactor = self.index, fd, error = %e, "invalid request header");
                            return false;
                        }
                    };
                    if body_len > self.max_buf - task.header_size {
                        warn!(
                            reactor = self.index,
                            fd,
                            body_len,
                            limit = self.max_buf - task.header_size,
                            "declared body length exceeds buffer limit"
                        );
                        return false;
                    }
                    task.body_len = body_len;
                    if body_len == 0 {
                        return self.dispatch(task);
                    }
                    if !task.ensure_read_capacity(task.header_size + body_len) {
                        warn!(reactor = self.index, fd, body_len, "read buffer growth refused");
                        return false;
                    }
                    task.read_state = ReadState::AwaitingBody;
                }
                ReadState::AwaitingBody => return self.dispatch(task),
                ReadState::Dispatched | ReadState::Closing => return true,
            }
        }
    }

    /// Hand a complete request to the embedder and act on its verdict.
    fn dispatch(&mut self, task: &mut Box<Task>) -> bool {
        task.read_state = ReadState::Dispatched;
        match self.handler.process(task) {
            Ok(TaskAction::Respond) => self.begin_send(task),
            Ok(TaskAction::KeepReading) => {
                task.reset_for_next_request();
                true
            }
            Ok(TaskAction::Close) => {
                debug!(reactor = self.index, fd = task.fd, "handler requested close");
                false
            }
            Err(e) => {
                warn!(reactor = self.index, fd = task.fd, error = %e, "request handler failed");
                false
            }
        }
    }

    fn begin_send(&mut self, task: &mut Box<Task>) -> bool {
        if task.write_len == 0 {
            warn!(
                reactor = self.index,
                fd = task.fd,
                "respond action without a staged response"
            );
            return false;
        }
        task.write_state = WriteState::Sending;
        self.do_write(task)
    }

    /// Flush the staged response. Returns false when the connection must
    /// close. Write readiness is only armed while a send is actually
    /// blocked; leaving the sending state drops write interest again.
    fn do_write(&mut self, task: &mut Box<Task>) -> bool {
        let fd = task.fd;
        while task.write_done < task.write_len {
            let buf = &task.write_buf[task.write_done..task.write_len];
            match nix::unistd::write(fd_ref(fd), buf) {
                Ok(0) => {
                    warn!(reactor = self.index, fd, "write returned zero");
                    return false;
                }
                Ok(n) => {
                    task.write_done += n;
                    task.last_active = Instant::now();
                }
                Err(Errno::EAGAIN) => {
                    if let Err(e) = self.poller.set_interest(fd, false, true) {
                        warn!(reactor = self.index, fd, error = %e, "failed to arm write interest");
                        return false;
                    }
                    return true;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(reactor = self.index, fd, error = %e, "write failed");
                    return false;
                }
            }
        }
        if task.close_after_write {
            debug!(reactor = self.index, fd, "closing after response");
            return false;
        }
        task.reset_for_next_request();
        if let Err(e) = self.poller.set_interest(fd, true, false) {
            warn!(reactor = self.index, fd, error = %e, "failed to restore read interest");
            return false;
        }
        true
    }

    /// Expire connections idle past `net_timeout`. An entry that fires
    /// early (activity happened since it was inserted) is re-armed for
    /// the remaining idle budget.
    fn expire_timers(&mut self) {
        let now = self.now_secs();
        let mut expired = std::mem::take(&mut self.expired_scratch);
        self.timer.advance(now, &mut expired);
        for fd in expired.drain(..) {
            let Some(mut task) = self.tasks.remove(&fd) else {
                continue;
            };
            task.timer_slot = None;
            let idle = task.last_active.elapsed();
            if idle >= self.net_timeout {
                if self.handler.timed_out(&mut task) {
                    info!(
                        reactor = self.index,
                        fd,
                        idle_secs = idle.as_secs(),
                        peer = ?task.peer,
                        "idle connection timed out"
                    );
                    self.close_task(task);
                    continue;
                }
                task.last_active = Instant::now();
                task.timer_slot = Some(self.timer.insert(now + self.net_timeout.as_secs(), fd));
            } else {
                let remaining = (self.net_timeout - idle).as_secs() + 1;
                task.timer_slot = Some(self.timer.insert(now + remaining, fd));
            }
            self.tasks.insert(fd, task);
        }
        self.expired_scratch = expired;
    }

    /// Tear a connection down and return its task to the pool.
    fn close_task(&mut self, mut task: Box<Task>) {
        let fd = task.fd;
        task.read_state = ReadState::Closing;
        self.handler.cleanup(&mut task);
        if let Some(slot) = task.timer_slot.take() {
            self.timer.remove(slot, fd);
        }
        let _ = self.poller.deregister(fd);
        if fd >= 0 {
            let _ = nix::unistd::close(fd);
        }
        task.detach();
        self.pool.push(task);
    }

    /// Close every connection this reactor still owns, including any that
    /// were in flight on the handoff pipe when shutdown was requested.
    fn shutdown_sweep(&mut self) {
        let mut batch: ArrayVec<Box<Task>, HANDOFF_BATCH> = ArrayVec::new();
        loop {
            let more = self.handoff.recv_batch(&mut batch);
            for task in batch.drain(..) {
                self.close_task(task);
            }
            if !more {
                break;
            }
        }
        let fds: Vec<RawFd> = self.tasks.keys().copied().collect();
        for fd in fds {
            if let Some(task) = self.tasks.remove(&fd) {
                self.close_task(task);
            }
        }
    }

    #[cfg(debug_assertions)]
    fn dump_state(&self) {
        let stats = self.pool.stats();
        info!(
            reactor = self.index,
            connections = self.tasks.len(),
            pool_allocated = stats.allocated,
            pool_in_use = stats.in_use,
            pool_max = stats.max,
            "state dump"
        );
    }

    #[cfg(not(debug_assertions))]
    fn dump_state(&self) {}
}
