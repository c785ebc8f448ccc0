//! The embedder contract.
//!
//! A protocol implementation plugs into the framework through a single
//! [`ServiceHandler`] trait object. The framework owns sockets, buffers,
//! readiness and timeouts; the handler owns message framing and request
//! semantics. It never sees a partial message: `process` is only called
//! once the byte range declared by `body_length` is fully buffered.

use std::any::Any;

use crate::error::Result;
use crate::task::Task;

/// What the reactor should do with a connection after `process` returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAction {
    /// Flush the response staged with [`Task::respond`], then keep the
    /// connection alive (unless [`Task::set_close_after_response`] was set).
    Respond,
    /// No response; go straight back to reading the next request header.
    KeepReading,
    /// Close the connection.
    Close,
}

/// Per-iteration view of a reactor handed to [`ServiceHandler::reactor_tick`].
pub struct ReactorContext<'a> {
    /// Index of the reactor thread, `0..work_threads`.
    pub index: usize,
    /// The private state produced by [`ServiceHandler::alloc_reactor_extra`],
    /// if any.
    pub extra: Option<&'a mut (dyn Any + Send)>,
}

/// Protocol callbacks consumed by the framework.
///
/// All methods except `accept_done` run on a reactor thread and must not
/// block; a handler that needs to block has to off-load the work and feed
/// the result back through its own channel.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Fixed size of the protocol header, in bytes. Must be non-zero and
    /// no larger than `min_buf_size`.
    fn header_size(&self) -> usize;

    /// Parse a complete header and return the body length it declares.
    ///
    /// An error closes the connection without dispatching. Lengths larger
    /// than `max_buf_size - header_size` are rejected by the reactor
    /// before any buffer grows.
    fn body_length(&self, header: &[u8]) -> Result<usize>;

    /// Handle a fully received request.
    ///
    /// The request bytes are available through [`Task::request`]. To send a
    /// reply, stage it with [`Task::respond`] and return
    /// [`TaskAction::Respond`]. Errors close the connection.
    fn process(&self, task: &mut Task) -> Result<TaskAction>;

    /// Produce per-reactor private state, called on the main thread before
    /// the reactor starts.
    fn alloc_reactor_extra(&self, index: usize) -> Option<Box<dyn Any + Send>> {
        let _ = index;
        None
    }

    /// Invoked once per reactor loop iteration for slow-path maintenance.
    fn reactor_tick(&self, ctx: ReactorContext<'_>) {
        let _ = ctx;
    }

    /// Post-accept hook, invoked on the accept thread after the task has
    /// been bound to a connection but before it is handed to a reactor.
    /// `inner_listener` is true when the connection arrived on the inner
    /// (trusted) listener.
    fn accept_done(&self, task: &mut Task, inner_listener: bool) {
        let _ = (task, inner_listener);
    }

    /// Release embedder-owned per-connection resources. Invoked exactly
    /// once per connection, right before the task returns to the pool.
    fn cleanup(&self, task: &mut Task) {
        let _ = task;
    }

    /// Invoked when a connection has been idle past `net_timeout`.
    /// Return true to close it (the default) or false to keep it and
    /// re-arm the timer for a full timeout period.
    fn timed_out(&self, task: &mut Task) -> bool {
        let _ = task;
        true
    }
}
