//! Multi-reactor TCP service framework.
//!
//! mux-net is the network skeleton for protocol services: it owns socket
//! lifecycle, connection acceptance, per-connection buffers,
//! readiness-driven I/O, idle timeouts, and signal-driven shutdown. The
//! embedder supplies only framing and request policy through the
//! [`ServiceHandler`] trait; the framework never inspects message
//! contents.
//!
//! # Architecture
//!
//! - N reactors, each a single-threaded epoll loop with its own timer
//!   wheel. A connection belongs to exactly one reactor for its whole
//!   life, so its state machine runs lock-free.
//! - An accept plane of blocking accept threads hashes each new
//!   connection to a reactor (`fd mod N`) and transfers the pooled task
//!   through that reactor's handoff pipe.
//! - A bounded task pool caps live connections and amortizes buffer
//!   allocation with chunked growth.
//! - One process-wide continue flag, toggled by signal handlers, gates
//!   every loop.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mux_net::{Service, ServiceConfig, ServiceHandler, Task, TaskAction};
//!
//! struct Echo;
//!
//! impl ServiceHandler for Echo {
//!     fn header_size(&self) -> usize {
//!         8
//!     }
//!
//!     fn body_length(&self, header: &[u8]) -> mux_net::Result<usize> {
//!         let mut raw = [0u8; 8];
//!         raw.copy_from_slice(header);
//!         Ok(u64::from_be_bytes(raw) as usize)
//!     }
//!
//!     fn process(&self, task: &mut Task) -> mux_net::Result<TaskAction> {
//!         let request = task.request().to_vec();
//!         task.respond(&request)?;
//!         Ok(TaskAction::Respond)
//!     }
//! }
//!
//! fn main() -> mux_net::Result<()> {
//!     mux_net::lifecycle::install_signal_handlers()?;
//!     let config = ServiceConfig {
//!         outer_port: 7000,
//!         ..Default::default()
//!     };
//!     let mut service = Service::init(config, Arc::new(Echo))?;
//!     service.listen()?;
//!     service.run_accept_loop()?;
//!     service.destroy();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod pool;
mod reactor;
pub mod service;
pub mod task;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use handler::{ReactorContext, ServiceHandler, TaskAction};
pub use pool::{PoolStats, TaskPool};
pub use service::Service;
pub use service::lifecycle;
pub use service::schedule::{
    LogMaintenance, ScheduleEntry, Scheduler, TimeOfDay, next_schedule_id, startup_schedule,
};
pub use task::{ReadState, Task, WriteState};
