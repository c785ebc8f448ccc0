//! Service assembly: startup ordering, listeners, accept loop, teardown.
//!
//! The embedder drives the lifecycle in the same order the framework was
//! designed around:
//!
//! 1. [`lifecycle::install_signal_handlers`]
//! 2. [`Service::init`]: task pool, reactors, reactor threads
//! 3. [`Service::listen`]: listening sockets
//! 4. [`schedule::startup_schedule`]: maintenance entries (optional)
//! 5. [`Service::run_accept_loop`]: blocks the calling thread until
//!    shutdown
//! 6. [`Service::destroy`]: join reactors, release the pool

pub(crate) mod accept;
pub mod lifecycle;
pub mod schedule;

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::handler::ServiceHandler;
use crate::pool::{PoolStats, TaskPool};
use crate::reactor::{HandoffSender, Reactor, handoff_pair};

use accept::AcceptShared;

/// A running multi-reactor service.
pub struct Service {
    config: ServiceConfig,
    handler: Arc<dyn ServiceHandler>,
    pool: Arc<TaskPool>,
    senders: Arc<Vec<HandoffSender>>,
    workers: Vec<JoinHandle<()>>,
    worker_count: Arc<AtomicUsize>,
    outer: Option<TcpListener>,
    inner: Option<TcpListener>,
    started_at: Instant,
}

impl Service {
    /// Initialize the pool and spawn the reactor threads.
    ///
    /// Fails fast: any allocation, poller, pipe, or thread error aborts
    /// startup and is reported with an errno-compatible
    /// [`exit_code`](Error::exit_code). No partial startup survives an
    /// error; reactors already spawned exit with the next shutdown
    /// request.
    pub fn init(config: ServiceConfig, handler: Arc<dyn ServiceHandler>) -> Result<Self> {
        config.validate()?;
        let header_size = handler.header_size();
        if header_size == 0 || header_size > config.min_buf_size {
            return Err(Error::Config(format!(
                "header size {} must be in 1..={}",
                header_size, config.min_buf_size
            )));
        }

        let pool = Arc::new(TaskPool::new(
            config.max_connections,
            config.min_buf_size,
            config.max_buf_size,
        ));
        let started_at = Instant::now();
        let worker_count = Arc::new(AtomicUsize::new(0));
        let mut senders = Vec::with_capacity(config.work_threads);
        let mut workers = Vec::with_capacity(config.work_threads);

        for index in 0..config.work_threads {
            let (tx, rx) = handoff_pair()?;
            let reactor = Reactor::new(
                index,
                &config,
                handler.clone(),
                pool.clone(),
                rx,
                started_at,
            )?;
            let handle = spawn_reactor(
                reactor,
                index,
                config.thread_stack_size,
                worker_count.clone(),
            )?;
            senders.push(tx);
            workers.push(handle);
        }

        info!(
            workers = config.work_threads,
            max_connections = config.max_connections,
            "service initialized"
        );
        Ok(Self {
            config,
            handler,
            pool,
            senders: Arc::new(senders),
            workers,
            worker_count,
            outer: None,
            inner: None,
            started_at,
        })
    }

    /// Open the listening sockets.
    ///
    /// With distinct outer and inner ports, two listeners are opened with
    /// their own bind addresses. With equal ports (or no inner port) a
    /// single socket serves both roles; if both bind addresses are set it
    /// binds the wildcard, otherwise whichever address is non-empty.
    pub fn listen(&mut self) -> Result<()> {
        if self.config.single_listener() {
            let outer = accept::open_listener(
                self.config.single_bind_addr(),
                self.config.outer_port,
                self.config.net_timeout,
            )?;
            info!(addr = ?outer.local_addr().ok(), "listening");
            self.outer = Some(outer);
        } else {
            let outer = accept::open_listener(
                &self.config.outer_bind_addr,
                self.config.outer_port,
                self.config.net_timeout,
            )?;
            let inner = accept::open_listener(
                &self.config.inner_bind_addr,
                self.config.inner_port,
                self.config.net_timeout,
            )?;
            info!(
                outer = ?outer.local_addr().ok(),
                inner = ?inner.local_addr().ok(),
                "listening"
            );
            self.outer = Some(outer);
            self.inner = Some(inner);
        }
        Ok(())
    }

    /// Local address of the outer listener, once [`listen`](Self::listen)
    /// has run. Useful when binding to port 0.
    pub fn outer_addr(&self) -> Option<SocketAddr> {
        self.outer.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Local address of the inner listener, when one exists.
    pub fn inner_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Start the accept plane and serve the outer listener on the calling
    /// thread until shutdown.
    ///
    /// With two listeners the inner one gets the configured
    /// `accept_threads`; the outer gets `accept_threads - 1` spawned
    /// threads plus the calling thread, so the public side is never
    /// starved.
    pub fn run_accept_loop(&self) -> Result<()> {
        let outer = self
            .outer
            .as_ref()
            .ok_or_else(|| Error::Config("run_accept_loop called before listen".into()))?;
        let shared = Arc::new(AcceptShared {
            pool: self.pool.clone(),
            senders: self.senders.clone(),
            handler: self.handler.clone(),
        });
        let stack = self.config.thread_stack_size;
        if let Some(inner) = &self.inner {
            accept::spawn_accept_threads(inner, true, self.config.accept_threads, &shared, stack)?;
        }
        accept::spawn_accept_threads(
            outer,
            false,
            self.config.accept_threads - 1,
            &shared,
            stack,
        )?;
        accept::accept_loop(outer, false, &shared);
        Ok(())
    }

    /// Reactor threads still running.
    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::SeqCst)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Shared handle to the task pool, e.g. for observing counters after
    /// the service itself has been destroyed.
    pub fn pool(&self) -> Arc<TaskPool> {
        self.pool.clone()
    }

    /// Seconds since [`init`](Self::init).
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Tear the service down: request shutdown (idempotent), join every
    /// reactor thread, then release the pool. Each reactor notices the
    /// cleared flag within one poller timeout.
    pub fn destroy(mut self) {
        lifecycle::request_shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
        info!("service stopped");
    }
}

fn spawn_reactor(
    reactor: Reactor,
    index: usize,
    stack_size: usize,
    worker_count: Arc<AtomicUsize>,
) -> Result<JoinHandle<()>> {
    let mut builder = std::thread::Builder::new().name(format!("reactor-{index}"));
    if stack_size > 0 {
        builder = builder.stack_size(stack_size);
    }
    worker_count.fetch_add(1, Ordering::SeqCst);
    let counter = worker_count.clone();
    match builder.spawn(move || {
        reactor.run();
        counter.fetch_sub(1, Ordering::SeqCst);
    }) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            worker_count.fetch_sub(1, Ordering::SeqCst);
            Err(Error::Thread(e))
        }
    }
}
