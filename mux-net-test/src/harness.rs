//! Integration-test harness.
//!
//! Runs a full service (reactors, accept plane, listeners) on ephemeral
//! loopback ports, with the accept loop on a background thread so the
//! test thread can act as a client. Shutdown is cooperative: the harness
//! clears the continue flag, pokes each listener once to unblock its
//! blocking `accept`, joins the service, and resets the lifecycle for
//! the next test. Tests using the harness must be serialized because the
//! continue flag is process-global.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mux_net::pool::TaskPool;
use mux_net::{PoolStats, Result, Service, ServiceConfig, ServiceHandler, lifecycle};

pub struct TestService {
    pub outer_addr: SocketAddr,
    pub inner_addr: Option<SocketAddr>,
    pool: Arc<TaskPool>,
    join: Option<JoinHandle<()>>,
}

impl TestService {
    /// Initialize, listen, and start serving in the background.
    pub fn start(config: ServiceConfig, handler: Arc<dyn ServiceHandler>) -> Result<Self> {
        lifecycle::reset();
        let mut service = Service::init(config, handler)?;
        service.listen()?;
        let outer_addr = service
            .outer_addr()
            .ok_or_else(|| mux_net::Error::Config("outer listener missing".into()))?;
        let inner_addr = service.inner_addr();
        let pool = service.pool();
        let join = std::thread::spawn(move || {
            let _ = service.run_accept_loop();
            service.destroy();
        });
        Ok(Self {
            outer_addr,
            inner_addr,
            pool,
            join: Some(join),
        })
    }

    pub fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(self.outer_addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        Ok(stream)
    }

    pub fn connect_inner(&self) -> std::io::Result<TcpStream> {
        let addr = self
            .inner_addr
            .expect("service has no inner listener");
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        Ok(stream)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Poll until `predicate` holds or the deadline passes.
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        predicate()
    }

    /// Stop the service and wait for every reactor to exit.
    pub fn shutdown(mut self) -> PoolStats {
        lifecycle::request_shutdown();
        // Unblock the blocking accept calls so the loops observe the flag.
        let _ = TcpStream::connect(self.outer_addr);
        if let Some(inner) = self.inner_addr {
            let _ = TcpStream::connect(inner);
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        // Give spawned accept threads a moment to observe the flag before
        // the lifecycle is reset for the next test.
        std::thread::sleep(Duration::from_millis(50));
        let stats = self.pool.stats();
        lifecycle::reset();
        stats
    }
}
