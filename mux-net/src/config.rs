//! Service configuration.
//!
//! The framework does not load configuration itself; the embedder fills a
//! [`ServiceConfig`] from whatever source it uses and hands it to
//! [`Service::init`](crate::service::Service::init).

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a mux-net service.
///
/// Two listeners are supported: an *outer* (public) and an *inner*
/// (trusted, intra-cluster) one. When `inner_port` is zero or equal to
/// `outer_port` a single listener is opened.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Bind address for the outer listener. Empty means wildcard.
    pub outer_bind_addr: String,
    pub outer_port: u16,
    /// Bind address for the inner listener. Empty means wildcard.
    pub inner_bind_addr: String,
    /// Inner listener port. Zero disables the inner listener.
    pub inner_port: u16,
    /// Accept threads per listener (see `Service::run_accept_loop` for how
    /// the count is split between outer and inner).
    pub accept_threads: usize,
    /// Number of reactor (worker) threads.
    pub work_threads: usize,
    /// Upper bound on live connections; also bounds the task pool.
    pub max_connections: usize,
    /// Initial size of each per-connection read/write buffer.
    pub min_buf_size: usize,
    /// Hard cap a buffer may grow to on demand.
    pub max_buf_size: usize,
    /// Per-connection idle timeout.
    pub net_timeout: Duration,
    /// Upper bound on a single poller wait, in milliseconds. This bounds
    /// how long a reactor can take to notice a shutdown request.
    pub poll_timeout_ms: u64,
    /// Stack size for service threads. Zero keeps the runtime default.
    pub thread_stack_size: usize,
    /// Log-buffer flush period for the scheduler entry, in seconds.
    pub sync_log_buff_interval: u64,
    /// Register a daily error-log rotation entry.
    pub rotate_error_log: bool,
    /// Days of rotated logs to keep; zero disables deletion.
    pub log_file_keep_days: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            outer_bind_addr: String::new(),
            outer_port: 0,
            inner_bind_addr: String::new(),
            inner_port: 0,
            accept_threads: 1,
            work_threads: 4,
            max_connections: 1024,
            min_buf_size: 8 * 1024,
            max_buf_size: 64 * 1024,
            net_timeout: Duration::from_secs(60),
            poll_timeout_ms: 1000,
            thread_stack_size: 0,
            sync_log_buff_interval: 10,
            rotate_error_log: false,
            log_file_keep_days: 0,
        }
    }
}

impl ServiceConfig {
    /// Whether outer and inner share one listening socket.
    pub fn single_listener(&self) -> bool {
        self.inner_port == 0 || self.inner_port == self.outer_port
    }

    /// Bind address for the shared listener when outer and inner ports are
    /// equal: both addresses set means wildcard, otherwise whichever is
    /// non-empty.
    pub(crate) fn single_bind_addr(&self) -> &str {
        if !self.outer_bind_addr.is_empty() {
            if !self.inner_bind_addr.is_empty() {
                ""
            } else {
                &self.outer_bind_addr
            }
        } else {
            &self.inner_bind_addr
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_threads == 0 {
            return Err(Error::Config("work_threads must be at least 1".into()));
        }
        if self.accept_threads == 0 {
            return Err(Error::Config("accept_threads must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.min_buf_size == 0 || self.min_buf_size > self.max_buf_size {
            return Err(Error::Config(format!(
                "buffer bounds invalid: min {} max {}",
                self.min_buf_size, self.max_buf_size
            )));
        }
        if self.net_timeout.is_zero() {
            return Err(Error::Config("net_timeout must be non-zero".into()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(Error::Config("poll_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = ServiceConfig {
            work_threads: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_buffer_bounds() {
        let cfg = ServiceConfig {
            min_buf_size: 64 * 1024,
            max_buf_size: 4 * 1024,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn single_listener_detection() {
        let mut cfg = ServiceConfig {
            outer_port: 9000,
            ..Default::default()
        };
        assert!(cfg.single_listener());
        cfg.inner_port = 9000;
        assert!(cfg.single_listener());
        cfg.inner_port = 9001;
        assert!(!cfg.single_listener());
    }

    #[test]
    fn shared_bind_addr_resolution() {
        let mut cfg = ServiceConfig::default();
        assert_eq!(cfg.single_bind_addr(), "");

        cfg.outer_bind_addr = "10.0.0.1".into();
        assert_eq!(cfg.single_bind_addr(), "10.0.0.1");

        cfg.inner_bind_addr = "192.168.0.1".into();
        // Both set: fall back to wildcard so both sides can reach it.
        assert_eq!(cfg.single_bind_addr(), "");

        cfg.outer_bind_addr.clear();
        assert_eq!(cfg.single_bind_addr(), "192.168.0.1");
    }
}
