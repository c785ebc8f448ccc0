//! The accept plane: listening sockets and accept threads.
//!
//! Accept threads block in `accept`, bind each new connection to a pooled
//! task, pick its reactor as `fd mod work_threads`, and push the task
//! through that reactor's handoff pipe. The modulo dispatch keeps the
//! plane coordination-free: no shared counter, no RNG, and fd values
//! cycle evenly enough in practice.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::IntoRawFd;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::handler::ServiceHandler;
use crate::pool::TaskPool;
use crate::reactor::HandoffSender;
use crate::service::lifecycle;

const LISTEN_BACKLOG: i32 = 1024;

/// State shared by every accept thread.
pub(crate) struct AcceptShared {
    pub(crate) pool: Arc<TaskPool>,
    pub(crate) senders: Arc<Vec<HandoffSender>>,
    pub(crate) handler: Arc<dyn ServiceHandler>,
}

/// Open a listening socket. An empty bind address means wildcard.
/// Keepalive probes are tied to the idle timeout, matching the
/// per-connection timer.
pub(crate) fn open_listener(
    bind_addr: &str,
    port: u16,
    keepalive: Duration,
) -> Result<TcpListener> {
    let ip: IpAddr = if bind_addr.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        bind_addr
            .parse()
            .map_err(|_| Error::Config(format!("invalid bind address: {bind_addr}")))?
    };
    let addr = SocketAddr::new(ip, port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::socket("create", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::socket("set reuse_address", e))?;
    socket
        .set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))
        .map_err(|e| Error::socket("set keepalive", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::socket("bind", e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| Error::socket("listen", e))?;
    Ok(socket.into())
}

pub(crate) fn spawn_accept_threads(
    listener: &TcpListener,
    inner_listener: bool,
    count: usize,
    shared: &Arc<AcceptShared>,
    stack_size: usize,
) -> Result<()> {
    let side = if inner_listener { "inner" } else { "outer" };
    for i in 0..count {
        let listener = listener
            .try_clone()
            .map_err(|e| Error::socket("dup listener", e))?;
        let shared = shared.clone();
        let mut builder = std::thread::Builder::new().name(format!("accept-{side}-{i}"));
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }
        builder
            .spawn(move || accept_loop(&listener, inner_listener, &shared))
            .map_err(Error::Thread)?;
    }
    Ok(())
}

/// Serve one listener until shutdown. Accept errors are never fatal for
/// the plane: they are logged and the loop continues.
pub(crate) fn accept_loop(listener: &TcpListener, inner_listener: bool, shared: &AcceptShared) {
    while lifecycle::running() {
        lifecycle::log_pending_signal_events();
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                continue;
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        // Shutdown fence: a connection that arrives while the flag is
        // clearing must not be handed to a reactor that is already
        // sweeping its pipe.
        if !lifecycle::running() {
            break;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(peer = %peer, error = %e, "failed to set connection non-blocking");
            continue;
        }
        let Some(mut task) = shared.pool.pop() else {
            error!(
                peer = %peer,
                "connection pool exhausted, raise max_connections"
            );
            continue;
        };
        let fd = stream.into_raw_fd();
        let index = fd as usize % shared.senders.len();
        task.attach(fd, peer, index, shared.handler.header_size());
        shared.handler.accept_done(&mut task, inner_listener);
        if let Err(mut task) = shared.senders[index].send(task) {
            error!(fd, reactor = index, "handoff pipe write failed, dropping connection");
            let _ = nix::unistd::close(fd);
            task.detach();
            shared.pool.push(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_listener_binds_ephemeral_port() {
        let listener = open_listener("", 0, Duration::from_secs(30)).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() != 0);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn loopback_listener_accepts_connections() {
        let listener = open_listener("127.0.0.1", 0, Duration::from_secs(30)).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (_conn, peer) = listener.accept().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[test]
    fn rejects_unparseable_bind_address() {
        assert!(open_listener("not-an-ip", 0, Duration::from_secs(30)).is_err());
    }
}
