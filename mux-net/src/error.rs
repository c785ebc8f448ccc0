use std::fmt;
use std::io;

/// Error type for mux-net operations.
#[derive(Debug)]
pub enum Error {
    /// Invalid service configuration.
    Config(String),
    /// A socket operation failed during listener setup or accept.
    Socket {
        op: &'static str,
        source: io::Error,
    },
    /// An OS-level operation (epoll, pipe, fcntl, sigaction) failed.
    Os {
        op: &'static str,
        source: io::Error,
    },
    /// Spawning a service thread failed.
    Thread(io::Error),
    /// The embedder reported a framing violation.
    Protocol(String),
    /// A request handler failed.
    Handler(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub(crate) fn socket(op: &'static str, source: io::Error) -> Self {
        Error::Socket { op, source }
    }

    pub(crate) fn os(op: &'static str, errno: nix::errno::Errno) -> Self {
        Error::Os {
            op,
            source: io::Error::from_raw_os_error(errno as i32),
        }
    }

    /// Errno-compatible process exit code for init failures.
    ///
    /// Returns the underlying OS error number when one exists, 1 otherwise.
    /// 0 is reserved for clean shutdown.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Socket { source, .. } | Error::Os { source, .. } | Error::Thread(source) => {
                source.raw_os_error().unwrap_or(1)
            }
            _ => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Socket { op, source } => write!(f, "socket {op} failed: {source}"),
            Error::Os { op, source } => write!(f, "{op} failed: {source}"),
            Error::Thread(e) => write!(f, "thread spawn failed: {e}"),
            Error::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Error::Handler(e) => write!(f, "handler error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Socket { source, .. } | Error::Os { source, .. } | Error::Thread(source) => {
                Some(source)
            }
            Error::Handler(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::Handler(e)
    }
}

/// A Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
