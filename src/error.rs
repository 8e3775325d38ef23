//! Failures that end a tunnel connection attempt.
//!
//! Every variant is recoverable: the outer loop reconnects with backoff.
//! Cancellation is not an error and travels separately as
//! [`SessionEnd::Stopped`].

use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Reading from or writing to the tunnel device failed.
    #[error("tunnel device I/O failed: {0}")]
    Device(#[source] io::Error),

    /// An upstream server cannot be reached from this network.
    #[error("cannot send to {destination}: {source}")]
    Send {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The tunnel interface could not be established.
    #[error("cannot establish tunnel interface: {0}")]
    Setup(String),

    /// Neither the configuration nor the system provides a DNS server.
    #[error("no upstream DNS server available")]
    NoUpstream,

    /// A heartbeat went unanswered.
    #[error("watchdog timed out waiting for traffic")]
    WatchdogTimeout,

    #[error("cannot send heartbeat to {target}: {source}")]
    Heartbeat {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// How one connection attempt ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Cancellation was requested. No retry follows.
    Stopped,
    /// The connection broke; the caller backs off and retries.
    Failed(NetworkError),
}

impl From<NetworkError> for SessionEnd {
    fn from(err: NetworkError) -> Self {
        SessionEnd::Failed(err)
    }
}

/// Result of a single event loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}
