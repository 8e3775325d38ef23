//! Liveness check for the tunnel.
//!
//! Success and failure are both decided when the event loop times out.
//! Packets read from the device only record the time they arrived. On a
//! timeout, if nothing arrived since the last heartbeat the connection is
//! considered dead and the reconnect penalty grows. Otherwise the poll
//! timeout grows and a new heartbeat is sent.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Poll timeout grows from 1s to about 68 minutes, quadrupling each time.
const POLL_TIMEOUT_START: Duration = Duration::from_secs(1);
const POLL_TIMEOUT_END: Duration = Duration::from_secs(4096);
const POLL_TIMEOUT_GROW: u32 = 4;

/// Poll timeout while a heartbeat is outstanding.
const POLL_TIMEOUT_WAITING: Duration = Duration::from_secs(7);

/// Penalty before connecting ranges from 0 to 5s in 200ms steps.
const PENALTY_END: Duration = Duration::from_secs(5);
const PENALTY_INC: Duration = Duration::from_millis(200);

/// A session alive this long clears the penalty on its next good heartbeat.
const PENALTY_RESET: Duration = Duration::from_secs(60);

pub struct Watchdog {
    enabled: bool,
    target: Option<SocketAddr>,
    poll_timeout: Duration,
    penalty: Duration,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    started: Instant,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            enabled: false,
            target: None,
            poll_timeout: POLL_TIMEOUT_START,
            penalty: Duration::ZERO,
            last_sent: None,
            last_received: None,
            started: Instant::now(),
        }
    }

    /// Address heartbeats are sent to.
    pub fn set_target(&mut self, target: Option<SocketAddr>) {
        self.target = target;
    }

    /// Reset for a new connection attempt.
    ///
    /// Returns how long the caller should wait before connecting.
    pub fn initialize(&mut self, enabled: bool) -> Duration {
        debug!(enabled, "initializing watchdog");

        self.enabled = enabled;
        self.poll_timeout = POLL_TIMEOUT_START;
        self.last_sent = None;
        self.last_received = None;
        self.started = Instant::now();

        if enabled { self.penalty } else { Duration::ZERO }
    }

    /// How long the event loop may wait for readiness. `None` waits forever.
    pub fn poll_timeout(&self) -> Option<Duration> {
        if !self.enabled {
            None
        } else if self.last_received < self.last_sent {
            Some(POLL_TIMEOUT_WAITING)
        } else {
            Some(self.poll_timeout)
        }
    }

    pub fn penalty(&self) -> Duration {
        self.penalty
    }

    /// Record a packet read from the device.
    pub fn handle_packet(&mut self, packet: &[u8]) {
        if !self.enabled {
            return;
        }

        debug!(len = packet.len(), "watchdog saw packet");
        self.last_received = Some(Instant::now());
    }

    /// The event loop waited a full poll timeout with nothing ready.
    pub async fn handle_timeout(&mut self) -> Result<(), NetworkError> {
        if !self.enabled {
            return Ok(());
        }

        if self.last_sent.is_some() && self.last_received < self.last_sent {
            self.penalty = (self.penalty + PENALTY_INC).min(PENALTY_END);
            warn!(penalty = ?self.penalty, "watchdog timed out");
            return Err(NetworkError::WatchdogTimeout);
        }

        if self.last_sent.is_some() && !self.penalty.is_zero() && self.started.elapsed() >= PENALTY_RESET {
            debug!("connection stable, clearing reconnect penalty");
            self.penalty = Duration::ZERO;
        }

        self.poll_timeout = (self.poll_timeout * POLL_TIMEOUT_GROW).min(POLL_TIMEOUT_END);
        self.send_packet().await
    }

    /// Send an empty datagram to the heartbeat target.
    pub async fn send_packet(&mut self) -> Result<(), NetworkError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(target) = self.target else {
            debug!("no heartbeat target, skipping");
            return Ok(());
        };

        debug!(%target, poll_timeout = ?self.poll_timeout, "sending heartbeat");
        let local = match target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| NetworkError::Heartbeat { target, source })?;
        socket
            .send_to(&[], target)
            .await
            .map_err(|source| NetworkError::Heartbeat { target, source })?;

        self.last_sent = Some(Instant::now());
        Ok(())
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}
