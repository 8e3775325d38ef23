//! Tunnel worker: reconnect loop, status reporting and thread control.

mod device;
mod event_loop;
mod provider;
mod upstream;
mod wait_list;
mod watchdog;

pub use device::{ChannelDevice, ChannelPeer, PacketDevice, TunDevice};
pub use event_loop::{DEVICE_BUFFER, EventLoop, PendingQuery, REPLY_BUFFER, Readiness, ReadySet};
pub use provider::{ChannelProvider, FdInterfaceProvider, InterfaceProvider, parse_resolv_conf};
pub use upstream::{DnsAlias, InterfacePlan, UpstreamServers};
pub use wait_list::{MAX_WAITING, WAIT_TIMEOUT, WaitList};
pub use watchdog::Watchdog;

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::error::{NetworkError, SessionEnd};
use crate::filter::RuleDatabase;
use crate::proxy::DnsPacketProxy;

/// Retry delay after a failed connection, doubling up to the maximum.
const MIN_RETRY: Duration = Duration::from_secs(5);
const MAX_RETRY: Duration = Duration::from_secs(120);

/// A connection that lasted this long resets the retry delay.
const RETRY_RESET: Duration = Duration::from_secs(60);

/// How long [`TunnelHandle::stop`] waits for the worker to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the status channel.
pub const STATUS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Starting,
    Running,
    Stopping,
    WaitingForNetwork,
    Reconnecting,
    ReconnectingNetworkError,
    Stopped,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelStatus::Starting => "starting",
            TunnelStatus::Running => "running",
            TunnelStatus::Stopping => "stopping",
            TunnelStatus::WaitingForNetwork => "waiting for network",
            TunnelStatus::Reconnecting => "reconnecting",
            TunnelStatus::ReconnectingNetworkError => "reconnecting after network error",
            TunnelStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

fn notify(sink: &mpsc::Sender<TunnelStatus>, status: TunnelStatus) {
    debug!(%status, "tunnel status");
    if let Err(err) = sink.try_send(status) {
        debug!(%status, error = %err, "status update dropped");
    }
}

/// Settings fixed for the lifetime of a worker.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Map tunnel-local aliases to upstream servers. When off, queries go
    /// to whatever address the client used.
    pub translate: bool,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self { translate: true }
    }
}

/// Sleep for `duration` unless cancellation arrives first. Returns true if cancelled.
async fn sleep_or_cancel(cancel: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *cancel.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.changed() => true,
    }
}

/// The reconnect loop owning every connection attempt.
pub struct Tunnel<P: InterfaceProvider> {
    provider: Arc<P>,
    config: Configuration,
    options: TunnelOptions,
    rules: Arc<RuleDatabase>,
    watchdog: Watchdog,
    status: mpsc::Sender<TunnelStatus>,
    cancel: watch::Receiver<bool>,
    min_retry: Duration,
}

impl<P: InterfaceProvider> Tunnel<P> {
    pub fn new(
        provider: Arc<P>,
        config: Configuration,
        options: TunnelOptions,
        rules: Arc<RuleDatabase>,
        status: mpsc::Sender<TunnelStatus>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            provider,
            config,
            options,
            rules,
            watchdog: Watchdog::new(),
            status,
            cancel,
            min_retry: MIN_RETRY,
        }
    }

    /// Override the first retry delay.
    pub fn with_min_retry(mut self, delay: Duration) -> Self {
        self.min_retry = delay;
        self
    }

    /// Connect, and reconnect with backoff after every network failure,
    /// until cancelled.
    pub async fn run(mut self) {
        info!("starting tunnel");
        notify(&self.status, TunnelStatus::Starting);

        let mut retry = self.min_retry;
        loop {
            let connected_at = Instant::now();
            match self.run_session().await {
                SessionEnd::Stopped => {
                    info!("tunnel told to stop");
                    notify(&self.status, TunnelStatus::Stopping);
                    break;
                }
                SessionEnd::Failed(err) => {
                    warn!(error = %err, "network error in tunnel, reconnecting");
                    notify(&self.status, TunnelStatus::ReconnectingNetworkError);
                }
            }

            if connected_at.elapsed() >= RETRY_RESET {
                debug!("resetting retry timeout");
                retry = self.min_retry;
            }

            info!(?retry, "retrying to connect");
            if sleep_or_cancel(&mut self.cancel, retry).await {
                break;
            }
            retry = (retry * 2).min(MAX_RETRY);
        }

        notify(&self.status, TunnelStatus::Stopped);
        info!("tunnel exited");
    }

    /// One connection attempt, from planning the interface to disconnect.
    async fn run_session(&mut self) -> SessionEnd {
        let penalty = self.watchdog.initialize(self.config.watch_dog);
        if !penalty.is_zero() {
            debug!(?penalty, "waiting out reconnect penalty");
            if sleep_or_cancel(&mut self.cancel, penalty).await {
                return SessionEnd::Stopped;
            }
        }

        let plan = match self.plan() {
            Ok(plan) => plan,
            Err(err) => return SessionEnd::Failed(err),
        };
        let upstream = plan.upstream_servers();
        self.watchdog.set_target(plan.heartbeat_target());

        let device = match self.provider.establish(&plan) {
            Ok(device) => device,
            Err(err) => return SessionEnd::Failed(err),
        };
        notify(&self.status, TunnelStatus::Running);

        let proxy = DnsPacketProxy::new(Arc::clone(&self.rules), upstream);
        let mut event_loop = EventLoop::new(
            device,
            proxy,
            &mut self.watchdog,
            self.provider.as_ref(),
            self.cancel.clone(),
        );
        let end = event_loop.run().await;

        let stats = event_loop.proxy().stats().snapshot_and_reset();
        info!(
            requests = stats.requests,
            forwarded = stats.forwarded,
            blocked = stats.blocked,
            dropped = stats.dropped,
            responses = stats.responses,
            "tunnel session ended"
        );
        end
    }

    fn plan(&self) -> Result<InterfacePlan, NetworkError> {
        let system = self.provider.system_dns_servers();
        info!(servers = ?system, "got system DNS servers");

        if !self.options.translate {
            return Ok(InterfacePlan::direct());
        }
        InterfacePlan::build(&self.config, &system, |addr| self.provider.accepts_ipv4(addr))
    }
}

struct Worker {
    cancel: watch::Sender<bool>,
    done: std_mpsc::Receiver<()>,
    thread: thread::JoinHandle<()>,
}

/// Starts and stops the tunnel worker thread.
pub struct TunnelHandle<P: InterfaceProvider> {
    provider: Arc<P>,
    config: Configuration,
    options: TunnelOptions,
    rules: Arc<RuleDatabase>,
    status: mpsc::Sender<TunnelStatus>,
    min_retry: Duration,
    worker: Option<Worker>,
}

impl<P: InterfaceProvider> TunnelHandle<P> {
    pub fn new(
        provider: P,
        config: Configuration,
        rules: Arc<RuleDatabase>,
        status: mpsc::Sender<TunnelStatus>,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            config,
            options: TunnelOptions::default(),
            rules,
            status,
            min_retry: MIN_RETRY,
            worker: None,
        }
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_min_retry(mut self, delay: Duration) -> Self {
        self.min_retry = delay;
        self
    }

    /// Configuration used from the next start.
    pub fn set_config(&mut self, config: Configuration) {
        self.config = config;
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }

    /// Spawn the worker thread. Does nothing if one is already running.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("tunnel thread already running");
            return;
        }
        self.worker = None;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = std_mpsc::channel();
        let tunnel = Tunnel::new(
            Arc::clone(&self.provider),
            self.config.clone(),
            self.options.clone(),
            Arc::clone(&self.rules),
            self.status.clone(),
            cancel_rx,
        )
        .with_min_retry(self.min_retry);
        let status = self.status.clone();

        info!("starting tunnel thread");
        let spawned = thread::Builder::new().name("tunnel".to_string()).spawn(move || {
            let _done = done_tx;
            match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime.block_on(tunnel.run()),
                Err(err) => {
                    error!(error = %err, "cannot build tunnel runtime");
                    notify(&status, TunnelStatus::Stopped);
                }
            }
        });

        match spawned {
            Ok(thread) => {
                self.worker = Some(Worker {
                    cancel: cancel_tx,
                    done: done_rx,
                    thread,
                })
            }
            Err(err) => {
                error!(error = %err, "cannot spawn tunnel thread");
                notify(&self.status, TunnelStatus::Stopped);
            }
        }
    }

    /// Signal the worker to stop and wait briefly for it to exit.
    ///
    /// Returns false if the thread was still alive after the wait.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };

        info!("stopping tunnel thread");
        let _ = worker.cancel.send(true);

        match worker.done.recv_timeout(STOP_TIMEOUT) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!("could not stop tunnel thread, it is still alive");
                false
            }
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("tunnel thread panicked");
                }
                info!("tunnel thread stopped");
                true
            }
        }
    }

    /// Restart the worker after the network changed.
    pub fn reconnect(&mut self) {
        notify(&self.status, TunnelStatus::Reconnecting);
        self.stop();
        self.start();
    }

    /// Stop the worker until a network becomes available again.
    pub fn wait_for_network(&mut self) {
        self.stop();
        notify(&self.status, TunnelStatus::WaitingForNetwork);
    }
}

impl<P: InterfaceProvider> Drop for TunnelHandle<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Never brings the interface up.
    struct BrokenProvider;

    impl InterfaceProvider for BrokenProvider {
        type Device = ChannelDevice;

        fn system_dns_servers(&self) -> Vec<std::net::IpAddr> {
            vec!["10.0.0.1".parse().unwrap()]
        }

        fn establish(&self, _plan: &InterfacePlan) -> Result<ChannelDevice, NetworkError> {
            Err(NetworkError::Setup("no permission".to_string()))
        }
    }

    fn drain(rx: &mut mpsc::Receiver<TunnelStatus>) -> Vec<TunnelStatus> {
        let mut seen = Vec::new();
        while let Ok(status) = rx.try_recv() {
            seen.push(status);
        }
        seen
    }

    #[test]
    fn status_names() {
        assert_eq!(TunnelStatus::Running.to_string(), "running");
        assert_eq!(TunnelStatus::WaitingForNetwork.to_string(), "waiting for network");
    }

    #[tokio::test]
    async fn sleep_or_cancel_is_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });

        let start = Instant::now();
        assert!(sleep_or_cancel(&mut rx, Duration::from_secs(30)).await);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sleep_or_cancel_sees_earlier_stop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        assert!(sleep_or_cancel(&mut rx, Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn setup_failures_retry_until_stopped() {
        let (status_tx, mut status_rx) = mpsc::channel(STATUS_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let tunnel = Tunnel::new(
            Arc::new(BrokenProvider),
            Configuration::default(),
            TunnelOptions::default(),
            Arc::new(RuleDatabase::new()),
            status_tx,
            cancel_rx,
        )
        .with_min_retry(Duration::from_millis(10));

        let task = tokio::spawn(tunnel.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let seen = drain(&mut status_rx);
        assert_eq!(seen.first(), Some(&TunnelStatus::Starting));
        assert_eq!(seen.last(), Some(&TunnelStatus::Stopped));
        assert!(seen.iter().filter(|s| **s == TunnelStatus::ReconnectingNetworkError).count() >= 2);
        assert!(!seen.contains(&TunnelStatus::Running));
    }

    #[test]
    fn handle_starts_and_stops_worker() {
        let (status_tx, mut status_rx) = mpsc::channel(STATUS_CAPACITY);
        let mut handle = TunnelHandle::new(
            BrokenProvider,
            Configuration::default(),
            Arc::new(RuleDatabase::new()),
            status_tx,
        );

        handle.start();
        assert!(handle.is_running());
        std::thread::sleep(Duration::from_millis(50));
        assert!(handle.stop());
        assert!(!handle.is_running());

        let seen = drain(&mut status_rx);
        assert_eq!(seen.first(), Some(&TunnelStatus::Starting));
        assert_eq!(seen.last(), Some(&TunnelStatus::Stopped));
    }

    #[test]
    fn wait_for_network_reports_status() {
        let (status_tx, mut status_rx) = mpsc::channel(STATUS_CAPACITY);
        let mut handle = TunnelHandle::new(
            BrokenProvider,
            Configuration::default(),
            Arc::new(RuleDatabase::new()),
            status_tx,
        );

        handle.start();
        handle.wait_for_network();

        assert!(!handle.is_running());
        assert_eq!(drain(&mut status_rx).last(), Some(&TunnelStatus::WaitingForNetwork));
    }
}
