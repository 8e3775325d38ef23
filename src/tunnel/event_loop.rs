//! The readiness loop of one tunnel connection.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::pin::pin;
use std::task::Poll;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::device::PacketDevice;
use super::provider::InterfaceProvider;
use super::wait_list::WaitList;
use super::watchdog::Watchdog;
use crate::error::{NetworkError, SessionEnd, Step};
use crate::packet::UdpRequest;
use crate::proxy::{DnsPacketProxy, ProxyAction};

/// Largest packet read from the device.
pub const DEVICE_BUFFER: usize = 32767;

/// Largest upstream reply accepted: a full UDP payload.
pub const REPLY_BUFFER: usize = 65535;

/// A query sent upstream, waiting on its reply.
pub struct PendingQuery {
    socket: UdpSocket,
    request: UdpRequest,
}

/// What the wait primitive observed.
#[derive(Debug)]
pub enum Readiness {
    Cancelled,
    Timeout,
    Ready(ReadySet),
    DeviceError(io::Error),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadySet {
    pub device_readable: bool,
    pub device_writable: bool,
    /// Wait list positions of sockets with a reply to read.
    pub upstream: Vec<usize>,
}

impl ReadySet {
    fn is_empty(&self) -> bool {
        !self.device_readable && !self.device_writable && self.upstream.is_empty()
    }
}

pub struct EventLoop<'a, D, P> {
    device: D,
    proxy: DnsPacketProxy,
    watchdog: &'a mut Watchdog,
    provider: &'a P,
    cancel: watch::Receiver<bool>,
    wait_list: WaitList<PendingQuery>,
    device_writes: VecDeque<Vec<u8>>,
    packet: Vec<u8>,
    reply: Vec<u8>,
}

impl<'a, D, P> EventLoop<'a, D, P>
where
    D: PacketDevice,
    P: InterfaceProvider,
{
    pub fn new(
        device: D,
        proxy: DnsPacketProxy,
        watchdog: &'a mut Watchdog,
        provider: &'a P,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            device,
            proxy,
            watchdog,
            provider,
            cancel,
            wait_list: WaitList::new(),
            device_writes: VecDeque::new(),
            packet: vec![0; DEVICE_BUFFER],
            reply: vec![0; REPLY_BUFFER],
        }
    }

    pub fn proxy(&self) -> &DnsPacketProxy {
        &self.proxy
    }

    /// Queries still waiting on a reply.
    pub fn pending(&self) -> usize {
        self.wait_list.len()
    }

    /// Run until cancelled or the connection fails.
    pub async fn run(&mut self) -> SessionEnd {
        loop {
            match self.do_one().await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => return SessionEnd::Stopped,
                Err(err) => return SessionEnd::Failed(err),
            }
        }
    }

    /// Wait for one round of readiness and handle it.
    pub async fn do_one(&mut self) -> Result<Step, NetworkError> {
        if *self.cancel.borrow() {
            return Ok(Step::Stop);
        }

        match self.wait().await {
            Readiness::Cancelled => {
                info!("told to stop");
                Ok(Step::Stop)
            }
            Readiness::Timeout => {
                self.watchdog.handle_timeout().await?;
                Ok(Step::Continue)
            }
            Readiness::DeviceError(err) => Err(NetworkError::Device(err)),
            Readiness::Ready(ready) => {
                // Replies first: a new insertion could evict a socket that is ready.
                if !ready.upstream.is_empty() {
                    self.read_upstream(&ready.upstream);
                }
                if ready.device_writable {
                    self.write_to_device()?;
                }
                if ready.device_readable {
                    self.read_from_device().await?;
                }
                Ok(Step::Continue)
            }
        }
    }

    /// Block until the device, an upstream socket or the cancellation
    /// signal is ready, or the watchdog's poll timeout passes.
    pub async fn wait(&mut self) -> Readiness {
        let want_write = !self.device_writes.is_empty();
        let timeout = self.watchdog.poll_timeout();
        trace!(pending = self.wait_list.len(), want_write, ?timeout, "waiting for readiness");

        let Self {
            device,
            cancel,
            wait_list,
            ..
        } = self;

        // The sender only ever publishes a stop request.
        let mut cancelled = pin!(cancel.changed());
        let mut sleep = timeout.map(|t| Box::pin(tokio::time::sleep(t)));

        poll_fn(|cx| {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Readiness::Cancelled);
            }

            let mut ready = ReadySet::default();
            match device.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => ready.device_readable = true,
                Poll::Ready(Err(err)) => return Poll::Ready(Readiness::DeviceError(err)),
                Poll::Pending => {}
            }
            if want_write {
                match device.poll_write_ready(cx) {
                    Poll::Ready(Ok(())) => ready.device_writable = true,
                    Poll::Ready(Err(err)) => return Poll::Ready(Readiness::DeviceError(err)),
                    Poll::Pending => {}
                }
            }
            for (position, pending) in wait_list.iter().enumerate() {
                if pending.socket.poll_recv_ready(cx).is_ready() {
                    ready.upstream.push(position);
                }
            }

            if !ready.is_empty() {
                return Poll::Ready(Readiness::Ready(ready));
            }
            if let Some(sleep) = sleep.as_mut() {
                if sleep.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Readiness::Timeout);
                }
            }
            Poll::Pending
        })
        .await
    }

    fn read_upstream(&mut self, positions: &[usize]) {
        let mut replies = Vec::new();
        let buf = &mut self.reply;
        let answered = self.wait_list.take_where(|position, pending| {
            if !positions.contains(&position) {
                return false;
            }
            match pending.socket.try_recv_from(&mut buf[..]) {
                Ok((len, from)) => {
                    debug!(%from, len, "read from DNS socket");
                    replies.push(Some(buf[..len].to_vec()));
                    true
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
                Err(err) => {
                    warn!(error = %err, "cannot read upstream reply");
                    replies.push(None);
                    true
                }
            }
        });

        for (pending, reply) in answered.into_iter().zip(replies) {
            let Some(reply) = reply else { continue };
            if let Some(packet) = self.proxy.handle_dns_response(&pending.request, &reply) {
                self.device_writes.push_back(packet);
            }
        }
    }

    fn write_to_device(&mut self) -> Result<(), NetworkError> {
        let Some(packet) = self.device_writes.pop_front() else {
            return Ok(());
        };

        match self.device.try_send(&packet) {
            Ok(()) => {
                trace!(len = packet.len(), "wrote to device");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.device_writes.push_front(packet);
                Ok(())
            }
            Err(err) => Err(NetworkError::Device(err)),
        }
    }

    async fn read_from_device(&mut self) -> Result<(), NetworkError> {
        let len = match self.device.try_recv(&mut self.packet) {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(NetworkError::Device(err)),
        };
        if len == 0 {
            warn!("got empty packet");
            return Ok(());
        }

        let packet = self.packet[..len].to_vec();
        self.watchdog.handle_packet(&packet);

        match self.proxy.handle_dns_request(&packet) {
            ProxyAction::Respond(response) => self.device_writes.push_back(response),
            ProxyAction::Forward {
                datagram,
                destination,
                request,
            } => self.forward(&datagram, destination, request).await?,
            ProxyAction::Drop => {}
        }
        Ok(())
    }

    /// Send `datagram` upstream from a fresh socket kept out of the tunnel.
    ///
    /// Unreachable networks and denied sends end the connection; other
    /// send failures only lose this query.
    async fn forward(
        &mut self,
        datagram: &[u8],
        destination: SocketAddr,
        request: Option<UdpRequest>,
    ) -> Result<(), NetworkError> {
        let local = match destination {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = match UdpSocket::bind(local).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(error = %err, "cannot open upstream socket");
                return Ok(());
            }
        };
        if !self.provider.protect(socket.as_raw_fd()) {
            warn!(%destination, "cannot protect upstream socket");
        }

        match socket.send_to(datagram, destination).await {
            Ok(_) => {
                if let Some(request) = request {
                    self.wait_list.add(PendingQuery { socket, request });
                }
                Ok(())
            }
            Err(err) if is_network_fatal(&err) => Err(NetworkError::Send {
                destination,
                source: err,
            }),
            Err(err) => {
                warn!(%destination, error = %err, "could not send packet to upstream");
                Ok(())
            }
        }
    }
}

fn is_network_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::PermissionDenied
    )
}
