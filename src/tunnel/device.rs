//! Packet devices the event loop reads from and writes to.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

/// A source and sink of raw IP packets.
///
/// Readiness is polled first; the `try_` operations then perform one
/// non-blocking transfer and return `WouldBlock` on spurious readiness.
pub trait PacketDevice {
    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Read one packet into `buf`.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one whole packet.
    fn try_send(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// A tun descriptor registered with the reactor.
pub struct TunDevice {
    fd: AsyncFd<File>,
}

impl TunDevice {
    /// Take ownership of an open tun descriptor and switch it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd: AsyncFd::new(File::from(fd))?,
        })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl PacketDevice for TunDevice {
    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.fd.poll_read_ready(cx).map_ok(|_| ())
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.fd.poll_write_ready(cx).map_ok(|_| ())
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(guard) = self.fd.readable().now_or_never() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        match guard?.try_io(|fd| fd.get_ref().read(buf)) {
            Ok(result) => result,
            Err(_would_block) => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn try_send(&mut self, packet: &[u8]) -> io::Result<()> {
        let Some(guard) = self.fd.writable().now_or_never() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        match guard?.try_io(|fd| fd.get_ref().write(packet)) {
            Ok(Ok(written)) if written == packet.len() => Ok(()),
            Ok(Ok(written)) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to tunnel: {written} of {} bytes", packet.len()),
            )),
            Ok(Err(err)) => Err(err),
            Err(_would_block) => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

/// A device whose packets are exchanged with the host application over
/// channels, for embedders that own the tunnel themselves.
pub struct ChannelDevice {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    next: Option<Vec<u8>>,
    closed: bool,
}

/// The host application's side of a [`ChannelDevice`].
pub struct ChannelPeer {
    /// Packets to inject into the tunnel.
    pub inbound: mpsc::Sender<Vec<u8>>,
    /// Packets the tunnel writes back.
    pub outbound: mpsc::Receiver<Vec<u8>>,
}

impl ChannelDevice {
    pub fn pair(capacity: usize) -> (ChannelDevice, ChannelPeer) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let device = ChannelDevice {
            inbound: inbound_rx,
            outbound: outbound_tx,
            next: None,
            closed: false,
        };
        let peer = ChannelPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
        };
        (device, peer)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel peer went away")
}

impl PacketDevice for ChannelDevice {
    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.next.is_some() || self.closed {
            return Poll::Ready(Ok(()));
        }
        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                self.next = Some(packet);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_write_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.outbound.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Poll::Ready(Ok(()))
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = match self.next.take() {
            Some(packet) => packet,
            None => match self.inbound.try_recv() {
                Ok(packet) => packet,
                Err(mpsc::error::TryRecvError::Empty) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(closed_error()),
            },
        };
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    fn try_send(&mut self, packet: &[u8]) -> io::Result<()> {
        match self.outbound.try_send(packet.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(closed_error()),
        }
    }
}
