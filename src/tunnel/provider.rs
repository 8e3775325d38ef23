//! Provisioning of the tunnel interface.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::device::{ChannelDevice, PacketDevice, TunDevice};
use super::upstream::InterfacePlan;
use crate::error::NetworkError;

/// Platform side of the tunnel: discovers DNS servers, brings the
/// interface up and keeps upstream sockets out of it.
pub trait InterfaceProvider: Send + Sync + 'static {
    type Device: PacketDevice;

    /// DNS servers of the underlying network.
    fn system_dns_servers(&self) -> Vec<IpAddr>;

    /// Whether the interface may take `addr` as its IPv4 address.
    fn accepts_ipv4(&self, _addr: Ipv4Addr) -> bool {
        true
    }

    /// Bring the interface up according to `plan`.
    fn establish(&self, plan: &InterfacePlan) -> Result<Self::Device, NetworkError>;

    /// Route traffic of `socket` around the tunnel. Returns false on failure.
    fn protect(&self, _socket: RawFd) -> bool {
        true
    }
}

/// Read `nameserver` entries from resolv.conf content.
pub fn parse_resolv_conf(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? != "nameserver" {
                return None;
            }
            // strip a zone suffix such as fe80::1%eth0
            let addr = parts.next()?.split('%').next()?;
            addr.parse().ok()
        })
        .collect()
}

/// Uses a tun descriptor that was already configured by the caller.
///
/// The descriptor is duplicated for every connection attempt so the
/// original stays open across reconnects.
pub struct FdInterfaceProvider {
    fd: OwnedFd,
    resolv_conf: PathBuf,
    fwmark: Option<u32>,
}

impl FdInterfaceProvider {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            fwmark: None,
        }
    }

    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    /// Mark upstream sockets so policy routing sends them around the tunnel.
    pub fn with_fwmark(mut self, mark: Option<u32>) -> Self {
        self.fwmark = mark;
        self
    }
}

impl InterfaceProvider for FdInterfaceProvider {
    type Device = TunDevice;

    fn system_dns_servers(&self) -> Vec<IpAddr> {
        match fs::read_to_string(&self.resolv_conf) {
            Ok(content) => parse_resolv_conf(&content),
            Err(err) => {
                warn!(path = %self.resolv_conf.display(), error = %err, "cannot read system DNS servers");
                Vec::new()
            }
        }
    }

    fn establish(&self, plan: &InterfacePlan) -> Result<TunDevice, NetworkError> {
        let servers: Vec<IpAddr> = plan.dns_servers().collect();
        info!(ipv4 = %plan.ipv4, ipv6 = ?plan.ipv6, ?servers, "using provisioned tunnel interface");
        for (route, prefix) in plan.routes() {
            debug!(%route, prefix, "interface must route");
        }

        let fd = self
            .fd
            .try_clone()
            .map_err(|err| NetworkError::Setup(format!("cannot duplicate tunnel descriptor: {err}")))?;
        TunDevice::new(fd).map_err(|err| NetworkError::Setup(err.to_string()))
    }

    fn protect(&self, socket: RawFd) -> bool {
        match self.fwmark {
            Some(mark) => set_fwmark(socket, mark),
            None => true,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_fwmark(socket: RawFd, mark: u32) -> bool {
    let ret = unsafe {
        libc::setsockopt(
            socket,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(mark, error = %std::io::Error::last_os_error(), "cannot set SO_MARK");
        return false;
    }
    true
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_fwmark(_socket: RawFd, mark: u32) -> bool {
    warn!(mark, "routing marks are not supported on this platform");
    false
}

/// Hands out a single [`ChannelDevice`], for hosts that pump packets themselves.
///
/// Every connection attempt after the first fails with a setup error,
/// since the host owns the only channel pair.
pub struct ChannelProvider {
    device: Mutex<Option<ChannelDevice>>,
    dns_servers: Vec<IpAddr>,
}

impl ChannelProvider {
    pub fn new(device: ChannelDevice, dns_servers: Vec<IpAddr>) -> Self {
        Self {
            device: Mutex::new(Some(device)),
            dns_servers,
        }
    }
}

impl InterfaceProvider for ChannelProvider {
    type Device = ChannelDevice;

    fn system_dns_servers(&self) -> Vec<IpAddr> {
        self.dns_servers.clone()
    }

    fn establish(&self, _plan: &InterfacePlan) -> Result<ChannelDevice, NetworkError> {
        self.device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| NetworkError::Setup("channel device already in use".to_string()))
    }
}
