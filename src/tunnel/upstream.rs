//! Upstream DNS servers and the local aliases clients reach them through.
//!
//! Each upstream gets an address inside the tunnel's own subnet. The
//! alias for the server at position `i` ends in `i + ALIAS_OFFSET`, which
//! is how the proxy maps a packet back to its real destination.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::error::NetworkError;
use crate::packet::IpHeader;

/// Last octet of an alias minus its server's position.
pub const ALIAS_OFFSET: usize = 2;

/// Documentation prefixes tried in order for the IPv4 side of the tunnel.
pub const IPV4_PREFIXES: [[u8; 3]; 3] = [[192, 0, 2], [198, 51, 100], [203, 0, 113]];
pub const IPV4_PREFIX_LEN: u8 = 24;

/// Interface address when no documentation prefix is usable.
pub const FALLBACK_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 50, 1);

/// `2001:db8::/120`, a slice of the IPv6 documentation range.
pub const IPV6_BASE: Ipv6Addr = Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 0);
pub const IPV6_PREFIX_LEN: u8 = 120;

pub const DNS_PORT: u16 = 53;

/// Real upstream addresses, indexed by alias.
///
/// An empty list means queries already carry their real destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamServers {
    servers: Vec<IpAddr>,
}

impl UpstreamServers {
    pub fn new(servers: Vec<IpAddr>) -> Self {
        Self { servers }
    }

    /// No translation: packets are forwarded to the address they name.
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn is_translating(&self) -> bool {
        !self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<IpAddr> {
        self.servers.get(index).copied()
    }

    /// Real destination of a packet. `None` if the alias names no server.
    pub fn translate(&self, header: &IpHeader) -> Option<IpAddr> {
        if self.servers.is_empty() {
            return Some(header.dst());
        }

        let index = usize::from(header.dst_last_octet()).checked_sub(ALIAS_OFFSET)?;
        self.get(index)
    }
}

/// A tunnel-local address standing in for an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsAlias {
    pub alias: IpAddr,
    pub upstream: IpAddr,
}

/// Addresses, routes and DNS servers to configure on the tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePlan {
    /// IPv4 address of the interface, with [`IPV4_PREFIX_LEN`].
    pub ipv4: Ipv4Addr,
    /// IPv6 address of the interface, with [`IPV6_PREFIX_LEN`].
    pub ipv6: Option<Ipv6Addr>,
    /// Aliased servers in upstream order.
    pub aliases: Vec<DnsAlias>,
}

impl InterfacePlan {
    /// Build the plan for one connection attempt.
    ///
    /// `accepts_ipv4` tells whether the platform lets the interface use a
    /// given address. Servers enabled in the configuration come first,
    /// followed by the system's. Servers of a family without a usable
    /// prefix are not aliased.
    pub fn build<F>(config: &Configuration, system: &[IpAddr], accepts_ipv4: F) -> Result<Self, NetworkError>
    where
        F: Fn(Ipv4Addr) -> bool,
    {
        let ipv4_prefix = IPV4_PREFIXES
            .into_iter()
            .find(|[a, b, c]| accepts_ipv4(Ipv4Addr::new(*a, *b, *c, 1)));
        let ipv4 = match ipv4_prefix {
            Some([a, b, c]) => Ipv4Addr::new(a, b, c, 1),
            None => {
                warn!("no usable address prefix, using DNS servers directly");
                FALLBACK_IPV4
            }
        };
        let ipv6 = has_ipv6_servers(config, system).then_some(IPV6_BASE);

        let mut candidates = Vec::new();
        for item in config.allowed_dns_servers() {
            match item.location.trim().parse::<IpAddr>() {
                Ok(addr) => candidates.push(addr),
                Err(_) => warn!(location = %item.location, "cannot add custom DNS server"),
            }
        }
        candidates.extend_from_slice(system);
        if candidates.is_empty() {
            return Err(NetworkError::NoUpstream);
        }

        let mut aliases: Vec<DnsAlias> = Vec::new();
        for upstream in candidates {
            if aliases.iter().any(|a| a.upstream == upstream) {
                continue;
            }
            let Ok(octet) = u8::try_from(aliases.len() + ALIAS_OFFSET) else {
                warn!(%upstream, "no alias left for DNS server");
                continue;
            };

            let alias = match (upstream, ipv4_prefix, ipv6) {
                (IpAddr::V4(_), Some([a, b, c]), _) => IpAddr::V4(Ipv4Addr::new(a, b, c, octet)),
                (IpAddr::V6(_), _, Some(base)) => {
                    let mut octets = base.octets();
                    octets[15] = octet;
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                _ => {
                    info!(%upstream, "ignoring DNS server");
                    continue;
                }
            };

            info!(%upstream, %alias, "adding DNS server");
            aliases.push(DnsAlias { alias, upstream });
        }

        debug!(%ipv4, ?ipv6, servers = aliases.len(), "planned tunnel interface");
        Ok(Self { ipv4, ipv6, aliases })
    }

    /// A plan without aliases: clients keep talking to the real servers.
    pub fn direct() -> Self {
        Self {
            ipv4: FALLBACK_IPV4,
            ipv6: None,
            aliases: Vec::new(),
        }
    }

    /// Addresses to announce as the interface's DNS servers.
    pub fn dns_servers(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.aliases.iter().map(|a| a.alias)
    }

    /// Host routes to add. IPv6 aliases are covered by the interface subnet.
    pub fn routes(&self) -> impl Iterator<Item = (IpAddr, u8)> + '_ {
        self.aliases
            .iter()
            .filter(|a| a.alias.is_ipv4())
            .map(|a| (a.alias, 32))
    }

    pub fn upstream_servers(&self) -> UpstreamServers {
        UpstreamServers::new(self.aliases.iter().map(|a| a.upstream).collect())
    }

    /// Heartbeats go to the most recently added alias.
    pub fn heartbeat_target(&self) -> Option<SocketAddr> {
        self.aliases.last().map(|a| SocketAddr::new(a.alias, DNS_PORT))
    }
}

fn has_ipv6_servers(config: &Configuration, system: &[IpAddr]) -> bool {
    if !config.ipv6_support {
        return false;
    }

    config.allowed_dns_servers().any(|item| item.location.contains(':')) || system.iter().any(IpAddr::is_ipv6)
}
