//! DNS packet proxy.
//!
//! Decides what happens to each packet read from the tunnel and turns
//! upstream replies back into packets for it. The proxy performs no I/O:
//! the event loop carries out the returned [`ProxyAction`].

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::dns;
use crate::filter::RuleDatabase;
use crate::packet::{PacketError, UdpRequest};
use crate::stats::Stats;
use crate::tunnel::UpstreamServers;

/// Action to take for a packet read from the tunnel.
#[derive(Debug)]
pub enum ProxyAction {
    /// Send `datagram` upstream. When `request` is set, the reply is
    /// awaited and answered through [`DnsPacketProxy::handle_dns_response`].
    Forward {
        datagram: Vec<u8>,
        destination: SocketAddr,
        request: Option<UdpRequest>,
    },
    /// Write this packet back to the tunnel.
    Respond(Vec<u8>),
    /// Discard the packet.
    Drop,
}

pub struct DnsPacketProxy {
    rules: Arc<RuleDatabase>,
    upstream: UpstreamServers,
    stats: Stats,
}

impl DnsPacketProxy {
    pub fn new(rules: Arc<RuleDatabase>, upstream: UpstreamServers) -> Self {
        Self {
            rules,
            upstream,
            stats: Stats::new(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn upstream(&self) -> &UpstreamServers {
        &self.upstream
    }

    /// Classify a raw IP packet read from the tunnel.
    ///
    /// Malformed or non-DNS packets are logged and dropped.
    pub fn handle_dns_request(&self, packet: &[u8]) -> ProxyAction {
        match self.process_request(packet) {
            Ok(action) => action,
            Err(err) => {
                debug!(error = %err, "discarding packet");
                self.stats.record_dropped();
                ProxyAction::Drop
            }
        }
    }

    fn process_request(&self, packet: &[u8]) -> Result<ProxyAction, PacketError> {
        let request = UdpRequest::parse(packet)?;

        let Some(address) = self.upstream.translate(&request.ip) else {
            error!(destination = %request.ip.dst(), "not a valid address for this network");
            self.stats.record_dropped();
            return Ok(ProxyAction::Drop);
        };
        let destination = SocketAddr::new(address, request.dst_port);

        // Some clients send an empty datagram to the resolver to warm up the path.
        if request.payload.is_empty() {
            debug!(%destination, "forwarding empty datagram");
            self.stats.record_forwarded();
            return Ok(ProxyAction::Forward {
                datagram: Vec::new(),
                destination,
                request: None,
            });
        }

        let message = dns::parse(&request.payload)?;
        let name = dns::query_name(&message)?;

        if !self.rules.is_blocked(&name) {
            info!(domain = %name, upstream = %destination, "allowed");
            self.stats.record_forwarded();
            return Ok(ProxyAction::Forward {
                datagram: request.payload.clone(),
                destination,
                request: Some(request),
            });
        }

        info!(domain = %name, "blocked");
        let payload = dns::blocked_response(message)?;
        let response = request.response(&payload)?;
        self.stats.record_blocked();
        Ok(ProxyAction::Respond(response))
    }

    /// Wrap an upstream reply into a packet answering `request`.
    pub fn handle_dns_response(&self, request: &UdpRequest, payload: &[u8]) -> Option<Vec<u8>> {
        match request.response(payload) {
            Ok(packet) => {
                self.stats.record_response();
                Some(packet)
            }
            Err(err) => {
                error!(error = %err, "cannot build response packet");
                None
            }
        }
    }
}
