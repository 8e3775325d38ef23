//! tunfilter - DNS ad blocker running as the endpoint of a virtual tunnel.
//!
//! Packets routed into the tunnel are inspected for DNS queries. Blocked
//! names get an immediate negative answer; everything else is forwarded
//! to the real upstream server.

pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod packet;
pub mod proxy;
pub mod stats;
pub mod tunnel;
