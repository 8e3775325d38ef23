//! IP/UDP framing of packets read from and written to the tunnel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use etherparse::{NetSlice, PacketBuilder, SlicedPacket, TransportSlice};

/// Reasons a packet from the tunnel is dropped.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("invalid IP packet: {0}")]
    Ip(String),

    #[error("not a UDP packet")]
    NotUdp,

    #[error("invalid DNS message: {0}")]
    Dns(String),

    #[error("DNS message has no question")]
    NoQuestion,

    #[error("cannot build packet: {0}")]
    Build(String),
}

/// Network layer of a parsed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpHeader {
    V4 { src: Ipv4Addr, dst: Ipv4Addr, ttl: u8 },
    V6 { src: Ipv6Addr, dst: Ipv6Addr, hop_limit: u8 },
}

impl IpHeader {
    pub fn src(&self) -> IpAddr {
        match *self {
            IpHeader::V4 { src, .. } => IpAddr::V4(src),
            IpHeader::V6 { src, .. } => IpAddr::V6(src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match *self {
            IpHeader::V4 { dst, .. } => IpAddr::V4(dst),
            IpHeader::V6 { dst, .. } => IpAddr::V6(dst),
        }
    }

    /// Last byte of the destination address.
    pub fn dst_last_octet(&self) -> u8 {
        match *self {
            IpHeader::V4 { dst, .. } => dst.octets()[3],
            IpHeader::V6 { dst, .. } => dst.octets()[15],
        }
    }

    /// The same header with source and destination swapped.
    pub fn reversed(&self) -> IpHeader {
        match *self {
            IpHeader::V4 { src, dst, ttl } => IpHeader::V4 { src: dst, dst: src, ttl },
            IpHeader::V6 { src, dst, hop_limit } => IpHeader::V6 {
                src: dst,
                dst: src,
                hop_limit,
            },
        }
    }

    /// Frame `payload` as a UDP datagram under this header.
    ///
    /// Lengths and checksums are computed for the matching family.
    pub fn build_udp(&self, src_port: u16, dst_port: u16, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let builder = match *self {
            IpHeader::V4 { src, dst, ttl } => PacketBuilder::ipv4(src.octets(), dst.octets(), ttl),
            IpHeader::V6 { src, dst, hop_limit } => PacketBuilder::ipv6(src.octets(), dst.octets(), hop_limit),
        }
        .udp(src_port, dst_port);

        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder
            .write(&mut packet, payload)
            .map_err(|err| PacketError::Build(err.to_string()))?;

        Ok(packet)
    }
}

/// A UDP datagram read from the tunnel, retained until its reply arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpRequest {
    pub ip: IpHeader,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl UdpRequest {
    /// Parse a raw IP packet, accepting only UDP.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let sliced = SlicedPacket::from_ip(data).map_err(|err| PacketError::Ip(err.to_string()))?;

        let ip = match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                IpHeader::V4 {
                    src: header.source_addr(),
                    dst: header.destination_addr(),
                    ttl: header.ttl(),
                }
            }
            Some(NetSlice::Ipv6(ipv6)) => {
                let header = ipv6.header();
                IpHeader::V6 {
                    src: header.source_addr(),
                    dst: header.destination_addr(),
                    hop_limit: header.hop_limit(),
                }
            }
            _ => return Err(PacketError::Ip("no network layer".to_string())),
        };

        let Some(TransportSlice::Udp(udp)) = &sliced.transport else {
            return Err(PacketError::NotUdp);
        };

        Ok(Self {
            ip,
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            payload: udp.payload().to_vec(),
        })
    }

    /// Where the client sent this datagram.
    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.ip.dst(), self.dst_port)
    }

    /// Build the packet answering this request with `payload`.
    ///
    /// Addresses and ports are swapped so the reply appears to come from the
    /// address the client queried.
    pub fn response(&self, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        self.ip.reversed().build_udp(self.dst_port, self.src_port, payload)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn udp_v4(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        IpHeader::V4 {
            src: src.into(),
            dst: dst.into(),
            ttl: 64,
        }
        .build_udp(src_port, dst_port, payload)
        .unwrap()
    }

    pub(crate) fn udp_v6(src: Ipv6Addr, dst: Ipv6Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        IpHeader::V6 { src, dst, hop_limit: 64 }
            .build_udp(src_port, dst_port, payload)
            .unwrap()
    }

    #[test]
    fn parses_ipv4_udp() {
        let packet = udp_v4([10, 0, 0, 2], [192, 0, 2, 2], 40000, 53, b"query");

        let request = UdpRequest::parse(&packet).unwrap();

        assert_eq!(request.ip.src(), IpAddr::from([10, 0, 0, 2]));
        assert_eq!(request.ip.dst(), IpAddr::from([192, 0, 2, 2]));
        assert_eq!(request.ip.dst_last_octet(), 2);
        assert_eq!(request.src_port, 40000);
        assert_eq!(request.dst_port, 53);
        assert_eq!(request.payload, b"query");
    }

    #[test]
    fn parses_ipv6_udp() {
        let src: Ipv6Addr = "2001:db8::100".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::3".parse().unwrap();
        let packet = udp_v6(src, dst, 5353, 53, b"q");

        let request = UdpRequest::parse(&packet).unwrap();

        assert!(matches!(request.ip, IpHeader::V6 { .. }));
        assert_eq!(request.ip.dst_last_octet(), 3);
        assert_eq!(request.destination(), SocketAddr::new(IpAddr::V6(dst), 53));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(UdpRequest::parse(&[0xff; 8]), Err(PacketError::Ip(_))));
        assert!(matches!(UdpRequest::parse(&[]), Err(PacketError::Ip(_))));
    }

    #[test]
    fn rejects_tcp() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 2], [1, 1, 1, 1], 64).tcp(1234, 80, 1, 1024);
        let mut packet = Vec::new();
        builder.write(&mut packet, b"GET /").unwrap();

        assert!(matches!(UdpRequest::parse(&packet), Err(PacketError::NotUdp)));
    }

    #[test]
    fn response_reverses_ipv4_endpoints() {
        let packet = udp_v4([10, 0, 0, 2], [192, 0, 2, 2], 40000, 53, b"query");
        let request = UdpRequest::parse(&packet).unwrap();

        let response = request.response(b"answer").unwrap();

        let sliced = SlicedPacket::from_ip(&response).unwrap();
        let Some(NetSlice::Ipv4(ipv4)) = &sliced.net else {
            panic!("expected IPv4");
        };
        assert_eq!(ipv4.header().source_addr(), Ipv4Addr::new(192, 0, 2, 2));
        assert_eq!(ipv4.header().destination_addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(usize::from(ipv4.header().total_len()), response.len());
        let Some(TransportSlice::Udp(udp)) = &sliced.transport else {
            panic!("expected UDP");
        };
        assert_eq!(udp.source_port(), 53);
        assert_eq!(udp.destination_port(), 40000);
        assert_eq!(udp.payload(), b"answer");
    }

    #[test]
    fn response_checksums_verify() {
        let packet = udp_v4([10, 0, 0, 2], [192, 0, 2, 2], 40000, 53, b"query");
        let request = UdpRequest::parse(&packet).unwrap();
        let response = request.response(b"a longer answer payload").unwrap();

        let headers = etherparse::PacketHeaders::from_ip_slice(&response).unwrap();
        let Some(etherparse::NetHeaders::Ipv4(ipv4, _)) = &headers.net else {
            panic!("expected IPv4");
        };
        assert_eq!(ipv4.header_checksum, ipv4.calc_header_checksum());
        let Some(etherparse::TransportHeader::Udp(udp)) = &headers.transport else {
            panic!("expected UDP");
        };
        let expected = udp
            .calc_checksum_ipv4(ipv4, b"a longer answer payload")
            .unwrap();
        assert_eq!(udp.checksum, expected);
    }

    #[test]
    fn response_reverses_ipv6_endpoints() {
        let src: Ipv6Addr = "2001:db8::100".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let request = UdpRequest::parse(&udp_v6(src, dst, 5353, 53, b"q")).unwrap();

        let response = UdpRequest::parse(&request.response(b"reply").unwrap()).unwrap();

        assert_eq!(
            response.ip,
            IpHeader::V6 {
                src: dst,
                dst: src,
                hop_limit: 64
            }
        );
        assert_eq!(response.src_port, 53);
        assert_eq!(response.dst_port, 5353);
        assert_eq!(response.payload, b"reply");
    }
}
