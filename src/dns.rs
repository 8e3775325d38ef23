//! DNS message inspection and synthesis.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{Name, RData, Record};

use crate::packet::PacketError;

/// Zone the negative answers are issued under. `.invalid` never resolves.
pub const NEGATIVE_CACHE_ZONE: &str = "negative.tunfilter.invalid.";

/// How long clients may cache a blocked answer, in seconds.
pub const NEGATIVE_CACHE_TTL: u32 = 5;

/// Parse a DNS message from a UDP payload.
pub fn parse(payload: &[u8]) -> Result<Message, PacketError> {
    Message::from_vec(payload).map_err(|err| PacketError::Dns(err.to_string()))
}

/// Normalized name of the first question: lowercase, no trailing dot.
pub fn query_name(message: &Message) -> Result<String, PacketError> {
    let query = message.queries().first().ok_or(PacketError::NoQuestion)?;
    let name = query.name().to_ascii();
    Ok(name.trim_end_matches('.').to_ascii_lowercase())
}

/// Turn a query into an empty, briefly cacheable answer.
///
/// The question is kept, the message is flagged as a response with
/// NOERROR, and a SOA record goes into the authority section so the
/// resolver caches the absence for [`NEGATIVE_CACHE_TTL`] seconds.
pub fn blocked_response(mut message: Message) -> Result<Vec<u8>, PacketError> {
    let zone = Name::from_ascii(NEGATIVE_CACHE_ZONE).map_err(|err| PacketError::Build(err.to_string()))?;
    let soa = SOA::new(zone.clone(), zone.clone(), 0, 0, 0, 0, NEGATIVE_CACHE_TTL);

    message.set_message_type(MessageType::Response);
    message.set_response_code(ResponseCode::NoError);
    message.add_name_server(Record::from_rdata(zone, NEGATIVE_CACHE_TTL, RData::SOA(soa)));

    message.to_vec().map_err(|err| PacketError::Build(err.to_string()))
}
