use hickory_proto::error::ProtoResult;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use super::aggregator::RecordPayload;

/// Encode a single PTR question for `name`.
///
/// With `unicast_response` the top bit of the question class is set, asking
/// responders to answer by unicast (RFC 6762, section 5.4).
pub fn build_query(name: &str, unicast_response: bool) -> ProtoResult<Vec<u8>> {
    let name = Name::from_ascii(name)?;

    let mut query = Query::query(name, RecordType::PTR);
    query
        .set_query_class(DNSClass::IN)
        .set_mdns_unicast_response(unicast_response);

    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false)
        .add_query(query);

    message.to_vec()
}

pub fn decode(packet: &[u8]) -> ProtoResult<Message> {
    Message::from_vec(packet)
}

/// Answer and additional records, in that order
pub fn records(message: &Message) -> impl Iterator<Item = &Record> {
    message.answers().iter().chain(message.additionals().iter())
}

/// Owner name and payload of a record; `None` when the record has no data
pub fn payload(record: &Record) -> Option<(String, RecordPayload)> {
    let payload = match record.data()? {
        RData::PTR(ptr) => RecordPayload::Ptr(ptr.0.to_string()),
        RData::SRV(srv) => RecordPayload::Srv {
            target: srv.target().to_string(),
            port: srv.port(),
        },
        RData::TXT(txt) => RecordPayload::Txt(
            txt.txt_data()
                .iter()
                .map(|data| String::from_utf8_lossy(data).into_owned())
                .collect(),
        ),
        RData::A(a) => RecordPayload::A(a.0),
        RData::AAAA(aaaa) => RecordPayload::Aaaa(aaaa.0),
        _ => RecordPayload::Unknown(u16::from(record.record_type())),
    };

    Some((record.name().to_string(), payload))
}
