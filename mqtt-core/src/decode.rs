//! Restartable MQTT packet parsing.
//!
//! [`unpack`] never blocks waiting for bytes: if the buffer does not yet
//! hold a complete packet it returns `Ok(None)` so the caller can read more
//! and retry, the same pattern `mqtt-sync-client`'s `Framed::parse_packet`
//! uses around this crate's field-level parsers.

use core::str;

use nom::{
    bytes::complete::tag,
    combinator::{map, map_opt, map_res, verify},
    error::VerboseError,
    multi::length_data,
    number::complete::{be_u16, be_u8},
    sequence::tuple,
    IResult,
};

use crate::error::Error;
use crate::packet::*;

const CONTINUATION_BIT: u8 = 0x80;

/// Decode an MQTT variable-length integer (the "remaining length" encoding).
///
/// Returns `Ok(None)` if `input` does not yet contain a complete encoding,
/// `Ok(Some((value, bytes_consumed)))` on success, or `Err(bad-message)` if a
/// fifth byte would be required (MQTT caps this field at four bytes).
pub fn decode_variable_length_usize(input: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    let mut value: usize = 0;
    for (i, &byte) in input.iter().enumerate() {
        if i == 4 {
            return Err(Error::BadMessage(
                "remaining length field longer than 4 bytes".into(),
            ));
        }
        value += usize::from(byte & !CONTINUATION_BIT) << (7 * i);
        if byte & CONTINUATION_BIT == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if input.len() >= 4 {
        // a 5th continuation byte would be required; reject now rather than
        // waiting for bytes that would only prove the packet malformed.
        return Err(Error::BadMessage(
            "remaining length field longer than 4 bytes".into(),
        ));
    }
    Ok(None)
}

type NomErr<'a> = nom::Err<VerboseError<&'a [u8]>>;
type PResult<'a, O> = IResult<&'a [u8], O, VerboseError<&'a [u8]>>;

fn to_bad_message(err: NomErr<'_>) -> Error {
    match err {
        nom::Err::Incomplete(_) => {
            Error::BadMessage("packet body shorter than its remaining length".into())
        }
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            Error::BadMessage(format!("malformed packet body: {:?}", e.errors))
        }
    }
}

fn utf8_str(input: &[u8]) -> PResult<&str> {
    map_res(length_data(be_u16), str::from_utf8)(input)
}

const CLIENT_ID_MAX_LEN: usize = 23;
const CLIENT_ID_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn client_id(input: &[u8]) -> PResult<&str> {
    verify(utf8_str, |s: &str| {
        s.len() <= CLIENT_ID_MAX_LEN && s.bytes().all(|b| CLIENT_ID_CHARS.contains(&b))
    })(input)
}

fn packet_id(input: &[u8]) -> PResult<PacketId> {
    verify(be_u16, |&id| id != 0)(input)
}

fn subscription(input: &[u8]) -> PResult<(&str, QoS)> {
    tuple((utf8_str, map_opt(be_u8, QoS::from_u8)))(input)
}

impl<'a> Connect<'a> {
    fn parse(input: &'a [u8]) -> PResult<'a, Connect<'a>> {
        let (input, (_, _, flags, keep_alive)) = tuple((
            tag(b"\x00\x04MQTT".as_ref()),
            verify(be_u8, |&level| level == PROTOCOL_LEVEL),
            map_opt(be_u8, ConnectFlags::from_bits),
            be_u16,
        ))(input)?;
        // client id is intentionally not validated with `client_id()` here:
        // some brokers accept ids outside the portable charset, and rejecting
        // them would make this crate stricter than the wire actually is.
        let (input, client_id) = utf8_str(input)?;
        let (input, last_will) = if flags.contains(ConnectFlags::LAST_WILL) {
            let (input, (topic, message)) = tuple((utf8_str, length_data(be_u16)))(input)?;
            (
                input,
                Some(LastWill {
                    qos: flags.will_qos(),
                    retain: flags.contains(ConnectFlags::WILL_RETAIN),
                    topic,
                    message,
                }),
            )
        } else {
            (input, None)
        };
        let (input, username) = if flags.contains(ConnectFlags::USERNAME) {
            map(utf8_str, Some)(input)?
        } else {
            (input, None)
        };
        let (input, password) = if flags.contains(ConnectFlags::PASSWORD) {
            map(length_data(be_u16), Some)(input)?
        } else {
            (input, None)
        };

        Ok((
            input,
            Connect {
                clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
                keep_alive,
                client_id,
                last_will,
                username,
                password,
            },
        ))
    }
}

impl ConnectAck {
    fn parse(input: &[u8]) -> PResult<Self> {
        map(
            tuple((
                map_opt(be_u8, ConnectAckFlags::from_bits),
                map_opt(be_u8, ConnectReturnCode::from_u8),
            )),
            |(flags, return_code)| ConnectAck {
                session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
                return_code,
            },
        )(input)
    }
}

impl<'a> Publish<'a> {
    fn parse(flags: PublishFlags, input: &'a [u8]) -> PResult<'a, Publish<'a>> {
        let dup = flags.contains(PublishFlags::DUP);
        let qos = flags.qos();
        let retain = flags.contains(PublishFlags::RETAIN);
        let (input, topic) = utf8_str(input)?;
        let (payload, packet_id) = if qos >= QoS::AtLeastOnce {
            map(packet_id, Some)(input)?
        } else {
            (input, None)
        };

        Ok((
            &[][..],
            Publish {
                dup,
                qos,
                retain,
                topic,
                packet_id,
                payload,
            },
        ))
    }
}

impl<'a> Subscribe<'a> {
    fn parse(input: &'a [u8]) -> PResult<'a, Subscribe<'a>> {
        let (mut input, packet_id) = packet_id(input)?;
        let mut subscriptions = Vec::new();
        while !input.is_empty() {
            let (rest, sub) = subscription(input)?;
            subscriptions.push(sub);
            input = rest;
        }
        Ok((
            input,
            Subscribe {
                packet_id,
                subscriptions,
            },
        ))
    }
}

impl SubscribeAck {
    fn parse(input: &[u8]) -> PResult<Self> {
        let (mut input, packet_id) = packet_id(input)?;
        let mut status = Vec::new();
        while !input.is_empty() {
            let (rest, code) = map(be_u8, SubscribeReturnCode::from_u8)(input)?;
            status.push(code);
            input = rest;
        }
        Ok((input, SubscribeAck { packet_id, status }))
    }
}

impl<'a> Unsubscribe<'a> {
    fn parse(input: &'a [u8]) -> PResult<'a, Unsubscribe<'a>> {
        let (mut input, packet_id) = packet_id(input)?;
        let mut topic_filters = Vec::new();
        while !input.is_empty() {
            let (rest, filter) = utf8_str(input)?;
            topic_filters.push(filter);
            input = rest;
        }
        Ok((
            input,
            Unsubscribe {
                packet_id,
                topic_filters,
            },
        ))
    }
}

fn parse_body(packet_type: Type, packet_flags: u8, body: &[u8]) -> Result<Packet, Error> {
    match packet_type {
        Type::Connect => Connect::parse(body).map(|(_, p)| Packet::Connect(p)),
        Type::ConnectAck => ConnectAck::parse(body).map(|(_, p)| Packet::ConnectAck(p)),
        Type::Publish => {
            let flags = PublishFlags::from_bits_truncate(packet_flags);
            Publish::parse(flags, body).map(|(_, p)| Packet::Publish(p))
        }
        Type::PublishAck => packet_id(body).map(|(_, id)| Packet::PublishAck(id)),
        Type::PublishReceived => packet_id(body).map(|(_, id)| Packet::PublishReceived(id)),
        Type::PublishRelease => packet_id(body).map(|(_, id)| Packet::PublishRelease(id)),
        Type::PublishComplete => packet_id(body).map(|(_, id)| Packet::PublishComplete(id)),
        Type::Subscribe => Subscribe::parse(body).map(|(_, p)| Packet::Subscribe(p)),
        Type::SubscribeAck => SubscribeAck::parse(body).map(|(_, p)| Packet::SubscribeAck(p)),
        Type::Unsubscribe => Unsubscribe::parse(body).map(|(_, p)| Packet::Unsubscribe(p)),
        Type::UnsubscribeAck => packet_id(body).map(|(_, id)| Packet::UnsubscribeAck(id)),
        Type::PingReq => return Ok(Packet::PingReq),
        Type::PingResp => return Ok(Packet::PingResp),
        Type::Disconnect => return Ok(Packet::Disconnect),
    }
    .map_err(to_bad_message)
}

/// Parse at most one packet from the front of `input`.
///
/// Returns `Ok(None)` when `input` does not yet hold a full packet (the
/// caller should read more bytes and retry), `Ok(Some((packet, consumed)))`
/// on success, or `Err` for a packet that is malformed or exceeds
/// `max_message`.
pub fn unpack(input: &[u8], max_message: usize) -> Result<Option<(Packet, usize)>, Error> {
    if input.is_empty() {
        return Ok(None);
    }

    let first = input[0];
    let packet_type = Type::from_u8(first >> 4)
        .ok_or_else(|| Error::BadState(format!("unknown packet type {}", first >> 4)))?;
    let packet_flags = first & 0x0F;

    if let Some(required) = packet_type.required_flags() {
        if packet_flags != required {
            return Err(Error::BadState(format!(
                "invalid header flags {:#06b} for {:?}",
                packet_flags, packet_type
            )));
        }
    }

    let (remaining_length, varint_len) = match decode_variable_length_usize(&input[1..])? {
        Some(v) => v,
        None => return Ok(None),
    };

    if remaining_length > max_message {
        return Err(Error::BadResponse(format!(
            "remaining length {} exceeds max message size {}",
            remaining_length, max_message
        )));
    }

    let header_len = 1 + varint_len;
    let total_len = header_len + remaining_length;
    if input.len() < total_len {
        return Ok(None);
    }

    let body = &input[header_len..total_len];
    let packet = parse_body(packet_type, packet_flags, body)?;

    Ok(Some((packet, total_len)))
}
