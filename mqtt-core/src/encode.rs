//! MQTT packet serialization: the write-side counterpart to [`crate::decode`].

use crate::error::Error;
use crate::packet::*;

const CONTINUATION_BIT: u8 = 0x80;

/// Encode a "remaining length" style variable-length integer.
///
/// MQTT caps this field at four bytes, i.e. values up to `0x0FFF_FFFF`.
pub fn encode_variable_length_usize(mut value: usize, buf: &mut Vec<u8>) -> Result<(), Error> {
    const MAX: usize = 0x0FFF_FFFF;
    if value > MAX {
        return Err(Error::WontFit(format!(
            "remaining length {} exceeds the 4-byte varint limit of {}",
            value, MAX
        )));
    }
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= CONTINUATION_BIT;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    Ok(())
}

fn utf8_str(s: &str, buf: &mut Vec<u8>) -> Result<(), Error> {
    if s.len() > u16::MAX as usize {
        return Err(Error::BadArgs(format!(
            "string of {} bytes exceeds the 65535-byte UTF-8 string limit",
            s.len()
        )));
    }
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn binary_data(data: &[u8], buf: &mut Vec<u8>) -> Result<(), Error> {
    if data.len() > u16::MAX as usize {
        return Err(Error::BadArgs(format!(
            "binary field of {} bytes exceeds the 65535-byte limit",
            data.len()
        )));
    }
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

fn encode_body(packet: &Packet, body: &mut Vec<u8>) -> Result<(), Error> {
    match packet {
        Packet::Connect(connect) => {
            // PROTOCOL_NAME's length prefix is fixed (2 bytes, value 4),
            // unlike a general utf8_str field, so it is written directly.
            body.extend_from_slice(&[0x00, 0x04]);
            body.extend_from_slice(PROTOCOL_NAME);
            body.push(PROTOCOL_LEVEL);

            let mut flags = ConnectFlags::empty();
            if connect.clean_session {
                flags |= ConnectFlags::CLEAN_SESSION;
            }
            if let Some(will) = &connect.last_will {
                flags |= ConnectFlags::LAST_WILL;
                flags |= ConnectFlags::with_will_qos(will.qos);
                if will.retain {
                    flags |= ConnectFlags::WILL_RETAIN;
                }
            }
            if connect.username.is_some() {
                flags |= ConnectFlags::USERNAME;
            }
            if connect.password.is_some() {
                flags |= ConnectFlags::PASSWORD;
            }
            body.push(flags.bits());
            body.extend_from_slice(&connect.keep_alive.to_be_bytes());

            utf8_str(connect.client_id, body)?;
            if let Some(will) = &connect.last_will {
                utf8_str(will.topic, body)?;
                binary_data(will.message, body)?;
            }
            if let Some(username) = connect.username {
                utf8_str(username, body)?;
            }
            if let Some(password) = connect.password {
                binary_data(password, body)?;
            }
        }
        Packet::ConnectAck(ack) => {
            let mut flags = ConnectAckFlags::empty();
            if ack.session_present {
                flags |= ConnectAckFlags::SESSION_PRESENT;
            }
            body.push(flags.bits());
            body.push(ack.return_code as u8);
        }
        Packet::Publish(publish) => {
            utf8_str(publish.topic, body)?;
            if publish.qos >= QoS::AtLeastOnce {
                let id = publish.packet_id.ok_or_else(|| {
                    Error::BadArgs("publish at QoS >= 1 requires a packet id".into())
                })?;
                body.extend_from_slice(&id.to_be_bytes());
            }
            body.extend_from_slice(publish.payload);
        }
        Packet::PublishAck(id)
        | Packet::PublishReceived(id)
        | Packet::PublishRelease(id)
        | Packet::PublishComplete(id)
        | Packet::UnsubscribeAck(id) => {
            body.extend_from_slice(&id.to_be_bytes());
        }
        Packet::Subscribe(subscribe) => {
            body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
            for (filter, qos) in &subscribe.subscriptions {
                utf8_str(filter, body)?;
                body.push(*qos as u8);
            }
        }
        Packet::SubscribeAck(ack) => {
            body.extend_from_slice(&ack.packet_id.to_be_bytes());
            for code in &ack.status {
                body.push((*code).into());
            }
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
            for filter in &unsubscribe.topic_filters {
                utf8_str(filter, body)?;
            }
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
    }
    Ok(())
}

fn header_flags(packet: &Packet) -> u8 {
    match packet {
        Packet::Publish(publish) => publish.flags().bits(),
        other => other.packet_type().required_flags().unwrap_or(0),
    }
}

/// Serialize `packet` onto the end of `buf`.
///
/// Fails with [`Error::WontFit`] if the encoded remaining length would
/// exceed either the protocol's 4-byte varint limit or the caller-supplied
/// `max_message` cap.
pub fn pack(packet: &Packet, buf: &mut Vec<u8>, max_message: usize) -> Result<(), Error> {
    let mut body = Vec::new();
    encode_body(packet, &mut body)?;

    if body.len() > max_message {
        return Err(Error::WontFit(format!(
            "encoded packet body of {} bytes exceeds max message size {}",
            body.len(),
            max_message
        )));
    }

    let first_byte = (packet.packet_type() as u8) << 4 | header_flags(packet);
    buf.push(first_byte);
    encode_variable_length_usize(body.len(), buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}
