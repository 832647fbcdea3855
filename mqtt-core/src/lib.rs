//! MQTT 3.1.1 wire format: packet types, a restartable codec, and client-side
//! topic filter matching.

#![forbid(unsafe_code)]

#[macro_use]
extern crate bitflags;

mod decode;
mod encode;
mod error;
mod packet;
pub mod topic;

pub use decode::{decode_variable_length_usize, unpack};
pub use encode::{encode_variable_length_usize, pack};
pub use error::{Error, Result};
pub use packet::{
    Connect, ConnectAck, ConnectAckFlags, ConnectFlags, ConnectReturnCode, FixedHeader, LastWill,
    Packet, PacketId, Publish, PublishFlags, QoS, Subscribe, SubscribeAck, SubscribeReturnCode,
    Type, Unsubscribe, PROTOCOL_LEVEL, PROTOCOL_NAME,
};
