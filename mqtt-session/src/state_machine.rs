//! Send-side state transition table (spec.md §4.5). The receive-side rules
//! (§4.6) are interleaved with dispatch and transport I/O closely enough
//! that they live directly in [`crate::io_loop`] rather than as a second
//! pure table here.

use mqtt_core::{QoS, Type};

use crate::message::MessageState;

/// What state a message moves to once its frame has been fully written,
/// and whether the DUP bit must be set on the frame before the *first*
/// send (QoS-1 PUBLISH sets DUP on retransmission only, per spec.md §4.5;
/// it is never set on the first send).
pub fn on_sent(packet_type: Type, qos: QoS) -> MessageState {
    match packet_type {
        Type::PublishAck | Type::PublishComplete | Type::Disconnect => MessageState::Complete,
        Type::Publish if qos == QoS::AtMostOnce => MessageState::Complete,
        Type::Publish => MessageState::AwaitingAck,
        Type::Connect
        | Type::PublishReceived
        | Type::PublishRelease
        | Type::Subscribe
        | Type::Unsubscribe
        | Type::PingReq => MessageState::AwaitingAck,
        // ConnectAck/SubscribeAck/UnsubscribeAck/PingResp are never
        // enqueued as outbound messages by this client.
        _ => MessageState::Complete,
    }
}
