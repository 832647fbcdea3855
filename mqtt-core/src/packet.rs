//! MQTT 3.1.1 Control Packet types (OASIS MQTT-3.1.1-os).

/// MQTT Control Packets.
#[derive(Debug, PartialEq, Clone)]
pub enum Packet<'a> {
    /// Client request to connect to a Server.
    Connect(Connect<'a>),
    /// Connect acknowledgment.
    ConnectAck(ConnectAck),
    /// Publish message.
    Publish(Publish<'a>),
    /// Publish acknowledgment (QoS 1).
    PublishAck(PacketId),
    /// Publish received, assured delivery part 1 (QoS 2).
    PublishReceived(PacketId),
    /// Publish release, assured delivery part 2 (QoS 2).
    PublishRelease(PacketId),
    /// Publish complete, assured delivery part 3 (QoS 2).
    PublishComplete(PacketId),
    /// Client subscribe request.
    Subscribe(Subscribe<'a>),
    /// Subscribe acknowledgment.
    SubscribeAck(SubscribeAck),
    /// Client unsubscribe request.
    Unsubscribe(Unsubscribe<'a>),
    /// Unsubscribe acknowledgment.
    UnsubscribeAck(PacketId),
    /// PING request.
    PingReq,
    /// PING response.
    PingResp,
    /// Client is disconnecting.
    Disconnect,
}

impl Packet<'_> {
    pub fn packet_type(&self) -> Type {
        match self {
            Packet::Connect(_) => Type::Connect,
            Packet::ConnectAck(_) => Type::ConnectAck,
            Packet::Publish(_) => Type::Publish,
            Packet::PublishAck(_) => Type::PublishAck,
            Packet::PublishReceived(_) => Type::PublishReceived,
            Packet::PublishRelease(_) => Type::PublishRelease,
            Packet::PublishComplete(_) => Type::PublishComplete,
            Packet::Subscribe(_) => Type::Subscribe,
            Packet::SubscribeAck(_) => Type::SubscribeAck,
            Packet::Unsubscribe(_) => Type::Unsubscribe,
            Packet::UnsubscribeAck(_) => Type::UnsubscribeAck,
            Packet::PingReq => Type::PingReq,
            Packet::PingResp => Type::PingResp,
            Packet::Disconnect => Type::Disconnect,
        }
    }
}

/// Fixed header present on every MQTT Control Packet.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct FixedHeader {
    pub packet_type: Type,
    pub packet_flags: u8,
    /// Number of bytes remaining after the fixed header: variable header + payload.
    pub remaining_length: usize,
}

/// MQTT Control Packet type, the high nibble of the fixed header's first byte.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Type {
    Connect = 1,
    ConnectAck = 2,
    Publish = 3,
    PublishAck = 4,
    PublishReceived = 5,
    PublishRelease = 6,
    PublishComplete = 7,
    Subscribe = 8,
    SubscribeAck = 9,
    Unsubscribe = 10,
    UnsubscribeAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl Type {
    pub fn from_u8(b: u8) -> Option<Type> {
        use Type::*;
        Some(match b {
            1 => Connect,
            2 => ConnectAck,
            3 => Publish,
            4 => PublishAck,
            5 => PublishReceived,
            6 => PublishRelease,
            7 => PublishComplete,
            8 => Subscribe,
            9 => SubscribeAck,
            10 => Unsubscribe,
            11 => UnsubscribeAck,
            12 => PingReq,
            13 => PingResp,
            14 => Disconnect,
            _ => return None,
        })
    }

    /// The fixed low-nibble flag bits the spec requires for this packet type,
    /// or `None` for PUBLISH, whose low nibble carries DUP/QoS/RETAIN instead.
    pub fn required_flags(self) -> Option<u8> {
        match self {
            Type::PublishRelease | Type::Subscribe | Type::Unsubscribe => Some(0b0010),
            Type::Publish => None,
            _ => Some(0b0000),
        }
    }
}

pub const PROTOCOL_NAME: &[u8] = b"MQTT";
pub const PROTOCOL_LEVEL: u8 = 0x04;

/// Quality of service levels.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    /// At most once delivery.
    AtMostOnce = 0,
    /// At least once delivery.
    AtLeastOnce = 1,
    /// Exactly once delivery.
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(b: u8) -> Option<QoS> {
        match b {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

bitflags! {
    /// CONNECT packet flags, byte 8 of the variable header.
    pub struct ConnectFlags: u8 {
        const USERNAME      = 0b1000_0000;
        const PASSWORD      = 0b0100_0000;
        const WILL_RETAIN   = 0b0010_0000;
        const WILL_QOS      = 0b0001_1000;
        const LAST_WILL     = 0b0000_0100;
        const CLEAN_SESSION = 0b0000_0010;
    }
}

const WILL_QOS_SHIFT: u8 = 3;

impl ConnectFlags {
    pub fn will_qos(self) -> QoS {
        QoS::from_u8((self & Self::WILL_QOS).bits() >> WILL_QOS_SHIFT).unwrap_or(QoS::AtMostOnce)
    }

    pub fn with_will_qos(qos: QoS) -> Self {
        Self::from_bits_truncate((qos as u8) << WILL_QOS_SHIFT)
    }
}

bitflags! {
    /// CONNACK packet flags, byte 1 of the variable header.
    pub struct ConnectAckFlags: u8 {
        const SESSION_PRESENT = 0b0000_0001;
    }
}

bitflags! {
    /// PUBLISH packet flags, the low nibble of the fixed header.
    pub struct PublishFlags: u8 {
        const DUP    = 0b0000_1000;
        const QOS    = 0b0000_0110;
        const RETAIN = 0b0000_0001;
    }
}

const PUBLISH_QOS_SHIFT: u8 = 1;

impl PublishFlags {
    pub fn qos(self) -> QoS {
        QoS::from_u8((self & Self::QOS).bits() >> PUBLISH_QOS_SHIFT).unwrap_or(QoS::AtMostOnce)
    }

    pub fn with_qos(qos: QoS) -> Self {
        Self::from_bits_truncate((qos as u8) << PUBLISH_QOS_SHIFT)
    }
}

/// Client request to connect to a Server.
#[derive(Debug, PartialEq, Clone)]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub last_will: Option<LastWill<'a>>,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

/// The Will message a broker publishes on the client's behalf if the
/// network connection is lost without a clean DISCONNECT.
#[derive(Debug, PartialEq, Clone)]
pub struct LastWill<'a> {
    pub qos: QoS,
    pub retain: bool,
    pub topic: &'a str,
    pub message: &'a [u8],
}

/// Connect acknowledgment.
#[derive(Debug, PartialEq, Clone)]
pub struct ConnectAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

/// CONNACK return code (MQTT-3.2.2-3..8).
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServiceUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(b: u8) -> Option<ConnectReturnCode> {
        use ConnectReturnCode::*;
        Some(match b {
            0 => Accepted,
            1 => UnacceptableProtocolVersion,
            2 => IdentifierRejected,
            3 => ServiceUnavailable,
            4 => BadUserNameOrPassword,
            5 => NotAuthorized,
            _ => return None,
        })
    }

    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ConnectReturnCode::Accepted => "connection accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => {
                "connection refused, unacceptable protocol version"
            }
            ConnectReturnCode::IdentifierRejected => "connection refused, identifier rejected",
            ConnectReturnCode::ServiceUnavailable => "connection refused, server unavailable",
            ConnectReturnCode::BadUserNameOrPassword => {
                "connection refused, bad user name or password"
            }
            ConnectReturnCode::NotAuthorized => "connection refused, not authorized",
        };
        f.write_str(msg)
    }
}

/// Packet Identifier: a nonzero 16-bit value shared by a request and its ack.
pub type PacketId = u16;

/// Publish message.
#[derive(Debug, PartialEq, Clone)]
pub struct Publish<'a> {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: &'a str,
    pub packet_id: Option<PacketId>,
    pub payload: &'a [u8],
}

impl Publish<'_> {
    pub fn flags(&self) -> PublishFlags {
        let mut flags = PublishFlags::with_qos(self.qos);
        if self.dup {
            flags |= PublishFlags::DUP;
        }
        if self.retain {
            flags |= PublishFlags::RETAIN;
        }
        flags
    }
}

/// Client subscribe request.
#[derive(Debug, PartialEq, Clone)]
pub struct Subscribe<'a> {
    pub packet_id: PacketId,
    pub subscriptions: Vec<(&'a str, QoS)>,
}

/// Subscribe acknowledgment.
#[derive(Debug, PartialEq, Clone)]
pub struct SubscribeAck {
    pub packet_id: PacketId,
    pub status: Vec<SubscribeReturnCode>,
}

/// Per-filter SUBACK return code.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub const FAILURE: u8 = 0x80;

    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => SubscribeReturnCode::Success(QoS::AtMostOnce),
            1 => SubscribeReturnCode::Success(QoS::AtLeastOnce),
            2 => SubscribeReturnCode::Success(QoS::ExactlyOnce),
            _ => SubscribeReturnCode::Failure,
        }
    }
}

impl From<SubscribeReturnCode> for u8 {
    fn from(code: SubscribeReturnCode) -> u8 {
        match code {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => SubscribeReturnCode::FAILURE,
        }
    }
}

/// Client unsubscribe request.
#[derive(Debug, PartialEq, Clone)]
pub struct Unsubscribe<'a> {
    pub packet_id: PacketId,
    pub topic_filters: Vec<&'a str>,
}
