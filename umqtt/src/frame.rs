//! MQTT control packets understood by the client.
//!
//! Frames are plain immutable values created at encode/decode boundaries.
//! Construction checks the invariants the wire format cannot express:
//! a SUBSCRIBE carries at least one valid filter, one QoS level per topic,
//! and a CONNECT carries either a complete will or none at all.

use std::borrow::Cow;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::topic;
use crate::types::{PacketType, QoS};

/// Default protocol name for MQTT 3.1.1.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// An MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Frame {
    /// Packet type of this frame.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Frame::Connect(_) => PacketType::Connect,
            Frame::Connack(_) => PacketType::ConnAck,
            Frame::Publish(_) => PacketType::Publish,
            Frame::Puback { .. } => PacketType::PubAck,
            Frame::Pubrel { .. } => PacketType::PubRel,
            Frame::Pubcomp { .. } => PacketType::PubComp,
            Frame::Subscribe(_) => PacketType::Subscribe,
            Frame::Suback(_) => PacketType::SubAck,
            Frame::Unsubscribe(_) => PacketType::Unsubscribe,
            Frame::Unsuback { .. } => PacketType::UnsubAck,
            Frame::Pingreq => PacketType::PingReq,
            Frame::Pingresp => PacketType::PingResp,
            Frame::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier, for frames that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Frame::Publish(p) if p.qos != QoS::AtMostOnce => Some(p.packet_id),
            Frame::Puback { packet_id }
            | Frame::Pubrel { packet_id }
            | Frame::Pubcomp { packet_id }
            | Frame::Unsuback { packet_id } => Some(*packet_id),
            Frame::Subscribe(s) => Some(s.packet_id),
            Frame::Suback(s) => Some(s.packet_id),
            Frame::Unsubscribe(u) => Some(u.packet_id),
            _ => None,
        }
    }
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol: String,
    pub version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// Last Will and Testament.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Connect {
    /// Create a CONNECT for MQTT 3.1.1 with no will and no credentials.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_LEVEL,
            clean_session: false,
            keep_alive: 0,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    /// Attach a will built from separately supplied topic and message.
    ///
    /// Fails when only one of the two is present.
    pub fn with_will_parts(
        mut self,
        topic: Option<String>,
        message: Option<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Self> {
        self.will = match (topic, message) {
            (Some(topic), Some(message)) => Some(Will { topic, message, qos, retain }),
            (None, None) => None,
            _ => {
                return Err(Error::InvalidConfig(
                    "will topic and will message must be set together".to_string(),
                ));
            }
        };
        Ok(self)
    }

    /// Attach a will.
    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set credentials. Either half may be absent.
    pub fn with_credentials(mut self, username: Option<String>, password: Option<Bytes>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Set keep alive interval in seconds.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set protocol name and level.
    pub fn with_protocol(mut self, name: impl Into<String>, version: u8) -> Self {
        self.protocol = name.into();
        self.version = version;
        self
    }
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub return_code: u8,
}

impl Connack {
    /// CONNACK without a present session.
    pub fn new(return_code: u8) -> Self {
        Self { session_present: false, return_code }
    }

    /// Whether the broker accepted the connection.
    pub fn is_accepted(&self) -> bool {
        self.return_code == 0
    }

    /// Human readable MQTT 3.1.1 meaning of the return code.
    pub fn reason(&self) -> &'static str {
        match self.return_code {
            0 => "accepted",
            1 => "unacceptable protocol version",
            2 => "identifier rejected",
            3 => "server unavailable",
            4 => "bad user name or password",
            5 => "not authorized",
            _ => "unknown return code",
        }
    }
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub packet_id: u16,
    pub dup: bool,
    pub retain: bool,
}

impl Publish {
    /// Create a QoS 0 publish.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            packet_id: 0,
            dup: false,
            retain: false,
        }
    }

    /// Set QoS and the packet identifier that goes with it.
    ///
    /// QoS 0 publishes carry no identifier, so `packet_id` is ignored for them.
    pub fn with_qos(mut self, qos: QoS, packet_id: u16) -> Self {
        self.qos = qos;
        self.packet_id = if qos == QoS::AtMostOnce { 0 } else { packet_id };
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Set duplicate delivery flag.
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    /// Payload as UTF-8 text, replacing invalid sequences.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// One topic filter of a SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub topic: String,
    pub qos: QoS,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    packet_id: u16,
    filters: Vec<SubscribeFilter>,
}

impl Subscribe {
    /// Build a SUBSCRIBE from parallel topic and QoS sequences.
    pub fn new<T: Into<String>>(topics: Vec<T>, qos_levels: Vec<QoS>, packet_id: u16) -> Result<Self> {
        if topics.len() != qos_levels.len() {
            return Err(Error::InvalidConfig(format!(
                "{} topics but {} qos levels",
                topics.len(),
                qos_levels.len()
            )));
        }

        let filters = topics
            .into_iter()
            .zip(qos_levels)
            .map(|(topic, qos)| SubscribeFilter { topic: topic.into(), qos })
            .collect();
        Self::from_filters(packet_id, filters)
    }

    /// Build a single-topic SUBSCRIBE.
    pub fn single(topic: impl Into<String>, qos: QoS, packet_id: u16) -> Result<Self> {
        Self::new(vec![topic.into()], vec![qos], packet_id)
    }

    pub(crate) fn from_filters(packet_id: u16, filters: Vec<SubscribeFilter>) -> Result<Self> {
        if filters.is_empty() {
            return Err(Error::InvalidConfig("subscribe needs at least one topic".to_string()));
        }
        for filter in &filters {
            topic::validate_filter(&filter.topic)?;
        }
        Ok(Self { packet_id, filters })
    }

    /// Packet identifier the SUBACK must echo.
    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    /// Requested filters, in order.
    pub fn filters(&self) -> &[SubscribeFilter] {
        &self.filters
    }

    /// Topic filters in request order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|f| f.topic.as_str())
    }
}

/// Per-topic result carried by a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    /// Parse a SUBACK return code byte.
    pub fn from_u8(value: u8) -> Self {
        match QoS::from_u8(value) {
            Some(qos) => SubscribeReturnCode::Success(qos),
            None => SubscribeReturnCode::Failure,
        }
    }

    /// Wire value of this return code.
    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

impl Suback {
    /// A SUBACK granting the given QoS levels.
    pub fn granted(packet_id: u16, qos_levels: &[QoS]) -> Self {
        Self {
            packet_id,
            return_codes: qos_levels.iter().map(|q| SubscribeReturnCode::Success(*q)).collect(),
        }
    }

    /// Whether any filter was refused by the broker.
    pub fn has_failures(&self) -> bool {
        self.return_codes.contains(&SubscribeReturnCode::Failure)
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}
