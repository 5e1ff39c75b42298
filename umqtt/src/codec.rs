//! MQTT 3.1.1 frame encoding and decoding.
//!
//! Every function here is pure: frames go in, bytes come out (and back).
//! Splitting a live byte stream into frame buffers is the job of
//! [`StreamFramer`](crate::framer::StreamFramer).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::frame::{
    Connack, Connect, Frame, Publish, Suback, Subscribe, SubscribeFilter, SubscribeReturnCode,
    Unsubscribe, Will,
};
use crate::types::{PacketType, QoS};

/// Largest value the remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_RESERVED: u8 = 0x01;

// ============================================================================
// Remaining length
// ============================================================================

/// Encode a remaining length as an MQTT variable-length integer (1 to 4 bytes).
///
/// Values above [`MAX_REMAINING_LENGTH`] are not checked here.
pub fn encode_remaining_length(mut value: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);

    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);

        if value == 0 {
            break;
        }
    }

    out
}

/// Decode a variable-length integer from the start of `buf`.
///
/// Returns `(value, bytes_consumed)`, or `None` if the terminating byte is
/// missing from the first four bytes.
pub fn decode_remaining_length(buf: &[u8]) -> Option<(usize, usize)> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().take(4).enumerate() {
        value += (byte & 0x7F) as usize * multiplier;

        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }

        multiplier *= 128;
    }

    None
}

/// Number of bytes needed to encode `value` as a remaining length.
pub const fn remaining_length_len(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a frame into its wire representation.
pub fn encode(frame: &Frame) -> Result<Bytes> {
    if let Frame::Publish(p) = frame {
        if p.qos == QoS::AtMostOnce && p.packet_id != 0 {
            return Err(Error::InvalidFrame(format!(
                "qos 0 publish cannot carry packet id {}",
                p.packet_id
            )));
        }
    }

    let remaining = remaining_length(frame);
    if remaining > MAX_REMAINING_LENGTH {
        return Err(Error::InvalidFrame(format!(
            "remaining length {} exceeds {}",
            remaining, MAX_REMAINING_LENGTH
        )));
    }

    let packet_type = frame.packet_type();
    let flags = match frame {
        Frame::Publish(p) => publish_flags(p),
        _ => packet_type.fixed_flags(),
    };

    let mut buf = BytesMut::with_capacity(1 + remaining_length_len(remaining) + remaining);
    buf.put_u8(((packet_type as u8) << 4) | flags);
    buf.put_slice(&encode_remaining_length(remaining));

    match frame {
        Frame::Connect(c) => write_connect(&mut buf, c)?,
        Frame::Connack(c) => {
            buf.put_u8(c.session_present as u8);
            buf.put_u8(c.return_code);
        }
        Frame::Publish(p) => {
            put_string(&mut buf, &p.topic)?;
            if p.qos != QoS::AtMostOnce {
                buf.put_u16(p.packet_id);
            }
            buf.put_slice(&p.payload);
        }
        Frame::Puback { packet_id }
        | Frame::Pubrel { packet_id }
        | Frame::Pubcomp { packet_id }
        | Frame::Unsuback { packet_id } => buf.put_u16(*packet_id),
        Frame::Subscribe(s) => {
            buf.put_u16(s.packet_id());
            for filter in s.filters() {
                put_string(&mut buf, &filter.topic)?;
                buf.put_u8(filter.qos as u8);
            }
        }
        Frame::Suback(s) => {
            buf.put_u16(s.packet_id);
            for code in &s.return_codes {
                buf.put_u8(code.to_u8());
            }
        }
        Frame::Unsubscribe(u) => {
            buf.put_u16(u.packet_id);
            for topic in &u.topics {
                put_string(&mut buf, topic)?;
            }
        }
        Frame::Pingreq | Frame::Pingresp | Frame::Disconnect => {}
    }

    debug_assert_eq!(buf.len(), 1 + remaining_length_len(remaining) + remaining);
    Ok(buf.freeze())
}

fn publish_flags(p: &Publish) -> u8 {
    let mut flags = (p.qos as u8) << 1;
    if p.dup {
        flags |= 0x08;
    }
    if p.retain {
        flags |= 0x01;
    }
    flags
}

fn write_connect(buf: &mut BytesMut, c: &Connect) -> Result<()> {
    // Protocol name and level
    put_string(buf, &c.protocol)?;
    buf.put_u8(c.version);

    // Connect flags
    let mut flags = 0u8;
    if c.username.is_some() {
        flags |= FLAG_USERNAME;
    }
    if c.password.is_some() {
        flags |= FLAG_PASSWORD;
    }
    if let Some(ref will) = c.will {
        flags |= FLAG_WILL | ((will.qos as u8) << 3);
        if will.retain {
            flags |= FLAG_WILL_RETAIN;
        }
    }
    if c.clean_session {
        flags |= FLAG_CLEAN_SESSION;
    }
    buf.put_u8(flags);

    buf.put_u16(c.keep_alive);
    put_string(buf, &c.client_id)?;

    if let Some(ref will) = c.will {
        put_string(buf, &will.topic)?;
        put_binary(buf, &will.message)?;
    }
    if let Some(ref username) = c.username {
        put_string(buf, username)?;
    }
    if let Some(ref password) = c.password {
        put_binary(buf, password)?;
    }

    Ok(())
}

/// Size of the variable header plus payload of a frame.
fn remaining_length(frame: &Frame) -> usize {
    match frame {
        Frame::Connect(c) => {
            // protocol name + level + flags + keep alive
            let mut len = 2 + c.protocol.len() + 1 + 1 + 2;
            len += 2 + c.client_id.len();

            if let Some(ref will) = c.will {
                len += 2 + will.topic.len();
                len += 2 + will.message.len();
            }
            if let Some(ref username) = c.username {
                len += 2 + username.len();
            }
            if let Some(ref password) = c.password {
                len += 2 + password.len();
            }
            len
        }
        Frame::Connack(_) => 2,
        Frame::Publish(p) => {
            let mut len = 2 + p.topic.len() + p.payload.len();
            if p.qos != QoS::AtMostOnce {
                len += 2;
            }
            len
        }
        Frame::Puback { .. } | Frame::Pubrel { .. } | Frame::Pubcomp { .. } | Frame::Unsuback { .. } => 2,
        Frame::Subscribe(s) => 2 + s.filters().iter().map(|f| 2 + f.topic.len() + 1).sum::<usize>(),
        Frame::Suback(s) => 2 + s.return_codes.len(),
        Frame::Unsubscribe(u) => 2 + u.topics.iter().map(|t| 2 + t.len()).sum::<usize>(),
        Frame::Pingreq | Frame::Pingresp | Frame::Disconnect => 0,
    }
}

/// Write a UTF-8 string (2-byte length prefix + data).
fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    put_binary(buf, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
fn put_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(Error::InvalidFrame(format!(
            "field of {} bytes exceeds the 65535 byte limit",
            data.len()
        )));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one complete frame buffer.
///
/// Unknown packet types fail with [`Error::UnrecognizedFrame`]; bodies that do
/// not fit their header fail with [`Error::MalformedFrame`]. Both only concern
/// this one frame.
pub fn decode(buf: &[u8]) -> Result<Frame> {
    let first = *buf
        .first()
        .ok_or_else(|| Error::MalformedFrame("empty frame".to_string()))?;
    let type_nibble = first >> 4;
    let flags = first & 0x0F;

    let packet_type = match PacketType::from_u8(type_nibble) {
        Some(PacketType::PubRec) | None => return Err(Error::UnrecognizedFrame(type_nibble)),
        Some(t) => t,
    };

    let (remaining, len_bytes) = decode_remaining_length(&buf[1..])
        .ok_or_else(|| Error::MalformedFrame("invalid remaining length".to_string()))?;
    let header_len = 1 + len_bytes;
    if buf.len() != header_len + remaining {
        return Err(Error::MalformedFrame(format!(
            "remaining length {} but {} body bytes",
            remaining,
            buf.len() - header_len
        )));
    }

    let mut r = Reader::new(&buf[header_len..]);

    let frame = match packet_type {
        PacketType::Connect => Frame::Connect(read_connect(&mut r)?),
        PacketType::ConnAck => {
            let ack = r.u8()?;
            let return_code = r.u8()?;
            Frame::Connack(Connack { session_present: ack & 0x01 != 0, return_code })
        }
        PacketType::Publish => Frame::Publish(read_publish(flags, &mut r)?),
        PacketType::PubAck => Frame::Puback { packet_id: r.u16()? },
        PacketType::PubRel => Frame::Pubrel { packet_id: r.u16()? },
        PacketType::PubComp => Frame::Pubcomp { packet_id: r.u16()? },
        PacketType::Subscribe => {
            let packet_id = r.u16()?;
            let mut filters = Vec::new();
            while !r.is_empty() {
                let topic = r.string()?;
                let qos = read_qos(r.u8()?)?;
                filters.push(SubscribeFilter { topic, qos });
            }
            Frame::Subscribe(
                Subscribe::from_filters(packet_id, filters)
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?,
            )
        }
        PacketType::SubAck => {
            let packet_id = r.u16()?;
            let return_codes = r.rest().iter().map(|&b| SubscribeReturnCode::from_u8(b)).collect();
            Frame::Suback(Suback { packet_id, return_codes })
        }
        PacketType::Unsubscribe => {
            let packet_id = r.u16()?;
            let mut topics = Vec::new();
            while !r.is_empty() {
                topics.push(r.string()?);
            }
            Frame::Unsubscribe(Unsubscribe { packet_id, topics })
        }
        PacketType::UnsubAck => Frame::Unsuback { packet_id: r.u16()? },
        PacketType::PingReq => Frame::Pingreq,
        PacketType::PingResp => Frame::Pingresp,
        PacketType::Disconnect => Frame::Disconnect,
        PacketType::PubRec => return Err(Error::UnrecognizedFrame(type_nibble)),
    };

    r.finish()?;
    Ok(frame)
}

fn read_qos(value: u8) -> Result<QoS> {
    QoS::from_u8(value).ok_or_else(|| Error::MalformedFrame(format!("invalid qos {}", value)))
}

fn read_connect(r: &mut Reader<'_>) -> Result<Connect> {
    let protocol = r.string()?;
    let version = r.u8()?;

    let flags = r.u8()?;
    if flags & FLAG_RESERVED != 0 {
        return Err(Error::MalformedFrame("reserved connect flag set".to_string()));
    }
    let will_qos = read_qos((flags >> 3) & 0x03)?;

    let keep_alive = r.u16()?;
    let client_id = r.string()?;

    let will = if flags & FLAG_WILL != 0 {
        let topic = r.string()?;
        let message = r.binary()?;
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: flags & FLAG_WILL_RETAIN != 0,
        })
    } else {
        None
    };

    let username = if flags & FLAG_USERNAME != 0 { Some(r.string()?) } else { None };
    let password = if flags & FLAG_PASSWORD != 0 { Some(r.binary()?) } else { None };

    Ok(Connect {
        protocol,
        version,
        clean_session: flags & FLAG_CLEAN_SESSION != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn read_publish(flags: u8, r: &mut Reader<'_>) -> Result<Publish> {
    let qos = read_qos((flags >> 1) & 0x03)?;
    let topic = r.string()?;
    let packet_id = if qos != QoS::AtMostOnce { r.u16()? } else { 0 };
    let payload = Bytes::copy_from_slice(r.rest());

    Ok(Publish {
        topic,
        payload,
        qos,
        packet_id,
        dup: flags & 0x08 != 0,
        retain: flags & 0x01 != 0,
    })
}

/// Cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::MalformedFrame(format!(
                "truncated body: needed {} more bytes, {} left",
                n,
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn binary(&mut self) -> Result<Bytes> {
        let len = self.u16()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| Error::MalformedFrame("string is not valid utf-8".to_string()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::MalformedFrame(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let bytes = encode(&frame).unwrap();
        assert_eq!(decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_remaining_length() {
        for value in [0, 127, 128, 16383, 16384, 2097151, 268435455] {
            let encoded = encode_remaining_length(value);
            assert_eq!(encoded.len(), remaining_length_len(value));
            assert_eq!(decode_remaining_length(&encoded), Some((value, encoded.len())));
        }
    }

    #[test]
    fn test_remaining_length_bytes() {
        assert_eq!(encode_remaining_length(0), vec![0x00]);
        assert_eq!(encode_remaining_length(127), vec![0x7F]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(encode_remaining_length(16384), vec![0x80, 0x80, 0x01]);
        assert_eq!(encode_remaining_length(268435455), vec![0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn test_remaining_length_incomplete() {
        assert_eq!(decode_remaining_length(&[]), None);
        assert_eq!(decode_remaining_length(&[0x80, 0x80]), None);
        assert_eq!(decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]), None);
        // Trailing bytes after the terminator are not consumed.
        assert_eq!(decode_remaining_length(&[0x05, 0xAA]), Some((5, 1)));
    }

    #[test]
    fn test_connect_wire_bytes() {
        let connect = Connect::new("c").with_keep_alive(60).with_clean_session(true);
        let bytes = encode(&Frame::Connect(connect)).unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[
                0x10, 13, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
                0x04, // level
                0x02, // flags: clean session
                0x00, 0x3C, // keep alive
                0x00, 0x01, b'c', // client id
            ]
        );
    }

    #[test]
    fn test_connect_flags() {
        let connect = Connect::new("id")
            .with_will(Will {
                topic: "w".into(),
                message: Bytes::from_static(b"gone"),
                qos: QoS::ExactlyOnce,
                retain: true,
            })
            .with_credentials(Some("user".into()), Some(Bytes::from_static(b"pass")));
        let bytes = encode(&Frame::Connect(connect)).unwrap();
        // header(2) + protocol name(6) + level(1), flags at index 9
        assert_eq!(bytes[9], 0x80 | 0x40 | 0x20 | (2 << 3) | 0x04);
    }

    #[test]
    fn test_connect_roundtrip_bare() {
        roundtrip(Frame::Connect(Connect::new("bare")));
    }

    #[test]
    fn test_connect_roundtrip_full() {
        let connect = Connect::new("full-client")
            .with_keep_alive(30)
            .with_clean_session(true)
            .with_will(Will {
                topic: "status/full-client".into(),
                message: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            })
            .with_credentials(Some("admin".into()), Some(Bytes::from_static(b"secret")));
        roundtrip(Frame::Connect(connect));
    }

    #[test]
    fn test_connack_roundtrip() {
        roundtrip(Frame::Connack(Connack::new(0)));
        roundtrip(Frame::Connack(Connack { session_present: true, return_code: 5 }));
        assert_eq!(encode(&Frame::Connack(Connack::new(0))).unwrap().as_ref(), &[0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_subscribe_multi_topic() {
        let sub = Subscribe::new(
            vec!["a/b", "c/+", "d/#"],
            vec![QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce],
            12,
        )
        .unwrap();
        let bytes = encode(&Frame::Subscribe(sub.clone())).unwrap();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(&bytes[2..4], &[0x00, 0x0C]);
        roundtrip(Frame::Subscribe(sub));
    }

    #[test]
    fn test_suback_roundtrip() {
        roundtrip(Frame::Suback(Suback {
            packet_id: 12,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtMostOnce),
                SubscribeReturnCode::Success(QoS::ExactlyOnce),
                SubscribeReturnCode::Failure,
            ],
        }));
    }

    #[test]
    fn test_publish_empty_payload() {
        let publish = Publish::new("a/b", Bytes::new());
        let bytes = encode(&Frame::Publish(publish.clone())).unwrap();
        assert_eq!(bytes.as_ref(), &[0x30, 0x05, 0x00, 0x03, b'a', b'/', b'b']);
        roundtrip(Frame::Publish(publish));
    }

    #[test]
    fn test_publish_flags() {
        let publish = Publish::new("t", "hello")
            .with_qos(QoS::AtLeastOnce, 0x0102)
            .with_dup(true)
            .with_retain(true);
        let bytes = encode(&Frame::Publish(publish.clone())).unwrap();
        assert_eq!(bytes[0], 0x3B);
        assert_eq!(&bytes[5..7], &[0x01, 0x02]);
        assert_eq!(&bytes[7..], b"hello");
        roundtrip(Frame::Publish(publish));
    }

    #[test]
    fn test_publish_qos0_has_no_packet_id() {
        let publish = Publish::new("a/b", "x").with_qos(QoS::AtMostOnce, 7);
        assert_eq!(publish.packet_id, 0);
        roundtrip(Frame::Publish(publish));

        let publish = Publish { packet_id: 7, ..Publish::new("a/b", "x") };
        let err = encode(&Frame::Publish(publish)).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }

    #[test]
    fn test_acks_roundtrip() {
        roundtrip(Frame::Puback { packet_id: 1 });
        roundtrip(Frame::Pubrel { packet_id: 2 });
        roundtrip(Frame::Pubcomp { packet_id: 3 });
        roundtrip(Frame::Unsuback { packet_id: 4 });
        assert_eq!(encode(&Frame::Pubrel { packet_id: 2 }).unwrap()[0], 0x62);
        assert_eq!(encode(&Frame::Puback { packet_id: 1 }).unwrap().len(), 4);
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(encode(&Frame::Pingreq).unwrap().as_ref(), &[0xC0, 0x00]);
        assert_eq!(encode(&Frame::Disconnect).unwrap().as_ref(), &[0xE0, 0x00]);
        roundtrip(Frame::Pingresp);
        roundtrip(Frame::Unsubscribe(Unsubscribe {
            packet_id: 9,
            topics: vec!["a/b".into(), "c".into()],
        }));
    }

    #[test]
    fn test_unrecognized_type() {
        assert!(matches!(decode(&[0xF0, 0x00]), Err(Error::UnrecognizedFrame(0x0F))));
        assert!(matches!(decode(&[0x00, 0x00]), Err(Error::UnrecognizedFrame(0))));
        assert!(matches!(decode(&[0x50, 0x02, 0x00, 0x01]), Err(Error::UnrecognizedFrame(5))));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(decode(&[]), Err(Error::MalformedFrame(_))));
        // Length says 2, only 1 body byte.
        assert!(matches!(decode(&[0x20, 0x02, 0x00]), Err(Error::MalformedFrame(_))));
        // CONNACK with a trailing byte.
        assert!(matches!(decode(&[0x20, 0x03, 0x00, 0x00, 0x00]), Err(Error::MalformedFrame(_))));
        // PUBLISH with qos 3.
        assert!(matches!(decode(&[0x36, 0x03, 0x00, 0x01, b'a']), Err(Error::MalformedFrame(_))));
        // Topic length runs past the body.
        assert!(matches!(decode(&[0x30, 0x02, 0x00, 0x09]), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_oversized_string() {
        let topic = "x".repeat(u16::MAX as usize + 1);
        let err = encode(&Frame::Publish(Publish::new(topic, "p"))).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }
}
