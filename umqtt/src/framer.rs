//! Incremental framer for the inbound byte stream.
//!
//! Reassembles complete MQTT packets from reads of any size using the fixed
//! header's remaining length. State machine per packet:
//! - `Header`: next byte is the packet type byte
//! - `Length`: collecting remaining-length digits
//! - `Payload`: `remaining` body bytes still to read
//! - `Skip`: `remaining` body bytes of an oversized packet still to discard
//!
//! A packet above the size limit is dropped with a warning and the framer
//! picks up at the next packet. A remaining length with a fifth digit is an
//! error: the framer cannot tell where the next packet starts.
//!
//! Each emitted buffer holds the whole packet (type byte, length digits and
//! body), ready for [`codec::decode`](crate::codec::decode).

use bytes::{Bytes, BytesMut};

use tracing::warn;

use crate::error::{Error, Result};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Length { value: usize, multiplier: usize, digits: u8 },
    Payload { remaining: usize },
    Skip { remaining: usize },
}

/// Splits a byte stream into complete frame buffers.
#[derive(Debug)]
pub struct StreamFramer {
    buffer: BytesMut,
    state: State,
    max_packet_size: usize,
    dropped: u64,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    /// Create a framer with the default packet size limit.
    pub fn new() -> Self {
        Self::with_max_packet_size(MAX_PACKET_SIZE)
    }

    /// Create a framer that drops packets larger than `max_packet_size`.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            state: State::Header,
            max_packet_size,
            dropped: 0,
        }
    }

    /// Whether the framer sits between packets.
    pub fn is_idle(&self) -> bool {
        self.state == State::Header
    }

    /// Number of oversized packets dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drop any partial packet and start over.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::Header;
    }

    /// Feed one byte. Returns the packet it completes, if any.
    pub fn push(&mut self, byte: u8) -> Result<Option<Bytes>> {
        match self.state {
            State::Header => {
                self.buffer.extend_from_slice(&[byte]);
                self.state = State::Length { value: 0, multiplier: 1, digits: 0 };
                Ok(None)
            }
            State::Length { value, multiplier, digits } => {
                self.buffer.extend_from_slice(&[byte]);
                let value = value + (byte & 0x7F) as usize * multiplier;
                let digits = digits + 1;

                if byte & 0x80 != 0 {
                    if digits == 4 {
                        self.reset();
                        return Err(Error::MalformedFrame(
                            "remaining length longer than 4 bytes".to_string(),
                        ));
                    }
                    self.state = State::Length { value, multiplier: multiplier * 128, digits };
                    return Ok(None);
                }

                let size = 1 + digits as usize + value;
                if size > self.max_packet_size {
                    warn!(size, max = self.max_packet_size, "dropping oversized packet");
                    self.buffer.clear();
                    self.dropped += 1;
                    self.state = if value == 0 { State::Header } else { State::Skip { remaining: value } };
                    return Ok(None);
                }

                if value == 0 {
                    return Ok(Some(self.emit()));
                }
                self.buffer.reserve(value);
                self.state = State::Payload { remaining: value };
                Ok(None)
            }
            State::Payload { remaining } => {
                self.buffer.extend_from_slice(&[byte]);
                if remaining == 1 {
                    return Ok(Some(self.emit()));
                }
                self.state = State::Payload { remaining: remaining - 1 };
                Ok(None)
            }
            State::Skip { remaining } => {
                self.state = if remaining == 1 { State::Header } else { State::Skip { remaining: remaining - 1 } };
                Ok(None)
            }
        }
    }

    /// Feed a chunk of bytes. Returns every packet completed by it, in order.
    ///
    /// On error the framer is reset; bytes after the offending one are not
    /// consumed.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            // Body bytes are copied or skipped in bulk, header bytes one at a time.
            match self.state {
                State::Payload { remaining } => {
                    let n = remaining.min(chunk.len());
                    self.buffer.extend_from_slice(&chunk[..n]);
                    chunk = &chunk[n..];

                    if n == remaining {
                        frames.push(self.emit());
                    } else {
                        self.state = State::Payload { remaining: remaining - n };
                    }
                }
                State::Skip { remaining } => {
                    let n = remaining.min(chunk.len());
                    chunk = &chunk[n..];
                    self.state = if n == remaining { State::Header } else { State::Skip { remaining: remaining - n } };
                }
                State::Header | State::Length { .. } => {
                    if let Some(frame) = self.push(chunk[0])? {
                        frames.push(frame);
                    }
                    chunk = &chunk[1..];
                }
            }
        }

        Ok(frames)
    }

    fn emit(&mut self) -> Bytes {
        self.state = State::Header;
        self.buffer.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::frame::{Connack, Frame, Publish, Suback};
    use crate::types::QoS;

    fn sample_stream() -> (Vec<u8>, Vec<Bytes>) {
        let frames = vec![
            Frame::Connack(Connack::new(0)),
            Frame::Suback(Suback::granted(12, &[QoS::AtMostOnce, QoS::AtLeastOnce])),
            Frame::Publish(Publish::new("a/b", "hello")),
            Frame::Pingresp,
            Frame::Publish(Publish::new("big", vec![7u8; 300]).with_qos(QoS::AtLeastOnce, 3)),
            Frame::Publish(Publish::new("a/b", "")),
        ];

        let encoded: Vec<Bytes> = frames.iter().map(|f| codec::encode(f).unwrap()).collect();
        let stream = encoded.iter().flat_map(|b| b.iter().copied()).collect();
        (stream, encoded)
    }

    #[test]
    fn test_whole_buffer() {
        let (stream, expected) = sample_stream();
        let mut framer = StreamFramer::new();
        assert_eq!(framer.feed(&stream).unwrap(), expected);
        assert!(framer.is_idle());
    }

    #[test]
    fn test_every_chunk_size() {
        let (stream, expected) = sample_stream();

        for chunk_size in 1..=stream.len() {
            let mut framer = StreamFramer::new();
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                out.extend(framer.feed(chunk).unwrap());
            }
            assert_eq!(out, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_every_split_point() {
        let (stream, expected) = sample_stream();

        for split in 0..=stream.len() {
            let mut framer = StreamFramer::new();
            let mut out = framer.feed(&stream[..split]).unwrap();
            out.extend(framer.feed(&stream[split..]).unwrap());
            assert_eq!(out, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let (stream, expected) = sample_stream();
        let mut framer = StreamFramer::new();
        let out: Vec<Bytes> = stream
            .iter()
            .filter_map(|&b| framer.push(b).unwrap())
            .collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_zero_length_packet() {
        let mut framer = StreamFramer::new();
        assert_eq!(framer.push(0xD0).unwrap(), None);
        assert_eq!(framer.push(0x00).unwrap(), Some(Bytes::from_static(&[0xD0, 0x00])));
        assert!(framer.is_idle());
    }

    #[test]
    fn test_multi_byte_length() {
        let publish = Frame::Publish(Publish::new("t", vec![1u8; 20_000]));
        let encoded = codec::encode(&publish).unwrap();
        assert_eq!(encoded[1] & 0x80, 0x80);

        let mut framer = StreamFramer::new();
        let mut out = Vec::new();
        for chunk in encoded.chunks(1000) {
            out.extend(framer.feed(chunk).unwrap());
        }
        assert_eq!(out, vec![encoded]);
    }

    #[test]
    fn test_too_many_length_digits() {
        let mut framer = StreamFramer::new();
        let err = framer.feed(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
        assert!(framer.is_idle());
    }

    #[test]
    fn test_oversized_packet_skipped() {
        let big = codec::encode(&Frame::Publish(Publish::new("big", vec![7u8; 100]))).unwrap();
        let small = codec::encode(&Frame::Publish(Publish::new("a/b", "after"))).unwrap();
        let stream: Vec<u8> = big.iter().chain(small.iter()).copied().collect();

        for chunk_size in [1, 7, stream.len()] {
            let mut framer = StreamFramer::with_max_packet_size(64);
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                out.extend(framer.feed(chunk).unwrap());
            }
            assert_eq!(out, vec![small.clone()], "chunk size {}", chunk_size);
            assert_eq!(framer.dropped(), 1);
            assert!(framer.is_idle());
        }
    }
}
