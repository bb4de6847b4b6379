// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packet handling as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).
//!
//! Fixed header layout (all multi-byte fields big-endian):
//!
//! | offset | field |
//! |---|---|
//! | 0 | `V` (2 bits), `P`, `X`, `CC` (4 bits) |
//! | 1 | `M`, `PT` (7 bits) |
//! | 2 | sequence number (u16) |
//! | 4 | timestamp (u32) |
//! | 8 | SSRC (u32) |
//! | 12 | CSRC list, extension, payload, padding |

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed header, before CSRCs and extensions.
const FIXED_HEADER_LEN: usize = 12;

/// A malformed RTP packet. Carries the failed check and the packet size;
/// callers drop the packet and count or log it.
#[derive(Debug)]
pub struct RtpParseError {
    pub what: &'static str,
    pub packet_len: usize,
}

impl std::fmt::Display for RtpParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (packet is {} bytes)", self.what, self.packet_len)
    }
}

impl std::error::Error for RtpParseError {}

/// A validated RTP packet, owning its bytes and the payload bounds computed
/// during validation.
pub struct RawPacket {
    data: Bytes,
    payload: Range<u16>,
}

impl RawPacket {
    /// Validates `data` as an RTP packet.
    ///
    /// The header is walked once: fixed part, CSRC list, the optional
    /// extension (4-byte header plus its declared word count), and trailing
    /// padding. Anything whose declared lengths run past the packet bounds is
    /// rejected.
    pub fn parse(data: Bytes) -> Result<Self, RtpParseError> {
        let total = data.len();
        let fail = |what| RtpParseError {
            what,
            packet_len: total,
        };
        if total < FIXED_HEADER_LEN {
            return Err(fail("shorter than the 12-byte fixed header"));
        }
        if total > usize::from(u16::MAX) {
            return Err(fail("exceeds the 65535-byte transport limit"));
        }
        let b0 = data[0];
        if b0 >> 6 != 2 {
            return Err(fail("version field is not 2"));
        }

        let mut header_len = FIXED_HEADER_LEN + 4 * usize::from(b0 & 0x0F);
        let has_extension = b0 & 0b0001_0000 != 0;
        if has_extension {
            // Profile id (2 bytes) + word count (2 bytes) + that many words.
            if total < header_len + 4 {
                return Err(fail("truncated extension header"));
            }
            let words = usize::from(u16::from_be_bytes([
                data[header_len + 2],
                data[header_len + 3],
            ]));
            header_len += 4 + 4 * words;
        }
        if header_len > total {
            return Err(fail("header runs past the end of the packet"));
        }

        let has_padding = b0 & 0b0010_0000 != 0;
        let payload_end = if has_padding {
            let pad = usize::from(data[total - 1]);
            if pad == 0 || header_len + pad > total {
                return Err(fail("padding count is invalid"));
            }
            total - pad
        } else {
            total
        };

        Ok(Self {
            data,
            payload: header_len as u16..payload_end as u16,
        })
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.data[1] & 0b1000_0000 != 0
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0b0111_1111
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// The full packet, header included.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// The payload, between the header and any padding.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[usize::from(self.payload.start)..usize::from(self.payload.end)]
    }

    /// Consumes the packet, returning the full wire bytes.
    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Consumes the packet, returning the payload without copying.
    #[inline]
    pub fn into_payload_bytes(self) -> Bytes {
        self.data
            .slice(usize::from(self.payload.start)..usize::from(self.payload.end))
    }
}

impl std::fmt::Debug for RawPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPacket")
            .field("ssrc", &self.ssrc())
            .field("sequence_number", &self.sequence_number())
            .field("timestamp", &self.timestamp())
            .field("mark", &self.mark())
            .field("payload", &crate::dump::BytePreview(self.payload()))
            .finish()
    }
}

/// Serializes packets with V=2 and no padding, extension, or CSRC list, the
/// only form this crate emits.
pub struct PacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl PacketBuilder {
    pub fn build(self, payload: &[u8]) -> Result<RawPacket, RtpParseError> {
        if self.payload_type > 0x7F {
            return Err(RtpParseError {
                what: "payload type does not fit in 7 bits",
                packet_len: 0,
            });
        }
        let total = FIXED_HEADER_LEN + payload.len();
        if total > usize::from(u16::MAX) {
            return Err(RtpParseError {
                what: "payload too large for one packet",
                packet_len: total,
            });
        }
        let mut wire = BytesMut::with_capacity(total);
        wire.put_u8(2 << 6);
        wire.put_u8(u8::from(self.mark) << 7 | self.payload_type);
        wire.put_u16(self.sequence_number);
        wire.put_u32(self.timestamp);
        wire.put_u32(self.ssrc);
        wire.put_slice(payload);
        Ok(RawPacket {
            data: wire.freeze(),
            payload: FIXED_HEADER_LEN as u16..total as u16,
        })
    }
}

/// A received, validated RTP packet, as handed to a depacketizer.
pub struct ReceivedPacket {
    packet: RawPacket,

    /// Sequence numbers skipped between the previous delivered packet and
    /// this one.
    loss: u16,
}

impl ReceivedPacket {
    pub fn new(data: Bytes, loss: u16) -> Result<Self, RtpParseError> {
        Ok(Self {
            packet: RawPacket::parse(data)?,
            loss,
        })
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.packet.timestamp()
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.packet.mark()
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.packet.ssrc()
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.packet.sequence_number()
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.packet.payload_type()
    }

    #[inline]
    pub fn raw(&self) -> &[u8] {
        self.packet.raw()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.packet.payload()
    }

    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    #[inline]
    pub fn into_payload_bytes(self) -> Bytes {
        self.packet.into_payload_bytes()
    }
}

impl std::fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedPacket")
            .field("packet", &self.packet)
            .field("loss", &self.loss)
            .finish()
    }
}

/// Depacketizer-test helper: builds a validated [`ReceivedPacket`].
#[cfg(test)]
pub(crate) fn test_packet(
    payload_type: u8,
    seq: u16,
    timestamp: u32,
    mark: bool,
    payload: &[u8],
) -> ReceivedPacket {
    let packet = PacketBuilder {
        sequence_number: seq,
        timestamp,
        payload_type,
        ssrc: 0x42,
        mark,
    }
    .build(payload)
    .expect("test packet is well-formed");
    ReceivedPacket { packet, loss: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse() {
        let pkt = PacketBuilder {
            sequence_number: 0x1234,
            timestamp: 0x9abcdef0,
            payload_type: 96,
            ssrc: 0xdeadbeef,
            mark: true,
        }
        .build(b"hello")
        .unwrap();
        assert_eq!(pkt.raw()[0] & 0xC0, 0x80);
        assert_eq!(pkt.raw()[1] & 0x7F, 96);

        let parsed = RawPacket::parse(pkt.into_data()).unwrap();
        assert_eq!(parsed.sequence_number(), 0x1234);
        assert_eq!(parsed.timestamp(), 0x9abcdef0);
        assert_eq!(parsed.ssrc(), 0xdeadbeef);
        assert!(parsed.mark());
        assert_eq!(parsed.payload_type(), 96);
        assert_eq!(parsed.payload(), b"hello");
        assert_eq!(&parsed.into_payload_bytes()[..], b"hello");
    }

    #[test]
    fn csrc_extension_padding() {
        // V=2, P=1, X=1, CC=1: one CSRC, a one-word extension, 2 pad bytes.
        let data = Bytes::from_static(&[
            0b1011_0001,
            96,
            0x00,
            0x01, // seq
            0x00,
            0x00,
            0x00,
            0x10, // ts
            0x00,
            0x00,
            0x00,
            0x02, // ssrc
            0x0a,
            0x0b,
            0x0c,
            0x0d, // csrc
            0xbe,
            0xde,
            0x00,
            0x01, // extension header, 1 word follows
            0x11,
            0x22,
            0x33,
            0x44, // extension body
            0xaa, // payload
            0x00,
            0x02, // padding
        ]);
        let pkt = RawPacket::parse(data).unwrap();
        assert_eq!(pkt.payload(), &[0xaa]);
    }

    #[test]
    fn rejects_bad_version() {
        let e = RawPacket::parse(Bytes::from_static(&[0u8; 12])).unwrap_err();
        assert_eq!(e.what, "version field is not 2");
    }

    #[test]
    fn rejects_header_past_end() {
        // CC=15 declares a 72-byte header inside a 12-byte packet.
        let mut data = vec![0x8F, 96];
        data.extend_from_slice(&[0u8; 10]);
        let e = RawPacket::parse(Bytes::from(data)).unwrap_err();
        assert_eq!(e.what, "header runs past the end of the packet");
    }

    #[test]
    fn rejects_runt() {
        let e = RawPacket::parse(Bytes::from_static(&[0x80, 96, 0, 1])).unwrap_err();
        assert_eq!(e.what, "shorter than the 12-byte fixed header");
    }

    #[test]
    fn rejects_bogus_padding() {
        // P set with a padding count larger than the packet.
        let mut data = vec![0b1010_0000, 96];
        data.extend_from_slice(&[0u8; 9]);
        data.push(200);
        let e = RawPacket::parse(Bytes::from(data)).unwrap_err();
        assert_eq!(e.what, "padding count is invalid");
    }

    #[test]
    fn rejects_truncated_extension() {
        let mut data = vec![0b1001_0000, 96];
        data.extend_from_slice(&[0u8; 10]);
        // Header ends exactly at the fixed part; the declared extension has
        // no room for its own 4-byte header.
        let e = RawPacket::parse(Bytes::from(data)).unwrap_err();
        assert_eq!(e.what, "truncated extension header");
    }
}
