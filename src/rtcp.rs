// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP sender reports, as described in
//! [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
//!
//! Only the sender-side SR is emitted; reception parses the SR head of a
//! compound packet and ignores everything else.

use crate::NtpTimestamp;

/// Length of an SR with no report blocks: 8-byte header + 20-byte sender info.
pub const SENDER_REPORT_LEN: usize = 28;

/// An RTCP sender report with no report blocks.
///
/// ```text
///         0                   1                   2                   3
///         0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// header |V=2|P|    RC   |   PT=SR=200   |             length            |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                         SSRC of sender                        |
///        +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// sender |              NTP timestamp, most significant word             |
/// info   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |             NTP timestamp, least significant word             |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                         RTP timestamp                         |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                     sender's packet count                     |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///        |                      sender's octet count                     |
///        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    /// Serializes to the 28-byte wire form.
    pub fn build(&self) -> [u8; SENDER_REPORT_LEN] {
        let mut sr = [0u8; SENDER_REPORT_LEN];
        sr[0] = 0x80; // V=2, P=0, RC=0
        sr[1] = 200; // PT=SR
        // length in 32-bit words minus one.
        sr[2..4].copy_from_slice(&((SENDER_REPORT_LEN as u16 / 4) - 1).to_be_bytes());
        sr[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        sr[8..16].copy_from_slice(&self.ntp_timestamp.0.to_be_bytes());
        sr[16..20].copy_from_slice(&self.rtp_timestamp.to_be_bytes());
        sr[20..24].copy_from_slice(&self.packet_count.to_be_bytes());
        sr[24..28].copy_from_slice(&self.octet_count.to_be_bytes());
        sr
    }

    /// Parses the sender info of an SR at the head of `data`.
    ///
    /// Report blocks (if any) are validated against the declared length but
    /// not interpreted.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let pkt = PacketRef::parse(data)?.0;
        match pkt.as_sender_report() {
            Some(sr) => Ok(sr),
            None => Err(format!("expected SR (PT=200), got PT={}", pkt.payload_type())),
        }
    }
}

/// Validates the packets of a compound RTCP packet, returning the first.
///
/// Checks (per [RFC 3550 appendix A.2](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.2)):
/// all packets are version 2, lengths add up, non-final packets unpadded.
pub fn validate_compound(raw: &[u8]) -> Result<PacketRef<'_>, String> {
    let (first_pkt, mut rest) = PacketRef::parse(raw)?;
    let mut pkt = first_pkt;
    loop {
        if rest.is_empty() {
            break;
        } else if pkt.has_padding() {
            return Err("padding on non-final packet within RTCP compound packet".to_owned());
        }
        (pkt, rest) = PacketRef::parse(rest)?;
    }
    Ok(first_pkt)
}

/// A single RTCP packet within a compound packet.
#[derive(Copy, Clone)]
pub struct PacketRef<'a> {
    buf: &'a [u8],
}

impl<'a> PacketRef<'a> {
    /// Parses one packet from the head of `raw`, returning it and the rest.
    fn parse(raw: &'a [u8]) -> Result<(Self, &'a [u8]), String> {
        if raw.len() < 8 {
            return Err(format!("RTCP packets must be at least 8 bytes; have {}", raw.len()));
        }
        if (raw[0] & 0b1100_0000) != 0b1000_0000 {
            return Err("RTCP packets must be version 2".to_owned());
        }
        let len = (usize::from(u16::from_be_bytes([raw[2], raw[3]])) + 1) * 4;
        if raw.len() < len {
            return Err(format!(
                "RTCP packet length {} exceeds remaining {} bytes",
                len,
                raw.len()
            ));
        }
        let (this, rest) = raw.split_at(len);
        Ok((PacketRef { buf: this }, rest))
    }

    #[inline]
    pub fn payload_type(self) -> u8 {
        self.buf[1]
    }

    #[inline]
    fn has_padding(self) -> bool {
        (self.buf[0] & 0b0010_0000) != 0
    }

    /// Interprets this packet as a sender report, if it is one with complete
    /// sender info.
    pub fn as_sender_report(self) -> Option<SenderReport> {
        if self.payload_type() != 200 || self.buf.len() < SENDER_REPORT_LEN {
            return None;
        }
        Some(SenderReport {
            ssrc: u32::from_be_bytes(self.buf[4..8].try_into().unwrap()),
            ntp_timestamp: NtpTimestamp(u64::from_be_bytes(self.buf[8..16].try_into().unwrap())),
            rtp_timestamp: u32::from_be_bytes(self.buf[16..20].try_into().unwrap()),
            packet_count: u32::from_be_bytes(self.buf[20..24].try_into().unwrap()),
            octet_count: u32::from_be_bytes(self.buf[24..28].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sr_roundtrip() {
        let sr = SenderReport {
            ssrc: 0x1234_5678,
            ntp_timestamp: NtpTimestamp(0xdead_beef_0000_0001),
            rtp_timestamp: 9_000,
            packet_count: 100,
            octet_count: 140_000,
        };
        let wire = sr.build();
        assert_eq!(wire.len(), SENDER_REPORT_LEN);
        assert_eq!(wire[0], 0x80);
        assert_eq!(wire[1], 200);
        assert_eq!(SenderReport::parse(&wire).unwrap(), sr);
    }

    #[test]
    fn rejects_truncated() {
        let sr = SenderReport {
            ssrc: 1,
            ntp_timestamp: NtpTimestamp(2),
            rtp_timestamp: 3,
            packet_count: 4,
            octet_count: 5,
        }
        .build();
        SenderReport::parse(&sr[..20]).unwrap_err();
    }

    #[test]
    fn compound_with_sdes() {
        // SR followed by a one-chunk SDES, as cameras commonly send.
        let mut buf = Vec::new();
        buf.extend_from_slice(
            &SenderReport {
                ssrc: 0x6642_6ae1,
                ntp_timestamp: NtpTimestamp(1),
                rtp_timestamp: 2,
                packet_count: 3,
                octet_count: 4,
            }
            .build(),
        );
        buf.extend_from_slice(&[
            0x81, 0xca, 0x00, 0x04, // SDES, one chunk, 4 words
            0x66, 0x42, 0x6a, 0xe1, // ssrc
            0x01, 0x06, b'(', b'n', b'o', b'n', b'e', b')', // CNAME "(none)"
            0x00, 0x00, 0x00, 0x00, // terminator + pad to word
        ]);
        let first = validate_compound(&buf).unwrap();
        assert_eq!(first.as_sender_report().unwrap().ssrc, 0x6642_6ae1);
    }
}
