// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video,
//! with RTP payload format as in [RFC 6184](https://tools.ietf.org/html/rfc6184).

use std::collections::VecDeque;

use bytes::Bytes;
use h264_reader::nal::{NalHeader, UnitType};
use log::trace;

use crate::rtp::{PacketBuilder, ReceivedPacket};

use super::{annexb_nalus, FrameType, VideoCodec, VideoFrame, VideoParams, START_CODE};

/// FU-A payload type, RFC 6184 section 5.8.
const NAL_TYPE_FU_A: u8 = 28;

/// RTP packetizer producing single-NALU packets and FU-A fragmentation.
///
/// STAP aggregation is intentionally never emitted: single/fragmented packets
/// keep timing simple and limit a loss to fewer NALUs.
pub(crate) struct Packetizer {
    payload_type: u8,
    ssrc: u32,
    seq: u16,
    mtu: usize,
}

impl Packetizer {
    pub(crate) fn new(payload_type: u8, ssrc: u32, mtu: usize, initial_seq: u16) -> Self {
        Self {
            payload_type,
            ssrc,
            seq: initial_seq,
            mtu: mtu.max(64),
        }
    }

    pub(crate) fn next_sequence(&self) -> u16 {
        self.seq
    }

    pub(crate) fn packetize(&mut self, frame: &VideoFrame) -> Vec<Bytes> {
        let rtp_timestamp = frame.pts_ms().wrapping_mul(90) as u32;
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        for nalu in annexb_nalus(frame.data()) {
            if nalu.is_empty() {
                continue;
            }
            if nalu.len() <= self.mtu {
                chunks.push(nalu.to_vec());
                continue;
            }

            // FU-A fragmentation. The NAL header byte is consumed; its type
            // moves into the FU header and its NRI into the FU indicator.
            let nal_header = nalu[0];
            let fu_indicator = (nal_header & 0b0110_0000) | NAL_TYPE_FU_A;
            let payload = &nalu[1..];
            let max_fragment = self.mtu - 2;
            let mut offset = 0;
            let mut first = true;
            while offset < payload.len() {
                let fragment = &payload[offset..(offset + max_fragment).min(payload.len())];
                let last = offset + fragment.len() == payload.len();
                let mut fu_header = nal_header & 0b0001_1111;
                if first {
                    fu_header |= 0b1000_0000;
                }
                if last {
                    fu_header |= 0b0100_0000;
                }
                let mut chunk = Vec::with_capacity(2 + fragment.len());
                chunk.push(fu_indicator);
                chunk.push(fu_header);
                chunk.extend_from_slice(fragment);
                chunks.push(chunk);
                offset += fragment.len();
                first = false;
            }
        }

        let n = chunks.len();
        let mut packets = Vec::with_capacity(n);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let pkt = PacketBuilder {
                sequence_number: self.seq,
                timestamp: rtp_timestamp,
                payload_type: self.payload_type,
                ssrc: self.ssrc,
                mark: i + 1 == n,
            }
            .build(&chunk)
            .expect("payload fits and PT is valid");
            self.seq = self.seq.wrapping_add(1);
            packets.push(pkt.into_data());
        }
        trace!(
            "packetized {} byte frame into {} packets, ts={}",
            frame.data().len(),
            n,
            rtp_timestamp
        );
        packets
    }
}

/// Reassembles frames from in-order RTP packets as specified in RFC 6184.
///
/// A frame accumulates until the marker bit or a timestamp change. Interior
/// packet loss is tolerated (the glitch is the decoder's problem); only
/// H.265 has a drop mode, see [`super::h265`].
pub(crate) struct Depacketizer {
    params: VideoParams,
    pending: VecDeque<VideoFrame>,

    /// Accumulated Annex-B bytes of the in-progress frame.
    frame: Vec<u8>,
    frame_ts: u32,
    in_progress: bool,
    is_idr: bool,

    frames_output: u64,
}

impl Depacketizer {
    pub(crate) fn new(params: VideoParams) -> Self {
        Self {
            params,
            pending: VecDeque::with_capacity(1),
            frame: Vec::new(),
            frame_ts: 0,
            in_progress: false,
            is_idr: false,
            frames_output: 0,
        }
    }

    pub(crate) fn loss_events(&self) -> u64 {
        0
    }

    pub(crate) fn frames_output(&self) -> u64 {
        self.frames_output
    }

    pub(crate) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        let ts = pkt.timestamp();
        let mark = pkt.mark();
        let seq = pkt.sequence_number();
        let payload = pkt.payload();
        if payload.is_empty() {
            return Err(format!("empty RTP payload at seq {seq:04x}"));
        }

        if !self.in_progress {
            self.frame_ts = ts;
            self.in_progress = true;
        } else if ts != self.frame_ts {
            self.emit();
            self.frame_ts = ts;
            self.in_progress = true;
        }

        let nal_header = payload[0];
        if (nal_header >> 7) != 0 {
            return Err(format!("NAL header has F bit set at seq {seq:04x}"));
        }
        match nal_header & 0b0001_1111 {
            1..=23 => {
                self.append_nalu(payload);
                if is_idr_header(nal_header) {
                    self.is_idr = true;
                }
            }
            24 => self.expand_stap(payload, 1, seq)?,
            25 => {
                // STAP-B carries a 2-byte DON after the payload header.
                if payload.len() < 3 {
                    return Err(format!("STAP-B too short at seq {seq:04x}"));
                }
                self.expand_stap(payload, 3, seq)?;
            }
            NAL_TYPE_FU_A => {
                if payload.len() < 2 {
                    return Err(format!("FU-A too short at seq {seq:04x}"));
                }
                let fu_header = payload[1];
                let start = (fu_header & 0b1000_0000) != 0;
                let reconstructed = (nal_header & 0b1110_0000) | (fu_header & 0b0001_1111);
                if start {
                    self.frame.extend_from_slice(&START_CODE);
                    self.frame.push(reconstructed);
                    if is_idr_header(reconstructed) {
                        self.is_idr = true;
                    }
                }
                if payload.len() > 2 {
                    self.frame.extend_from_slice(&payload[2..]);
                }
            }
            t => return Err(format!("unhandled NAL type {t} at seq {seq:04x}")),
        }

        if mark {
            self.emit();
        }
        Ok(())
    }

    pub(crate) fn pull(&mut self) -> Option<VideoFrame> {
        self.pending.pop_front()
    }

    /// Expands a STAP payload: `[hdr][don?][u16 size][nalu]...`.
    fn expand_stap(&mut self, payload: &[u8], mut off: usize, seq: u16) -> Result<(), String> {
        while off + 2 <= payload.len() {
            let size = usize::from(u16::from_be_bytes([payload[off], payload[off + 1]]));
            off += 2;
            if size == 0 || off + size > payload.len() {
                return Err(format!("bad aggregate entry size {size} at seq {seq:04x}"));
            }
            let nalu = &payload[off..off + size];
            self.append_nalu(nalu);
            if is_idr_header(nalu[0]) {
                self.is_idr = true;
            }
            off += size;
        }
        Ok(())
    }

    fn append_nalu(&mut self, nalu: &[u8]) {
        self.frame.extend_from_slice(&START_CODE);
        self.frame.extend_from_slice(nalu);
    }

    fn emit(&mut self) {
        if !self.frame.is_empty() {
            let frame = VideoFrame::new(
                VideoCodec::H264,
                if self.is_idr { FrameType::Idr } else { FrameType::P },
                u64::from(self.frame_ts) / 90,
                Bytes::from(std::mem::take(&mut self.frame)),
            )
            .with_dimensions(self.params.width, self.params.height, self.params.fps);
            self.pending.push_back(frame);
            self.frames_output += 1;
        }
        self.frame.clear();
        self.is_idr = false;
        self.in_progress = false;
    }
}

fn is_idr_header(nal_header: u8) -> bool {
    NalHeader::new(nal_header)
        .map(|h| h.nal_unit_type() == UnitType::SliceLayerWithoutPartitioningIdr)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16, ts: u32, mark: bool, payload: &[u8]) -> ReceivedPacket {
        crate::rtp::test_packet(96, seq, ts, mark, payload)
    }

    #[test]
    fn stap_a_with_idr() {
        // STAP-A wrapping a non-IDR NALU `41 01 02` and an IDR NALU `65 88 84 21`.
        let mut d = Depacketizer::new(VideoParams::default());
        d.push(pkt(
            1,
            9000,
            true,
            &[
                0x78, 0x00, 0x03, 0x41, 0x01, 0x02, 0x00, 0x04, 0x65, 0x88, 0x84, 0x21,
            ],
        ))
        .unwrap();
        let f = d.pull().expect("one frame");
        assert!(d.pull().is_none());
        assert_eq!(f.codec(), VideoCodec::H264);
        assert!(f.is_idr());
        assert_eq!(
            f.data(),
            &[
                0x00, 0x00, 0x00, 0x01, 0x41, 0x01, 0x02, //
                0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21,
            ]
        );
        assert_eq!(f.pts_ms(), 100);
    }

    #[test]
    fn fu_a_round_trip() {
        let mut nalu = vec![0x65];
        nalu.extend((0..2999u32).map(|i| (i % 255) as u8));
        assert_eq!(nalu.len(), 3000);
        let mut data = START_CODE.to_vec();
        data.extend_from_slice(&nalu);
        let frame = VideoFrame::new(VideoCodec::H264, FrameType::Idr, 0, Bytes::from(data));

        let mut p = Packetizer::new(96, 0x99, 1500, 0);
        let pkts = p.packetize(&frame);
        assert!(pkts.len() >= 2);

        // First fragment: FU-A with S=1, E=0; last: E=1 and the frame marker.
        assert_eq!(pkts[0][12] & 0x1F, NAL_TYPE_FU_A);
        assert_eq!(pkts[0][13] & 0b1100_0000, 0b1000_0000);
        let last = pkts.last().unwrap();
        assert_eq!(last[13] & 0b0100_0000, 0b0100_0000);
        assert_eq!(last[1] & 0x80, 0x80);
        for pkt in &pkts[1..pkts.len() - 1] {
            assert_eq!(pkt[13] & 0b1100_0000, 0);
            assert_eq!(pkt[1] & 0x80, 0);
        }

        let mut d = Depacketizer::new(VideoParams::default());
        for raw in pkts {
            d.push(crate::rtp::ReceivedPacket::new(raw, 0).unwrap())
                .unwrap();
        }
        let f = d.pull().expect("one frame");
        assert_eq!(f.data().len(), 3000 + 4);
        assert!(f.is_idr());
    }

    #[test]
    fn marker_and_every_packet_pt() {
        let mut data = START_CODE.to_vec();
        data.extend_from_slice(&[0x41, 1, 2, 3]);
        let frame = VideoFrame::new(VideoCodec::H264, FrameType::P, 33, Bytes::from(data));
        let mut p = Packetizer::new(96, 0x1, super::super::DEFAULT_MTU, 100);
        let pkts = p.packetize(&frame);
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0][0] & 0xC0, 0x80);
        assert_eq!(pkts[0][1] & 0x7F, 96);
        assert_eq!(pkts[0][1] & 0x80, 0x80);
        assert_eq!(u16::from_be_bytes([pkts[0][2], pkts[0][3]]), 100);
        assert_eq!(p.next_sequence(), 101);
    }

    #[test]
    fn timestamp_change_emits_previous_frame() {
        let mut d = Depacketizer::new(VideoParams::default());
        // Frame A: one slice, no marker (lost tail).
        d.push(pkt(1, 9000, false, &[0x41, 0xAA])).unwrap();
        // Frame B begins at a new timestamp.
        d.push(pkt(2, 12000, true, &[0x41, 0xBB])).unwrap();
        let a = d.pull().expect("frame A");
        let b = d.pull().expect("frame B");
        assert_eq!(a.data(), &[0, 0, 0, 1, 0x41, 0xAA]);
        assert_eq!(a.pts_ms(), 100);
        assert_eq!(b.data(), &[0, 0, 0, 1, 0x41, 0xBB]);
        assert!(d.pull().is_none());
    }

    #[test]
    fn sequence_wraps() {
        let mut data = START_CODE.to_vec();
        data.extend_from_slice(&[0x41, 1]);
        let frame = VideoFrame::new(VideoCodec::H264, FrameType::P, 0, Bytes::from(data));
        let mut p = Packetizer::new(96, 0x1, super::super::DEFAULT_MTU, u16::MAX);
        let first = p.packetize(&frame);
        let second = p.packetize(&frame);
        assert_eq!(
            u16::from_be_bytes([first[0][2], first[0][3]]),
            u16::MAX
        );
        assert_eq!(u16::from_be_bytes([second[0][2], second[0][3]]), 0);
    }

    #[test]
    fn rejects_f_bit() {
        let mut d = Depacketizer::new(VideoParams::default());
        d.push(pkt(1, 0, true, &[0x80, 0x01])).unwrap_err();
    }
}
