// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265)-encoded video,
//! with RTP payload format as in [RFC 7798](https://tools.ietf.org/html/rfc7798).

use std::collections::VecDeque;

use bytes::Bytes;
use log::trace;

use crate::rtp::{PacketBuilder, ReceivedPacket};

use super::{annexb_nalus, FrameType, VideoCodec, VideoFrame, VideoParams, START_CODE};

/// Aggregation packet type, RFC 7798 section 4.4.2.
const NAL_TYPE_AP: u8 = 48;
/// Fragmentation unit type, RFC 7798 section 4.4.3.
const NAL_TYPE_FU: u8 = 49;
/// PACI carrier, RFC 7798 section 4.4.4; ignored on receive.
const NAL_TYPE_PACI: u8 = 50;

/// `nal_unit_header()` as in T.REC H.265 section 7.3.1.2:
///
/// ```text
/// +---------------+---------------+
/// |0|1|2|3|4|5|6|7|0|1|2|3|4|5|6|7|
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |F|   Type    |  LayerId  | TID |
/// +-------------+-----------------+
/// ```
#[inline]
fn hdr_unit_type(b0: u8) -> u8 {
    (b0 >> 1) & 0x3F
}

/// Whether `unit_type` is an intra random access point picture
/// (`BLA_W_LP..=CRA_NUT`).
#[inline]
fn is_irap(unit_type: u8) -> bool {
    (16..=21).contains(&unit_type)
}

/// RTP packetizer producing single-NALU packets and FU fragmentation.
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
            if nalu.len() < 2 {
                continue;
            }
            if nalu.len() <= self.mtu {
                chunks.push(nalu.to_vec());
                continue;
            }

            // FU fragmentation: a two-byte payload header with type 49 takes
            // the original header's layer id and TID; the FU header carries
            // the original type plus S/E bits.
            let unit_type = hdr_unit_type(nalu[0]);
            let ph0 = (NAL_TYPE_FU << 1) | (nalu[0] & 0b0000_0001);
            let ph1 = nalu[1];
            let payload = &nalu[2..];
            let max_fragment = self.mtu - 3;
            let mut offset = 0;
            let mut first = true;
            while offset < payload.len() {
                let fragment = &payload[offset..(offset + max_fragment).min(payload.len())];
                let last = offset + fragment.len() == payload.len();
                let mut fu_header = unit_type;
                if first {
                    fu_header |= 0b1000_0000;
                }
                if last {
                    fu_header |= 0b0100_0000;
                }
                let mut chunk = Vec::with_capacity(3 + fragment.len());
                chunk.push(ph0);
                chunk.push(ph1);
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

/// Reassembles frames from in-order RTP packets as specified in RFC 7798.
///
/// Unlike H.264, a loss inside a fragmentation unit puts the depacketizer
/// into drop mode: the half-built NALU is rewound out of the accumulator,
/// subsequent FU fragments for the frame are ignored, and the frame itself is
/// discarded at its boundary instead of being emitted corrupt.
pub(crate) struct Depacketizer {
    params: VideoParams,
    pending: VecDeque<VideoFrame>,

    frame: Vec<u8>,
    frame_ts: u32,
    in_progress: bool,
    is_idr: bool,

    last_seq: Option<u16>,
    fu_in_progress: bool,
    fu_drop_mode: bool,
    /// Accumulator length at the start of the in-progress FU, for rewinding.
    fu_start_offset: usize,

    loss_events: u64,
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
            last_seq: None,
            fu_in_progress: false,
            fu_drop_mode: false,
            fu_start_offset: 0,
            loss_events: 0,
            frames_output: 0,
        }
    }

    pub(crate) fn loss_events(&self) -> u64 {
        self.loss_events
    }

    pub(crate) fn frames_output(&self) -> u64 {
        self.frames_output
    }

    pub(crate) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        let ts = pkt.timestamp();
        let mark = pkt.mark();
        let seq = pkt.sequence_number();
        let payload = pkt.payload();

        if let Some(last) = self.last_seq {
            if seq != last.wrapping_add(1) && self.fu_in_progress {
                // Mid-FU loss: rewind the half-built NALU and ignore the rest
                // of this fragmentation unit.
                self.loss_events += 1;
                self.fu_drop_mode = true;
                self.fu_in_progress = false;
                self.frame.truncate(self.fu_start_offset);
            }
        }
        self.last_seq = Some(seq);

        if payload.len() < 2 {
            return Err(format!("H.265 payload too short at seq {seq:04x}"));
        }

        if !self.in_progress {
            self.frame_ts = ts;
            self.in_progress = true;
        } else if ts != self.frame_ts {
            if self.fu_drop_mode {
                self.discard_frame();
            } else {
                self.emit();
            }
            self.frame_ts = ts;
            self.in_progress = true;
        }

        match hdr_unit_type(payload[0]) {
            NAL_TYPE_AP => {
                // [payload hdr(2)][u16 size][nalu]...
                let mut off = 2;
                while off + 2 <= payload.len() {
                    let size = usize::from(u16::from_be_bytes([payload[off], payload[off + 1]]));
                    off += 2;
                    if size < 2 || off + size > payload.len() {
                        return Err(format!("bad AP entry size {size} at seq {seq:04x}"));
                    }
                    let nalu = &payload[off..off + size];
                    self.append_nalu(nalu);
                    if is_irap(hdr_unit_type(nalu[0])) {
                        self.is_idr = true;
                    }
                    off += size;
                }
            }
            NAL_TYPE_FU => {
                if payload.len() < 3 {
                    return Err(format!("FU too short at seq {seq:04x}"));
                }
                let fu_header = payload[2];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let orig_type = fu_header & 0b0011_1111;
                if start {
                    self.fu_drop_mode = false;
                    self.fu_in_progress = true;
                    self.fu_start_offset = self.frame.len();
                    self.frame.extend_from_slice(&START_CODE);
                    self.frame
                        .push((payload[0] & 0b1000_0001) | (orig_type << 1));
                    self.frame.push(payload[1]);
                    if is_irap(orig_type) {
                        self.is_idr = true;
                    }
                } else if self.fu_drop_mode || !self.fu_in_progress {
                    // Continuation of a dropped (or never-started)
                    // fragmentation unit. If the frame ends on this packet,
                    // discard it here rather than leaving the cleanup to the
                    // next frame's timestamp change.
                    if mark && self.fu_drop_mode {
                        self.discard_frame();
                    }
                    return Ok(());
                }
                if payload.len() > 3 && !self.fu_drop_mode {
                    self.frame.extend_from_slice(&payload[3..]);
                }
                if end && self.fu_in_progress {
                    self.fu_in_progress = false;
                }
            }
            NAL_TYPE_PACI => {}
            t => {
                self.append_nalu(payload);
                if is_irap(t) {
                    self.is_idr = true;
                }
            }
        }

        if mark {
            if self.fu_drop_mode {
                self.discard_frame();
            } else {
                self.emit();
            }
        }
        Ok(())
    }

    pub(crate) fn pull(&mut self) -> Option<VideoFrame> {
        self.pending.pop_front()
    }

    fn append_nalu(&mut self, nalu: &[u8]) {
        self.frame.extend_from_slice(&START_CODE);
        self.frame.extend_from_slice(nalu);
    }

    fn discard_frame(&mut self) {
        self.frame.clear();
        self.is_idr = false;
        self.in_progress = false;
        self.fu_drop_mode = false;
        self.fu_in_progress = false;
    }

    fn emit(&mut self) {
        if !self.frame.is_empty() {
            let frame = VideoFrame::new(
                VideoCodec::H265,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(seq: u16, ts: u32, mark: bool, payload: &[u8]) -> ReceivedPacket {
        crate::rtp::test_packet(97, seq, ts, mark, payload)
    }

    #[test]
    fn fu_loss_then_recovery() {
        let mut d = Depacketizer::new(VideoParams::default());
        // Frame A: FU start at seq 1; the middle (seq 2) is lost; FU end at
        // seq 3 must be ignored and the frame discarded.
        d.push(pkt(1, 9000, false, &[0x62, 0x01, 0x93, 0xAA, 0xBB]))
            .unwrap();
        d.push(pkt(3, 9000, true, &[0x62, 0x01, 0x53, 0xCC, 0xDD]))
            .unwrap();
        assert!(d.pull().is_none());
        assert_eq!(d.loss_events(), 1);

        // Frame B arrives intact and is emitted with a reconstructed
        // IDR_W_RADL header.
        d.push(pkt(4, 12000, false, &[0x62, 0x01, 0x93, 0x11, 0x22]))
            .unwrap();
        d.push(pkt(5, 12000, true, &[0x62, 0x01, 0x53, 0x33, 0x44]))
            .unwrap();
        let f = d.pull().expect("frame B");
        assert!(d.pull().is_none());
        assert!(f.is_idr());
        assert_eq!(
            f.data(),
            &[0x00, 0x00, 0x00, 0x01, 0x26, 0x01, 0x11, 0x22, 0x33, 0x44]
        );
        assert_eq!(d.frames_output(), 1);
    }

    #[test]
    fn aggregation_packet() {
        // AP wrapping an SPS (type 33) and a PPS (type 34).
        let mut d = Depacketizer::new(VideoParams::default());
        d.push(pkt(
            1,
            90,
            true,
            &[
                0x60, 0x01, // payload header, type 48
                0x00, 0x03, 0x42, 0x01, 0x99, // SPS
                0x00, 0x03, 0x44, 0x01, 0x88, // PPS
            ],
        ))
        .unwrap();
        let f = d.pull().expect("one frame");
        assert_eq!(
            f.data(),
            &[
                0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0x99, //
                0x00, 0x00, 0x00, 0x01, 0x44, 0x01, 0x88,
            ]
        );
        assert!(!f.is_idr());
        assert_eq!(f.pts_ms(), 1);
    }

    #[test]
    fn single_nalu_idr() {
        let mut d = Depacketizer::new(VideoParams::default());
        // Type 19 (IDR_W_RADL).
        d.push(pkt(1, 0, true, &[0x26, 0x01, 0xAB])).unwrap();
        let f = d.pull().expect("one frame");
        assert!(f.is_idr());
        assert_eq!(f.data(), &[0, 0, 0, 1, 0x26, 0x01, 0xAB]);
    }

    #[test]
    fn fu_header_carries_layer_and_tid() {
        // A NALU with a non-zero layer id must round-trip through FU
        // fragmentation unchanged.
        let mut nalu = vec![0x27, 0x0A]; // type 19, layer 1, TID 2
        nalu.extend((0..3000u32).map(|i| (i % 200) as u8));
        let mut data = START_CODE.to_vec();
        data.extend_from_slice(&nalu);
        let frame = VideoFrame::new(VideoCodec::H265, FrameType::Idr, 0, Bytes::from(data.clone()));

        let mut p = Packetizer::new(97, 0x7, 1400, 10);
        let pkts = p.packetize(&frame);
        assert!(pkts.len() >= 2);
        // Payload header type must be 49 with the layer/TID bits preserved.
        assert_eq!(hdr_unit_type(pkts[0][12]), NAL_TYPE_FU);
        assert_eq!(pkts[0][12] & 0x01, 0x27 & 0x01);
        assert_eq!(pkts[0][13], 0x0A);

        let mut d = Depacketizer::new(VideoParams::default());
        for raw in pkts {
            d.push(crate::rtp::ReceivedPacket::new(raw, 0).unwrap())
                .unwrap();
        }
        let f = d.pull().expect("one frame");
        assert_eq!(f.data(), &data[..]);
    }

    #[test]
    fn paci_is_ignored() {
        let mut d = Depacketizer::new(VideoParams::default());
        d.push(pkt(1, 0, false, &[0x64, 0x01, 0x00, 0x00])).unwrap();
        d.push(pkt(2, 0, true, &[0x02, 0x01, 0xEE])).unwrap();
        let f = d.pull().expect("one frame");
        assert_eq!(f.data(), &[0, 0, 0, 1, 0x02, 0x01, 0xEE]);
    }
}
