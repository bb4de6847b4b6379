// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: RTP packetization and depacketization for H.264 and
//! H.265 video.
//!
//! The two codecs are tagged variants of the same packetizer/depacketizer
//! contract; the branch is static per session.

use bytes::Bytes;

use crate::rtp::ReceivedPacket;

pub mod h264;
pub mod h265;

/// The 4-byte Annex-B start code prepended to every NALU in emitted frames.
pub(crate) const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Default MTU for packetization: conservative for Ethernet after IP/UDP
/// headers.
pub const DEFAULT_MTU: usize = 1400;

/// A video codec supported by this crate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// The encoding name as it appears in `a=rtpmap`.
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
        }
    }

    /// The RTP clock rate; 90 kHz for both codecs.
    #[inline]
    pub fn clock_rate(self) -> u32 {
        90_000
    }

    /// The dynamic payload type used when the SDP doesn't specify one.
    #[inline]
    pub fn default_payload_type(self) -> u8 {
        match self {
            VideoCodec::H264 => 96,
            VideoCodec::H265 => 97,
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// A key frame which can be decoded without reference to any other.
    Idr,
    P,
    B,
}

/// A single video frame (access unit) in Annex-B form.
///
/// The payload is a refcounted immutable byte sequence: broadcast fan-out and
/// queue hand-off clone the handle, not the bytes, and the buffer lives as
/// long as its longest reader.
#[derive(Clone)]
pub struct VideoFrame {
    codec: VideoCodec,
    frame_type: FrameType,
    pts_ms: u64,
    dts_ms: u64,
    width: u32,
    height: u32,
    fps: u32,
    data: Bytes,
}

impl VideoFrame {
    pub fn new(codec: VideoCodec, frame_type: FrameType, pts_ms: u64, data: Bytes) -> Self {
        Self {
            codec,
            frame_type,
            pts_ms,
            dts_ms: pts_ms,
            width: 0,
            height: 0,
            fps: 0,
            data,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32, fps: u32) -> Self {
        self.width = width;
        self.height = height;
        self.fps = fps;
        self
    }

    pub fn with_dts(mut self, dts_ms: u64) -> Self {
        self.dts_ms = dts_ms;
        self
    }

    #[inline]
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    #[inline]
    pub fn is_idr(&self) -> bool {
        self.frame_type == FrameType::Idr
    }

    /// Presentation timestamp in milliseconds.
    #[inline]
    pub fn pts_ms(&self) -> u64 {
        self.pts_ms
    }

    /// Decode timestamp in milliseconds.
    #[inline]
    pub fn dts_ms(&self) -> u64 {
        self.dts_ms
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// The frame in Annex-B form (each NALU preceded by `00 00 00 01` when
    /// produced by a depacketizer).
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("codec", &self.codec)
            .field("frame_type", &self.frame_type)
            .field("pts_ms", &self.pts_ms)
            .field("dts_ms", &self.dts_ms)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fps", &self.fps)
            .field("data", &crate::dump::BytePreview(&self.data))
            .finish()
    }
}

/// Stream parameters a depacketizer stamps onto emitted frames.
#[derive(Copy, Clone, Debug)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

/// Splits an Annex-B buffer into NALUs, handling both `00 00 01` and
/// `00 00 00 01` start codes. A buffer with no start code at all is treated
/// as one bare NALU.
pub(crate) fn annexb_nalus(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::with_capacity(8);
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push(i + 3);
                i += 3;
                continue;
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push(i + 4);
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    if starts.is_empty() {
        if data.is_empty() {
            return Vec::new();
        }
        return vec![data];
    }
    let mut nalus = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = if idx + 1 < starts.len() {
            // Back up over the next NALU's start code.
            let next = starts[idx + 1];
            if next >= 4 && data[next - 4..next] == START_CODE {
                next - 4
            } else {
                next - 3
            }
        } else {
            data.len()
        };
        if end > start {
            nalus.push(&data[start..end]);
        }
    }
    nalus
}

/// Turns video frames into RTP packets.
///
/// Never aggregates: each NALU becomes either a single-NALU packet or a run
/// of fragmentation units. The marker bit is set on the last packet of each
/// frame; sequence numbers are a wrapping 16-bit counter per instance.
pub struct Packetizer(PacketizerInner);

enum PacketizerInner {
    H264(h264::Packetizer),
    H265(h265::Packetizer),
}

impl Packetizer {
    pub fn new(codec: VideoCodec, payload_type: u8, ssrc: u32, mtu: usize) -> Self {
        let initial_seq = rand::random::<u16>();
        Packetizer(match codec {
            VideoCodec::H264 => {
                PacketizerInner::H264(h264::Packetizer::new(payload_type, ssrc, mtu, initial_seq))
            }
            VideoCodec::H265 => {
                PacketizerInner::H265(h265::Packetizer::new(payload_type, ssrc, mtu, initial_seq))
            }
        })
    }

    /// Packetizes one frame into complete RTP packets (header included).
    pub fn packetize(&mut self, frame: &VideoFrame) -> Vec<Bytes> {
        match &mut self.0 {
            PacketizerInner::H264(p) => p.packetize(frame),
            PacketizerInner::H265(p) => p.packetize(frame),
        }
    }

    /// The sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        match &self.0 {
            PacketizerInner::H264(p) => p.next_sequence(),
            PacketizerInner::H265(p) => p.next_sequence(),
        }
    }
}

/// Turns in-order RTP packets into [`VideoFrame`]s.
///
/// Between any two calls to `push`, the caller must call `pull` until it
/// returns `None`.
pub struct Depacketizer(DepacketizerInner);

enum DepacketizerInner {
    H264(Box<h264::Depacketizer>),
    H265(Box<h265::Depacketizer>),
}

impl Depacketizer {
    pub fn new(codec: VideoCodec, params: VideoParams) -> Self {
        Depacketizer(match codec {
            VideoCodec::H264 => DepacketizerInner::H264(Box::new(h264::Depacketizer::new(params))),
            VideoCodec::H265 => DepacketizerInner::H265(Box::new(h265::Depacketizer::new(params))),
        })
    }

    /// Supplies a packet. Malformed payloads yield an error but leave the
    /// depacketizer in a recoverable state.
    pub fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.push(pkt),
            DepacketizerInner::H265(d) => d.push(pkt),
        }
    }

    /// Retrieves the next completed frame, if any.
    pub fn pull(&mut self) -> Option<VideoFrame> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.pull(),
            DepacketizerInner::H265(d) => d.pull(),
        }
    }

    /// Number of interior losses that caused a partial frame to be dropped.
    pub fn loss_events(&self) -> u64 {
        match &self.0 {
            DepacketizerInner::H264(d) => d.loss_events(),
            DepacketizerInner::H265(d) => d.loss_events(),
        }
    }

    /// Number of complete frames emitted.
    pub fn frames_output(&self) -> u64 {
        match &self.0 {
            DepacketizerInner::H264(d) => d.frames_output(),
            DepacketizerInner::H265(d) => d.frames_output(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);
        let nalus = annexb_nalus(&data);
        assert_eq!(nalus.len(), 3);
        assert_eq!(nalus[0], &[0x67, 0x42]);
        assert_eq!(nalus[1], &[0x68, 0xCE]);
        assert_eq!(nalus[2], &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn bare_nalu_without_start_code() {
        let nalus = annexb_nalus(&[0x41, 0x9a, 0x01]);
        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0], &[0x41, 0x9a, 0x01]);
    }

    #[test]
    fn empty_input() {
        assert!(annexb_nalus(&[]).is_empty());
    }

    #[test]
    fn skips_empty_nalu_between_start_codes() {
        let data = [0, 0, 0, 1, 0, 0, 0, 1, 0x41, 0x9a];
        let nalus = annexb_nalus(&data);
        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0], &[0x41, 0x9a]);
    }

    #[test]
    fn packetize_depacketize_roundtrip_h264() {
        let mut frame_data = Vec::new();
        frame_data.extend_from_slice(&START_CODE);
        frame_data.push(0x65);
        frame_data.extend((0..5000u32).map(|i| (i % 251) as u8));
        let frame = VideoFrame::new(
            VideoCodec::H264,
            FrameType::Idr,
            40,
            Bytes::from(frame_data.clone()),
        );

        let mut p = Packetizer::new(VideoCodec::H264, 96, 0x4242, DEFAULT_MTU);
        let pkts = p.packetize(&frame);
        assert!(pkts.len() >= 2);

        let mut d = Depacketizer::new(VideoCodec::H264, VideoParams::default());
        for pkt in pkts {
            d.push(ReceivedPacket::new(pkt, 0).unwrap()).unwrap();
        }
        let out = d.pull().expect("one frame");
        assert!(d.pull().is_none());
        assert_eq!(out.data(), &frame_data[..]);
        assert!(out.is_idr());
        assert_eq!(out.pts_ms(), 40);
    }

    #[test]
    fn packetize_depacketize_roundtrip_h265() {
        let mut frame_data = Vec::new();
        frame_data.extend_from_slice(&START_CODE);
        frame_data.extend_from_slice(&[0x26, 0x01]); // IDR_W_RADL
        frame_data.extend((0..4000u32).map(|i| (i % 249) as u8));
        let frame = VideoFrame::new(
            VideoCodec::H265,
            FrameType::Idr,
            100,
            Bytes::from(frame_data.clone()),
        );

        let mut p = Packetizer::new(VideoCodec::H265, 97, 0x1111, DEFAULT_MTU);
        let pkts = p.packetize(&frame);
        assert!(pkts.len() >= 2);

        let mut d = Depacketizer::new(VideoCodec::H265, VideoParams::default());
        for pkt in pkts {
            d.push(ReceivedPacket::new(pkt, 0).unwrap()).unwrap();
        }
        let out = d.pull().expect("one frame");
        assert_eq!(out.data(), &frame_data[..]);
        assert!(out.is_idr());
    }
}
