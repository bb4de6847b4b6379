// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The narrow slice of SDP this crate emits and understands: one video media
//! section with the attributes needed to negotiate an H.264/H.265 RTP stream.
//!
//! Parsing is delegated to `sdp-types`; building is a handful of formatted
//! lines.

use std::fmt::Write as _;

use base64::Engine as _;

use crate::codec::VideoCodec;

/// Description of a single video stream, as carried in a `DESCRIBE` response
/// or an `ANNOUNCE` request body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaDescription {
    pub codec: VideoCodec,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,

    /// H.265 video parameter set, without start code. Empty if unknown.
    pub vps: Vec<u8>,
    /// Sequence parameter set, without start code. Empty if unknown.
    pub sps: Vec<u8>,
    /// Picture parameter set, without start code. Empty if unknown.
    pub pps: Vec<u8>,

    /// The `a=control` value, if present: absolute URL or relative track name.
    pub control: Option<String>,
}

impl MediaDescription {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            payload_type: codec.default_payload_type(),
            clock_rate: codec.clock_rate(),
            width: 1920,
            height: 1080,
            fps: 30,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
            control: None,
        }
    }

    /// Serializes the session description.
    ///
    /// `origin_addr` goes into the `o=` line; the connection line advertises
    /// `0.0.0.0` so the stream destination comes from `SETUP`, not the SDP.
    pub fn build(&self, origin_addr: &str, session_name: &str) -> String {
        let b64 = base64::engine::general_purpose::STANDARD;
        let sess_id = chrono::Utc::now().timestamp();
        let control = self.control.as_deref().unwrap_or("stream");
        let pt = self.payload_type;

        let mut sdp = String::with_capacity(256);
        sdp.push_str("v=0\r\n");
        let _ = write!(sdp, "o=- {sess_id} {sess_id} IN IP4 {origin_addr}\r\n");
        let _ = write!(sdp, "s={session_name}\r\n");
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str("t=0 0\r\n");
        let _ = write!(sdp, "m=video 0 RTP/AVP {pt}\r\n");
        let _ = write!(sdp, "a=rtpmap:{pt} {}/{}\r\n", self.codec.name(), self.clock_rate);
        match self.codec {
            VideoCodec::H264 => {
                let _ = write!(sdp, "a=fmtp:{pt} packetization-mode=1");
                if !self.sps.is_empty() && !self.pps.is_empty() {
                    let _ = write!(
                        sdp,
                        ";sprop-parameter-sets={},{}",
                        b64.encode(&self.sps),
                        b64.encode(&self.pps)
                    );
                }
                sdp.push_str("\r\n");
                let _ = write!(sdp, "a=cliprect:0,0,{},{}\r\n", self.height, self.width);
            }
            VideoCodec::H265 => {
                let mut params = Vec::new();
                if !self.vps.is_empty() {
                    params.push(format!("sprop-vps={}", b64.encode(&self.vps)));
                }
                if !self.sps.is_empty() {
                    params.push(format!("sprop-sps={}", b64.encode(&self.sps)));
                }
                if !self.pps.is_empty() {
                    params.push(format!("sprop-pps={}", b64.encode(&self.pps)));
                }
                if !params.is_empty() {
                    let _ = write!(sdp, "a=fmtp:{pt} {}\r\n", params.join(";"));
                }
            }
        }
        let _ = write!(sdp, "a=framerate:{}\r\n", self.fps);
        let _ = write!(sdp, "a=framesize:{pt} {}-{}\r\n", self.width, self.height);
        let _ = write!(sdp, "a=control:{control}\r\n");
        sdp
    }

    /// Parses the first video media section of `body`.
    ///
    /// Missing fields are defaulted: 1920x1080, 30 fps, 90 kHz clock, payload
    /// type 96 (H.264) or 97 (H.265).
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let session = sdp_types::Session::parse(body).map_err(|e| format!("bad SDP: {e}"))?;
        let media = session
            .medias
            .iter()
            .find(|m| m.media.eq_ignore_ascii_case("video"))
            .ok_or_else(|| "SDP has no video media section".to_string())?;

        let mut desc = MediaDescription {
            codec: VideoCodec::H264,
            payload_type: 0,
            clock_rate: 0,
            width: 0,
            height: 0,
            fps: 0,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
            control: None,
        };

        if let Some(fmt) = media.fmt.split_ascii_whitespace().next() {
            desc.payload_type = fmt.parse().unwrap_or(0);
        }

        for a in &media.attributes {
            let value = a.value.as_deref().unwrap_or("");
            match a.attribute.as_str() {
                "rtpmap" => {
                    // rtpmap-value = payload-type SP encoding-name "/" clock-rate
                    let Some((_, rest)) = value.split_once(' ') else {
                        continue;
                    };
                    let (name, clock) = rest.split_once('/').unwrap_or((rest, ""));
                    if name.contains("264") {
                        desc.codec = VideoCodec::H264;
                    } else if name.contains("265") || name.to_ascii_uppercase().contains("HEVC") {
                        desc.codec = VideoCodec::H265;
                    }
                    if let Ok(c) = clock.split('/').next().unwrap_or("").parse() {
                        desc.clock_rate = c;
                    }
                }
                "fmtp" => {
                    let params = value.split_once(' ').map(|(_, p)| p).unwrap_or(value);
                    for param in params.split(';') {
                        let Some((key, v)) = param.trim().split_once('=') else {
                            continue;
                        };
                        match key {
                            "sprop-parameter-sets" => {
                                let mut sets = v.splitn(2, ',');
                                desc.sps = decode_sprop(sets.next().unwrap_or(""));
                                desc.pps = decode_sprop(sets.next().unwrap_or(""));
                            }
                            "sprop-vps" => desc.vps = decode_sprop(v),
                            "sprop-sps" => desc.sps = decode_sprop(v),
                            "sprop-pps" => desc.pps = decode_sprop(v),
                            _ => {}
                        }
                    }
                }
                "framerate" => {
                    if let Ok(f) = value.split('.').next().unwrap_or("").parse() {
                        desc.fps = f;
                    }
                }
                "framesize" => {
                    // framesize:<pt> <width>-<height>
                    if let Some((_, dims)) = value.split_once(' ') {
                        if let Some((w, h)) = dims.split_once('-') {
                            desc.width = w.trim().parse().unwrap_or(0);
                            desc.height = h.trim().parse().unwrap_or(0);
                        }
                    }
                }
                "cliprect" => {
                    // cliprect:0,0,<height>,<width>
                    let mut parts = value.split(',').skip(2);
                    let h = parts.next().and_then(|v| v.trim().parse().ok());
                    let w = parts.next().and_then(|v| v.trim().parse().ok());
                    if let (Some(h), Some(w)) = (h, w) {
                        if desc.width == 0 && desc.height == 0 && w > 0 && h > 0 {
                            desc.height = h;
                            desc.width = w;
                        }
                    }
                }
                "control" => {
                    desc.control = Some(value.to_owned());
                }
                _ => {}
            }
        }

        if desc.control.is_none() {
            for a in &session.attributes {
                if a.attribute == "control" {
                    desc.control = a.value.clone();
                }
            }
        }

        if desc.width == 0 {
            desc.width = 1920;
        }
        if desc.height == 0 {
            desc.height = 1080;
        }
        if desc.fps == 0 {
            desc.fps = 30;
        }
        if desc.clock_rate == 0 {
            desc.clock_rate = desc.codec.clock_rate();
        }
        if desc.payload_type == 0 {
            desc.payload_type = desc.codec.default_payload_type();
        }
        Ok(desc)
    }
}

fn decode_sprop(v: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(v.trim())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_roundtrip() {
        let mut desc = MediaDescription::new(VideoCodec::H264);
        desc.width = 1280;
        desc.height = 720;
        desc.fps = 25;
        desc.sps = vec![0x67, 0x42, 0x00, 0x1F];
        desc.pps = vec![0x68, 0xCE, 0x38, 0x80];
        let body = desc.build("192.168.1.10", "Test Stream");
        assert!(body.starts_with("v=0\r\n"));
        assert!(body.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(body.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(body.contains("packetization-mode=1;sprop-parameter-sets="));

        let parsed = MediaDescription::parse(body.as_bytes()).unwrap();
        assert_eq!(parsed.codec, VideoCodec::H264);
        assert_eq!(parsed.payload_type, 96);
        assert_eq!(parsed.clock_rate, 90_000);
        assert_eq!(parsed.width, 1280);
        assert_eq!(parsed.height, 720);
        assert_eq!(parsed.fps, 25);
        assert_eq!(parsed.sps, desc.sps);
        assert_eq!(parsed.pps, desc.pps);
        assert_eq!(parsed.control.as_deref(), Some("stream"));
    }

    #[test]
    fn h265_roundtrip() {
        let mut desc = MediaDescription::new(VideoCodec::H265);
        desc.vps = vec![0x40, 0x01, 0x0C];
        desc.sps = vec![0x42, 0x01, 0x01];
        desc.pps = vec![0x44, 0x01, 0xC1];
        let body = desc.build("10.0.0.1", "cam");
        assert!(body.contains("a=rtpmap:97 H265/90000\r\n"));
        assert!(body.contains("sprop-vps="));

        let parsed = MediaDescription::parse(body.as_bytes()).unwrap();
        assert_eq!(parsed.codec, VideoCodec::H265);
        assert_eq!(parsed.payload_type, 97);
        assert_eq!(parsed.vps, desc.vps);
        assert_eq!(parsed.sps, desc.sps);
        assert_eq!(parsed.pps, desc.pps);
        assert_eq!(parsed.width, 1920);
    }

    #[test]
    fn defaults_applied_when_missing() {
        let body = b"v=0\r\n\
            o=- 1 1 IN IP4 127.0.0.1\r\n\
            s=x\r\n\
            c=IN IP4 0.0.0.0\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 96\r\n\
            a=rtpmap:96 H264/90000\r\n";
        let parsed = MediaDescription::parse(body).unwrap();
        assert_eq!(parsed.width, 1920);
        assert_eq!(parsed.height, 1080);
        assert_eq!(parsed.fps, 30);
        assert_eq!(parsed.payload_type, 96);
    }

    #[test]
    fn cliprect_sets_dimensions() {
        let body = b"v=0\r\n\
            o=- 1 1 IN IP4 127.0.0.1\r\n\
            s=x\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 97\r\n\
            a=rtpmap:97 H265/90000\r\n\
            a=cliprect:0,0,480,704\r\n\
            a=control:rtsp://example.com/cam/stream\r\n";
        let parsed = MediaDescription::parse(body).unwrap();
        assert_eq!(parsed.codec, VideoCodec::H265);
        assert_eq!(parsed.width, 704);
        assert_eq!(parsed.height, 480);
        assert_eq!(
            parsed.control.as_deref(),
            Some("rtsp://example.com/cam/stream")
        );
    }

    #[test]
    fn no_video_section_is_an_error() {
        let body = b"v=0\r\n\
            o=- 1 1 IN IP4 127.0.0.1\r\n\
            s=x\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 0\r\n";
        MediaDescription::parse(body).unwrap_err();
    }
}
