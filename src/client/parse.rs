// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of the response headers the client negotiates on: `CSeq`,
//! `Session`, `Transport`, and `WWW-Authenticate`.

use bytes::Bytes;
use rtsp_types::headers;

/// Returns the `CSeq` from an RTSP response, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&headers::CSEQ)
        .and_then(|cseq| cseq.as_str().trim().parse().ok())
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SetupResponse {
    pub(crate) session_id: String,

    /// Assigned interleaved RTP channel (the RTCP channel is one higher).
    pub(crate) channel_rtp: Option<u8>,

    /// `server_port=rtp-rtcp` from the Transport header.
    pub(crate) server_rtp_port: Option<(u16, u16)>,
}

/// Parses a successful `SETUP` response.
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, String> {
    let session = response
        .header(&headers::SESSION)
        .ok_or_else(|| "SETUP response is missing a Session header".to_string())?;
    // `Session: id[;timeout=secs]`.
    let session_id = session
        .as_str()
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_owned();
    if session_id.is_empty() {
        return Err("SETUP response has an empty session id".to_string());
    }

    let mut channel_rtp = None;
    let mut server_rtp_port = None;
    if let Some(transport) = response.header(&headers::TRANSPORT) {
        for part in transport.as_str().split(';') {
            let part = part.trim();
            if let Some(v) = part.strip_prefix("interleaved=") {
                channel_rtp = v.split('-').next().and_then(|c| c.parse().ok());
            } else if let Some(v) = part.strip_prefix("server_port=") {
                let mut ports = v.splitn(2, '-');
                let rtp: Option<u16> = ports.next().and_then(|p| p.parse().ok());
                let rtcp: Option<u16> = ports.next().and_then(|p| p.parse().ok());
                if let Some(rtp) = rtp {
                    server_rtp_port = Some((rtp, rtcp.unwrap_or(rtp + 1)));
                }
            }
        }
    }

    Ok(SetupResponse {
        session_id,
        channel_rtp,
        server_rtp_port,
    })
}

/// The authentication scheme offered by a 401 response.
pub(crate) enum AuthScheme {
    Digest(Box<digest_auth::WwwAuthenticateHeader>),
    Basic,
}

pub(crate) fn parse_www_authenticate(
    response: &rtsp_types::Response<Bytes>,
) -> Result<AuthScheme, String> {
    let www_authenticate = response
        .header(&headers::WWW_AUTHENTICATE)
        .ok_or_else(|| "401 without WWW-Authenticate header".to_string())?;
    let value = www_authenticate.as_str();
    if value.starts_with("Digest ") {
        let parsed = digest_auth::WwwAuthenticateHeader::parse(value)
            .map_err(|e| format!("bad Digest challenge: {e}"))?;
        return Ok(AuthScheme::Digest(Box::new(parsed)));
    }
    if value.starts_with("Basic ") || value.starts_with("Basic") {
        return Ok(AuthScheme::Basic);
    }
    Err(format!("unsupported authentication scheme: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
        let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
        assert_eq!(len, raw.len());
        match msg {
            rtsp_types::Message::Response(r) => r.map_body(Bytes::from_static),
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn setup_udp() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 2\r\n\
              Session: 4f3a9c1e;timeout=60\r\n\
              Transport: RTP/AVP;unicast;client_port=20000-20001;server_port=10004-10005\r\n\
              \r\n",
        );
        assert_eq!(get_cseq(&r), Some(2));
        let s = parse_setup(&r).unwrap();
        assert_eq!(s.session_id, "4f3a9c1e");
        assert_eq!(s.channel_rtp, None);
        assert_eq!(s.server_rtp_port, Some((10004, 10005)));
    }

    #[test]
    fn setup_interleaved() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 3\r\n\
              Session: abc\r\n\
              Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\
              \r\n",
        );
        let s = parse_setup(&r).unwrap();
        assert_eq!(s.session_id, "abc");
        assert_eq!(s.channel_rtp, Some(0));
        assert_eq!(s.server_rtp_port, None);
    }

    #[test]
    fn setup_without_session_fails() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 3\r\n\
              Transport: RTP/AVP;unicast;client_port=9000-9001\r\n\
              \r\n",
        );
        parse_setup(&r).unwrap_err();
    }

    #[test]
    fn www_authenticate_digest() {
        let r = response(
            b"RTSP/1.0 401 Unauthorized\r\n\
              CSeq: 1\r\n\
              WWW-Authenticate: Digest realm=\"RTSP Server\", nonce=\"abc123\", \
              algorithm=MD5, qop=\"auth\"\r\n\
              \r\n",
        );
        match parse_www_authenticate(&r).unwrap() {
            AuthScheme::Digest(h) => {
                assert_eq!(h.realm, "RTSP Server");
                assert_eq!(h.nonce, "abc123");
            }
            AuthScheme::Basic => panic!("expected digest"),
        }
    }

    #[test]
    fn www_authenticate_basic() {
        let r = response(
            b"RTSP/1.0 401 Unauthorized\r\n\
              CSeq: 1\r\n\
              WWW-Authenticate: Basic realm=\"RTSP Server\"\r\n\
              \r\n",
        );
        assert!(matches!(
            parse_www_authenticate(&r).unwrap(),
            AuthScheme::Basic
        ));
    }
}
