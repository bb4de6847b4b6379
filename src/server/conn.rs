// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-connection RTSP request handling: the control state machine, request
//! authentication, transport negotiation, and publisher (`ANNOUNCE`/`RECORD`)
//! ingest.
//!
//! Requests on one connection are processed serially in receive order. At
//! most one session exists per connection; a second `SETUP` is answered with
//! 459 (Aggregate Operation Not Allowed).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use rtsp_types::{headers, Method, StatusCode, Version};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::codec::{Depacketizer, VideoCodec, VideoParams};
use crate::conn::Connection;
use crate::reorder::ReorderBuffer;
use crate::rtp::ReceivedPacket;
use crate::server::session::{ClientSession, SessionTransport, SharedSink};
use crate::server::{maybe_extract_parameter_sets, new_session_id, MediaPath, ServerInner};
use crate::sdp::MediaDescription;
use crate::{Error, UdpPair};

/// Jitter-buffer depth for publisher ingest.
const RECORD_REORDER_PACKETS: usize = 32;

pub(crate) async fn serve(inner: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) {
    let conn = match Connection::from_stream(stream) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to set up connection from {peer}: {e}");
            return;
        }
    };
    debug!("connection from {peer}");
    let (sink, mut messages) = conn.split();
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));

    let cfg = &inner.config;
    let auth = cfg.auth_enabled.then(|| {
        Authenticator::new(
            &cfg.auth_username,
            &cfg.auth_password,
            &cfg.auth_realm,
            cfg.auth_use_digest,
            cfg.auth_nonce.as_deref(),
            Duration::from_millis(cfg.auth_nonce_ttl_ms),
        )
    });

    let mut handler = ConnHandler {
        inner: inner.clone(),
        sink,
        peer,
        auth,
        session: None,
        record: None,
        announced: None,
    };

    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            msg = messages.next() => match msg {
                None => break,
                Some(Err(e)) => {
                    debug!("{peer}: dropping connection: {e}");
                    // Best effort; the peer may already be gone and a framing
                    // error leaves no usable CSeq.
                    let _ = handler.respond(0, StatusCode::BadRequest, Vec::new(), None).await;
                    break;
                }
                Some(Ok(m)) => match m.msg {
                    rtsp_types::Message::Request(req) => {
                        if let Err(e) = handler.handle_request(&req).await {
                            debug!("{peer}: closing after write error: {e}");
                            break;
                        }
                    }
                    // Interleaved data from clients (e.g. RTCP RRs) is not
                    // interpreted; publisher ingest runs over UDP.
                    rtsp_types::Message::Data(_) => {}
                    rtsp_types::Message::Response(_) => {}
                },
            },
        }
    }
    handler.shutdown().await;
    debug!("connection from {peer} closed");
}

struct ConnHandler {
    inner: Arc<ServerInner>,
    sink: SharedSink,
    peer: SocketAddr,
    auth: Option<Authenticator>,
    session: Option<Arc<ClientSession>>,
    record: Option<RecordSession>,
    /// Path registered via ANNOUNCE on this connection, switching a
    /// subsequent SETUP into record (publisher-ingress) mode.
    announced: Option<String>,
}

impl ConnHandler {
    async fn handle_request(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<(), Error> {
        self.inner
            .stats
            .requests_total
            .fetch_add(1, Ordering::Relaxed);
        let cseq = request_cseq(req).unwrap_or(0);
        let method = req.method().clone();

        // OPTIONS is exempt from authentication; everything else must pass.
        if !matches!(method, Method::Options) {
            if let Some(auth) = self.auth.as_mut() {
                let authorization = req
                    .header(&headers::AUTHORIZATION)
                    .map(|v| v.as_str().to_owned());
                if let Err(challenge) = auth.check(method_token(&method), authorization.as_deref())
                {
                    self.inner
                        .stats
                        .auth_challenges
                        .fetch_add(1, Ordering::Relaxed);
                    self.inner
                        .stats
                        .auth_failures
                        .fetch_add(1, Ordering::Relaxed);
                    return self
                        .respond(
                            cseq,
                            StatusCode::Unauthorized,
                            vec![(headers::WWW_AUTHENTICATE, challenge.www_authenticate)],
                            None,
                        )
                        .await;
                }
            }
        }

        if let Some(session) = self.session.as_ref() {
            session.touch();
        }
        trace!("{}: {} {}", self.peer, method_token(&method), request_path(req));

        match method {
            Method::Options => self.handle_options(cseq).await,
            Method::Describe => self.handle_describe(req, cseq).await,
            Method::Announce => self.handle_announce(req, cseq).await,
            Method::Setup => self.handle_setup(req, cseq).await,
            Method::Play => self.handle_play(req, cseq).await,
            Method::Pause => self.handle_pause(req, cseq).await,
            Method::Record => self.handle_record(req, cseq).await,
            Method::GetParameter | Method::SetParameter => {
                self.handle_parameter(req, cseq).await
            }
            Method::Teardown => self.handle_teardown(cseq).await,
            _ => {
                self.respond(cseq, StatusCode::NotImplemented, Vec::new(), None)
                    .await
            }
        }
    }

    async fn handle_options(&mut self, cseq: u32) -> Result<(), Error> {
        self.respond(
            cseq,
            StatusCode::Ok,
            vec![(
                headers::PUBLIC,
                "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, \
                 GET_PARAMETER, SET_PARAMETER, TEARDOWN"
                    .to_owned(),
            )],
            None,
        )
        .await
    }

    async fn handle_describe(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: u32,
    ) -> Result<(), Error> {
        let path = request_path(req);
        let media_path = match self.inner.lookup_path(&path) {
            Some(p) => p,
            None => {
                return self
                    .respond(cseq, StatusCode::NotFound, Vec::new(), None)
                    .await
            }
        };
        let desc = {
            let config = media_path.config.lock().expect("config poisoned");
            MediaDescription {
                codec: config.codec,
                payload_type: config.codec.default_payload_type(),
                clock_rate: config.codec.clock_rate(),
                width: config.width,
                height: config.height,
                fps: config.fps,
                vps: config.vps.clone(),
                sps: config.sps.clone(),
                pps: config.pps.clone(),
                control: Some("stream".to_owned()),
            }
        };
        let body = desc.build(&local_host_for_sdp(self.peer), "fovea stream");
        self.respond(
            cseq,
            StatusCode::Ok,
            vec![(headers::CONTENT_TYPE, "application/sdp".to_owned())],
            Some(Bytes::from(body)),
        )
        .await
    }

    async fn handle_announce(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: u32,
    ) -> Result<(), Error> {
        let path = request_path(req);
        let desc = match MediaDescription::parse(req.body()) {
            Ok(d) => d,
            Err(e) => {
                debug!("{}: bad ANNOUNCE body: {e}", self.peer);
                return self
                    .respond(cseq, StatusCode::BadRequest, Vec::new(), None)
                    .await;
            }
        };
        {
            let mut paths = self.inner.paths.lock().expect("paths poisoned");
            let media_path = paths.entry(path.clone()).or_insert_with(|| {
                info!("registered path {path} via ANNOUNCE");
                Arc::new(MediaPath::new_for_announce(&path, desc.codec))
            });
            let mut config = media_path.config.lock().expect("config poisoned");
            config.codec = desc.codec;
            config.width = desc.width;
            config.height = desc.height;
            config.fps = desc.fps;
            if !desc.vps.is_empty() {
                config.vps = desc.vps;
            }
            if !desc.sps.is_empty() {
                config.sps = desc.sps;
            }
            if !desc.pps.is_empty() {
                config.pps = desc.pps;
            }
        }
        self.announced = Some(path);
        self.respond(cseq, StatusCode::Ok, Vec::new(), None).await
    }

    async fn handle_setup(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: u32,
    ) -> Result<(), Error> {
        if self.session.is_some() || self.record.is_some() {
            return self
                .respond(
                    cseq,
                    StatusCode::AggregateOperationNotAllowed,
                    Vec::new(),
                    None,
                )
                .await;
        }

        // SETUP is issued against the track control URL; strip the trailing
        // segment to find the path, falling back to the full path for clients
        // that omit the track.
        let full_path = request_path(req);
        let base_path = match full_path.rfind('/') {
            Some(0) | None => full_path.clone(),
            Some(i) => full_path[..i].to_owned(),
        };
        let (path, media_path) = match self
            .inner
            .lookup_path(&base_path)
            .map(|p| (base_path.clone(), p))
            .or_else(|| self.inner.lookup_path(&full_path).map(|p| (full_path.clone(), p)))
        {
            Some(found) => found,
            None => {
                return self
                    .respond(cseq, StatusCode::NotFound, Vec::new(), None)
                    .await
            }
        };

        let transport = match req.header(&headers::TRANSPORT) {
            Some(t) => parse_transport(t.as_str()),
            None => {
                return self
                    .respond(cseq, StatusCode::BadRequest, Vec::new(), None)
                    .await
            }
        };

        let record_mode =
            transport.record_mode || self.announced.as_deref() == Some(path.as_str());
        if record_mode {
            return self
                .setup_record(cseq, path, media_path, transport)
                .await;
        }

        let (codec, payload_type) = {
            let config = media_path.config.lock().expect("config poisoned");
            (config.codec, config.codec.default_payload_type())
        };

        let session_transport = if transport.tcp {
            SessionTransport::Interleaved {
                sink: self.sink.clone(),
                rtp_channel: transport.interleaved.0,
            }
        } else {
            let client_rtp = match transport.client_rtp {
                Some(p) => p,
                None => {
                    return self
                        .respond(cseq, StatusCode::BadRequest, Vec::new(), None)
                        .await
                }
            };
            let client_rtcp = transport.client_rtcp.unwrap_or(client_rtp + 1);
            let pair = match UdpPair::for_range(
                unspecified_ip(self.peer.ip()),
                self.inner.config.rtp_port_start,
                self.inner.config.rtp_port_end,
            ) {
                Ok(p) => p,
                Err(e) => {
                    warn!("{}: unable to bind sender UDP pair: {e}", self.peer);
                    return self
                        .respond(cseq, StatusCode::InternalServerError, Vec::new(), None)
                        .await;
                }
            };
            SessionTransport::Udp {
                local_rtp_port: pair.rtp_port,
                rtp_socket: Arc::new(pair.rtp_socket),
                rtcp_socket: Arc::new(pair.rtcp_socket),
                peer_rtp: SocketAddr::new(self.peer.ip(), client_rtp),
                peer_rtcp: SocketAddr::new(self.peer.ip(), client_rtcp),
            }
        };

        let transport_desc = session_transport.describe(
            transport.client_rtp.unwrap_or(0),
            transport
                .client_rtcp
                .or(transport.client_rtp.map(|p| p + 1))
                .unwrap_or(1),
        );
        let session = ClientSession::new(
            new_session_id(),
            path.clone(),
            self.peer.ip(),
            codec,
            payload_type,
            session_transport,
            self.inner.stats.clone(),
        );
        media_path.add_session(session.clone());
        self.inner
            .stats
            .sessions_created
            .fetch_add(1, Ordering::Relaxed);
        self.inner.fire_connect(&path, self.peer.ip());
        info!("{}: session {} on {}", self.peer, session.id, path);

        let session_id = session.id.clone();
        self.session = Some(session);
        self.respond(
            cseq,
            StatusCode::Ok,
            vec![
                (headers::SESSION, session_id),
                (headers::TRANSPORT, transport_desc),
            ],
            None,
        )
        .await
    }

    async fn setup_record(
        &mut self,
        cseq: u32,
        path: String,
        media_path: Arc<MediaPath>,
        transport: TransportRequest,
    ) -> Result<(), Error> {
        // Publisher ingest is UDP-only; an interleaved request gets 461 so
        // the peer can retry the other way.
        if transport.tcp {
            return self
                .respond(cseq, StatusCode::UnsupportedTransport, Vec::new(), None)
                .await;
        }
        let client_rtp = match transport.client_rtp {
            Some(p) => p,
            None => {
                return self
                    .respond(cseq, StatusCode::BadRequest, Vec::new(), None)
                    .await
            }
        };
        let pair = match UdpPair::for_range(
            unspecified_ip(self.peer.ip()),
            self.inner.config.rtp_port_start,
            self.inner.config.rtp_port_end,
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: unable to bind record UDP pair: {e}", self.peer);
                return self
                    .respond(cseq, StatusCode::InternalServerError, Vec::new(), None)
                    .await;
            }
        };
        let (codec, params) = {
            let config = media_path.config.lock().expect("config poisoned");
            (
                config.codec,
                VideoParams {
                    width: config.width,
                    height: config.height,
                    fps: config.fps,
                },
            )
        };
        let transport_desc = format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{};mode=record",
            client_rtp,
            transport.client_rtcp.unwrap_or(client_rtp + 1),
            pair.rtp_port,
            pair.rtp_port + 1
        );
        let record = RecordSession {
            id: new_session_id(),
            path: path.clone(),
            media_path,
            codec,
            params,
            udp: Some(pair),
            token: CancellationToken::new(),
            task: None,
        };
        self.inner
            .stats
            .sessions_created
            .fetch_add(1, Ordering::Relaxed);
        self.inner.fire_connect(&path, self.peer.ip());
        info!("{}: record session {} on {}", self.peer, record.id, path);

        let session_id = record.id.clone();
        self.record = Some(record);
        self.respond(
            cseq,
            StatusCode::Ok,
            vec![
                (headers::SESSION, session_id),
                (headers::TRANSPORT, transport_desc),
            ],
            None,
        )
        .await
    }

    async fn handle_play(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: u32,
    ) -> Result<(), Error> {
        let session = match self.session.as_ref() {
            Some(s) => s.clone(),
            None => {
                return self
                    .respond(cseq, StatusCode::MethodNotValidInThisState, Vec::new(), None)
                    .await
            }
        };
        if request_session_id(req).as_deref() != Some(session.id.as_str()) {
            return self
                .respond(cseq, StatusCode::SessionNotFound, Vec::new(), None)
                .await;
        }
        // Idempotent: a repeated PLAY returns 200 without a second sender.
        session.start_playing().await;
        self.respond(
            cseq,
            StatusCode::Ok,
            vec![(headers::SESSION, session.id.clone())],
            None,
        )
        .await
    }

    async fn handle_pause(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: u32,
    ) -> Result<(), Error> {
        let session = match self.session.as_ref() {
            Some(s) => s.clone(),
            None => {
                return self
                    .respond(cseq, StatusCode::MethodNotValidInThisState, Vec::new(), None)
                    .await
            }
        };
        if request_session_id(req).as_deref() != Some(session.id.as_str()) {
            return self
                .respond(cseq, StatusCode::SessionNotFound, Vec::new(), None)
                .await;
        }
        session.pause().await;
        self.respond(cseq, StatusCode::Ok, Vec::new(), None).await
    }

    async fn handle_record(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: u32,
    ) -> Result<(), Error> {
        let record_id = match self.record.as_ref() {
            Some(r) => r.id.clone(),
            None => {
                return self
                    .respond(cseq, StatusCode::MethodNotValidInThisState, Vec::new(), None)
                    .await
            }
        };
        if request_session_id(req).as_deref() != Some(record_id.as_str()) {
            return self
                .respond(cseq, StatusCode::SessionNotFound, Vec::new(), None)
                .await;
        }
        let inner = self.inner.clone();
        if let Some(record) = self.record.as_mut() {
            record.start(&inner);
        }
        self.respond(cseq, StatusCode::Ok, Vec::new(), None).await
    }

    async fn handle_parameter(
        &mut self,
        req: &rtsp_types::Request<Bytes>,
        cseq: u32,
    ) -> Result<(), Error> {
        // Keepalive: 200 with the body ignored, refreshing the idle timer.
        let sid = request_session_id(req);
        let known = match (&self.session, &self.record) {
            (Some(s), _) => sid.as_deref() == Some(s.id.as_str()),
            (None, Some(r)) => sid.as_deref() == Some(r.id.as_str()),
            (None, None) => false,
        };
        if !known {
            return self
                .respond(cseq, StatusCode::SessionNotFound, Vec::new(), None)
                .await;
        }
        self.respond(cseq, StatusCode::Ok, Vec::new(), None).await
    }

    async fn handle_teardown(&mut self, cseq: u32) -> Result<(), Error> {
        self.release_session().await;
        // TEARDOWN always succeeds, even with nothing to tear down.
        self.respond(cseq, StatusCode::Ok, Vec::new(), None).await
    }

    /// Stops and unregisters the play and/or record session.
    async fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Some(media_path) = self.inner.lookup_path(&session.path) {
                media_path.remove_session(&session.id);
            }
            session.stop().await;
            self.inner
                .stats
                .sessions_closed
                .fetch_add(1, Ordering::Relaxed);
            self.inner.fire_disconnect(&session.path, self.peer.ip());
        }
        if let Some(mut record) = self.record.take() {
            record.stop().await;
            self.inner
                .stats
                .sessions_closed
                .fetch_add(1, Ordering::Relaxed);
            self.inner.fire_disconnect(&record.path, self.peer.ip());
        }
    }

    /// Connection-drop cleanup; the session may already have been released by
    /// TEARDOWN or the idle sweep.
    async fn shutdown(&mut self) {
        // The idle sweep may have removed the session already; `remove_session`
        // returning `None` then skips the double count.
        if let Some(session) = self.session.take() {
            let registered = self
                .inner
                .lookup_path(&session.path)
                .and_then(|p| p.remove_session(&session.id));
            session.stop().await;
            if registered.is_some() {
                self.inner
                    .stats
                    .sessions_closed
                    .fetch_add(1, Ordering::Relaxed);
                self.inner.fire_disconnect(&session.path, self.peer.ip());
            }
        }
        if let Some(mut record) = self.record.take() {
            record.stop().await;
            self.inner
                .stats
                .sessions_closed
                .fetch_add(1, Ordering::Relaxed);
            self.inner.fire_disconnect(&record.path, self.peer.ip());
        }
    }

    async fn respond(
        &self,
        cseq: u32,
        status: StatusCode,
        extra_headers: Vec<(rtsp_types::HeaderName, String)>,
        body: Option<Bytes>,
    ) -> Result<(), Error> {
        let mut builder =
            rtsp_types::Response::builder(Version::V1_0, status).header(headers::CSEQ, cseq.to_string());
        for (name, value) in extra_headers {
            builder = builder.header(name, value);
        }
        let response = builder.build(body.unwrap_or_default());
        let mut sink = self.sink.lock().await;
        sink.send(rtsp_types::Message::Response(response)).await
    }
}

/// A publisher feeding one path over a server-bound UDP pair.
struct RecordSession {
    id: String,
    path: String,
    media_path: Arc<MediaPath>,
    codec: VideoCodec,
    params: VideoParams,
    udp: Option<UdpPair>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RecordSession {
    /// Starts the ingest task. Idempotent, like PLAY.
    fn start(&mut self, inner: &Arc<ServerInner>) {
        if self.task.is_some() {
            return;
        }
        let Some(udp) = self.udp.take() else {
            return;
        };
        self.task = Some(tokio::spawn(record_ingest(
            inner.clone(),
            self.media_path.clone(),
            self.codec,
            self.params,
            udp,
            self.token.clone(),
        )));
    }

    async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

/// Receives RTP from a publisher, reassembles frames, and broadcasts them to
/// the path's subscribers.
async fn record_ingest(
    inner: Arc<ServerInner>,
    media_path: Arc<MediaPath>,
    codec: VideoCodec,
    params: VideoParams,
    udp: UdpPair,
    token: CancellationToken,
) {
    let mut reorder = ReorderBuffer::new(RECORD_REORDER_PACKETS);
    let mut depacketizer = Depacketizer::new(codec, params);
    let mut buf = vec![0u8; 65536];
    let mut drained = Vec::new();
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            r = udp.rtp_socket.recv_from(&mut buf) => match r {
                Ok((n, _from)) => n,
                Err(e) => {
                    debug!("record ingest socket error: {e}");
                    break;
                }
            },
        };
        drained.clear();
        reorder.push(Bytes::copy_from_slice(&buf[..n]), &mut drained);
        for d in drained.drain(..) {
            let pkt = match ReceivedPacket::new(d.data, d.loss) {
                Ok(p) => p,
                Err(e) => {
                    trace!("record ingest: dropping packet: {e}");
                    continue;
                }
            };
            if let Err(e) = depacketizer.push(pkt) {
                debug!("record ingest: {e}");
                continue;
            }
            while let Some(frame) = depacketizer.pull() {
                maybe_extract_parameter_sets(&media_path, &frame);
                media_path.broadcast(&frame);
                inner.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct TransportRequest {
    tcp: bool,
    client_rtp: Option<u16>,
    client_rtcp: Option<u16>,
    interleaved: (u8, u8),
    record_mode: bool,
}

/// Parses the request's `Transport` header, e.g.
/// `RTP/AVP;unicast;client_port=20000-20001` or
/// `RTP/AVP/TCP;unicast;interleaved=0-1`.
fn parse_transport(value: &str) -> TransportRequest {
    let mut t = TransportRequest {
        tcp: false,
        client_rtp: None,
        client_rtcp: None,
        interleaved: (0, 1),
        record_mode: false,
    };
    for part in value.split(';') {
        let part = part.trim();
        if part.to_ascii_uppercase().contains("/TCP") {
            t.tcp = true;
        } else if let Some(v) = part.strip_prefix("client_port=") {
            let mut it = v.splitn(2, '-');
            t.client_rtp = it.next().and_then(|p| p.parse().ok());
            t.client_rtcp = it.next().and_then(|p| p.parse().ok());
        } else if let Some(v) = part.strip_prefix("interleaved=") {
            let mut it = v.splitn(2, '-');
            if let Some(a) = it.next().and_then(|p| p.parse().ok()) {
                let b = it.next().and_then(|p| p.parse().ok()).unwrap_or(a + 1);
                t.interleaved = (a, b);
            }
        } else if let Some(v) = part.strip_prefix("mode=") {
            if v.trim_matches('"').eq_ignore_ascii_case("record") {
                t.record_mode = true;
            }
        }
    }
    t
}

/// The routing path: the request URI with scheme/authority/query stripped.
fn request_path(req: &rtsp_types::Request<Bytes>) -> String {
    match req.request_uri() {
        Some(url) => {
            let p = url.path();
            if p.is_empty() {
                "/".to_owned()
            } else {
                p.to_owned()
            }
        }
        None => "/".to_owned(),
    }
}

fn request_cseq(req: &rtsp_types::Request<Bytes>) -> Option<u32> {
    req.header(&headers::CSEQ)
        .and_then(|v| v.as_str().trim().parse().ok())
}

/// The `Session` header value, with any `;timeout=` suffix stripped.
fn request_session_id(req: &rtsp_types::Request<Bytes>) -> Option<String> {
    req.header(&headers::SESSION)
        .map(|v| v.as_str().split(';').next().unwrap_or("").trim().to_owned())
}

fn method_token(m: &Method) -> &'static str {
    match m {
        Method::Announce => "ANNOUNCE",
        Method::Describe => "DESCRIBE",
        Method::GetParameter => "GET_PARAMETER",
        Method::Options => "OPTIONS",
        Method::Pause => "PAUSE",
        Method::Play => "PLAY",
        Method::Record => "RECORD",
        Method::Setup => "SETUP",
        Method::SetParameter => "SET_PARAMETER",
        Method::Teardown => "TEARDOWN",
        _ => "EXTENSION",
    }
}

/// The address advertised in the SDP origin line. The connection line uses
/// `0.0.0.0`, so this is informational only.
fn local_host_for_sdp(peer: SocketAddr) -> String {
    match peer.ip() {
        IpAddr::V4(_) => "0.0.0.0".to_owned(),
        IpAddr::V6(_) => "::".to_owned(),
    }
}

/// The wildcard bind address matching the peer's address family.
fn unspecified_ip(peer: IpAddr) -> IpAddr {
    match peer {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_transport() {
        let t = parse_transport("RTP/AVP;unicast;client_port=20000-20001");
        assert!(!t.tcp);
        assert_eq!(t.client_rtp, Some(20000));
        assert_eq!(t.client_rtcp, Some(20001));
        assert!(!t.record_mode);
    }

    #[test]
    fn parses_tcp_transport() {
        let t = parse_transport("RTP/AVP/TCP;unicast;interleaved=2-3");
        assert!(t.tcp);
        assert_eq!(t.interleaved, (2, 3));
    }

    #[test]
    fn parses_record_mode() {
        let t = parse_transport("RTP/AVP;unicast;client_port=5000-5001;mode=record");
        assert!(t.record_mode);
        let t = parse_transport("RTP/AVP;unicast;client_port=5000-5001;mode=\"RECORD\"");
        assert!(t.record_mode);
    }
}
