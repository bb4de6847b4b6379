// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP publisher: pushes a local stream to a remote sink via
//! `ANNOUNCE` -> `SETUP` -> `RECORD`.
//!
//! Mirrors the client's control dialog with the direction reversed: the
//! publisher sends the SDP body and, once recording, packetizes application
//! frames onto a UDP pair pointed at the server's announced `server_port`.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};
use rtsp_types::{headers, Method, StatusCode, Version};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::{conn_task, join_control, parse, ConnCmd, Delivery};
use crate::codec::{FrameType, Packetizer, VideoCodec, VideoFrame, DEFAULT_MTU};
use crate::conn::Connection;
use crate::error::ErrorInt;
use crate::sdp::MediaDescription;
use crate::{Error, UdpPair};

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,

    /// Local RTP port for the sender pair; 0 picks a free even/odd pair.
    pub local_rtp_port: u16,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("fovea/", env!("CARGO_PKG_VERSION")).to_owned(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 5_000,
            local_rtp_port: 0,
        }
    }
}

/// An outbound RTSP session in `ANNOUNCE`/`RECORD` mode.
///
/// ```no_run
/// use fovea::codec::VideoCodec;
/// use fovea::publisher::{Publisher, PublisherConfig};
/// use fovea::sdp::MediaDescription;
///
/// # async fn demo() -> Result<(), fovea::Error> {
/// let publisher =
///     Publisher::connect("rtsp://relay.local/live/out", PublisherConfig::default()).await?;
/// publisher.announce(MediaDescription::new(VideoCodec::H264)).await?;
/// publisher.setup().await?;
/// publisher.record().await?;
/// // publisher.push_h264(&annexb_frame, pts_ms, is_key).await?;
/// publisher.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Publisher {
    config: PublisherConfig,
    host: String,
    request_url: String,

    cmd_tx: mpsc::Sender<ConnCmd>,
    token: CancellationToken,
    conn_task: Mutex<Option<JoinHandle<()>>>,

    cseq: AtomicU32,
    session_id: Mutex<Option<String>>,
    media: Mutex<Option<MediaDescription>>,
    packetizer: tokio::sync::Mutex<Option<Packetizer>>,
    udp: Mutex<Option<Arc<UdpPair>>>,
    /// Server-side `(rtp, rtcp)` ports from the SETUP response.
    server_ports: Mutex<Option<(u16, u16)>>,

    announced: AtomicBool,
    setup_done: AtomicBool,
    recording: AtomicBool,
}

impl Publisher {
    /// Parses `rtsp://host[:port]/path` and opens the control connection.
    pub async fn connect(url: &str, config: PublisherConfig) -> Result<Self, Error> {
        let parsed = Url::parse(url)
            .map_err(|e| wrap!(ErrorInt::InvalidArgument(format!("bad URL {url:?}: {e}"))))?;
        if parsed.scheme() != "rtsp" {
            bail!(ErrorInt::InvalidArgument(format!(
                "only rtsp:// URLs are supported, got {url:?}"
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| wrap!(ErrorInt::InvalidArgument(format!("URL {url:?} has no host"))))?
            .to_owned();
        let port = parsed.port().unwrap_or(554);
        let path = if parsed.path().is_empty() {
            "/"
        } else {
            parsed.path()
        };
        let request_url = format!("rtsp://{host}:{port}{path}");

        let conn =
            Connection::connect(&host, port, Duration::from_millis(config.connect_timeout_ms))
                .await
                .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        debug!("publisher connected to {}", conn.ctx());

        let token = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        // The connection task wants a delivery pipeline; a publisher never
        // receives interleaved media, so a placeholder suffices.
        let delivery = Delivery::new(1, 1);
        let task = tokio::spawn(conn_task(conn, cmd_rx, delivery, token.clone()));

        Ok(Self {
            config,
            host,
            request_url,
            cmd_tx,
            token,
            conn_task: Mutex::new(Some(task)),
            cseq: AtomicU32::new(0),
            session_id: Mutex::new(None),
            media: Mutex::new(None),
            packetizer: tokio::sync::Mutex::new(None),
            udp: Mutex::new(None),
            server_ports: Mutex::new(None),
            announced: AtomicBool::new(false),
            setup_done: AtomicBool::new(false),
            recording: AtomicBool::new(false),
        })
    }

    /// Sends `ANNOUNCE` with the stream's SDP.
    pub async fn announce(&self, mut media: MediaDescription) -> Result<(), Error> {
        if media.control.is_none() {
            media.control = Some("streamid=0".to_owned());
        }
        let body = media.build(&self.host, "fovea publish");
        let resp = self
            .send_request(
                Method::Announce,
                &self.request_url.clone(),
                vec![(headers::CONTENT_TYPE, "application/sdp".to_owned())],
                Bytes::from(body),
            )
            .await?;
        self.expect_ok(Method::Announce, &resp)?;
        *self.media.lock().expect("media poisoned") = Some(media);
        self.announced.store(true, Ordering::Release);
        Ok(())
    }

    /// Sends `SETUP` for the announced track and points the RTP sender at the
    /// server's `server_port` pair.
    pub async fn setup(&self) -> Result<(), Error> {
        if !self.announced.load(Ordering::Acquire) {
            bail!(ErrorInt::StateError("SETUP requires ANNOUNCE first".into()));
        }
        let media = self
            .media
            .lock()
            .expect("media poisoned")
            .clone()
            .expect("media set by announce");

        let pair = if self.config.local_rtp_port == 0 {
            UdpPair::for_range(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 20_000, 30_000)
        } else {
            UdpPair::for_range(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.config.local_rtp_port,
                self.config.local_rtp_port + 2,
            )
        }
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;

        let transport = format!(
            "RTP/AVP;unicast;client_port={}-{};mode=record",
            pair.rtp_port,
            pair.rtp_port + 1
        );
        let track_url = join_control(&self.request_url, media.control.as_deref());
        let resp = self
            .send_request(
                Method::Setup,
                &track_url,
                vec![(headers::TRANSPORT, transport)],
                Bytes::new(),
            )
            .await?;
        self.expect_ok(Method::Setup, &resp)?;
        let setup = parse::parse_setup(&resp).map_err(|e| {
            wrap!(ErrorInt::RtspFramingError {
                conn_ctx: crate::ConnectionContext::dummy(),
                msg_ctx: crate::RtspMessageContext::dummy(),
                description: e,
            })
        })?;
        let server_ports = match setup.server_rtp_port {
            Some(p) => p,
            None => bail!(ErrorInt::StateError(
                "SETUP response lacks server_port; nowhere to send RTP".into()
            )),
        };

        *self.session_id.lock().expect("session poisoned") = Some(setup.session_id);
        *self.server_ports.lock().expect("ports poisoned") = Some(server_ports);
        *self.udp.lock().expect("udp poisoned") = Some(Arc::new(pair));
        *self.packetizer.lock().await = Some(Packetizer::new(
            media.codec,
            media.payload_type,
            rand::random(),
            DEFAULT_MTU,
        ));
        self.setup_done.store(true, Ordering::Release);
        Ok(())
    }

    /// Sends `RECORD`, transitioning to the recording state.
    pub async fn record(&self) -> Result<(), Error> {
        if !self.setup_done.load(Ordering::Acquire) {
            bail!(ErrorInt::StateError("RECORD requires SETUP first".into()));
        }
        let resp = self
            .send_request(Method::Record, &self.request_url.clone(), Vec::new(), Bytes::new())
            .await?;
        self.expect_ok(Method::Record, &resp)?;
        self.recording.store(true, Ordering::Release);
        info!("publisher recording to {}", self.request_url);
        Ok(())
    }

    /// Packetizes and sends one frame. Only valid while recording.
    pub async fn push_frame(&self, frame: &VideoFrame) -> Result<(), Error> {
        if !self.recording.load(Ordering::Acquire) {
            bail!(ErrorInt::StateError("push_frame requires RECORD".into()));
        }
        let udp = self
            .udp
            .lock()
            .expect("udp poisoned")
            .clone()
            .expect("udp pair set by setup");
        let (rtp_port, _) = self
            .server_ports
            .lock()
            .expect("ports poisoned")
            .expect("ports set by setup");
        let mut packetizer = self.packetizer.lock().await;
        let packetizer = packetizer.as_mut().expect("packetizer set by setup");
        for pkt in packetizer.packetize(frame) {
            udp.rtp_socket
                .send_to(&pkt, (self.host.as_str(), rtp_port))
                .await
                .map_err(|e| {
                    wrap!(ErrorInt::UdpError {
                        when: crate::WallTime::now(),
                        source: e,
                    })
                })?;
        }
        Ok(())
    }

    /// Builds a [`VideoFrame`] from a raw Annex-B H.264 buffer and sends it.
    pub async fn push_h264(&self, data: &[u8], pts_ms: u64, is_key: bool) -> Result<(), Error> {
        self.push_raw(VideoCodec::H264, data, pts_ms, is_key).await
    }

    /// Builds a [`VideoFrame`] from a raw Annex-B H.265 buffer and sends it.
    pub async fn push_h265(&self, data: &[u8], pts_ms: u64, is_key: bool) -> Result<(), Error> {
        self.push_raw(VideoCodec::H265, data, pts_ms, is_key).await
    }

    async fn push_raw(
        &self,
        codec: VideoCodec,
        data: &[u8],
        pts_ms: u64,
        is_key: bool,
    ) -> Result<(), Error> {
        let (width, height, fps) = {
            let media = self.media.lock().expect("media poisoned");
            match media.as_ref() {
                Some(m) => (m.width, m.height, m.fps),
                None => (0, 0, 0),
            }
        };
        let frame = VideoFrame::new(
            codec,
            if is_key { FrameType::Idr } else { FrameType::P },
            pts_ms,
            Bytes::copy_from_slice(data),
        )
        .with_dimensions(width, height, fps);
        self.push_frame(&frame).await
    }

    /// Sends `TEARDOWN` and releases the sender. Idempotent.
    pub async fn teardown(&self) -> Result<(), Error> {
        self.recording.store(false, Ordering::Release);
        self.setup_done.store(false, Ordering::Release);
        self.announced.store(false, Ordering::Release);
        let session = self.session_id.lock().expect("session poisoned").clone();
        if session.is_some() {
            // Best effort; the peer may already be gone.
            let _ = self
                .send_request(
                    Method::Teardown,
                    &self.request_url.clone(),
                    Vec::new(),
                    Bytes::new(),
                )
                .await;
        }
        *self.session_id.lock().expect("session poisoned") = None;
        *self.packetizer.lock().await = None;
        *self.udp.lock().expect("udp poisoned") = None;
        *self.server_ports.lock().expect("ports poisoned") = None;
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        self.close_with_timeout(Duration::from_secs(3)).await;
    }

    /// Tears down and joins the connection task within `deadline`, returning
    /// whether the shutdown was clean.
    pub async fn close_with_timeout(&self, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        let _ = tokio::time::timeout(deadline, self.teardown()).await;
        self.token.cancel();
        let task = self.conn_task.lock().expect("conn_task poisoned").take();
        match task {
            Some(task) => {
                let remaining = deadline.saturating_sub(start.elapsed());
                tokio::time::timeout(remaining, task).await.is_ok()
            }
            None => true,
        }
    }

    async fn send_request(
        &self,
        method: Method,
        uri: &str,
        extra_headers: Vec<(rtsp_types::HeaderName, String)>,
        body: Bytes,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let url = Url::parse(uri)
            .map_err(|e| wrap!(ErrorInt::InvalidArgument(format!("bad URI {uri:?}: {e}"))))?;
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut builder = rtsp_types::Request::builder(method, Version::V1_0)
            .request_uri(url)
            .header(headers::CSEQ, cseq.to_string())
            .header(headers::USER_AGENT, self.config.user_agent.clone());
        if let Some(session) = self.session_id.lock().expect("session poisoned").clone() {
            builder = builder.header(headers::SESSION, session);
        }
        for (name, value) in extra_headers {
            builder = builder.header(name, value);
        }
        let req = builder.build(body);

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::Send { req, cseq, tx })
            .await
            .map_err(|_| wrap!(ErrorInt::Shutdown))?;
        match tokio::time::timeout(Duration::from_millis(self.config.request_timeout_ms), rx).await
        {
            Err(_) => bail!(ErrorInt::Timeout),
            Ok(Err(_)) => bail!(ErrorInt::Shutdown),
            Ok(Ok(resp)) => resp,
        }
    }

    fn expect_ok(&self, method: Method, resp: &rtsp_types::Response<Bytes>) -> Result<(), Error> {
        if resp.status() == StatusCode::Ok {
            return Ok(());
        }
        bail!(ErrorInt::RtspResponseError {
            conn_ctx: crate::ConnectionContext::dummy(),
            method,
            cseq: parse::get_cseq(resp).unwrap_or(0),
            status: resp.status(),
            description: "request failed".to_owned(),
        })
    }
}
