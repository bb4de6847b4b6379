// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP server: accepts control connections, serves registered media paths,
//! and broadcasts pushed video frames to subscribers.
//!
//! The server owns a `path -> MediaPath` map under one coarse mutex, held only
//! for lookups and insertions, never across I/O. Each accepted connection and
//! each playing session runs as its own task; producers never block on
//! consumers (bounded per-session queues drop their oldest frame when full).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameType, VideoCodec, VideoFrame};
use crate::error::ErrorInt;
use crate::Error;

mod conn;
mod session;

pub(crate) use session::ClientSession;

/// Interval between sweeps of the idle-session cleanup task.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address.
    pub host: String,
    /// Listen port; 0 binds an ephemeral port (see [`Server::local_addr`]).
    pub port: u16,

    /// Sessions with no RTSP activity for this long are torn down.
    pub session_timeout_ms: u64,

    /// Local port range for per-session UDP sender pairs and record ingest.
    pub rtp_port_start: u16,
    pub rtp_port_end: u16,

    pub auth_enabled: bool,
    /// Digest-MD5 when true, Basic otherwise.
    pub auth_use_digest: bool,
    pub auth_username: String,
    pub auth_password: String,
    pub auth_realm: String,
    /// Fixed Digest nonce; autogenerated per connection when `None`.
    pub auth_nonce: Option<String>,
    pub auth_nonce_ttl_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 554,
            session_timeout_ms: 60_000,
            rtp_port_start: 10_000,
            rtp_port_end: 20_000,
            auth_enabled: false,
            auth_use_digest: false,
            auth_username: String::new(),
            auth_password: String::new(),
            auth_realm: "RTSP Server".to_owned(),
            auth_nonce: None,
            auth_nonce_ttl_ms: 60_000,
        }
    }
}

/// Configuration of one media path.
#[derive(Clone, Debug)]
pub struct PathConfig {
    /// Path with leading slash, e.g. `/live/stream1`.
    pub path: String,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,

    /// Parameter sets without start codes; auto-extracted from pushed key
    /// frames when left empty.
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

impl PathConfig {
    pub fn new(path: impl Into<String>, codec: VideoCodec) -> Self {
        Self {
            path: path.into(),
            codec,
            width: 1920,
            height: 1080,
            fps: 30,
            vps: Vec::new(),
            sps: Vec::new(),
            pps: Vec::new(),
        }
    }
}

/// A snapshot of server counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerStats {
    pub requests_total: u64,
    pub auth_challenges: u64,
    pub auth_failures: u64,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub frames_pushed: u64,
    pub rtp_packets_sent: u64,
    pub rtp_bytes_sent: u64,
}

#[derive(Default)]
pub(crate) struct StatsInner {
    pub(crate) requests_total: AtomicU64,
    pub(crate) auth_challenges: AtomicU64,
    pub(crate) auth_failures: AtomicU64,
    pub(crate) sessions_created: AtomicU64,
    pub(crate) sessions_closed: AtomicU64,
    pub(crate) frames_pushed: AtomicU64,
    pub(crate) rtp_packets_sent: AtomicU64,
    pub(crate) rtp_bytes_sent: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            auth_challenges: self.auth_challenges.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            rtp_packets_sent: self.rtp_packets_sent.load(Ordering::Relaxed),
            rtp_bytes_sent: self.rtp_bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Callback fired with the path and the client's IP on subscribe/unsubscribe.
pub type ClientCallback = Box<dyn Fn(&str, IpAddr) + Send + Sync>;

/// One registered media path: configuration, its subscriber sessions, and the
/// most recently pushed frame (served to new subscribers when it's an IDR).
pub(crate) struct MediaPath {
    pub(crate) config: Mutex<PathConfig>,
    pub(crate) sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    latest: Mutex<Option<VideoFrame>>,
}

impl MediaPath {
    fn new(config: PathConfig) -> Self {
        Self {
            config: Mutex::new(config),
            sessions: Mutex::new(HashMap::new()),
            latest: Mutex::new(None),
        }
    }

    /// A path implicitly registered by a publisher's ANNOUNCE.
    pub(crate) fn new_for_announce(path: &str, codec: VideoCodec) -> Self {
        Self::new(PathConfig::new(path, codec))
    }

    /// Replaces the cached latest frame and enqueues a shared reference into
    /// every playing session's queue.
    pub(crate) fn broadcast(&self, frame: &VideoFrame) {
        {
            let mut latest = self.latest.lock().expect("latest poisoned");
            *latest = Some(frame.clone());
        }
        let sessions = self.sessions.lock().expect("sessions poisoned");
        for session in sessions.values() {
            if session.is_playing() {
                session.queue_frame(frame.clone());
            }
        }
    }

    /// Registers a subscriber. A cached IDR frame is queued ahead of
    /// subsequent frames so the subscriber can start decoding immediately.
    pub(crate) fn add_session(&self, session: Arc<ClientSession>) {
        let mut sessions = self.sessions.lock().expect("sessions poisoned");
        sessions.insert(session.id.clone(), session.clone());
        let latest = self.latest.lock().expect("latest poisoned");
        if let Some(f) = latest.as_ref() {
            if f.frame_type() == FrameType::Idr {
                session.queue_frame(f.clone());
            }
        }
    }

    pub(crate) fn remove_session(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.lock().expect("sessions poisoned").remove(id)
    }
}

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) paths: Mutex<HashMap<String, Arc<MediaPath>>>,
    pub(crate) stats: Arc<StatsInner>,
    pub(crate) token: CancellationToken,
    connect_cb: Mutex<Option<ClientCallback>>,
    disconnect_cb: Mutex<Option<ClientCallback>>,
}

impl ServerInner {
    pub(crate) fn lookup_path(&self, path: &str) -> Option<Arc<MediaPath>> {
        self.paths.lock().expect("paths poisoned").get(path).cloned()
    }

    pub(crate) fn fire_connect(&self, path: &str, ip: IpAddr) {
        if let Some(cb) = self.connect_cb.lock().expect("cb poisoned").as_ref() {
            cb(path, ip);
        }
    }

    pub(crate) fn fire_disconnect(&self, path: &str, ip: IpAddr) {
        if let Some(cb) = self.disconnect_cb.lock().expect("cb poisoned").as_ref() {
            cb(path, ip);
        }
    }
}

/// Generates a session id unique for the server's lifetime.
pub(crate) fn new_session_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let r: u64 = rand::random();
    format!("{r:016x}{n:x}")
}

/// An RTSP server.
///
/// ```no_run
/// use fovea::codec::VideoCodec;
/// use fovea::server::{PathConfig, Server, ServerConfig};
///
/// # async fn demo() -> Result<(), fovea::Error> {
/// let mut server = Server::new(ServerConfig {
///     host: "0.0.0.0".to_owned(),
///     port: 8554,
///     ..Default::default()
/// });
/// server.add_path(PathConfig::new("/live/cam", VideoCodec::H264))?;
/// server.start().await?;
/// // server.push_h264("/live/cam", &annexb_frame, pts_ms, is_key)?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    inner: Arc<ServerInner>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                paths: Mutex::new(HashMap::new()),
                stats: Arc::new(StatsInner::default()),
                token: CancellationToken::new(),
                connect_cb: Mutex::new(None),
                disconnect_cb: Mutex::new(None),
            }),
            local_addr: None,
            tasks: Vec::new(),
            running: false,
        }
    }

    /// Starts listening and spawns the accept and cleanup tasks.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.running {
            bail!(ErrorInt::InvalidArgument("server already running".into()));
        }
        let addr = (self.inner.config.host.as_str(), self.inner.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        self.local_addr = Some(
            listener
                .local_addr()
                .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?,
        );
        info!("RTSP server listening on {}", self.local_addr.unwrap());

        let inner = self.inner.clone();
        self.tasks.push(tokio::spawn(accept_loop(inner, listener)));
        let inner = self.inner.clone();
        self.tasks.push(tokio::spawn(cleanup_loop(inner)));
        self.running = true;
        Ok(())
    }

    /// The bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stops the server: cancels all tasks, tears down every session, and
    /// drops all paths.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.inner.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        let paths: Vec<Arc<MediaPath>> = {
            let mut map = self.inner.paths.lock().expect("paths poisoned");
            map.drain().map(|(_, p)| p).collect()
        };
        for path in paths {
            let sessions: Vec<_> = path
                .sessions
                .lock()
                .expect("sessions poisoned")
                .drain()
                .map(|(_, s)| s)
                .collect();
            for s in sessions {
                s.stop().await;
            }
        }
        info!("RTSP server stopped");
    }

    /// Registers a media path. Fails if the path already exists.
    pub fn add_path(&self, config: PathConfig) -> Result<(), Error> {
        if !config.path.starts_with('/') {
            bail!(ErrorInt::InvalidArgument(format!(
                "path {:?} must start with a slash",
                config.path
            )));
        }
        let mut paths = self.inner.paths.lock().expect("paths poisoned");
        if paths.contains_key(&config.path) {
            bail!(ErrorInt::InvalidArgument(format!(
                "path {:?} already exists",
                config.path
            )));
        }
        info!("added path {}", config.path);
        paths.insert(config.path.clone(), Arc::new(MediaPath::new(config)));
        Ok(())
    }

    /// Removes a media path, terminating all sessions subscribed to it.
    pub async fn remove_path(&self, path: &str) -> bool {
        let removed = self
            .inner
            .paths
            .lock()
            .expect("paths poisoned")
            .remove(path);
        match removed {
            None => false,
            Some(p) => {
                let sessions: Vec<_> = p
                    .sessions
                    .lock()
                    .expect("sessions poisoned")
                    .drain()
                    .map(|(_, s)| s)
                    .collect();
                for s in sessions {
                    s.stop().await;
                    self.inner.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
                    self.inner.fire_disconnect(path, s.peer_ip);
                }
                true
            }
        }
    }

    /// Broadcasts a frame to all subscribers of `path`.
    ///
    /// Never blocks on consumers: each session has a bounded queue which
    /// drops its oldest frame on overflow.
    pub fn push_frame(&self, path: &str, frame: VideoFrame) -> Result<(), Error> {
        let media_path = match self.inner.lookup_path(path) {
            Some(p) => p,
            None => bail!(ErrorInt::NotFound(format!("no such path {path:?}"))),
        };
        maybe_extract_parameter_sets(&media_path, &frame);
        media_path.broadcast(&frame);
        self.inner.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pushes a raw Annex-B H.264 buffer to `path`.
    pub fn push_h264(
        &self,
        path: &str,
        data: &[u8],
        pts_ms: u64,
        is_key: bool,
    ) -> Result<(), Error> {
        self.push_raw(path, VideoCodec::H264, data, pts_ms, is_key)
    }

    /// Pushes a raw Annex-B H.265 buffer to `path`.
    pub fn push_h265(
        &self,
        path: &str,
        data: &[u8],
        pts_ms: u64,
        is_key: bool,
    ) -> Result<(), Error> {
        self.push_raw(path, VideoCodec::H265, data, pts_ms, is_key)
    }

    fn push_raw(
        &self,
        path: &str,
        codec: VideoCodec,
        data: &[u8],
        pts_ms: u64,
        is_key: bool,
    ) -> Result<(), Error> {
        let (width, height, fps) = match self.inner.lookup_path(path) {
            Some(p) => {
                let c = p.config.lock().expect("config poisoned");
                if c.codec != codec {
                    bail!(ErrorInt::InvalidArgument(format!(
                        "path {path:?} is configured for {}, not {}",
                        c.codec, codec
                    )));
                }
                (c.width, c.height, c.fps)
            }
            None => bail!(ErrorInt::NotFound(format!("no such path {path:?}"))),
        };
        let frame = VideoFrame::new(
            codec,
            if is_key { FrameType::Idr } else { FrameType::P },
            pts_ms,
            Bytes::copy_from_slice(data),
        )
        .with_dimensions(width, height, fps);
        self.push_frame(path, frame)
    }

    /// Returns a cloneable producer handle bound to one path.
    pub fn frame_input(&self, path: &str) -> FrameInput {
        FrameInput {
            inner: self.inner.clone(),
            path: path.to_owned(),
        }
    }

    pub fn set_connect_callback(&self, cb: ClientCallback) {
        *self.inner.connect_cb.lock().expect("cb poisoned") = Some(cb);
    }

    pub fn set_disconnect_callback(&self, cb: ClientCallback) {
        *self.inner.disconnect_cb.lock().expect("cb poisoned") = Some(cb);
    }

    pub fn stats(&self) -> ServerStats {
        self.inner.stats.snapshot()
    }
}

/// A producer handle for one path, detached from the server's lifetime.
#[derive(Clone)]
pub struct FrameInput {
    inner: Arc<ServerInner>,
    path: String,
}

impl FrameInput {
    pub fn push_frame(&self, frame: VideoFrame) -> Result<(), Error> {
        let media_path = match self.inner.lookup_path(&self.path) {
            Some(p) => p,
            None => bail!(ErrorInt::NotFound(format!("no such path {:?}", self.path))),
        };
        maybe_extract_parameter_sets(&media_path, &frame);
        media_path.broadcast(&frame);
        self.inner.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Fills the path's parameter sets from a pushed key frame, so later
/// `DESCRIBE` responses carry accurate `fmtp` sprop values.
pub(crate) fn maybe_extract_parameter_sets(media_path: &MediaPath, frame: &VideoFrame) {
    let mut config = media_path.config.lock().expect("config poisoned");
    let missing = match config.codec {
        VideoCodec::H264 => config.sps.is_empty() || config.pps.is_empty(),
        VideoCodec::H265 => {
            config.vps.is_empty() || config.sps.is_empty() || config.pps.is_empty()
        }
    };
    if !(frame.is_idr() || missing) {
        return;
    }
    let updated = match config.codec {
        VideoCodec::H264 => extract_h264_parameter_sets(&mut config, frame.data()),
        VideoCodec::H265 => extract_h265_parameter_sets(&mut config, frame.data()),
    };
    if updated {
        info!("auto-updated parameter sets for path {}", config.path);
    }
}

fn assign_if_changed(dst: &mut Vec<u8>, src: &[u8]) -> bool {
    if src.is_empty() || dst.as_slice() == src {
        return false;
    }
    dst.clear();
    dst.extend_from_slice(src);
    true
}

fn extract_h264_parameter_sets(config: &mut PathConfig, data: &[u8]) -> bool {
    let mut updated = false;
    for nalu in crate::codec::annexb_nalus(data) {
        if nalu.is_empty() {
            continue;
        }
        match nalu[0] & 0x1F {
            7 => updated |= assign_if_changed(&mut config.sps, nalu),
            8 => updated |= assign_if_changed(&mut config.pps, nalu),
            _ => {}
        }
    }
    updated
}

fn extract_h265_parameter_sets(config: &mut PathConfig, data: &[u8]) -> bool {
    let mut updated = false;
    for nalu in crate::codec::annexb_nalus(data) {
        if nalu.len() < 2 {
            continue;
        }
        match (nalu[0] >> 1) & 0x3F {
            32 => updated |= assign_if_changed(&mut config.vps, nalu),
            33 => updated |= assign_if_changed(&mut config.sps, nalu),
            34 => updated |= assign_if_changed(&mut config.pps, nalu),
            _ => {}
        }
    }
    updated
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        conn::serve(inner, stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// Periodically tears down sessions whose last RTSP activity is older than
/// the configured timeout.
async fn cleanup_loop(inner: Arc<ServerInner>) {
    let timeout = Duration::from_millis(inner.config.session_timeout_ms);
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let mut expired: Vec<(String, Arc<ClientSession>)> = Vec::new();
        {
            let paths = inner.paths.lock().expect("paths poisoned");
            for (path, media_path) in paths.iter() {
                let mut sessions = media_path.sessions.lock().expect("sessions poisoned");
                let timed_out: Vec<String> = sessions
                    .values()
                    .filter(|s| s.idle_for() > timeout)
                    .map(|s| s.id.clone())
                    .collect();
                for id in timed_out {
                    if let Some(s) = sessions.remove(&id) {
                        expired.push((path.clone(), s));
                    }
                }
            }
        }
        for (path, session) in expired {
            info!("session {} timed out on {}", session.id, path);
            session.stop().await;
            inner.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
            inner.fire_disconnect(&path, session.peer_ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_session_id()));
        }
    }

    #[test]
    fn add_path_rejects_duplicates_and_bad_names() {
        let server = Server::new(ServerConfig::default());
        server
            .add_path(PathConfig::new("/live/a", VideoCodec::H264))
            .unwrap();
        server
            .add_path(PathConfig::new("/live/a", VideoCodec::H264))
            .unwrap_err();
        server
            .add_path(PathConfig::new("no-slash", VideoCodec::H264))
            .unwrap_err();
    }

    #[test]
    fn extracts_h264_parameter_sets_from_key_frame() {
        let mut config = PathConfig::new("/x", VideoCodec::H264);
        let mut data = Vec::new();
        for nalu in [&[0x67u8, 0x42, 0x00, 0x1F][..], &[0x68, 0xCE][..], &[0x65, 0x88][..]] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nalu);
        }
        assert!(extract_h264_parameter_sets(&mut config, &data));
        assert_eq!(config.sps, vec![0x67, 0x42, 0x00, 0x1F]);
        assert_eq!(config.pps, vec![0x68, 0xCE]);
        // Same frame again: nothing changes.
        assert!(!extract_h264_parameter_sets(&mut config, &data));
    }

    #[test]
    fn extracts_h265_parameter_sets() {
        let mut config = PathConfig::new("/x", VideoCodec::H265);
        let mut data = Vec::new();
        for nalu in [
            &[0x40u8, 0x01, 0x0C][..], // VPS (type 32)
            &[0x42, 0x01, 0x01][..],   // SPS (type 33)
            &[0x44, 0x01, 0xC1][..],   // PPS (type 34)
            &[0x26, 0x01, 0xAF][..],   // IDR slice
        ] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nalu);
        }
        assert!(extract_h265_parameter_sets(&mut config, &data));
        assert_eq!(config.vps, vec![0x40, 0x01, 0x0C]);
        assert_eq!(config.sps, vec![0x42, 0x01, 0x01]);
        assert_eq!(config.pps, vec![0x44, 0x01, 0xC1]);
    }

    #[test]
    fn push_frame_to_unknown_path_errors() {
        let server = Server::new(ServerConfig::default());
        let frame = VideoFrame::new(
            VideoCodec::H264,
            FrameType::P,
            0,
            Bytes::from_static(&[0, 0, 0, 1, 0x41, 1]),
        );
        server.push_frame("/nope", frame).unwrap_err();
    }
}
