// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server-side subscriber sessions: one bounded frame queue plus one sender
//! task per playing session.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use log::{debug, trace};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{Packetizer, VideoCodec, VideoFrame, DEFAULT_MTU};
use crate::conn::Connection;
use crate::queue::FrameQueue;
use crate::rtcp::SenderReport;
use crate::NtpTimestamp;

use super::StatsInner;

/// Frames buffered per session before the oldest is dropped.
const SESSION_QUEUE_FRAMES: usize = 30;

/// An RTCP sender report goes out every this many RTP packets.
const SR_PACKET_INTERVAL: u32 = 100;

/// Bound on joining a sender task during pause/teardown.
const SENDER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The write half of a control connection, shared between the request
/// handler's response writes and interleaved RTP writes.
pub(crate) type SharedSink =
    Arc<tokio::sync::Mutex<SplitSink<Connection, rtsp_types::Message<Bytes>>>>;

pub(crate) enum SessionTransport {
    Udp {
        rtp_socket: Arc<UdpSocket>,
        rtcp_socket: Arc<UdpSocket>,
        peer_rtp: SocketAddr,
        peer_rtcp: SocketAddr,
        local_rtp_port: u16,
    },
    Interleaved {
        sink: SharedSink,
        rtp_channel: u8,
    },
}

impl SessionTransport {
    pub(crate) fn describe(&self, client_rtp: u16, client_rtcp: u16) -> String {
        match self {
            SessionTransport::Udp { local_rtp_port, .. } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                client_rtp,
                client_rtcp,
                local_rtp_port,
                local_rtp_port + 1
            ),
            SessionTransport::Interleaved { rtp_channel, .. } => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                rtp_channel,
                rtp_channel + 1
            ),
        }
    }
}

/// One subscriber of a media path.
pub(crate) struct ClientSession {
    pub(crate) id: String,
    pub(crate) path: String,
    pub(crate) peer_ip: IpAddr,
    codec: VideoCodec,
    payload_type: u8,
    ssrc: u32,
    transport: SessionTransport,
    queue: FrameQueue,
    playing: AtomicBool,
    sender: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    last_activity: Mutex<Instant>,

    packet_count: AtomicU32,
    octet_count: AtomicU32,
    stats: Arc<StatsInner>,
}

impl ClientSession {
    pub(crate) fn new(
        id: String,
        path: String,
        peer_ip: IpAddr,
        codec: VideoCodec,
        payload_type: u8,
        transport: SessionTransport,
        stats: Arc<StatsInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            path,
            peer_ip,
            codec,
            payload_type,
            ssrc: rand::random(),
            transport,
            queue: FrameQueue::new(SESSION_QUEUE_FRAMES),
            playing: AtomicBool::new(false),
            sender: tokio::sync::Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            packet_count: AtomicU32::new(0),
            octet_count: AtomicU32::new(0),
            stats,
        })
    }

    #[inline]
    pub(crate) fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Refreshes the idle timer; called on every RTSP request that names this
    /// session. RTP egress deliberately does not refresh it.
    pub(crate) fn touch(&self) {
        *self.last_activity.lock().expect("last_activity poisoned") = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last_activity poisoned")
            .elapsed()
    }

    /// Enqueues a frame (drop-oldest on overflow). The caller checks
    /// `is_playing`; seeding a cached IDR at SETUP time bypasses that check.
    pub(crate) fn queue_frame(&self, frame: VideoFrame) {
        self.queue.push(frame);
    }

    /// Starts the sender task. Idempotent: a second PLAY neither spawns a
    /// second task nor perturbs sequence numbers.
    pub(crate) async fn start_playing(self: &Arc<Self>) {
        let mut sender = self.sender.lock().await;
        if sender.is_none() {
            let token = CancellationToken::new();
            let handle = tokio::spawn(self.clone().sender_loop(token.clone()));
            *sender = Some((token, handle));
        }
        self.playing.store(true, Ordering::Release);
    }

    /// Stops the sender task (bounded join) and drains the queue. The
    /// session stays registered; PLAY restarts it.
    pub(crate) async fn pause(&self) {
        self.playing.store(false, Ordering::Release);
        let taken = self.sender.lock().await.take();
        if let Some((token, handle)) = taken {
            token.cancel();
            if tokio::time::timeout(SENDER_JOIN_TIMEOUT, handle).await.is_err() {
                debug!("session {}: sender did not stop within timeout", self.id);
            }
        }
        self.queue.clear();
    }

    /// Final teardown; identical to pause today, named separately because
    /// callers must not reuse the session afterward.
    pub(crate) async fn stop(&self) {
        self.pause().await;
    }

    async fn sender_loop(self: Arc<Self>, token: CancellationToken) {
        let mut packetizer = Packetizer::new(self.codec, self.payload_type, self.ssrc, DEFAULT_MTU);
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                f = self.queue.pop() => match f {
                    Some(f) => f,
                    None => break,
                },
            };
            let packets = packetizer.packetize(&frame);
            for pkt in packets {
                let len = pkt.len();
                if let Err(e) = self.send_rtp(pkt).await {
                    debug!("session {}: RTP send failed: {e}", self.id);
                    return;
                }
                let count = self.packet_count.fetch_add(1, Ordering::Relaxed) + 1;
                self.octet_count
                    .fetch_add(len.min(u32::MAX as usize) as u32, Ordering::Relaxed);
                self.stats.rtp_packets_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .rtp_bytes_sent
                    .fetch_add(len as u64, Ordering::Relaxed);
                if count % SR_PACKET_INTERVAL == 0 {
                    self.send_sender_report(&frame).await;
                }
            }
            trace!("session {}: sent frame pts={}ms", self.id, frame.pts_ms());
        }
    }

    async fn send_rtp(&self, pkt: Bytes) -> Result<(), String> {
        match &self.transport {
            SessionTransport::Udp {
                rtp_socket,
                peer_rtp,
                ..
            } => rtp_socket
                .send_to(&pkt, peer_rtp)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            SessionTransport::Interleaved { sink, rtp_channel } => {
                // Shares the connection's send mutex with response writes, so
                // interleaved frames never tear an RTSP response.
                let mut sink = sink.lock().await;
                sink.send(rtsp_types::Message::Data(rtsp_types::Data::new(
                    *rtp_channel,
                    pkt,
                )))
                .await
                .map_err(|e| e.to_string())
            }
        }
    }

    async fn send_sender_report(&self, frame: &VideoFrame) {
        let sr = SenderReport {
            ssrc: self.ssrc,
            ntp_timestamp: NtpTimestamp::now(),
            rtp_timestamp: frame.pts_ms().wrapping_mul(90) as u32,
            packet_count: self.packet_count.load(Ordering::Relaxed),
            octet_count: self.octet_count.load(Ordering::Relaxed),
        }
        .build();
        let result: Result<(), String> = match &self.transport {
            SessionTransport::Udp {
                rtcp_socket,
                peer_rtcp,
                ..
            } => rtcp_socket
                .send_to(&sr, peer_rtcp)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            SessionTransport::Interleaved { sink, rtp_channel } => {
                let mut sink = sink.lock().await;
                sink.send(rtsp_types::Message::Data(rtsp_types::Data::new(
                    rtp_channel + 1,
                    Bytes::copy_from_slice(&sr),
                )))
                .await
                .map_err(|e| e.to_string())
            }
        };
        if let Err(e) = result {
            debug!("session {}: RTCP SR send failed: {e}", self.id);
        }
    }
}
