// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP/RTP streaming library for H.264 and H.265 video.
//!
//! Three roles are supported:
//!
//! *   [`server::Server`]: accepts RTSP control connections, serves registered
//!     media paths, and fans pushed video frames out to subscribers over UDP
//!     or TCP-interleaved transport. Remote publishers can feed a path via
//!     `ANNOUNCE`/`RECORD`.
//! *   [`client::Client`]: connects to an RTSP source, negotiates transport,
//!     and reassembles [`codec::VideoFrame`]s from RTP.
//! *   [`publisher::Publisher`]: pushes a local stream to a remote RTSP sink
//!     via `ANNOUNCE` -> `SETUP` -> `RECORD`.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::{Debug, Display};
use std::net::{IpAddr, SocketAddr};

mod dump;
mod error;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod auth;
pub mod client;
pub mod codec;
mod conn;
pub mod publisher;
mod queue;
mod reorder;
pub mod rtcp;
pub mod rtp;
pub mod sdp;
pub mod server;

use error::ErrorInt;

/// A received RTSP message.
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    #[allow(unused)] // carried for log/error output.
    pub(crate) ctx: RtspMessageContext,
    pub(crate) msg: rtsp_types::Message<bytes::Bytes>,
}

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp(2_208_988_800 << 32);

/// A wallclock time represented using the format of the Network Time Protocol.
///
/// NTP timestamps are a fixed-point representation of seconds since 0h UTC on
/// 1 January 1900: integer part in the top 32 bits, fractional part in the
/// bottom 32. This is the format the RTCP sender report carries on the wire.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Returns the current wallclock time as an NTP timestamp.
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        let sec_since_epoch = now.timestamp() as u64;
        let nanos = now.timestamp_subsec_nanos();
        let frac = ((f64::from(nanos) / 1e9) * f64::from(u32::MAX)).round() as u64;
        NtpTimestamp(((sec_since_epoch + (UNIX_EPOCH.0 >> 32)) << 32) | frac)
    }

    /// The integer seconds-since-1900 part.
    #[inline]
    pub fn sec(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let since_epoch = self.0.wrapping_sub(UNIX_EPOCH.0);
        let secs = (since_epoch >> 32) as i64;
        let frac = (since_epoch & 0xFFFF_FFFF) as f64 / f64::from(u32::MAX);
        let nanos = (frac * 1e9).round() as u32;
        match chrono::DateTime::from_timestamp(secs, nanos) {
            Some(dt) => write!(f, "{}", dt.format("%FT%T%.3fZ")),
            None => write!(f, "ntp:{}", self.0),
        }
    }
}

impl Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

/// A wall time taken from the local machine's realtime clock, used in error
/// reporting. Currently this just allows formatting via `Debug` and `Display`.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    pub(crate) fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)<->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within an RTSP connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// The starting byte position within the input stream. The bottom 32 bits
    /// can be compared to the relative TCP sequence number.
    pos: u64,

    received_wall: WallTime,
}

impl RtspMessageContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            pos: 0,
            received_wall: WallTime::now(),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// A pair of local UDP sockets used for RTP and RTCP transmission.
///
/// The RTP port is always even, and the RTCP port is always the following
/// (odd) integer.
#[derive(Debug)]
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: tokio::net::UdpSocket,
    pub(crate) rtcp_socket: tokio::net::UdpSocket,
}

impl UdpPair {
    /// Binds an even/odd port pair within `[start, end)` on `ip_addr`.
    ///
    /// Probes a few random candidates first, then falls back to a linear scan
    /// so small ranges still succeed deterministically.
    pub(crate) fn for_range(ip_addr: IpAddr, start: u16, end: u16) -> Result<Self, std::io::Error> {
        const MAX_TRIES: usize = 10;
        if end <= start.saturating_add(1) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid RTP port range {start}..{end}"),
            ));
        }
        let mut rng = rand::thread_rng();
        for i in 0..MAX_TRIES {
            let rtp_port = rand::Rng::gen_range(&mut rng, start..end - 1) & !0b1;
            if rtp_port < start {
                continue;
            }
            match Self::bind_pair(ip_addr, rtp_port) {
                Ok(pair) => return Ok(pair),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    log::trace!("try {i}/{MAX_TRIES}: port pair {rtp_port} in use");
                }
                Err(e) => return Err(e),
            }
        }
        let mut p = start + (start & 1);
        while p + 1 < end {
            match Self::bind_pair(ip_addr, p) {
                Ok(pair) => return Ok(pair),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => p += 2,
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("unable to find free even/odd pair in {ip_addr}:{start}..{end}"),
        ))
    }

    fn bind_pair(ip_addr: IpAddr, rtp_port: u16) -> Result<Self, std::io::Error> {
        let rtp_socket = std::net::UdpSocket::bind(SocketAddr::new(ip_addr, rtp_port))?;
        let rtp_port = rtp_socket.local_addr()?.port();
        let rtcp_socket = std::net::UdpSocket::bind(SocketAddr::new(ip_addr, rtp_port + 1))?;
        rtp_socket.set_nonblocking(true)?;
        rtcp_socket.set_nonblocking(true)?;
        Ok(Self {
            rtp_port,
            rtp_socket: tokio::net::UdpSocket::from_std(rtp_socket)?,
            rtcp_socket: tokio::net::UdpSocket::from_std(rtcp_socket)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn local_udp_pair() {
        tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap()
            .block_on(async {
                let pair =
                    UdpPair::for_range(IpAddr::V4(Ipv4Addr::LOCALHOST), 20000, 30000).unwrap();
                assert_eq!(pair.rtp_port % 2, 0);
            });
    }

    #[test]
    fn ntp_after_1900() {
        let now = NtpTimestamp::now();
        assert!(now > UNIX_EPOCH);
        let s = format!("{now}");
        assert!(s.starts_with("20"), "{s}");
    }
}
