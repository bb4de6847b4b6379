// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, RtspMessageContext, WallTime};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; in most cases they carry
/// enough context to find the offending packet in a capture. Cloning is cheap
/// so errors can be broadcast to several waiters on shutdown.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the status code, if the error was generated from an RTSP
    /// response.
    pub fn status_code(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::RtspResponseError { status, .. } => Some((*status).into()),
            _ => None,
        }
    }

    /// Returns true if the operation failed because it was cancelled by a
    /// close or teardown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::Shutdown)
    }

    /// Returns true if the operation timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::Timeout)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("{status} response to {} CSeq={cseq}: {description}\n\nconn: {conn_ctx}",
            Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    #[error("SDP error: {0}")]
    SdpError(String),

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("UDP socket error: {source}\n\nat: {when}")]
    UdpError {
        when: WallTime,
        source: std::io::Error,
    },

    /// The challenge cycle was exhausted or credentials are missing.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// A method was issued in a state that does not allow it.
    #[error("Method not valid in this state: {0}")]
    StateError(String),

    /// Unknown path or session.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout")]
    Timeout,

    /// The operation was cancelled by `close`/`teardown`/`interrupt`.
    #[error("Shutdown")]
    Shutdown,
}
