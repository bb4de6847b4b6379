// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One RTSP control connection.
//!
//! [`Connection`] wraps a TCP stream in a `tokio_util` codec speaking the two
//! framings that share the socket: CRLF-delimited RTSP messages (with
//! `Content-Length`-sized bodies) and `$`-prefixed interleaved data. Message
//! parsing itself is delegated to `rtsp-types`; this module decides where
//! each frame starts and ends and keeps per-connection error context.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use pretty_hex::PrettyHex;
use rtsp_types::{Data, Message};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::{ConnectionContext, Error, ErrorInt, ReceivedMessage, RtspMessageContext, WallTime};

/// Ceiling on a single buffered RTSP message (start line, headers, body).
/// A buffer that is still incomplete past this size is treated as garbage
/// and the connection is dropped. Interleaved data needs no such cap: its
/// two-byte length field limits it to 65535 bytes.
const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// Introduces an interleaved data frame, RFC 2326 section 10.12.
const INTERLEAVED_MARKER: u8 = b'$';

/// How much of a rejected buffer the framing error reproduces.
const ERROR_DUMP_LEN: usize = 128;

/// An RTSP connection implementing `Stream` + `Sink` over [`Message`]s.
pub(crate) struct Connection {
    framed: Framed<TcpStream, MessageCodec>,
}

impl Connection {
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, std::io::Error> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                )
            })??;
        Self::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let ctx = ConnectionContext {
            local_addr: stream.local_addr()?,
            peer_addr: stream.peer_addr()?,
            established_wall: WallTime::now(),
        };
        Ok(Self {
            framed: Framed::new(stream, MessageCodec { ctx, consumed: 0 }),
        })
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.framed.codec().ctx
    }

    /// Where the stream currently stands, for error reporting.
    fn read_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.framed.codec().consumed,
            received_wall: WallTime::now(),
        }
    }

    fn write_error(&self, fault: CodecFault) -> Error {
        match fault {
            CodecFault::Io(source) => wrap!(ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            }),
            CodecFault::Garbage(_) => unreachable!("encoding RTSP messages cannot fail"),
        }
    }
}

impl futures::Stream for Connection {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        match self.framed.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg))),
            Poll::Ready(Some(Err(fault))) => {
                let conn_ctx = *self.ctx();
                let msg_ctx = self.read_ctx();
                Poll::Ready(Some(Err(wrap!(match fault {
                    CodecFault::Io(source) => ErrorInt::RtspReadError {
                        conn_ctx,
                        msg_ctx,
                        source,
                    },
                    CodecFault::Garbage(description) => ErrorInt::RtspFramingError {
                        conn_ctx,
                        msg_ctx,
                        description,
                    },
                }))))
            }
        }
    }
}

impl futures::Sink<Message<Bytes>> for Connection {
    type Error = Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        let r = self.framed.poll_ready_unpin(cx);
        r.map_err(|e| self.write_error(e))
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message<Bytes>,
    ) -> Result<(), Self::Error> {
        let r = self.framed.start_send_unpin(item);
        r.map_err(|e| self.write_error(e))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        let r = self.framed.poll_flush_unpin(cx);
        r.map_err(|e| self.write_error(e))
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        let r = self.framed.poll_close_unpin(cx);
        r.map_err(|e| self.write_error(e))
    }
}

struct MessageCodec {
    ctx: ConnectionContext,

    /// Total bytes drained from the read buffer, locating each message within
    /// the stream for error reporting.
    consumed: u64,
}

/// Codec-internal error; widened with connection context by [`Connection`].
#[derive(Debug)]
enum CodecFault {
    Io(std::io::Error),
    Garbage(String),
}

impl From<std::io::Error> for CodecFault {
    fn from(e: std::io::Error) -> Self {
        CodecFault::Io(e)
    }
}

impl tokio_util::codec::Decoder for MessageCodec {
    type Item = ReceivedMessage;
    type Error = CodecFault;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ReceivedMessage>, CodecFault> {
        // Bare CRLF pairs between messages are connection keep-alives; drain
        // them before deciding which framing applies.
        let mut keepalive = 0;
        while src[keepalive..].starts_with(b"\r\n") {
            keepalive += 2;
        }
        if keepalive > 0 {
            src.advance(keepalive);
            self.consumed += keepalive as u64;
        }

        let taken = match src.first() {
            None => None,
            Some(&INTERLEAVED_MARKER) => take_interleaved(src),
            Some(_) => self.take_message(src)?,
        };
        Ok(taken.map(|(len, msg)| {
            let ctx = RtspMessageContext {
                pos: self.consumed,
                received_wall: WallTime::now(),
            };
            self.consumed += len as u64;
            ReceivedMessage { ctx, msg }
        }))
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for MessageCodec {
    type Error = CodecFault;

    fn encode(&mut self, msg: Message<Bytes>, dst: &mut BytesMut) -> Result<(), CodecFault> {
        let mut sink = (&mut *dst).writer();
        msg.write(&mut sink)
            .expect("writing to a memory buffer cannot fail");
        Ok(())
    }
}

/// Frames `$ <channel:u8> <len:u16-be> <payload>`.
fn take_interleaved(src: &mut BytesMut) -> Option<(usize, Message<Bytes>)> {
    if src.len() < 4 {
        return None;
    }
    let channel = src[1];
    let need = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
    if src.len() < need {
        src.reserve(need - src.len());
        return None;
    }
    let payload = src.split_to(need).freeze().slice(4..);
    Some((need, Message::Data(Data::new(channel, payload))))
}

impl MessageCodec {
    fn take_message(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecFault> {
        let (parsed, len): (Message<&[u8]>, usize) = match Message::parse(&src[..]) {
            Ok(ok) => ok,
            Err(rtsp_types::ParseError::Incomplete(_)) => {
                if src.len() > MAX_MESSAGE_LEN {
                    return Err(CodecFault::Garbage(format!(
                        "message still incomplete after {MAX_MESSAGE_LEN} buffered bytes"
                    )));
                }
                return Ok(None);
            }
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecFault::Garbage(format!(
                    "not an RTSP message:\n{:?}",
                    (&src[..src.len().min(ERROR_DUMP_LEN)]).hex_dump()
                )));
            }
        };
        // The parsed message borrows `src`; copy bodies out so the buffer can
        // be advanced. Bodies here are small (SDP or parameter text) and bulk
        // media takes the interleaved path above, which never copies.
        let msg = match parsed {
            Message::Request(r) => Message::Request(r.map_body(copy_body)),
            Message::Response(r) => Message::Response(r.map_body(copy_body)),
            Message::Data(d) => {
                let channel = d.channel_id();
                Message::Data(Data::new(channel, Bytes::copy_from_slice(d.into_body())))
            }
        };
        src.advance(len);
        Ok(Some((len, msg)))
    }
}

fn copy_body(body: &[u8]) -> Bytes {
    Bytes::copy_from_slice(body)
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder;

    use super::*;

    fn codec() -> MessageCodec {
        MessageCodec {
            ctx: ConnectionContext::dummy(),
            consumed: 0,
        }
    }

    #[test]
    fn keepalives_then_data() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04asdfrest"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 0);
                assert_eq!(&d.into_body()[..], b"asdf");
            }
            o => panic!("unexpected message {o:?}"),
        }
        assert_eq!(&buf[..], b"rest");
        // The keep-alive bytes count toward the stream position.
        assert_eq!(codec.consumed, 2 + 8);
    }

    #[test]
    fn partial_data_waits() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"$\x01\x00\x10shorter"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn request_with_body() {
        let mut codec = codec();
        let mut buf =
            BytesMut::from(&b"ANNOUNCE /s RTSP/1.0\r\nCSeq: 2\r\nContent-Length: 3\r\n\r\nsdp"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Request(r) => {
                assert!(matches!(r.method(), rtsp_types::Method::Announce));
                assert_eq!(&r.body()[..], b"sdp");
            }
            o => panic!("unexpected message {o:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_is_an_error() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"\x01\x02\x03\x04 garbage\r\n\r\n"[..]);
        codec.decode(&mut buf).unwrap_err();
    }
}
