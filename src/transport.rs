//! Length-framed connection between two peers.
//!
//! Frames come in two shapes on the same stream:
//!
//! - *typed*: `uvarint len | uvarint message-id | body`, with `len` covering
//!   id and body, encoded and decoded through a [`Codec`];
//! - *raw*: `uvarint len | bytes`.
//!
//! The raw bytes of a received typed frame are exactly `message-id | body`,
//! so a peer can pass a typed frame along without decoding it. That is how
//! servers replicate payloads they cannot interpret.
//!
//! The framing works over any reliable ordered byte stream; production peers
//! run it over TCP, tests over in-memory duplex pipes.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{
    split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use crate::codec::{AnyMessage, Codec, CodecError};
use crate::proto::{put_uvarint, uvarint_len, DecodeError, MessageId};
use crate::{Error, Result};

/// A full-duplex framed connection.
///
/// Used directly during the handshake; afterwards [`Connection::split`]
/// hands one half to each of the two connection-loop tasks.
#[derive(Debug)]
pub struct Connection<S> {
    send: SendHalf<S>,
    recv: RecvHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wraps `stream` with framing, bounding frames at `max_message_size`.
    pub fn new(stream: S, max_message_size: u64) -> Self {
        let (reader, writer) = split(stream);
        Self {
            send: SendHalf {
                writer,
                buf: BytesMut::new(),
                max_message_size,
            },
            recv: RecvHalf {
                reader: BufReader::new(reader),
                max_message_size,
            },
        }
    }

    /// Splits into independently owned send and receive halves.
    pub fn split(self) -> (SendHalf<S>, RecvHalf<S>) {
        (self.send, self.recv)
    }

    /// Sends `message` as a typed frame.
    pub async fn send_typed(&mut self, message: &(dyn std::any::Any + Send + Sync), codec: &dyn Codec) -> Result<()> {
        self.send.send_typed(message, codec).await
    }

    /// Receives the next typed frame; `None` on clean end of stream.
    pub async fn receive_typed(&mut self, codec: &dyn Codec) -> Result<Option<AnyMessage>> {
        self.recv.receive_typed(codec).await
    }
}

/// Write side of a [`Connection`].
#[derive(Debug)]
pub struct SendHalf<S> {
    writer: WriteHalf<S>,
    buf: BytesMut,
    max_message_size: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SendHalf<S> {
    /// Encodes `message` with `codec` and sends it as a typed frame.
    pub async fn send_typed(&mut self, message: &(dyn std::any::Any + Send + Sync), codec: &dyn Codec) -> Result<()> {
        let id = codec.id(message)?;
        let size = codec.size(message)?;
        let content_len = uvarint_len(id.0) as u64 + size;
        if content_len > self.max_message_size {
            return Err(Error::FrameTooLarge {
                size: content_len,
                limit: self.max_message_size,
            });
        }

        let total = uvarint_len(content_len) + content_len as usize;
        self.buf.clear();
        self.buf.resize(total, 0);
        let mut at = 0;
        put_uvarint(&mut self.buf, &mut at, content_len);
        put_uvarint(&mut self.buf, &mut at, id.0);
        let (_, written) = codec.marshal(message, &mut self.buf[at..])?;
        if written as u64 != size {
            return Err(CodecError::SizeMismatch {
                expected: size,
                actual: written as u64,
            }
            .into());
        }

        self.writer.write_all(&self.buf).await?;
        Ok(())
    }

    /// Sends `payload` as a raw frame.
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<()> {
        let len = payload.len() as u64;
        if len > self.max_message_size {
            return Err(Error::FrameTooLarge {
                size: len,
                limit: self.max_message_size,
            });
        }

        let mut prefix = [0u8; 10];
        let mut at = 0;
        put_uvarint(&mut prefix, &mut at, len);
        self.buf.clear();
        self.buf.reserve(at + payload.len());
        self.buf.extend_from_slice(&prefix[..at]);
        self.buf.extend_from_slice(payload);
        self.writer.write_all(&self.buf).await?;
        Ok(())
    }

    /// Shuts the write side down, signalling end of stream to the peer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Read side of a [`Connection`].
#[derive(Debug)]
pub struct RecvHalf<S> {
    reader: BufReader<ReadHalf<S>>,
    max_message_size: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RecvHalf<S> {
    /// Receives and decodes the next typed frame.
    ///
    /// Returns `None` when the stream ends at a frame boundary; end of
    /// stream inside a frame is an error.
    pub async fn receive_typed(&mut self, codec: &dyn Codec) -> Result<Option<AnyMessage>> {
        let Some(frame) = self.receive_frame().await? else {
            return Ok(None);
        };
        let mut at = 0;
        let id = crate::proto::get_uvarint(&frame, &mut at)?;
        let (message, consumed) = codec.unmarshal(MessageId(id), &frame[at..])?;
        if at + consumed != frame.len() {
            return Err(DecodeError::TrailingBytes.into());
        }
        Ok(Some(message))
    }

    /// Receives the next frame as opaque bytes.
    ///
    /// Unlike [`RecvHalf::receive_typed`], end of stream is always an error:
    /// raw frames are only ever read in the middle of a logical record.
    pub async fn receive_raw(&mut self) -> Result<Bytes> {
        match self.receive_frame().await? {
            Some(frame) => Ok(frame),
            None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        }
    }

    async fn receive_frame(&mut self) -> Result<Option<Bytes>> {
        let Some(len) = self.read_uvarint().await? else {
            return Ok(None);
        };
        if len > self.max_message_size {
            return Err(Error::FrameTooLarge {
                size: len,
                limit: self.max_message_size,
            });
        }
        let len = len as usize;
        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf.freeze()))
    }

    /// Reads a varint from the stream; `None` if the stream ended before the
    /// first byte.
    async fn read_uvarint(&mut self) -> Result<Option<u64>> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = match self.reader.read_u8().await {
                Ok(byte) => byte,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && shift == 0 => {
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };
            if shift == 63 && byte > 1 {
                return Err(DecodeError::VarintOverflow.into());
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow.into());
            }
        }
    }
}
