//! Wire schema of the bus protocol.
//!
//! Everything on the wire is little-endian; variable-length integers use
//! unsigned LEB128 (7 bits per byte, lowest group first, high bit set on
//! continuation bytes). The two protocol frames, [`Hello`] and [`Header`],
//! are marshalled by [`WireCodec`] so that the transport has a single typed
//! send path for protocol and payload frames alike.

use std::fmt;

use rand::Rng;
use thiserror::Error;

use crate::codec::{AnyMessage, Codec, CodecError};

/// Wire id of the [`Hello`] frame.
pub(crate) const HELLO_ID: MessageId = MessageId(1);
/// Wire id of the [`Header`] frame.
pub(crate) const HEADER_ID: MessageId = MessageId(2);

/// Identity of a peer, generated uniformly at random at process start.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        write!(f, "{}", text)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        write!(f, "{}…{}", &text[..5], &text[(text.len() - 2)..])
    }
}

/// Namespace grouping related message types.
///
/// Derived from the producer's codec type; the protocol itself only ever
/// compares namespaces for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, derive_more::From)]
pub struct Namespace(String);

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Namespace {
    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Per-type numeric message id assigned by a codec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, derive_more::From,
)]
pub struct MessageId(pub u64);

/// Revision counter, monotonically increasing per (sender, descriptor).
pub type Revision = u64;

/// Names a message type: (namespace, message id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageDescriptor {
    /// Namespace of the producing codec.
    pub namespace: Namespace,
    /// Message id within the namespace.
    pub message_id: MessageId,
}

/// Names one revision of a message: descriptor plus revision index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionDescriptor {
    /// The message identity.
    pub message: MessageDescriptor,
    /// Revision index within the identity's history.
    pub index: Revision,
}

/// Frame preceding every replicated payload on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Peer that produced the payload.
    pub sender: PeerId,
    /// Identity and revision of the payload.
    pub revision: RevisionDescriptor,
}

/// One namespace worth of subscription interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRequest {
    /// Namespace the message ids belong to.
    pub namespace: Namespace,
    /// Message ids the peer wishes to receive.
    pub message_ids: Vec<MessageId>,
}

/// First frame exchanged on every connection, in both directions.
///
/// Not versioned: the flags byte and the peer id must keep their wire
/// positions in any future extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Identity of the sending peer.
    pub peer_id: PeerId,
    /// Whether the sender participates in the server mesh.
    pub is_server: bool,
    /// Subscription manifest; empty for servers, which receive everything.
    pub requests: Vec<NamespaceRequest>,
}

/// Failure to parse a received frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The frame ended before the value was complete.
    #[error("unexpected end of frame")]
    UnexpectedEnd,
    /// A varint did not fit into 64 bits.
    #[error("varint longer than 64 bits")]
    VarintOverflow,
    /// A namespace was not valid UTF-8.
    #[error("namespace is not valid utf-8")]
    InvalidNamespace,
    /// A frame carried bytes past the end of its message.
    #[error("trailing bytes after message")]
    TrailingBytes,
}

/// Number of bytes `value` occupies as an unsigned varint.
pub fn uvarint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Writes `value` as an unsigned varint at `*at`, advancing the cursor.
///
/// Panics if the buffer is too small; size with [`uvarint_len`] first.
pub fn put_uvarint(buf: &mut [u8], at: &mut usize, mut value: u64) {
    while value >= 0x80 {
        buf[*at] = (value as u8) | 0x80;
        *at += 1;
        value >>= 7;
    }
    buf[*at] = value as u8;
    *at += 1;
}

/// Reads an unsigned varint at `*at`, advancing the cursor.
pub fn get_uvarint(buf: &[u8], at: &mut usize) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*at).ok_or(DecodeError::UnexpectedEnd)?;
        *at += 1;
        if shift == 63 && byte > 1 {
            return Err(DecodeError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(DecodeError::VarintOverflow);
        }
    }
}

fn get_bytes<'a>(buf: &'a [u8], at: &mut usize, len: usize) -> Result<&'a [u8], DecodeError> {
    let end = at.checked_add(len).ok_or(DecodeError::UnexpectedEnd)?;
    let bytes = buf.get(*at..end).ok_or(DecodeError::UnexpectedEnd)?;
    *at = end;
    Ok(bytes)
}

fn namespace_len(namespace: &Namespace) -> usize {
    let len = namespace.as_bytes().len();
    uvarint_len(len as u64) + len
}

fn put_namespace(buf: &mut [u8], at: &mut usize, namespace: &Namespace) {
    let bytes = namespace.as_bytes();
    put_uvarint(buf, at, bytes.len() as u64);
    buf[*at..*at + bytes.len()].copy_from_slice(bytes);
    *at += bytes.len();
}

fn get_namespace(buf: &[u8], at: &mut usize) -> Result<Namespace, DecodeError> {
    let len = get_uvarint(buf, at)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::UnexpectedEnd)?;
    let bytes = get_bytes(buf, at, len)?;
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidNamespace)?;
    Ok(Namespace::from(text))
}

fn get_peer_id(buf: &[u8], at: &mut usize) -> Result<PeerId, DecodeError> {
    let bytes = get_bytes(buf, at, 32)?;
    let mut id = [0u8; 32];
    id.copy_from_slice(bytes);
    Ok(PeerId(id))
}

impl MessageDescriptor {
    fn encoded_len(&self) -> usize {
        namespace_len(&self.namespace) + uvarint_len(self.message_id.0)
    }

    fn encode(&self, buf: &mut [u8], at: &mut usize) {
        put_namespace(buf, at, &self.namespace);
        put_uvarint(buf, at, self.message_id.0);
    }

    fn decode(buf: &[u8], at: &mut usize) -> Result<Self, DecodeError> {
        let namespace = get_namespace(buf, at)?;
        let message_id = MessageId(get_uvarint(buf, at)?);
        Ok(Self {
            namespace,
            message_id,
        })
    }
}

impl Header {
    fn encoded_len(&self) -> usize {
        32 + self.revision.message.encoded_len() + uvarint_len(self.revision.index)
    }

    fn encode(&self, buf: &mut [u8], at: &mut usize) {
        buf[*at..*at + 32].copy_from_slice(&self.sender.0);
        *at += 32;
        self.revision.message.encode(buf, at);
        put_uvarint(buf, at, self.revision.index);
    }

    fn decode(buf: &[u8], at: &mut usize) -> Result<Self, DecodeError> {
        let sender = get_peer_id(buf, at)?;
        let message = MessageDescriptor::decode(buf, at)?;
        let index = get_uvarint(buf, at)?;
        Ok(Self {
            sender,
            revision: RevisionDescriptor { message, index },
        })
    }
}

impl Hello {
    fn encoded_len(&self) -> usize {
        let mut len = 1 + 32 + uvarint_len(self.requests.len() as u64);
        for request in &self.requests {
            len += namespace_len(&request.namespace);
            len += uvarint_len(request.message_ids.len() as u64);
            for id in &request.message_ids {
                len += uvarint_len(id.0);
            }
        }
        len
    }

    fn encode(&self, buf: &mut [u8], at: &mut usize) {
        // Byte 0 is the flags byte; bit 0 carries the server role.
        buf[*at] = u8::from(self.is_server);
        *at += 1;
        buf[*at..*at + 32].copy_from_slice(&self.peer_id.0);
        *at += 32;
        put_uvarint(buf, at, self.requests.len() as u64);
        for request in &self.requests {
            put_namespace(buf, at, &request.namespace);
            put_uvarint(buf, at, request.message_ids.len() as u64);
            for id in &request.message_ids {
                put_uvarint(buf, at, id.0);
            }
        }
    }

    fn decode(buf: &[u8], at: &mut usize) -> Result<Self, DecodeError> {
        let flags = *buf.get(*at).ok_or(DecodeError::UnexpectedEnd)?;
        *at += 1;
        let peer_id = get_peer_id(buf, at)?;
        let count = get_uvarint(buf, at)?;
        let mut requests = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let namespace = get_namespace(buf, at)?;
            let id_count = get_uvarint(buf, at)?;
            let mut message_ids = Vec::with_capacity(id_count.min(64) as usize);
            for _ in 0..id_count {
                message_ids.push(MessageId(get_uvarint(buf, at)?));
            }
            requests.push(NamespaceRequest {
                namespace,
                message_ids,
            });
        }
        Ok(Self {
            peer_id,
            is_server: flags & 0x01 != 0,
            requests,
        })
    }
}

/// Marshaller for the protocol frames.
///
/// [`Hello`] and [`Header`] travel through the same typed-frame path as
/// application payloads, so the marshaller implements [`Codec`] like any
/// producer codec does.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl Codec for WireCodec {
    fn id(&self, message: &(dyn std::any::Any + Send + Sync)) -> Result<MessageId, CodecError> {
        if message.is::<Hello>() {
            Ok(HELLO_ID)
        } else if message.is::<Header>() {
            Ok(HEADER_ID)
        } else {
            Err(CodecError::UnsupportedMessage)
        }
    }

    fn size(&self, message: &(dyn std::any::Any + Send + Sync)) -> Result<u64, CodecError> {
        if let Some(hello) = message.downcast_ref::<Hello>() {
            Ok(hello.encoded_len() as u64)
        } else if let Some(header) = message.downcast_ref::<Header>() {
            Ok(header.encoded_len() as u64)
        } else {
            Err(CodecError::UnsupportedMessage)
        }
    }

    fn marshal(
        &self,
        message: &(dyn std::any::Any + Send + Sync),
        buf: &mut [u8],
    ) -> Result<(MessageId, usize), CodecError> {
        let mut at = 0;
        if let Some(hello) = message.downcast_ref::<Hello>() {
            if buf.len() < hello.encoded_len() {
                return Err(CodecError::BufferTooSmall);
            }
            hello.encode(buf, &mut at);
            Ok((HELLO_ID, at))
        } else if let Some(header) = message.downcast_ref::<Header>() {
            if buf.len() < header.encoded_len() {
                return Err(CodecError::BufferTooSmall);
            }
            header.encode(buf, &mut at);
            Ok((HEADER_ID, at))
        } else {
            Err(CodecError::UnsupportedMessage)
        }
    }

    fn unmarshal(&self, id: MessageId, buf: &[u8]) -> Result<(AnyMessage, usize), CodecError> {
        let mut at = 0;
        match id {
            HELLO_ID => {
                let hello = Hello::decode(buf, &mut at)?;
                Ok((Box::new(hello), at))
            }
            HEADER_ID => {
                let header = Header::decode(buf, &mut at)?;
                Ok((Box::new(header), at))
            }
            _ => Err(CodecError::UnknownMessageId(id)),
        }
    }
}
