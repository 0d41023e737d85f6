//! Message codec capability consumed by the bus core.
//!
//! A codec owns a closed set of message types: it assigns each type a stable
//! numeric id and converts values to and from bytes. Servers never invoke a
//! payload codec (they replicate opaque bytes); clients use the codec both to
//! encode their own publishes and to decode what arrives for them.

use std::any::Any;

use thiserror::Error;

use crate::proto::{DecodeError, MessageId, Namespace};

/// A decoded message value with its concrete type erased.
pub type AnyMessage = Box<dyn Any + Send + Sync>;

/// Encodes and decodes a family of message types.
///
/// The codec's *namespace identity* is derived from its concrete type: two
/// codecs of the same type yield the same namespace, two of different types
/// yield different namespaces. Producer and subscriber must therefore use the
/// same codec type for the message family to interoperate.
pub trait Codec: Send + Sync + 'static {
    /// Returns the stable per-type id of `message`.
    fn id(&self, message: &(dyn Any + Send + Sync)) -> Result<MessageId, CodecError>;

    /// Returns the serialized size of `message` in bytes.
    fn size(&self, message: &(dyn Any + Send + Sync)) -> Result<u64, CodecError>;

    /// Encodes `message` into `buf`, returning its id and the encoded size.
    ///
    /// `buf` is at least [`Codec::size`] bytes long.
    fn marshal(&self, message: &(dyn Any + Send + Sync), buf: &mut [u8]) -> Result<(MessageId, usize), CodecError>;

    /// Decodes the message identified by `id` from `buf`, returning the value
    /// and the number of bytes consumed.
    fn unmarshal(&self, id: MessageId, buf: &[u8]) -> Result<(AnyMessage, usize), CodecError>;

    /// The namespace identity of this codec.
    fn namespace(&self) -> Namespace {
        Namespace::from(std::any::type_name_of_val(self))
    }
}

/// Failure inside a codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message value is of a type this codec does not own.
    #[error("message type is not supported by this codec")]
    UnsupportedMessage,
    /// The wire id does not name a type this codec owns.
    #[error("unknown message id {0}")]
    UnknownMessageId(MessageId),
    /// The encode buffer cannot hold the serialized message.
    #[error("encode buffer is too small")]
    BufferTooSmall,
    /// The codec encoded a different number of bytes than it sized.
    #[error("codec wrote {actual} bytes after sizing {expected}")]
    SizeMismatch {
        /// Size reported up front.
        expected: u64,
        /// Bytes actually written.
        actual: u64,
    },
    /// The bytes did not parse as the identified message type.
    #[error(transparent)]
    Malformed(#[from] DecodeError),
}
