//! Last-writer-wins, topic-filtered message bus over a mesh of peers.
//!
//! A process joins the bus either as a *server* (accepts inbound connections
//! and replicates the full catalog with every other server) or as a *client*
//! (dials one or more servers and subscribes to selected message types).
//! Producers publish messages identified by a (namespace, message id) pair;
//! every publish advances a per-identity revision index. The bus guarantees
//! that each subscriber eventually observes the latest revision of every
//! identity covered by its subscription, no matter in which order peers
//! connect, disconnect, or reconnect.
//!
//! Run a server with [`run_server`], attach subscribers with [`Client`].
//! Message payloads are opaque to servers; clients encode and decode them
//! through the [`Codec`] capability.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod codec;
pub mod net;
pub mod proto;
mod store;
pub mod transport;

pub use codec::{AnyMessage, Codec, CodecError};
pub use net::{run_server, Client, ClientConfig, RequestConfig, ServerConfig};
pub use proto::{MessageDescriptor, MessageId, Namespace, PeerId, Revision};

/// Errors surfaced by the bus core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport-level I/O failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A received frame did not parse as the expected wire schema.
    #[error("decode: {0}")]
    Decode(#[from] proto::DecodeError),
    /// A codec failed to encode or decode a payload.
    #[error("codec: {0}")]
    Codec(#[from] codec::CodecError),
    /// A frame exceeded the configured maximum message size.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Observed frame size in bytes.
        size: u64,
        /// Configured maximum message size.
        limit: u64,
    },
    /// The remote peer violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// A client received a header for a namespace it never subscribed to.
    #[error("no codec registered for namespace {0}")]
    UnknownNamespace(Namespace),
    /// The handshake revealed our own peer id on the other end.
    #[error("connected to myself")]
    SelfLoop,
    /// The surrounding operation was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// A client was configured without any server address.
    #[error("no servers configured")]
    NoServers,
}

/// Result alias for bus operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
