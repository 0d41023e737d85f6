//! Replicated revision state and per-connection fan-out queues.
//!
//! Both node roles keep a catalog of the latest revision per key and a
//! registry of live outbound queues, one per connection. Attach, detach and
//! broadcast all run under one exclusive lock over the combined state; the
//! lock is what makes the backlog snapshot atomic with respect to subsequent
//! broadcasts, so a newly attached peer can never miss an update nor receive
//! one twice.
//!
//! Queue sends happen while the lock is held, so a full queue stalls every
//! writer until its consumer drains. Queues are sized to keep steady state
//! off that path: the attach snapshot always fits, plus [`QUEUE_CAPACITY`]
//! slots of slack for live broadcasts.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::codec::{AnyMessage, Codec};
use crate::proto::{Header, MessageDescriptor, PeerId, Revision, RevisionDescriptor};
use crate::{Error, Result};

/// Steady-state slack of every per-connection queue.
pub(crate) const QUEUE_CAPACITY: usize = 10;

/// Identifies one attach; detach only removes the queue it created.
pub(crate) type QueueId = u64;

/// Identity under which deduplication and overwrite happen.
///
/// The sender is part of the key: two producers publishing the same
/// descriptor are two independent replicated registers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RevisionKey {
    pub(crate) message: MessageDescriptor,
    pub(crate) sender: PeerId,
}

impl RevisionKey {
    fn of(header: &Header) -> Self {
        Self {
            message: header.revision.message.clone(),
            sender: header.sender,
        }
    }
}

/// A replicated payload as servers hold it: header plus opaque bytes.
#[derive(Debug, Clone)]
pub(crate) struct ServerEntry {
    pub(crate) header: Header,
    pub(crate) payload: Bytes,
}

struct ServerQueue {
    id: QueueId,
    tx: mpsc::Sender<ServerEntry>,
}

#[derive(Default)]
struct ServerInner {
    next_queue: QueueId,
    queues: HashMap<PeerId, ServerQueue>,
    catalog: HashMap<RevisionKey, ServerEntry>,
}

/// Server-side catalog of latest revisions plus the connection registry.
#[derive(Default)]
pub(crate) struct RevisionStore {
    inner: Mutex<ServerInner>,
}

impl RevisionStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Binds a fresh queue to `remote`, seeded with the current catalog.
    ///
    /// A prior queue for the same peer is closed and replaced; frames still
    /// queued on it are discarded, which is safe because the new queue
    /// starts from the full snapshot.
    pub(crate) async fn attach(&self, remote: PeerId) -> (QueueId, mpsc::Receiver<ServerEntry>) {
        let mut inner = self.inner.lock().await;
        inner.next_queue += 1;
        let id = inner.next_queue;
        let (tx, rx) = mpsc::channel(inner.catalog.len() + QUEUE_CAPACITY);
        for entry in inner.catalog.values() {
            tx.send(entry.clone()).await.ok();
        }
        inner.queues.insert(remote, ServerQueue { id, tx });
        (id, rx)
    }

    /// Removes the binding for `remote`, but only if `queue` still names the
    /// live queue; a detach from a superseded connection is a no-op.
    pub(crate) async fn detach(&self, remote: PeerId, queue: QueueId) {
        let mut inner = self.inner.lock().await;
        if inner.queues.get(&remote).is_some_and(|q| q.id == queue) {
            inner.queues.remove(&remote);
        }
    }

    /// Accepts `entry` if it advances its key, then fans it out to every
    /// live queue. Revisions at or below the stored index are dropped.
    pub(crate) async fn broadcast(&self, entry: ServerEntry) {
        let mut inner = self.inner.lock().await;
        let key = RevisionKey::of(&entry.header);
        if let Some(existing) = inner.catalog.get(&key) {
            if existing.header.revision.index >= entry.header.revision.index {
                return;
            }
        }
        inner.catalog.insert(key, entry.clone());
        for queue in inner.queues.values() {
            // A send fails only when the consumer is gone but not yet
            // detached; the frame is superfluous then.
            queue.tx.send(entry.clone()).await.ok();
        }
    }
}

/// A message a client produced, kept for re-sending to late connections.
#[derive(Clone)]
pub(crate) struct ClientEntry {
    pub(crate) header: Header,
    pub(crate) message: Arc<dyn Any + Send + Sync>,
    pub(crate) codec: Arc<dyn Codec>,
}

struct ClientInner {
    next_queue: QueueId,
    queues: HashMap<QueueId, mpsc::Sender<ClientEntry>>,
    outbound: HashMap<MessageDescriptor, ClientEntry>,
    delivered: HashMap<RevisionKey, Revision>,
    recv_tx: Option<mpsc::Sender<AnyMessage>>,
}

/// Client-side state: own publishes, inbound dedup, connection registry.
pub(crate) struct ClientStore {
    id: PeerId,
    inner: Mutex<ClientInner>,
}

impl ClientStore {
    pub(crate) fn new(id: PeerId, recv_tx: mpsc::Sender<AnyMessage>) -> Self {
        Self {
            id,
            inner: Mutex::new(ClientInner {
                next_queue: 0,
                queues: HashMap::new(),
                outbound: HashMap::new(),
                delivered: HashMap::new(),
                recv_tx: Some(recv_tx),
            }),
        }
    }

    pub(crate) fn peer_id(&self) -> PeerId {
        self.id
    }

    /// Records a new revision of a message this client produces and enqueues
    /// it on every live connection.
    ///
    /// The revision index is per descriptor and advances on every publish,
    /// whether or not the payload changed.
    pub(crate) async fn publish(&self, message: AnyMessage, codec: Arc<dyn Codec>) -> Result<()> {
        let message: Arc<dyn Any + Send + Sync> = Arc::from(message);
        let mut inner = self.inner.lock().await;

        let message_id = codec.id(message.as_ref())?;
        let descriptor = MessageDescriptor {
            namespace: codec.namespace(),
            message_id,
        };
        let index = match inner.outbound.get(&descriptor) {
            Some(previous) => previous.header.revision.index + 1,
            None => 0,
        };
        let entry = ClientEntry {
            header: Header {
                sender: self.id,
                revision: RevisionDescriptor {
                    message: descriptor.clone(),
                    index,
                },
            },
            message,
            codec,
        };
        inner.outbound.insert(descriptor, entry.clone());
        for tx in inner.queues.values() {
            tx.send(entry.clone()).await.ok();
        }
        Ok(())
    }

    /// Registers a fresh queue, seeded with everything published so far.
    pub(crate) async fn attach(&self) -> (QueueId, mpsc::Receiver<ClientEntry>) {
        let mut inner = self.inner.lock().await;
        inner.next_queue += 1;
        let id = inner.next_queue;
        let (tx, rx) = mpsc::channel(inner.outbound.len() + QUEUE_CAPACITY);
        for entry in inner.outbound.values() {
            tx.send(entry.clone()).await.ok();
        }
        inner.queues.insert(id, tx);
        (id, rx)
    }

    pub(crate) async fn detach(&self, queue: QueueId) {
        let mut inner = self.inner.lock().await;
        inner.queues.remove(&queue);
    }

    /// Forwards a received message to the application unless an equal or
    /// newer revision of its key was already delivered.
    ///
    /// Blocks when the application is slow; `cancel` bounds the wait. A
    /// closed receive channel also surfaces as [`Error::Cancelled`], tearing
    /// down the delivering connection.
    pub(crate) async fn deliver(
        &self,
        cancel: &CancellationToken,
        header: &Header,
        message: AnyMessage,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = RevisionKey::of(header);
        if let Some(seen) = inner.delivered.get(&key) {
            if *seen >= header.revision.index {
                return Ok(());
            }
        }
        inner.delivered.insert(key, header.revision.index);

        let Some(tx) = inner.recv_tx.as_ref() else {
            return Err(Error::Cancelled);
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = tx.send(message) => sent.map_err(|_| Error::Cancelled),
        }
    }

    /// Drops the application channel sender; the receive side observes end
    /// of stream once drained.
    pub(crate) async fn close_receiver(&self) {
        let mut inner = self.inner.lock().await;
        inner.recv_tx = None;
    }
}
