//! Networking for the bus: handshake, connection loops, mesh supervisor.
//!
//! Every connection starts with a [`Hello`] exchange in both directions.
//! Afterwards two futures share the transport: a receiver that feeds
//! inbound frames into the local store, and a sender that drains the
//! connection's queue, applying the remote's subscription filter on
//! client links. Either side finishing tears the whole connection down;
//! the dialer that owns it reconnects after a short pause.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, warn, Instrument};

use crate::codec::{AnyMessage, Codec};
use crate::proto::{
    Header, Hello, MessageDescriptor, Namespace, NamespaceRequest, PeerId, WireCodec,
};
use crate::store::{ClientEntry, ClientStore, RevisionStore, ServerEntry};
use crate::transport::{Connection, RecvHalf, SendHalf};
use crate::{Error, Result};

/// Capacity of the application receive channel handed out by [`Client::new`].
const RECEIVE_CHANNEL_CAPACITY: usize = 10;
/// Pause between reconnect attempts of a dialer.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// What the handshake tells us about the other end.
struct RemotePeer {
    id: PeerId,
    is_server: bool,
    filter: SubscriptionFilter,
}

/// Descriptor-level filter built from the remote's manifest.
#[derive(Debug, Default)]
struct SubscriptionFilter(HashSet<MessageDescriptor>);

impl SubscriptionFilter {
    fn from_requests(requests: &[NamespaceRequest]) -> Self {
        let mut descriptors = HashSet::new();
        for request in requests {
            for id in &request.message_ids {
                descriptors.insert(MessageDescriptor {
                    namespace: request.namespace.clone(),
                    message_id: *id,
                });
            }
        }
        Self(descriptors)
    }

    fn contains(&self, descriptor: &MessageDescriptor) -> bool {
        self.0.contains(descriptor)
    }
}

/// Sends our hello, receives the peer's, and builds its filter set.
async fn handshake<S>(conn: &mut Connection<S>, hello: &Hello) -> Result<RemotePeer>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send_typed(hello, &WireCodec).await?;
    let frame = conn
        .receive_typed(&WireCodec)
        .await?
        .ok_or(Error::Protocol("connection closed during handshake"))?;
    let remote = frame
        .downcast::<Hello>()
        .map_err(|_| Error::Protocol("hello frame expected"))?;
    Ok(RemotePeer {
        id: remote.peer_id,
        is_server: remote.is_server,
        filter: SubscriptionFilter::from_requests(&remote.requests),
    })
}

/// Folds the two halves of a connection loop into one outcome.
///
/// A half that was merely cancelled by the other half's teardown does not
/// mask a clean shutdown.
fn connection_result(receiver: Result<()>, sender: Result<()>) -> Result<()> {
    match (receiver, sender) {
        (Ok(()), Err(Error::Cancelled)) | (Err(Error::Cancelled), Ok(())) => Ok(()),
        (Err(err), _) if !matches!(err, Error::Cancelled) => Err(err),
        (_, Err(err)) => Err(err),
        (receiver, Ok(())) => receiver,
    }
}

/// Waits for supervised tasks; the first real error cancels the rest.
async fn supervise(cancel: &CancellationToken, mut tasks: JoinSet<Result<()>>) -> Result<()> {
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Ok(()),
        };
        if let Err(err) = result {
            if first_error.is_none() && !matches!(err, Error::Cancelled) {
                cancel.cancel();
                first_error = Some(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Addresses of every server in the mesh; may harmlessly include our
    /// own (the handshake discards the self-dial).
    pub servers: Vec<String>,
    /// Upper bound on a single frame, send and receive.
    pub max_message_size: u64,
}

struct ServerShared {
    id: PeerId,
    max_message_size: u64,
    store: RevisionStore,
}

/// Runs a server node until `cancel` fires or the listener fails.
///
/// The server accepts subscribing clients and joins the mesh by dialing
/// every configured peer address. Payloads pass through undecoded; the
/// server never needs a codec.
pub async fn run_server(
    cancel: CancellationToken,
    listener: TcpListener,
    config: ServerConfig,
) -> Result<()> {
    let shared = Arc::new(ServerShared {
        id: PeerId::generate(),
        max_message_size: config.max_message_size,
        store: RevisionStore::new(),
    });
    let span = error_span!("server", me = ?shared.id);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(
        accept_loop(cancel.clone(), listener, shared.clone()).instrument(span.clone()),
    );
    for addr in config.servers {
        let dial_span = error_span!(parent: &span, "dial", %addr);
        tasks.spawn(mesh_dialer(cancel.clone(), addr, shared.clone()).instrument(dial_span));
    }
    supervise(&cancel, tasks).await
}

async fn accept_loop(
    cancel: CancellationToken,
    listener: TcpListener,
    shared: Arc<ServerShared>,
) -> Result<()> {
    let mut conns: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                debug!(%addr, "inbound connection");
                let cancel = cancel.clone();
                let shared = shared.clone();
                conns.spawn(
                    async move {
                        let conn = Connection::new(stream, shared.max_message_size);
                        match run_server_connection(cancel, conn, shared).await {
                            Ok(()) => debug!("connection closed"),
                            Err(err) => debug!(%err, "connection failed"),
                        }
                    }
                    .instrument(error_span!("conn", %addr)),
                );
            }
            finished = conns.join_next(), if !conns.is_empty() => {
                if let Some(Err(err)) = finished {
                    warn!(%err, "connection task failed");
                }
            }
        }
    }
    while conns.join_next().await.is_some() {}
    Ok(())
}

async fn mesh_dialer(
    cancel: CancellationToken,
    addr: String,
    shared: Arc<ServerShared>,
) -> Result<()> {
    loop {
        let result = dial_and_run_server(&cancel, &addr, &shared).await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        match result {
            Err(Error::SelfLoop) => {
                debug!("dialed myself, giving up on this address");
                return Ok(());
            }
            Err(err) => warn!(%err, "mesh connection failed"),
            Ok(()) => debug!("mesh connection closed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn dial_and_run_server(
    cancel: &CancellationToken,
    addr: &str,
    shared: &Arc<ServerShared>,
) -> Result<()> {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        stream = TcpStream::connect(addr) => stream?,
    };
    let conn = Connection::new(stream, shared.max_message_size);
    run_server_connection(cancel.clone(), conn, shared.clone()).await
}

/// Runs one mesh or client link in server role, from handshake to teardown.
async fn run_server_connection<S>(
    cancel: CancellationToken,
    mut conn: Connection<S>,
    shared: Arc<ServerShared>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Hello {
        peer_id: shared.id,
        is_server: true,
        requests: Vec::new(),
    };
    let remote = handshake(&mut conn, &hello).await?;
    if remote.id == shared.id {
        return Err(Error::SelfLoop);
    }
    debug!(peer = ?remote.id, is_server = remote.is_server, "handshake complete");

    let (queue, queue_rx) = shared.store.attach(remote.id).await;
    let remote_id = remote.id;
    let (send, recv) = conn.split();
    let token = cancel.child_token();
    let (receiver, sender) = tokio::join!(
        server_receiver(token.clone(), recv, &shared.store),
        server_sender(token, send, queue_rx, remote),
    );
    shared.store.detach(remote_id, queue).await;
    connection_result(receiver, sender)
}

async fn server_receiver<S>(
    token: CancellationToken,
    mut recv: RecvHalf<S>,
    store: &RevisionStore,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _teardown = token.clone().drop_guard();
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            frame = recv.receive_typed(&WireCodec) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let header = frame
            .downcast::<Header>()
            .map_err(|_| Error::Protocol("header frame expected"))?;
        let payload = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            payload = recv.receive_raw() => payload?,
        };
        store
            .broadcast(ServerEntry {
                header: *header,
                payload,
            })
            .await;
    }
}

async fn server_sender<S>(
    token: CancellationToken,
    mut send: SendHalf<S>,
    mut queue: mpsc::Receiver<ServerEntry>,
    remote: RemotePeer,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _teardown = token.clone().drop_guard();
    let result = loop {
        let entry = tokio::select! {
            _ = token.cancelled() => break Err(Error::Cancelled),
            entry = queue.recv() => match entry {
                Some(entry) => entry,
                None => break Ok(()),
            },
        };
        // Mesh links replicate everything; client links only what was asked.
        if !remote.is_server && !remote.filter.contains(&entry.header.revision.message) {
            continue;
        }
        if let Err(err) = send_server_entry(&mut send, &entry).await {
            break Err(err);
        }
    };
    send.shutdown().await.ok();
    result
}

async fn send_server_entry<S>(send: &mut SendHalf<S>, entry: &ServerEntry) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send.send_typed(&entry.header, &WireCodec).await?;
    send.send_raw(&entry.payload).await
}

/// Client configuration.
pub struct ClientConfig {
    /// Servers to stay connected to.
    pub servers: Vec<String>,
    /// Upper bound on a single frame, send and receive.
    pub max_message_size: u64,
    /// Message types this client wants delivered.
    pub requests: Vec<RequestConfig>,
}

/// One codec's worth of subscription interest.
pub struct RequestConfig {
    /// Codec owning the requested message types.
    pub codec: Arc<dyn Codec>,
    /// Sample values of the message types to subscribe to; only their type
    /// ids matter.
    pub messages: Vec<AnyMessage>,
}

struct ClientShared {
    max_message_size: u64,
    requests: Vec<NamespaceRequest>,
    codecs: HashMap<Namespace, Arc<dyn Codec>>,
    store: ClientStore,
}

/// A subscribing, publishing peer.
///
/// Created with [`Client::new`] together with the receive channel carrying
/// everything the subscription matches. Cheap to clone; clones share the
/// same identity and state.
#[derive(Clone)]
pub struct Client {
    servers: Vec<String>,
    shared: Arc<ClientShared>,
}

impl Client {
    /// Builds a client from its configuration.
    ///
    /// Returns the client and the application receive channel. The channel
    /// closes exactly when [`Client::run`] returns.
    pub fn new(config: ClientConfig) -> Result<(Self, mpsc::Receiver<AnyMessage>)> {
        if config.servers.is_empty() {
            return Err(Error::NoServers);
        }
        let id = PeerId::generate();

        let mut codecs: HashMap<Namespace, Arc<dyn Codec>> = HashMap::new();
        let mut requests = Vec::with_capacity(config.requests.len());
        for request in &config.requests {
            let namespace = request.codec.namespace();
            codecs
                .entry(namespace.clone())
                .or_insert_with(|| request.codec.clone());
            let mut message_ids = Vec::with_capacity(request.messages.len());
            for sample in &request.messages {
                message_ids.push(request.codec.id(sample.as_ref())?);
            }
            requests.push(NamespaceRequest {
                namespace,
                message_ids,
            });
        }

        let (recv_tx, recv_rx) = mpsc::channel(RECEIVE_CHANNEL_CAPACITY);
        let shared = Arc::new(ClientShared {
            max_message_size: config.max_message_size,
            requests,
            codecs,
            store: ClientStore::new(id, recv_tx),
        });
        Ok((
            Self {
                servers: config.servers,
                shared,
            },
            recv_rx,
        ))
    }

    /// Maintains connections to all configured servers until `cancel` fires.
    ///
    /// Call once; the receive channel closes when this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let span = error_span!("client", me = ?self.shared.store.peer_id());
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for addr in &self.servers {
            let dial_span = error_span!(parent: &span, "dial", %addr);
            tasks.spawn(
                client_dialer(cancel.clone(), addr.clone(), self.shared.clone())
                    .instrument(dial_span),
            );
        }
        let result = supervise(&cancel, tasks).await;
        self.shared.store.close_receiver().await;
        result
    }

    /// Publishes a new revision of `message` to every connected server.
    ///
    /// Each publish advances the revision index of the message's descriptor,
    /// even when the payload is unchanged.
    pub async fn publish<M: Any + Send + Sync>(
        &self,
        message: M,
        codec: Arc<dyn Codec>,
    ) -> Result<()> {
        self.shared.store.publish(Box::new(message), codec).await
    }
}

async fn client_dialer(
    cancel: CancellationToken,
    addr: String,
    shared: Arc<ClientShared>,
) -> Result<()> {
    loop {
        let result = dial_and_run_client(&cancel, &addr, &shared).await;
        if cancel.is_cancelled() {
            return Ok(());
        }
        match result {
            Err(err) => warn!(%err, "connection failed"),
            Ok(()) => debug!("connection closed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn dial_and_run_client(
    cancel: &CancellationToken,
    addr: &str,
    shared: &Arc<ClientShared>,
) -> Result<()> {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        stream = TcpStream::connect(addr) => stream?,
    };
    let conn = Connection::new(stream, shared.max_message_size);
    run_client_connection(cancel.clone(), conn, shared).await
}

async fn run_client_connection<S>(
    cancel: CancellationToken,
    mut conn: Connection<S>,
    shared: &ClientShared,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Hello {
        peer_id: shared.store.peer_id(),
        is_server: false,
        requests: shared.requests.clone(),
    };
    handshake(&mut conn, &hello).await?;
    debug!("handshake complete");

    let (queue, queue_rx) = shared.store.attach().await;
    let (send, recv) = conn.split();
    let token = cancel.child_token();
    let (receiver, sender) = tokio::join!(
        client_receiver(token.clone(), recv, shared),
        client_sender(token, send, queue_rx),
    );
    shared.store.detach(queue).await;
    connection_result(receiver, sender)
}

async fn client_receiver<S>(
    token: CancellationToken,
    mut recv: RecvHalf<S>,
    shared: &ClientShared,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _teardown = token.clone().drop_guard();
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            frame = recv.receive_typed(&WireCodec) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let header = frame
            .downcast::<Header>()
            .map_err(|_| Error::Protocol("header frame expected"))?;
        // The server must honor our manifest; a namespace we never asked
        // for is a protocol violation.
        let namespace = &header.revision.message.namespace;
        let codec = shared
            .codecs
            .get(namespace)
            .ok_or_else(|| Error::UnknownNamespace(namespace.clone()))?;
        let message = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            message = recv.receive_typed(codec.as_ref()) => {
                message?.ok_or(Error::Protocol("payload frame expected"))?
            }
        };
        shared.store.deliver(&token, &header, message).await?;
    }
}

async fn client_sender<S>(
    token: CancellationToken,
    mut send: SendHalf<S>,
    mut queue: mpsc::Receiver<ClientEntry>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _teardown = token.clone().drop_guard();
    let result = loop {
        let entry = tokio::select! {
            _ = token.cancelled() => break Err(Error::Cancelled),
            entry = queue.recv() => match entry {
                Some(entry) => entry,
                None => break Ok(()),
            },
        };
        if let Err(err) = send_client_entry(&mut send, &entry).await {
            break Err(err);
        }
    };
    send.shutdown().await.ok();
    result
}

async fn send_client_entry<S>(send: &mut SendHalf<S>, entry: &ClientEntry) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send.send_typed(&entry.header, &WireCodec).await?;
    send.send_typed(entry.message.as_ref(), entry.codec.as_ref())
        .await
}
