//! Peer sessions: handshake, message dispatch, and the pending-store push
//! loop.
//!
//! Each connected peer is driven by three tasks: the reader (this module's
//! [`run_session`], blocked on transport reads), a writer draining the
//! outbound channel in FIFO order, and the push loop that walks the peer's
//! durable pending-store queue. All of them observe a shared quit signal,
//! raised when the transport fails, the peer is evicted from its bucket, or
//! the node shuts down.
//!
//! ```text
//! INIT ──send(status)──▶ AWAIT_STATUS
//! AWAIT_STATUS ──recv(status, good)──▶ ACTIVE
//! AWAIT_STATUS ──recv(non-status) or bad──▶ DROPPED
//! ACTIVE ──recv(store|retrieve|peers)──▶ ACTIVE
//! ACTIVE ──transport error──▶ DROPPED
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::error::ProtocolError;
use crate::framing;
use crate::hive::Hive;
use crate::kademlia;
use crate::netstore::NetStore;
use crate::protocol::{
    Message, Metadata, PeerAddr, StatusData, StoreRequestData, NETWORK_ID, PEERS_MSG,
    PROTOCOL_VERSION, RETRIEVE_REQUEST_MSG, STATUS_MSG, STORE_REQUEST_MSG,
};

const OUTBOUND_BUFFER: usize = 256;

/// Queue entries processed per pending-store scan.
const STORE_BATCH: usize = 100;

/// Sleep between rescans of a drained pending-store queue.
const DRAIN_IDLE: Duration = Duration::from_secs(1);

/// A non-zero request id (zero marks lookups on the wire).
pub(crate) fn fresh_request_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

struct HandleInner {
    addr: Address,
    remote: PeerAddr,
    outbound: mpsc::Sender<Message>,
    last_active: AtomicU64,
    quit: watch::Sender<bool>,
}

/// Identifies a live session without owning it: the routing table, the net
/// store and the request queue all address the peer through this handle.
/// Messages sent through it are written out in FIFO order by the session's
/// writer task.
#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<HandleInner>,
}

impl PeerHandle {
    fn new(remote: PeerAddr, outbound: mpsc::Sender<Message>, quit: watch::Sender<bool>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                addr: remote.address(),
                remote,
                outbound,
                last_active: AtomicU64::new(now_nanos()),
                quit,
            }),
        }
    }

    /// The peer's overlay address (hash of its public id).
    pub fn addr(&self) -> Address {
        self.inner.addr
    }

    /// The peer's advertised endpoint.
    pub fn remote(&self) -> &PeerAddr {
        &self.inner.remote
    }

    /// Enqueue an outbound message; `false` when the session is gone.
    pub async fn send(&self, msg: Message) -> bool {
        self.inner.outbound.send(msg).await.is_ok()
    }

    fn touch(&self) {
        self.inner.last_active.store(now_nanos(), Ordering::Relaxed);
    }
}

impl kademlia::Node for PeerHandle {
    fn addr(&self) -> Address {
        self.inner.addr
    }

    fn url(&self) -> String {
        self.inner.remote.url()
    }

    fn last_active(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.inner.last_active.load(Ordering::Relaxed))
    }

    fn drop_peer(&self) {
        let _ = self.inner.quit.send(true);
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerHandle({:?})", self.inner.addr)
    }
}

/// Everything a session needs from the node it runs on.
#[derive(Clone)]
pub struct SessionContext {
    pub netstore: Arc<NetStore>,
    pub hive: Arc<Hive>,
    /// Our advertised endpoint: listen ip/port and 64-byte public id.
    pub self_addr: PeerAddr,
    /// Free-form client identifier sent in the handshake.
    pub client: String,
}

impl SessionContext {
    fn status(&self) -> StatusData {
        StatusData {
            version: PROTOCOL_VERSION,
            id: self.client.clone(),
            node_id: self.self_addr.id.clone(),
            addr: self.self_addr.clone(),
            network_id: NETWORK_ID,
            caps: Vec::new(),
        }
    }
}

/// Drive a peer session over a framed byte stream until it ends.
///
/// Performs the status handshake, registers the peer with the hive, spawns
/// the writer and pending-store tasks, then dispatches incoming messages.
/// Returns the protocol error that tore the session down, or `Ok` on a
/// clean close.
pub async fn run_session<R, W>(
    ctx: SessionContext,
    mut reader: R,
    mut writer: W,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (code, payload) = Message::Status(ctx.status()).encode()?;
    framing::write_frame(&mut writer, code, &payload).await?;

    let status = read_status(&mut reader).await?;
    if status.network_id != NETWORK_ID {
        return Err(ProtocolError::NetworkIdMismatch(
            status.network_id,
            NETWORK_ID,
        ));
    }
    if status.version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(
            status.version,
            PROTOCOL_VERSION,
        ));
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (quit_tx, quit_rx) = watch::channel(false);
    let handle = PeerHandle::new(status.addr.clone(), outbound_tx, quit_tx);
    debug!(peer = ?handle.addr(), client = %status.id, "peer session established");

    tokio::spawn(write_loop(writer, outbound_rx, quit_rx.clone()));

    if !ctx.hive.add_peer(handle.clone()).await {
        debug!(peer = ?handle.addr(), "already connected, dropping duplicate session");
        kademlia::Node::drop_peer(&handle);
        return Ok(());
    }
    tokio::spawn(store_push_loop(
        ctx.netstore.clone(),
        handle.clone(),
        quit_rx.clone(),
    ));

    let result = dispatch(&ctx, &mut reader, &handle, quit_rx).await;

    ctx.hive.remove_peer(handle.addr()).await;
    kademlia::Node::drop_peer(&handle);
    if let Err(err) = &result {
        debug!(peer = ?handle.addr(), %err, "session dropped");
    }
    result
}

async fn read_status<R>(reader: &mut R) -> Result<StatusData, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let (code, payload) = framing::read_frame(reader)
        .await?
        .ok_or(ProtocolError::NoStatusMsg)?;
    if code != STATUS_MSG {
        return Err(ProtocolError::NoStatusMsg);
    }
    match Message::decode(code, &payload)? {
        Message::Status(status) => Ok(status),
        _ => Err(ProtocolError::NoStatusMsg),
    }
}

/// The ACTIVE state: decode and route incoming frames until the stream ends
/// or a protocol violation drops the peer.
async fn dispatch<R>(
    ctx: &SessionContext,
    reader: &mut R,
    handle: &PeerHandle,
    mut quit: watch::Receiver<bool>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = quit.changed() => return Ok(()),
            frame = framing::read_frame(reader) => frame?,
        };
        let (code, payload) = match frame {
            Some(frame) => frame,
            None => return Ok(()),
        };
        handle.touch();
        match code {
            STATUS_MSG => return Err(ProtocolError::ExtraStatusMsg),
            STORE_REQUEST_MSG => {
                if let Message::Store(req) = Message::decode(code, &payload)? {
                    trace!(
                        peer = ?handle.addr(),
                        key = ?req.key,
                        len = req.data.len(),
                        "incoming store request"
                    );
                    if let Err(err) = ctx.netstore.handle_store(req, Some(handle)).await {
                        warn!(peer = ?handle.addr(), %err, "storing incoming chunk failed");
                    }
                }
            }
            RETRIEVE_REQUEST_MSG => {
                if let Message::Retrieve(req) = Message::decode(code, &payload)? {
                    if req.key.is_zero() {
                        return Err(ProtocolError::Decode(
                            "retrieve request without key".to_string(),
                        ));
                    }
                    trace!(peer = ?handle.addr(), key = ?req.key, id = req.id, "incoming retrieve request");
                    ctx.netstore.handle_retrieve(req, handle).await;
                }
            }
            PEERS_MSG => {
                if let Message::Peers(data) = Message::decode(code, &payload)? {
                    trace!(peer = ?handle.addr(), peers = data.peers.len(), "incoming peers");
                    ctx.hive.add_peer_entries(&data).await;
                }
            }
            other => return Err(ProtocolError::InvalidMsgCode(other)),
        }
    }
}

/// Writer task: drain the outbound channel onto the wire, FIFO.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Message>,
    mut quit: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = quit.changed() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let (code, payload) = match msg.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "dropping unencodable message");
                continue;
            }
        };
        if let Err(err) = framing::write_frame(&mut writer, code, &payload).await {
            debug!(%err, "session write failed");
            break;
        }
    }
}

/// Push loop: walk this peer's slice of the durable pending-store queue in
/// insertion order, sending each queued chunk that is still present locally
/// and deleting the entry either way. Sleeps and rescans once drained;
/// exits at the next batch boundary after the quit signal.
async fn store_push_loop(netstore: Arc<NetStore>, handle: PeerHandle, mut quit: watch::Receiver<bool>) {
    let peer = handle.addr();
    loop {
        let batch = match netstore.requests().drain_batch(&peer, STORE_BATCH) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(peer = ?peer, %err, "pending-store queue unreadable");
                break;
            }
        };
        if batch.is_empty() {
            tokio::select! {
                _ = quit.changed() => break,
                _ = sleep(DRAIN_IDLE) => continue,
            }
        }
        for (queue_key, chunk_key) in batch {
            if *quit.borrow() {
                return;
            }
            match netstore.local().fetch(&chunk_key).await {
                Ok(Some(data)) => {
                    trace!(peer = ?peer, key = ?chunk_key, "pushing queued chunk");
                    let msg = Message::Store(StoreRequestData {
                        key: chunk_key,
                        data,
                        id: fresh_request_id(),
                        metadata: Metadata::default(),
                    });
                    if !handle.send(msg).await {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(peer = ?peer, key = ?chunk_key, %err, "queued chunk unreadable")
                }
            }
            if let Err(err) = netstore.requests().remove(&queue_key) {
                warn!(peer = ?peer, %err, "failed to drop queue entry");
            }
        }
    }
}
