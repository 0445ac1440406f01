use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::codec::Framed;
use tracing::Instrument;
use crate::{
    bitfield::{Bitfield, BitfieldError},
    wire::{Message, MessageCodec, WireError},
    PeerId,
};

// Outbound messages pending per peer; the writer drains them in FIFO order.
const OUTBOUND_QUEUE: usize = 10;

// Events a peer session feeds into the coordinator. Sessions hold only the
// send handle and their own identity, never a reference to the coordinator.
pub(crate) enum PeerEvent {

    Message { addr: SocketAddr, msg: Message },

    // The reader task exited; the connection is gone.
    Disconnected { addr: SocketAddr },

}

// The four per-direction protocol booleans. Both sides start choked and
// uninterested.
#[derive(Debug, Clone, Copy)]
struct Flags {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

// Shared record for one remote peer. The coordinator loops and the serving
// path read and write it concurrently, so the mutable parts sit behind
// reader-writer locks held only for the access itself.
pub struct Peer {

    addr: SocketAddr,

    id: PeerId,

    out_tx: mpsc::Sender<Message>,

    flags: RwLock<Flags>,

    bitfield: RwLock<Option<Bitfield>>,

}

impl Peer {

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    // Queues a message for the writer task.
    pub async fn send(&self, msg: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.out_tx.send(msg).await
    }

    pub fn am_choking(&self) -> bool {
        self.flags.read().unwrap().am_choking
    }

    pub fn set_am_choking(&self, value: bool) {
        self.flags.write().unwrap().am_choking = value;
    }

    pub fn am_interested(&self) -> bool {
        self.flags.read().unwrap().am_interested
    }

    pub fn set_am_interested(&self, value: bool) {
        self.flags.write().unwrap().am_interested = value;
    }

    pub fn peer_choking(&self) -> bool {
        self.flags.read().unwrap().peer_choking
    }

    pub fn set_peer_choking(&self, value: bool) {
        self.flags.write().unwrap().peer_choking = value;
    }

    pub fn peer_interested(&self) -> bool {
        self.flags.read().unwrap().peer_interested
    }

    pub fn set_peer_interested(&self, value: bool) {
        self.flags.write().unwrap().peer_interested = value;
    }

    // Replaces the peer's bitfield wholesale.
    pub fn set_bitfield(&self, bitfield: Bitfield) {
        *self.bitfield.write().unwrap() = Some(bitfield);
    }

    pub fn bitfield_snapshot(&self) -> Option<Bitfield> {
        self.bitfield.read().unwrap().clone()
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.read().unwrap().as_ref().map_or(false, |bf| bf.get(index))
    }

    // Marks a single piece, creating an empty bitfield for peers that never
    // sent one.
    pub fn record_piece(&self, index: usize, piece_count: usize) -> Result<(), BitfieldError> {
        let mut guard = self.bitfield.write().unwrap();
        guard.get_or_insert_with(|| Bitfield::new(piece_count)).set(index)
    }
}

// A running session: the shared record plus its two task handles.
pub(crate) struct PeerHandle {

    pub peer: Arc<Peer>,

    pub reader: JoinHandle<()>,

    pub writer: JoinHandle<()>,

}

impl PeerHandle {
    // Tears the connection down; both tasks drop their stream halves.
    pub fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

// Starts the reader and writer tasks for a handshaken connection. The reader
// holds off until the returned gate fires, which the coordinator does once
// the peer is in its swarm map, so no inbound message can race past it.
pub(crate) fn spawn_session<T>(
    socket: Framed<T, MessageCodec>,
    addr: SocketAddr,
    id: PeerId,
    events_tx: mpsc::Sender<PeerEvent>,
) -> (PeerHandle, oneshot::Sender<()>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (gate_tx, gate_rx) = oneshot::channel();
    let peer = Arc::new(Peer {
        addr,
        id,
        out_tx,
        flags: RwLock::new(Flags::default()),
        bitfield: RwLock::new(None),
    });

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            tracing::debug!("send: {}", msg);
            if let Err(e) = sink.send(msg).await {
                tracing::debug!("write failed, dropping connection: {}", e);
                break;
            }
        }
    }.instrument(tracing::debug_span!("peer_write", addr = %addr)));

    let reader = tokio::spawn(async move {
        // Admitted to the swarm, or the coordinator gave up on us.
        if gate_rx.await.is_err() {
            return;
        }
        loop {
            match stream.next().await {
                Some(Ok(msg)) => {
                    tracing::debug!("read: {}", msg);
                    if events_tx.send(PeerEvent::Message { addr, msg }).await.is_err() {
                        break;
                    }
                },
                Some(Err(WireError::UnknownMessage { id, length })) => {
                    // Already drained by the codec; the connection stays up.
                    tracing::info!("ignoring unknown message id {} ({} bytes)", id, length);
                },
                Some(Err(e)) => {
                    tracing::debug!("read failed, dropping connection: {}", e);
                    break;
                },
                None => {
                    tracing::debug!("peer closed the connection");
                    break;
                },
            }
        }
        events_tx.send(PeerEvent::Disconnected { addr }).await.ok();
    }.instrument(tracing::debug_span!("peer_read", addr = %addr)));

    (PeerHandle { peer, reader, writer }, gate_tx)
}
