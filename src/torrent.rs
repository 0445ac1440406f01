use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::Instrument;
use crate::{
    bitfield::Bitfield,
    config::Config,
    listener::Inbound,
    metainfo::MetaInfo,
    peer::{spawn_session, Peer, PeerEvent, PeerHandle},
    store::{FileStore, StoreError, Storer, TorrentFile},
    tally::{SwarmTally, TallyError},
    tracker::{AnnounceStats, Tracker, TrackerHandle},
    wire::{
        BlockData, BlockRequest, Handshake, HandshakeCodec, Message, MessageCodec, WireError,
    },
    InfoHash, PeerId, MAX_REQUEST_LEN,
};

// Both sides of a handshake must complete inside this window; no deadline
// applies afterwards.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

// How often interested peers are offered an unchoke.
const UNCHOKE_TICK: Duration = Duration::from_secs(5);

// Coordinator inbound event queue.
const EVENT_QUEUE: usize = 50;

// Tracker-supplied peer addresses and freshly handshaken peers.
const ADDR_QUEUE: usize = 100;
const ADMIT_QUEUE: usize = 100;

pub type Result<T> = std::result::Result<T, TorrentError>;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tally error: {0}")]
    Tally(#[from] TallyError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake rejected: {0}")]
    Handshake(&'static str),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("torrent already started")]
    AlreadyStarted,

}

// Forward-only while running: a torrent starts Stopped, validates into
// Leeching or Seeding, and returns to Stopped only on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {

    #[default]
    Stopped,

    Leeching,

    Seeding,

}

// State shared between the coordinator loops, the trackers and the host.
struct Shared {

    info_hash: InfoHash,

    peer_id: PeerId,

    port: u16,

    total_len: u64,

    state: Mutex<TorrentState>,

    // Pieces we hold. Written by the coordinator, read by the serving and
    // handshake paths.
    bitfield: RwLock<Bitfield>,

    downloaded: AtomicU64,

    uploaded: AtomicU64,

    left: AtomicU64,

}

impl AnnounceStats for Shared {

    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }

    fn port(&self) -> u16 {
        self.port
    }
}

type Swarm = Arc<RwLock<HashMap<SocketAddr, PeerHandle>>>;

// A handshaken session waiting for the admit loop, with the gate that opens
// its reader.
type NewPeer = (PeerHandle, oneshot::Sender<()>);

// Single-torrent coordinator: owns the file store and local bitfield, fans
// in tracker and peer events, and serves blocks to unchoked peers.
pub struct Torrent {

    meta: MetaInfo,

    shared: Arc<Shared>,

    store: Arc<FileStore<TorrentFile>>,

    swarm: Swarm,

    inbound_tx: mpsc::Sender<Inbound>,

    // Taken by start; its presence marks a never-started torrent.
    inbound_rx: Option<mpsc::Receiver<Inbound>>,

    stop: CancellationToken,

    trackers: Vec<TrackerHandle>,

    tasks: Vec<JoinHandle<()>>,

}

impl Torrent {

    // Creates the backing files (truncated or padded to their declared
    // lengths) and the shared state. Nothing runs until start.
    pub fn new(meta: MetaInfo, config: &Config) -> Result<Self> {

        let mut files = Vec::new();
        for file in meta.files() {
            files.push(TorrentFile::create(&config.root_dir, &file.path, file.length)?);
        }
        let store = Arc::new(FileStore::new(files, meta.piece_hashes(), meta.piece_len()));

        let (inbound_tx, inbound_rx) = mpsc::channel(ADMIT_QUEUE);
        let shared = Arc::new(Shared {
            info_hash: meta.info_hash(),
            peer_id: config.peer_id,
            port: config.port,
            total_len: store.total_len(),
            state: Mutex::new(TorrentState::Stopped),
            bitfield: RwLock::new(Bitfield::new(store.piece_count() as usize)),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            left: AtomicU64::new(store.total_len()),
        });

        Ok(Self {
            meta,
            shared,
            store,
            swarm: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            stop: CancellationToken::new(),
            trackers: Vec::new(),
            tasks: Vec::new(),
        })
    }

    // Validates the on-disk content, spawns the trackers and the three
    // coordinator loops, then returns; the torrent runs in the background.
    pub async fn start(&mut self) -> Result<()> {

        let inbound_rx = self.inbound_rx.take().ok_or(TorrentError::AlreadyStarted)?;
        tracing::info!("torrent starting: {}", self.meta.name());

        // Hash whatever is already on disk, off the async workers.
        let store = Arc::clone(&self.store);
        let bitfield = tokio::task::spawn_blocking(move || store.validate())
            .await
            .map_err(|e| TorrentError::Task(e.to_string()))??;

        let mut have_bytes = 0u64;
        for index in 0..self.store.piece_count() {
            if bitfield.get(index as usize) {
                have_bytes += self.store.piece_length(index) as u64;
            }
        }
        self.shared.left.store(self.shared.total_len - have_bytes, Ordering::Relaxed);

        let mut tally = SwarmTally::new(bitfield.len());
        tally.lock_owned(&bitfield)?;

        let state = if bitfield.is_complete() {
            TorrentState::Seeding
        } else {
            TorrentState::Leeching
        };
        tracing::info!(
            "{}/{} pieces on disk, entering {:?}",
            bitfield.count_set(),
            self.store.piece_count(),
            state,
        );
        *self.shared.bitfield.write().unwrap() = bitfield;
        *self.shared.state.lock().unwrap() = state;

        // One tracker per announce URL, all feeding one address queue.
        let (addr_tx, addr_rx) = mpsc::channel(ADDR_QUEUE);
        for url in self.meta.announce_list() {
            let tracker = Tracker::new(
                url.clone(),
                Arc::clone(&self.shared) as Arc<dyn AnnounceStats>,
                addr_tx.clone(),
                self.stop.child_token(),
            );
            self.trackers.push(tracker.spawn());
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (admit_tx, admit_rx) = mpsc::channel(ADMIT_QUEUE);

        self.tasks.push(tokio::spawn(
            dial_loop(
                Arc::clone(&self.shared),
                addr_rx,
                admit_tx.clone(),
                events_tx.clone(),
                self.stop.child_token(),
            )
            .instrument(tracing::debug_span!("dial")),
        ));
        self.tasks.push(tokio::spawn(
            admit_loop(
                Arc::clone(&self.shared),
                Arc::clone(&self.swarm),
                inbound_rx,
                admit_rx,
                admit_tx,
                events_tx,
                self.stop.child_token(),
            )
            .instrument(tracing::debug_span!("admit")),
        ));
        self.tasks.push(tokio::spawn(
            message_loop(
                Arc::clone(&self.shared),
                Arc::clone(&self.swarm),
                Arc::clone(&self.store),
                tally,
                events_rx,
                self.stop.child_token(),
            )
            .instrument(tracing::debug_span!("messages")),
        ));

        Ok(())
    }

    // Stops the loops and drops every peer connection. Trackers finish with
    // a best-effort stopped announce in the background.
    pub async fn stop(&mut self) {
        tracing::info!("torrent stopping: {}", self.meta.name());
        *self.shared.state.lock().unwrap() = TorrentState::Stopped;
        self.stop.cancel();

        for task in self.tasks.drain(..) {
            task.await.ok();
        }
        for (_, handle) in self.swarm.write().unwrap().drain() {
            handle.shutdown();
        }
        self.trackers.clear();
    }

    // Interrupts every tracker's announce timer.
    pub fn force_announce(&self) {
        for tracker in &self.trackers {
            tracker.force_announce();
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.shared.info_hash
    }

    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    pub fn state(&self) -> TorrentState {
        *self.shared.state.lock().unwrap()
    }

    pub fn downloaded(&self) -> u64 {
        self.shared.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.shared.uploaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.shared.left.load(Ordering::Relaxed)
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn num_peers(&self) -> usize {
        self.swarm.read().unwrap().len()
    }

    pub(crate) fn inbound_sender(&self) -> mpsc::Sender<Inbound> {
        self.inbound_tx.clone()
    }
}

// Dials tracker-supplied addresses, but only while there is something left
// to download; seeds wait for inbound connections.
async fn dial_loop(
    shared: Arc<Shared>,
    mut addr_rx: mpsc::Receiver<SocketAddr>,
    admit_tx: mpsc::Sender<NewPeer>,
    events_tx: mpsc::Sender<PeerEvent>,
    stop: CancellationToken,
) {
    loop {
        let addr = tokio::select! {
            _ = stop.cancelled() => break,
            addr = addr_rx.recv() => match addr {
                Some(addr) => addr,
                None => break,
            },
        };
        if *shared.state.lock().unwrap() != TorrentState::Leeching {
            continue;
        }

        let shared = Arc::clone(&shared);
        let admit_tx = admit_tx.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            match time::timeout(HANDSHAKE_TIMEOUT, outbound_handshake(addr, &shared)).await {
                Ok(Ok((socket, handshake))) => {
                    // The deadline ends with the handshake; sessions run
                    // without one.
                    start_peer(socket, addr, handshake, &shared, events_tx, &admit_tx).await;
                },
                Ok(Err(e)) => tracing::debug!("failed to connect to peer {}: {}", addr, e),
                Err(_) => tracing::debug!("handshake with {} timed out", addr),
            }
        });
    }
}

// Dial-side handshake: ours goes first, theirs must echo our info-hash.
async fn outbound_handshake(
    addr: SocketAddr,
    shared: &Shared,
) -> Result<(Framed<TcpStream, HandshakeCodec>, Handshake)> {

    let stream = TcpStream::connect(addr).await?;
    let mut socket = Framed::new(stream, HandshakeCodec);
    socket.send(Handshake::new(shared.info_hash, shared.peer_id)).await?;

    match socket.next().await {
        Some(Ok(handshake)) if handshake.info_hash == shared.info_hash => Ok((socket, handshake)),
        Some(Ok(_)) => Err(TorrentError::Handshake("info-hash mismatch")),
        Some(Err(e)) => Err(e.into()),
        None => Err(TorrentError::Handshake("connection closed before handshake")),
    }
}

// Starts the session tasks for a handshaken connection, introduces us with
// our bitfield, and queues the peer for admission.
async fn start_peer(
    socket: Framed<TcpStream, HandshakeCodec>,
    addr: SocketAddr,
    handshake: Handshake,
    shared: &Shared,
    events_tx: mpsc::Sender<PeerEvent>,
    admit_tx: &mpsc::Sender<NewPeer>,
) {
    let socket = socket.map_codec(|_| MessageCodec);
    let (handle, gate) = spawn_session(socket, addr, handshake.peer_id, events_tx);

    let own = shared.bitfield.read().unwrap().clone();
    if handle.peer.send(Message::Bitfield(own)).await.is_err() {
        return;
    }
    admit_tx.send((handle, gate)).await.ok();
}

// Appends handshaken peers to the swarm, replies to listener hand-offs, and
// unchokes interested peers on a fixed tick.
async fn admit_loop(
    shared: Arc<Shared>,
    swarm: Swarm,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    mut admit_rx: mpsc::Receiver<NewPeer>,
    admit_tx: mpsc::Sender<NewPeer>,
    events_tx: mpsc::Sender<PeerEvent>,
    stop: CancellationToken,
) {
    let mut ticker = time::interval(UNCHOKE_TICK);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,

            Some(inbound) = inbound_rx.recv() => {
                let shared = Arc::clone(&shared);
                let admit_tx = admit_tx.clone();
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    let Inbound { mut socket, handshake, addr } = inbound;
                    let reply = Handshake::new(shared.info_hash, shared.peer_id);
                    match time::timeout(HANDSHAKE_TIMEOUT, socket.send(reply)).await {
                        Ok(Ok(())) => {
                            start_peer(socket, addr, handshake, &shared, events_tx, &admit_tx).await;
                        },
                        Ok(Err(e)) => tracing::debug!("{} failed to answer handshake: {}", addr, e),
                        Err(_) => tracing::debug!("{} handshake reply timed out", addr),
                    }
                });
            },

            Some((handle, gate)) = admit_rx.recv() => {
                let addr = handle.peer.addr();
                tracing::debug!("connected to new peer {}", addr);
                swarm.write().unwrap().insert(addr, handle);
                // Open the reader only once the swarm map can resolve it.
                gate.send(()).ok();
            },

            _ = ticker.tick() => {
                // Unchoke anyone interested; slot limits and optimistic
                // rotation can layer on here later.
                let peers: Vec<Arc<Peer>> = swarm.read().unwrap()
                    .values()
                    .map(|handle| Arc::clone(&handle.peer))
                    .collect();
                for peer in peers {
                    if peer.peer_interested() && peer.am_choking() {
                        tracing::debug!("unchoking peer {}", peer.addr());
                        if peer.send(Message::Unchoke).await.is_ok() {
                            peer.set_am_choking(false);
                        }
                    }
                }
            },
        }
    }
}

// The only task that touches the tally, so availability updates stay
// serialized with every decision they feed.
async fn message_loop<S: Storer>(
    shared: Arc<Shared>,
    swarm: Swarm,
    store: Arc<FileStore<S>>,
    mut tally: SwarmTally,
    mut events_rx: mpsc::Receiver<PeerEvent>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            PeerEvent::Disconnected { addr } => {
                drop_peer(&swarm, &mut tally, addr);
            },
            PeerEvent::Message { addr, msg } => {
                let peer = swarm.read().unwrap().get(&addr).map(|h| Arc::clone(&h.peer));
                let Some(peer) = peer else { continue };
                if !handle_message(&shared, &store, &mut tally, &peer, msg).await {
                    drop_peer(&swarm, &mut tally, addr);
                }
            },
        }
    }
}

// Dispatches one peer message. Returns false when the peer misbehaved badly
// enough to disconnect.
async fn handle_message<S: Storer>(
    shared: &Shared,
    store: &Arc<FileStore<S>>,
    tally: &mut SwarmTally,
    peer: &Arc<Peer>,
    msg: Message,
) -> bool {
    let piece_count = store.piece_count();

    match msg {

        Message::KeepAlive => {},

        Message::Choke => peer.set_peer_choking(true),

        Message::Unchoke => peer.set_peer_choking(false),

        Message::Interested => {
            tracing::debug!("peer {} is interested", peer.addr());
            peer.set_peer_interested(true);
        },

        Message::NotInterested => peer.set_peer_interested(false),

        Message::Have { idx } => {
            if idx >= piece_count {
                tracing::warn!("peer {} sent have for out-of-range piece {}", peer.addr(), idx);
                return false;
            }
            // A repeated have must not bump the tally twice.
            if !peer.has_piece(idx as usize) {
                peer.record_piece(idx as usize, piece_count as usize).ok();
                tally.increment(idx as usize);
            }
        },

        Message::Bitfield(mut bitfield) => {
            // The wire field is padded to whole bytes; adopt the real piece
            // count before using it.
            if bitfield.set_length(piece_count as usize).is_err() {
                tracing::warn!("peer {} sent an oversized bitfield", peer.addr());
                return false;
            }
            // A replacement bitfield folds the previous one out first.
            if let Some(old) = peer.bitfield_snapshot() {
                tally.remove_bitfield(&old).ok();
            }
            if let Err(e) = tally.add_bitfield(&bitfield) {
                tracing::warn!("peer {} bitfield rejected: {}", peer.addr(), e);
                return false;
            }
            tracing::debug!(
                "peer {} has {}/{} pieces",
                peer.addr(),
                bitfield.count_set(),
                piece_count,
            );
            peer.set_bitfield(bitfield);
        },

        Message::Request(request) => handle_request(shared, store, peer, request).await,

        // Download side; the piece picker hooks in here.
        Message::Piece(_) | Message::Cancel(_) => {},
    }

    true
}

// Serves one block request: refused while choking, for pieces we lack, and
// for oversized lengths. A failed read aborts the request, not the peer.
async fn handle_request<S: Storer>(
    shared: &Shared,
    store: &Arc<FileStore<S>>,
    peer: &Arc<Peer>,
    request: BlockRequest,
) {
    let addr = peer.addr();
    if peer.am_choking()
        || !shared.bitfield.read().unwrap().get(request.piece as usize)
        || request.length > MAX_REQUEST_LEN
    {
        tracing::debug!(
            "refusing request from {} for block ({}, {}, {})",
            addr,
            request.piece,
            request.offset,
            request.length,
        );
        return;
    }

    let BlockRequest { piece, offset, length } = request;
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || store.get_block(piece, offset, length)).await {
        Ok(Ok(data)) => {
            tracing::debug!("serving block ({}, {}, {}) to {}", piece, offset, length, addr);
            shared.uploaded.fetch_add(length as u64, Ordering::Relaxed);
            peer.send(Message::Piece(BlockData { piece, offset, data })).await.ok();
        },
        Ok(Err(e)) => tracing::error!("failed to read block ({}, {}, {}): {}", piece, offset, length, e),
        Err(e) => tracing::error!("block read task failed: {}", e),
    }
}

// Removes a peer and folds its claimed pieces out of the availability
// counts.
fn drop_peer(swarm: &Swarm, tally: &mut SwarmTally, addr: SocketAddr) {
    let handle = swarm.write().unwrap().remove(&addr);
    let Some(handle) = handle else { return };
    handle.shutdown();
    if let Some(bitfield) = handle.peer.bitfield_snapshot() {
        tally.remove_bitfield(&bitfield).ok();
    }
    tracing::debug!("peer {} disconnected", addr);
}
