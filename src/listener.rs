use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, RwLock},
    time::Duration,
};
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tokio_util::codec::Framed;
use tracing::Instrument;
use crate::{
    torrent::Torrent,
    wire::{Handshake, HandshakeCodec},
    InfoHash,
};

// Peers get one minute to introduce themselves.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

// A connection whose handshake has been read, ready for its torrent to adopt.
pub(crate) struct Inbound {

    pub socket: Framed<TcpStream, HandshakeCodec>,

    pub handshake: Handshake,

    pub addr: SocketAddr,

}

type Registry = Arc<RwLock<HashMap<InfoHash, mpsc::Sender<Inbound>>>>;

// Accepts inbound connections for the whole process and routes each one to
// the torrent matching the offered info-hash.
pub struct Listener {

    port: u16,

    registry: Registry,

    accept_task: Option<JoinHandle<()>>,

}

impl Listener {

    pub fn new(port: u16) -> Self {
        Self {
            port,
            registry: Arc::new(RwLock::new(HashMap::new())),
            accept_task: None,
        }
    }

    pub fn add_torrent(&self, torrent: &Torrent) {
        self.register(torrent.info_hash(), torrent.inbound_sender());
    }

    pub fn remove_torrent(&self, info_hash: InfoHash) {
        self.registry.write().unwrap().remove(&info_hash);
        tracing::debug!("deregistered torrent {}", hex::encode(info_hash));
    }

    pub(crate) fn register(&self, info_hash: InfoHash, inbound_tx: mpsc::Sender<Inbound>) {
        self.registry.write().unwrap().insert(info_hash, inbound_tx);
        tracing::debug!("registered torrent {}", hex::encode(info_hash));
    }

    // Binds the port and starts the accept task. Accept failures end the
    // task but leave registered torrents running.
    pub async fn listen(&mut self) -> io::Result<SocketAddr> {

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::clone(&self.registry);

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!("listener unexpectedly quit: {}", e);
                        return;
                    },
                };
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    admit(stream, addr, registry).await;
                });
            }
        }.instrument(tracing::info_span!("listener"))));

        tracing::info!("listening on {}", local_addr);
        Ok(local_addr)
    }

    pub fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            tracing::info!("listener closed");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

// Reads the handshake off a fresh connection and hands it to the matching
// torrent; anything else drops the connection on the floor.
async fn admit(stream: TcpStream, addr: SocketAddr, registry: Registry) {

    let mut socket = Framed::new(stream, HandshakeCodec);
    let handshake = match time::timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
        Ok(Some(Ok(handshake))) => handshake,
        Ok(Some(Err(e))) => {
            tracing::debug!("{} initial handshake failed: {}", addr, e);
            return;
        },
        Ok(None) => {
            tracing::debug!("{} closed before handshaking", addr);
            return;
        },
        Err(_) => {
            tracing::debug!("{} handshake timed out", addr);
            return;
        },
    };

    let inbound_tx = registry.read().unwrap().get(&handshake.info_hash).cloned();
    match inbound_tx {
        Some(tx) => {
            tracing::debug!("{} inbound peer connection: {:?}", addr, handshake);
            tx.send(Inbound { socket, handshake, addr }).await.ok();
        },
        None => {
            tracing::info!("{} offered an unknown or expired info-hash", addr);
        },
    }
}
