use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Notify},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;
use crate::{InfoHash, PeerId};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;

// Peers requested per announce.
const NUM_WANT: i32 = 50;

// The whole connect + announce exchange must finish inside this window.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(60);

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("announce timed out")]
    Timeout(#[from] time::error::Elapsed),

    #[error("tracker url has no usable host and port")]
    InvalidUrl,

    #[error("tracker protocol violation: {0}")]
    Protocol(&'static str),

}

// Announce lifecycle states and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    None,
    Completed,
    Started,
    Stopped,
}

impl Event {
    fn code(self) -> i32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::None => write!(f, "none"),
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

// Stats reported with every announce; the torrent's shared state implements
// this so the tracker never holds a reference into the coordinator.
pub trait AnnounceStats: Send + Sync + 'static {

    fn info_hash(&self) -> InfoHash;

    fn peer_id(&self) -> PeerId;

    fn downloaded(&self) -> u64;

    fn uploaded(&self) -> u64;

    fn left(&self) -> u64;

    fn port(&self) -> u16;

}

pub struct AnnounceResponse {

    // Seconds until the tracker wants the next steady-state announce.
    pub interval: i32,

    pub leechers: i32,

    pub seeders: i32,

    pub peers: Vec<SocketAddr>,

}

// One tracker task per announce URL. Runs until stopped, then makes one
// best-effort STOPPED announce on the way out.
pub struct Tracker {

    url: Url,

    stats: Arc<dyn AnnounceStats>,

    peer_tx: mpsc::Sender<SocketAddr>,

    force: Arc<Notify>,

    stop: CancellationToken,

    // Consecutive failed announces; cleared on success.
    failures: u32,

}

pub struct TrackerHandle {

    force: Arc<Notify>,

    handle: JoinHandle<()>,

}

impl TrackerHandle {

    // Interrupts the announce timer so the tracker announces now.
    pub fn force_announce(&self) {
        self.force.notify_one();
    }

    pub async fn join(self) {
        self.handle.await.ok();
    }
}

impl Tracker {

    pub fn new(
        url: Url,
        stats: Arc<dyn AnnounceStats>,
        peer_tx: mpsc::Sender<SocketAddr>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            url,
            stats,
            peer_tx,
            force: Arc::new(Notify::new()),
            stop,
            failures: 0,
        }
    }

    pub fn spawn(self) -> TrackerHandle {
        let force = Arc::clone(&self.force);
        let span = tracing::info_span!("tracker", url = %self.url);
        let handle = tokio::spawn(self.run().instrument(span));
        TrackerHandle { force, handle }
    }

    async fn run(mut self) {

        let mut event = Event::Started;
        let mut next_announce = Duration::ZERO;

        loop {
            tokio::select! {
                _ = time::sleep(next_announce) => {},
                _ = self.force.notified() => tracing::debug!("forced announce"),
                _ = self.stop.cancelled() => break,
            }

            match self.announce(event).await {
                Ok(response) => {
                    tracing::info!(
                        "tracker returned {} peers ({} seeders / {} leechers), next announce in {}s",
                        response.peers.len(),
                        response.seeders,
                        response.leechers,
                        response.interval,
                    );
                    next_announce = Duration::from_secs(response.interval.max(0) as u64);
                    event = Event::None;
                    self.failures = 0;
                    for addr in response.peers {
                        if self.peer_tx.send(addr).await.is_err() {
                            // Torrent is gone; no point announcing again.
                            return;
                        }
                    }
                },
                Err(e) => {
                    next_announce = announce_backoff(self.failures);
                    self.failures += 1;
                    tracing::info!(
                        "announce failed ({}), retrying in {}s",
                        e,
                        next_announce.as_secs(),
                    );
                },
            }
        }

        // Best effort only; the tracker times us out regardless if this is
        // lost.
        if let Err(e) = self.announce(Event::Stopped).await {
            tracing::debug!("stopped announce failed: {}", e);
        }
    }

    // One announce: fresh socket, connect round trip, announce round trip.
    async fn announce(&self, event: Event) -> Result<AnnounceResponse> {
        tracing::debug!("announcing with event {}", event);
        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(TrackerError::InvalidUrl)?;

        time::timeout(ANNOUNCE_TIMEOUT, self.exchange(addr, event)).await?
    }

    async fn exchange(&self, addr: SocketAddr, event: Event) -> Result<AnnounceResponse> {

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(addr).await?;

        let transaction_id: i32 = rand::random();
        socket.send(&connect_request(transaction_id)).await?;

        let mut buf = [0u8; 16];
        let n = socket.recv(&mut buf).await?;
        let connection_id = parse_connect_response(&buf[..n], transaction_id)?;

        let transaction_id: i32 = rand::random();
        let request = announce_request(
            connection_id,
            transaction_id,
            rand::random(),
            &*self.stats,
            event,
        );
        socket.send(&request).await?;

        let mut buf = [0u8; 1024];
        let n = socket.recv(&mut buf).await?;
        parse_announce_response(&buf[..n], transaction_id)
    }
}

// Consecutive failures wait 60 * 2^n seconds before the next attempt.
fn announce_backoff(failures: u32) -> Duration {
    Duration::from_secs(60u64 << failures.min(57))
}

fn connect_request(transaction_id: i32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_i64(PROTOCOL_ID);
    buf.put_i32(ACTION_CONNECT);
    buf.put_i32(transaction_id);
    buf
}

fn parse_connect_response(mut resp: &[u8], transaction_id: i32) -> Result<i64> {
    if resp.len() < 16 {
        return Err(TrackerError::Protocol("connect response under 16 bytes"));
    }
    if resp.get_i32() != ACTION_CONNECT {
        return Err(TrackerError::Protocol("connect response action was not connect"));
    }
    if resp.get_i32() != transaction_id {
        return Err(TrackerError::Protocol("connect response transaction id mismatch"));
    }
    Ok(resp.get_i64())
}

fn announce_request(
    connection_id: i64,
    transaction_id: i32,
    key: i32,
    stats: &dyn AnnounceStats,
    event: Event,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_i64(connection_id);
    buf.put_i32(ACTION_ANNOUNCE);
    buf.put_i32(transaction_id);
    buf.put(&stats.info_hash()[..]);
    buf.put(&stats.peer_id()[..]);
    buf.put_i64(stats.downloaded() as i64);
    buf.put_i64(stats.left() as i64);
    buf.put_i64(stats.uploaded() as i64);
    buf.put_i32(event.code());
    buf.put_i32(0); // IP address; the tracker uses the packet source.
    buf.put_i32(key);
    buf.put_i32(NUM_WANT);
    buf.put_u16(stats.port());
    debug_assert_eq!(buf.len(), 98);
    buf
}

fn parse_announce_response(mut resp: &[u8], transaction_id: i32) -> Result<AnnounceResponse> {
    if resp.len() < 20 {
        return Err(TrackerError::Protocol("announce response under 20 bytes"));
    }
    if resp.get_i32() != ACTION_ANNOUNCE {
        return Err(TrackerError::Protocol("announce response action was not announce"));
    }
    if resp.get_i32() != transaction_id {
        return Err(TrackerError::Protocol("announce response transaction id mismatch"));
    }

    let interval = resp.get_i32();
    let leechers = resp.get_i32();
    let seeders = resp.get_i32();

    // 4 byte IPv4 address and 2 byte port per peer; a trailing partial entry
    // is ignored.
    let mut peers = Vec::with_capacity(resp.remaining() / 6);
    while resp.remaining() >= 6 {
        let ip = Ipv4Addr::from(resp.get_u32());
        let port = resp.get_u16();
        peers.push(SocketAddr::new(ip.into(), port));
    }

    Ok(AnnounceResponse { interval, leechers, seeders, peers })
}
