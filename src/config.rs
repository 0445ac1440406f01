use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};
use rand::Rng;
use crate::PeerId;

#[derive(Debug, Clone)]
pub struct Config {

    // Directory torrent content lives under. Must exist before torrents are added.
    pub root_dir: PathBuf,

    // Port bound by the listener and advertised to trackers.
    pub port: u16,

    // Identifier presented to peers and trackers, generated once per process
    // by the host and shared by every torrent.
    pub peer_id: PeerId,

}

impl Config {
    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("downloads"),
            port: 6881,
            peer_id: generate_peer_id(),
        }
    }
}

// "libt-" followed by a 15-digit random integer, exactly 20 bytes.
pub fn generate_peer_id() -> PeerId {
    let n: u64 = rand::thread_rng().gen_range(0..1_000_000_000_000_000);
    let mut id = [0u8; 20];
    id.copy_from_slice(format!("libt-{:015}", n).as_bytes());
    id
}
