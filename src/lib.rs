pub mod bitfield;
pub mod config;
pub mod listener;
pub mod metainfo;
pub mod peer;
pub mod store;
pub mod tally;
pub mod torrent;
pub mod tracker;
pub mod wire;

// Hard cap on any length-prefixed frame read off the peer wire.
pub(crate) const MAX_MESSAGE_LEN: u32 = 131_072;

// Largest block a peer may ask for in a single request message.
pub(crate) const MAX_REQUEST_LEN: u32 = 32_768;

// 20-byte SHA-1 of the raw bencoded info dictionary.
pub type InfoHash = [u8; 20];

// 20-byte identifier a client presents in handshakes and announces.
pub type PeerId = [u8; 20];

pub use bitfield::Bitfield;
pub use config::{generate_peer_id, Config};
pub use listener::Listener;
pub use metainfo::{MetaInfo, MetaInfoError};
pub use torrent::{Torrent, TorrentError, TorrentState};
