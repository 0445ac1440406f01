use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{InfoHash, PeerId};
use super::WireError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// Name length byte, protocol string, 8 reserved bytes, info-hash, peer id.
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {

    pub info_hash: InfoHash,

    pub peer_id: PeerId,

}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = WireError;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL.len() as u8);
        dst.extend_from_slice(&PROTOCOL);
        dst.extend_from_slice(&[0u8; 8]);
        dst.extend_from_slice(&handshake.info_hash);
        dst.extend_from_slice(&handshake.peer_id);
        debug_assert_eq!(dst.len() % HANDSHAKE_LEN, 0);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }

        // Check the name length and whatever protocol bytes have arrived
        // before waiting on the full frame, so a bad peer fails immediately
        // and nothing past the handshake is consumed.
        if src[0] as usize != PROTOCOL.len() {
            return Err(WireError::BadHandshake);
        }
        let seen = src.len().min(1 + PROTOCOL.len());
        if src[1..seen] != PROTOCOL[..seen - 1] {
            return Err(WireError::BadHandshake);
        }

        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        // Name length, protocol, and the reserved bytes we ignore.
        src.advance(1 + PROTOCOL.len() + 8);
        let mut info_hash = [0u8; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(info_hash: [u8; 20], peer_id: [u8; 20]) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(Handshake::new(info_hash, peer_id), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_round_trip() {
        let mut buf = frame([0xAA; 20], *b"libt-000000000000001");
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let handshake = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(handshake.info_hash, [0xAA; 20]);
        assert_eq!(&handshake.peer_id, b"libt-000000000000001");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_waits() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"BitTorrent protocol");
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());
        // Nothing consumed while waiting.
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn test_bad_name_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(20);
        buf.extend_from_slice(b"BitTorrent protocolX");
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(WireError::BadHandshake),
        ));
    }

    #[test]
    fn test_bad_protocol_fails_before_full_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"BitTerrible");
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(WireError::BadHandshake),
        ));
    }

    #[test]
    fn test_trailing_data_left_in_buffer() {
        let mut buf = frame([1; 20], [2; 20]);
        buf.extend_from_slice(&[0, 0, 0, 0]);

        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_some());
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }
}
