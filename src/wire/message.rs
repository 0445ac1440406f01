use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{bitfield::Bitfield, MAX_MESSAGE_LEN};
use super::WireError;

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;

// A block address: the request/cancel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {

    pub piece: u32,

    pub offset: u32,

    pub length: u32,

}

// A block with its payload: the piece message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {

    pub piece: u32,

    pub offset: u32,

    pub data: Vec<u8>,

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // A zero-length frame; advises the peer the connection is still live.
    KeepAlive,

    // No further requests will be served.
    Choke,

    // Requests will be served again.
    Unchoke,

    // The sender wants to request blocks.
    Interested,

    // The sender no longer wants to request blocks.
    NotInterested,

    // The sender acquired the piece at this index.
    Have { idx: u32 },

    // Which pieces the sender holds, sent straight after the handshake.
    Bitfield(Bitfield),

    Request(BlockRequest),

    Piece(BlockData),

    Cancel(BlockRequest),

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = WireError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(CHOKE);
            },

            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(UNCHOKE);
            },

            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(INTERESTED);
            },

            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(NOT_INTERESTED);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(HAVE);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                dst.put_u32(1 + bitfield.byte_len() as u32);
                dst.put_u8(BITFIELD);
                dst.extend_from_slice(bitfield.as_bytes());
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(REQUEST);
                dst.put_u32(block.piece);
                dst.put_u32(block.offset);
                dst.put_u32(block.length);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(PIECE);
                dst.put_u32(block.piece);
                dst.put_u32(block.offset);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(CANCEL);
                dst.put_u32(block.piece);
                dst.put_u32(block.offset);
                dst.put_u32(block.length);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let msg_len = peeker.get_u32();
        if msg_len > MAX_MESSAGE_LEN {
            return Err(WireError::OversizedMessage(msg_len));
        }
        if src.remaining() < 4 + msg_len as usize {
            // Wait for the rest of the frame.
            return Ok(None);
        }

        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let body_len = msg_len as usize - 1;
        let expect = |want: bool| -> Result<(), WireError> {
            if want { Ok(()) } else { Err(WireError::InvalidPayload { id, length: msg_len }) }
        };

        let msg = match id {

            CHOKE => {
                expect(body_len == 0)?;
                Message::Choke
            },

            UNCHOKE => {
                expect(body_len == 0)?;
                Message::Unchoke
            },

            INTERESTED => {
                expect(body_len == 0)?;
                Message::Interested
            },

            NOT_INTERESTED => {
                expect(body_len == 0)?;
                Message::NotInterested
            },

            HAVE => {
                expect(body_len == 4)?;
                Message::Have { idx: src.get_u32() }
            },

            BITFIELD => {
                let mut field = vec![0u8; body_len];
                src.copy_to_slice(&mut field);
                Message::Bitfield(Bitfield::from_bytes(&field))
            },

            REQUEST => {
                expect(body_len == 12)?;
                Message::Request(BlockRequest {
                    piece: src.get_u32(),
                    offset: src.get_u32(),
                    length: src.get_u32(),
                })
            },

            PIECE => {
                expect(body_len >= 8)?;
                let piece = src.get_u32();
                let offset = src.get_u32();
                let mut data = vec![0u8; body_len - 8];
                src.copy_to_slice(&mut data);
                Message::Piece(BlockData { piece, offset, data })
            },

            CANCEL => {
                expect(body_len == 12)?;
                Message::Cancel(BlockRequest {
                    piece: src.get_u32(),
                    offset: src.get_u32(),
                    length: src.get_u32(),
                })
            },

            id => {
                // Drain the body so the stream stays framed; the session
                // logs this one and keeps reading.
                src.advance(body_len);
                return Err(WireError::UnknownMessage { id, length: msg_len });
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_set()),
            Message::Request(block) => write!(f, "request for block ({}, {}, {})",
                block.piece,
                block.offset,
                block.length,
            ),
            Message::Piece(block) => write!(f, "block ({}, {}, {} bytes)",
                block.piece,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block ({}, {}, {})",
                block.piece,
                block.offset,
                block.length,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_message() {
        let messages = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xB },
            Message::Bitfield(Bitfield::from_bytes(&[0x81, 0x40])),
            Message::Request(BlockRequest { piece: 0xB, offset: 0x134000, length: 0x4000 }),
            Message::Piece(BlockData { piece: 0xB, offset: 0x134000, data: vec![1, 2, 3] }),
            Message::Cancel(BlockRequest { piece: 0xB, offset: 0x134000, length: 0x4000 }),
        ];

        for msg in messages {
            let mut buf = BytesMut::new();
            MessageCodec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty(), "frame not fully consumed for {}", msg);
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);

        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Have { idx: 0xB }, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 5, 4, 0, 0, 0, 0xB]);

        let mut buf = BytesMut::new();
        MessageCodec.encode(
            Message::Request(BlockRequest { piece: 0xB, offset: 0x134000, length: 0x4000 }),
            &mut buf,
        ).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0xD, 6, 0, 0, 0, 0xB, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);

        let mut buf = BytesMut::new();
        MessageCodec.encode(
            Message::Bitfield(Bitfield::from_bytes(&[0x01, 0x02, 0x03])),
            &mut buf,
        ).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 4, 5, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_decode_chunked() {
        let mut buf = BytesMut::new();

        // Half the interested frame.
        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Interested));

        // Half a piece frame.
        buf.extend_from_slice(&[0, 0, 0, 12, 7, 0, 0, 0, 0xB, 0, 0x13, 0x40, 0, 1]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[2, 3]);
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap(),
            Some(Message::Piece(BlockData { piece: 0xB, offset: 0x134000, data: vec![1, 2, 3] })),
        );
    }

    #[test]
    fn test_decode_empty() {
        let mut buf = BytesMut::new();
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_id_drains_and_stream_continues() {
        let mut buf = BytesMut::new();
        // Unknown id 20 with a 4 byte body, followed by an unchoke.
        buf.extend_from_slice(&[0, 0, 0, 5, 20, 0xDE, 0xAD, 0xBE, 0xEF]);
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);

        match MessageCodec.decode(&mut buf) {
            Err(WireError::UnknownMessage { id: 20, length: 5 }) => {},
            other => panic!("expected unknown message error, got {:?}", other.map(|m| m.map(|m| m.to_string()))),
        }
        // The body was drained, so the next frame decodes cleanly.
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        buf.put_u8(BITFIELD);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(WireError::OversizedMessage(_)),
        ));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        // A have frame with a 2 byte body.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 3, 4, 0, 0]);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(WireError::InvalidPayload { id: 4, length: 3 }),
        ));
    }
}
