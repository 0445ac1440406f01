mod handshake;
mod message;

pub use handshake::{Handshake, HandshakeCodec, HANDSHAKE_LEN, PROTOCOL};
pub use message::{BlockData, BlockRequest, Message, MessageCodec};

#[derive(Debug, thiserror::Error)]
pub enum WireError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed handshake")]
    BadHandshake,

    #[error("message length {0} exceeds the 128 KiB cap")]
    OversizedMessage(u32),

    // Non-fatal: the body has been drained and the stream is still framed.
    #[error("unknown message id {id} with length {length}")]
    UnknownMessage { id: u8, length: u32 },

    #[error("message id {id} carried a malformed length {length}")]
    InvalidPayload { id: u8, length: u32 },

}
