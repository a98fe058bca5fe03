//! Length-prefixed frame codec for the LAN speed protocol.
//!
//! `[u32 big-endian length][kind byte][payload]`, where the length covers the
//! kind byte and payload. Kind `0x01` carries a JSON [`LanMessage`], kind
//! `0x02` raw filler bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::rpc::LanMessage;

/// Largest data payload a peer may send in one frame.
pub const MAX_DATA_CHUNK: usize = 1_048_576;

/// Maximum frame length: one full data chunk plus its kind byte.
const MAX_FRAME_SIZE: usize = MAX_DATA_CHUNK + 1;

const KIND_CONTROL: u8 = 0x01;
const KIND_DATA: u8 = 0x02;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(LanMessage),
    Data(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty frame")]
    Empty,
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Frame codec shared by the LAN client and server.
pub struct LanCodec {
    inner: LengthDelimitedCodec,
}

impl LanCodec {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self { inner }
    }
}

impl Default for LanCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Frame> for LanCodec {
    type Error = WireError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, payload) = match item {
            Frame::Control(msg) => (KIND_CONTROL, Bytes::from(serde_json::to_vec(&msg)?)),
            Frame::Data(bytes) => (KIND_DATA, bytes),
        };
        let len = payload.len() + 1;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(len));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u8(kind);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for LanCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if frame.is_empty() {
            return Err(WireError::Empty);
        }
        let kind = frame.get_u8();
        match kind {
            KIND_CONTROL => Ok(Some(Frame::Control(serde_json::from_slice(&frame)?))),
            KIND_DATA => Ok(Some(Frame::Data(frame.freeze()))),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}
