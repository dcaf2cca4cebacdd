//! Client-socket framing: `u16 length; payload` with a 64 KiB cap.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::datagram::{Datagram, WireError, DATAGRAM_MAX_SIZE};

/// tokio-util codec for the client wire protocol.
///
/// Decoded items are the frame payloads (message type onward); the length
/// prefix is stripped. Encoding prepends the prefix and rejects payloads
/// that cannot fit behind it.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = usize::from(u16::from_le_bytes([src[0], src[1]]));
        if src.len() < 2 + len {
            // Wait for the rest of the frame.
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        src.advance(2);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Datagram> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Datagram, dst: &mut BytesMut) -> Result<(), WireError> {
        self.encode(item.freeze(), dst)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        if item.len() > DATAGRAM_MAX_SIZE {
            return Err(WireError::Oversized(item.len()));
        }
        dst.reserve(2 + item.len());
        dst.put_u16_le(item.len() as u16);
        dst.put_slice(&item);
        Ok(())
    }
}
