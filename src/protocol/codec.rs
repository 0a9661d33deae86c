//! Protocol codec for encoding/decoding message heads
//!
//! Heads are encoded field by field at fixed offsets, little-endian.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Message, MessageHead, MSG_HEAD_SIZE};

/// Codec errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("message too short: {0} bytes (need at least {})", MSG_HEAD_SIZE)]
    LenTooShort(usize),

    #[error("message too long: {len} bytes (max: {max})")]
    LenTooLong { len: u32, max: u32 },
}

impl MessageHead {
    /// Encode the head into its 12-byte wire form
    pub fn encode(&self) -> [u8; MSG_HEAD_SIZE] {
        let mut out = [0u8; MSG_HEAD_SIZE];
        out[0..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..6].copy_from_slice(&self.error.to_le_bytes());
        out[6] = self.cmd;
        out[7] = self.act;
        out[8..10].copy_from_slice(&self.index.to_le_bytes());
        out[10..12].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Append the encoded head to a buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len);
        buf.put_u16_le(self.error);
        buf.put_u8(self.cmd);
        buf.put_u8(self.act);
        buf.put_u16_le(self.index);
        buf.put_u16_le(self.flags);
    }

    /// Set `len` from `data` and return head plus payload in one buffer
    pub fn bytes_with_data(&mut self, data: &[u8]) -> Bytes {
        self.len = data.len() as u32;
        let mut buf = BytesMut::with_capacity(MSG_HEAD_SIZE + data.len());
        self.encode_into(&mut buf);
        buf.put_slice(data);
        buf.freeze()
    }

    /// Decode a head from the first 12 bytes of `data`, rejecting payload
    /// lengths above `max_len`.
    pub fn decode(data: &[u8], max_len: u32) -> Result<Self, CodecError> {
        if data.len() < MSG_HEAD_SIZE {
            return Err(CodecError::LenTooShort(data.len()));
        }

        let head = Self {
            len: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            error: u16::from_le_bytes([data[4], data[5]]),
            cmd: data[6],
            act: data[7],
            index: u16::from_le_bytes([data[8], data[9]]),
            flags: u16::from_le_bytes([data[10], data[11]]),
        };

        if head.len > max_len {
            return Err(CodecError::LenTooLong {
                len: head.len,
                max: max_len,
            });
        }

        Ok(head)
    }
}

/// Decode a whole datagram (head plus payload) into a message
pub fn decode_datagram(data: Bytes, max_len: u32) -> Result<Message, CodecError> {
    let head = MessageHead::decode(&data, max_len)?;
    if head.len == 0 {
        return Ok(Message::from_head(head));
    }

    let end = MSG_HEAD_SIZE + head.len as usize;
    if data.len() < end {
        return Err(CodecError::LenTooShort(data.len()));
    }
    Ok(Message::from_parts(head, data.slice(MSG_HEAD_SIZE..end)))
}
