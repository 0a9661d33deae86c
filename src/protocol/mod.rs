//! Protocol module - Defines the wire protocol for msgque communication
//!
//! Framed connections use a fixed 12-byte little-endian head:
//! - 4 bytes payload length
//! - 2 bytes error code
//! - 1 byte command
//! - 1 byte action
//! - 2 bytes index
//! - 2 bytes flags
//!
//! followed by `len` payload bytes. Line connections carry raw
//! newline-terminated payloads with no head.

mod codec;
mod errors;
mod message;
mod parser;

pub use codec::*;
pub use errors::*;
pub use message::*;
pub use parser::*;

/// Size of the message head on the wire
pub const MSG_HEAD_SIZE: usize = 12;

/// Default upper bound for a single payload (1 MiB)
pub const DEFAULT_MAX_MSG_DATA_SIZE: u32 = 1024 * 1024;

/// Head flag bits. The core only carries them; higher layers interpret them.
pub mod flags {
    /// Payload is encrypted
    pub const ENCRYPT: u16 = 1 << 0;
    /// Payload is compressed
    pub const COMPRESS: u16 = 1 << 1;
    /// More data follows in a continuation frame
    pub const CONTINUE: u16 = 1 << 2;
    /// Sender requests an acknowledgement
    pub const NEED_ACK: u16 = 1 << 3;
    /// This frame is an acknowledgement
    pub const ACK: u16 = 1 << 4;
    /// This frame has been re-sent
    pub const RESEND: u16 = 1 << 5;
    /// Originated from a published client rather than an internal peer
    pub const CLIENT: u16 = 1 << 6;
}

/// How payloads are delimited on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgType {
    /// Length-prefixed frames with a 12-byte head
    #[default]
    Framed,
    /// Newline-delimited payloads, no head
    Line,
}
