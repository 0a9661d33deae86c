//! Message definitions
//!
//! A [`Message`] is what queues send and what handlers receive. It carries
//! an optional head, an optional payload and, once an application parser
//! has run, an opaque parsed object.

use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::{ErrorCode, MSG_HEAD_SIZE};

/// Opaque, shareable value attached to a message or a queue
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Combine command and action into the handler lookup key
pub fn cmd_act(cmd: u8, act: u8) -> u16 {
    (cmd as u16) << 8 | act as u16
}

/// Combine command, action and index into the callback correlation tag
pub fn tag(cmd: u8, act: u8, index: u16) -> u32 {
    (cmd as u32) << 16 | (act as u32) << 8 | index as u32
}

/// Fixed-layout message head
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHead {
    /// Payload length in bytes
    pub len: u32,
    /// Error code, see [`ErrorCode`]
    pub error: u16,
    pub cmd: u8,
    pub act: u8,
    /// Request index, part of the tag
    pub index: u16,
    /// Flag bits, see [`super::flags`]
    pub flags: u16,
}

impl MessageHead {
    pub fn new(cmd: u8, act: u8, index: u16) -> Self {
        Self {
            cmd,
            act,
            index,
            ..Default::default()
        }
    }

    pub fn cmd_act(&self) -> u16 {
        cmd_act(self.cmd, self.act)
    }

    pub fn tag(&self) -> u32 {
        tag(self.cmd, self.act, self.index)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

impl fmt::Display for MessageHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Len:{} Error:{} Cmd:{} Act:{} Index:{} Flags:{}",
            self.len, self.error, self.cmd, self.act, self.index, self.flags
        )
    }
}

/// A unit of work flowing through a queue
#[derive(Clone, Default)]
pub struct Message {
    /// Message head, absent on line connections
    pub head: Option<MessageHead>,
    /// Raw payload
    pub data: Option<Bytes>,
    /// Object produced by the application parser
    pub parsed: Option<Attachment>,
    /// Application-defined value
    pub user: Option<Attachment>,
    /// Pre-serialized wire form of a forever message
    frozen: Option<Bytes>,
}

impl Message {
    /// Message with a full head and payload
    pub fn new(cmd: u8, act: u8, index: u16, error: u16, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            head: Some(MessageHead {
                len: data.len() as u32,
                error,
                cmd,
                act,
                index,
                flags: 0,
            }),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Head-only message, typically a request awaiting a callback
    pub fn tagged(cmd: u8, act: u8, index: u16) -> Self {
        Self::from_head(MessageHead::new(cmd, act, index))
    }

    /// Message with an empty head and the given payload
    pub fn with_data(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            head: Some(MessageHead {
                len: data.len() as u32,
                ..Default::default()
            }),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Headless message, the natural shape on line connections
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Some(Bytes::from(text.into())),
            ..Default::default()
        }
    }

    /// Head-only message carrying an error code
    pub fn error(code: ErrorCode) -> Self {
        Self::from_head(MessageHead {
            error: code.id(),
            ..Default::default()
        })
    }

    /// Immutable message serialized once; every send reuses the buffer.
    pub fn forever(cmd: u8, act: u8, index: u16, error: u16, data: impl Into<Bytes>) -> Self {
        let mut msg = Self::new(cmd, act, index, error, data);
        msg.frozen = Some(msg.to_bytes());
        msg
    }

    pub fn from_head(head: MessageHead) -> Self {
        Self {
            head: Some(head),
            ..Default::default()
        }
    }

    pub fn from_parts(head: MessageHead, data: Bytes) -> Self {
        Self {
            head: Some(head),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn is_forever(&self) -> bool {
        self.frozen.is_some()
    }

    pub fn cmd(&self) -> u8 {
        self.head.map(|h| h.cmd).unwrap_or(0)
    }

    pub fn act(&self) -> u8 {
        self.head.map(|h| h.act).unwrap_or(0)
    }

    /// Correlation tag, 0 for headless messages
    pub fn tag(&self) -> u32 {
        self.head.map(|h| h.tag()).unwrap_or(0)
    }

    /// Handler lookup key, 0 for headless messages
    pub fn cmd_act(&self) -> u16 {
        self.head.map(|h| h.cmd_act()).unwrap_or(0)
    }

    pub fn payload(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn has_payload(&self) -> bool {
        !self.payload().is_empty()
    }

    /// Copy command, action and index from `other` so a reply correlates
    /// with its request.
    pub fn copy_tag(mut self, other: &Message) -> Self {
        if let Some(src) = other.head {
            let head = self.head.get_or_insert_with(MessageHead::default);
            head.cmd = src.cmd;
            head.act = src.act;
            head.index = src.index;
            self.frozen = None;
        }
        self
    }

    /// Downcast the parsed object
    pub fn parsed_as<T: Any>(&self) -> Option<&T> {
        self.parsed.as_deref()?.downcast_ref::<T>()
    }

    /// Wire form: head plus payload, or the bare payload for headless messages
    pub fn to_bytes(&self) -> Bytes {
        if let Some(frozen) = &self.frozen {
            return frozen.clone();
        }
        match self.head {
            Some(mut head) => head.bytes_with_data(self.payload()),
            None => self.data.clone().unwrap_or_default(),
        }
    }

    /// Head and payload as two buffers for a framed writer. A missing head
    /// is written as an empty one; the length always matches the payload.
    pub(crate) fn frame_parts(&self) -> (Bytes, Bytes) {
        if let Some(frozen) = &self.frozen {
            return (
                frozen.slice(..MSG_HEAD_SIZE),
                frozen.slice(MSG_HEAD_SIZE..),
            );
        }
        let mut head = self.head.unwrap_or_default();
        let payload = self.data.clone().unwrap_or_default();
        head.len = payload.len() as u32;
        (Bytes::copy_from_slice(&head.encode()), payload)
    }

    /// Single-buffer framed form, for datagrams
    pub(crate) fn frame_bytes(&self) -> Bytes {
        if self.head.is_some() {
            return self.to_bytes();
        }
        MessageHead::default().bytes_with_data(self.payload())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("head", &self.head)
            .field("data_len", &self.data.as_ref().map(|d| d.len()))
            .field("parsed", &self.parsed.is_some())
            .field("forever", &self.is_forever())
            .finish()
    }
}
