//! msgque - Message queues over TCP and UDP
//!
//! Every connection, listener and UDP peer is a [`network::MsgQue`]: a
//! bounded outbound channel plus a read task and a write task. Applications
//! implement [`network::MessageHandler`] and share one
//! [`runtime::Context`] across all queues.

pub mod config;
pub mod network;
pub mod protocol;
pub mod runtime;

pub use config::Config;
pub use network::{start_connect, start_server, MessageHandler, MsgQue, QueueRef};
pub use protocol::{Message, MessageHead, MsgType};
pub use runtime::Context;
