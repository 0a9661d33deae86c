//! Network module - TCP and UDP message queues
//!
//! Provides:
//! - Listeners that turn accepted connections and UDP peers into queues
//! - Connectors that dial out and reconnect on demand
//! - Request/response callbacks correlated by message tag
//! - The handler contract applications implement

mod callback;
mod handler;
mod queue;
mod tcp;
mod udp;

pub use callback::*;
pub use handler::*;
pub use queue::{ConnRole, MsgQue, NetKind, QueueRef, QueueState};

use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::{Attachment, CodecError, MessageParser, MsgType};
use crate::runtime::Context;

/// Network errors
#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type NetResult<T> = Result<T, NetError>;

/// Transport named by a listen address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Udp,
    /// TCP and UDP on the same address
    All,
}

/// A `scheme://host:port` listen address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub scheme: Scheme,
    pub address: String,
}

impl FromStr for ListenAddr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, address) = s
            .split_once("://")
            .ok_or_else(|| NetError::InvalidAddress(s.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Scheme::Tcp,
            "udp" => Scheme::Udp,
            "all" => Scheme::All,
            _ => return Err(NetError::InvalidAddress(s.to_string())),
        };
        if address.is_empty() {
            return Err(NetError::InvalidAddress(s.to_string()));
        }
        Ok(Self {
            scheme,
            address: address.to_string(),
        })
    }
}

/// Start listening on `addr` (`tcp://`, `udp://` or `all://`). Returns the
/// listener queues that were started.
pub async fn start_server(
    ctx: &Context,
    addr: &str,
    msg_type: MsgType,
    handler: Arc<dyn MessageHandler>,
    parser: Option<Arc<dyn MessageParser>>,
) -> NetResult<Vec<QueueRef>> {
    let listen: ListenAddr = addr.parse()?;
    let mut listeners = Vec::new();

    if matches!(listen.scheme, Scheme::Tcp | Scheme::All) {
        let q = tcp::listen(ctx, &listen.address, msg_type, handler.clone(), parser.clone())
            .await
            .inspect_err(|e| tracing::error!("listen on {} failed: {}", listen.address, e))?;
        listeners.push(q);
    }
    if matches!(listen.scheme, Scheme::Udp | Scheme::All) {
        let q = udp::listen(ctx, &listen.address, msg_type, handler, parser)
            .await
            .inspect_err(|e| tracing::error!("listen on {} failed: {}", listen.address, e))?;
        listeners.push(q);
    }

    Ok(listeners)
}

/// Create a TCP connector for `addr` and start dialing. Returns `None` if
/// the handler rejects the new queue.
pub async fn start_connect(
    ctx: &Context,
    addr: &str,
    msg_type: MsgType,
    handler: Arc<dyn MessageHandler>,
    parser: Option<Arc<dyn MessageParser>>,
    user: Option<Attachment>,
) -> Option<QueueRef> {
    let q = tcp::connector(ctx, addr, msg_type, handler, parser);
    q.set_user(user);
    tracing::info!("new msgque id:{} connect to addr:{}", q.id(), addr);

    if q.handler().on_new_msg_que(&q).await {
        q.reconnect(0);
        Some(q)
    } else {
        q.stop();
        None
    }
}
