//! Application handler contract
//!
//! A [`MessageHandler`] is told about queue lifecycle events and receives
//! every message that is not a callback response. Per-message routing is
//! resolved through [`MessageHandler::handler_for`], usually backed by a
//! [`HandlerRegistry`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::QueueRef;
use crate::protocol::{cmd_act, Message};

/// Routed message handler. Returning false drops the connection.
pub type HandlerFn = Arc<dyn Fn(QueueRef, Message) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(QueueRef, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |queue, msg| Box::pin(f(queue, msg)))
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// A queue was accepted or created. Returning false rejects it.
    async fn on_new_msg_que(&self, _queue: &QueueRef) -> bool {
        true
    }

    /// A queue is being torn down
    async fn on_del_msg_que(&self, _queue: &QueueRef) {}

    /// Default handler for messages with no routed handler
    async fn on_process_msg(&self, _queue: &QueueRef, _msg: Message) -> bool {
        true
    }

    /// Outcome of a dial. Returning false on success drops the connection.
    async fn on_connect_complete(&self, _queue: &QueueRef, _ok: bool) -> bool {
        true
    }

    /// Routed handler for `msg`, if any
    fn handler_for(&self, _msg: &Message) -> Option<HandlerFn> {
        None
    }
}

/// Handlers keyed by command/action pair or by parsed object type
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_cmd_act: HashMap<u16, HandlerFn>,
    by_kind: HashMap<TypeId, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages whose head carries `cmd`/`act`
    pub fn register<F, Fut>(&mut self, cmd: u8, act: u8, f: F)
    where
        F: Fn(QueueRef, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.by_cmd_act.insert(cmd_act(cmd, act), handler_fn(f));
    }

    /// Route headless messages whose parsed object is a `T`
    pub fn register_parsed<T, F, Fut>(&mut self, f: F)
    where
        T: Any,
        F: Fn(QueueRef, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.by_kind.insert(TypeId::of::<T>(), handler_fn(f));
    }

    /// Headless messages route by parsed type, headed ones by cmd/act
    pub fn lookup(&self, msg: &Message) -> Option<HandlerFn> {
        if msg.cmd_act() == 0 {
            let parsed = msg.parsed.as_ref()?;
            self.by_kind.get(&Any::type_id(&**parsed)).cloned()
        } else {
            self.by_cmd_act.get(&msg.cmd_act()).cloned()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_cmd_act.is_empty() && self.by_kind.is_empty()
    }
}

/// Sends every message back to where it came from
#[derive(Default)]
pub struct EchoHandler {
    routes: HandlerRegistry,
}

impl EchoHandler {
    pub fn new(routes: HandlerRegistry) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_new_msg_que(&self, queue: &QueueRef) -> bool {
        tracing::info!(
            "msgque {} opened ({:?} {:?} from {})",
            queue.id(),
            queue.kind(),
            queue.role(),
            queue.remote_addr().unwrap_or_default()
        );
        true
    }

    async fn on_del_msg_que(&self, queue: &QueueRef) {
        tracing::info!("msgque {} closed", queue.id());
    }

    async fn on_process_msg(&self, queue: &QueueRef, msg: Message) -> bool {
        queue.send(msg).await;
        true
    }

    fn handler_for(&self, msg: &Message) -> Option<HandlerFn> {
        self.routes.lookup(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageHead;

    struct Ping;

    #[test]
    fn test_lookup_by_cmd_act() {
        let mut registry = HandlerRegistry::new();
        registry.register(1, 2, |_, _| async { true });

        assert!(registry.lookup(&Message::tagged(1, 2, 99)).is_some());
        assert!(registry.lookup(&Message::tagged(1, 3, 0)).is_none());
        assert!(registry.lookup(&Message::text("x")).is_none());
    }

    #[test]
    fn test_lookup_by_parsed_kind() {
        let mut registry = HandlerRegistry::new();
        registry.register_parsed::<Ping, _, _>(|_, _| async { true });

        let mut msg = Message::from_head(MessageHead::default());
        msg.parsed = Some(Arc::new(Ping));
        assert!(registry.lookup(&msg).is_some());

        msg.parsed = Some(Arc::new(5u8));
        assert!(registry.lookup(&msg).is_none());

        // Headed messages never route by kind
        let mut headed = Message::tagged(4, 4, 0);
        headed.parsed = Some(Arc::new(Ping));
        assert!(registry.lookup(&headed).is_none());
    }
}
