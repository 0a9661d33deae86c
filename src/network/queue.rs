//! Message queue core shared by the TCP and UDP transports
//!
//! A [`MsgQue`] owns one outbound channel, one callback table and, once
//! active, one read task and one write task. Transport-specific state lives
//! in its [`Link`].

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;

use super::callback::{CallbackSender, CallbackTable};
use super::handler::MessageHandler;
use super::tcp::{self, TcpLink};
use super::udp::{self, UdpLink};
use crate::protocol::{Attachment, Message, MessageParser, MsgType, ParseErrorPolicy};
use crate::runtime::Context;

/// Shared handle to a queue
pub type QueueRef = Arc<MsgQue>;

/// Item on the outbound channel; `None` is the wake-up sentinel
pub(crate) type Outbound = Option<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    /// Accepts connections or datagrams
    Listen,
    /// Dials out, may reconnect
    Connect,
    /// Created by a listener for one peer
    Accept,
}

/// Lifecycle of one connection generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QueueState {
    Init = 0,
    Active = 1,
    Stopping = 2,
    Stopped = 3,
}

impl QueueState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueState::Init,
            1 => QueueState::Active,
            2 => QueueState::Stopping,
            _ => QueueState::Stopped,
        }
    }
}

/// Transport-specific state
pub(crate) enum Link {
    Tcp(TcpLink),
    Udp(UdpLink),
}

/// Everything needed to create a queue
pub(crate) struct QueueOptions {
    pub kind: NetKind,
    pub role: ConnRole,
    pub msg_type: MsgType,
    pub handler: Arc<dyn MessageHandler>,
    pub parser: Option<Arc<dyn MessageParser>>,
    pub link: Link,
    pub available: bool,
    /// Listeners never send and get no outbound channel
    pub with_channel: bool,
    pub timeout_secs: u64,
}

/// Lock a std mutex, recovering the data from a poisoned lock
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct MsgQue {
    id: u32,
    kind: NetKind,
    role: ConnRole,
    msg_type: MsgType,
    pub(crate) ctx: Context,
    handler: Arc<dyn MessageHandler>,
    parser: Option<Arc<dyn MessageParser>>,
    state: AtomicU8,
    stop_flag: AtomicBool,
    available: AtomicBool,
    pub(crate) initialized: AtomicBool,
    timeout_secs: AtomicU64,
    writer: Mutex<Option<mpsc::Sender<Outbound>>>,
    outbox: Mutex<Option<mpsc::Receiver<Outbound>>>,
    callbacks: CallbackTable,
    user: RwLock<Option<Attachment>>,
    ext_data: RwLock<Option<Attachment>>,
    /// Read and write tasks of the current generation
    pub(crate) loops: TaskTracker,
    pub(crate) link: Link,
}

impl MsgQue {
    /// Create a queue and add it to the connection registry
    pub(crate) fn create(ctx: &Context, opts: QueueOptions) -> QueueRef {
        let (writer, outbox) = if opts.with_channel {
            let (tx, rx) = mpsc::channel(ctx.config().queue.send_channel_capacity.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let queue = Arc::new(Self {
            id: ctx.next_queue_id(),
            kind: opts.kind,
            role: opts.role,
            msg_type: opts.msg_type,
            ctx: ctx.clone(),
            handler: opts.handler,
            parser: opts.parser,
            state: AtomicU8::new(QueueState::Init as u8),
            stop_flag: AtomicBool::new(false),
            available: AtomicBool::new(opts.available),
            initialized: AtomicBool::new(false),
            timeout_secs: AtomicU64::new(opts.timeout_secs),
            writer: Mutex::new(writer),
            outbox: Mutex::new(outbox),
            callbacks: CallbackTable::new(),
            user: RwLock::new(None),
            ext_data: RwLock::new(None),
            loops: TaskTracker::new(),
            link: opts.link,
        });
        ctx.queues().insert(queue.id, queue.clone());
        queue
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> NetKind {
        self.kind
    }

    pub fn role(&self) -> ConnRole {
        self.role
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    pub fn parser(&self) -> Option<&Arc<dyn MessageParser>> {
        self.parser.as_ref()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn local_addr(&self) -> Option<String> {
        match &self.link {
            Link::Tcp(link) => link.local_addr(),
            Link::Udp(link) => link.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> Option<String> {
        match &self.link {
            Link::Tcp(link) => link.remote_addr(),
            Link::Udp(link) => link.remote_addr(),
        }
    }

    /// Whether sends are currently accepted
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.load(Ordering::Relaxed)
    }

    /// Idle/read/write deadline in seconds, 0 disables it
    pub fn set_timeout(&self, secs: u64) {
        self.timeout_secs.store(secs, Ordering::Relaxed);
    }

    pub fn user(&self) -> Option<Attachment> {
        self.user.read().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn set_user(&self, user: Option<Attachment>) {
        if let Ok(mut slot) = self.user.write() {
            *slot = user;
        }
    }

    pub fn ext_data(&self) -> Option<Attachment> {
        self.ext_data.read().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn set_ext_data(&self, data: Option<Attachment>) {
        if let Ok(mut slot) = self.ext_data.write() {
            *slot = data;
        }
    }

    /// Whether this queue has been stopped. Also stops it if the process is
    /// shutting down.
    pub fn is_stopped(self: &Arc<Self>) -> bool {
        if !self.stop_flag.load(Ordering::Acquire) && self.ctx.is_stopping() {
            self.stop();
        }
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Stop the queue. Concurrent calls collapse into one cleanup.
    pub fn stop(self: &Arc<Self>) {
        match &self.link {
            Link::Tcp(_) => tcp::stop(self),
            Link::Udp(_) => udp::stop(self),
        }
    }

    /// Re-dial a connector after `delay_secs` (at least 1 s on repeat
    /// attempts). Returns false when the request was ignored: wrong role,
    /// shutdown, live connection, or another attempt already in flight.
    pub fn reconnect(self: &Arc<Self>, delay_secs: u64) -> bool {
        match &self.link {
            Link::Tcp(_) => tcp::reconnect(self, delay_secs),
            Link::Udp(_) => false,
        }
    }

    /// Queue `msg` for writing. Returns false when the queue is not
    /// available or its channel is closed; never panics.
    pub async fn send(&self, msg: Message) -> bool {
        if !self.is_available() {
            return false;
        }
        let tx = match lock(&self.writer).as_ref() {
            Some(tx) => tx.clone(),
            None => return false,
        };
        tx.send(Some(msg)).await.is_ok()
    }

    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Message::text(text)).await
    }

    pub async fn send_text_ln(&self, text: impl Into<String>) -> bool {
        let mut text = text.into();
        text.push('\n');
        self.send(Message::text(text)).await
    }

    pub async fn send_bytes(&self, data: impl Into<Bytes>) -> bool {
        self.send(Message::from_data(data)).await
    }

    pub async fn send_bytes_ln(&self, data: &[u8]) -> bool {
        let mut line = Vec::with_capacity(data.len() + 1);
        line.extend_from_slice(data);
        line.push(b'\n');
        self.send(Message::from_data(line)).await
    }

    /// Send `msg` and deliver the response with the same tag to `tx`. If the
    /// send fails, `tx` receives `None` right away.
    pub async fn send_callback(&self, msg: Message, tx: CallbackSender) -> bool {
        let tag = msg.tag();
        self.callbacks.register(tag, tx);
        if self.send(msg).await {
            return true;
        }
        if let Some(tx) = self.callbacks.take(tag) {
            let _ = tx.send(None);
        }
        false
    }

    /// Send `msg` and wait for the response with the same tag. `None` means
    /// no response will come.
    pub async fn request(&self, msg: Message) -> Option<Message> {
        let (tx, rx) = oneshot::channel();
        self.send_callback(msg, tx).await;
        rx.await.ok().flatten()
    }

    /// Complete the waiter registered under `msg`'s tag
    pub fn try_callback(&self, msg: &Message) -> bool {
        self.callbacks.complete(msg)
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Parse, then route: pending callback, routed handler, default handler.
    /// Returns false when the connection should be dropped.
    pub(crate) async fn process_msg(self: &Arc<Self>, mut msg: Message) -> bool {
        if let Some(parser) = &self.parser {
            if msg.has_payload() {
                match parser.parse(&msg) {
                    Ok(parsed) => msg.parsed = Some(parsed),
                    Err(err) => match parser.error_policy() {
                        ParseErrorPolicy::SendRemind => {
                            tracing::debug!("msgque:{} parse failed, reminding: {}", self.id, err);
                            let mut remind = parser.remind_message(&err, self.msg_type);
                            if msg.head.is_some() {
                                remind = remind.copy_tag(&msg);
                            }
                            self.send(remind).await;
                            return true;
                        }
                        ParseErrorPolicy::Close => {
                            tracing::warn!("msgque:{} parse failed, closing: {}", self.id, err);
                            return false;
                        }
                        ParseErrorPolicy::Continue => return true,
                    },
                }
            }
        }

        if self.try_callback(&msg) {
            return true;
        }

        match self.handler.handler_for(&msg) {
            Some(route) => route(self.clone(), msg).await,
            None => self.handler.on_process_msg(self, msg).await,
        }
    }

    /// Run `fut` as one of this queue's read/write tasks
    pub(crate) fn spawn_loop<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ctx.supervisor().spawn(self.loops.track_future(fut));
    }

    pub(crate) fn take_outbox(&self) -> Option<mpsc::Receiver<Outbound>> {
        lock(&self.outbox).take()
    }

    /// Wake a writer blocked on an empty channel
    pub(crate) fn push_sentinel(&self) {
        if let Some(tx) = lock(&self.writer).as_ref() {
            let _ = tx.try_send(None);
        }
    }

    fn advance_state(&self, state: QueueState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub(crate) fn mark_active(&self) {
        self.advance_state(QueueState::Active);
    }

    /// Flip the stop flag. Only the caller that flips it returns true.
    pub(crate) fn begin_stop(&self) -> bool {
        if self
            .stop_flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.advance_state(QueueState::Stopping);
        self.set_available(false);
        true
    }

    /// Release every callback waiter, close the outbound channel and leave
    /// the connection registry.
    pub(crate) fn base_stop(self: &Arc<Self>) {
        lock(&self.writer).take();
        let released = self.callbacks.clear();
        if released > 0 {
            tracing::debug!("msgque:{} released {} pending callbacks", self.id, released);
        }
        self.ctx.queues().remove_if_same(&self.id, self);
        self.advance_state(QueueState::Stopped);
        tracing::info!("msgque close id:{}", self.id);
    }

    /// Start a fresh connection generation on a reconnecting queue
    pub(crate) fn reset_generation(self: &Arc<Self>) {
        let released = self.callbacks.clear();
        if released > 0 {
            tracing::debug!("msgque:{} released {} callbacks from previous connection", self.id, released);
        }
        let (tx, rx) = mpsc::channel(self.ctx.config().queue.send_channel_capacity.max(1));
        *lock(&self.writer) = Some(tx);
        *lock(&self.outbox) = Some(rx);
        self.state.store(QueueState::Init as u8, Ordering::Release);
        self.stop_flag.store(false, Ordering::Release);
        self.ctx.queues().insert(self.id, self.clone());
    }
}

impl fmt::Debug for MsgQue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgQue")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("msg_type", &self.msg_type)
            .field("state", &self.state())
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::network::{HandlerFn, HandlerRegistry};
    use crate::protocol::{ErrorCode, JsonParser};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Counting {
        routes: HandlerRegistry,
        processed: AtomicU32,
        deleted: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn on_del_msg_que(&self, _queue: &QueueRef) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_process_msg(&self, _queue: &QueueRef, _msg: Message) -> bool {
            self.processed.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn handler_for(&self, msg: &Message) -> Option<HandlerFn> {
            self.routes.lookup(msg)
        }
    }

    #[derive(Debug, Deserialize)]
    struct Login {
        #[allow(dead_code)]
        user: u32,
    }

    fn detached(
        ctx: &Context,
        handler: Arc<dyn MessageHandler>,
        parser: Option<Arc<dyn MessageParser>>,
        msg_type: MsgType,
    ) -> QueueRef {
        MsgQue::create(
            ctx,
            QueueOptions {
                kind: NetKind::Tcp,
                role: ConnRole::Accept,
                msg_type,
                handler,
                parser,
                link: Link::Tcp(TcpLink::default()),
                available: true,
                with_channel: true,
                timeout_secs: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_send_on_unavailable_queue() {
        let ctx = Context::new(Config::default());
        let q = detached(&ctx, Arc::new(Counting::default()), None, MsgType::Framed);
        q.set_available(false);
        assert!(!q.send(Message::tagged(1, 1, 1)).await);

        q.set_available(true);
        assert!(q.send(Message::tagged(1, 1, 1)).await);
        let mut outbox = q.take_outbox().unwrap();
        let queued = outbox.recv().await.unwrap().unwrap();
        assert_eq!(queued.tag(), Message::tagged(1, 1, 1).tag());
    }

    #[tokio::test]
    async fn test_send_callback_released_on_stop() {
        let ctx = Context::new(Config::default());
        let q = detached(&ctx, Arc::new(Counting::default()), None, MsgType::Framed);
        assert_eq!(ctx.queues().len(), 1);

        let (tx, rx) = oneshot::channel();
        assert!(q.send_callback(Message::tagged(2, 3, 4), tx).await);
        assert_eq!(q.pending_callbacks(), 1);

        q.stop();
        assert!(rx.await.unwrap().is_none());
        ctx.supervisor().wait().await;
        assert_eq!(q.state(), QueueState::Stopped);
        assert!(ctx.queues().is_empty());
        assert!(!q.send(Message::tagged(2, 3, 4)).await);
    }

    #[tokio::test]
    async fn test_send_callback_on_dead_queue_answers_none() {
        let ctx = Context::new(Config::default());
        let q = detached(&ctx, Arc::new(Counting::default()), None, MsgType::Framed);
        q.set_available(false);

        let (tx, rx) = oneshot::channel();
        assert!(!q.send_callback(Message::tagged(2, 3, 4), tx).await);
        assert!(rx.await.unwrap().is_none());
        assert_eq!(q.pending_callbacks(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_callback_releases_earlier_waiter() {
        let ctx = Context::new(Config::default());
        let q = detached(&ctx, Arc::new(Counting::default()), None, MsgType::Framed);

        let (first_tx, first_rx) = oneshot::channel();
        assert!(q.send_callback(Message::tagged(2, 3, 4), first_tx).await);
        q.set_available(false);

        let (second_tx, second_rx) = oneshot::channel();
        assert!(!q.send_callback(Message::tagged(2, 3, 4), second_tx).await);
        assert!(first_rx.await.unwrap().is_none());
        assert!(second_rx.await.unwrap().is_none());
        assert_eq!(q.pending_callbacks(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_stop_cleans_up_once() {
        let ctx = Context::new(Config::default());
        let handler = Arc::new(Counting::default());
        let q = detached(&ctx, handler.clone(), None, MsgType::Framed);
        q.initialized.store(true, Ordering::SeqCst);

        let stoppers: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.stop() })
            })
            .collect();
        for stopper in stoppers {
            stopper.await.unwrap();
        }
        ctx.supervisor().wait().await;

        assert_eq!(handler.deleted.load(Ordering::SeqCst), 1);
        assert_eq!(q.state(), QueueState::Stopped);
        assert!(q.is_stopped());
    }

    #[tokio::test]
    async fn test_dispatch_precedence() {
        let ctx = Context::new(Config::default());
        let routed = Arc::new(AtomicU32::new(0));
        let mut routes = HandlerRegistry::new();
        let counter = routed.clone();
        routes.register(1, 2, move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        let handler = Arc::new(Counting {
            routes,
            ..Default::default()
        });
        let q = detached(&ctx, handler.clone(), None, MsgType::Framed);

        // A pending callback wins over the routed handler
        let (tx, rx) = oneshot::channel();
        q.send_callback(Message::tagged(1, 2, 5), tx).await;
        assert!(q.process_msg(Message::tagged(1, 2, 5)).await);
        assert!(rx.await.unwrap().is_some());
        assert_eq!(routed.load(Ordering::SeqCst), 0);

        assert!(q.process_msg(Message::tagged(1, 2, 6)).await);
        assert_eq!(routed.load(Ordering::SeqCst), 1);

        assert!(q.process_msg(Message::tagged(3, 3, 0)).await);
        assert_eq!(handler.processed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_sends_remind() {
        let ctx = Context::new(Config::default());
        let handler = Arc::new(Counting::default());
        let parser: Arc<dyn MessageParser> = Arc::new(JsonParser::<Login>::default());
        let q = detached(&ctx, handler.clone(), Some(parser), MsgType::Framed);
        let mut outbox = q.take_outbox().unwrap();

        let bad = Message::new(7, 8, 9, 0, &b"not json"[..]);
        assert!(q.process_msg(bad.clone()).await);
        assert_eq!(handler.processed.load(Ordering::SeqCst), 0);

        let remind = outbox.recv().await.unwrap().unwrap();
        assert_eq!(remind.tag(), bad.tag());
        assert_eq!(remind.head.map(|h| h.error), Some(ErrorCode::JsonUnpack.id()));

        let good = Message::new(7, 8, 10, 0, &br#"{"user":3}"#[..]);
        assert!(q.process_msg(good).await);
        assert_eq!(handler.processed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_policies() {
        let ctx = Context::new(Config::default());
        let handler = Arc::new(Counting::default());
        let bad = Message::new(1, 1, 1, 0, &b"{"[..]);

        let close: Arc<dyn MessageParser> = Arc::new(JsonParser::<Login>::new(ParseErrorPolicy::Close));
        let q = detached(&ctx, handler.clone(), Some(close), MsgType::Framed);
        assert!(!q.process_msg(bad.clone()).await);

        let skip: Arc<dyn MessageParser> = Arc::new(JsonParser::<Login>::new(ParseErrorPolicy::Continue));
        let q = detached(&ctx, handler.clone(), Some(skip), MsgType::Framed);
        assert!(q.process_msg(bad).await);
        assert_eq!(handler.processed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_line_remind_is_text() {
        let ctx = Context::new(Config::default());
        let parser: Arc<dyn MessageParser> = Arc::new(JsonParser::<Login>::default());
        let q = detached(&ctx, Arc::new(Counting::default()), Some(parser), MsgType::Line);
        let mut outbox = q.take_outbox().unwrap();

        assert!(q.process_msg(Message::from_data(&b"oops\n"[..])).await);
        let remind = outbox.recv().await.unwrap().unwrap();
        assert!(remind.head.is_none());
        assert!(remind.payload().ends_with(b"\n"));
    }

    #[tokio::test]
    async fn test_is_stopped_follows_shutdown() {
        let ctx = Context::new(Config::default());
        let q = detached(&ctx, Arc::new(Counting::default()), None, MsgType::Framed);
        assert!(!q.is_stopped());

        assert!(ctx.shutdown().begin());
        assert!(q.is_stopped());
        assert!(!q.is_available());
    }
}
