//! UDP transport
//!
//! One bound socket is shared by a pool of receive tasks. Each distinct
//! remote address gets a virtual session queue with its own inbound buffer
//! and its own read and write tasks; replies go out through the shared
//! socket.

use bytes::Bytes;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handler::MessageHandler;
use super::queue::{lock, ConnRole, Link, MsgQue, NetKind, Outbound, QueueRef, QueueOptions};
use super::{NetError, NetResult};
use crate::protocol::{decode_datagram, Message, MessageParser, MsgType};
use crate::runtime::Context;

/// Socket state of a UDP listener or session
pub(crate) struct UdpLink {
    socket: Arc<UdpSocket>,
    /// Remote address; `None` on the listener
    peer: Option<SocketAddr>,
    /// Cancels the receive pool of the shared socket
    socket_token: CancellationToken,
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    /// Milliseconds on the context clock of the last datagram either way
    last_tick: AtomicU64,
}

impl UdpLink {
    fn listener(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            peer: None,
            socket_token: CancellationToken::new(),
            inbound: Mutex::new(None),
            inbound_rx: Mutex::new(None),
            last_tick: AtomicU64::new(0),
        }
    }

    fn session(parent: &UdpLink, peer: SocketAddr, capacity: usize, now: u64) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            socket: parent.socket.clone(),
            peer: Some(peer),
            socket_token: parent.socket_token.clone(),
            inbound: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            last_tick: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_tick.store(now, Ordering::Relaxed);
    }

    fn last_tick(&self) -> u64 {
        self.last_tick.load(Ordering::Relaxed)
    }

    pub(crate) fn local_addr(&self) -> Option<String> {
        self.socket.local_addr().ok().map(|a| a.to_string())
    }

    pub(crate) fn remote_addr(&self) -> Option<String> {
        self.peer.map(|a| a.to_string())
    }
}

fn udp_link(q: &MsgQue) -> Option<&UdpLink> {
    match &q.link {
        Link::Udp(link) => Some(link),
        Link::Tcp(_) => None,
    }
}

fn bind_socket(address: &str, buffer_bytes: usize) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(address)?;
    socket.set_nonblocking(true)?;

    let sock_ref = SockRef::from(&socket);
    if let Err(e) = sock_ref.set_recv_buffer_size(buffer_bytes) {
        tracing::warn!("Failed to set UDP receive buffer to {} bytes: {}", buffer_bytes, e);
    }
    if let Err(e) = sock_ref.set_send_buffer_size(buffer_bytes) {
        tracing::warn!("Failed to set UDP send buffer to {} bytes: {}", buffer_bytes, e);
    }

    UdpSocket::from_std(socket)
}

/// Bind `address` and start the receive pool
pub(crate) async fn listen(
    ctx: &Context,
    address: &str,
    msg_type: MsgType,
    handler: Arc<dyn MessageHandler>,
    parser: Option<Arc<dyn MessageParser>>,
) -> NetResult<QueueRef> {
    let udp = &ctx.config().udp;
    let socket = bind_socket(address, udp.socket_buffer_bytes).map_err(|source| NetError::Bind {
        addr: address.to_string(),
        source,
    })?;
    let local = socket.local_addr()?;

    let q = MsgQue::create(
        ctx,
        QueueOptions {
            kind: NetKind::Udp,
            role: ConnRole::Listen,
            msg_type,
            handler,
            parser,
            link: Link::Udp(UdpLink::listener(Arc::new(socket))),
            available: true,
            with_channel: false,
            timeout_secs: 0,
        },
    );
    tracing::info!("new udp listen id:{} addr:{}", q.id(), local);
    q.mark_active();

    for index in 0..udp.reader_tasks.max(1) {
        ctx.supervisor()
            .spawn_with((q.clone(), index), |(q, index)| receive_loop(q, index));
    }
    Ok(q)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn receive_loop(listener: QueueRef, index: usize) {
    let Some(link) = udp_link(&listener) else { return };
    let mut buf = vec![0u8; listener.ctx.config().udp.max_datagram_bytes.max(1)];
    tracing::debug!("udp receiver {} for msgque:{} started", index, listener.id());

    loop {
        let received = tokio::select! {
            _ = link.socket_token.cancelled() => break,
            received = link.socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((0, _)) => continue,
            Ok((n, peer)) => route_datagram(&listener, link, peer, Bytes::copy_from_slice(&buf[..n])),
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                tracing::error!("udp msgque:{} recv failed: {}", listener.id(), e);
                break;
            }
        }
    }

    tracing::debug!("udp receiver {} for msgque:{} ended", index, listener.id());
    listener.stop();
}

/// Hand a datagram to the session for `peer`, creating it on first contact
fn route_datagram(listener: &QueueRef, link: &UdpLink, peer: SocketAddr, data: Bytes) {
    let ctx = &listener.ctx;
    let (session, created) = ctx
        .udp_sessions()
        .get_or_insert_with(peer.to_string(), || new_session(listener, link, peer));
    if created {
        start_session(&session);
    }
    if !push_datagram(&session, data) {
        tracing::warn!("drop msg because msgque full msgqueid:{}", session.id());
    }
}

fn new_session(listener: &QueueRef, link: &UdpLink, peer: SocketAddr) -> QueueRef {
    let ctx = &listener.ctx;
    MsgQue::create(
        ctx,
        QueueOptions {
            kind: NetKind::Udp,
            role: ConnRole::Accept,
            msg_type: listener.msg_type(),
            handler: listener.handler().clone(),
            parser: listener.parser().cloned(),
            link: Link::Udp(UdpLink::session(
                link,
                peer,
                ctx.config().udp.session_channel_capacity,
                ctx.now_millis(),
            )),
            available: true,
            with_channel: true,
            timeout_secs: ctx.config().queue.timeout_secs,
        },
    )
}

/// Non-blocking push into a session's inbound buffer. False only when the
/// buffer is full; datagrams for a closing session are dropped quietly.
fn push_datagram(session: &QueueRef, data: Bytes) -> bool {
    let Some(link) = udp_link(session) else { return true };
    let inbound = lock(&link.inbound);
    let pushed = match inbound.as_ref() {
        Some(tx) => tx.try_send(data),
        None => return true,
    };
    match pushed {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => false,
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("udp msgque:{} already closed, datagram dropped", session.id());
            true
        }
    }
}

fn start_session(q: &QueueRef) {
    let Some(link) = udp_link(q) else { return };
    let (Some(inbound), Some(outbox)) = (lock(&link.inbound_rx).take(), q.take_outbox()) else {
        q.stop();
        return;
    };
    tracing::info!(
        "new msgque id:{} from addr:{}",
        q.id(),
        q.remote_addr().unwrap_or_default()
    );
    q.mark_active();

    let rq = q.clone();
    q.spawn_loop(async move {
        session_read_loop(&rq, inbound).await;
        rq.stop();
    });

    let wq = q.clone();
    q.spawn_loop(async move {
        session_write_loop(&wq, outbox).await;
        wq.stop();
    });
}

async fn session_read_loop(q: &QueueRef, mut inbound: mpsc::Receiver<Bytes>) {
    let Some(link) = udp_link(q) else { return };
    let max_len = q.ctx.config().queue.max_msg_data_size;

    while !q.is_stopped() {
        let Some(data) = inbound.recv().await else { break };
        link.touch(q.ctx.now_millis());

        let msg = match q.msg_type() {
            MsgType::Framed => match decode_datagram(data, max_len) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!("udp msgque:{} bad datagram: {}", q.id(), e);
                    break;
                }
            },
            MsgType::Line => Message::from_data(data),
        };

        if !q.initialized.load(Ordering::Acquire) {
            if !q.handler().on_new_msg_que(q).await {
                tracing::info!("msgque id:{} rejected by handler", q.id());
                break;
            }
            q.initialized.store(true, Ordering::Release);
        }

        if !q.process_msg(msg).await {
            break;
        }
    }
}

fn idle_deadline(timeout_secs: u64, idle_ms: u64) -> Option<Instant> {
    (timeout_secs > 0).then(|| {
        let timeout = Duration::from_secs(timeout_secs);
        Instant::now() + timeout.saturating_sub(Duration::from_millis(idle_ms))
    })
}

async fn session_write_loop(q: &QueueRef, mut outbox: mpsc::Receiver<Outbound>) {
    let Some(link) = udp_link(q) else { return };
    let Some(peer) = link.peer else { return };
    let reap = q.ctx.config().udp.reap_idle_sessions;
    let mut deadline = idle_deadline(q.timeout_secs(), 0);

    loop {
        let next = match deadline {
            Some(at) => tokio::select! {
                next = outbox.recv() => next,
                _ = tokio::time::sleep_until(at) => {
                    let idle = q.ctx.now_millis().saturating_sub(link.last_tick());
                    let timeout_ms = q.timeout_secs() * 1000;
                    if timeout_ms > 0 && idle >= timeout_ms {
                        if reap {
                            tracing::info!("udp msgque:{} idle for {}ms, closing", q.id(), idle);
                            break;
                        }
                        deadline = idle_deadline(q.timeout_secs(), 0);
                    } else {
                        deadline = idle_deadline(q.timeout_secs(), idle);
                    }
                    continue;
                }
            },
            None => outbox.recv().await,
        };

        let Some(Some(msg)) = next else { break };
        let wire = match q.msg_type() {
            MsgType::Framed => msg.frame_bytes(),
            MsgType::Line => msg.data.clone().unwrap_or_default(),
        };
        if wire.is_empty() {
            continue;
        }
        if let Err(e) = link.socket.send_to(&wire, peer).await {
            tracing::warn!("udp msgque:{} send to {} failed: {}", q.id(), peer, e);
        }
        link.touch(q.ctx.now_millis());
    }
}

/// Stop a UDP listener or session
pub(crate) fn stop(q: &QueueRef) {
    if !q.begin_stop() {
        return;
    }
    let Some(link) = udp_link(q) else { return };
    // Outside shutdown a stopped listener takes its receive pool down at once
    if link.peer.is_none() && !q.ctx.is_stopping() {
        link.socket_token.cancel();
    }

    let q = q.clone();
    let ctx = q.ctx.clone();
    ctx.supervisor().spawn(async move {
        let Some(link) = udp_link(&q) else { return };
        if q.initialized.load(Ordering::Acquire) {
            q.handler().on_del_msg_que(&q).await;
        }
        lock(&link.inbound).take();

        if let Some(peer) = link.peer {
            q.ctx.udp_sessions().remove_if_same(&peer.to_string(), &q);
        }
        // On shutdown the socket outlives its listener until the last session is gone
        if q.ctx.is_stopping()
            && !link.socket_token.is_cancelled()
            && count_sessions_on(&q.ctx, &link.socket) == 0
        {
            link.socket_token.cancel();
            tracing::info!("udp socket {} closed", link.local_addr().unwrap_or_default());
        }
        q.base_stop();
    });
}

fn count_sessions_on(ctx: &Context, socket: &Arc<UdpSocket>) -> usize {
    ctx.udp_sessions()
        .count_where(|s| udp_link(s).is_some_and(|l| Arc::ptr_eq(&l.socket, socket)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::network::{start_server, EchoHandler, QueueState};

    const WAIT: Duration = Duration::from_secs(5);

    async fn echo_listener(ctx: &Context, msg_type: MsgType) -> (QueueRef, SocketAddr) {
        let listeners = start_server(ctx, "udp://127.0.0.1:0", msg_type, Arc::new(EchoHandler::default()), None)
            .await
            .unwrap();
        let listener = listeners.into_iter().next().unwrap();
        let addr = listener.local_addr().unwrap().parse().unwrap();
        (listener, addr)
    }

    async fn round_trip(socket: &UdpSocket, server: SocketAddr, payload: &'static [u8]) -> Message {
        socket
            .send_to(&Message::new(1, 1, 1, 0, payload).to_bytes(), server)
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        let (n, from) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, server);
        decode_datagram(Bytes::copy_from_slice(&buf[..n]), 1024).unwrap()
    }

    async fn wait_for_sessions(ctx: &Context, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while ctx.udp_sessions().len() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.udp.reader_tasks = 2;
        config.udp.socket_buffer_bytes = 256 * 1024;
        config
    }

    #[tokio::test]
    async fn test_one_session_per_peer() {
        let ctx = Context::new(test_config());
        let (listener, server) = echo_listener(&ctx, MsgType::Framed).await;

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(round_trip(&a, server, b"from a").await.payload(), b"from a");
        assert_eq!(round_trip(&b, server, b"from b").await.payload(), b"from b");
        assert_eq!(round_trip(&a, server, b"again").await.payload(), b"again");
        assert_eq!(ctx.udp_sessions().len(), 2);

        let a_key = a.local_addr().unwrap().to_string();
        let b_key = b.local_addr().unwrap().to_string();
        let session_a = ctx.udp_sessions().get(&a_key).unwrap();
        assert_eq!(session_a.role(), ConnRole::Accept);
        assert_eq!(session_a.remote_addr(), Some(a_key.clone()));

        session_a.stop();
        wait_for_sessions(&ctx, 1).await;
        assert!(!listener.is_stopped());
        let session_b = ctx.udp_sessions().get(&b_key).unwrap();
        assert!(!session_b.is_stopped());
        assert_eq!(round_trip(&b, server, b"still here").await.payload(), b"still here");

        // A stopped peer comes back as a fresh session
        assert_eq!(round_trip(&a, server, b"back").await.payload(), b"back");
        let revived = ctx.udp_sessions().get(&a_key).unwrap();
        assert_ne!(revived.id(), session_a.id());

        ctx.stop().await;
        assert!(ctx.udp_sessions().is_empty());
        assert!(ctx.queues().is_empty());
    }

    #[tokio::test]
    async fn test_line_mode_echo() {
        let ctx = Context::new(test_config());
        let (_listener, server) = echo_listener(&ctx, MsgType::Line).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello\n", server).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(WAIT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello\n");

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_bad_datagram_ends_session() {
        let ctx = Context::new(test_config());
        let (listener, server) = echo_listener(&ctx, MsgType::Framed).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"abc", server).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ctx.udp_sessions().is_empty());
        assert_eq!(ctx.queues().len(), 1);
        assert!(!listener.is_stopped());

        assert_eq!(round_trip(&client, server, b"ok").await.payload(), b"ok");

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_idle_sessions_kept_by_default() {
        let mut config = test_config();
        config.queue.timeout_secs = 1;
        let ctx = Context::new(config);
        let (_listener, server) = echo_listener(&ctx, MsgType::Framed).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        round_trip(&client, server, b"hi").await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(ctx.udp_sessions().len(), 1);

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_idle_sessions_reaped_when_enabled() {
        let mut config = test_config();
        config.queue.timeout_secs = 1;
        config.udp.reap_idle_sessions = true;
        let ctx = Context::new(config);
        let (_listener, server) = echo_listener(&ctx, MsgType::Framed).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        round_trip(&client, server, b"hi").await;
        assert_eq!(ctx.udp_sessions().len(), 1);
        wait_for_sessions(&ctx, 0).await;

        ctx.stop().await;
    }

    #[tokio::test]
    async fn test_full_session_buffer_drops_datagram() {
        let mut config = test_config();
        config.udp.session_channel_capacity = 2;
        let ctx = Context::new(config);
        let (listener, server) = echo_listener(&ctx, MsgType::Framed).await;

        // Never started, so nothing drains its inbound buffer
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let session = new_session(&listener, udp_link(&listener).unwrap(), peer);
        assert!(push_datagram(&session, Bytes::from_static(b"one")));
        assert!(push_datagram(&session, Bytes::from_static(b"two")));
        assert!(!push_datagram(&session, Bytes::from_static(b"three")));

        // The receive pool keeps serving other peers
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(round_trip(&client, server, b"alive").await.payload(), b"alive");

        session.stop();
        ctx.stop().await;
    }

    /// Holds each session's teardown until a permit is released
    struct HeldTeardown {
        permits: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for HeldTeardown {
        async fn on_del_msg_que(&self, queue: &QueueRef) {
            if queue.role() == ConnRole::Accept {
                if let Ok(permit) = self.permits.acquire().await {
                    permit.forget();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_socket_closes_after_last_session_on_shutdown() {
        let ctx = Context::new(test_config());
        let permits = Arc::new(tokio::sync::Semaphore::new(0));
        let handler = Arc::new(HeldTeardown {
            permits: permits.clone(),
        });
        let listeners = start_server(&ctx, "udp://127.0.0.1:0", MsgType::Framed, handler, None)
            .await
            .unwrap();
        let listener = listeners.into_iter().next().unwrap();
        let server: SocketAddr = listener.local_addr().unwrap().parse().unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ping = Message::new(1, 1, 1, 0, &b"hi"[..]).to_bytes();
        a.send_to(&ping, server).await.unwrap();
        b.send_to(&ping, server).await.unwrap();
        wait_for_sessions(&ctx, 2).await;
        tokio::time::timeout(WAIT, async {
            while ctx
                .udp_sessions()
                .count_where(|s| s.initialized.load(Ordering::Acquire))
                < 2
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let socket_token = udp_link(&listener).unwrap().socket_token.clone();
        let stopping = ctx.clone();
        let shutdown = tokio::spawn(async move { stopping.stop().await });

        tokio::time::timeout(WAIT, async {
            while listener.state() != QueueState::Stopped {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!socket_token.is_cancelled(), "listener gone, sessions still live");

        permits.add_permits(1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.udp_sessions().len(), 1);
        assert!(!socket_token.is_cancelled(), "one session still live");

        permits.add_permits(1);
        tokio::time::timeout(WAIT, shutdown).await.unwrap().unwrap();
        assert!(socket_token.is_cancelled());
        assert!(ctx.udp_sessions().is_empty());
        assert!(ctx.queues().is_empty());
    }

    #[test]
    fn test_idle_deadline() {
        assert!(idle_deadline(0, 0).is_none());

        let now = Instant::now();
        let full = idle_deadline(2, 0).unwrap();
        let partial = idle_deadline(2, 1500).unwrap();
        assert!(full >= now + Duration::from_secs(2));
        assert!(partial < full);
        assert!(idle_deadline(2, 5000).unwrap() <= Instant::now() + Duration::from_millis(10));
    }
}
