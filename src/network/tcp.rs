//! TCP transport
//!
//! A listener queue runs one accept task. Every accepted or dialed
//! connection runs one read task and one write task, both tracked by the
//! queue so a reconnect can wait for the previous generation to finish.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handler::MessageHandler;
use super::queue::{lock, ConnRole, Link, MsgQue, NetKind, Outbound, QueueRef, QueueOptions};
use super::{NetError, NetResult};
use crate::protocol::{Message, MessageHead, MessageParser, MsgType, MSG_HEAD_SIZE};
use crate::runtime::Context;

/// Socket state of a TCP queue
#[derive(Default)]
pub(crate) struct TcpLink {
    /// Listen address, or dial target for connectors
    address: String,
    listener: Mutex<Option<TcpListener>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    local: Mutex<Option<SocketAddr>>,
    peer: Mutex<Option<SocketAddr>>,
    /// Cancels the accept task or the read task of the current generation
    cancel: Mutex<CancellationToken>,
    /// Serializes final teardown against a reconnect's generation reset
    generation: tokio::sync::Mutex<()>,
    connecting: AtomicBool,
    has_conn: AtomicBool,
}

impl TcpLink {
    fn listening(address: &str, listener: TcpListener, local: SocketAddr) -> Self {
        Self {
            address: address.to_string(),
            listener: Mutex::new(Some(listener)),
            local: Mutex::new(Some(local)),
            ..Default::default()
        }
    }

    fn dialing(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    fn accepted(stream: TcpStream) -> Self {
        let link = Self::default();
        link.install(stream);
        link
    }

    /// Adopt `stream` as the current connection
    fn install(&self, stream: TcpStream) {
        *lock(&self.local) = stream.local_addr().ok();
        *lock(&self.peer) = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        *lock(&self.reader) = Some(reader);
        *lock(&self.writer) = Some(writer);
        *lock(&self.cancel) = CancellationToken::new();
        self.has_conn.store(true, Ordering::Release);
    }

    /// Drop socket halves no task has taken ownership of
    fn release(&self) {
        lock(&self.listener).take();
        lock(&self.reader).take();
        lock(&self.writer).take();
    }

    fn token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    fn cancel_connection(&self) {
        lock(&self.cancel).cancel();
    }

    pub(crate) fn local_addr(&self) -> Option<String> {
        lock(&self.local).map(|a| a.to_string())
    }

    pub(crate) fn remote_addr(&self) -> Option<String> {
        lock(&self.peer).map(|a| a.to_string())
    }
}

fn tcp_link(q: &MsgQue) -> Option<&TcpLink> {
    match &q.link {
        Link::Tcp(link) => Some(link),
        Link::Udp(_) => None,
    }
}

/// Bind `address` and start accepting connections
pub(crate) async fn listen(
    ctx: &Context,
    address: &str,
    msg_type: MsgType,
    handler: Arc<dyn MessageHandler>,
    parser: Option<Arc<dyn MessageParser>>,
) -> NetResult<QueueRef> {
    let listener = TcpListener::bind(address).await.map_err(|source| NetError::Bind {
        addr: address.to_string(),
        source,
    })?;
    let local = listener.local_addr()?;

    let q = MsgQue::create(
        ctx,
        QueueOptions {
            kind: NetKind::Tcp,
            role: ConnRole::Listen,
            msg_type,
            handler,
            parser,
            link: Link::Tcp(TcpLink::listening(address, listener, local)),
            available: false,
            with_channel: false,
            timeout_secs: 0,
        },
    );
    tracing::info!("new tcp listen id:{} addr:{}", q.id(), local);
    q.mark_active();

    let accepting = q.clone();
    ctx.supervisor().spawn(async move { accept_loop(accepting).await });
    Ok(q)
}

/// Create an idle connector for `address`; [`MsgQue::reconnect`] dials it
pub(crate) fn connector(
    ctx: &Context,
    address: &str,
    msg_type: MsgType,
    handler: Arc<dyn MessageHandler>,
    parser: Option<Arc<dyn MessageParser>>,
) -> QueueRef {
    MsgQue::create(
        ctx,
        QueueOptions {
            kind: NetKind::Tcp,
            role: ConnRole::Connect,
            msg_type,
            handler,
            parser,
            link: Link::Tcp(TcpLink::dialing(address)),
            available: false,
            with_channel: true,
            timeout_secs: ctx.config().queue.timeout_secs,
        },
    )
}

async fn accept_loop(q: QueueRef) {
    let Some(link) = tcp_link(&q) else { return };
    let Some(listener) = lock(&link.listener).take() else {
        return;
    };
    let token = link.token();
    let ctx = q.ctx.clone();
    let _check = ctx.shutdown().stop_check(format!("msgque listen id:{}", q.id()));

    while !q.is_stopped() {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let parent = q.clone();
                    ctx.supervisor().spawn(async move { accept_connection(parent, stream, peer).await });
                }
                Err(e) => {
                    tracing::error!("msgque:{} accept failed: {}", q.id(), e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    tracing::debug!("accept loop for msgque:{} ended", q.id());
    q.stop();
}

async fn accept_connection(parent: QueueRef, stream: TcpStream, peer: SocketAddr) {
    let ctx = parent.ctx.clone();
    if ctx.config().tcp.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
    }

    let q = MsgQue::create(
        &ctx,
        QueueOptions {
            kind: NetKind::Tcp,
            role: ConnRole::Accept,
            msg_type: parent.msg_type(),
            handler: parent.handler().clone(),
            parser: parent.parser().cloned(),
            link: Link::Tcp(TcpLink::accepted(stream)),
            available: false,
            with_channel: true,
            timeout_secs: ctx.config().queue.timeout_secs,
        },
    );
    tracing::info!("new msgque id:{} from addr:{}", q.id(), peer);

    if q.handler().on_new_msg_que(&q).await {
        q.initialized.store(true, Ordering::Release);
        q.set_available(true);
        start_loops(&q);
    } else {
        tracing::info!("msgque id:{} rejected by handler", q.id());
        q.stop();
    }
}

/// Start the read and write tasks for the installed connection
fn start_loops(q: &QueueRef) {
    let Some(link) = tcp_link(q) else { return };
    let reader = lock(&link.reader).take();
    let writer = lock(&link.writer).take();
    let outbox = q.take_outbox();
    let (Some(reader), Some(writer), Some(outbox)) = (reader, writer, outbox) else {
        tracing::warn!("msgque:{} has no connection to run", q.id());
        q.stop();
        return;
    };
    let token = link.token();
    let write_token = token.clone();
    q.mark_active();

    let rq = q.clone();
    q.spawn_loop(async move {
        tracing::debug!("read loop for msgque:{} started", rq.id());
        match rq.msg_type() {
            MsgType::Framed => read_framed(&rq, reader, &token).await,
            MsgType::Line => read_lines(&rq, reader, &token).await,
        }
        tracing::debug!("read loop for msgque:{} ended", rq.id());
        rq.stop();
    });

    let wq = q.clone();
    q.spawn_loop(async move {
        write_loop(&wq, writer, outbox, &write_token).await;
        tracing::debug!("write loop for msgque:{} ended", wq.id());
        wq.stop();
    });
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed locally")
}

/// Bound `fut` by `timeout_secs`, 0 meaning no deadline
pub(crate) async fn with_deadline<T, F>(timeout_secs: u64, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if timeout_secs == 0 {
        return fut.await;
    }
    tokio::time::timeout(Duration::from_secs(timeout_secs), fut)
        .await
        .unwrap_or_else(|_| Err(timed_out()))
}

async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        result = fut => result,
        _ = token.cancelled() => Err(aborted()),
    }
}

/// Read one framed message. `Ok(None)` is a clean close between frames.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    max_len: u32,
    timeout_secs: u64,
    token: &CancellationToken,
) -> NetResult<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut head_buf = [0u8; MSG_HEAD_SIZE];
    match cancellable(token, with_deadline(timeout_secs, reader.read_exact(&mut head_buf))).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let head = MessageHead::decode(&head_buf, max_len)?;
    if head.len == 0 {
        return Ok(Some(Message::from_head(head)));
    }

    let mut data = vec![0u8; head.len as usize];
    cancellable(token, with_deadline(timeout_secs, reader.read_exact(&mut data))).await?;
    Ok(Some(Message::from_parts(head, Bytes::from(data))))
}

async fn read_framed<R>(q: &QueueRef, mut reader: R, token: &CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let max_len = q.ctx.config().queue.max_msg_data_size;
    while !q.is_stopped() {
        let msg = match read_frame(&mut reader, max_len, q.timeout_secs(), token).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                if !q.is_stopped() {
                    tracing::error!("msgque:{} recv data err: {}", q.id(), e);
                }
                break;
            }
        };
        let (cmd, act) = (msg.cmd(), msg.act());
        if !q.process_msg(msg).await {
            tracing::info!("msgque:{} process msg cmd:{} act:{} asked to close", q.id(), cmd, act);
            break;
        }
    }
}

async fn read_lines<R>(q: &QueueRef, reader: R, token: &CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    while !q.is_stopped() {
        let mut line = Vec::new();
        match cancellable(token, with_deadline(q.timeout_secs(), reader.read_until(b'\n', &mut line))).await {
            Ok(0) => break,
            // Unterminated tail at EOF
            Ok(_) if line.last() != Some(&b'\n') => break,
            Ok(_) => {}
            Err(e) => {
                if !q.is_stopped() {
                    tracing::debug!("msgque:{} recv line err: {}", q.id(), e);
                }
                break;
            }
        }
        if !q.process_msg(Message::from_data(line)).await {
            break;
        }
    }
}

/// Write `head` then `payload`, retrying short writes until both are out.
/// Returns the number of bytes written.
pub(crate) async fn write_frame<W>(writer: &mut W, head: &[u8], payload: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let total = head.len() + payload.len();
    let mut written = 0;
    while written < total {
        let chunk = if written < head.len() {
            &head[written..]
        } else {
            &payload[written - head.len()..]
        };
        let n = writer.write(chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "connection refused more data"));
        }
        written += n;
    }
    writer.flush().await?;
    Ok(written)
}

/// Drain `outbox` into `writer`. Cancelling `token` aborts a write the
/// peer is not consuming; a write that completes at once still goes out.
async fn write_loop<W>(q: &QueueRef, mut writer: W, mut outbox: mpsc::Receiver<Outbound>, token: &CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    // `None` wakes the writer for a reconnect; a closed channel ends it
    while let Some(Some(msg)) = outbox.recv().await {
        let timeout = q.timeout_secs();
        let write = async {
            match q.msg_type() {
                MsgType::Framed => {
                    let (head, payload) = msg.frame_parts();
                    with_deadline(timeout, write_frame(&mut writer, &head, &payload)).await
                }
                MsgType::Line => with_deadline(timeout, write_frame(&mut writer, &[], msg.payload())).await,
            }
        };
        let result = tokio::select! {
            biased;
            result = write => result,
            _ = token.cancelled() => Err(aborted()),
        };
        if let Err(e) = result {
            if !q.is_stopped() {
                tracing::error!("msgque write id:{} err:{}", q.id(), e);
            } else {
                tracing::debug!("msgque write id:{} abandoned: {}", q.id(), e);
            }
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Stop a TCP queue: unblock its tasks now, tear down in the background
pub(crate) fn stop(q: &QueueRef) {
    if !q.begin_stop() {
        return;
    }
    let Some(link) = tcp_link(q) else { return };
    link.cancel_connection();

    let q = q.clone();
    let ctx = q.ctx.clone();
    ctx.supervisor().spawn(async move {
        let Some(link) = tcp_link(&q) else { return };
        if q.initialized.load(Ordering::Acquire) {
            q.handler().on_del_msg_que(&q).await;
        }
        let _generation = link.generation.lock().await;
        if link.connecting.load(Ordering::Acquire) && !q.ctx.is_stopping() {
            // A reconnect owns the queue now
            return;
        }
        link.release();
        q.base_stop();
    });
}

/// Schedule a new dial for a connector
pub(crate) fn reconnect(q: &QueueRef, delay_secs: u64) -> bool {
    let Some(link) = tcp_link(q) else { return false };
    if q.role() != ConnRole::Connect {
        tracing::warn!("msgque:{} is not a connector, reconnect ignored", q.id());
        return false;
    }
    if q.ctx.is_stopping() {
        return false;
    }
    if link.has_conn.load(Ordering::Acquire) && !q.is_stopped() {
        return false;
    }
    if link
        .connecting
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }

    let mut delay = delay_secs;
    if q.initialized.swap(true, Ordering::AcqRel) {
        delay = delay.max(1);
    }
    tracing::info!("reconnect to addr:{} msgque:{} in {}s", link.address, q.id(), delay);

    let q = q.clone();
    let ctx = q.ctx.clone();
    ctx.supervisor().spawn(async move {
        let Some(link) = tcp_link(&q) else { return };
        if link.has_conn.swap(false, Ordering::AcqRel) {
            link.cancel_connection();
            q.push_sentinel();
            q.loops.close();
            q.loops.wait().await;
            q.loops.reopen();
        }
        {
            let _generation = link.generation.lock().await;
            link.release();
            q.reset_generation();
        }

        if delay == 0 {
            connect(&q).await;
            return;
        }
        let target = q.clone();
        let scheduled = q.ctx.supervisor().set_timeout(Duration::from_secs(delay), move || {
            let target = target.clone();
            async move {
                connect(&target).await;
                Duration::ZERO
            }
        });
        if !scheduled {
            link.connecting.store(false, Ordering::Release);
            q.stop();
        }
    });
    true
}

async fn connect(q: &QueueRef) {
    let Some(link) = tcp_link(q) else { return };
    let ctx = q.ctx.clone();
    tracing::info!("connect to addr:{} msgque:{} start", link.address, q.id());

    let dialed = tokio::time::timeout(
        ctx.config().tcp.connect_timeout(),
        TcpStream::connect(link.address.as_str()),
    )
    .await
    .unwrap_or_else(|_| Err(timed_out()));

    match dialed {
        Ok(stream) => {
            if ctx.config().tcp.nodelay {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!("Failed to set TCP_NODELAY for {}: {}", link.address, e);
                }
            }
            link.install(stream);
            q.set_available(true);
            tracing::info!("connect to addr:{} ok msgque:{}", link.address, q.id());

            let accepted = q.handler().on_connect_complete(q, true).await;
            link.connecting.store(false, Ordering::Release);
            if accepted {
                start_loops(q);
            } else {
                q.stop();
            }
        }
        Err(e) => {
            tracing::info!("connect to addr:{} failed msgque:{}: {}", link.address, q.id(), e);
            q.handler().on_connect_complete(q, false).await;
            link.connecting.store(false, Ordering::Release);
            q.stop();
        }
    }
}
