//! Stream multiplexer over one WebSocket connection.
//!
//! Every binary message carries one [`Frame`]. A dispatch task reads the
//! socket and routes data to per-stream buffers; a writer task owns the sink
//! and drains two queues: a bounded, ordered one for stream frames and an
//! unbounded one for control traffic (window updates, pongs, session close),
//! which always goes first. Client-opened streams use odd ids, server-opened
//! streams even ids.
//!
//! Flow control is per stream. A writer spends send credit and waits once it
//! runs out; the reader grants credit back as it consumes. The dispatch task
//! therefore never waits on a stream, and a stream nobody reads cannot stall
//! the others or the acceptance of new ones.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::task::AtomicWaker;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::PollSender;
use tracing::{debug, trace, warn};

use super::frame::{Frame, FrameKind, INITIAL_WINDOW, MAX_FRAME_PAYLOAD};
use super::{Multiplexer, Role};
use crate::error::{SessionError, WstunResult};

/// Stream frames queued for the writer task.
const OUTBOUND_BUFFER: usize = 256;
/// Peer-opened streams waiting for `accept_stream`; beyond this new streams
/// are refused.
const ACCEPT_BACKLOG: usize = 256;

/// Flow-control state of one stream, shared by its handle and the dispatch
/// task.
struct StreamState {
    /// Bytes this side may still send.
    send_credit: AtomicUsize,
    /// Bytes received and not yet read by the application.
    buffered: AtomicUsize,
    /// The peer closed the stream or the session ended.
    peer_closed: AtomicBool,
    /// Writer parked on zero credit.
    writer: AtomicWaker,
}

impl StreamState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            send_credit: AtomicUsize::new(INITIAL_WINDOW),
            buffered: AtomicUsize::new(0),
            peer_closed: AtomicBool::new(false),
            writer: AtomicWaker::new(),
        })
    }

    fn grant(&self, increment: usize) {
        self.send_credit.fetch_add(increment, Ordering::AcqRel);
        self.writer.wake();
    }

    fn end(&self) {
        self.peer_closed.store(true, Ordering::Release);
        self.writer.wake();
    }

    fn is_peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }
}

/// Dispatch-side handle of a registered stream.
struct Slot {
    tx: mpsc::UnboundedSender<Bytes>,
    state: Arc<StreamState>,
}

type Accepted = (u32, mpsc::UnboundedReceiver<Bytes>, Arc<StreamState>);

/// State shared by the session handle, its tasks and its streams.
struct Shared {
    role: Role,
    closed: AtomicBool,
    next_id: AtomicU32,
    streams: Mutex<HashMap<u32, Slot>>,
}

impl Shared {
    fn streams(&self) -> MutexGuard<'_, HashMap<u32, Slot>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the session dead and end every stream (reads see EOF, writes
    /// fail).
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(role = ?self.role, "mux session closed");
        }
        for (_, slot) in self.streams().drain() {
            slot.state.end();
        }
    }

    fn register(&self, stream_id: u32, slot: Slot) {
        self.streams().insert(stream_id, slot);
    }

    fn unregister(&self, stream_id: u32) {
        self.streams().remove(&stream_id);
    }

    /// The peer is done with `stream_id`: reads drain then see EOF, writes
    /// fail.
    fn end_stream(&self, stream_id: u32) {
        if let Some(slot) = self.streams().remove(&stream_id) {
            slot.state.end();
        }
    }

    fn slot(&self, stream_id: u32) -> Option<(mpsc::UnboundedSender<Bytes>, Arc<StreamState>)> {
        self.streams()
            .get(&stream_id)
            .map(|slot| (slot.tx.clone(), slot.state.clone()))
    }

    fn contains(&self, stream_id: u32) -> bool {
        self.streams().contains_key(&stream_id)
    }
}

/// A multiplexed session over one WebSocket connection.
pub struct WsMux {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Message>,
    control: mpsc::UnboundedSender<Message>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    dispatch_handle: JoinHandle<()>,
}

impl WsMux {
    /// Build a client-role session (odd stream ids).
    pub fn client<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(ws, Role::Client)
    }

    /// Build a server-role session (even stream ids).
    pub fn server<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(ws, Role::Server)
    }

    pub fn new<S>(ws: WebSocketStream<S>, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();

        let shared = Arc::new(Shared {
            role,
            closed: AtomicBool::new(false),
            next_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            streams: Mutex::new(HashMap::new()),
        });

        let (outbound, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let (control, control_rx) = mpsc::unbounded_channel::<Message>();
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);

        tokio::spawn(Self::write_loop(
            sink,
            outbound_rx,
            control_rx,
            shared.clone(),
        ));
        let dispatch_handle = tokio::spawn(Self::dispatch_loop(
            stream,
            incoming_tx,
            control.clone(),
            shared.clone(),
        ));

        Self {
            shared,
            outbound,
            control,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            dispatch_handle,
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Drain both queues into the socket, control traffic first. Ends after
    /// sending a close message, on a write error, or once every sender is
    /// gone.
    async fn write_loop<S>(
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut outbound_rx: mpsc::Receiver<Message>,
        mut control_rx: mpsc::UnboundedReceiver<Message>,
        shared: Arc<Shared>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let msg = tokio::select! {
                biased;
                Some(msg) = control_rx.recv() => msg,
                Some(msg) = outbound_rx.recv() => msg,
                else => break,
            };
            let is_close = msg.is_close();
            if let Err(e) = sink.send(msg).await {
                debug!(error = %e, "WebSocket write failed");
                break;
            }
            if is_close {
                break;
            }
        }
        shared.mark_closed();
        let _ = sink.close().await;
        trace!("mux writer ended");
    }

    /// Route inbound frames to streams until the socket ends. Never waits on
    /// a stream.
    async fn dispatch_loop<S>(
        mut stream: SplitStream<WebSocketStream<S>>,
        incoming_tx: mpsc::Sender<Accepted>,
        control: mpsc::UnboundedSender<Message>,
        shared: Arc<Shared>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(msg) = stream.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => Bytes::from(data),
                Ok(Message::Close(_)) => {
                    debug!("WebSocket close frame received");
                    break;
                }
                Ok(Message::Ping(payload)) => {
                    let _ = control.send(Message::Pong(payload));
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "WebSocket read failed");
                    break;
                }
            };

            let frame = match Frame::decode(data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "invalid mux frame");
                    continue;
                }
            };
            let stream_id = frame.stream_id;

            match frame.kind {
                FrameKind::Open => {
                    if shared.contains(stream_id) {
                        warn!(stream_id, "duplicate stream open ignored");
                        continue;
                    }
                    let (tx, rx) = mpsc::unbounded_channel();
                    let state = StreamState::new();
                    shared.register(
                        stream_id,
                        Slot {
                            tx,
                            state: state.clone(),
                        },
                    );
                    match incoming_tx.try_send((stream_id, rx, state)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(stream_id, "accept backlog full, refusing stream");
                            shared.unregister(stream_id);
                            let close = Frame::close(stream_id).encode();
                            let _ = control.send(Message::Binary(close));
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            shared.unregister(stream_id);
                        }
                    }
                }
                FrameKind::Data => {
                    if frame.payload.is_empty() {
                        continue;
                    }
                    let Some((tx, state)) = shared.slot(stream_id) else {
                        trace!(stream_id, "data for unknown stream");
                        continue;
                    };
                    let len = frame.payload.len();
                    if state.buffered.fetch_add(len, Ordering::AcqRel) + len > INITIAL_WINDOW {
                        warn!(stream_id, "peer overran the stream window, resetting");
                        shared.end_stream(stream_id);
                        let close = Frame::close(stream_id).encode();
                        let _ = control.send(Message::Binary(close));
                        continue;
                    }
                    if tx.send(frame.payload).is_err() {
                        shared.unregister(stream_id);
                    }
                }
                FrameKind::Close => shared.end_stream(stream_id),
                FrameKind::WindowUpdate => match (frame.increment(), shared.slot(stream_id)) {
                    (Some(increment), Some((_, state))) => state.grant(increment as usize),
                    (None, _) => warn!(stream_id, "malformed window update"),
                    (_, None) => trace!(stream_id, "window update for unknown stream"),
                },
            }
        }

        shared.mark_closed();
        // Stop the writer too; it may be idle.
        let _ = control.send(Message::Close(None));
        trace!("mux dispatch ended");
    }

    fn stream(
        &self,
        stream_id: u32,
        rx: mpsc::UnboundedReceiver<Bytes>,
        state: Arc<StreamState>,
    ) -> MuxStream {
        MuxStream {
            stream_id,
            rx,
            pending: Bytes::new(),
            unacked: 0,
            state,
            tx: PollSender::new(self.outbound.clone()),
            outbound: self.outbound.clone(),
            control: self.control.clone(),
            shared: self.shared.clone(),
            closed: false,
        }
    }
}

impl Multiplexer for WsMux {
    type Stream = MuxStream;

    async fn open_stream(&self) -> WstunResult<MuxStream> {
        if self.shared.is_closed() {
            return Err(SessionError::Closed.into());
        }

        let stream_id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let state = StreamState::new();
        self.shared.register(
            stream_id,
            Slot {
                tx,
                state: state.clone(),
            },
        );

        // A close racing the registration would leave this stream without EOF.
        if self.shared.is_closed() {
            self.shared.unregister(stream_id);
            return Err(SessionError::Closed.into());
        }

        let open = Message::Binary(Frame::open(stream_id).encode());
        if self.outbound.send(open).await.is_err() {
            self.shared.unregister(stream_id);
            return Err(SessionError::Closed.into());
        }

        trace!(stream_id, "mux stream opened");
        Ok(self.stream(stream_id, rx, state))
    }

    async fn accept_stream(&self) -> WstunResult<MuxStream> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some((stream_id, rx, state)) => {
                trace!(stream_id, "mux stream accepted");
                Ok(self.stream(stream_id, rx, state))
            }
            None => Err(SessionError::Closed.into()),
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    async fn close(&self) {
        self.shared.mark_closed();
        let _ = self.control.send(Message::Close(None));
        self.dispatch_handle.abort();
    }
}

impl Drop for WsMux {
    fn drop(&mut self) {
        self.dispatch_handle.abort();
    }
}

/// One logical duplex stream inside a [`WsMux`] session.
///
/// Shutting down or dropping the stream sends a single close frame; there
/// is no half-close, so a shut-down stream also stops reading.
pub struct MuxStream {
    stream_id: u32,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    /// Bytes read since credit was last returned to the peer.
    unacked: usize,
    state: Arc<StreamState>,
    tx: PollSender<Message>,
    outbound: mpsc::Sender<Message>,
    control: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    closed: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Account for `n` bytes handed to the application, returning credit
    /// once half the window has been consumed.
    fn consumed(&mut self, n: usize) {
        self.state.buffered.fetch_sub(n, Ordering::AcqRel);
        self.unacked += n;
        if self.unacked >= INITIAL_WINDOW / 2 {
            let update = Frame::window_update(self.stream_id, self.unacked as u32);
            let _ = self.control.send(Message::Binary(update.encode()));
            self.unacked = 0;
        }
    }

    fn finish(&mut self) {
        self.closed = true;
        self.shared.unregister(self.stream_id);
        self.rx.close();
        self.tx.close();
    }

    fn write_refused(&self) -> bool {
        self.closed || self.shared.is_closed() || self.state.is_peer_closed()
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mux stream closed")
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        this.consumed(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_refused() {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut credit = this.state.send_credit.load(Ordering::Acquire);
        if credit == 0 {
            this.state.writer.register(cx.waker());
            credit = this.state.send_credit.load(Ordering::Acquire);
            if credit == 0 {
                if this.write_refused() {
                    return Poll::Ready(Err(broken_pipe()));
                }
                return Poll::Pending;
            }
        }

        ready!(this.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let n = buf.len().min(MAX_FRAME_PAYLOAD).min(credit);
        let frame = Frame::data(this.stream_id, Bytes::copy_from_slice(&buf[..n]));
        this.tx
            .send_item(Message::Binary(frame.encode()))
            .map_err(|_| broken_pipe())?;
        this.state.send_credit.fetch_sub(n, Ordering::AcqRel);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        if !this.shared.is_closed() {
            if ready!(this.tx.poll_reserve(cx)).is_ok() {
                let close = Message::Binary(Frame::close(this.stream_id).encode());
                let _ = this.tx.send_item(close);
            }
        }
        this.finish();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let stream_id = self.stream_id;
        self.finish();
        if self.shared.is_closed() {
            return;
        }

        let close = Message::Binary(Frame::close(stream_id).encode());
        if let Err(mpsc::error::TrySendError::Full(close)) = self.outbound.try_send(close) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let outbound = self.outbound.clone();
                handle.spawn(async move {
                    let _ = outbound.send(close).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;

    const BOUND: Duration = Duration::from_secs(2);

    /// A connected client/server pair over an in-memory pipe.
    async fn pair() -> (WsMux, WsMux) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client_ws = WebSocketStream::from_raw_socket(a, WsRole::Client, None).await;
        let server_ws = WebSocketStream::from_raw_socket(b, WsRole::Server, None).await;
        (WsMux::client(client_ws), WsMux::server(server_ws))
    }

    #[tokio::test]
    async fn open_accept_and_echo() {
        let (client, server) = pair().await;

        let mut out = client.open_stream().await.unwrap();
        assert_eq!(out.id() % 2, 1);
        out.write_all(b"hello").await.unwrap();

        let mut inbound = timeout(BOUND, server.accept_stream()).await.unwrap().unwrap();
        assert_eq!(inbound.id(), out.id());
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        inbound.write_all(b"world").await.unwrap();
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let (client, server) = pair().await;

        let mut s1 = client.open_stream().await.unwrap();
        let mut s2 = client.open_stream().await.unwrap();
        assert_ne!(s1.id(), s2.id());

        s2.write_all(b"two").await.unwrap();
        s1.write_all(b"one").await.unwrap();

        let mut a1 = server.accept_stream().await.unwrap();
        let mut a2 = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 3];
        a1.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        a2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[tokio::test]
    async fn large_write_is_chunked_and_reassembled() {
        let (client, server) = pair().await;
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();

        let mut out = client.open_stream().await.unwrap();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            out.write_all(&sent).await.unwrap();
            out
        });

        let mut inbound = server.accept_stream().await.unwrap();
        let mut received = vec![0u8; payload.len()];
        timeout(BOUND, inbound.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn dropping_a_stream_ends_the_peer() {
        let (client, server) = pair().await;

        let out = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();
        drop(out);

        let mut buf = Vec::new();
        let n = timeout(BOUND, inbound.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn closing_the_session_is_observed_by_both_ends() {
        let (client, server) = pair().await;
        let mut out = client.open_stream().await.unwrap();
        let _inbound = server.accept_stream().await.unwrap();

        server.close().await;
        assert!(server.is_closed());

        let mut buf = Vec::new();
        timeout(BOUND, out.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        timeout(BOUND, async {
            while !client.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let err = client.open_stream().await.err().unwrap();
        assert!(err.is_session_closed());
        assert!(server.accept_stream().await.err().unwrap().is_session_closed());
    }

    #[tokio::test]
    async fn idle_reader_does_not_stall_other_streams() {
        let (client, server) = pair().await;
        let payload = vec![7u8; 1024 * 1024];

        let mut s1 = client.open_stream().await.unwrap();
        let mut a1 = timeout(BOUND, server.accept_stream()).await.unwrap().unwrap();
        let sent = payload.clone();
        let mut writer = tokio::spawn(async move {
            s1.write_all(&sent).await.unwrap();
            s1
        });

        // Nobody reads a1, so the writer runs out of credit.
        assert!(timeout(Duration::from_millis(200), &mut writer).await.is_err());

        let mut s2 = client.open_stream().await.unwrap();
        s2.write_all(b"hi").await.unwrap();
        let mut a2 = timeout(BOUND, server.accept_stream()).await.unwrap().unwrap();
        let mut buf = [0u8; 2];
        timeout(BOUND, a2.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"hi");

        a2.write_all(b"ok").await.unwrap();
        timeout(BOUND, s2.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ok");

        let mut received = vec![0u8; payload.len()];
        timeout(BOUND, a1.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);
        timeout(BOUND, writer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn blocked_writer_fails_when_peer_drops_stream() {
        let (client, server) = pair().await;

        let mut out = client.open_stream().await.unwrap();
        let inbound = timeout(BOUND, server.accept_stream()).await.unwrap().unwrap();
        let writer = tokio::spawn(async move {
            let chunk = vec![1u8; 64 * 1024];
            loop {
                if let Err(e) = out.write_all(&chunk).await {
                    return e;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(inbound);

        let err = timeout(BOUND, writer).await.unwrap().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!client.is_closed());
    }
}
