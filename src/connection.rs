use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::message_assembly::MessageAssembler;
use crate::send_buffer::SendBuffer;
use crate::send_queue::SendQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);
impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    /// accepted by a listening end point
    Server,
    /// client connection with the dial still in flight
    ClientDialing,
    /// client connection with an established transport
    ClientEstablished,
}

/// One message handed to a connection's send state machine by the outbound queue pump.
#[derive(Debug)]
pub struct OutboundMessage {
    pub message_id: u64,
    pub payload: Bytes,
}

struct ConnectionShared {
    id: ConnectionId,
    peer_addr: SocketAddr,
    role: ConnectionRole,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    closed: AtomicBool,
    close_requested: AtomicBool,
    close_notify: Notify,
}

/// Cheaply clonable reference to a connection, safe to hold and use from any task. All actual
///  socket state is owned exclusively by the connection's driver task - a handle only ever
///  talks to that task through the outbound channel and the close notification.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, peer_addr: SocketAddr, role: ConnectionRole) -> (ConnectionHandle, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            shared: Arc::new(ConnectionShared {
                id,
                peer_addr,
                role,
                outbound_tx,
                closed: AtomicBool::new(false),
                close_requested: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
        };
        (handle, outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn role(&self) -> ConnectionRole {
        self.shared.role
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Ask the driver task to tear the connection down. Callable from anywhere; the teardown
    ///  itself happens on the driver task.
    pub fn request_close(&self) {
        self.shared.close_requested.store(true, Ordering::Release);
        self.shared.close_notify.notify_one();
    }

    pub(crate) fn is_close_requested(&self) -> bool {
        self.shared.close_requested.load(Ordering::Acquire)
    }

    pub(crate) async fn wait_close_requested(&self) {
        while !self.is_close_requested() {
            self.shared.close_notify.notified().await;
        }
    }

    /// Hand one message to the driver task's send state machine. Returns false if the driver
    ///  task is gone.
    pub(crate) fn hand_off(&self, message: OutboundMessage) -> bool {
        self.shared.outbound_tx.send(message).is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("role", &self.shared.role)
            .finish()
    }
}

/// The per-connection capability held by the I/O layer: complete inbound messages and the
///  disconnect notification are delivered through this, nothing else crosses the boundary.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_message(&self, conn: &ConnectionHandle, message_id: u64, payload: Bytes);

    /// Called exactly once, after the connection is marked closed and its queue entries are
    ///  purged.
    async fn on_disconnect(&self, conn: &ConnectionHandle);
}

/// Spawns the driver task owning `stream`. The task is the only place that ever reads from or
///  writes to the stream; everyone else interacts via the returned handle and the send queue.
pub(crate) fn spawn_connection<S>(
    stream: S,
    id: ConnectionId,
    peer_addr: SocketAddr,
    role: ConnectionRole,
    max_message_size: u32,
    handler: Arc<dyn ConnectionHandler>,
    send_queue: Arc<SendQueue>,
) -> ConnectionHandle
where S: AsyncRead + AsyncWrite + Send + 'static {
    let (handle, outbound_rx) = ConnectionHandle::new(id, peer_addr, role);

    let correlation_id = Uuid::new_v4();
    let conn_span = span!(Level::DEBUG, "connection", %id, %peer_addr, ?correlation_id);

    let task_handle = handle.clone();
    tokio::spawn(async move {
        let (read_half, write_half) = tokio::io::split(stream);

        let result = tokio::select! {
            r = receive_loop(read_half, task_handle.clone(), max_message_size, handler.clone()) => r,
            r = send_loop(write_half, task_handle.clone(), outbound_rx) => r,
        };
        match result {
            Ok(()) => debug!("closing connection"),
            Err(e) => debug!("closing connection: {:#}", e),
        }

        task_handle.mark_closed();
        send_queue.purge(task_handle.id());
        handler.on_disconnect(&task_handle).await;
    }.instrument(conn_span));

    handle
}

/// Receive state machine driver: read whatever bytes are available, feed them to the framing
///  state machine, deliver completed messages. Framing and transport errors both end the
///  connection; the caller does the actual teardown.
async fn receive_loop<S: AsyncRead + Send>(
    mut stream: ReadHalf<S>,
    handle: ConnectionHandle,
    max_message_size: u32,
    handler: Arc<dyn ConnectionHandler>,
) -> anyhow::Result<()> {
    let mut assembler = MessageAssembler::new(max_message_size);
    let mut read_buf = BytesMut::with_capacity(16 * 1024);

    loop {
        let num_read = tokio::select! {
            r = stream.read_buf(&mut read_buf) => r?,
            _ = handle.wait_close_requested() => return Ok(()),
        };
        if num_read == 0 {
            trace!("peer closed the connection");
            return Ok(());
        }

        let chunk = read_buf.split();
        for message in assembler.on_bytes(&chunk)? {
            trace!("received message {} with {} payload bytes", message.message_id, message.payload.len());
            handler.on_message(&handle, message.message_id, message.payload).await;
        }
    }
}

/// Send state machine driver: take the next message handed over by the outbound queue pump,
///  then write the frame tracking progress until it is complete. While a frame is in flight no
///  other outbound message for this connection can interleave with it.
async fn send_loop<S: AsyncWrite + Send>(
    mut stream: WriteHalf<S>,
    handle: ConnectionHandle,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
) -> anyhow::Result<()> {
    loop {
        let message = tokio::select! {
            m = outbound_rx.recv() => match m {
                Some(message) => message,
                None => return Ok(()),
            },
            _ = handle.wait_close_requested() => return Ok(()),
        };

        trace!("sending message {} with {} payload bytes", message.message_id, message.payload.len());
        let mut send_buf = SendBuffer::new(message.message_id, &message.payload);
        while !send_buf.is_complete() {
            let num_written = stream.write(send_buf.remaining()).await?;
            if num_written == 0 {
                bail!("connection closed while writing");
            }
            send_buf.advance(num_written);
        }
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_header::WireHeader;
    use bytes::BufMut;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::Mutex;

    fn test_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4242))
    }

    fn frame(message_id: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        WireHeader::for_payload(message_id, payload).ser(&mut buf);
        buf.put_slice(payload);
        buf.to_vec()
    }

    struct RecordingHandler {
        messages: Mutex<Vec<(u64, Bytes)>>,
        disconnects: AtomicUsize,
    }
    impl RecordingHandler {
        fn new() -> Arc<RecordingHandler> {
            Arc::new(RecordingHandler {
                messages: Mutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
            })
        }
    }
    #[async_trait]
    impl ConnectionHandler for RecordingHandler {
        async fn on_message(&self, _conn: &ConnectionHandle, message_id: u64, payload: Bytes) {
            self.messages.lock().await.push((message_id, payload));
        }
        async fn on_disconnect(&self, _conn: &ConnectionHandle) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_receive_single_and_byte_by_byte() {
        let (mut peer, local) = duplex(1024);
        let handler = RecordingHandler::new();
        let send_queue = Arc::new(SendQueue::new());
        let _handle = spawn_connection(local, ConnectionId(1), test_addr(), ConnectionRole::Server, 1024, handler.clone(), send_queue);

        peer.write_all(&frame(7, b"all at once")).await.unwrap();
        for b in frame(8, b"dribbled") {
            peer.write_all(&[b]).await.unwrap();
            peer.flush().await.unwrap();
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handler.messages.lock().await.len() == 2 { break; }
                tokio::task::yield_now().await;
            }
        }).await.unwrap();

        let messages = handler.messages.lock().await;
        assert_eq!(messages[0], (7, Bytes::from_static(b"all at once")));
        assert_eq!(messages[1], (8, Bytes::from_static(b"dribbled")));
    }

    #[tokio::test]
    async fn test_framing_error_closes_connection() {
        let (mut peer, local) = duplex(1024);
        let handler = RecordingHandler::new();
        let send_queue = Arc::new(SendQueue::new());
        let handle = spawn_connection(local, ConnectionId(1), test_addr(), ConnectionRole::Server, 1024, handler.clone(), send_queue);

        let mut bad = frame(7, b"x");
        bad[0] = 0x00;
        peer.write_all(&bad).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        }).await.unwrap();
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
        assert!(handler.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_peer_eof_disconnects_exactly_once() {
        let (peer, local) = duplex(1024);
        let handler = RecordingHandler::new();
        let send_queue = Arc::new(SendQueue::new());
        let handle = spawn_connection(local, ConnectionId(1), test_addr(), ConnectionRole::ClientEstablished, 1024, handler.clone(), send_queue);

        drop(peer);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        }).await.unwrap();
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hand_off_writes_frame() {
        let (mut peer, local) = duplex(1024);
        let handler = RecordingHandler::new();
        let send_queue = Arc::new(SendQueue::new());
        let handle = spawn_connection(local, ConnectionId(1), test_addr(), ConnectionRole::Server, 1024, handler, send_queue);

        assert!(handle.hand_off(OutboundMessage { message_id: 77, payload: Bytes::from_static(b"reply") }));

        let expected = frame(77, b"reply");
        let mut read = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut read)).await.unwrap().unwrap();
        assert_eq!(read, expected);
    }

    #[tokio::test]
    async fn test_request_close_purges_send_queue() {
        let (_peer, local) = duplex(1024);
        let handler = RecordingHandler::new();
        let send_queue = Arc::new(SendQueue::new());
        let handle = spawn_connection(local, ConnectionId(1), test_addr(), ConnectionRole::Server, 1024, handler.clone(), send_queue.clone());

        send_queue.enqueue(handle.clone(), 1, Bytes::from_static(b"pending"));
        handle.request_close();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        }).await.unwrap();
        assert_eq!(send_queue.len(), 0);
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mock_handler_sees_message() {
        let (mut peer, local) = duplex(1024);
        let mut handler = MockConnectionHandler::new();
        handler.expect_on_message()
            .withf(|_, id, payload| *id == 3 && payload.as_ref() == b"abc")
            .once()
            .returning(|_, _, _| ());
        handler.expect_on_disconnect()
            .times(0..=1)
            .returning(|_| ());

        let send_queue = Arc::new(SendQueue::new());
        let _handle = spawn_connection(local, ConnectionId(9), test_addr(), ConnectionRole::Server, 1024, Arc::new(handler), send_queue);

        peer.write_all(&frame(3, b"abc")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
