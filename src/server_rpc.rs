use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::send_queue::SendQueue;

/// One inbound request plus a single-use reply capability. The service layer consumes the
///  request bytes and eventually calls [ServerRpc::send_reply]; everything it does goes through
///  the outbound queue, never through the connection itself.
///
/// The connection reference is cleared on first use, so replying twice (or replying after
///  [ServerRpc::close_session]) is a silent no-op rather than a protocol violation. A reply
///  for a connection that was torn down in the meantime is dropped by the outbound queue pump.
pub struct ServerRpc {
    pub request: Bytes,
    message_id: u64,
    reply_target: Mutex<Option<ConnectionHandle>>,
    send_queue: Arc<SendQueue>,
}

impl ServerRpc {
    pub(crate) fn new(conn: ConnectionHandle, message_id: u64, request: Bytes, send_queue: Arc<SendQueue>) -> ServerRpc {
        ServerRpc {
            request,
            message_id,
            reply_target: Mutex::new(Some(conn)),
            send_queue,
        }
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Enqueue the reply, echoing the request's message id. Effective at most once.
    pub fn send_reply(&self, response: Bytes) {
        let mut target = self.reply_target.lock().expect("reply target lock poisoned");
        match target.take() {
            Some(conn) => self.send_queue.enqueue(conn, self.message_id, response),
            None => debug!("dropping duplicate reply for message {}", self.message_id),
        }
    }

    /// Request teardown of the originating connection, e.g. on an unrecoverable request. The
    ///  reply capability is spent by this.
    pub fn close_session(&self) {
        let mut target = self.reply_target.lock().expect("reply target lock poisoned");
        if let Some(conn) = target.take() {
            conn.request_close();
        }
    }
}

impl std::fmt::Debug for ServerRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRpc")
            .field("message_id", &self.message_id)
            .field("request_len", &self.request.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionRole};
    use std::net::SocketAddr;

    fn test_conn() -> ConnectionHandle {
        ConnectionHandle::new(
            ConnectionId(1),
            SocketAddr::from(([127, 0, 0, 1], 9)),
            ConnectionRole::Server,
        ).0
    }

    #[test]
    fn test_reply_is_sent_at_most_once() {
        let send_queue = Arc::new(SendQueue::new());
        let rpc = ServerRpc::new(test_conn(), 12, Bytes::from_static(b"req"), send_queue.clone());

        rpc.send_reply(Bytes::from_static(b"first"));
        rpc.send_reply(Bytes::from_static(b"second"));

        assert_eq!(send_queue.len(), 1);
    }

    #[test]
    fn test_no_reply_after_close_session() {
        let send_queue = Arc::new(SendQueue::new());
        let conn = test_conn();
        let rpc = ServerRpc::new(conn.clone(), 12, Bytes::new(), send_queue.clone());

        rpc.close_session();
        assert!(conn.is_close_requested());

        rpc.send_reply(Bytes::from_static(b"too late"));
        assert_eq!(send_queue.len(), 0);
    }

    #[test]
    fn test_close_session_is_idempotent() {
        let send_queue = Arc::new(SendQueue::new());
        let rpc = ServerRpc::new(test_conn(), 12, Bytes::new(), send_queue);

        rpc.close_session();
        rpc.close_session();
    }
}
