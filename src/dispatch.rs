use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::{ConnectionHandle, ConnectionHandler, ConnectionId};
use crate::send_queue::SendQueue;
use crate::server_rpc::ServerRpc;
use crate::wire_header::{PING_MESSAGE_ID, VERSION_MESSAGE_ID};
use crate::work_queue::{InboundWork, WorkQueue};

/// The service-layer seam: gets a ready-to-use [ServerRpc] per request and is free to reply
///  from whatever context it likes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_rpc(&self, rpc: ServerRpc);
}

/// How completed inbound messages reach the [RpcHandler].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// The connection's driver task invokes the handler synchronously. Lowest latency, but the
    ///  handler must not block - it runs on the task that multiplexes this connection's I/O.
    Direct,
    /// Completed messages go through a bounded work queue consumed by a fixed pool of worker
    ///  tasks, keeping the driver tasks free for I/O while handlers take their time.
    Pooled {
        worker_count: usize,
        queue_capacity: usize,
    },
}

/// Routes each completed inbound message to the handler exactly once, directly or via the
///  worker pool depending on configuration.
pub struct InboundDispatch {
    handler: Arc<dyn RpcHandler>,
    send_queue: Arc<SendQueue>,
    work_queue: Option<Arc<WorkQueue>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl Drop for InboundDispatch {
    fn drop(&mut self) {
        for handle in &self.worker_handles {
            handle.abort();
        }
    }
}

impl InboundDispatch {
    pub fn new(handler: Arc<dyn RpcHandler>, mode: DispatchMode, send_queue: Arc<SendQueue>) -> InboundDispatch {
        let (work_queue, worker_handles) = match mode {
            DispatchMode::Direct => (None, Vec::new()),
            DispatchMode::Pooled { worker_count, queue_capacity } => {
                let work_queue = Arc::new(WorkQueue::new(queue_capacity));
                let handles = (0..worker_count)
                    .map(|_| tokio::spawn(Self::worker_loop(work_queue.clone(), handler.clone(), send_queue.clone())))
                    .collect();
                (Some(work_queue), handles)
            }
        };

        InboundDispatch {
            handler,
            send_queue,
            work_queue,
            worker_handles,
        }
    }

    pub async fn deliver(&self, conn: ConnectionHandle, message_id: u64, payload: Bytes) {
        match &self.work_queue {
            None => {
                let rpc = ServerRpc::new(conn, message_id, payload, self.send_queue.clone());
                self.handler.handle_rpc(rpc).await;
            }
            Some(work_queue) => {
                work_queue.push(InboundWork { conn, message_id, payload }).await;
            }
        }
    }

    pub fn purge(&self, conn_id: ConnectionId) {
        if let Some(work_queue) = &self.work_queue {
            work_queue.purge(conn_id);
        }
    }

    async fn worker_loop(work_queue: Arc<WorkQueue>, handler: Arc<dyn RpcHandler>, send_queue: Arc<SendQueue>) {
        loop {
            let work = work_queue.pop().await;
            if work.conn.is_closed() {
                debug!("discarding message {} for connection {} that closed while queued", work.message_id, work.conn.id());
                continue;
            }
            let rpc = ServerRpc::new(work.conn, work.message_id, work.payload, send_queue.clone());
            handler.handle_rpc(rpc).await;
        }
    }
}

/// The per-connection capability installed on server-accepted connections: answers heartbeat
///  pings inline, drops version probes (negotiation lives above this layer), and forwards
///  everything else to the dispatch.
pub struct ServerConnectionHandler {
    dispatch: Arc<InboundDispatch>,
    send_queue: Arc<SendQueue>,
}

impl ServerConnectionHandler {
    pub fn new(dispatch: Arc<InboundDispatch>, send_queue: Arc<SendQueue>) -> ServerConnectionHandler {
        ServerConnectionHandler {
            dispatch,
            send_queue,
        }
    }
}

#[async_trait]
impl ConnectionHandler for ServerConnectionHandler {
    async fn on_message(&self, conn: &ConnectionHandle, message_id: u64, payload: Bytes) {
        match message_id {
            PING_MESSAGE_ID => {
                debug!("responding to ping from {}", conn.peer_addr());
                self.send_queue.enqueue(conn.clone(), PING_MESSAGE_ID, Bytes::new());
            }
            VERSION_MESSAGE_ID => {
                debug!("dropping version probe from {} - version negotiation is not part of this layer", conn.peer_addr());
            }
            _ => {
                self.dispatch.deliver(conn.clone(), message_id, payload).await;
            }
        }
    }

    async fn on_disconnect(&self, conn: &ConnectionHandle) {
        self.dispatch.purge(conn.id());
    }
}
