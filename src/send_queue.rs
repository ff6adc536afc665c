use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace};

use crate::connection::{ConnectionHandle, ConnectionId, OutboundMessage};

struct QueueElem {
    conn: ConnectionHandle,
    message_id: u64,
    payload: Bytes,
}

/// The process-wide outbound FIFO. `enqueue` is callable from any task and never touches
///  connection state - a connection's send state machine is only ever driven by its own driver
///  task, which gets its work from the pump (see [spawn_pump]).
pub struct SendQueue {
    queue: Mutex<VecDeque<QueueElem>>,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, conn: ConnectionHandle, message_id: u64, payload: Bytes) {
        trace!("enqueueing message {} for connection {}", message_id, conn.id());
        self.queue.lock().expect("send queue lock poisoned")
            .push_back(QueueElem { conn, message_id, payload });
    }

    fn pop(&self) -> Option<QueueElem> {
        self.queue.lock().expect("send queue lock poisoned")
            .pop_front()
    }

    /// Drop all entries for a connection that is going away. Called during connection teardown,
    ///  before the connection's resources are released.
    pub fn purge(&self, conn_id: ConnectionId) {
        self.queue.lock().expect("send queue lock poisoned")
            .retain(|e| e.conn.id() != conn_id);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("send queue lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The pump decouples arbitrary producer tasks from the single-writer-per-connection invariant:
///  a recurring tick pops at most one entry and hands it to the owning connection's driver
///  task. Entries for connections that closed while queued are discarded here.
pub(crate) fn spawn_pump(send_queue: Arc<SendQueue>, tick_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(tick_interval);
        loop {
            tick.tick().await;

            let Some(elem) = send_queue.pop() else {
                continue;
            };
            if elem.conn.is_closed() {
                debug!("discarding queued message {} for closed connection {}", elem.message_id, elem.conn.id());
                continue;
            }
            let message = OutboundMessage {
                message_id: elem.message_id,
                payload: elem.payload,
            };
            if !elem.conn.hand_off(message) {
                debug!("connection {} went away, dropping queued message {}", elem.conn.id(), elem.message_id);
            }
        }
    })
}
