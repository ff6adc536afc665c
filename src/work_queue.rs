use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::trace;

use crate::connection::{ConnectionHandle, ConnectionId};

/// One received message awaiting delivery to the worker pool.
pub struct InboundWork {
    pub conn: ConnectionHandle,
    pub message_id: u64,
    pub payload: Bytes,
}

/// Bounded FIFO between the connection driver tasks and the worker pool. A full queue applies
///  backpressure to the pushing connection task instead of dropping work; each entry is popped
///  by exactly one worker.
pub struct WorkQueue {
    queue: Mutex<VecDeque<InboundWork>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> WorkQueue {
        assert!(capacity > 0);
        WorkQueue {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub async fn push(&self, work: InboundWork) {
        let mut work = Some(work);
        loop {
            {
                let mut queue = self.queue.lock().expect("work queue lock poisoned");
                if queue.len() < self.capacity {
                    queue.push_back(work.take().expect("work is only taken once"));
                    drop(queue);
                    self.readable.notify_one();
                    return;
                }
            }
            trace!("work queue full, waiting for a worker to catch up");
            self.writable.notified().await;
        }
    }

    pub async fn pop(&self) -> InboundWork {
        loop {
            {
                let mut queue = self.queue.lock().expect("work queue lock poisoned");
                if let Some(work) = queue.pop_front() {
                    // wake the next idle worker if there is a backlog - notify_one permits
                    //  do not accumulate, so the chain has to be kept alive explicitly
                    if !queue.is_empty() {
                        self.readable.notify_one();
                    }
                    drop(queue);
                    self.writable.notify_one();
                    return work;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Drop all undelivered entries of a connection that is being torn down, so no worker ever
    ///  sees a message for a dead connection.
    pub fn purge(&self, conn_id: ConnectionId) {
        self.queue.lock().expect("work queue lock poisoned")
            .retain(|w| w.conn.id() != conn_id);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("work queue lock poisoned")
            .len()
    }
}
