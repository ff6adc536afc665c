use std::time::Duration;

use anyhow::bail;

use crate::dispatch::DispatchMode;

/// Tuning knobs for one transport end point. Loading these from an external source is the
///  application's business; this layer only validates and applies them.
pub struct TransportConfig {
    /// Upper bound for a single message's payload. Applied symmetrically: received headers
    ///  declaring more than this terminate the connection, and oversized send attempts are a
    ///  caller bug caught before anything is queued.
    pub max_message_size: u32,

    /// How often the outbound queue pump wakes up to hand one queued message to its
    ///  connection. This bounds the added latency of the queue hand-off; it does not rate-limit
    ///  throughput since a non-empty queue keeps getting drained tick after tick.
    pub send_tick_interval: Duration,

    /// Delivery mode for inbound server-side messages, see [DispatchMode].
    pub dispatch_mode: DispatchMode,

    /// While a client session has calls outstanding it pings the server at this interval; a
    ///  ping that is still unanswered when the next tick arrives counts as a dead peer and
    ///  fails the session the same way a disconnect does.
    pub heartbeat_interval: Duration,
}

impl TransportConfig {
    pub fn default_config() -> TransportConfig {
        TransportConfig {
            max_message_size: 1024 * 1024,
            send_tick_interval: Duration::from_millis(1),
            dispatch_mode: DispatchMode::Pooled {
                worker_count: 3,
                queue_capacity: 1024,
            },
            heartbeat_interval: Duration::from_millis(500),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.send_tick_interval.is_zero() {
            bail!("send tick interval must be positive");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if let DispatchMode::Pooled { worker_count, queue_capacity } = self.dispatch_mode {
            if worker_count == 0 {
                bail!("pooled dispatch needs at least one worker");
            }
            if queue_capacity == 0 {
                bail!("pooled dispatch needs a positive queue capacity");
            }
        }
        Ok(())
    }
}
