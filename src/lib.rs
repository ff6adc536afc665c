//! A message-oriented transport and session layer for request / response style RPC over TCP.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of opaque bytes)
//!   with a correlation id, not streams of bytes - matching replies to requests is this layer's
//!   job, interpreting the bytes is the application's
//! * Fully asynchronous on both sides:
//!   * a client submits any number of concurrent requests on one connection and waits (with a
//!     deadline) or cancels per call; replies may arrive in any order
//!   * a server handler replies from whatever task it likes, at most once per request
//! * No task ever blocks on the network on behalf of another: each connection's socket is owned
//!   exclusively by one driver task, and all other parties talk to it through queues
//! * Failures are not exceptional: a lost connection resolves every outstanding call with a
//!   session-level error, a client detects a dead server through ping / timeout while calls are
//!   outstanding, and a session whose dial failed behaves like any other failed session
//!
//! ## Wire format
//!
//! Every message is one frame; all numbers in network byte order (BE):
//! ```ascii
//!  0: magic (u16) - 0xdaf4, cheap protection against a non-speaker on the port
//!  2: protocol version (u16) - currently always 1
//!  4: payload length (u32) - number of payload bytes following the header
//!  8: message id (u64) - chosen by the requester, echoed verbatim in the response
//! 16: payload
//! ```
//!
//! The two highest message ids are reserved: [wire_header::PING_MESSAGE_ID] for liveness probes
//!  (empty payload, echoed by the server) and [wire_header::VERSION_MESSAGE_ID] for version
//!  negotiation probes (dropped by this layer).

pub mod client_session;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod end_point;
mod message_assembly;
pub mod safe_converter;
mod send_buffer;
pub mod send_queue;
pub mod server_rpc;
pub mod wire_header;
mod work_queue;

pub use client_session::{CallStatus, ClientSession, RpcCall};
pub use config::TransportConfig;
pub use dispatch::{DispatchMode, RpcHandler};
pub use end_point::EndPoint;
pub use server_rpc::ServerRpc;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
