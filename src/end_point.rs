use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::{spawn_connection, ConnectionHandler, ConnectionId, ConnectionRole};
use crate::dispatch::{InboundDispatch, RpcHandler, ServerConnectionHandler};
use crate::send_queue::{spawn_pump, SendQueue};

/// The per-process transport context: owns the outbound queue and its pump, allocates
///  connection ids, and accepts inbound connections for any number of bound listeners. Client
///  sessions borrow it on connect ([crate::client_session::ClientSession::connect]); dropping
///  the end point stops the pump and the listeners but leaves already-running connection driver
///  tasks to wind down on their own.
pub struct EndPoint {
    config: TransportConfig,
    send_queue: Arc<SendQueue>,
    next_connection_id: Arc<AtomicU64>,
    pump_task: JoinHandle<()>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EndPoint {
    pub fn new(config: TransportConfig) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let send_queue = Arc::new(SendQueue::new());
        let pump_task = spawn_pump(send_queue.clone(), config.send_tick_interval);
        Ok(EndPoint {
            config,
            send_queue,
            next_connection_id: Arc::new(AtomicU64::new(0)),
            pump_task,
            listener_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn send_queue(&self) -> &Arc<SendQueue> {
        &self.send_queue
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind `bind_addr` and serve inbound connections, handing each request to `handler` per
    ///  the configured [crate::dispatch::DispatchMode]. Returns the actually bound address
    ///  (relevant when binding port 0) once the listener is up; accepting happens on a
    ///  background task.
    pub async fn listen(&self, bind_addr: SocketAddr, handler: Arc<dyn RpcHandler>) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr).await
            .with_context(|| format!("binding listener on {}", bind_addr))?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        let dispatch = Arc::new(InboundDispatch::new(handler, self.config.dispatch_mode, self.send_queue.clone()));
        let conn_handler: Arc<dyn ConnectionHandler> = Arc::new(ServerConnectionHandler::new(dispatch, self.send_queue.clone()));

        let send_queue = self.send_queue.clone();
        let next_connection_id = self.next_connection_id.clone();
        let max_message_size = self.config.max_message_size;

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let id = ConnectionId(next_connection_id.fetch_add(1, Ordering::Relaxed));
                        debug!("accepted connection {} from {}", id, peer_addr);
                        spawn_connection(
                            stream,
                            id,
                            peer_addr,
                            ConnectionRole::Server,
                            max_message_size,
                            conn_handler.clone(),
                            send_queue.clone(),
                        );
                    }
                    Err(e) => {
                        // transient accept errors (e.g. fd exhaustion) do not kill the listener
                        warn!("failed to accept a connection on {}: {}", local_addr, e);
                    }
                }
            }
        });
        self.listener_tasks.lock().expect("listener task lock poisoned")
            .push(accept_task);

        Ok(local_addr)
    }
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.pump_task.abort();
        for task in self.listener_tasks.lock().expect("listener task lock poisoned").iter() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_session::{CallStatus, ClientSession};
    use crate::server_rpc::ServerRpc;
    use async_trait::async_trait;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::time::Duration;
    use tokio::time::Instant;

    struct EchoHandler;
    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle_rpc(&self, rpc: ServerRpc) {
            let mut response = BytesMut::new();
            response.put_slice(b"echo: ");
            response.put_slice(&rpc.request);
            rpc.send_reply(response.freeze());
        }
    }

    struct SlammingHandler;
    #[async_trait]
    impl RpcHandler for SlammingHandler {
        async fn handle_rpc(&self, rpc: ServerRpc) {
            rpc.close_session();
        }
    }

    fn free_loopback_port() -> SocketAddr {
        // bind-and-drop: the port is free again but nothing listens on it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_end_to_end_echo() {
        let end_point = EndPoint::new(TransportConfig::default_config()).unwrap();
        let addr = end_point
            .listen(SocketAddr::from(([127, 0, 0, 1], 0)), Arc::new(EchoHandler))
            .await.unwrap();

        let session = ClientSession::connect(&end_point, addr).await;
        assert_eq!(session.error_message(), "");

        let mut call = session.submit(Bytes::from_static(b"hello"));
        call.wait_for_reply(Instant::now() + Duration::from_secs(10)).await;

        assert_eq!(call.status, CallStatus::Ok);
        assert_eq!(call.reply, Some(Bytes::from_static(b"echo: hello")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_end_to_end_concurrent_calls() {
        let end_point = EndPoint::new(TransportConfig::default_config()).unwrap();
        let addr = end_point
            .listen(SocketAddr::from(([127, 0, 0, 1], 0)), Arc::new(EchoHandler))
            .await.unwrap();

        let session = ClientSession::connect(&end_point, addr).await;
        let mut calls: Vec<_> = (0..10)
            .map(|i| session.submit(Bytes::from(format!("request {}", i))))
            .collect();

        for (i, call) in calls.iter_mut().enumerate() {
            call.wait_for_reply(Instant::now() + Duration::from_secs(10)).await;
            assert_eq!(call.status, CallStatus::Ok);
            assert_eq!(call.reply, Some(Bytes::from(format!("echo: request {}", i))));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_server_initiated_close_fails_client_session() {
        let end_point = EndPoint::new(TransportConfig::default_config()).unwrap();
        let addr = end_point
            .listen(SocketAddr::from(([127, 0, 0, 1], 0)), Arc::new(SlammingHandler))
            .await.unwrap();

        let session = ClientSession::connect(&end_point, addr).await;
        let mut call = session.submit(Bytes::from_static(b"please go away"));
        call.wait_for_reply(Instant::now() + Duration::from_secs(10)).await;

        assert_eq!(call.status, CallStatus::Error);
        assert_eq!(call.error_message, format!("Disconnected from server {}", addr));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_failure_yields_error_session() {
        let end_point = EndPoint::new(TransportConfig::default_config()).unwrap();

        let session = ClientSession::connect(&end_point, free_loopback_port()).await;
        assert!(session.error_message().starts_with("Failed to connect to server"));

        let mut call = session.submit(Bytes::from_static(b"anyone there?"));
        call.wait_for_reply(Instant::now() + Duration::from_secs(10)).await;
        assert_eq!(call.status, CallStatus::Error);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = TransportConfig::default_config();
        config.max_message_size = 0;
        assert!(EndPoint::new(config).is_err());
    }
}
