use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::connection::{spawn_connection, ConnectionHandle, ConnectionHandler, ConnectionRole};
use crate::end_point::EndPoint;
use crate::send_queue::SendQueue;
use crate::wire_header::PING_MESSAGE_ID;

/// Resolution state of one outstanding call. This is the one place where getting a race wrong
///  means a lost waiter or a double free, so it is modeled as a tagged state checked under the
///  session lock rather than as loose flags:
/// * the inbound handler moves `Waiting -> HasReply`
/// * `cancel` moves `Waiting -> Canceled` if someone is blocked in `wait` (the waiter then does
///    the cleanup), and removes the record outright otherwise
/// * exactly one of reply / cancel / session error / deadline resolves a call from the waiter's
///    point of view
enum CallState {
    Waiting,
    HasReply(Bytes),
    Canceled,
}

struct PendingCall {
    status: CallState,
    /// set while a task is blocked in `wait` for this call, so a concurrent cancel knows to
    ///  notify-and-leave rather than remove the record out from under the waiter
    has_waiter: bool,
    ready: Arc<Notify>,
}

impl PendingCall {
    fn new() -> PendingCall {
        PendingCall {
            status: CallState::Waiting,
            has_waiter: false,
            ready: Arc::new(Notify::new()),
        }
    }
}

struct SessionInner {
    next_message_id: u64,
    calls: FxHashMap<u64, PendingCall>,
    /// sticky session-level error - empty means healthy. Once set, every past and future call
    ///  on this session resolves to it.
    error_message: String,
    num_active: usize,
    /// meaningful only while `num_active > 0`: a ping is in flight and unanswered
    active_ping: bool,
}

impl SessionInner {
    fn new() -> SessionInner {
        SessionInner {
            next_message_id: 0,
            calls: FxHashMap::default(),
            error_message: String::new(),
            num_active: 0,
            active_ping: false,
        }
    }
}

struct SessionTransport {
    conn: ConnectionHandle,
    send_queue: Arc<SendQueue>,
}

/// Client side of one connection: allocates message ids, matches asynchronous replies to
///  pending calls, and turns disconnects and heartbeat timeouts into a sticky session error.
///
/// All operations are safe to call from any task; they synchronize through the session lock
///  and the outbound queue only and never touch the connection directly.
pub struct ClientSession {
    server_addr: Option<SocketAddr>,
    heartbeat_interval: Duration,
    max_message_size: u32,
    transport: Option<SessionTransport>,
    inner: Mutex<SessionInner>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

/// Outcome of one call as seen by its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    NotReady,
    Ok,
    Error,
    Canceled,
}

/// Handle binding a caller to one submitted request. `wait` blocks (asynchronously) for a
///  resolution, `update` harvests it; a handle that is dropped without either simply leaves its
///  record to be failed or cleaned up with the session.
pub struct RpcCall {
    session: Option<Arc<ClientSession>>,
    message_id: u64,
    pub reply: Option<Bytes>,
    pub error_message: String,
    pub status: CallStatus,
}

impl RpcCall {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Block until the call is resolved or `deadline` passes, whichever comes first. On a
    ///  deadline the call's record stays intact for a later `cancel` or `update`.
    pub async fn wait(&self, deadline: Instant) {
        if let Some(session) = &self.session {
            session.wait(self.message_id, deadline).await;
        }
    }

    /// Detach this call. Non-blocking; if a reply arrives later it is dropped for lack of a
    ///  table entry.
    pub fn cancel(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel(self.message_id);
        }
        self.reply = None;
        self.error_message = "call canceled".to_string();
        self.status = CallStatus::Canceled;
    }

    /// Harvest the resolution if there is one, transferring ownership of the reply buffer to
    ///  this handle and releasing the table entry.
    pub fn update(&mut self) {
        if let Some(session) = self.session.clone() {
            session.update(self);
        }
    }

    pub async fn wait_for_reply(&mut self, deadline: Instant) {
        self.wait(deadline).await;
        self.update();
    }
}

impl ClientSession {
    /// Dial `server_addr` and build a session on the resulting connection. A failed dial still
    ///  produces a session - one that is born with its sticky error set, so the caller's
    ///  error handling is uniform.
    pub async fn connect(end_point: &EndPoint, server_addr: SocketAddr) -> Arc<ClientSession> {
        let config = end_point.config();
        let max_message_size = config.max_message_size;
        let heartbeat_interval = config.heartbeat_interval;

        let stream = match TcpStream::connect(server_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("failed to connect to {}: {}", server_addr, e);
                return Self::error_session(format!("Failed to connect to server {}: {}", server_addr, e));
            }
        };
        info!("connected to {}", server_addr);

        let send_queue = end_point.send_queue().clone();
        let conn_id = end_point.next_connection_id();

        let session = Arc::new_cyclic(|weak: &Weak<ClientSession>| {
            let handler: Arc<dyn ConnectionHandler> = Arc::new(SessionConnectionHandler {
                session: weak.clone(),
            });
            let conn = spawn_connection(
                stream,
                conn_id,
                server_addr,
                ConnectionRole::ClientEstablished,
                max_message_size,
                handler,
                send_queue.clone(),
            );
            ClientSession {
                server_addr: Some(server_addr),
                heartbeat_interval,
                max_message_size,
                transport: Some(SessionTransport { conn, send_queue }),
                inner: Mutex::new(SessionInner::new()),
                heartbeat_task: Mutex::new(None),
            }
        });
        session.spawn_heartbeat();
        session
    }

    /// A session that never had a connection and reports `error_message` for every call.
    pub fn error_session(error_message: String) -> Arc<ClientSession> {
        let mut inner = SessionInner::new();
        inner.error_message = error_message;
        Arc::new(ClientSession {
            server_addr: None,
            heartbeat_interval: Duration::from_millis(500),
            max_message_size: u32::MAX,
            transport: None,
            inner: Mutex::new(inner),
            heartbeat_task: Mutex::new(None),
        })
    }

    /// Allocate a message id, register a pending call and queue the framed request. If the
    ///  session already has its sticky error the transmission is skipped - the returned handle
    ///  still works and resolves to that error immediately.
    pub fn submit(self: &Arc<Self>, request: Bytes) -> RpcCall {
        if request.len() > self.max_message_size as usize {
            warn!("message of {} bytes is too long to send (limit is {} bytes)", request.len(), self.max_message_size);
            return RpcCall {
                session: None,
                message_id: 0,
                reply: None,
                error_message: format!("message of {} bytes is too long to send (limit is {} bytes)", request.len(), self.max_message_size),
                status: CallStatus::Error,
            };
        }

        let (message_id, transmit) = {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            let message_id = inner.next_message_id;
            inner.next_message_id += 1;
            inner.calls.insert(message_id, PendingCall::new());
            inner.num_active += 1;
            if inner.num_active == 1 {
                // active_ping is undefined while no calls are outstanding
                inner.active_ping = false;
            }
            (message_id, inner.error_message.is_empty())
        };

        if transmit {
            if let Some(transport) = &self.transport {
                transport.send_queue.enqueue(transport.conn.clone(), message_id, request);
            }
        }
        trace!("submitted request as message {}", message_id);

        RpcCall {
            session: Some(self.clone()),
            message_id,
            reply: None,
            error_message: String::new(),
            status: CallStatus::NotReady,
        }
    }

    pub fn error_message(&self) -> String {
        self.inner.lock().expect("session lock poisoned")
            .error_message.clone()
    }

    pub(crate) async fn wait(&self, message_id: u64, deadline: Instant) {
        enum Check {
            Resolved,
            CanceledCleanup,
            KeepWaiting,
        }

        loop {
            let notify = {
                let mut inner = self.inner.lock().expect("session lock poisoned");
                let check = match inner.calls.get(&message_id) {
                    None => return, // canceled or already updated
                    Some(call) => match &call.status {
                        CallState::HasReply(_) => Check::Resolved,
                        CallState::Canceled => Check::CanceledCleanup,
                        CallState::Waiting => Check::KeepWaiting,
                    },
                };
                match check {
                    Check::Resolved => return,
                    Check::CanceledCleanup => {
                        // the canceling side saw our has_waiter flag and left the record for us
                        inner.calls.remove(&message_id);
                        return;
                    }
                    Check::KeepWaiting => {}
                }
                if !inner.error_message.is_empty() {
                    return;
                }
                if deadline <= Instant::now() {
                    return;
                }
                let call = inner.calls.get_mut(&message_id).expect("call was present above");
                call.has_waiter = true;
                call.ready.clone()
            };

            let _ = timeout_at(deadline, notify.notified()).await;

            let mut inner = self.inner.lock().expect("session lock poisoned");
            if let Some(call) = inner.calls.get_mut(&message_id) {
                call.has_waiter = false;
            }
        }
    }

    pub(crate) fn cancel(&self, message_id: u64) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        let Some(call) = inner.calls.get_mut(&message_id) else {
            return;
        };
        if call.has_waiter {
            call.status = CallState::Canceled;
            call.ready.notify_one();
        } else {
            inner.calls.remove(&message_id);
        }
        inner.num_active = inner.num_active.saturating_sub(1);
    }

    pub(crate) fn update(&self, rpc: &mut RpcCall) {
        let mut inner = self.inner.lock().expect("session lock poisoned");

        let has_reply = match inner.calls.get(&rpc.message_id) {
            None => return, // canceled; the handle's fields are set already
            Some(call) => matches!(call.status, CallState::HasReply(_)),
        };

        if has_reply {
            if let Some(PendingCall { status: CallState::HasReply(reply), .. }) = inner.calls.remove(&rpc.message_id) {
                rpc.reply = Some(reply);
                rpc.status = CallStatus::Ok;
                rpc.session = None;
            }
        }
        else if !inner.error_message.is_empty() {
            inner.calls.remove(&rpc.message_id);
            rpc.error_message = inner.error_message.clone();
            rpc.status = CallStatus::Error;
            rpc.session = None;
        }
        // else: not resolved yet - leave the record and the handle untouched
    }

    fn handle_reply(&self, message_id: u64, payload: Bytes) {
        let mut inner = self.inner.lock().expect("session lock poisoned");

        if message_id == PING_MESSAGE_ID {
            if inner.num_active > 0 && inner.active_ping {
                // the server has shown that it is alive for now
                inner.active_ping = false;
            } else {
                trace!("received an unexpected ping response - this happens e.g. when all calls complete before the ping response arrives and is no cause for alarm");
            }
            return;
        }

        let Some(call) = inner.calls.get_mut(&message_id) else {
            trace!("received a response with unknown message id {} - this happens e.g. when a call is canceled before its response arrives and is no cause for alarm", message_id);
            return;
        };
        match &call.status {
            CallState::HasReply(_) => {
                warn!("received a second response for message id {} - the peer is assigning message ids incorrectly or misbehaving, dropping it", message_id);
                return;
            }
            CallState::Canceled => {
                trace!("dropping response for canceled message id {}", message_id);
                return;
            }
            CallState::Waiting => {}
        }

        call.status = CallState::HasReply(payload);
        call.ready.notify_one();
        inner.num_active = inner.num_active.saturating_sub(1);
    }

    fn handle_disconnect(&self) {
        self.fail_session(format!("Disconnected from server {}", self.display_addr()));
    }

    /// Set the sticky error (first one wins) and wake every waiting call.
    fn fail_session(&self, error_message: String) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        if inner.error_message.is_empty() {
            debug!("failing session: {}", error_message);
            inner.error_message = error_message;
            for call in inner.calls.values() {
                call.ready.notify_one();
            }
        }
    }

    fn display_addr(&self) -> String {
        match self.server_addr {
            Some(addr) => addr.to_string(),
            None => "<unconnected>".to_string(),
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.tick().await; // the immediate first tick
            loop {
                ticks.tick().await;
                match weak.upgrade() {
                    None => return,
                    Some(session) => session.on_heartbeat_tick(),
                }
            }
        });
        *self.heartbeat_task.lock().expect("heartbeat task lock poisoned") = Some(handle);
    }

    /// Liveness probing runs only while calls are outstanding: each period either sends a ping
    ///  or, if the previous one is still unanswered, declares the peer dead.
    fn on_heartbeat_tick(&self) {
        let Some(transport) = &self.transport else {
            return;
        };

        let send_ping = {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            if inner.num_active == 0 || !inner.error_message.is_empty() {
                return;
            }
            if inner.active_ping {
                false
            } else {
                inner.active_ping = true;
                true
            }
        };

        if send_ping {
            trace!("pinging {}", self.display_addr());
            transport.send_queue.enqueue(transport.conn.clone(), PING_MESSAGE_ID, Bytes::new());
        } else {
            self.fail_session(format!("Server {} timed out", self.display_addr()));
            transport.conn.request_close();
        }
    }
}

impl Display for ClientSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let error = self.error_message();
        if error.is_empty() {
            write!(f, "Active session to {}", self.display_addr())
        } else {
            // the error already names the server's address
            write!(f, "Closed session: {}", error)
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat_task.lock().expect("heartbeat task lock poisoned").take() {
            handle.abort();
        }
        if let Some(transport) = &self.transport {
            transport.conn.request_close();
        }
        // no waiter can outlive the session (they hold a reference), but force-notify anyway
        let inner = self.inner.get_mut().expect("session lock poisoned");
        for call in inner.calls.values() {
            call.ready.notify_one();
        }
    }
}

/// Adapter installed on the client connection; holds the session weakly so a session (and its
///  calls) going away also releases the connection-side reference.
struct SessionConnectionHandler {
    session: Weak<ClientSession>,
}

#[async_trait]
impl ConnectionHandler for SessionConnectionHandler {
    async fn on_message(&self, _conn: &ConnectionHandle, message_id: u64, payload: Bytes) {
        if let Some(session) = self.session.upgrade() {
            session.handle_reply(message_id, payload);
        }
    }

    async fn on_disconnect(&self, _conn: &ConnectionHandle) {
        if let Some(session) = self.session.upgrade() {
            session.handle_disconnect();
        }
    }
}
