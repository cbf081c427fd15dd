//! Connection - one managed outbound socket to a remote endpoint
//!
//! `write()` never waits on the network: messages go onto a bounded queue
//! drained by a per-channel writer task, which reports each send outcome
//! exactly once. A reader task matches responses to pending callbacks by
//! `seq`. A reconnect swaps the channel but keeps the Connection identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cr_common::{
    Endpoint, FailureCause, FailureKind, InvocationRequest, InvocationResponse, MessageType,
};
use cr_config::ClientConfig;
use crate::callback::Callback;
use crate::error::RpcError;
use crate::rpc_metrics;
use crate::wire;
use crate::Result;

/// Log lines are suppressed after this many consecutive connect failures,
/// except for every multiple of it.
const LOG_THROTTLE_EVERY: u64 = 100;

/// Alternate connections to the same logical target, used for failover
pub trait ConnectionSet: Send + Sync {
    /// A connection other than `failed` that can take the message, if any
    fn alternate(&self, failed: &Connection) -> Option<Arc<Connection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// A send completed with an error
    WriteFailed,
    /// A message could not be sent on its channel and was failed over or failed
    ConnectException,
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub kind: ConnectionEventKind,
    pub address: String,
    pub service_name: String,
    pub seq: u64,
    pub cause: String,
}

/// Fire-and-forget receiver of connection failures
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ConnectionEvent);
}

pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn publish(&self, _event: ConnectionEvent) {}
}

/// Whether a load balancer may toggle the active flag
#[derive(Debug)]
pub enum HealthControl {
    Controllable(AtomicBool),
    AlwaysActive,
}

#[derive(Debug, Default)]
struct LogThrottle {
    count: AtomicU64,
}

impl LogThrottle {
    /// Count an occurrence and report whether it should be logged
    fn record(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        count <= LOG_THROTTLE_EVERY || count % LOG_THROTTLE_EVERY == 0
    }

    fn should_log(&self) -> bool {
        let count = self.count.load(Ordering::Relaxed);
        count <= LOG_THROTTLE_EVERY || count % LOG_THROTTLE_EVERY == 0
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

/// A request queued for the writer, with its optional callback
struct OutboundMessage {
    request: InvocationRequest,
    callback: Option<Callback>,
    /// Cleared once the message has been failed over
    failover_allowed: bool,
}

struct PendingCall {
    /// Channel the request was written on
    channel_id: u64,
    message_type: MessageType,
    callback: Callback,
}

struct ChannelHandle {
    id: u64,
    tx: mpsc::Sender<OutboundMessage>,
    close_signal: Arc<Notify>,
    reader: JoinHandle<()>,
}

impl ChannelHandle {
    /// Stop reading and let the writer fail whatever is still queued
    fn close(&self) {
        self.close_signal.notify_one();
        self.reader.abort();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct ConnectionBuilder {
    endpoint: Endpoint,
    config: ClientConfig,
    health: HealthControl,
    connection_set: Option<Arc<dyn ConnectionSet>>,
    event_sink: Arc<dyn EventSink>,
}

impl ConnectionBuilder {
    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Let a load balancer toggle the active flag
    pub fn health_controllable(mut self) -> Self {
        self.health = HealthControl::Controllable(AtomicBool::new(true));
        self
    }

    pub fn connection_set(mut self, set: Arc<dyn ConnectionSet>) -> Self {
        self.connection_set = Some(set);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn build(self) -> Arc<Connection> {
        let address = self.endpoint.address();
        Arc::new_cyclic(|self_ref| Connection {
            endpoint: self.endpoint,
            address,
            config: self.config,
            channel: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            health: self.health,
            log_throttle: LogThrottle::default(),
            pending: DashMap::new(),
            connection_set: RwLock::new(self.connection_set),
            event_sink: self.event_sink,
            next_channel_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }
}

pub struct Connection {
    endpoint: Endpoint,
    address: String,
    config: ClientConfig,
    channel: RwLock<Option<Arc<ChannelHandle>>>,
    connect_lock: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    closed: AtomicBool,
    health: HealthControl,
    log_throttle: LogThrottle,
    pending: DashMap<u64, PendingCall>,
    connection_set: RwLock<Option<Arc<dyn ConnectionSet>>>,
    event_sink: Arc<dyn EventSink>,
    next_channel_id: AtomicU64,
    self_ref: Weak<Connection>,
}

impl Connection {
    pub fn builder(endpoint: Endpoint) -> ConnectionBuilder {
        ConnectionBuilder {
            endpoint,
            config: ClientConfig::default(),
            health: HealthControl::AlwaysActive,
            connection_set: None,
            event_sink: Arc::new(NoOpEventSink),
        }
    }

    pub fn new(endpoint: Endpoint, config: ClientConfig) -> Arc<Self> {
        Self::builder(endpoint).client_config(config).build()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// `host:port`
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_connection_set(&self, set: Arc<dyn ConnectionSet>) {
        *self.connection_set.write() = Some(set);
    }

    /// Establish a channel unless already connected or closed.
    ///
    /// Attempts are serialized; a caller arriving during an attempt observes
    /// its outcome. A failed attempt leaves the previous state untouched.
    pub async fn connect(&self) -> Result<()> {
        let _attempt = self.connect_lock.lock().await;

        if self.is_connected() || self.is_closed() {
            self.log_throttle.reset();
            return Ok(());
        }

        let log = self.log_throttle.record();
        if log {
            info!(address = %self.address, "Connecting");
        }

        let timeout = self.config.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(self.address.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(e.to_string(), log)),
            Err(_) => {
                return Err(self.connect_failed(format!("timed out after {}ms", timeout.as_millis()), log))
            }
        };

        if self.is_closed() {
            debug!(address = %self.address, "Closed while connecting, discarding new socket");
            return Ok(());
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!(address = %self.address, error = %e, "Failed to set TCP_NODELAY");
        }

        let handle = Arc::new(self.open_channel(stream));
        let channel_id = handle.id;
        let previous = self.channel.write().replace(handle);
        if let Some(previous) = previous {
            info!(address = %self.address, channel = previous.id, "Closing previous channel");
            previous.close();
            self.fail_pending_on(
                previous.id,
                &RpcError::ConnectionClosed(format!("channel {} replaced by reconnect", previous.id)),
            );
        }
        self.connected.store(true, Ordering::SeqCst);
        self.log_throttle.reset();

        // close() may have run between the check above and the swap
        if self.is_closed() {
            self.connected.store(false, Ordering::SeqCst);
            if let Some(handle) = self.channel.write().take() {
                handle.close();
            }
            return Ok(());
        }

        info!(address = %self.address, channel = channel_id, "Connected");
        Ok(())
    }

    fn connect_failed(&self, reason: String, log: bool) -> RpcError {
        rpc_metrics::record_connect_failure(&self.address);
        if log {
            error!(address = %self.address, reason = %reason, "Connect failed");
        }
        RpcError::ConnectFailed {
            address: self.address.clone(),
            reason,
        }
    }

    fn open_channel(&self, stream: TcpStream) -> ChannelHandle {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.config.write_queue_capacity.max(1));
        let close_signal = Arc::new(Notify::new());

        tokio::spawn(run_writer(self.self_ref.clone(), id, write_half, rx, close_signal.clone()));
        let reader = tokio::spawn(run_reader(self.self_ref.clone(), id, read_half));

        ChannelHandle {
            id,
            tx,
            close_signal,
            reader,
        }
    }

    /// Queue a request on the current channel.
    ///
    /// Fails fast with [`RpcError::ChannelUnavailable`] when there is no
    /// channel and with [`RpcError::WriteQueueFull`] when the queue is full;
    /// in both cases nothing is sent and the callback is dropped. Send
    /// failures after queuing are delivered to the callback as failure
    /// responses.
    pub fn write(&self, request: InvocationRequest, callback: Option<Callback>) -> Result<()> {
        self.enqueue(OutboundMessage {
            request,
            callback,
            failover_allowed: true,
        })
        .map_err(|(_, e)| e)
    }

    fn enqueue(&self, message: OutboundMessage) -> std::result::Result<(), (OutboundMessage, RpcError)> {
        let channel = self.channel.read().clone();
        let Some(channel) = channel else {
            error!(
                address = %self.address,
                seq = message.request.seq,
                "No channel available, request not sent"
            );
            rpc_metrics::record_write_failure(&self.address, "no_channel");
            return Err((message, RpcError::ChannelUnavailable(self.address.clone())));
        };

        match channel.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                warn!(
                    address = %self.address,
                    seq = message.request.seq,
                    "Write queue full, request not sent"
                );
                rpc_metrics::record_write_failure(&self.address, "queue_full");
                Err((message, RpcError::WriteQueueFull(self.address.clone())))
            }
            Err(TrySendError::Closed(message)) => {
                rpc_metrics::record_write_failure(&self.address, "channel_closed");
                Err((message, RpcError::ChannelUnavailable(self.address.clone())))
            }
        }
    }

    /// Outcome of one send, reported by the writer. `callback` is only
    /// present for requests that expect no reply and so were never pending.
    fn on_write_complete(&self, request: &InvocationRequest, outcome: Result<()>, callback: Option<Callback>) {
        let cause = match outcome {
            Ok(()) => {
                if let Some(callback) = callback {
                    callback.complete(InvocationResponse::success(request, serde_json::Value::Null));
                }
                return;
            }
            Err(cause) => cause,
        };

        if request.message_type != MessageType::Heartbeat {
            self.connected.store(false, Ordering::SeqCst);
        }
        rpc_metrics::record_write_failure(&self.address, "send_failed");
        warn!(
            address = %self.address,
            seq = request.seq,
            message_type = ?request.message_type,
            error = %cause,
            "Write failed"
        );
        self.event_sink.publish(ConnectionEvent {
            kind: ConnectionEventKind::WriteFailed,
            address: self.address.clone(),
            service_name: request.service_name.clone(),
            seq: request.seq,
            cause: cause.to_string(),
        });

        let response = InvocationResponse::failure(
            request,
            FailureCause::new(FailureKind::Transport, cause.to_string()),
        );
        match callback {
            Some(callback) => {
                callback.complete(response);
            }
            None => self.process_response(response),
        }
    }

    /// A message that never reached the socket: one failover hop for
    /// service requests with a callback, otherwise the callback fails.
    fn connection_exception(&self, message: OutboundMessage, cause: &RpcError) {
        if !matches!(cause, RpcError::WriteQueueFull(_)) {
            self.connected.store(false, Ordering::SeqCst);
        }
        if self.log_throttle.should_log() {
            error!(
                address = %self.address,
                seq = message.request.seq,
                error = %cause,
                "Connection exception"
            );
        }

        let OutboundMessage {
            request,
            callback,
            failover_allowed,
        } = message;
        let Some(callback) = callback else {
            return;
        };

        self.event_sink.publish(ConnectionEvent {
            kind: ConnectionEventKind::ConnectException,
            address: self.address.clone(),
            service_name: request.service_name.clone(),
            seq: request.seq,
            cause: cause.to_string(),
        });

        let alternate = if failover_allowed && request.message_type == MessageType::Service {
            self.connection_set
                .read()
                .as_ref()
                .and_then(|set| set.alternate(self))
                .filter(|alt| alt.address != self.address && alt.is_connected())
        } else {
            None
        };

        let Some(alternate) = alternate else {
            let response = InvocationResponse::failure(
                &request,
                FailureCause::new(FailureKind::Transport, cause.to_string()),
            );
            callback.complete(response);
            return;
        };

        info!(
            from = %self.address,
            to = %alternate.address,
            seq = request.seq,
            "Failing over request to alternate connection"
        );
        rpc_metrics::record_failover(&self.address);
        let retry = OutboundMessage {
            request,
            callback: Some(callback),
            failover_allowed: false,
        };
        if let Err((retry, e)) = alternate.enqueue(retry) {
            if let Some(callback) = retry.callback {
                let response = InvocationResponse::failure(
                    &retry.request,
                    FailureCause::new(FailureKind::Transport, e.to_string()),
                );
                callback.complete(response);
            }
        }
    }

    /// A message left queued on `channel_id` when that channel stopped.
    /// If the channel was replaced by a reconnect, the message moves to the
    /// live channel instead.
    fn on_unsent(&self, channel_id: u64, message: OutboundMessage, cause: &RpcError) {
        let current = self.channel.read().as_ref().map(|channel| channel.id);
        if current.is_some_and(|id| id != channel_id) {
            match self.enqueue(message) {
                Ok(()) => {}
                Err((message, e)) => self.connection_exception(message, &e),
            }
            return;
        }
        self.connection_exception(message, cause);
    }

    /// Deliver a response to the callback waiting on its `seq`
    pub fn process_response(&self, response: InvocationResponse) {
        match self.pending.remove(&response.seq) {
            Some((_, pending)) => {
                pending.callback.complete(response);
            }
            None => debug!(
                address = %self.address,
                seq = response.seq,
                "No pending callback for response"
            ),
        }
    }

    /// Read side of `channel_id` is gone
    fn on_channel_lost(&self, channel_id: u64, cause: RpcError) {
        let lost = {
            let mut channel = self.channel.write();
            match channel.as_ref() {
                Some(current) if current.id == channel_id => channel.take(),
                _ => None,
            }
        };
        if let Some(lost) = lost {
            self.connected.store(false, Ordering::SeqCst);
            lost.close();
            if !self.is_closed() {
                warn!(address = %self.address, channel = channel_id, error = %cause, "Channel lost");
            }
        }
        self.fail_pending_on(channel_id, &cause);
    }

    /// Answer every callback waiting on `channel_id` with a transport failure
    fn fail_pending_on(&self, channel_id: u64, cause: &RpcError) {
        self.fail_pending_where(|pending| pending.channel_id == channel_id, cause);
    }

    /// Answer every waiting callback with a transport failure
    fn fail_pending(&self, cause: &RpcError) {
        self.fail_pending_where(|_| true, cause);
    }

    fn fail_pending_where(&self, matches: impl Fn(&PendingCall) -> bool, cause: &RpcError) {
        let seqs: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| matches(entry.value()))
            .map(|entry| *entry.key())
            .collect();
        for seq in seqs {
            if let Some((_, pending)) = self.pending.remove_if(&seq, |_, pending| matches(pending)) {
                let response = InvocationResponse::failure_for(
                    seq,
                    pending.message_type,
                    FailureCause::new(FailureKind::Transport, cause.to_string()),
                );
                pending.callback.complete(response);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connected with room on the write queue
    pub fn is_writable(&self) -> bool {
        self.is_connected()
            && self
                .channel
                .read()
                .as_ref()
                .is_some_and(|channel| channel.tx.capacity() > 0)
    }

    pub fn is_active(&self) -> bool {
        match &self.health {
            HealthControl::Controllable(active) => active.load(Ordering::SeqCst),
            HealthControl::AlwaysActive => true,
        }
    }

    /// Ignored unless the connection was built health-controllable
    pub fn set_active(&self, active: bool) {
        if let HealthControl::Controllable(flag) = &self.health {
            flag.store(active, Ordering::SeqCst);
        }
    }

    /// Requests written and still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Permanently close. Later `connect()` calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(channel) = self.channel.write().take() {
            channel.close();
        }
        self.fail_pending(&RpcError::ConnectionClosed(self.address.clone()));
        info!(address = %self.address, "Connection closed");
    }

    pub fn is_disposable(&self) -> bool {
        false
    }

    pub fn dispose(&self) {}
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},is connected:{}", self.address, self.is_connected())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .field("active", &self.is_active())
            .finish()
    }
}

async fn run_writer(
    connection: Weak<Connection>,
    channel_id: u64,
    mut socket: OwnedWriteHalf,
    mut rx: mpsc::Receiver<OutboundMessage>,
    close_signal: Arc<Notify>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = close_signal.notified() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let Some(connection) = connection.upgrade() else {
            return;
        };

        let unanswered = match message.callback {
            Some(callback) if message.request.expects_reply() => {
                connection.pending.insert(
                    message.request.seq,
                    PendingCall {
                        channel_id,
                        message_type: message.request.message_type,
                        callback,
                    },
                );
                None
            }
            other => other,
        };
        let outcome = wire::write_frame(&mut socket, &message.request).await;
        connection.on_write_complete(&message.request, outcome, unanswered);
    }

    rx.close();
    let unsent: Vec<OutboundMessage> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    if let Some(connection) = connection.upgrade() {
        if !unsent.is_empty() {
            debug!(address = %connection.address, channel = channel_id, unsent = unsent.len(), "Failing unsent messages");
        }
        let cause = RpcError::ConnectionClosed(format!("channel {} closed before send", channel_id));
        for message in unsent {
            connection.on_unsent(channel_id, message, &cause);
        }
        // Anything written on this channel can no longer be answered
        let cause = RpcError::ConnectionClosed(format!("channel {} closed", channel_id));
        connection.fail_pending_on(channel_id, &cause);
    }

    let _ = tokio::time::timeout(Duration::from_secs(1), socket.shutdown()).await;
}

async fn run_reader(connection: Weak<Connection>, channel_id: u64, socket: OwnedReadHalf) {
    let mut reader = BufReader::new(socket);
    let cause = loop {
        match wire::read_frame::<_, InvocationResponse>(&mut reader).await {
            Ok(Some(response)) => match connection.upgrade() {
                Some(connection) => connection.process_response(response),
                None => return,
            },
            Ok(None) => break RpcError::ConnectionClosed("peer closed the connection".to_string()),
            Err(e) => break e,
        }
    };

    if let Some(connection) = connection.upgrade() {
        connection.on_channel_lost(channel_id, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_throttle() {
        let throttle = LogThrottle::default();
        for _ in 0..100 {
            assert!(throttle.record());
        }
        assert!(!throttle.record()); // 101
        for _ in 102..200 {
            assert!(!throttle.record());
        }
        assert!(throttle.record()); // 200
        throttle.reset();
        assert!(throttle.record());
    }

    #[test]
    fn test_identity_by_address() {
        let a = Connection::new(Endpoint::new("10.0.0.1", 4040), ClientConfig::default());
        let b = Connection::new(Endpoint::new("10.0.0.1", 4040), ClientConfig::default());
        let c = Connection::new(Endpoint::new("10.0.0.2", 4040), ClientConfig::default());
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_eq!(a.address(), "10.0.0.1:4040");
        assert_eq!(a.to_string(), "10.0.0.1:4040,is connected:false");
    }

    #[test]
    fn test_active_flag_capability() {
        let fixed = Connection::new(Endpoint::new("h", 1), ClientConfig::default());
        fixed.set_active(false);
        assert!(fixed.is_active());

        let controllable = Connection::builder(Endpoint::new("h", 1)).health_controllable().build();
        controllable.set_active(false);
        assert!(!controllable.is_active());
        controllable.set_active(true);
        assert!(controllable.is_active());
    }

    #[test]
    fn test_dispose_is_noop() {
        let conn = Connection::new(Endpoint::new("h", 1), ClientConfig::default());
        assert!(!conn.is_disposable());
        conn.dispose();
        assert!(!conn.is_closed());
    }

    fn pending_call(conn: &Connection, request: &InvocationRequest) -> crate::callback::ResponseFuture {
        let (callback, future) = Callback::new();
        conn.pending.insert(
            request.seq,
            PendingCall {
                channel_id: 0,
                message_type: request.message_type,
                callback,
            },
        );
        future
    }

    #[tokio::test]
    async fn test_service_write_failure_marks_unhealthy() {
        let conn = Connection::new(Endpoint::new("h", 1), ClientConfig::default());
        conn.connected.store(true, Ordering::SeqCst);
        let request = InvocationRequest::service(21, "S", "m", serde_json::Value::Null);
        let future = pending_call(&conn, &request);

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        conn.on_write_complete(&request, Err(broken.into()), None);

        assert!(!conn.is_connected());
        let response = future.await.unwrap();
        assert_eq!(response.seq, 21);
        let cause = response.failure_cause().unwrap();
        assert_eq!(cause.kind, FailureKind::Transport);
        assert!(cause.message.contains("broken pipe"));
    }

    #[tokio::test]
    async fn test_heartbeat_write_failure_keeps_health() {
        let conn = Connection::new(Endpoint::new("h", 1), ClientConfig::default());
        conn.connected.store(true, Ordering::SeqCst);
        let request = InvocationRequest::heartbeat(22);
        let future = pending_call(&conn, &request);

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        conn.on_write_complete(&request, Err(broken.into()), None);

        assert!(conn.is_connected());
        assert!(!future.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_successful_write_leaves_callback_pending() {
        let conn = Connection::new(Endpoint::new("h", 1), ClientConfig::default());
        let request = InvocationRequest::service(23, "S", "m", serde_json::Value::Null);
        let _future = pending_call(&conn, &request);

        conn.on_write_complete(&request, Ok(()), None);
        assert_eq!(conn.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_queue_full_does_not_touch_health() {
        let conn = Connection::new(Endpoint::new("h", 1), ClientConfig::default());
        conn.connected.store(true, Ordering::SeqCst);
        let (callback, future) = Callback::new();
        let message = OutboundMessage {
            request: InvocationRequest::service(24, "S", "m", serde_json::Value::Null),
            callback: Some(callback),
            failover_allowed: true,
        };

        conn.connection_exception(message, &RpcError::WriteQueueFull("h:1".to_string()));
        assert!(conn.is_connected());
        assert!(!future.await.unwrap().is_success());
    }

    struct FixedAlternate(Arc<Connection>);

    impl ConnectionSet for FixedAlternate {
        fn alternate(&self, _failed: &Connection) -> Option<Arc<Connection>> {
            Some(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_connection_exception_fails_over_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let alternate = Connection::new(Endpoint::new("127.0.0.1", port), ClientConfig::default());
        alternate.connect().await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        let primary = Connection::new(Endpoint::new("10.255.255.1", port), ClientConfig::default());
        primary.set_connection_set(Arc::new(FixedAlternate(alternate.clone())));
        let (callback, future) = Callback::new();
        let message = OutboundMessage {
            request: InvocationRequest::service(25, "S", "m", serde_json::json!([1])),
            callback: Some(callback),
            failover_allowed: true,
        };
        primary.connection_exception(message, &RpcError::ConnectionClosed("lost".to_string()));
        assert!(!primary.is_connected());

        let received: InvocationRequest = wire::read_frame(&mut server_side).await.unwrap().unwrap();
        assert_eq!(received.seq, 25);
        wire::write_frame(&mut server_side, &InvocationResponse::success(&received, serde_json::json!("ok")))
            .await
            .unwrap();

        let response = future.await.unwrap();
        assert_eq!(response.value(), Some(&serde_json::json!("ok")));
        alternate.close();
    }

    #[tokio::test]
    async fn test_failover_not_repeated() {
        let alternate = Connection::new(Endpoint::new("10.255.255.2", 1), ClientConfig::default());
        let primary = Connection::builder(Endpoint::new("10.255.255.1", 1))
            .connection_set(Arc::new(FixedAlternate(alternate)))
            .build();
        let (callback, future) = Callback::new();
        let message = OutboundMessage {
            request: InvocationRequest::service(26, "S", "m", serde_json::Value::Null),
            callback: Some(callback),
            failover_allowed: false,
        };

        primary.connection_exception(message, &RpcError::ConnectionClosed("lost".to_string()));
        let cause = future.await.unwrap().failure_cause().cloned().unwrap();
        assert_eq!(cause.kind, FailureKind::Transport);
    }

    #[tokio::test]
    async fn test_no_alternate_surfaces_failure() {
        let primary = Connection::new(Endpoint::new("10.255.255.1", 1), ClientConfig::default());
        let (callback, future) = Callback::new();
        let message = OutboundMessage {
            request: InvocationRequest::service(27, "S", "m", serde_json::Value::Null),
            callback: Some(callback),
            failover_allowed: true,
        };

        primary.connection_exception(message, &RpcError::ConnectionClosed("lost".to_string()));
        let response = future.await.unwrap();
        assert_eq!(response.seq, 27);
        assert_eq!(response.failure_cause().unwrap().kind, FailureKind::Transport);
    }

    #[tokio::test]
    async fn test_reconnect_fails_calls_on_replaced_channel() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = Connection::new(Endpoint::new("127.0.0.1", port), ClientConfig::default());
        conn.connect().await.unwrap();
        let (mut first_peer, _) = listener.accept().await.unwrap();

        let (callback, future) = Callback::new();
        conn.write(InvocationRequest::service(31, "S", "m", serde_json::Value::Null), Some(callback))
            .unwrap();
        let _: InvocationRequest = wire::read_frame(&mut first_peer).await.unwrap().unwrap();
        assert_eq!(conn.pending_count(), 1);

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        let failed = InvocationRequest::service(32, "S", "m", serde_json::Value::Null);
        conn.on_write_complete(&failed, Err(broken.into()), None);
        assert!(!conn.is_connected());

        conn.connect().await.unwrap();
        let (mut second_peer, _) = listener.accept().await.unwrap();
        assert!(conn.is_connected());

        let response = tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.seq, 31);
        assert_eq!(response.failure_cause().unwrap().kind, FailureKind::Transport);
        assert_eq!(conn.pending_count(), 0);

        // The new channel still answers its own calls
        let (callback, future) = Callback::new();
        conn.write(InvocationRequest::service(33, "S", "m", serde_json::Value::Null), Some(callback))
            .unwrap();
        let received: InvocationRequest = wire::read_frame(&mut second_peer).await.unwrap().unwrap();
        wire::write_frame(&mut second_peer, &InvocationResponse::success(&received, serde_json::json!("ok")))
            .await
            .unwrap();
        let response = tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .unwrap()
            .unwrap();
        assert!(response.is_success());
        conn.close();
    }

    #[tokio::test]
    async fn test_fail_pending_on_only_touches_that_channel() {
        let conn = Connection::new(Endpoint::new("h", 1), ClientConfig::default());
        let (old_cb, old_future) = Callback::new();
        let (live_cb, _live_future) = Callback::new();
        conn.pending.insert(
            1,
            PendingCall {
                channel_id: 7,
                message_type: MessageType::Service,
                callback: old_cb,
            },
        );
        conn.pending.insert(
            2,
            PendingCall {
                channel_id: 8,
                message_type: MessageType::Service,
                callback: live_cb,
            },
        );

        conn.fail_pending_on(7, &RpcError::ConnectionClosed("replaced".to_string()));
        assert!(!old_future.await.unwrap().is_success());
        assert_eq!(conn.pending_count(), 1);
        assert!(conn.pending.contains_key(&2));
    }

    #[tokio::test]
    async fn test_oneway_write_failure_completes_its_callback() {
        let conn = Connection::new(Endpoint::new("h", 1), ClientConfig::default());
        conn.connected.store(true, Ordering::SeqCst);
        let request = InvocationRequest::service(34, "S", "m", serde_json::Value::Null).oneway();
        let (callback, future) = Callback::new();

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        conn.on_write_complete(&request, Err(broken.into()), Some(callback));
        assert_eq!(future.await.unwrap().failure_cause().unwrap().kind, FailureKind::Transport);
        assert!(!conn.is_connected());
    }
}
