//! SSE fan-out: sessions, clients, broadcast, and the idle sweeper.
//!
//! A [`StreamSession`] owns the set of subscribed [`StreamClient`]s for
//! one user-and-model conversation. Broadcasting snapshots the client set
//! under a read lock and writes each client's bounded channel without
//! blocking: a full buffer drops the message for that client only,
//! preserving liveness for the rest. The [`StreamManager`] owns the
//! session map and a background sweeper that closes idle clients and
//! sessions.

use crate::channel::unix_ms;
use crate::config::StreamConfig;
use crate::error::{RelayError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::sse::SseFrame;
use crate::stream_handler::SseSink;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One message traveling through the fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMessage {
    /// Unique message id (also the SSE `id:` line).
    pub message_id: String,
    /// Owning session.
    pub session_id: String,
    /// Payload text (a model delta or a full event payload).
    pub content: String,
    /// Whether this is the final message of the stream.
    pub done: bool,
    /// Unix-ms creation timestamp.
    pub timestamp: u64,
    /// Error text, for failure notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form extras.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StreamMessage {
    /// A content message for `session_id`.
    pub fn new(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            content: content.into(),
            done: false,
            timestamp: unix_ms(),
            error: None,
            metadata: None,
        }
    }

    /// Mark this as the final message.
    pub fn with_done(mut self) -> Self {
        self.done = true;
        self
    }

    /// Attach an error.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// One subscriber's registration inside a session.
pub struct StreamClient {
    /// Client identifier (echoed in `X-Client-ID`).
    pub client_id: String,
    sender: mpsc::Sender<StreamMessage>,
    close: CancellationToken,
    last_received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl StreamClient {
    /// Messages successfully queued for this client.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages dropped because this client's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Unix-ms timestamp of the last queued message.
    pub fn last_received_ms(&self) -> u64 {
        self.last_received.load(Ordering::Relaxed)
    }

    fn deliver(&self, message: StreamMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.last_received.store(unix_ms(), Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("client_id", &self.client_id)
            .field("delivered", &self.delivered())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// The receiving end handed to the transport layer on registration.
pub struct ClientHandle {
    /// The registered client id.
    pub client_id: String,
    /// The owning session id.
    pub session_id: String,
    /// Bounded message stream for this client.
    pub receiver: mpsc::Receiver<StreamMessage>,
    /// Fires when the manager closes this client.
    pub closed: CancellationToken,
}

/// One user-and-model conversation's client set.
pub struct StreamSession {
    /// Session identifier.
    pub session_id: String,
    clients: RwLock<HashMap<String, Arc<StreamClient>>>,
    last_activity: AtomicU64,
}

impl StreamSession {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            clients: RwLock::new(HashMap::new()),
            last_activity: AtomicU64::new(unix_ms()),
        }
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Unix-ms timestamp of the last broadcast or registration.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity.store(unix_ms(), Ordering::Relaxed);
    }

    /// Deliver `message` to every client without blocking. Returns the
    /// delivered count and the ids of clients whose buffer was full.
    pub fn broadcast(&self, message: &StreamMessage) -> (usize, Vec<String>) {
        self.touch();
        let clients: Vec<Arc<StreamClient>> = self.clients.read().values().cloned().collect();

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for client in clients {
            if client.deliver(message.clone()) {
                delivered += 1;
            } else {
                dropped.push(client.client_id.clone());
            }
        }
        (delivered, dropped)
    }

    /// Deliver `message` to one client.
    pub fn send_to_client(&self, client_id: &str, message: StreamMessage) -> Result<()> {
        self.touch();
        let client = self
            .clients
            .read()
            .get(client_id)
            .cloned()
            .ok_or_else(|| RelayError::cache(format!("client {} not found", client_id)))?;

        if client.deliver(message) {
            Ok(())
        } else {
            Err(RelayError::Other(format!(
                "client {} buffer full",
                client_id
            )))
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("session_id", &self.session_id)
            .field("clients", &self.client_count())
            .finish()
    }
}

/// Fan-out counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamManagerStats {
    /// Live sessions.
    pub sessions: usize,
    /// Live clients across all sessions.
    pub clients: usize,
    /// Broadcast deliveries dropped on full buffers.
    pub delivery_errors: u64,
}

/// Owner of all stream sessions plus the idle sweeper.
pub struct StreamManager {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    config: StreamConfig,
    delivery_errors: AtomicU64,
    events: Option<Arc<dyn EventHandler>>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

impl StreamManager {
    /// An empty manager with the given settings.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            delivery_errors: AtomicU64::new(0),
            events: None,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Attach an event handler for drop reporting.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// The session for `session_id`, creating it on first use.
    pub fn session(&self, session_id: &str) -> Arc<StreamSession> {
        if let Some(session) = self.sessions.read().get(session_id) {
            return session.clone();
        }
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(StreamSession::new(session_id.to_string())))
            .clone()
    }

    /// Attach a client to `session_id`. A fresh client id is generated
    /// when `client_id` is `None`. Fails when the session is full.
    pub fn register_client(
        &self,
        session_id: &str,
        client_id: Option<String>,
    ) -> Result<ClientHandle> {
        let session = self.session(session_id);
        let client_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut clients = session.clients.write();
        if clients.len() >= self.config.max_clients {
            return Err(RelayError::Other(format!(
                "session {} is at its client limit",
                session_id
            )));
        }

        let (sender, receiver) = mpsc::channel(self.config.buffer_size);
        let close = CancellationToken::new();
        let client = Arc::new(StreamClient {
            client_id: client_id.clone(),
            sender,
            close: close.clone(),
            last_received: AtomicU64::new(unix_ms()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        clients.insert(client_id.clone(), client);
        drop(clients);
        session.touch();

        Ok(ClientHandle {
            client_id,
            session_id: session_id.to_string(),
            receiver,
            closed: close,
        })
    }

    /// Detach a client. The session is removed once its last client
    /// leaves.
    pub fn unregister_client(&self, session_id: &str, client_id: &str) {
        let session = match self.sessions.read().get(session_id) {
            Some(session) => session.clone(),
            None => return,
        };

        let emptied = {
            let mut clients = session.clients.write();
            if let Some(client) = clients.remove(client_id) {
                client.close.cancel();
            }
            clients.is_empty()
        };
        if emptied {
            self.sessions.write().remove(session_id);
        }
    }

    /// Broadcast to every client of `session_id`, counting full-buffer
    /// drops without blocking.
    pub fn broadcast(&self, session_id: &str, message: StreamMessage) -> Result<usize> {
        let session = self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::cache(format!("session {} not found", session_id)))?;

        let (delivered, dropped) = session.broadcast(&message);
        for client_id in dropped {
            self.delivery_errors.fetch_add(1, Ordering::Relaxed);
            emit(
                &self.events,
                Event::MessageDropped {
                    session_id: session_id.to_string(),
                    client_id,
                },
            );
        }
        Ok(delivered)
    }

    /// Deliver to one client of `session_id`.
    pub fn send_to_client(
        &self,
        session_id: &str,
        client_id: &str,
        message: StreamMessage,
    ) -> Result<()> {
        let session = self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::cache(format!("session {} not found", session_id)))?;
        session.send_to_client(client_id, message)
    }

    /// One sweeper pass: close clients idle past the client timeout and
    /// sessions idle past the session timeout.
    pub fn sweep_once(&self) {
        let now = unix_ms();
        let client_timeout_ms = self.config.client_timeout.as_millis() as u64;
        let session_timeout_ms = self.config.session_timeout.as_millis() as u64;

        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.read().values().cloned().collect();

        let mut dead_sessions = Vec::new();
        for session in sessions {
            let session_idle = now.saturating_sub(session.last_activity_ms());
            if session_idle > session_timeout_ms {
                let clients = session.clients.write();
                for client in clients.values() {
                    client.close.cancel();
                }
                drop(clients);
                dead_sessions.push(session.session_id.clone());
                continue;
            }

            let mut clients = session.clients.write();
            let stale: Vec<String> = clients
                .iter()
                .filter(|(_, c)| now.saturating_sub(c.last_received_ms()) > client_timeout_ms)
                .map(|(id, _)| id.clone())
                .collect();
            for client_id in stale {
                if let Some(client) = clients.remove(&client_id) {
                    client.close.cancel();
                }
            }
            if clients.is_empty() {
                dead_sessions.push(session.session_id.clone());
            }
        }

        if !dead_sessions.is_empty() {
            let mut sessions = self.sessions.write();
            for session_id in dead_sessions {
                sessions.remove(&session_id);
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> StreamManagerStats {
        let sessions = self.sessions.read();
        StreamManagerStats {
            sessions: sessions.len(),
            clients: sessions.values().map(|s| s.client_count()).sum(),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
        }
    }

    /// Launch the background sweeper. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let manager = self.clone();
        let interval = self.config.sweep_interval;
        *self.task.lock() = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::debug!("stream sweep pass");
                        manager.sweep_once();
                    }
                }
            }
        }));
    }

    /// Close every client, remove every session, and wait for the
    /// sweeper to exit. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        {
            let mut sessions = self.sessions.write();
            for session in sessions.values() {
                let clients = session.clients.write();
                for client in clients.values() {
                    client.close.cancel();
                }
            }
            sessions.clear();
        }

        self.shutdown.lock().cancel();
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }

    /// Serve one registered client over an SSE sink.
    ///
    /// Implements the wire protocol: the `connected` event first, then a
    /// data frame per message (error messages become `error` events),
    /// heartbeat comments on the configured interval, and `[DONE]` after
    /// the final message or on close.
    pub async fn pump_client(&self, mut handle: ClientHandle, sink: &dyn SseSink) -> Result<()> {
        sink.send(SseFrame::connected(&handle.client_id, unix_ms()))
            .await?;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = handle.closed.cancelled() => break,
                _ = heartbeat.tick() => {
                    sink.send(SseFrame::heartbeat()).await?;
                }
                message = handle.receiver.recv() => {
                    let Some(message) = message else { break };
                    let done = message.done;
                    let frame = match message.error {
                        Some(ref error) => SseFrame::error(error).with_id(message.message_id.clone()),
                        None => {
                            let payload = serde_json::to_string(&message)?;
                            SseFrame::data(payload).with_id(message.message_id.clone())
                        }
                    };
                    sink.send(frame).await?;
                    if done {
                        break;
                    }
                }
            }
        }

        sink.send(SseFrame::done()).await?;
        self.unregister_client(&handle.session_id, &handle.client_id);
        Ok(())
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("StreamManager")
            .field("sessions", &stats.sessions)
            .field("clients", &stats.clients)
            .field("delivery_errors", &stats.delivery_errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> StreamManager {
        StreamManager::new(StreamConfig::default())
    }

    #[tokio::test]
    async fn test_register_creates_session() {
        let manager = manager();
        let handle = manager.register_client("s1", None).expect("register");
        assert!(!handle.client_id.is_empty());
        assert_eq!(manager.stats().sessions, 1);
        assert_eq!(manager.stats().clients, 1);
    }

    #[tokio::test]
    async fn test_explicit_client_id_respected() {
        let manager = manager();
        let handle = manager
            .register_client("s1", Some("client-a".into()))
            .expect("register");
        assert_eq!(handle.client_id, "client-a");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_three_clients() {
        let manager = manager();
        let mut handles = Vec::new();
        for i in 0..3 {
            handles.push(
                manager
                    .register_client("s1", Some(format!("c{}", i)))
                    .expect("register"),
            );
        }

        let message = StreamMessage::new("s1", "hello");
        let delivered = manager.broadcast("s1", message.clone()).expect("session");
        assert_eq!(delivered, 3);

        for handle in &mut handles {
            let received = handle.receiver.recv().await.expect("one message");
            assert_eq!(received.message_id, message.message_id);
            assert_eq!(received.content, "hello");
        }
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_blocking() {
        let manager = StreamManager::new(StreamConfig::default().with_buffer_size(1));
        let _stuck = manager
            .register_client("s1", Some("stuck".into()))
            .expect("register");
        let mut healthy = manager
            .register_client("s1", Some("healthy".into()))
            .expect("register");

        // First broadcast fills the stuck client's buffer of 1.
        manager
            .broadcast("s1", StreamMessage::new("s1", "m1"))
            .expect("session");
        // Second broadcast drops for the stuck client, delivers to the
        // healthy one.
        let delivered = manager
            .broadcast("s1", StreamMessage::new("s1", "m2"))
            .expect("session");

        assert_eq!(delivered, 1);
        assert_eq!(manager.stats().delivery_errors, 1);
        assert_eq!(healthy.receiver.recv().await.expect("m1").content, "m1");
        assert_eq!(healthy.receiver.recv().await.expect("m2").content, "m2");
    }

    #[tokio::test]
    async fn test_send_to_single_client() {
        let manager = manager();
        let mut target = manager
            .register_client("s1", Some("target".into()))
            .expect("register");
        let mut other = manager
            .register_client("s1", Some("other".into()))
            .expect("register");

        manager
            .send_to_client("s1", "target", StreamMessage::new("s1", "direct"))
            .expect("deliver");

        assert_eq!(target.receiver.recv().await.expect("direct").content, "direct");
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_last_client_removes_session() {
        let manager = manager();
        manager
            .register_client("s1", Some("only".into()))
            .expect("register");
        manager.unregister_client("s1", "only");
        assert_eq!(manager.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_client_limit_enforced() {
        let manager = StreamManager::new(StreamConfig {
            max_clients: 1,
            ..StreamConfig::default()
        });
        manager.register_client("s1", None).expect("first fits");
        assert!(manager.register_client("s1", None).is_err());
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_clients() {
        let manager = StreamManager::new(StreamConfig {
            client_timeout: Duration::from_millis(10),
            session_timeout: Duration::from_secs(3600),
            ..StreamConfig::default()
        });
        let handle = manager
            .register_client("s1", Some("idle".into()))
            .expect("register");

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Keep the session alive; only the client is idle.
        manager.session("s1").touch();
        manager.sweep_once();

        assert!(handle.closed.is_cancelled());
        assert_eq!(manager.stats().sessions, 0, "emptied session removed");
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_sessions() {
        let manager = StreamManager::new(StreamConfig {
            client_timeout: Duration::from_secs(3600),
            session_timeout: Duration::from_millis(10),
            ..StreamConfig::default()
        });
        let handle = manager
            .register_client("s1", Some("c1".into()))
            .expect("register");

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.sweep_once();

        assert!(handle.closed.is_cancelled());
        assert_eq!(manager.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_stop_closes_everything() {
        let manager = Arc::new(StreamManager::new(StreamConfig::default()));
        manager.start();
        let handle = manager
            .register_client("s1", Some("c1".into()))
            .expect("register");

        manager.stop().await;
        assert!(handle.closed.is_cancelled());
        assert_eq!(manager.stats().sessions, 0);

        // Idempotent.
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_message_order_preserved_per_client() {
        let manager = manager();
        let mut handle = manager
            .register_client("s1", Some("ordered".into()))
            .expect("register");

        for i in 0..10 {
            manager
                .broadcast("s1", StreamMessage::new("s1", format!("m{}", i)))
                .expect("session");
        }
        for i in 0..10 {
            let message = handle.receiver.recv().await.expect("in order");
            assert_eq!(message.content, format!("m{}", i));
        }
    }
}
