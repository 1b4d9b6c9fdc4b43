//! Public client surface.
//!
//! [`DeviceClient`] owns the engine. Drive it yourself with
//! [`poll`](DeviceClient::poll)/[`run`](DeviceClient::run), or call
//! [`run_async`](DeviceClient::run_async) to move the engine onto a
//! background task. [`ClientHandle`] is the cheap, cloneable,
//! thread-safe view used from anywhere else: publish, subscribe,
//! inspect state and stats.

use std::sync::Arc;
use std::time::Duration;

use gw_protocol::{validate_subject, DeviceIdentity, Envelope};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::engine::{ClientEngine, Command, ConnectionState, Shared};
use crate::error::{ErrorCode, Result, SdkError};
use crate::registry::{SubscriptionHandler, SubscriptionId, SubscriptionRegistry};
use crate::stats::{ClientStats, StatsTracker};
use crate::transport::{Transport, WsTransport};

/// Delivery class forwarded with a publish. The gateway maps it onto
/// its persistence tier; the SDK itself is fire-and-forget either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Lifecycle callbacks. All of them fire on the polling task.
#[derive(Clone, Default)]
pub struct ClientCallbacks {
    pub on_connected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_disconnected: Option<Arc<dyn Fn(ErrorCode, &str) + Send + Sync>>,
    pub on_reconnecting: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(ErrorCode, &str) + Send + Sync>>,
    pub on_state_changed: Option<Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>>,
}

/// Cloneable, thread-safe view of a client.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ClientHandle {
    // ── Introspection ────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Identity granted by the gateway; `Some` only while Connected.
    pub fn device_info(&self) -> Option<DeviceIdentity> {
        self.shared.identity_lock().clone()
    }

    /// The most recent asynchronous error, as also reported through
    /// `on_error`. Useful after a failed `connect`.
    pub fn last_error(&self) -> Option<(ErrorCode, String)> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> ClientStats {
        self.shared.stats.snapshot()
    }

    /// Active subscription patterns in creation order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.registry_lock().patterns()
    }

    /// Advisory check against the granted publish allow-list.
    pub fn can_publish(&self, subject: &str) -> bool {
        self.shared
            .identity_lock()
            .as_ref()
            .is_some_and(|id| id.allows_publish(subject))
    }

    /// Advisory check against the granted subscribe allow-list.
    pub fn can_subscribe(&self, subject: &str) -> bool {
        self.shared
            .identity_lock()
            .as_ref()
            .is_some_and(|id| id.allows_subscribe(subject))
    }

    // ── Publishing ───────────────────────────────────────────────────

    /// Queue a publish. Fire-and-forget past this point: frames wait in
    /// the bounded outbound queue until the engine hands them to the
    /// carrier, in call order per caller.
    pub fn publish(&self, subject: &str, payload: serde_json::Value) -> Result<()> {
        validate_subject(subject)?;

        let size = serde_json::to_vec(&payload)
            .map_err(|e| SdkError::Internal(e.to_string()))?
            .len();
        let limit = self.shared.config.buffers.max_payload_size;
        if size > limit {
            return Err(SdkError::PayloadTooLarge { size, limit });
        }

        if self.state() != ConnectionState::Connected {
            return Err(SdkError::NotConnected);
        }

        if !self.can_publish(subject) {
            if self.shared.config.enforce_permissions {
                return Err(SdkError::PublishNotAllowed(subject.to_string()));
            }
            // The gateway is authoritative; this is advance warning only.
            tracing::warn!(subject, "publish outside granted allow-list");
        }

        self.enqueue(Command::Publish {
            frame: Envelope::publish(subject, payload),
        })
    }

    /// Publish a plain string payload (wrapped as a JSON string).
    pub fn publish_text(&self, subject: &str, payload: &str) -> Result<()> {
        self.publish(subject, serde_json::Value::String(payload.to_string()))
    }

    /// Publish with an explicit delivery class. The class is the
    /// gateway's concern; the frame itself is identical.
    pub fn publish_with_qos(
        &self,
        subject: &str,
        payload: serde_json::Value,
        _qos: QoS,
    ) -> Result<()> {
        self.publish(subject, payload)
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Register a handler for every inbound Message matching `pattern`.
    ///
    /// The subscription survives reconnects until unsubscribed. If the
    /// client is not connected yet, the Subscribe frame is deferred and
    /// sent when a session is established.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&str, &serde_json::Value, &Envelope) + Send + Sync + 'static,
    {
        self.subscribe_handler(pattern, Arc::new(handler))
    }

    /// Like [`subscribe`](Self::subscribe) but the handler receives the
    /// whole envelope only.
    pub fn subscribe_envelope<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_handler(pattern, Arc::new(move |_, _, envelope| handler(envelope)))
    }

    fn subscribe_handler(
        &self,
        pattern: &str,
        handler: SubscriptionHandler,
    ) -> Result<SubscriptionId> {
        validate_subject(pattern)?;

        let connected = self.state() == ConnectionState::Connected;
        if connected && !self.can_subscribe(pattern) {
            if self.shared.config.enforce_permissions {
                return Err(SdkError::SubscribeNotAllowed(pattern.to_string()));
            }
            tracing::warn!(pattern, "subscribe outside granted allow-list");
        }

        let id = self.shared.registry_lock().add(pattern, handler)?;

        if connected {
            if let Err(e) = self.enqueue(Command::SendSubscribe {
                pattern: pattern.to_string(),
            }) {
                self.shared.registry_lock().remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Remove a subscription by id. While not connected the entry is
    /// dropped immediately and will not be re-established.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let pattern = self
            .shared
            .registry_lock()
            .remove(id)
            .ok_or_else(|| SdkError::NotSubscribed(format!("id {id}")))?;
        self.send_unsubscribe_if_connected(pattern);
        Ok(())
    }

    /// Remove the first subscription with the given pattern.
    pub fn unsubscribe_pattern(&self, pattern: &str) -> Result<()> {
        self.shared
            .registry_lock()
            .remove_by_pattern(pattern)
            .ok_or_else(|| SdkError::NotSubscribed(pattern.to_string()))?;
        self.send_unsubscribe_if_connected(pattern.to_string());
        Ok(())
    }

    fn send_unsubscribe_if_connected(&self, pattern: String) {
        if self.state() == ConnectionState::Connected {
            // Best effort; the entry is gone locally either way.
            let _ = self.enqueue(Command::SendUnsubscribe { pattern });
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Gracefully close the connection. Requires the engine to be
    /// running (see [`DeviceClient::run_async`]); from a self-driven
    /// client use [`DeviceClient::disconnect`].
    pub async fn disconnect(&self) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { reply: tx })
            .await
            .map_err(|_| SdkError::EngineStopped)?;
        rx.await.map_err(|_| SdkError::EngineStopped)
    }

    // ── Callbacks ────────────────────────────────────────────────────

    pub fn set_callbacks(&self, callbacks: ClientCallbacks) {
        *self.shared.callbacks_lock() = callbacks;
    }

    pub fn on_connected<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.shared.callbacks_lock().on_connected = Some(Arc::new(callback));
    }

    pub fn on_disconnected<F: Fn(ErrorCode, &str) + Send + Sync + 'static>(&self, callback: F) {
        self.shared.callbacks_lock().on_disconnected = Some(Arc::new(callback));
    }

    pub fn on_reconnecting<F: Fn(u32) + Send + Sync + 'static>(&self, callback: F) {
        self.shared.callbacks_lock().on_reconnecting = Some(Arc::new(callback));
    }

    pub fn on_error<F: Fn(ErrorCode, &str) + Send + Sync + 'static>(&self, callback: F) {
        self.shared.callbacks_lock().on_error = Some(Arc::new(callback));
    }

    pub fn on_state_changed<F>(&self, callback: F)
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.shared.callbacks_lock().on_state_changed = Some(Arc::new(callback));
    }

    // ── Internals ────────────────────────────────────────────────────

    fn enqueue(&self, command: Command) -> Result<()> {
        use mpsc::error::TrySendError;
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                // Newest frame is the one dropped.
                self.shared.stats.record_overflow();
                Err(SdkError::BufferFull)
            }
            Err(TrySendError::Closed(_)) => Err(SdkError::EngineStopped),
        }
    }
}

/// A device client for the message-bus gateway.
///
/// ```text
/// ┌────────────────────────────────────────────────────────────┐
/// │  Your device                                               │
/// │                                                            │
/// │  let config = DeviceConfig::builder()                      │
/// │      .gateway_url("wss://gw.example.com/ws")               │
/// │      .device_id("sensor-001")                              │
/// │      .auth_token(token)                                    │
/// │      .build()?;                                            │
/// │                                                            │
/// │  let mut client = DeviceClient::new(config)?;              │
/// │  client.run_async();                                       │
/// │  client.connect().await;                                   │
/// │  client.subscribe("cmd.sensor-001.>", |s, p, _| { .. })?;  │
/// │  client.publish("telemetry.temperature", json!(25.5))?;    │
/// └────────────────────────────────────────────────────────────┘
/// ```
///
/// Connection flow (driven by the engine):
///
/// 1. Open the WebSocket (bounded by `connect_timeout`)
/// 2. Send `Auth { deviceId, token, deviceType }`, await the reply
///    (bounded by `auth_timeout`)
/// 3. On success: re-send Subscribe frames, then fire `on_connected`
/// 4. On transport loss: reconnect with capped jittered backoff
/// 5. Heartbeat pings keep the session alive; missed pongs close it
pub struct DeviceClient {
    handle: ClientHandle,
    engine: Option<ClientEngine>,
    worker: Option<JoinHandle<ClientEngine>>,
    cancel: CancellationToken,
}

impl DeviceClient {
    /// Create a client over the WebSocket carrier.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let transport = WsTransport::new(config.tls.clone());
        Self::with_transport(config, Box::new(transport))
    }

    /// Create a client over a custom carrier.
    pub fn with_transport(config: DeviceConfig, transport: Box<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let (command_tx, command_rx) =
            mpsc::channel(config.buffers.max_outgoing_messages.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            config,
            registry: std::sync::Mutex::new(SubscriptionRegistry::new()),
            stats: StatsTracker::new(),
            identity: std::sync::Mutex::new(None),
            callbacks: std::sync::Mutex::new(ClientCallbacks::default()),
            last_error: std::sync::Mutex::new(None),
            state_tx,
        });

        let engine = ClientEngine::new(Arc::clone(&shared), command_rx, transport);

        Ok(Self {
            handle: ClientHandle {
                shared,
                commands: command_tx,
                state_rx,
            },
            engine: Some(engine),
            worker: None,
            cancel: CancellationToken::new(),
        })
    }

    /// A cloneable, thread-safe handle to this client.
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    // ── Connection management ────────────────────────────────────────

    /// Connect and authenticate, blocking until Connected or until the
    /// connect + auth budget elapses. Returns `true` once Connected.
    ///
    /// Drives the engine inline when it has not been moved to a
    /// background task; otherwise waits on state changes signaled by
    /// the polling task.
    pub async fn connect(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }

        let budget = self.handle.shared.config.connect_timeout
            + self.handle.shared.config.auth_timeout
            + Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + budget;

        let (tx, mut reply_rx) = oneshot::channel();
        if self
            .handle
            .commands
            .try_send(Command::Connect { reply: tx })
            .is_err()
        {
            return false;
        }

        let mut accepted = false;
        let mut seen_progress = false;
        loop {
            self.drive_one_slice().await;

            if !accepted {
                match reply_rx.try_recv() {
                    Ok(Ok(())) => accepted = true,
                    Ok(Err(SdkError::AlreadyConnected)) => return self.is_connected(),
                    Ok(Err(_)) => return false,
                    Err(_) => {}
                }
            }

            match self.state() {
                ConnectionState::Connected => return true,
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    // Back where we started after making progress: the
                    // attempt failed (the engine surfaced the error).
                    if seen_progress {
                        return false;
                    }
                }
                _ => seen_progress = true,
            }

            if tokio::time::Instant::now() >= deadline {
                // Budget blown: tear the attempt down like the engine
                // would on its own timeouts.
                let _ = self.disconnect().await;
                return false;
            }
        }
    }

    /// Start connecting in the background. Track progress through
    /// callbacks or [`state`](Self::state).
    pub fn connect_async(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Closed => {}
            _ => return Err(SdkError::AlreadyConnected),
        }
        let (tx, _rx) = oneshot::channel();
        self.handle.enqueue(Command::Connect { reply: tx })
    }

    /// Gracefully close the connection and disable reconnection.
    /// Idempotent; returns once the Closing → Closed transition is done.
    pub async fn disconnect(&mut self) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            return Ok(());
        }

        if self.engine.is_none() {
            return self.handle.disconnect().await;
        }

        let (tx, mut rx) = oneshot::channel();
        self.handle.enqueue(Command::Disconnect { reply: tx })?;

        let deadline = tokio::time::Instant::now()
            + self.handle.shared.config.operation_timeout
            + Duration::from_secs(1);
        loop {
            self.drive_one_slice().await;
            if rx.try_recv().is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SdkError::OperationTimeout);
            }
        }
    }

    // ── Event loop ───────────────────────────────────────────────────

    /// Do one bounded slice of engine work: drain transport events,
    /// advance timers, send queued frames.
    pub async fn poll(&mut self, timeout: Duration) -> Result<()> {
        match self.engine.as_mut() {
            Some(engine) => {
                engine.poll(timeout).await;
                Ok(())
            }
            None => Err(SdkError::Internal(
                "engine is running in background; stop() it to poll manually".into(),
            )),
        }
    }

    /// Drive the engine until [`disconnect`](Self::disconnect) closes
    /// it or the connection is lost without a successful reconnection.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.poll(Duration::from_millis(100)).await?;
            if self.engine.as_ref().map_or(true, ClientEngine::finished) {
                return Ok(());
            }
        }
    }

    /// Move the engine onto a background task that polls until
    /// [`stop`](Self::stop). Returns `false` if it is already running.
    pub fn run_async(&mut self) -> bool {
        let Some(mut engine) = self.engine.take() else {
            return false;
        };
        let cancel = self.cancel.clone();
        self.worker = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = engine.poll(Duration::from_millis(100)) => {
                        if engine.finished() {
                            break;
                        }
                    }
                }
            }
            engine
        }));
        true
    }

    /// Stop the background task started by [`run_async`](Self::run_async)
    /// and reclaim the engine for manual polling.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Ok(engine) = worker.await {
                self.engine = Some(engine);
            }
        }
        self.cancel = CancellationToken::new();
    }

    async fn drive_one_slice(&mut self) {
        match self.engine.as_mut() {
            Some(engine) => engine.poll(Duration::from_millis(20)).await,
            None => {
                // Background task is polling; just wait for movement.
                let mut state_rx = self.handle.state_rx.clone();
                let _ = tokio::time::timeout(Duration::from_millis(20), state_rx.changed()).await;
            }
        }
    }

    // ── Delegated surface ────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn device_info(&self) -> Option<DeviceIdentity> {
        self.handle.device_info()
    }

    pub fn last_error(&self) -> Option<(ErrorCode, String)> {
        self.handle.last_error()
    }

    pub fn stats(&self) -> ClientStats {
        self.handle.stats()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.handle.subscriptions()
    }

    pub fn publish(&self, subject: &str, payload: serde_json::Value) -> Result<()> {
        self.handle.publish(subject, payload)
    }

    pub fn publish_text(&self, subject: &str, payload: &str) -> Result<()> {
        self.handle.publish_text(subject, payload)
    }

    pub fn publish_with_qos(
        &self,
        subject: &str,
        payload: serde_json::Value,
        qos: QoS,
    ) -> Result<()> {
        self.handle.publish_with_qos(subject, payload, qos)
    }

    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&str, &serde_json::Value, &Envelope) + Send + Sync + 'static,
    {
        self.handle.subscribe(pattern, handler)
    }

    pub fn subscribe_envelope<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.handle.subscribe_envelope(pattern, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.handle.unsubscribe(id)
    }

    pub fn unsubscribe_pattern(&self, pattern: &str) -> Result<()> {
        self.handle.unsubscribe_pattern(pattern)
    }

    pub fn set_callbacks(&self, callbacks: ClientCallbacks) {
        self.handle.set_callbacks(callbacks)
    }

    pub fn on_connected<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.handle.on_connected(callback)
    }

    pub fn on_disconnected<F: Fn(ErrorCode, &str) + Send + Sync + 'static>(&self, callback: F) {
        self.handle.on_disconnected(callback)
    }

    pub fn on_reconnecting<F: Fn(u32) + Send + Sync + 'static>(&self, callback: F) {
        self.handle.on_reconnecting(callback)
    }

    pub fn on_error<F: Fn(ErrorCode, &str) + Send + Sync + 'static>(&self, callback: F) {
        self.handle.on_error(callback)
    }

    pub fn on_state_changed<F>(&self, callback: F)
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.handle.on_state_changed(callback)
    }

    // ── Versions ─────────────────────────────────────────────────────

    /// SDK semver string.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Wire protocol version string.
    pub fn protocol_version() -> &'static str {
        gw_protocol::PROTOCOL_VERSION
    }
}
