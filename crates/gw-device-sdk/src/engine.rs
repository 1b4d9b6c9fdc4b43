//! The client engine: a single task owning the transport, the
//! handshake, the reconnect and heartbeat policies, and inbound
//! dispatch.
//!
//! Public handles never touch connection state directly — they share
//! the registry/stats/identity blocks and push [`Command`]s over a
//! bounded queue that doubles as the outbound buffer. The engine drains
//! commands, transport events and timers from one `select!` loop, so
//! every callback fires on the polling task and no lock is ever held
//! across user code.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gw_protocol::{DeviceIdentity, Envelope, MessageType};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::auth::AuthManager;
use crate::client::ClientCallbacks;
use crate::config::DeviceConfig;
use crate::error::{ErrorCode, Result, SdkError};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use crate::reconnect::ReconnectPolicy;
use crate::registry::SubscriptionRegistry;
use crate::stats::StatsTracker;
use crate::transport::{Transport, TransportEvent};

/// Connection lifecycle. Exactly one state holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Authenticating => "Authenticating",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        })
    }
}

/// Requests from client handles to the engine. `Publish` entries are
/// the outbound frame queue; the channel bound is
/// `buffers.max_outgoing_messages`.
pub(crate) enum Command {
    Connect { reply: oneshot::Sender<Result<()>> },
    Disconnect { reply: oneshot::Sender<()> },
    Publish { frame: Envelope },
    SendSubscribe { pattern: String },
    SendUnsubscribe { pattern: String },
}

/// State shared between the engine task and all client handles.
pub(crate) struct Shared {
    pub config: DeviceConfig,
    pub registry: Mutex<SubscriptionRegistry>,
    pub stats: StatsTracker,
    pub identity: Mutex<Option<DeviceIdentity>>,
    pub callbacks: Mutex<ClientCallbacks>,
    pub last_error: Mutex<Option<(ErrorCode, String)>>,
    pub state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    pub fn registry_lock(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity_lock(&self) -> MutexGuard<'_, Option<DeviceIdentity>> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn callbacks_lock(&self) -> MutexGuard<'_, ClientCallbacks> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

enum Waited {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Timer,
}

pub(crate) struct ClientEngine {
    shared: Arc<Shared>,
    commands: mpsc::Receiver<Command>,
    transport: Box<dyn Transport>,
    auth: AuthManager,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatMonitor,
    state: ConnectionState,
    auth_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    /// Between a transport loss and the next authenticated session.
    in_reconnect_burst: bool,
    /// Landed in Disconnected with nothing pending.
    terminal: bool,
    stopped: bool,
}

impl ClientEngine {
    pub fn new(
        shared: Arc<Shared>,
        commands: mpsc::Receiver<Command>,
        transport: Box<dyn Transport>,
    ) -> Self {
        let policy = ReconnectPolicy::new(shared.config.reconnect.clone());
        let heartbeat = HeartbeatMonitor::new(shared.config.heartbeat.clone());
        Self {
            shared,
            commands,
            transport,
            auth: AuthManager::new(),
            policy,
            heartbeat,
            state: ConnectionState::Disconnected,
            auth_deadline: None,
            reconnect_at: None,
            in_reconnect_burst: false,
            terminal: false,
            stopped: false,
        }
    }

    /// Nothing left to drive: stopped, explicitly closed, or landed in
    /// a terminal Disconnected.
    pub fn finished(&self) -> bool {
        self.stopped || self.state == ConnectionState::Closed || self.terminal
    }

    /// One bounded slice of work: drain commands, transport events and
    /// timers until `timeout` elapses.
    pub async fn poll(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        while !self.stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wake_at = match self.next_timer() {
                Some(at) => at.min(deadline),
                None => deadline,
            };
            let transport_active = self.transport.is_open();

            let waited = tokio::select! {
                biased;
                cmd = self.commands.recv() => Waited::Command(cmd),
                event = self.transport.next_event(), if transport_active => {
                    Waited::Transport(event)
                }
                _ = tokio::time::sleep_until(wake_at) => Waited::Timer,
            };

            match waited {
                Waited::Command(Some(cmd)) => self.handle_command(cmd).await,
                Waited::Command(None) => self.stopped = true,
                Waited::Transport(Some(event)) => self.handle_transport_event(event).await,
                Waited::Transport(None) => {
                    // Event stream dried up without a close frame.
                    self.on_transport_closed(1006, "carrier event stream ended")
                        .await;
                }
                Waited::Timer => {
                    self.handle_timers().await;
                    if wake_at >= deadline {
                        break;
                    }
                }
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                let decision = match self.state {
                    ConnectionState::Disconnected | ConnectionState::Closed => Ok(()),
                    _ => Err(SdkError::AlreadyConnected),
                };
                let accepted = decision.is_ok();
                let _ = reply.send(decision);
                if accepted {
                    self.begin_session().await;
                }
            }
            Command::Disconnect { reply } => {
                self.do_disconnect().await;
                let _ = reply.send(());
            }
            Command::Publish { frame } => self.do_publish(frame).await,
            Command::SendSubscribe { pattern } => {
                if self.state == ConnectionState::Connected {
                    if let Err(e) = self.send_frame(&Envelope::subscribe(&pattern)).await {
                        tracing::warn!(%pattern, error = %e, "subscribe send failed");
                        self.shared.stats.record_error();
                    } else {
                        tracing::info!(%pattern, "subscribed");
                    }
                }
            }
            Command::SendUnsubscribe { pattern } => {
                if self.state == ConnectionState::Connected {
                    if let Err(e) = self.send_frame(&Envelope::unsubscribe(&pattern)).await {
                        tracing::warn!(%pattern, error = %e, "unsubscribe send failed");
                    } else {
                        tracing::info!(%pattern, "unsubscribed");
                    }
                }
            }
        }
    }

    async fn begin_session(&mut self) {
        self.terminal = false;
        self.in_reconnect_burst = false;
        self.policy = ReconnectPolicy::new(self.shared.config.reconnect.clone());
        self.attempt_open().await;
    }

    async fn attempt_open(&mut self) {
        self.set_state(ConnectionState::Connecting);

        let url = self.shared.config.gateway_url.clone();
        let timeout = self.shared.config.connect_timeout;
        tracing::info!(%url, device_id = %self.shared.config.device_id, "connecting to gateway");

        match self.transport.open(&url, timeout).await {
            Ok(()) => self.on_transport_opened().await,
            Err(e) => {
                tracing::warn!(error = %e, "transport open failed");
                self.shared.stats.record_error();
                self.fire_error(e.code(), &e.to_string());
                self.after_connection_failure("transport open failed").await;
            }
        }
    }

    async fn on_transport_opened(&mut self) {
        self.set_state(ConnectionState::Authenticating);
        self.auth.begin();

        let request = AuthManager::create_request(&self.shared.config);
        match self.send_frame(&request).await {
            Ok(()) => {
                self.auth_deadline = Some(Instant::now() + self.shared.config.auth_timeout);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to send auth request");
                self.shared.stats.record_error();
                self.fire_error(e.code(), &e.to_string());
                self.transport.close(1000, "auth send failed").await;
                self.after_connection_failure("auth send failed").await;
            }
        }
    }

    /// A connect attempt died before authenticating: keep the burst
    /// going if one is active, otherwise land terminally.
    async fn after_connection_failure(&mut self, reason: &str) {
        self.auth_deadline = None;
        if self.in_reconnect_burst {
            self.schedule_reconnect(reason);
        } else {
            self.terminal = true;
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn do_disconnect(&mut self) {
        // An explicit disconnect always wins over an in-flight reconnect.
        self.policy.set_enabled(false);
        self.reconnect_at = None;
        self.auth_deadline = None;

        match self.state {
            ConnectionState::Disconnected | ConnectionState::Closed => {}
            ConnectionState::Reconnecting => {
                self.set_state(ConnectionState::Closed);
            }
            _ => {
                self.set_state(ConnectionState::Closing);
                self.transport.close(1000, "Client disconnect").await;
                self.drop_session_state();
                self.set_state(ConnectionState::Closed);
            }
        }
    }

    async fn do_publish(&mut self, frame: Envelope) {
        if self.state != ConnectionState::Connected {
            tracing::warn!(
                subject = frame.subject.as_deref().unwrap_or(""),
                "dropping publish while not connected"
            );
            self.shared.stats.record_error();
            return;
        }
        if let Err(e) = self.send_frame(&frame).await {
            tracing::warn!(error = %e, "publish send failed");
            self.shared.stats.record_error();
            self.fire_error(e.code(), &e.to_string());
        }
    }

    // ── Transport events ─────────────────────────────────────────────

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state == ConnectionState::Connecting {
                    self.on_transport_opened().await;
                }
            }
            TransportEvent::Message(text) => self.on_inbound_frame(&text).await,
            TransportEvent::Closed { code, reason } => {
                self.on_transport_closed(code, &reason).await;
            }
            TransportEvent::Error { code, message } => {
                self.shared.stats.record_error();
                tracing::warn!(code = %code, %message, "transport error");
                self.fire_error(code, &message);
            }
        }
    }

    async fn on_transport_closed(&mut self, code: u16, reason: &str) {
        tracing::info!(code = %code, reason, state = %self.state, "transport closed");
        self.drop_session_state();
        self.auth_deadline = None;

        match self.state {
            ConnectionState::Closing => self.set_state(ConnectionState::Closed),
            ConnectionState::Connected => {
                if self.policy.should_reconnect() {
                    self.schedule_reconnect(reason);
                } else {
                    self.terminal = true;
                    self.set_state(ConnectionState::Disconnected);
                    self.fire_disconnected(close_code_to_error(code), reason);
                }
            }
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                self.shared.stats.record_error();
                self.fire_error(close_code_to_error(code), reason);
                self.after_connection_failure(reason).await;
            }
            _ => {}
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    async fn on_inbound_frame(&mut self, text: &str) {
        let envelope = match gw_protocol::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.shared.stats.record_error();
                let err = SdkError::from(e);
                tracing::warn!(error = %err, "dropping undecodable frame");
                self.fire_error(err.code(), &err.to_string());
                return;
            }
        };

        self.shared.stats.record_received(text.len());

        match envelope.msg_type {
            MessageType::Auth => match self.auth.handle_message(&envelope) {
                Some(outcome) if outcome.success => self.on_auth_success(outcome).await,
                Some(outcome) => self.on_auth_failure(outcome).await,
                None => tracing::debug!("ignoring auth frame outside handshake"),
            },
            MessageType::Message => self.dispatch_message(&envelope),
            MessageType::Ack => {
                tracing::debug!(subject = envelope.subject.as_deref().unwrap_or(""), "ack");
            }
            MessageType::Error => {
                let message = envelope
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown gateway error")
                    .to_string();
                self.shared.stats.record_error();
                tracing::error!(%message, "gateway error");
                self.fire_error(ErrorCode::InternalError, &message);
            }
            MessageType::Pong => self.heartbeat.record_pong(Instant::now()),
            MessageType::Ping => {
                if self.shared.config.heartbeat.answer_pings {
                    if let Err(e) = self.send_frame(&Envelope::pong()).await {
                        tracing::debug!(error = %e, "pong send failed");
                    }
                }
            }
            other => {
                // Publish/Subscribe/Unsubscribe/Request/Reply are not
                // expected on the device side of the wire.
                tracing::debug!(msg_type = %other, "ignoring unexpected frame type");
            }
        }
    }

    fn dispatch_message(&mut self, envelope: &Envelope) {
        let Some(subject) = envelope.subject.as_deref() else {
            tracing::debug!("message frame without subject");
            return;
        };
        let payload = envelope
            .payload
            .clone()
            .unwrap_or(serde_json::Value::Null);

        // Handlers are cloned out so no lock is held while user code runs.
        let handlers = self.shared.registry_lock().matching_handlers(subject);
        for (id, handler) in handlers {
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(subject, &payload, envelope)
            }));
            if caught.is_err() {
                self.shared.stats.record_error();
                tracing::error!(subscription = id, subject, "subscription handler panicked");
            }
        }
    }

    // ── Handshake outcomes ───────────────────────────────────────────

    async fn on_auth_success(&mut self, outcome: crate::auth::AuthOutcome) {
        self.auth_deadline = None;
        let was_reconnect = self.in_reconnect_burst;
        self.in_reconnect_burst = false;
        self.policy.reset();

        *self.shared.identity_lock() = outcome.identity;
        self.shared.stats.mark_connected();
        self.heartbeat.on_connected(Instant::now());

        // Re-establish subscriptions before user code hears "connected".
        if !was_reconnect || self.policy.should_resubscribe() {
            let patterns = self.shared.registry_lock().patterns();
            for pattern in patterns {
                if let Err(e) = self.send_frame(&Envelope::subscribe(&pattern)).await {
                    tracing::warn!(%pattern, error = %e, "resubscribe send failed");
                    self.shared.stats.record_error();
                } else {
                    tracing::info!(%pattern, "resubscribed");
                }
            }
        }

        self.set_state(ConnectionState::Connected);
        tracing::info!(device_id = %self.shared.config.device_id, "authenticated");
        self.fire_connected();
    }

    async fn on_auth_failure(&mut self, outcome: crate::auth::AuthOutcome) {
        self.auth_deadline = None;
        self.in_reconnect_burst = false;
        self.shared.stats.record_error();

        let message = if outcome.message.is_empty() {
            "authentication failed".to_string()
        } else {
            outcome.message
        };
        tracing::error!(%message, "authentication failed");
        self.fire_error(ErrorCode::AuthenticationFailed, &message);

        // Auth failure is terminal for the attempt: never retried.
        self.terminal = true;
        self.transport.close(1000, "Authentication failed").await;
        self.drop_session_state();
        self.set_state(ConnectionState::Disconnected);
    }

    // ── Timers ───────────────────────────────────────────────────────

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.state == ConnectionState::Authenticating {
            if let Some(deadline) = self.auth_deadline {
                if now >= deadline {
                    self.auth_deadline = None;
                    self.shared.stats.record_error();
                    tracing::error!("authentication timed out");
                    self.fire_error(ErrorCode::AuthenticationTimeout, "authentication timed out");
                    self.terminal = true;
                    self.in_reconnect_burst = false;
                    self.transport.close(1000, "Authentication timeout").await;
                    self.drop_session_state();
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }

        if self.state == ConnectionState::Reconnecting {
            if let Some(at) = self.reconnect_at {
                if now >= at {
                    self.reconnect_at = None;
                    self.attempt_open().await;
                    return;
                }
            }
        }

        if self.state == ConnectionState::Connected {
            match self.heartbeat.tick(now) {
                HeartbeatVerdict::PingDue => {
                    self.heartbeat.record_ping(now);
                    if let Err(e) = self.send_frame(&Envelope::ping()).await {
                        tracing::debug!(error = %e, "ping send failed");
                    }
                }
                HeartbeatVerdict::Expired => {
                    tracing::warn!("heartbeat timeout, closing transport");
                    self.transport.close(1000, "Heartbeat timeout").await;
                    self.on_transport_closed(1000, "Heartbeat timeout").await;
                }
                HeartbeatVerdict::Idle => {}
            }
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        let auth = self
            .auth_deadline
            .filter(|_| self.state == ConnectionState::Authenticating);
        let reconnect = self
            .reconnect_at
            .filter(|_| self.state == ConnectionState::Reconnecting);
        let heartbeat = if self.state == ConnectionState::Connected {
            self.heartbeat.next_deadline(Instant::now())
        } else {
            None
        };
        [auth, reconnect, heartbeat].into_iter().flatten().min()
    }

    // ── Reconnect burst ──────────────────────────────────────────────

    fn schedule_reconnect(&mut self, reason: &str) {
        match self.policy.next_delay() {
            Some(delay) => {
                self.in_reconnect_burst = true;
                let attempt = self.policy.attempt_count();
                self.shared.stats.record_reconnect();
                self.set_state(ConnectionState::Reconnecting);
                self.reconnect_at = Some(Instant::now() + delay);
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "reconnect scheduled"
                );
                self.fire_reconnecting(attempt);
            }
            None => {
                self.in_reconnect_burst = false;
                self.terminal = true;
                self.set_state(ConnectionState::Disconnected);
                tracing::error!(reason, "reconnect attempts exhausted");
                self.fire_disconnected(ErrorCode::ConnectionLost, reason);
            }
        }
    }

    // ── Shared-state plumbing ────────────────────────────────────────

    /// Only a Connected engine holds an identity.
    fn drop_session_state(&mut self) {
        self.heartbeat.reset();
        self.auth.reset();
        *self.shared.identity_lock() = None;
    }

    async fn send_frame(&mut self, envelope: &Envelope) -> Result<()> {
        let text = gw_protocol::encode(envelope)?;
        let bytes = text.len();
        self.transport.send(text).await?;
        self.shared.stats.record_sent(bytes);
        Ok(())
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        if self.state == new_state {
            return;
        }
        let old = self.state;
        self.state = new_state;
        self.shared.state_tx.send_replace(new_state);
        tracing::debug!(from = %old, to = %new_state, "state change");

        let callback = self.shared.callbacks_lock().on_state_changed.clone();
        if let Some(callback) = callback {
            callback(old, new_state);
        }
    }

    fn fire_connected(&self) {
        let callback = self.shared.callbacks_lock().on_connected.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn fire_disconnected(&self, code: ErrorCode, reason: &str) {
        let callback = self.shared.callbacks_lock().on_disconnected.clone();
        if let Some(callback) = callback {
            callback(code, reason);
        }
    }

    fn fire_reconnecting(&self, attempt: u32) {
        let callback = self.shared.callbacks_lock().on_reconnecting.clone();
        if let Some(callback) = callback {
            callback(attempt);
        }
    }

    fn fire_error(&self, code: ErrorCode, message: &str) {
        *self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((code, message.to_string()));
        let callback = self.shared.callbacks_lock().on_error.clone();
        if let Some(callback) = callback {
            callback(code, message);
        }
    }
}

fn close_code_to_error(code: u16) -> ErrorCode {
    if code == 1000 {
        ErrorCode::ConnectionClosed
    } else {
        ErrorCode::ConnectionLost
    }
}
