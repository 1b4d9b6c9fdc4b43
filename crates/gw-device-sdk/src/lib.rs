//! `gw-device-sdk` — connect devices to the message-bus gateway.
//!
//! A "device" is any process (sensor, actuator, controller) that opens a
//! WebSocket to the gateway, authenticates once, and then publishes and
//! subscribes on a dot-separated subject tree with `*`/`>` wildcards.
//! This crate provides the building blocks so device authors don't need
//! to re-implement connection management, the auth handshake, heartbeat
//! liveness, reconnection, or subscription re-establishment.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  DeviceClient ──── owns ────► ClientEngine (one task)       │
//! │      │                           │  transport (WebSocket)   │
//! │      │ handle()                  │  auth handshake          │
//! │      ▼                           │  reconnect backoff       │
//! │  ClientHandle (Clone) ── mpsc ──►│  heartbeat monitor       │
//! │   publish/subscribe/stats        │  subscription dispatch   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow (hard-coded by the SDK)
//!
//! 1. Open the carrier (bounded by `connect_timeout`)
//! 2. Send `Auth { deviceId, token, deviceType }` and wait for the
//!    gateway's Auth reply (bounded by `auth_timeout`)
//! 3. On success: store the granted identity and allow-lists, re-send
//!    Subscribe frames in creation order, then fire `on_connected`
//! 4. On transport loss: reconnect with capped, jittered exponential
//!    backoff and re-authenticate (auth *failure* is terminal — only
//!    transport loss is retried)
//! 5. Heartbeat pings keep the session alive; enough missed pongs close
//!    the transport with reason "Heartbeat timeout"
//!
//! # Driving the engine
//!
//! Either poll from your own loop:
//!
//! ```rust,no_run
//! # use gw_device_sdk::DeviceClient;
//! # async fn demo(mut client: DeviceClient) {
//! client.connect().await;
//! loop {
//!     client.poll(std::time::Duration::from_millis(100)).await.ok();
//! }
//! # }
//! ```
//!
//! or hand the engine to a background task with
//! [`DeviceClient::run_async`] and use the cloneable [`ClientHandle`]
//! from any thread.

pub mod auth;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod reconnect;
pub mod registry;
pub mod stats;
pub mod transport;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use client::{ClientCallbacks, ClientHandle, DeviceClient, QoS};
pub use config::{
    BufferOptions, DeviceConfig, DeviceConfigBuilder, HeartbeatOptions, ReconnectOptions,
    TlsOptions,
};
pub use engine::ConnectionState;
pub use error::{ErrorCode, Result, SdkError};
pub use registry::{SubscriptionHandler, SubscriptionId};
pub use stats::ClientStats;
pub use transport::{Transport, TransportEvent, WsTransport};

// Re-export the protocol crate so devices never need a direct
// gw-protocol dependency.
pub use gw_protocol as protocol;

// Convenience re-exports of the most commonly used protocol types.
pub use gw_protocol::{DeviceIdentity, DeviceType, Envelope, MessageType};
