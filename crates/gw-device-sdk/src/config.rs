//! Client configuration.
//!
//! [`DeviceConfig`] carries everything the engine needs: connection
//! identity, timeout budgets, TLS material, and the reconnect, heartbeat
//! and buffer policies. Build one directly or through
//! [`DeviceConfigBuilder`].

use std::path::PathBuf;
use std::time::Duration;

use gw_protocol::DeviceType;

use crate::error::{Result, SdkError};

/// TLS options for `wss://` gateways.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Enable TLS (only consulted for `wss://` URLs).
    pub enabled: bool,
    /// Verify the server certificate. Disable only for development.
    pub verify_peer: bool,
    /// Extra CA certificate (PEM) trusted for this connection.
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate (PEM) for mutual TLS.
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PEM) for mutual TLS.
    pub client_key_path: Option<PathBuf>,
    /// Server name for SNI; defaults to the URL host.
    pub server_name: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_peer: true,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            server_name: None,
        }
    }
}

/// Reconnect policy knobs.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    /// Jitter window as a fraction of the base delay, in `[0, 1]`.
    pub max_jitter_fraction: f64,
    /// Maximum attempts in one reconnect burst. `0` means unlimited.
    pub max_attempts: u32,
    /// Re-send Subscribe frames after a successful reconnect.
    pub resubscribe_on_reconnect: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            max_jitter_fraction: 0.25,
            max_attempts: 0,
            resubscribe_on_reconnect: true,
        }
    }
}

/// Heartbeat liveness knobs.
#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub enabled: bool,
    /// Interval between outgoing pings.
    pub interval: Duration,
    /// How long an unanswered ping may age before it counts as missed.
    pub timeout: Duration,
    /// Missed pongs that trip a disconnect.
    pub missed_pongs_before_disconnect: u32,
    /// Answer peer-initiated Pings with a Pong.
    pub answer_pings: bool,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(10_000),
            missed_pongs_before_disconnect: 2,
            answer_pings: true,
        }
    }
}

/// Outbound/inbound buffering limits.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Frames queued for the carrier before `BufferFull`.
    pub max_outgoing_messages: usize,
    pub max_incoming_messages: usize,
    /// Maximum serialized payload size in bytes. Matches the gateway's
    /// message-size limit.
    pub max_payload_size: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            max_outgoing_messages: 1_000,
            max_incoming_messages: 1_000,
            max_payload_size: 1_048_576,
        }
    }
}

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Gateway WebSocket URL, e.g. `wss://gateway.example.com/ws`.
    pub gateway_url: String,
    /// Unique device identifier (at most 256 characters).
    pub device_id: String,
    /// Authentication token presented in the handshake.
    pub auth_token: String,
    pub device_type: DeviceType,
    /// Wire device-type string when `device_type` is `Custom`.
    pub custom_device_type: Option<String>,

    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub operation_timeout: Duration,

    /// Turn the advisory allow-list checks into hard refusals.
    pub enforce_permissions: bool,

    pub tls: TlsOptions,
    pub reconnect: ReconnectOptions,
    pub heartbeat: HeartbeatOptions,
    pub buffers: BufferOptions,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gateway_url: String::new(),
            device_id: String::new(),
            auth_token: String::new(),
            device_type: DeviceType::Sensor,
            custom_device_type: None,
            connect_timeout: Duration::from_millis(10_000),
            auth_timeout: Duration::from_millis(30_000),
            operation_timeout: Duration::from_millis(5_000),
            enforce_permissions: false,
            tls: TlsOptions::default(),
            reconnect: ReconnectOptions::default(),
            heartbeat: HeartbeatOptions::default(),
            buffers: BufferOptions::default(),
        }
    }
}

impl DeviceConfig {
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::default()
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.gateway_url.is_empty() {
            return Err(SdkError::Config("gateway_url is required".into()));
        }
        if !self.gateway_url.starts_with("ws://") && !self.gateway_url.starts_with("wss://") {
            return Err(SdkError::Config(format!(
                "gateway_url must be a ws:// or wss:// URL, got '{}'",
                self.gateway_url
            )));
        }
        if self.device_id.is_empty() {
            return Err(SdkError::Config("device_id is required".into()));
        }
        if self.device_id.len() > 256 {
            return Err(SdkError::Config("device_id exceeds 256 characters".into()));
        }
        if self.auth_token.is_empty() {
            return Err(SdkError::Config("auth_token is required".into()));
        }
        if self.device_type == DeviceType::Custom
            && self.custom_device_type.as_deref().unwrap_or("").is_empty()
        {
            return Err(SdkError::Config(
                "custom_device_type is required when device_type is Custom".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.max_jitter_fraction) {
            return Err(SdkError::Config(
                "max_jitter_fraction must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// The device-type string sent in the handshake.
    pub fn device_type_string(&self) -> String {
        match (self.device_type, &self.custom_device_type) {
            (DeviceType::Custom, Some(custom)) if !custom.is_empty() => custom.clone(),
            (ty, _) => ty.as_str().to_string(),
        }
    }
}

/// Fluent builder for [`DeviceConfig`].
///
/// # Example
///
/// ```rust
/// # use gw_device_sdk::DeviceConfig;
/// # use std::time::Duration;
/// let config = DeviceConfig::builder()
///     .gateway_url("wss://gateway.example.com/ws")
///     .device_id("sensor-001")
///     .auth_token("api-token")
///     .heartbeat_interval(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct DeviceConfigBuilder {
    config: DeviceConfig,
}

impl DeviceConfigBuilder {
    // ── Required ─────────────────────────────────────────────────────

    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = url.into();
        self
    }

    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.config.device_id = id.into();
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = token.into();
        self
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn device_type(mut self, ty: DeviceType) -> Self {
        self.config.device_type = ty;
        self
    }

    /// Use a custom device-type string (implies `DeviceType::Custom`).
    pub fn custom_device_type(mut self, ty: impl Into<String>) -> Self {
        self.config.device_type = DeviceType::Custom;
        self.config.custom_device_type = Some(ty.into());
        self
    }

    // ── Timeouts ─────────────────────────────────────────────────────

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    // ── Authorization ────────────────────────────────────────────────

    /// Refuse publishes/subscribes outside the granted allow-lists
    /// instead of only logging a warning.
    pub fn enforce_permissions(mut self, enforce: bool) -> Self {
        self.config.enforce_permissions = enforce;
        self
    }

    // ── TLS ──────────────────────────────────────────────────────────

    pub fn enable_tls(mut self, verify_peer: bool) -> Self {
        self.config.tls.enabled = true;
        self.config.tls.verify_peer = verify_peer;
        self
    }

    pub fn tls_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.ca_cert_path = Some(path.into());
        self
    }

    pub fn tls_client_cert(
        mut self,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        self.config.tls.client_cert_path = Some(cert.into());
        self.config.tls.client_key_path = Some(key.into());
        self
    }

    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.tls.server_name = Some(name.into());
        self
    }

    // ── Reconnect ────────────────────────────────────────────────────

    pub fn reconnect(mut self, options: ReconnectOptions) -> Self {
        self.config.reconnect = options;
        self
    }

    pub fn enable_reconnect(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.config.reconnect.enabled = true;
        self.config.reconnect.initial_delay = initial_delay;
        self.config.reconnect.max_delay = max_delay;
        self
    }

    pub fn disable_reconnect(mut self) -> Self {
        self.config.reconnect.enabled = false;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    // ── Heartbeat ────────────────────────────────────────────────────

    pub fn heartbeat(mut self, options: HeartbeatOptions) -> Self {
        self.config.heartbeat = options;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat.enabled = true;
        self.config.heartbeat.interval = interval;
        self
    }

    pub fn disable_heartbeat(mut self) -> Self {
        self.config.heartbeat.enabled = false;
        self
    }

    // ── Buffers ──────────────────────────────────────────────────────

    pub fn buffer_sizes(mut self, outgoing: usize, incoming: usize) -> Self {
        self.config.buffers.max_outgoing_messages = outgoing;
        self.config.buffers.max_incoming_messages = incoming;
        self
    }

    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.config.buffers.max_payload_size = bytes;
        self
    }

    /// Validate and produce the final configuration.
    pub fn build(self) -> Result<DeviceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> DeviceConfigBuilder {
        DeviceConfig::builder()
            .gateway_url("ws://localhost:8080/ws")
            .device_id("sensor-1")
            .auth_token("t")
    }

    #[test]
    fn builder_defaults() {
        let config = minimal().build().unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(10_000));
        assert_eq!(config.auth_timeout, Duration::from_millis(30_000));
        assert_eq!(config.operation_timeout, Duration::from_millis(5_000));
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(1_000));
        assert_eq!(config.reconnect.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.reconnect.backoff_multiplier, 2.0);
        assert_eq!(config.reconnect.max_jitter_fraction, 0.25);
        assert_eq!(config.reconnect.max_attempts, 0);
        assert!(config.reconnect.resubscribe_on_reconnect);
        assert_eq!(config.heartbeat.interval, Duration::from_millis(30_000));
        assert_eq!(config.heartbeat.timeout, Duration::from_millis(10_000));
        assert_eq!(config.heartbeat.missed_pongs_before_disconnect, 2);
        assert_eq!(config.buffers.max_outgoing_messages, 1_000);
        assert_eq!(config.buffers.max_payload_size, 1_048_576);
    }

    #[test]
    fn validation_requires_identity() {
        assert!(DeviceConfig::builder().build().is_err());
        assert!(minimal().gateway_url("").build().is_err());
        assert!(minimal().device_id("").build().is_err());
        assert!(minimal().auth_token("").build().is_err());
        assert!(minimal()
            .gateway_url("http://not-a-ws-url")
            .build()
            .is_err());
    }

    #[test]
    fn validation_bounds_device_id() {
        assert!(minimal().device_id("a".repeat(256)).build().is_ok());
        assert!(minimal().device_id("a".repeat(257)).build().is_err());
    }

    #[test]
    fn custom_device_type_required_when_custom() {
        assert!(minimal()
            .device_type(gw_protocol::DeviceType::Custom)
            .build()
            .is_err());
        let config = minimal().custom_device_type("plc-bridge").build().unwrap();
        assert_eq!(config.device_type_string(), "plc-bridge");
    }

    #[test]
    fn device_type_string_defaults_to_enum_name() {
        let config = minimal()
            .device_type(gw_protocol::DeviceType::Actuator)
            .build()
            .unwrap();
        assert_eq!(config.device_type_string(), "actuator");
    }
}
