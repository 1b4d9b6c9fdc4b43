//! Authentication handshake and authorization helpers.
//!
//! Flow: on transport open the engine sends an Auth frame built by
//! [`AuthManager::create_request`]; the next inbound Auth frame settles
//! the handshake. On success the gateway's [`DeviceIdentity`] (with its
//! permission allow-lists) is retained for the session; it is dropped
//! again on every disconnect.

use gw_protocol::{AuthResponse, DeviceIdentity, Envelope, MessageType};

use crate::config::DeviceConfig;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    NotAuthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

/// Settled handshake result handed to the engine.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub success: bool,
    pub message: String,
    pub identity: Option<DeviceIdentity>,
}

#[derive(Debug, Default)]
pub struct AuthManager {
    state: AuthState,
    identity: Option<DeviceIdentity>,
    last_error: Option<String>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the Auth request frame from the configuration.
    pub fn create_request(config: &DeviceConfig) -> Envelope {
        Envelope::auth(&gw_protocol::AuthRequest {
            device_id: config.device_id.clone(),
            token: config.auth_token.clone(),
            device_type: config.device_type_string(),
        })
    }

    /// Enter the Authenticating state (request sent).
    pub fn begin(&mut self) {
        self.state = AuthState::Authenticating;
        self.last_error = None;
    }

    /// Feed an inbound frame. Returns the settled outcome for an Auth
    /// response received while Authenticating; anything else is ignored.
    pub fn handle_message(&mut self, envelope: &Envelope) -> Option<AuthOutcome> {
        if self.state != AuthState::Authenticating || envelope.msg_type != MessageType::Auth {
            return None;
        }

        let response = AuthResponse::from_envelope(envelope);
        let message = response.message.unwrap_or_default();

        if response.success {
            // A success without a device block still yields an identity:
            // the deny-all default keeps the Connected-state invariant.
            let identity = response.device.unwrap_or_default();
            self.state = AuthState::Authenticated;
            self.identity = Some(identity.clone());
            Some(AuthOutcome {
                success: true,
                message,
                identity: Some(identity),
            })
        } else {
            self.state = AuthState::Failed;
            self.last_error = Some(message.clone());
            Some(AuthOutcome {
                success: false,
                message,
                identity: None,
            })
        }
    }

    /// Drop all session state. Called on every disconnect.
    pub fn reset(&mut self) {
        self.state = AuthState::NotAuthenticated;
        self.identity = None;
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Advisory check against the granted publish allow-list.
    /// No identity or an empty list denies (failure-closed); the
    /// gateway remains authoritative.
    pub fn can_publish(&self, subject: &str) -> bool {
        self.identity
            .as_ref()
            .is_some_and(|id| id.allows_publish(subject))
    }

    /// Advisory check against the granted subscribe allow-list.
    pub fn can_subscribe(&self, subject: &str) -> bool {
        self.identity
            .as_ref()
            .is_some_and(|id| id.allows_subscribe(subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> DeviceConfig {
        DeviceConfig::builder()
            .gateway_url("ws://localhost:1/ws")
            .device_id("sensor-1")
            .auth_token("t")
            .build()
            .unwrap()
    }

    fn auth_reply(payload: serde_json::Value) -> Envelope {
        Envelope {
            payload: Some(payload),
            ..Envelope::auth(&gw_protocol::AuthRequest {
                device_id: String::new(),
                token: String::new(),
                device_type: String::new(),
            })
        }
    }

    #[test]
    fn request_carries_configured_identity() {
        let env = AuthManager::create_request(&config());
        assert_eq!(env.msg_type, MessageType::Auth);
        let payload = env.payload.unwrap();
        assert_eq!(payload["deviceId"], "sensor-1");
        assert_eq!(payload["token"], "t");
        assert_eq!(payload["deviceType"], "sensor");
    }

    #[test]
    fn success_stores_identity() {
        let mut auth = AuthManager::new();
        auth.begin();
        let outcome = auth
            .handle_message(&auth_reply(json!({
                "success": true,
                "device": {
                    "deviceId": "sensor-1",
                    "allowedPublishTopics": ["telemetry.>"],
                    "allowedSubscribeTopics": ["cmd.sensor-1.>"]
                }
            })))
            .expect("settled");
        assert!(outcome.success);
        assert!(auth.is_authenticated());
        assert!(auth.can_publish("telemetry.x"));
        assert!(!auth.can_publish("other"));
        assert!(auth.can_subscribe("cmd.sensor-1.set"));
        assert!(!auth.can_subscribe("cmd.sensor-2.set"));
    }

    #[test]
    fn failure_records_reason() {
        let mut auth = AuthManager::new();
        auth.begin();
        let outcome = auth
            .handle_message(&auth_reply(json!({"success": false, "message": "bad token"})))
            .expect("settled");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "bad token");
        assert_eq!(auth.state(), AuthState::Failed);
        assert_eq!(auth.last_error(), Some("bad token"));
        assert!(auth.identity().is_none());
    }

    #[test]
    fn success_without_device_denies_everything() {
        let mut auth = AuthManager::new();
        auth.begin();
        let outcome = auth
            .handle_message(&auth_reply(json!({"success": true})))
            .expect("settled");
        assert!(outcome.success);
        assert!(auth.is_authenticated());
        assert!(auth.identity().is_some());
        assert!(!auth.can_publish("anything"));
        assert!(!auth.can_subscribe("anything"));
    }

    #[test]
    fn frames_outside_authenticating_are_ignored() {
        let mut auth = AuthManager::new();
        // Not authenticating yet.
        assert!(auth
            .handle_message(&auth_reply(json!({"success": true})))
            .is_none());

        auth.begin();
        // Non-auth frame during handshake.
        assert!(auth
            .handle_message(&Envelope::publish("a.b", json!(1)))
            .is_none());
    }

    #[test]
    fn reset_clears_identity() {
        let mut auth = AuthManager::new();
        auth.begin();
        auth.handle_message(&auth_reply(json!({
            "success": true,
            "device": {"allowedPublishTopics": ["a.>"]}
        })));
        assert!(auth.can_publish("a.b"));

        auth.reset();
        assert_eq!(auth.state(), AuthState::NotAuthenticated);
        assert!(auth.identity().is_none());
        assert!(!auth.can_publish("a.b"));
    }
}
