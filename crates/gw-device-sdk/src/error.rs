//! SDK error types.
//!
//! Every fallible public operation returns [`Result`]. Asynchronous
//! failures (transport events, decode errors) are surfaced through the
//! `on_error` callback as an ([`ErrorCode`], message) pair.

use gw_protocol::ProtocolError;

/// Stable error taxonomy shared with callbacks and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Connection
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionClosed,
    ConnectionLost,
    TlsError,
    DnsResolutionFailed,

    // Authentication
    AuthenticationFailed,
    AuthenticationTimeout,
    InvalidCredentials,
    DeviceNotRegistered,
    TokenExpired,

    // Authorization
    NotAuthorized,
    PublishNotAllowed,
    SubscribeNotAllowed,
    SubjectNotAllowed,

    // Protocol
    InvalidMessage,
    InvalidMessageType,
    InvalidSubject,
    PayloadTooLarge,
    MalformedJson,
    ProtocolVersionMismatch,

    // Operation
    OperationTimeout,
    OperationCancelled,
    AlreadyConnected,
    NotConnected,
    AlreadySubscribed,
    NotSubscribed,
    RateLimitExceeded,
    BufferFull,

    // Internal
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ConnectionFailed => "ConnectionFailed",
            Self::ConnectionTimeout => "ConnectionTimeout",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::ConnectionLost => "ConnectionLost",
            Self::TlsError => "TlsError",
            Self::DnsResolutionFailed => "DnsResolutionFailed",
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::AuthenticationTimeout => "AuthenticationTimeout",
            Self::InvalidCredentials => "InvalidCredentials",
            Self::DeviceNotRegistered => "DeviceNotRegistered",
            Self::TokenExpired => "TokenExpired",
            Self::NotAuthorized => "NotAuthorized",
            Self::PublishNotAllowed => "PublishNotAllowed",
            Self::SubscribeNotAllowed => "SubscribeNotAllowed",
            Self::SubjectNotAllowed => "SubjectNotAllowed",
            Self::InvalidMessage => "InvalidMessage",
            Self::InvalidMessageType => "InvalidMessageType",
            Self::InvalidSubject => "InvalidSubject",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::MalformedJson => "MalformedJson",
            Self::ProtocolVersionMismatch => "ProtocolVersionMismatch",
            Self::OperationTimeout => "OperationTimeout",
            Self::OperationCancelled => "OperationCancelled",
            Self::AlreadyConnected => "AlreadyConnected",
            Self::NotConnected => "NotConnected",
            Self::AlreadySubscribed => "AlreadySubscribed",
            Self::NotSubscribed => "NotSubscribed",
            Self::RateLimitExceeded => "RateLimitExceeded",
            Self::BufferFull => "BufferFull",
            Self::InternalError => "InternalError",
        })
    }
}

/// Top-level SDK error.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SdkError {
    #[error("config: {0}")]
    Config(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("TLS: {0}")]
    Tls(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authentication timed out")]
    AuthenticationTimeout,

    #[error("publish not allowed on '{0}'")]
    PublishNotAllowed(String),

    #[error("subscribe not allowed on '{0}'")]
    SubscribeNotAllowed(String),

    #[error("payload too large: {size} > {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("operation timed out")]
    OperationTimeout,

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("not subscribed: {0}")]
    NotSubscribed(String),

    #[error("outgoing buffer full")]
    BufferFull,

    #[error("client engine is not running")]
    EngineStopped,

    #[error("internal: {0}")]
    Internal(String),
}

impl SdkError {
    /// The taxonomy code surfaced through `on_error` and logs.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::InternalError,
            Self::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            Self::ConnectionTimeout => ErrorCode::ConnectionTimeout,
            Self::ConnectionClosed(_) => ErrorCode::ConnectionClosed,
            Self::ConnectionLost(_) => ErrorCode::ConnectionLost,
            Self::Tls(_) => ErrorCode::TlsError,
            Self::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Self::AuthenticationTimeout => ErrorCode::AuthenticationTimeout,
            Self::PublishNotAllowed(_) => ErrorCode::PublishNotAllowed,
            Self::SubscribeNotAllowed(_) => ErrorCode::SubscribeNotAllowed,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::Protocol(ProtocolError::MalformedJson(_)) => ErrorCode::MalformedJson,
            Self::Protocol(ProtocolError::InvalidMessageType(_)) => ErrorCode::InvalidMessageType,
            Self::Protocol(ProtocolError::InvalidSubject(_)) => ErrorCode::InvalidSubject,
            Self::OperationTimeout => ErrorCode::OperationTimeout,
            Self::AlreadyConnected => ErrorCode::AlreadyConnected,
            Self::NotConnected => ErrorCode::NotConnected,
            Self::NotSubscribed(_) => ErrorCode::NotSubscribed,
            Self::BufferFull => ErrorCode::BufferFull,
            Self::EngineStopped => ErrorCode::InternalError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_taxonomy() {
        assert_eq!(SdkError::NotConnected.code(), ErrorCode::NotConnected);
        assert_eq!(SdkError::BufferFull.code(), ErrorCode::BufferFull);
        assert_eq!(
            SdkError::Protocol(ProtocolError::MalformedJson("x".into())).code(),
            ErrorCode::MalformedJson
        );
        assert_eq!(
            SdkError::AuthenticationFailed("bad token".into()).code(),
            ErrorCode::AuthenticationFailed
        );
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(ErrorCode::ConnectionLost.to_string(), "ConnectionLost");
        assert_eq!(
            SdkError::PayloadTooLarge { size: 2, limit: 1 }.to_string(),
            "payload too large: 2 > 1 bytes"
        );
    }
}
