//! Error types for mqttbridge.

use std::fmt;
use std::io;

use rumqttc::mqttbytes::v4::ConnectReturnCode;

/// Result type alias for mqttbridge.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection attempt never reached READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Credential or security failure on the backend connection.
    NotAuthorized,
    /// Any other backend failure while connecting or resolving the session.
    ServiceUnavailable,
    /// The handshake deadline elapsed before session resolution settled.
    Timeout,
}

impl RejectReason {
    /// CONNACK return code reported to the MQTT client.
    pub fn connack_code(self) -> ConnectReturnCode {
        match self {
            RejectReason::NotAuthorized => ConnectReturnCode::NotAuthorized,
            RejectReason::ServiceUnavailable | RejectReason::Timeout => {
                ConnectReturnCode::ServiceUnavailable
            }
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotAuthorized => write!(f, "not authorized"),
            RejectReason::ServiceUnavailable => write!(f, "service unavailable"),
            RejectReason::Timeout => write!(f, "handshake timeout"),
        }
    }
}

/// Error type for mqttbridge operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// MQTT protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Backend refused the credentials.
    #[error("backend: not authorized: {0}")]
    NotAuthorized(String),

    /// Backend connection or service failure.
    #[error("backend: {0}")]
    Backend(String),

    /// Operation on a link that is already closed.
    #[error("backend link closed: {0}")]
    LinkClosed(String),

    /// Connection attempt rejected before reaching READY.
    #[error("connect rejected: {0}")]
    ConnectRejected(RejectReason),

    /// Operation not allowed in the session's current state.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Invalid topic filter.
    #[error("invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Gateway is already running.
    #[error("gateway already running")]
    AlreadyRunning,

    /// Gateway is shutting down.
    #[error("gateway shutting down")]
    ShuttingDown,

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<RejectReason> for Error {
    fn from(reason: RejectReason) -> Self {
        Error::ConnectRejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_connack_code() {
        assert_eq!(
            RejectReason::NotAuthorized.connack_code(),
            ConnectReturnCode::NotAuthorized
        );
        assert_eq!(
            RejectReason::ServiceUnavailable.connack_code(),
            ConnectReturnCode::ServiceUnavailable
        );
        assert_eq!(
            RejectReason::Timeout.connack_code(),
            ConnectReturnCode::ServiceUnavailable
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::ConnectRejected(RejectReason::Timeout);
        assert_eq!(err.to_string(), "connect rejected: handshake timeout");

        let err = Error::InvalidTopicFilter("a/#/b".to_string());
        assert!(err.to_string().contains("a/#/b"));
    }
}
