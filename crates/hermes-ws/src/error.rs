//! Error types for the WebSocket event layer.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type WsResult<T> = std::result::Result<T, WsError>;

/// Errors surfaced by upgrades, sockets and routes.
#[derive(Debug, Error)]
pub enum WsError {
    /// The HTTP request is not a valid WebSocket upgrade request.
    #[error("not a websocket request: {reason}")]
    NotWebSocketRequest {
        /// Which part of the request failed validation.
        reason: String,
    },

    /// The connection is closed and can no longer carry messages.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Close code, when the peer supplied one.
        code: Option<u16>,
        /// Human-readable close reason.
        reason: String,
    },

    /// Encoding an outbound payload failed.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] hermes_wire::WireError),

    /// An inbound payload failed validation.
    #[error(transparent)]
    Validation(#[from] crate::validate::ValidationError),

    /// Underlying protocol error from the WebSocket implementation.
    #[error("websocket protocol error: {0}")]
    Protocol(#[from] tungstenite::Error),

    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// Build a [`WsError::NotWebSocketRequest`].
    pub fn not_websocket(reason: impl Into<String>) -> Self {
        Self::NotWebSocketRequest {
            reason: reason.into(),
        }
    }

    /// Build a [`WsError::ConnectionClosed`].
    pub fn connection_closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }
}

/// Standard WebSocket close codes (RFC 6455 section 7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal = 1000,
    /// 1001: endpoint going away.
    GoingAway = 1001,
    /// 1002: protocol error.
    ProtocolError = 1002,
    /// 1003: unsupported data type.
    Unsupported = 1003,
    /// 1005: no status code present (never sent on the wire).
    NoStatus = 1005,
    /// 1006: connection dropped without a close frame.
    Abnormal = 1006,
    /// 1007: payload inconsistent with message type.
    InvalidPayload = 1007,
    /// 1008: message violates endpoint policy.
    PolicyViolation = 1008,
    /// 1009: message too large to process.
    TooLarge = 1009,
    /// 1011: server encountered an unexpected condition.
    InternalError = 1011,
}

impl CloseCode {
    /// Numeric value carried in the close frame.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Map a raw close code to a known variant, if any.
    #[must_use]
    pub const fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::ProtocolError),
            1003 => Some(Self::Unsupported),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::TooLarge),
            1011 => Some(Self::InternalError),
            _ => None,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_round_trip() {
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::from_u16(1006), Some(CloseCode::Abnormal));
        assert_eq!(CloseCode::from_u16(4000), None);
    }

    #[test]
    fn error_display() {
        let err = WsError::not_websocket("missing Upgrade header");
        assert_eq!(
            err.to_string(),
            "not a websocket request: missing Upgrade header"
        );
        let err = WsError::connection_closed(Some(1000), "bye");
        assert_eq!(err.to_string(), "connection closed: bye");
    }
}
