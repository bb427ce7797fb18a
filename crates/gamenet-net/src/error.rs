//! Connection-level errors and disconnect classification.

use std::fmt;

use crate::fragment::FragmentError;
use crate::framing::{FrameError, MessageType};
use crate::messages::PayloadError;
use crate::reassembly::ReassemblyError;
use crate::transport::TlsError;

/// Errors raised by connection and session operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Framing failed: malformed header or the stream ended.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A fragment envelope was malformed.
    #[error(transparent)]
    Fragment(#[from] FragmentError),

    /// An auth or register payload was malformed.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// A fragment could not be applied to its transfer.
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    /// TLS could not be set up.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Socket, handshake or large-send source I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A non-auth frame arrived before the peer authenticated.
    #[error("{0:?} received before authentication")]
    Unauthenticated(MessageType),

    /// A frame type that is never valid in this direction.
    #[error("unexpected {0:?} frame")]
    UnexpectedMessage(MessageType),

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection is already up.
    #[error("already connected")]
    AlreadyConnected,

    /// Establishing the connection took too long.
    #[error("connect timed out")]
    Timeout,
}

impl ConnectionError {
    /// Whether the peer broke the protocol. Such errors close the connection
    /// and are logged as warnings; everything else is an ordinary disconnect.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            ConnectionError::Frame(e) => e.is_protocol_violation(),
            ConnectionError::Fragment(_)
            | ConnectionError::Payload(_)
            | ConnectionError::Reassembly(_)
            | ConnectionError::Unauthenticated(_)
            | ConnectionError::UnexpectedMessage(_) => true,
            _ => false,
        }
    }
}

/// Why a connection or session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local side asked for it.
    Requested,
    /// The peer closed the stream.
    PeerClosed,
    /// The server is shutting down.
    Shutdown,
    /// Nothing was received within the heartbeat window.
    HeartbeatTimeout,
    /// The peer violated the protocol.
    ProtocolError(String),
    /// The transport failed underneath the connection.
    TransportError(String),
}

impl DisconnectReason {
    /// Classify the error that ended a receive loop.
    pub fn from_error(error: &ConnectionError) -> Self {
        match error {
            ConnectionError::Frame(FrameError::ConnectionClosed) => DisconnectReason::PeerClosed,
            e if e.is_protocol_violation() => DisconnectReason::ProtocolError(e.to_string()),
            e => DisconnectReason::TransportError(e.to_string()),
        }
    }

    /// Whether the local side initiated the close.
    pub fn is_local(&self) -> bool {
        matches!(self, DisconnectReason::Requested | DisconnectReason::Shutdown)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("requested"),
            DisconnectReason::PeerClosed => f.write_str("peer closed the connection"),
            DisconnectReason::Shutdown => f.write_str("server shutting down"),
            DisconnectReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            DisconnectReason::ProtocolError(e) => write!(f, "protocol error: {e}"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let closed = ConnectionError::from(FrameError::ConnectionClosed);
        assert!(!closed.is_protocol_violation());
        assert_eq!(DisconnectReason::from_error(&closed), DisconnectReason::PeerClosed);

        let bad_type = ConnectionError::from(FrameError::UnknownMessageType(0x7F));
        assert!(bad_type.is_protocol_violation());
        assert!(matches!(
            DisconnectReason::from_error(&bad_type),
            DisconnectReason::ProtocolError(_)
        ));

        let gated = ConnectionError::Unauthenticated(MessageType::Data);
        assert!(gated.is_protocol_violation());

        let io = ConnectionError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(matches!(
            DisconnectReason::from_error(&io),
            DisconnectReason::TransportError(_)
        ));
    }

    #[test]
    fn test_local_reasons() {
        assert!(DisconnectReason::Requested.is_local());
        assert!(DisconnectReason::Shutdown.is_local());
        assert!(!DisconnectReason::PeerClosed.is_local());
        assert!(!DisconnectReason::HeartbeatTimeout.is_local());
    }
}
