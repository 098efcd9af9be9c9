use std::fmt;

use thiserror::Error;

use crate::transport_error::Code as TransportErrorCode;

/// Machine-readable reason a connection was closed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QuicErrorCode {
    /// Orderly shutdown
    NoError,
    /// A bug or unexpected state in this implementation
    InternalError,
    /// An ACK frame acknowledged something that cannot be acknowledged
    InvalidAckData,
    /// A STOP_WAITING frame pointed beyond what was received
    InvalidStopWaitingData,
    /// A frame could not be interpreted
    InvalidFrameData,
    /// Stream data arrived, or was about to be sent, without packet protection
    UnencryptedStreamData,
    /// A frame referenced a stream that cannot exist in that direction
    InvalidStreamId,
    /// The peer broke a rule not covered by a more specific code
    ProtocolViolation,
    /// Too many packets were protected or failed authentication under one key
    AeadLimitReached,
    /// A key update could not be carried out
    KeyUpdateError,
    /// The writer failed for a reason other than being blocked
    PacketWriteError,
    /// The handshake did not finish in time
    HandshakeTimeout,
    /// Nothing was received for the idle timeout
    NetworkIdleTimeout,
    /// Retransmission timeouts kept firing without forward progress
    TooManyRtos,
    /// The peer announced that it is going away
    PeerGoingAway,
    /// More packets are awaiting acknowledgement than can be tracked
    TooManyOutstandingSentPackets,
    /// The peer issued more connection IDs than allowed
    ConnectionIdLimitError,
    /// Path validation failed and no validated path remains
    NoValidatedPath,
    /// Transport error code received from the peer
    Transport(TransportErrorCode),
    /// Application error code, sent or received
    Application(u64),
}

impl QuicErrorCode {
    /// The code carried on the wire in a transport CONNECTION_CLOSE frame
    pub fn transport_code(self) -> TransportErrorCode {
        use QuicErrorCode::*;
        match self {
            NoError | NetworkIdleTimeout | TooManyRtos | PeerGoingAway => {
                TransportErrorCode::NO_ERROR
            }
            InternalError | PacketWriteError | TooManyOutstandingSentPackets => {
                TransportErrorCode::INTERNAL_ERROR
            }
            InvalidAckData | InvalidStopWaitingData | InvalidFrameData => {
                TransportErrorCode::FRAME_ENCODING_ERROR
            }
            UnencryptedStreamData | ProtocolViolation | HandshakeTimeout => {
                TransportErrorCode::PROTOCOL_VIOLATION
            }
            InvalidStreamId => TransportErrorCode::STREAM_STATE_ERROR,
            AeadLimitReached => TransportErrorCode::AEAD_LIMIT_REACHED,
            KeyUpdateError => TransportErrorCode::KEY_UPDATE_ERROR,
            ConnectionIdLimitError => TransportErrorCode::CONNECTION_ID_LIMIT_ERROR,
            NoValidatedPath => TransportErrorCode::NO_VIABLE_PATH,
            Transport(code) => code,
            Application(_) => TransportErrorCode::APPLICATION_ERROR,
        }
    }
}

impl fmt::Display for QuicErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Transport(code) => write!(f, "transport error {code:?}"),
            Self::Application(code) => write!(f, "application error {code}"),
            ref other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Which endpoint closed the connection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseSource {
    /// This endpoint
    Local,
    /// The peer, through a CONNECTION_CLOSE frame
    Peer,
}

/// What is sent to the peer when the connection is closed locally
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCloseBehavior {
    /// Nothing; local state is torn down only
    SilentClose,
    /// CONNECTION_CLOSE, with any pending ACK bundled
    SendConnectionClosePacket,
    /// CONNECTION_CLOSE without an ACK
    SendConnectionClosePacketWithNoAck,
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {details}")]
pub struct ConnectionError {
    /// Machine-readable cause
    pub code: QuicErrorCode,
    /// Human-readable explanation
    pub details: String,
    /// Who closed the connection
    pub origin: CloseSource,
}

impl ConnectionError {
    pub(super) fn local(code: QuicErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            origin: CloseSource::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(
            QuicErrorCode::InvalidAckData.transport_code(),
            TransportErrorCode::FRAME_ENCODING_ERROR
        );
        assert_eq!(
            QuicErrorCode::AeadLimitReached.transport_code(),
            TransportErrorCode::AEAD_LIMIT_REACHED
        );
        let peer = QuicErrorCode::Transport(TransportErrorCode::CONNECTION_REFUSED);
        assert_eq!(peer.transport_code(), TransportErrorCode::CONNECTION_REFUSED);
    }

    #[test]
    fn display() {
        let err = ConnectionError::local(QuicErrorCode::TooManyRtos, "Network blackhole detected");
        assert_eq!(err.to_string(), "TooManyRtos: Network blackhole detected");
        assert_eq!(
            QuicErrorCode::Application(7).to_string(),
            "application error 7"
        );
    }
}
