use std::{fmt, ops::Range};

use bytes::Bytes;

use crate::{Dir, Duration, StreamId, range_set::RangeSet, shared::ConnectionId};

/// A QUIC frame type
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FrameType(u64);

impl From<FrameType> for u64 {
    fn from(x: FrameType) -> Self {
        x.0
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(#[allow(missing_docs)] pub const $name: Self = Self($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    STREAM = 0x08,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
    DATAGRAM = 0x30,
    ACK_FREQUENCY = 0xaf,
    // gQUIC frames without an IETF encoding; the codec maps them to its own wire format
    STOP_WAITING = 0xff06,
    GOAWAY = 0xff03,
}

/// A decoded QUIC frame
///
/// The connection never parses or serializes frames itself. The [`PacketCodec`] produces these
/// on receipt and consumes them when building packets.
///
/// [`PacketCodec`]: crate::PacketCodec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Padding of the given number of bytes
    Padding(usize),
    /// Elicits an acknowledgement
    Ping,
    /// Acknowledges received packets
    Ack(Ack),
    /// Abruptly terminates the sending part of a stream
    ResetStream(ResetStream),
    /// Requests that the peer stop sending on a stream
    StopSending {
        /// Stream to stop
        id: StreamId,
        /// Application error code
        error_code: u64,
    },
    /// Handshake data
    Crypto(Crypto),
    /// An address validation token for future connections
    NewToken {
        /// Opaque token
        token: Bytes,
    },
    /// Application stream data
    Stream(Stream),
    /// Connection-level flow control limit
    MaxData(u64),
    /// Stream-level flow control limit
    MaxStreamData {
        /// Stream the limit applies to
        id: StreamId,
        /// New limit
        offset: u64,
    },
    /// Stream count limit
    MaxStreams {
        /// Direction the limit applies to
        dir: Dir,
        /// Cumulative number of streams the peer may open
        count: u64,
    },
    /// Connection-level flow control blocked the sender
    DataBlocked {
        /// Limit at which the sender was blocked
        offset: u64,
    },
    /// Stream-level flow control blocked the sender
    StreamDataBlocked {
        /// Stream that is blocked
        id: StreamId,
        /// Limit at which the sender was blocked
        offset: u64,
    },
    /// The stream count limit blocked the sender
    StreamsBlocked {
        /// Direction that is blocked
        dir: Dir,
        /// Limit at which the sender was blocked
        limit: u64,
    },
    /// Issues an additional connection ID
    NewConnectionId(NewConnectionId),
    /// Retires a previously issued connection ID
    RetireConnectionId {
        /// Sequence number of the retired ID
        sequence: u64,
    },
    /// Asks the peer to echo the payload on the path it arrived on
    PathChallenge(u64),
    /// Echo of a PATH_CHALLENGE payload
    PathResponse(u64),
    /// Closes the connection
    Close(Close),
    /// Unreliable application datagram
    Message(Bytes),
    /// Confirms the handshake to the client
    HandshakeDone,
    /// Adjusts the peer's acknowledgement behaviour
    AckFrequency(AckFrequency),
    /// Tells the peer no packets below `least_unacked` will be retransmitted
    StopWaiting {
        /// Smallest packet number the sender still awaits an acknowledgement for
        least_unacked: u64,
    },
    /// Announces that the peer will not accept new streams
    GoAway {
        /// Application error code
        error_code: u64,
        /// Highest stream the sender will still process
        last_good_stream: StreamId,
        /// Human-readable reason
        reason: Bytes,
    },
}

impl Frame {
    /// The type of this frame
    pub fn ty(&self) -> FrameType {
        use Frame::*;
        match *self {
            Padding(_) => FrameType::PADDING,
            Ping => FrameType::PING,
            Ack(ref ack) if ack.ecn.is_some() => FrameType::ACK_ECN,
            Ack(_) => FrameType::ACK,
            ResetStream(_) => FrameType::RESET_STREAM,
            StopSending { .. } => FrameType::STOP_SENDING,
            Crypto(_) => FrameType::CRYPTO,
            NewToken { .. } => FrameType::NEW_TOKEN,
            Stream(_) => FrameType::STREAM,
            MaxData(_) => FrameType::MAX_DATA,
            MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            MaxStreams { dir: Dir::Bi, .. } => FrameType::MAX_STREAMS_BIDI,
            MaxStreams { dir: Dir::Uni, .. } => FrameType::MAX_STREAMS_UNI,
            DataBlocked { .. } => FrameType::DATA_BLOCKED,
            StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            StreamsBlocked { dir: Dir::Bi, .. } => FrameType::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { dir: Dir::Uni, .. } => FrameType::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => FrameType::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            PathChallenge(_) => FrameType::PATH_CHALLENGE,
            PathResponse(_) => FrameType::PATH_RESPONSE,
            Close(ref c) if c.application => FrameType::APPLICATION_CLOSE,
            Close(_) => FrameType::CONNECTION_CLOSE,
            Message(_) => FrameType::DATAGRAM,
            HandshakeDone => FrameType::HANDSHAKE_DONE,
            AckFrequency(_) => FrameType::ACK_FREQUENCY,
            StopWaiting { .. } => FrameType::STOP_WAITING,
            GoAway { .. } => FrameType::GOAWAY,
        }
    }

    /// Whether receipt of this frame obliges the peer to send an acknowledgement
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            *self,
            Self::Ack(_) | Self::Padding(_) | Self::Close(_) | Self::StopWaiting { .. }
        )
    }

    /// Whether this frame must be delivered again if the packet carrying it is lost
    ///
    /// PING and PATH_CHALLENGE elicit acknowledgements but are regenerated on demand
    /// rather than retransmitted verbatim, and unreliable messages are never resent.
    pub fn is_retransmittable(&self) -> bool {
        self.is_ack_eliciting()
            && !matches!(
                *self,
                Self::Ping | Self::PathChallenge(_) | Self::PathResponse(_) | Self::Message(_)
            )
    }

    /// Whether this frame may appear in a packet that only probes a path
    ///
    /// A packet made up exclusively of probing frames does not cause the receiver to migrate.
    pub fn is_probing(&self) -> bool {
        matches!(
            *self,
            Self::Padding(_)
                | Self::PathChallenge(_)
                | Self::PathResponse(_)
                | Self::NewConnectionId(_)
        )
    }

    /// Whether this frame carries handshake data
    pub fn is_crypto(&self) -> bool {
        matches!(*self, Self::Crypto(_))
    }
}

/// Acknowledgement of received packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Largest packet number being acknowledged
    pub largest: u64,
    /// Time the peer held the largest packet before acknowledging it
    pub delay: Duration,
    /// All acknowledged packet numbers, including `largest`
    pub ranges: RangeSet,
    /// Receive timestamps reported by the peer, relative to its own epoch
    pub timestamps: Vec<(u64, Duration)>,
    /// ECN counters, if the peer reports them
    pub ecn: Option<EcnCounts>,
}

impl Ack {
    /// Build an acknowledgement of `ranges`
    ///
    /// Returns `None` when `ranges` is empty.
    pub fn new(ranges: RangeSet, delay: Duration) -> Option<Self> {
        Some(Self {
            largest: ranges.max()?,
            delay,
            ranges,
            timestamps: Vec::new(),
            ecn: None,
        })
    }

    /// Acknowledged ranges, highest first, as they appear on the wire
    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().rev()
    }
}

/// ECN counters carried by an ACK_ECN frame
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EcnCounts {
    /// Packets received with ECT(0)
    pub ect0: u64,
    /// Packets received with ECT(1)
    pub ect1: u64,
    /// Packets received with CE
    pub ce: u64,
}

/// Reason given by the transport or the application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    /// Error code; a transport error code unless `application` is set
    pub error_code: u64,
    /// Type of the frame that caused the close, if known
    pub frame_type: Option<FrameType>,
    /// Human-readable reason for the close
    pub reason: Bytes,
    /// Whether the code is defined by the application protocol
    pub application: bool,
}

/// Application stream data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    /// Stream the data belongs to
    pub id: StreamId,
    /// Offset of the first byte of `data`
    pub offset: u64,
    /// Whether this frame ends the stream
    pub fin: bool,
    /// Payload
    pub data: Bytes,
}

/// Handshake data at the encryption level of the carrying packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crypto {
    /// Offset of the first byte of `data`
    pub offset: u64,
    /// Payload
    pub data: Bytes,
}

/// Abrupt termination of a send stream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResetStream {
    /// Stream being reset
    pub id: StreamId,
    /// Application error code
    pub error_code: u64,
    /// Final size of the stream
    pub final_offset: u64,
}

/// A connection ID issued by the peer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NewConnectionId {
    /// Sequence number of this ID
    pub sequence: u64,
    /// IDs with a lower sequence number must be retired
    pub retire_prior_to: u64,
    /// The issued ID
    pub id: ConnectionId,
    /// Stateless reset token associated with `id`
    pub reset_token: [u8; 16],
}

/// Request to change the peer's acknowledgement behaviour
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AckFrequency {
    /// Monotonic sequence number of this request
    pub sequence: u64,
    /// Number of ack-eliciting packets that may be received before an ACK must be sent
    pub ack_eliciting_threshold: u64,
    /// Largest delay before an ACK must be sent
    pub request_max_ack_delay: Duration,
    /// Number of out-of-order packets tolerated before an immediate ACK
    pub reordering_threshold: u64,
}
