//! State machine for a single QUIC connection
//!
//! quic-conn contains a fully deterministic implementation of the per-connection part of QUIC:
//! encryption level transitions, loss detection and retransmission scheduling, path validation
//! and peer migration, anti-amplification accounting, and coalescing of packets into datagrams.
//! It contains no networking code and does not read timestamps from the operating system.
//!
//! Everything outside of the connection core is consumed through traits:
//!
//! - [`PacketCodec`] turns datagrams into decoded frames and frames back into protected packets.
//! - [`PacketWriter`] hands finished datagrams to a socket.
//! - [`Visitor`] is notified of everything the session layer needs to know about.
//! - [`SendAlgorithm`] decides how much may be in flight.
//! - [`Clock`] provides the monotonic time used for every deadline.
//!
//! The most important type is [`Connection`], which owns all of the above and is driven by
//! [`Connection::process_udp_packet`], [`Connection::handle_timeout`] and the `send_*` family of
//! methods.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
// Fixes welcome:
#![allow(clippy::too_many_arguments)]

use std::{fmt, ops};

mod clock;
pub use crate::clock::{Clock, SystemClock};

mod config;
pub use crate::config::{
    AckDecimationConfig, BlackholeDetection, ConfigError, ConnectionConfig, IdleCloseBehavior,
    MigrationPolicy, MtuDiscoveryConfig, PingConfig, RetransmissionScheme,
};

mod congestion;
pub use crate::congestion::{ControllerFactory, FixedWindow, FixedWindowConfig, SendAlgorithm};

mod connection;
pub use crate::connection::{
    AckResult, CloseSource, ConnectionCloseBehavior, ConnectionError, ConnectionStats,
    ConsumedData, FrameStats, HandshakeState, KeyUpdateReason, PathStats, PathValidationDelegate,
    PathValidationOutcome, QuicErrorCode, RttEstimator, SendMessageError, UdpStats, Visitor,
};
pub use crate::connection::{AddressChange, Connection};

mod frame;
pub use crate::frame::{
    Ack, AckFrequency, Close, Crypto, FrameType, NewConnectionId, ResetStream, Stream,
};
pub use crate::frame::{EcnCounts, Frame};

mod packet;
pub use crate::packet::{
    DecodeContext, DecodeError, Decoded, DecodedPacket, EncodeError, EncryptionLevel,
    PacketCodec, PacketHeader, SpaceId,
};

mod range_set;
pub use crate::range_set::RangeSet;

mod shared;
pub use crate::shared::ConnectionId;

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};

mod writer;
pub use crate::writer::{PacketWriter, WriteResult};

#[cfg(test)]
mod tests;

pub(crate) use std::time::{Duration, Instant};

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// The two low bits encode the initiator and directionality, as on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Create a new StreamId
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self((index << 2) | ((dir as u64) << 1) | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    /// Whether `side` may ever send data on this stream
    pub fn is_sendable_by(self, side: Side) -> bool {
        self.dir() == Dir::Bi || self.initiator() == side
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(
            f,
            "{} {}directional stream {}",
            initiator,
            dir,
            self.index()
        )
    }
}

//
// Useful internal constants
//

/// The smallest datagram a client may use to carry an Initial packet
pub(crate) const MIN_INITIAL_SIZE: u16 = 1200;
/// Path MTU every QUIC path is assumed to support
pub(crate) const INITIAL_MTU: u16 = 1200;
/// Largest packet length we ever try to use
pub(crate) const MAX_UDP_PAYLOAD: u16 = 65527;
/// Granularity of loss detection and alarm deadlines
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Number of ACK-only packets sent in a row before one must elicit an acknowledgement
pub(crate) const MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS: u64 = 19;
