use std::{fmt, ops};

use bytes::Bytes;
use thiserror::Error;

use crate::{frame::Frame, shared::ConnectionId};

/// Key set protecting a packet
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    /// Keys derived from the client's first destination connection ID
    Initial = 0,
    /// Handshake keys
    Handshake = 1,
    /// Early data keys, only ever used by a client to send
    ZeroRtt = 2,
    /// 1-RTT keys
    ForwardSecure = 3,
}

impl EncryptionLevel {
    /// Every level, in ladder order
    pub const ALL: [Self; 4] = [
        Self::Initial,
        Self::Handshake,
        Self::ZeroRtt,
        Self::ForwardSecure,
    ];

    /// The packet number space packets at this level belong to
    pub fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::ZeroRtt | Self::ForwardSecure => SpaceId::Data,
        }
    }

    /// Whether packets at this level use the long header
    pub fn has_long_header(self) -> bool {
        self != Self::ForwardSecure
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Initial => "ENCRYPTION_INITIAL",
            Self::Handshake => "ENCRYPTION_HANDSHAKE",
            Self::ZeroRtt => "ENCRYPTION_ZERO_RTT",
            Self::ForwardSecure => "ENCRYPTION_FORWARD_SECURE",
        })
    }
}

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    /// Handshake packets
    Handshake = 1,
    /// Application data space, used for 0-RTT and post-handshake/1-RTT packets
    Data = 2,
}

impl SpaceId {
    /// Iterate all packet number spaces
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().cloned()
    }
}

impl<T> ops::Index<SpaceId> for [T; 3] {
    type Output = T;
    fn index(&self, space: SpaceId) -> &T {
        &self[space as usize]
    }
}

impl<T> ops::IndexMut<SpaceId> for [T; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut T {
        &mut self[space as usize]
    }
}

/// Header fields of a packet that the connection cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Level the packet is protected at
    pub level: EncryptionLevel,
    /// Destination connection ID
    pub dst_cid: ConnectionId,
    /// Source connection ID, present in long headers
    pub src_cid: Option<ConnectionId>,
    /// Full packet number
    pub number: u64,
    /// Key phase bit of short header packets
    pub key_phase: bool,
}

/// Receiver state the codec needs to recover packet numbers
#[derive(Debug, Copy, Clone, Default)]
pub struct DecodeContext {
    /// Largest packet number successfully processed in each space
    pub largest_received: [Option<u64>; 3],
}

/// Result of decoding the first packet in a datagram
#[derive(Debug)]
pub struct Decoded {
    /// The first packet, or why it could not be opened
    pub packet: Result<DecodedPacket, DecodeError>,
    /// Bytes of any further packets coalesced after the first
    pub remainder: Option<Bytes>,
}

/// A successfully authenticated and parsed packet
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    /// Header fields
    pub header: PacketHeader,
    /// Frames in wire order
    pub frames: Vec<Frame>,
    /// Bytes the packet occupied in the datagram
    pub size: usize,
}

/// Reasons a packet could not be opened
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The header parsed, but keys for its level are not installed (yet)
    #[error("keys for {level} are not available")]
    KeysUnavailable {
        /// Level of the packet
        level: EncryptionLevel,
        /// Copy of the packet bytes, for a later attempt
        packet: Bytes,
    },
    /// Keys were present but authentication failed
    #[error("failed to authenticate packet at {0}")]
    AuthenticationFailed(EncryptionLevel),
    /// The header could not be parsed; the rest of the datagram is garbage too
    #[error("malformed header: {0}")]
    Malformed(&'static str),
    /// The payload authenticated but a frame in it is invalid
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Level of the packet
        level: EncryptionLevel,
        /// Explanation
        reason: String,
    },
}

/// Reasons a packet could not be serialized
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// No keys are installed to protect packets at this level
    #[error("no encrypter for {0}")]
    NoEncrypter(EncryptionLevel),
    /// The frames do not fit the requested length
    #[error("packet too large: {needed} > {limit}")]
    TooLarge {
        /// Bytes required
        needed: usize,
        /// Bytes available
        limit: usize,
    },
}

/// The wire format and packet protection, as seen by a connection
///
/// The codec owns all packet protection keys. Whoever drives the TLS handshake installs keys into
/// the codec directly and then informs the connection through
/// [`Connection::on_decryption_keys_available`] or
/// [`Connection::on_encryption_keys_available`].
///
/// [`Connection::on_decryption_keys_available`]: crate::Connection::on_decryption_keys_available
/// [`Connection::on_encryption_keys_available`]: crate::Connection::on_encryption_keys_available
pub trait PacketCodec: Send {
    /// Decode and authenticate the first packet in `data`
    fn decode(&mut self, data: Bytes, ctx: &DecodeContext) -> Decoded;

    /// Serialize and protect a packet carrying `frames`, appending it to `buf`
    ///
    /// The packet is padded so that it occupies at least `min_size` bytes. Returns the number of
    /// bytes written.
    fn encode(
        &mut self,
        header: &PacketHeader,
        frames: &[Frame],
        min_size: usize,
        buf: &mut Vec<u8>,
    ) -> Result<usize, EncodeError>;

    /// Encoded size of `frame`
    fn frame_size(&self, frame: &Frame) -> usize;

    /// Bytes of header and authentication tag a packet at `level` will carry
    fn packet_overhead(&self, level: EncryptionLevel, dst_cid_len: usize) -> usize;

    /// Whether packets can be protected at `level`
    fn has_encrypter(&self, level: EncryptionLevel) -> bool;

    /// Whether packets at `level` can be opened
    fn has_decrypter(&self, level: EncryptionLevel) -> bool;

    /// Drop the keys of `level` in both directions
    fn remove_keys(&mut self, level: EncryptionLevel);

    /// Number of packets the current 1-RTT encrypter may protect
    fn confidentiality_limit(&self) -> u64;

    /// Number of forged packets the current decrypter tolerates
    fn integrity_limit(&self) -> u64;

    /// Switch to the next generation of 1-RTT keys, returning whether that was possible
    fn update_keys(&mut self) -> bool;

    /// Forget the 1-RTT keys of the previous key phase
    fn discard_previous_one_rtt_keys(&mut self);

    /// Wrap a client Initial packet in a legacy version handshake message
    ///
    /// Returns `None` if encapsulation is not supported, in which case the packet is written
    /// unchanged.
    fn encapsulate_legacy(&mut self, _packet: &[u8], _server_name: &str) -> Option<Vec<u8>> {
        None
    }
}
