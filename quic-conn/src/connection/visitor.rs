use std::net::SocketAddr;

use bytes::Bytes;

use super::ConnectionError;
use crate::{
    Dir, EncryptionLevel, StreamId,
    frame::{Crypto, Frame, ResetStream, Stream},
};

/// The session layer, as seen by a connection
///
/// Methods are notifications of what the connection just did or received, plus a few queries.
/// The visitor is invoked while the connection is busy, so it must not expect to call back into
/// it; work such as writing more data is done by the owner once the current call returns.
#[allow(unused_variables)]
pub trait Visitor {
    /// The connection was closed; called exactly once
    fn on_connection_closed(&mut self, error: &ConnectionError);

    /// The writer became blocked; [`Connection::on_blocked_writer_can_write`] must be called
    /// once it is writable again
    ///
    /// [`Connection::on_blocked_writer_can_write`]: super::Connection::on_blocked_writer_can_write
    fn on_write_blocked(&mut self) {}

    /// The connection can accept more data from the session
    fn on_can_write(&mut self) {}

    /// STREAM frame received
    fn on_stream_frame(&mut self, frame: &Stream) {}

    /// CRYPTO frame received at `level`
    fn on_crypto_frame(&mut self, level: EncryptionLevel, frame: &Crypto) {}

    /// Unreliable message received
    fn on_message_received(&mut self, data: &Bytes) {}

    /// RESET_STREAM received
    fn on_reset_stream(&mut self, frame: &ResetStream) {}

    /// STOP_SENDING received
    fn on_stop_sending(&mut self, id: StreamId, error_code: u64) {}

    /// Flow control credit was raised for `id`, or for the connection if `None`
    fn on_window_update(&mut self, id: Option<StreamId>, offset: u64) {}

    /// The peer is blocked by flow control on `id`, or on the connection if `None`
    fn on_blocked(&mut self, id: Option<StreamId>, offset: u64) {}

    /// The peer raised the number of streams we may open
    fn on_max_streams(&mut self, dir: Dir, count: u64) {}

    /// The peer is blocked by the stream count limit
    fn on_streams_blocked(&mut self, dir: Dir, limit: u64) {}

    /// GOAWAY received
    fn on_go_away(&mut self, error_code: u64, last_good_stream: StreamId, reason: &Bytes) {}

    /// The server saw its peer move to a new address
    fn on_connection_migration(&mut self, change: AddressChange) {}

    /// No forward progress has been made for a while
    fn on_path_degrading(&mut self) {}

    /// An acknowledgement arrived after [`on_path_degrading`](Self::on_path_degrading)
    fn on_forward_progress_made_after_path_degrading(&mut self) {}

    /// The client received HANDSHAKE_DONE
    fn on_handshake_done_received(&mut self) {}

    /// 1-RTT keys were updated
    fn on_key_update(&mut self, reason: KeyUpdateReason) {}

    /// The server issued an address validation token
    fn on_new_token_received(&mut self, token: &Bytes) {}

    /// A run of ACK-only packets is about to be extended; supply a frame that makes the next
    /// one ack-eliciting, or `None` to have a PING bundled instead
    fn retransmittable_frame_for_ack(&mut self) -> Option<Frame> {
        None
    }

    /// Whether the session has data queued that it would write given the chance
    fn willing_and_able_to_write(&self) -> bool {
        false
    }

    /// Whether keep-alive pings should be sent, typically while streams are open
    fn should_keep_connection_alive(&self) -> bool {
        false
    }
}

/// Progress of the cryptographic handshake, as reported by the session layer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum HandshakeState {
    /// Nothing has been exchanged
    Start,
    /// The peer's first flight has been processed
    Processed,
    /// Both flights are complete and 1-RTT keys are installed
    Complete,
    /// The handshake is known to be complete at both endpoints
    Confirmed,
}

/// Why 1-RTT keys were updated
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KeyUpdateReason {
    /// The peer switched to the next key phase
    Remote,
    /// The confidentiality limit of the current keys is near
    LocalAeadConfidentialityLimit,
    /// Requested by the session layer
    LocalForTests,
}

/// How a peer address changed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddressChange {
    /// Same address
    NoChange,
    /// Only the port changed, typically a NAT rebinding
    PortChange,
    /// An IPv4 address within the same /24
    Ipv4SubnetChange,
    /// An unrelated IPv4 address
    Ipv4ToIpv4,
    /// IPv4 to IPv6
    Ipv4ToIpv6,
    /// IPv6 to IPv4
    Ipv6ToIpv4,
    /// An unrelated IPv6 address
    Ipv6ToIpv6,
}

impl AddressChange {
    /// Classify the change from `old` to `new`
    pub fn between(old: SocketAddr, new: SocketAddr) -> Self {
        if old == new {
            return Self::NoChange;
        }
        if old.ip() == new.ip() {
            return Self::PortChange;
        }
        match (old, new) {
            (SocketAddr::V4(a), SocketAddr::V4(b)) => {
                if a.ip().octets()[..3] == b.ip().octets()[..3] {
                    Self::Ipv4SubnetChange
                } else {
                    Self::Ipv4ToIpv4
                }
            }
            (SocketAddr::V4(_), SocketAddr::V6(_)) => Self::Ipv4ToIpv6,
            (SocketAddr::V6(_), SocketAddr::V4(_)) => Self::Ipv6ToIpv4,
            (SocketAddr::V6(_), SocketAddr::V6(_)) => Self::Ipv6ToIpv6,
        }
    }

    /// Whether the change looks like a NAT rebinding, which keeps the path's congestion state
    pub(super) fn is_rebinding(self) -> bool {
        matches!(self, Self::PortChange | Self::Ipv4SubnetChange)
    }
}

/// Amount of stream data a send call accepted
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ConsumedData {
    /// Bytes taken from the front of the data
    pub bytes_consumed: usize,
    /// Whether the FIN was sent as well
    pub fin_consumed: bool,
}
