//! Connection statistics

use crate::{Duration, frame::Frame};

/// Statistics about UDP datagrams transmitted or received on a connection
#[derive(Default, Debug, Copy, Clone)]
#[non_exhaustive]
pub struct UdpStats {
    /// The amount of UDP datagrams observed
    pub datagrams: u64,
    /// The total amount of bytes which have been transferred inside UDP datagrams
    pub bytes: u64,
}

impl UdpStats {
    pub(super) fn on_datagram(&mut self, len: usize) {
        self.datagrams += 1;
        self.bytes += len as u64;
    }
}

/// Statistics about frames transmitted or received on a connection
#[derive(Default, Copy, Clone)]
#[non_exhaustive]
#[allow(missing_docs)]
pub struct FrameStats {
    pub acks: u64,
    pub close: u64,
    pub crypto: u64,
    pub handshake_done: u8,
    pub message: u64,
    pub new_connection_id: u64,
    pub path_challenge: u64,
    pub path_response: u64,
    pub ping: u64,
    pub reset_stream: u64,
    pub retire_connection_id: u64,
    pub stop_sending: u64,
    pub stream: u64,
    pub window_update: u64,
    pub blocked: u64,
}

impl FrameStats {
    pub(super) fn record(&mut self, frame: &Frame) {
        match frame {
            Frame::Ack(_) => self.acks += 1,
            Frame::Close(_) => self.close += 1,
            Frame::Crypto(_) => self.crypto += 1,
            Frame::HandshakeDone => self.handshake_done = self.handshake_done.saturating_add(1),
            Frame::Message(_) => self.message += 1,
            Frame::NewConnectionId(_) => self.new_connection_id += 1,
            Frame::PathChallenge(_) => self.path_challenge += 1,
            Frame::PathResponse(_) => self.path_response += 1,
            Frame::Ping => self.ping += 1,
            Frame::ResetStream(_) => self.reset_stream += 1,
            Frame::RetireConnectionId { .. } => self.retire_connection_id += 1,
            Frame::StopSending { .. } => self.stop_sending += 1,
            Frame::Stream(_) => self.stream += 1,
            Frame::MaxData(_) | Frame::MaxStreamData { .. } | Frame::MaxStreams { .. } => {
                self.window_update += 1
            }
            Frame::DataBlocked { .. }
            | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlocked { .. } => self.blocked += 1,
            _ => {}
        }
    }
}

impl std::fmt::Debug for FrameStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStats")
            .field("ACK", &self.acks)
            .field("CONNECTION_CLOSE", &self.close)
            .field("CRYPTO", &self.crypto)
            .field("HANDSHAKE_DONE", &self.handshake_done)
            .field("MESSAGE", &self.message)
            .field("NEW_CONNECTION_ID", &self.new_connection_id)
            .field("PATH_CHALLENGE", &self.path_challenge)
            .field("PATH_RESPONSE", &self.path_response)
            .field("PING", &self.ping)
            .field("RESET_STREAM", &self.reset_stream)
            .field("RETIRE_CONNECTION_ID", &self.retire_connection_id)
            .field("STOP_SENDING", &self.stop_sending)
            .field("STREAM", &self.stream)
            .field("WINDOW_UPDATE", &self.window_update)
            .field("BLOCKED", &self.blocked)
            .finish()
    }
}

/// Statistics related to the default path
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct PathStats {
    /// Current best estimate of this connection's latency (round-trip-time)
    pub rtt: Duration,
    /// Smallest RTT sample
    pub min_rtt: Duration,
    /// Current congestion window of the connection
    pub cwnd: u64,
    /// Bytes currently counted as in flight
    pub bytes_in_flight: u64,
    /// Largest packet length currently in use
    pub max_packet_length: u16,
}

/// Connection statistics
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// Statistics about UDP datagrams transmitted on a connection
    pub udp_tx: UdpStats,
    /// Statistics about UDP datagrams received on a connection
    pub udp_rx: UdpStats,
    /// Statistics about frames transmitted on a connection
    pub frame_tx: FrameStats,
    /// Statistics about frames received on a connection
    pub frame_rx: FrameStats,
    /// Statistics related to the current transmission path
    pub path: PathStats,
    /// Packets handed to the writer or buffered for it
    pub packets_sent: u64,
    /// Packets successfully opened and processed
    pub packets_received: u64,
    /// Packets carrying frames that were sent before
    pub packets_retransmitted: u64,
    /// Packets declared lost
    pub packets_lost: u64,
    /// Bytes in packets declared lost
    pub bytes_lost: u64,
    /// Packets dropped for an unknown connection ID, a disabled migration, or a bad header
    pub packets_dropped: u64,
    /// Packets dropped because their number was already processed
    pub duplicate_packets_dropped: u64,
    /// Packets that arrived before the keys to open them
    pub undecryptable_packets_received: u64,
    /// Packets whose authentication failed
    pub failed_authentication_packets: u64,
    /// ACK frames ignored because a newer one had been processed
    pub stale_acks: u64,
    /// Datagrams that carried more than one packet
    pub coalesced_datagrams_sent: u64,
    /// Times sending was held back by the anti-amplification limit
    pub amplification_throttling: u64,
    /// Times the path was reported as degrading
    pub path_degrading: u64,
    /// Peer migrations whose new address was validated
    pub validated_peer_migrations: u64,
    /// Peer migrations reverted after validation failed
    pub invalid_peer_migrations: u64,
    /// Probe timeouts
    pub pto_count: u64,
    /// Tail loss probes
    pub tlp_count: u64,
    /// Retransmission timeouts
    pub rto_count: u64,
    /// 1-RTT key updates, local and remote
    pub key_updates: u64,
    /// MTU probes sent
    pub mtu_probes_sent: u64,
    /// Connectivity probes received
    pub connectivity_probes_received: u64,
    /// Connectivity probes sent
    pub connectivity_probes_sent: u64,
}
