use std::{collections::VecDeque, fmt, mem, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;
use tracing::{debug, error, trace, trace_span, warn};

use crate::{
    EncryptionLevel, Instant, MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS, MIN_INITIAL_SIZE,
    Side, SpaceId, StreamId,
    clock::Clock,
    config::{BlackholeDetection, ConnectionConfig, IdleCloseBehavior, MigrationPolicy},
    frame::{Ack, Close, Frame, NewConnectionId},
    packet::{DecodeContext, DecodeError, DecodedPacket, PacketCodec},
    shared::ConnectionId,
    writer::{PacketWriter, WriteResult},
};

mod cid;
use cid::CidState;

mod coalescer;
use coalescer::CoalescedPackets;

mod detectors;
use detectors::{BlackholeDetector, BlackholeEvent, IdleDetector, IdleEvent};

mod error;
pub use error::{CloseSource, ConnectionCloseBehavior, ConnectionError, QuicErrorCode};

mod keys;
use keys::{AeadLimit, KeyPhase};

mod mtud;
use mtud::MtuDiscoverer;

mod pacing;

mod packet_creator;
use packet_creator::{PacketCreator, PendingPacket};

mod path_validator;
use path_validator::{Finished, PathValidator, RetryOutcome, ValidationReason};
pub use path_validator::{PathValidationDelegate, PathValidationOutcome};

mod paths;
use paths::{PathResponses, PathState, SavedPathState};
pub use paths::RttEstimator;

mod ping;
use ping::PingManager;

mod received;
use received::ReceivedPacketManager;

mod recovery;
pub use recovery::AckResult;
use recovery::{RetransmissionMode, SentPacket, SentPacketTracker, TransmissionType};

mod stats;
pub use stats::{ConnectionStats, FrameStats, PathStats, UdpStats};

mod timer;
pub(crate) use timer::Timer;
use timer::TimerTable;

mod visitor;
pub use visitor::{AddressChange, ConsumedData, HandshakeState, KeyUpdateReason, Visitor};

/// Protocol state and logic for a single QUIC connection
///
/// Objects of this type receive datagrams through [`process_udp_packet`] and emit datagrams
/// through the [`PacketWriter`] they were built with. Deadlines are exposed through
/// [`poll_timeout`] and must be driven with [`handle_timeout`]. Everything the session layer
/// needs to act on is reported to the [`Visitor`].
///
/// Connections are closed exactly once, whether locally through [`close_connection`], by the
/// peer, or by one of the internal timeouts; [`Visitor::on_connection_closed`] reports it.
///
/// [`process_udp_packet`]: Self::process_udp_packet
/// [`poll_timeout`]: Self::poll_timeout
/// [`handle_timeout`]: Self::handle_timeout
/// [`close_connection`]: Self::close_connection
pub struct Connection {
    config: Arc<ConnectionConfig>,
    side: Side,
    codec: Box<dyn PacketCodec>,
    writer: Box<dyn PacketWriter>,
    visitor: Box<dyn Visitor>,
    clock: Box<dyn Clock>,
    rng: StdRng,
    /// Cleared once the connection is torn down
    connected: bool,
    /// Set while the CONNECTION_CLOSE packets of a local close are being sent
    closing: bool,
    close_error: Option<ConnectionError>,
    handshake_state: HandshakeState,
    /// Level new frames are sent at outside of
    /// [`with_encryption_level`](Self::with_encryption_level)
    default_level: EncryptionLevel,
    /// Whether the connection ID the peer chose was taken from a long header
    remote_cid_learned: bool,

    /// The path all packets are sent on
    path: PathState,
    /// A path other than `path` that is being validated
    alternative_path: Option<PathState>,
    /// The last validated default path, kept while a peer migration is validated
    previous_path: Option<PathState>,
    active_migration: Option<ActiveMigration>,

    cids: CidState,
    tracker: SentPacketTracker,
    receiver: ReceivedPacketManager,
    creator: PacketCreator,
    coalescer: CoalescedPackets,
    timers: TimerTable,
    path_validator: PathValidator,
    path_responses: PathResponses,
    mtud: MtuDiscoverer,
    pings: PingManager,
    blackhole: BlackholeDetector,
    idle: IdleDetector,
    keys: KeyPhase,

    /// Packets that arrived before their keys, in arrival order
    undecryptable: VecDeque<UndecryptablePacket>,
    /// Datagrams refused by a blocked writer, in the order they must go out
    buffered: VecDeque<BufferedDatagram>,
    /// Internally generated control frames, sent at 1-RTT
    pending_control: VecDeque<Frame>,
    retransmissions: VecDeque<Retransmission>,
    /// Transmission type of packets sent because the retransmission timer fired
    probe_transmission: TransmissionType,

    flusher_depth: u32,
    /// ACK-only packets sent since the last ack-eliciting one
    consecutive_non_retransmittable: u64,
    /// Number of the latest packet in each space whose ACK frame was processed
    largest_packet_with_ack: [Option<u64>; 3],
    path_degrading: bool,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection whose first packets go from `local` to `remote`
    ///
    /// `local_cid` is the ID the peer addresses packets to; `remote_cid` is the ID packets are
    /// sent to until the peer's choice is learned. A client's path counts as validated from the
    /// start; a server's path is subject to the anti-amplification limit until the client proves
    /// it owns its address.
    pub fn new(
        config: Arc<ConnectionConfig>,
        side: Side,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
        codec: Box<dyn PacketCodec>,
        writer: Box<dyn PacketWriter>,
        visitor: Box<dyn Visitor>,
        clock: Box<dyn Clock>,
        rng_seed: [u8; 32],
    ) -> Self {
        let now = clock.now();
        let max_packet_length = config.max_packet_length;
        let send_algorithm = config
            .congestion_controller_factory
            .clone()
            .build(now, max_packet_length);
        let tracker = SentPacketTracker::new(
            &config,
            send_algorithm,
            side.is_client(),
            max_packet_length,
            now,
        );
        let idle = IdleDetector::new(config.handshake_timeout, config.idle_timeout, now);
        let mut timers = TimerTable::default();
        timers.update(Timer::IdleNetwork, idle.deadline());

        Self {
            side,
            codec,
            writer,
            visitor,
            clock,
            rng: StdRng::from_seed(rng_seed),
            connected: true,
            closing: false,
            close_error: None,
            handshake_state: HandshakeState::Start,
            default_level: EncryptionLevel::Initial,
            remote_cid_learned: false,

            path: PathState::new(local, remote, remote_cid, side.is_client()),
            alternative_path: None,
            previous_path: None,
            active_migration: None,

            cids: CidState::new(local_cid, remote_cid, config.active_connection_id_limit),
            tracker,
            receiver: ReceivedPacketManager::new(
                config.ack_decimation.clone(),
                config.max_ack_delay,
            ),
            creator: PacketCreator::new(max_packet_length, remote_cid, local_cid),
            coalescer: CoalescedPackets::default(),
            timers,
            path_validator: PathValidator::default(),
            path_responses: PathResponses::default(),
            mtud: MtuDiscoverer::disabled(),
            pings: PingManager::new(&config.ping, side),
            blackhole: BlackholeDetector::default(),
            idle,
            keys: KeyPhase::default(),

            undecryptable: VecDeque::new(),
            buffered: VecDeque::new(),
            pending_control: VecDeque::new(),
            retransmissions: VecDeque::new(),
            probe_transmission: TransmissionType::Pto,

            flusher_depth: 0,
            consecutive_non_retransmittable: 0,
            largest_packet_with_ack: [None; 3],
            path_degrading: false,
            stats: ConnectionStats::default(),
            config,
        }
    }

    //
    // Accessors
    //

    /// Whether this is the client or the server
    pub fn side(&self) -> Side {
        self.side
    }

    /// Whether the connection has not been closed yet
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Why the connection was closed, once it is
    pub fn close_error(&self) -> Option<&ConnectionError> {
        self.close_error.as_ref()
    }

    /// Progress of the handshake as reported through
    /// [`set_handshake_state`](Self::set_handshake_state)
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake_state
    }

    /// The level frames are sent at by default
    pub fn encryption_level(&self) -> EncryptionLevel {
        self.default_level
    }

    /// Local address of the default path
    pub fn local_address(&self) -> SocketAddr {
        self.path.local
    }

    /// The peer's address on the default path
    pub fn peer_address(&self) -> SocketAddr {
        self.path.remote
    }

    /// Whether the peer is known to own its address on the default path
    pub fn is_peer_address_validated(&self) -> bool {
        self.path.validated
    }

    /// The connection ID the peer addresses packets to
    pub fn local_cid(&self) -> ConnectionId {
        self.cids.local()
    }

    /// The connection ID packets are addressed to
    pub fn remote_cid(&self) -> ConnectionId {
        self.creator.destination_cid()
    }

    /// Largest packet length currently used
    pub fn max_packet_length(&self) -> u16 {
        self.creator.max_packet_length()
    }

    /// Current best RTT estimate
    pub fn rtt(&self) -> crate::Duration {
        self.tracker.rtt().get()
    }

    /// Whether the path was reported degrading and has made no progress since
    pub fn is_path_degrading(&self) -> bool {
        self.path_degrading
    }

    /// Connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats;
        let rtt = self.tracker.rtt();
        stats.path = PathStats {
            rtt: rtt.get(),
            min_rtt: rtt.min(),
            cwnd: self.tracker.congestion_window(),
            bytes_in_flight: self.tracker.bytes_in_flight(),
            max_packet_length: self.creator.max_packet_length(),
        };
        stats
    }

    /// The peer's `max_ack_delay` transport parameter
    pub fn set_peer_max_ack_delay(&mut self, value: crate::Duration) {
        self.tracker.set_peer_max_ack_delay(value);
    }

    //
    // Scopes
    //

    /// Run `f` with packet flushing deferred
    ///
    /// Frames added inside `f` accumulate into as few packets and datagrams as possible. When the
    /// outermost scope ends, open packets are sent, the coalesced datagram is written, and every
    /// alarm is re-armed from the resulting state.
    pub fn with_packet_flusher<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.flusher_depth += 1;
        let result = f(self);
        self.flusher_depth -= 1;
        if self.flusher_depth == 0 {
            self.on_flusher_exit();
        }
        result
    }

    /// Run `f` with frames sent at `level`, restoring the previous level afterwards
    pub fn with_encryption_level<R>(
        &mut self,
        level: EncryptionLevel,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let previous = self.creator.level();
        self.creator.set_encryption_level(level);
        let result = f(self);
        self.dispatch_finished_packets();
        self.creator.set_encryption_level(previous);
        result
    }

    fn on_flusher_exit(&mut self) {
        if !self.connected {
            return;
        }
        self.flush_packets();
        self.creator
            .set_transmission_type(TransmissionType::NotRetransmission);
        if self.connected && self.writer.is_batch_mode() {
            let result = self.writer.flush();
            self.handle_flush_result(result);
        }
        if self.connected {
            self.rearm_timers();
        }
    }

    fn rearm_timers(&mut self) {
        let now = self.clock.approximate_now();
        self.timers
            .update(Timer::Ack, self.receiver.earliest_ack_timeout());
        self.timers
            .update(Timer::Retransmission, self.tracker.retransmission_deadline());
        self.timers.update(Timer::IdleNetwork, self.idle.deadline());
        self.timers
            .update(Timer::NetworkBlackhole, self.blackhole.deadline());
        let keep_alive = self.handshake_state >= HandshakeState::Complete
            && self.visitor.should_keep_connection_alive();
        let ping = self
            .pings
            .set_alarm(now, keep_alive, self.tracker.has_in_flight_packets());
        self.timers.update(Timer::Ping, ping);
    }

    //
    // Timers
    //

    /// The earliest deadline at which [`handle_timeout`](Self::handle_timeout) must be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Process every alarm that expired at or before `now`
    ///
    /// Alarms re-armed to a deadline that already passed run on the next call.
    pub fn handle_timeout(&mut self, now: Instant) {
        for &timer in &Timer::VALUES {
            if !self.connected {
                return;
            }
            if !self.timers.is_expired(timer, now) {
                continue;
            }
            trace!(?timer, "timeout");
            match timer {
                Timer::Ack => self.on_ack_timeout(now),
                Timer::Retransmission => self.on_retransmission_timeout(now),
                Timer::Send => self.on_send_alarm(now),
                Timer::Ping => self.on_ping_timeout(now),
                Timer::MtuDiscovery => self.on_mtu_discovery_timeout(now),
                Timer::ProcessUndecryptable => self.on_process_undecryptable_timeout(now),
                Timer::DiscardPreviousOneRttKeys => self.on_discard_previous_keys_timeout(now),
                Timer::DiscardZeroRttKeys => self.on_discard_zero_rtt_keys_timeout(now),
                Timer::IdleNetwork => self.on_idle_timeout(now),
                Timer::NetworkBlackhole => self.on_blackhole_timeout(now),
                Timer::PathValidation => self.on_path_validation_timeout(now),
            }
        }
    }

    /// Send the ACKs whose delay expired
    pub fn on_ack_timeout(&mut self, now: Instant) {
        self.timers.stop(Timer::Ack);
        if !self.connected {
            return;
        }
        self.with_packet_flusher(|conn| conn.send_pending_acks(now, true));
    }

    /// Run loss detection, or send probes if nothing was found lost
    pub fn on_retransmission_timeout(&mut self, now: Instant) {
        self.timers.stop(Timer::Retransmission);
        if !self.connected {
            return;
        }
        self.with_packet_flusher(|conn| {
            // Queued packets must be numbered before a number can be skipped
            conn.flush_packets();
            let outcome = conn.tracker.on_retransmission_timeout(now);
            conn.probe_transmission = match outcome.mode {
                RetransmissionMode::Handshake => TransmissionType::Handshake,
                RetransmissionMode::Loss => TransmissionType::Loss,
                RetransmissionMode::Tlp => TransmissionType::Tlp,
                RetransmissionMode::Rto => TransmissionType::Rto,
                RetransmissionMode::Pto => TransmissionType::Pto,
            };
            match outcome.mode {
                RetransmissionMode::Tlp => conn.stats.tlp_count += 1,
                RetransmissionMode::Rto => conn.stats.rto_count += 1,
                RetransmissionMode::Pto => conn.stats.pto_count += 1,
                RetransmissionMode::Handshake | RetransmissionMode::Loss => {}
            }
            conn.on_packets_lost(outcome.lost);
            for (level, frames, transmission) in outcome.retransmit {
                conn.retransmissions.push_back(Retransmission {
                    level,
                    frames,
                    transmission,
                });
            }
            if outcome.mode == RetransmissionMode::Pto {
                let space = conn.tracker.earliest_pto_space().unwrap_or(SpaceId::Data);
                let skipped = conn.creator.skip_packet_number(&*conn.codec, space);
                conn.tracker.on_packet_number_skipped(space, skipped);
            }
            if !conn.tracker.has_in_flight_packets() {
                // Quiescent
                conn.blackhole.stop(false);
                conn.timers.stop(Timer::NetworkBlackhole);
            }
            conn.write_pending();
        });
    }

    fn on_send_alarm(&mut self, _now: Instant) {
        self.timers.stop(Timer::Send);
        self.on_can_write();
    }

    fn on_ping_timeout(&mut self, now: Instant) {
        self.timers.stop(Timer::Ping);
        if !self.connected {
            return;
        }
        self.with_packet_flusher(|conn| {
            if conn.pings.on_alarm(now) {
                conn.send_ping();
            }
        });
    }

    fn on_mtu_discovery_timeout(&mut self, _now: Instant) {
        self.timers.stop(Timer::MtuDiscovery);
        if !self.connected || !self.path.validated {
            return;
        }
        let largest_sent = self.tracker.largest_sent(SpaceId::Data).unwrap_or(0);
        let Some(length) = self.mtud.probe_length() else {
            return;
        };
        if !self.mtud.should_probe(largest_sent)
            || !self.codec.has_encrypter(EncryptionLevel::ForwardSecure)
            || !self.can_write(true)
        {
            return;
        }
        self.with_packet_flusher(|conn| {
            conn.flush_packets();
            trace!(length, "sending MTU probe");
            let probe = conn.creator.serialize_standalone(
                &*conn.codec,
                EncryptionLevel::ForwardSecure,
                vec![Frame::Ping],
                Some(usize::from(length)),
                true,
            );
            let (local, remote) = (conn.path.local, conn.path.remote);
            conn.write_packets(local, remote, vec![probe], false);
        });
    }

    fn on_process_undecryptable_timeout(&mut self, now: Instant) {
        self.timers.stop(Timer::ProcessUndecryptable);
        if !self.connected {
            return;
        }
        self.with_packet_flusher(|conn| {
            conn.process_undecryptable_packets(now);
            conn.maybe_send_in_response_to_packet(now);
        });
    }

    fn on_discard_previous_keys_timeout(&mut self, _now: Instant) {
        self.timers.stop(Timer::DiscardPreviousOneRttKeys);
        if !self.connected {
            return;
        }
        debug!("discarding 1-RTT keys of the previous key phase");
        self.codec.discard_previous_one_rtt_keys();
        self.keys.on_previous_keys_discarded();
    }

    fn on_discard_zero_rtt_keys_timeout(&mut self, _now: Instant) {
        self.timers.stop(Timer::DiscardZeroRttKeys);
        if !self.connected {
            return;
        }
        debug!("discarding 0-RTT keys");
        self.codec.remove_keys(EncryptionLevel::ZeroRtt);
    }

    fn on_idle_timeout(&mut self, now: Instant) {
        self.timers.stop(Timer::IdleNetwork);
        if !self.connected {
            return;
        }
        match self.idle.on_alarm(now) {
            Some(IdleEvent::HandshakeTimeout) => {
                let timeout = self.config.handshake_timeout;
                self.close_connection(
                    QuicErrorCode::HandshakeTimeout,
                    format!("Handshake timeout expired after {timeout:?}."),
                    ConnectionCloseBehavior::SendConnectionClosePacket,
                );
            }
            Some(IdleEvent::IdleTimeout) => {
                let timeout = self.config.idle_timeout;
                let behavior = match self.config.idle_close_behavior {
                    IdleCloseBehavior::Silent => ConnectionCloseBehavior::SilentClose,
                    IdleCloseBehavior::SendConnectionClose => {
                        ConnectionCloseBehavior::SendConnectionClosePacket
                    }
                };
                self.close_connection(
                    QuicErrorCode::NetworkIdleTimeout,
                    format!("No recent network activity after {timeout:?}."),
                    behavior,
                );
            }
            None => self.timers.update(Timer::IdleNetwork, self.idle.deadline()),
        }
    }

    fn on_blackhole_timeout(&mut self, now: Instant) {
        self.timers.stop(Timer::NetworkBlackhole);
        if !self.connected {
            return;
        }
        while let Some(event) = self.blackhole.on_alarm(now) {
            match event {
                BlackholeEvent::PathDegrading => {
                    if !self.path_degrading {
                        debug!("path degrading");
                        self.path_degrading = true;
                        self.stats.path_degrading += 1;
                        self.visitor.on_path_degrading();
                    }
                }
                BlackholeEvent::MtuReduction => {
                    if let Some(length) = self.mtud.take_prev_validated() {
                        debug!(length, "reverting packet length after losses");
                        self.mtud.disable();
                        self.set_max_packet_length(length);
                    }
                }
                BlackholeEvent::Blackhole => {
                    self.close_connection(
                        QuicErrorCode::TooManyRtos,
                        "Network blackhole detected",
                        ConnectionCloseBehavior::SendConnectionClosePacket,
                    );
                    return;
                }
            }
        }
        self.timers
            .update(Timer::NetworkBlackhole, self.blackhole.deadline());
    }

    fn on_path_validation_timeout(&mut self, now: Instant) {
        self.timers.stop(Timer::PathValidation);
        if !self.connected {
            return;
        }
        match self.path_validator.on_retry_timeout(&mut self.rng) {
            RetryOutcome::Retry(challenge) => {
                let Some((local, remote)) = self.path_validator.path() else {
                    return;
                };
                self.with_packet_flusher(|conn| conn.send_path_challenge(challenge, local, remote));
                let timeout = self.path_validation_timeout(remote);
                self.timers.set(Timer::PathValidation, now + timeout);
            }
            RetryOutcome::Failed(finished) => {
                self.with_packet_flusher(|conn| conn.on_validation_finished(finished));
            }
            RetryOutcome::Idle => {}
        }
    }

    //
    // Receiving
    //

    /// Process a datagram received on the path from `remote` to `local`
    ///
    /// The datagram may hold several coalesced packets. Packets whose keys are not available
    /// yet are kept for a later attempt; see
    /// [`on_decryption_keys_available`](Self::on_decryption_keys_available).
    pub fn process_udp_packet(&mut self, local: SocketAddr, remote: SocketAddr, data: Bytes) {
        if !self.connected {
            return;
        }
        let now = self.clock.approximate_now();
        let len = data.len();
        self.stats.udp_rx.on_datagram(len);
        if let Some(path) = self.path_to_mut(remote) {
            path.on_datagram_received(len);
        }
        trace!(%remote, len, "datagram received");
        self.with_packet_flusher(|conn| {
            conn.process_datagram(local, remote, data, len, now, false);
            if conn.timers.is_set(Timer::ProcessUndecryptable) {
                conn.timers.stop(Timer::ProcessUndecryptable);
                conn.process_undecryptable_packets(now);
            }
            conn.maybe_send_in_response_to_packet(now);
        });
    }

    fn process_datagram(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        data: Bytes,
        datagram_len: usize,
        now: Instant,
        retry: bool,
    ) {
        let mut remaining = Some(data);
        while let Some(data) = remaining.take() {
            if !self.connected {
                return;
            }
            let ctx = DecodeContext {
                largest_received: self.receiver.largest_received(),
            };
            let decoded = self.codec.decode(data, &ctx);
            remaining = decoded.remainder;
            match decoded.packet {
                Ok(packet) => self.process_packet(local, remote, datagram_len, packet, now),
                Err(e) => self.on_decode_error(e, local, remote, retry),
            }
        }
    }

    fn on_decode_error(
        &mut self,
        error: DecodeError,
        local: SocketAddr,
        remote: SocketAddr,
        retry: bool,
    ) {
        match error {
            DecodeError::KeysUnavailable { level, packet } => {
                if !retry {
                    self.stats.undecryptable_packets_received += 1;
                }
                if level == EncryptionLevel::Initial
                    || self.handshake_state >= HandshakeState::Complete
                    || self.undecryptable.len() >= self.config.max_undecryptable_packets
                {
                    trace!(%level, "dropping undecryptable packet");
                    return;
                }
                trace!(%level, len = packet.len(), "queueing undecryptable packet");
                self.undecryptable.push_back(UndecryptablePacket {
                    level,
                    data: packet,
                    local,
                    remote,
                });
            }
            DecodeError::AuthenticationFailed(level) => {
                self.stats.failed_authentication_packets += 1;
                debug!(%level, "packet failed authentication");
                if level == EncryptionLevel::ForwardSecure
                    && self.keys.on_authentication_failed(self.codec.integrity_limit())
                {
                    self.close_connection(
                        QuicErrorCode::AeadLimitReached,
                        "Integrity limit reached.",
                        ConnectionCloseBehavior::SendConnectionClosePacket,
                    );
                }
            }
            DecodeError::Malformed(reason) => {
                self.stats.packets_dropped += 1;
                debug!(reason, "dropping malformed packet");
            }
            DecodeError::InvalidFrame { level, reason } => {
                debug!(%level, %reason, "invalid frame");
                self.close_connection(
                    QuicErrorCode::InvalidFrameData,
                    reason,
                    ConnectionCloseBehavior::SendConnectionClosePacket,
                );
            }
        }
    }

    fn process_packet(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        datagram_len: usize,
        packet: DecodedPacket,
        now: Instant,
    ) {
        let DecodedPacket {
            header,
            frames,
            size,
        } = packet;
        let level = header.level;
        let space = level.space();
        let number = header.number;
        let span = trace_span!("recv", ?space, pn = number);
        let _guard = span.enter();

        if !self.cids.is_local(&header.dst_cid) {
            self.stats.packets_dropped += 1;
            debug!(cid = %header.dst_cid, "dropping packet for unknown connection ID");
            return;
        }
        if !self.receiver.is_awaiting_packet(space, number) {
            self.stats.duplicate_packets_dropped += 1;
            trace!("dropping duplicate packet");
            return;
        }
        let is_largest = self
            .receiver
            .largest_observed(space)
            .map_or(true, |largest| number > largest);

        if let Some(src_cid) = header.src_cid.filter(|_| !self.remote_cid_learned) {
            self.remote_cid_learned = true;
            if src_cid != self.cids.remote() {
                debug!(cid = %src_cid, "peer connection ID learned");
                self.cids.set_remote(src_cid);
                self.path.remote_cid = src_cid;
                self.creator.set_destination_cid(src_cid);
            }
        }

        if self.side.is_client() && is_largest && remote != self.path.remote {
            debug!(from = %self.path.remote, to = %remote, "server address changed");
            self.path.remote = remote;
        }

        if level == EncryptionLevel::ForwardSecure {
            if self.keys.is_remote_update(header.key_phase, number)
                && !self.on_remote_key_update()
            {
                return;
            }
            self.keys.on_packet_received(header.key_phase, number);
        }

        if self.side.is_server() && level == EncryptionLevel::Handshake {
            if !self.path.validated {
                debug!("client address validated by a handshake packet");
                self.path.mark_validated();
            }
            if self.codec.has_encrypter(EncryptionLevel::Initial)
                || self.codec.has_decrypter(EncryptionLevel::Initial)
            {
                self.discard_keys(EncryptionLevel::Initial);
            }
        }
        if self.side.is_server()
            && level == EncryptionLevel::ForwardSecure
            && self.codec.has_decrypter(EncryptionLevel::ZeroRtt)
            && !self.timers.is_set(Timer::DiscardZeroRttKeys)
        {
            let deadline = now + 3 * self.tracker.pto_delay(SpaceId::Data);
            self.timers.set(Timer::DiscardZeroRttKeys, deadline);
        }

        let probing = self.is_probing_packet(&frames);
        let address_changed = match self.side {
            Side::Server => remote != self.path.remote,
            Side::Client => local != self.path.local,
        };
        let migrating = self.side.is_server()
            && level == EncryptionLevel::ForwardSecure
            && address_changed
            && !probing
            && is_largest;
        if migrating && self.config.peer_migration == MigrationPolicy::Disabled {
            self.stats.packets_dropped += 1;
            debug!(%remote, "dropping packet from new peer address; migration is disabled");
            return;
        }

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let retransmittable = frames.iter().any(Frame::is_retransmittable);
        let incoming = IncomingPacket {
            level,
            number,
            local,
            remote,
            dst_cid: header.dst_cid,
        };
        for frame in frames {
            self.stats.frame_rx.record(&frame);
            if !self.process_frame(&incoming, frame, now) || !self.connected {
                return;
            }
        }

        self.receiver.record_packet_received(
            space,
            number,
            now,
            ack_eliciting,
            self.tracker.rtt().min(),
        );
        self.stats.packets_received += 1;
        self.idle.on_packet_received(now);
        if retransmittable {
            self.pings.reset_consecutive_retransmittable_on_wire_count();
        }
        trace!(size, ack_eliciting, "packet processed");

        if migrating {
            self.start_effective_peer_migration(local, remote, datagram_len, now);
        } else if probing && address_changed && level == EncryptionLevel::ForwardSecure {
            self.on_connectivity_probe_received(local, remote, datagram_len, now);
        }
    }

    /// Whether a packet made of `frames` only probes a path
    fn is_probing_packet(&self, frames: &[Frame]) -> bool {
        if self.config.ietf_frames {
            return !frames.is_empty() && frames.iter().all(Frame::is_probing);
        }
        match frames.split_first() {
            Some((Frame::Ping, rest)) => {
                !rest.is_empty() && rest.iter().all(|f| matches!(f, Frame::Padding(_)))
            }
            _ => false,
        }
    }

    /// Handle one frame, returning false if processing of the packet must stop
    fn process_frame(&mut self, packet: &IncomingPacket, frame: Frame, now: Instant) -> bool {
        let level = packet.level;
        let unprotected = matches!(
            level,
            EncryptionLevel::Initial | EncryptionLevel::Handshake
        );
        trace!(ty = %frame.ty(), "got frame");
        match frame {
            Frame::Padding(_) | Frame::Ping => {}
            Frame::Ack(ack) => return self.on_ack_frame(packet, ack, now),
            Frame::Crypto(crypto) => self.visitor.on_crypto_frame(level, &crypto),
            Frame::Stream(stream) => {
                if unprotected {
                    return self.close_on_frame(
                        QuicErrorCode::UnencryptedStreamData,
                        format!("Unencrypted stream data seen at {level}."),
                    );
                }
                if !stream.id.is_sendable_by(!self.side) {
                    return self.close_on_frame(
                        QuicErrorCode::InvalidStreamId,
                        format!(
                            "Received STREAM frame for {}, which the peer cannot send on.",
                            stream.id
                        ),
                    );
                }
                self.visitor.on_stream_frame(&stream);
            }
            Frame::ResetStream(frame) => {
                if unprotected {
                    return self.close_on_frame(
                        QuicErrorCode::UnencryptedStreamData,
                        format!("RESET_STREAM frame received at {level}."),
                    );
                }
                if !frame.id.is_sendable_by(!self.side) {
                    return self.close_on_frame(
                        QuicErrorCode::InvalidStreamId,
                        format!(
                            "Received RESET_STREAM for {}, which the peer cannot send on.",
                            frame.id
                        ),
                    );
                }
                self.visitor.on_reset_stream(&frame);
            }
            Frame::StopSending { id, error_code } => {
                if !id.is_sendable_by(self.side) {
                    return self.close_on_frame(
                        QuicErrorCode::InvalidStreamId,
                        format!("Received STOP_SENDING for {id}, which we cannot send on."),
                    );
                }
                self.visitor.on_stop_sending(id, error_code);
            }
            Frame::NewToken { token } => {
                if self.side.is_server() {
                    return self.close_on_frame(
                        QuicErrorCode::ProtocolViolation,
                        "Server received new token frame.",
                    );
                }
                self.visitor.on_new_token_received(&token);
            }
            Frame::MaxData(offset) => self.visitor.on_window_update(None, offset),
            Frame::MaxStreamData { id, offset } => {
                if !id.is_sendable_by(self.side) {
                    return self.close_on_frame(
                        QuicErrorCode::InvalidStreamId,
                        format!("Received MAX_STREAM_DATA for {id}, which we cannot send on."),
                    );
                }
                self.visitor.on_window_update(Some(id), offset);
            }
            Frame::MaxStreams { dir, count } => self.visitor.on_max_streams(dir, count),
            Frame::DataBlocked { offset } => self.visitor.on_blocked(None, offset),
            Frame::StreamDataBlocked { id, offset } => {
                if !id.is_sendable_by(!self.side) {
                    return self.close_on_frame(
                        QuicErrorCode::InvalidStreamId,
                        format!(
                            "Received STREAM_DATA_BLOCKED for {id}, which the peer cannot send on."
                        ),
                    );
                }
                self.visitor.on_blocked(Some(id), offset);
            }
            Frame::StreamsBlocked { dir, limit } => self.visitor.on_streams_blocked(dir, limit),
            Frame::NewConnectionId(frame) => {
                if let Err(e) = self.cids.on_new_connection_id(&frame) {
                    return self.close_on_frame(e.code, e.reason);
                }
                self.on_remote_cids_changed();
            }
            Frame::RetireConnectionId { sequence } => {
                if let Err(e) = self.cids.on_retire_connection_id(sequence, &packet.dst_cid) {
                    return self.close_on_frame(e.code, e.reason);
                }
            }
            Frame::PathChallenge(token) => {
                self.path_responses
                    .push(packet.number, token, packet.remote);
            }
            Frame::PathResponse(token) => self.on_path_response(token, packet.local),
            Frame::Close(close) => {
                self.on_connection_close_frame(close);
                return false;
            }
            Frame::Message(data) => self.visitor.on_message_received(&data),
            Frame::HandshakeDone => {
                if self.side.is_server() {
                    return self.close_on_frame(
                        QuicErrorCode::ProtocolViolation,
                        "Server received handshake done frame.",
                    );
                }
                if self.handshake_state < HandshakeState::Confirmed {
                    self.visitor.on_handshake_done_received();
                    self.set_handshake_state(HandshakeState::Confirmed);
                }
            }
            Frame::AckFrequency(frame) => {
                if !self.receiver.set_peer_ack_frequency(frame) {
                    trace!("ignoring stale ACK_FREQUENCY");
                }
            }
            Frame::StopWaiting { least_unacked } => {
                if least_unacked > packet.number {
                    return self.close_on_frame(
                        QuicErrorCode::InvalidStopWaitingData,
                        format!(
                            "Invalid least_unacked {least_unacked} beyond packet number {}.",
                            packet.number
                        ),
                    );
                }
                self.receiver
                    .dont_wait_for_packets_before(level.space(), least_unacked);
            }
            Frame::GoAway {
                error_code,
                last_good_stream,
                reason,
            } => self.visitor.on_go_away(error_code, last_good_stream, &reason),
        }
        true
    }

    fn close_on_frame(&mut self, code: QuicErrorCode, details: impl Into<String>) -> bool {
        self.close_connection(
            code,
            details,
            ConnectionCloseBehavior::SendConnectionClosePacket,
        );
        false
    }

    fn on_ack_frame(&mut self, packet: &IncomingPacket, ack: Ack, now: Instant) -> bool {
        let space = packet.level.space();
        if self.tracker.ack_in_progress() {
            return self.close_on_frame(
                QuicErrorCode::InvalidAckData,
                "Received a new ACK while processing another.",
            );
        }
        if self.largest_packet_with_ack[space].is_some_and(|largest| packet.number <= largest) {
            self.stats.stale_acks += 1;
            trace!("ignoring stale ACK");
            return true;
        }
        if self
            .tracker
            .largest_sent(space)
            .map_or(true, |largest| ack.largest > largest)
        {
            warn!(largest = ack.largest, "peer acknowledged a packet that was never sent");
            return self.close_on_frame(QuicErrorCode::InvalidAckData, "Largest observed too high.");
        }

        self.tracker.on_ack_frame_start(space, ack.largest, ack.delay);
        for range in ack.iter() {
            self.tracker.on_ack_range(range);
        }
        for &(number, timestamp) in &ack.timestamps {
            self.tracker.on_ack_timestamp(number, timestamp);
        }
        let outcome = self.tracker.on_ack_frame_end(now);
        self.largest_packet_with_ack[space] = Some(packet.number);
        match outcome.result {
            AckResult::UnsentPacketsAcked => {
                return self.close_on_frame(
                    QuicErrorCode::InvalidAckData,
                    "Tried to process an ACK for an unsent packet.",
                );
            }
            AckResult::UnackablePacketsAcked => {
                return self.close_on_frame(
                    QuicErrorCode::InvalidAckData,
                    "Received an ACK for a packet that cannot be acknowledged.",
                );
            }
            AckResult::PacketsNewlyAcked => {
                self.on_packets_acked(outcome.space, &outcome.acked, now)
            }
            AckResult::NoPacketsNewlyAcked => {}
        }
        self.on_packets_lost(outcome.lost);
        true
    }

    fn on_packets_acked(&mut self, space: SpaceId, acked: &[(u64, SentPacket)], now: Instant) {
        for (number, packet) in acked {
            if let Some(largest) = packet.largest_acked {
                self.receiver.on_ack_of_ack(space, largest);
            }
            if packet.is_mtu_probe {
                let current = self.creator.max_packet_length();
                if let Some(length) = self.mtud.on_packet_acked(*number, current) {
                    self.set_max_packet_length(length);
                }
            }
        }

        // Without PATH_CHALLENGE, an acknowledgement of a packet sent after the migration
        // proves the peer owns its new address
        if !self.config.ietf_frames && space == SpaceId::Data {
            if let Some(migration) = self.active_migration {
                let sent_after = acked.iter().any(|&(number, _)| {
                    migration
                        .largest_sent_before
                        .map_or(true, |largest| number > largest)
                });
                if sent_after {
                    self.path.mark_validated();
                    self.on_effective_peer_migration_validated();
                }
            }
        }

        if self.path_degrading {
            debug!("forward progress after path degrading");
            self.path_degrading = false;
            self.visitor.on_forward_progress_made_after_path_degrading();
        }
        if self.tracker.has_in_flight_packets() {
            self.restart_blackhole_detection(now);
        } else {
            self.blackhole.stop(false);
            self.timers.stop(Timer::NetworkBlackhole);
        }
    }

    fn on_packets_lost(&mut self, lost: Vec<(u64, SentPacket)>) {
        for (number, packet) in lost {
            self.stats.packets_lost += 1;
            self.stats.bytes_lost += u64::from(packet.size);
            trace!(
                number,
                level = %packet.level,
                transmission = ?packet.transmission,
                "packet lost"
            );
            if packet.is_mtu_probe {
                self.mtud.on_packet_lost(number);
            }
            if !packet.retransmittable.is_empty() {
                self.retransmissions.push_back(Retransmission {
                    level: packet.level,
                    frames: packet.retransmittable,
                    transmission: TransmissionType::Loss,
                });
            }
        }
    }

    fn on_connection_close_frame(&mut self, close: Close) {
        let code = match close.application {
            true => QuicErrorCode::Application(close.error_code),
            false => QuicErrorCode::Transport(close.error_code.into()),
        };
        let details = String::from_utf8_lossy(&close.reason).into_owned();
        debug!(%code, %details, "peer closed the connection");
        self.tear_down(ConnectionError {
            code,
            details,
            origin: CloseSource::Peer,
        });
    }

    fn on_remote_cids_changed(&mut self) {
        for sequence in self.cids.take_retirements() {
            self.pending_control
                .push_back(Frame::RetireConnectionId { sequence });
        }
        let remote = self.cids.remote();
        if remote != self.path.remote_cid {
            self.path.remote_cid = remote;
            self.creator.set_destination_cid(remote);
        }
    }

    fn process_undecryptable_packets(&mut self, now: Instant) {
        let queued = mem::take(&mut self.undecryptable);
        for packet in queued {
            if !self.connected {
                return;
            }
            if !self.codec.has_decrypter(packet.level) {
                self.undecryptable.push_back(packet);
                continue;
            }
            trace!(level = %packet.level, "retrying undecryptable packet");
            let len = packet.data.len();
            self.process_datagram(packet.local, packet.remote, packet.data, len, now, true);
        }
        if self.handshake_state >= HandshakeState::Complete {
            self.undecryptable.clear();
        }
    }

    /// Send whatever the packet just processed made possible or necessary
    fn maybe_send_in_response_to_packet(&mut self, now: Instant) {
        if !self.connected {
            return;
        }
        self.write_pending();
        self.send_pending_acks(now, true);
    }

    //
    // Keys and handshake
    //

    /// Keys to protect packets at `level` were installed into the codec
    pub fn on_encryption_keys_available(&mut self, level: EncryptionLevel) {
        debug!(%level, "encryption keys available");
        self.on_can_write();
    }

    /// Keys to open packets at `level` were installed into the codec
    ///
    /// Packets that arrived early are retried from [`handle_timeout`](Self::handle_timeout).
    pub fn on_decryption_keys_available(&mut self, level: EncryptionLevel) {
        debug!(%level, "decryption keys available");
        if self.connected && !self.undecryptable.is_empty() {
            let now = self.clock.approximate_now();
            self.timers.set(Timer::ProcessUndecryptable, now);
        }
    }

    /// Send frames at `level` from now on
    ///
    /// The packet under construction is closed first so that no packet mixes levels.
    pub fn set_default_encryption_level(&mut self, level: EncryptionLevel) {
        if level == self.default_level {
            return;
        }
        debug!(from = %self.default_level, to = %level, "default encryption level changed");
        self.creator.flush(&*self.codec);
        self.dispatch_finished_packets();
        self.creator.set_encryption_level(level);
        self.default_level = level;
    }

    /// Record handshake progress reported by the session layer
    ///
    /// The state never moves backwards. A server's handshake is confirmed as soon as it is
    /// complete, and HANDSHAKE_DONE is queued for the client.
    pub fn set_handshake_state(&mut self, state: HandshakeState) {
        if !self.connected || state <= self.handshake_state {
            return;
        }
        debug!(from = ?self.handshake_state, to = ?state, "handshake state changed");
        let previous = mem::replace(&mut self.handshake_state, state);
        if previous < HandshakeState::Complete && state >= HandshakeState::Complete {
            let now = self.clock.approximate_now();
            self.timers.stop(Timer::ProcessUndecryptable);
            self.process_undecryptable_packets(now);
            self.undecryptable.clear();
            self.idle.on_handshake_complete();
            if self.side.is_server() {
                self.handshake_state = HandshakeState::Confirmed;
                if self.config.ietf_frames {
                    self.pending_control.push_back(Frame::HandshakeDone);
                }
            }
        }
        if previous < HandshakeState::Confirmed
            && self.handshake_state == HandshakeState::Confirmed
        {
            self.on_handshake_confirmed();
        }
        self.with_packet_flusher(|conn| conn.send_pending_control_frames());
    }

    fn on_handshake_confirmed(&mut self) {
        debug!("handshake confirmed");
        self.tracker.set_handshake_confirmed();
        for level in [EncryptionLevel::Initial, EncryptionLevel::Handshake] {
            if self.codec.has_encrypter(level) || self.codec.has_decrypter(level) {
                self.discard_keys(level);
            }
        }
        if let Some(config) = &self.config.mtu_discovery {
            let largest_sent = self.tracker.largest_sent(SpaceId::Data).unwrap_or(0);
            self.mtud
                .enable(config, self.creator.max_packet_length(), largest_sent);
        }
    }

    /// Drop the keys of `level` and everything that can only be sent or acknowledged with them
    fn discard_keys(&mut self, level: EncryptionLevel) {
        debug!(%level, "discarding keys");
        self.coalescer.discard_level(level);
        self.creator
            .set_soft_max_length(self.coalescer.remaining_space());
        self.codec.remove_keys(level);
        self.tracker.neuter_packets(level.space());
        self.receiver.discard(level.space());
        self.retransmissions.retain(|r| r.level != level);
    }

    /// Move to the next generation of 1-RTT keys
    ///
    /// Returns false if an update is not allowed yet: the handshake must be confirmed, the
    /// previous keys discarded, and a packet of the current phase acknowledged.
    pub fn initiate_key_update(&mut self, reason: KeyUpdateReason) -> bool {
        if !self.connected {
            return false;
        }
        let supported = self.config.key_update_supported
            && self.handshake_state >= HandshakeState::Confirmed;
        if !self
            .keys
            .update_allowed(supported, self.tracker.largest_acked(SpaceId::Data))
        {
            debug!(?reason, "key update not allowed yet");
            return false;
        }
        if !self.codec.update_keys() {
            self.close_connection(
                QuicErrorCode::KeyUpdateError,
                "Failed to update 1-RTT keys.",
                ConnectionCloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }
        self.on_key_phase_changed(reason);
        true
    }

    fn on_remote_key_update(&mut self) -> bool {
        if !self.codec.update_keys() {
            self.close_connection(
                QuicErrorCode::KeyUpdateError,
                "Failed to follow the peer's key update.",
                ConnectionCloseBehavior::SendConnectionClosePacket,
            );
            return false;
        }
        self.on_key_phase_changed(KeyUpdateReason::Remote);
        true
    }

    fn on_key_phase_changed(&mut self, reason: KeyUpdateReason) {
        self.keys.on_key_update(reason != KeyUpdateReason::Remote);
        self.creator.set_key_phase(self.keys.phase());
        self.stats.key_updates += 1;
        debug!(?reason, phase = self.keys.phase(), "1-RTT keys updated");
        self.visitor.on_key_update(reason);
        let now = self.clock.approximate_now();
        let deadline = now + 3 * self.tracker.pto_delay(SpaceId::Data);
        self.timers.set(Timer::DiscardPreviousOneRttKeys, deadline);
    }

    //
    // Sending: public API
    //

    /// Send stream data, returning how much of it was accepted
    ///
    /// Data is only sent once 0-RTT or 1-RTT keys are available; trying earlier closes the
    /// connection. Less than everything is accepted when congestion control, pacing, the
    /// anti-amplification limit or a blocked writer stop sending.
    pub fn send_stream_data(
        &mut self,
        id: StreamId,
        data: Bytes,
        offset: u64,
        fin: bool,
    ) -> ConsumedData {
        if !self.connected || (data.is_empty() && !fin) {
            return ConsumedData::default();
        }
        let Some(level) = self.application_level() else {
            self.close_connection(
                QuicErrorCode::UnencryptedStreamData,
                "Cannot send stream data without 0-RTT or 1-RTT keys.",
                ConnectionCloseBehavior::SendConnectionClosePacket,
            );
            return ConsumedData::default();
        };
        self.with_packet_flusher(|conn| {
            conn.with_encryption_level(level, |conn| {
                let mut consumed = ConsumedData::default();
                loop {
                    let done = consumed.bytes_consumed == data.len();
                    if done && (!fin || consumed.fin_consumed) {
                        break;
                    }
                    if !conn.connected || !conn.can_write(true) {
                        break;
                    }
                    conn.maybe_bundle_ack();
                    let rest = data.slice(consumed.bytes_consumed..);
                    let (written, fin_written) = conn.creator.add_stream_frame(
                        &*conn.codec,
                        id,
                        &rest,
                        offset + consumed.bytes_consumed as u64,
                        fin,
                    );
                    conn.dispatch_finished_packets();
                    if written == 0 && !fin_written {
                        break;
                    }
                    consumed.bytes_consumed += written;
                    consumed.fin_consumed = fin_written;
                }
                consumed
            })
        })
    }

    /// Send handshake data at `level`, returning how many bytes were accepted
    pub fn send_crypto_data(&mut self, level: EncryptionLevel, data: Bytes, offset: u64) -> usize {
        if !self.connected || data.is_empty() {
            return 0;
        }
        if !self.codec.has_encrypter(level) {
            debug!(%level, "cannot send crypto data without keys");
            return 0;
        }
        self.with_packet_flusher(|conn| {
            conn.with_encryption_level(level, |conn| {
                let mut consumed = 0;
                while consumed < data.len() && conn.connected && conn.can_write(true) {
                    conn.maybe_bundle_ack();
                    let written = conn.creator.add_crypto_frame(
                        &*conn.codec,
                        offset + consumed as u64,
                        &data.slice(consumed..),
                    );
                    conn.dispatch_finished_packets();
                    if written == 0 {
                        break;
                    }
                    consumed += written;
                }
                consumed
            })
        })
    }

    /// Send a control frame such as MAX_DATA or RESET_STREAM at the application level
    ///
    /// Returns false if it cannot be sent now; the caller retries after
    /// [`Visitor::on_can_write`].
    pub fn send_control_frame(&mut self, frame: Frame) -> bool {
        if !self.connected {
            return false;
        }
        let Some(level) = self.application_level() else {
            return false;
        };
        if !self.can_write(frame.is_retransmittable()) {
            trace!(ty = %frame.ty(), "control frame blocked");
            return false;
        }
        self.with_packet_flusher(|conn| {
            conn.with_encryption_level(level, |conn| conn.add_frame(frame))
        })
    }

    /// Send an unreliable message
    pub fn send_message(&mut self, data: Bytes) -> Result<(), SendMessageError> {
        if !self.connected {
            return Err(SendMessageError::ConnectionClosed);
        }
        let Some(level) = self.application_level() else {
            return Err(SendMessageError::EncryptionNotEstablished);
        };
        let frame = Frame::Message(data);
        let overhead = self
            .codec
            .packet_overhead(level, self.creator.destination_cid().len());
        let room = usize::from(self.creator.max_packet_length()).saturating_sub(overhead);
        if self.codec.frame_size(&frame) > room {
            return Err(SendMessageError::TooLarge);
        }
        if !self.can_write(true) {
            return Err(SendMessageError::Blocked);
        }
        let added = self.with_packet_flusher(|conn| {
            conn.with_encryption_level(level, |conn| conn.add_frame(frame))
        });
        match added {
            true => Ok(()),
            false => Err(SendMessageError::TooLarge),
        }
    }

    /// Send a PING at the highest level keys are available for
    pub fn send_ping(&mut self) {
        if !self.connected || self.is_amplification_limited() {
            return;
        }
        let level = self.application_level().unwrap_or(self.default_level);
        if !self.codec.has_encrypter(level) {
            return;
        }
        self.with_packet_flusher(|conn| {
            conn.with_encryption_level(level, |conn| conn.add_frame(Frame::Ping))
        });
    }

    /// Send a padded packet that probes the path from `local` to `remote`
    ///
    /// The probe carries a PATH_CHALLENGE when the peer speaks IETF framing, and a PING
    /// otherwise. Returns whether it was sent.
    pub fn send_connectivity_probing_packet(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> bool {
        if !self.connected {
            return false;
        }
        let frames = match self.config.ietf_frames {
            true => vec![Frame::PathChallenge(self.rng.random())],
            false => vec![Frame::Ping],
        };
        let pad_to = usize::from(self.creator.max_packet_length());
        let sent = self
            .with_packet_flusher(|conn| conn.send_standalone(frames, local, remote, Some(pad_to)));
        if sent {
            debug!(%local, %remote, "connectivity probe sent");
            self.stats.connectivity_probes_sent += 1;
        }
        sent
    }

    /// Give the connection a chance to send queued retransmissions, control frames and probes
    ///
    /// Ends with [`Visitor::on_can_write`] if the session is willing to write and nothing
    /// prevents it.
    pub fn on_can_write(&mut self) {
        if !self.connected {
            return;
        }
        self.with_packet_flusher(|conn| conn.write_pending());
    }

    /// The writer reported earlier as blocked is writable again
    pub fn on_blocked_writer_can_write(&mut self) {
        self.writer.set_writable();
        if !self.connected {
            return;
        }
        self.write_queued_packets();
        self.on_can_write();
    }

    //
    // Connection IDs and paths
    //

    /// Offer the peer an additional connection ID, returning its sequence number
    pub fn issue_connection_id(&mut self, id: ConnectionId, reset_token: [u8; 16]) -> u64 {
        let sequence = self.cids.issue(id);
        self.pending_control
            .push_back(Frame::NewConnectionId(NewConnectionId {
                sequence,
                retire_prior_to: 0,
                id,
                reset_token,
            }));
        if self.connected {
            self.with_packet_flusher(|conn| conn.send_pending_control_frames());
        }
        sequence
    }

    /// Also accept packets addressed to `id`, such as the client's original destination ID
    pub fn add_incoming_connection_id(&mut self, id: ConnectionId) {
        self.cids.add_incoming(id);
    }

    /// Start validating the path from `local` to `remote` ahead of a migration
    ///
    /// The outcome is reported to `delegate`, which is told `Cancelled` right away if 1-RTT keys
    /// are not available yet.
    pub fn validate_path(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        delegate: Box<dyn PathValidationDelegate>,
    ) {
        if !self.connected || !self.codec.has_encrypter(EncryptionLevel::ForwardSecure) {
            let mut finished = Finished {
                local,
                remote,
                reason: ValidationReason::Application(delegate),
                outcome: PathValidationOutcome::Cancelled,
            };
            finished.notify_delegate();
            return;
        }
        let now = self.clock.approximate_now();
        if local != self.path.local || remote != self.path.remote {
            self.alternative_path = Some(PathState::new(local, remote, self.cids.remote(), false));
        }
        self.with_packet_flusher(|conn| {
            conn.start_path_validation(local, remote, ValidationReason::Application(delegate), now)
        });
    }

    /// Move a client's default path to `local`/`remote`
    ///
    /// A fresh peer-issued connection ID is used if one is available. Congestion and RTT state
    /// start over unless only the local port changed, in which case outstanding data is kept;
    /// otherwise it is queued for retransmission on the new path. Returns false for servers,
    /// before the handshake is confirmed, or if the path does not change.
    pub fn migrate_path(&mut self, local: SocketAddr, remote: SocketAddr) -> bool {
        if !self.connected
            || self.side.is_server()
            || self.handshake_state < HandshakeState::Confirmed
            || (local == self.path.local && remote == self.path.remote)
        {
            return false;
        }
        self.with_packet_flusher(|conn| {
            conn.flush_packets();
            let now = conn.clock.approximate_now();
            let remote_cid = conn.cids.next_remote().unwrap_or(conn.cids.remote());
            let reset = local.ip() != conn.path.local.ip() || remote != conn.path.remote;
            debug!(%local, %remote, reset, "migrating");
            if reset {
                conn.reset_path_state(now);
            }
            conn.tracker.on_connection_migration(reset);
            conn.alternative_path = None;
            conn.path = PathState::new(local, remote, remote_cid, true);
            conn.on_remote_cids_changed();
            conn.creator.set_destination_cid(remote_cid);
            if reset {
                for (level, frames) in conn.tracker.take_retransmittable_data() {
                    conn.retransmissions.push_back(Retransmission {
                        level,
                        frames,
                        transmission: TransmissionType::Path,
                    });
                }
            }
            conn.write_pending();
        });
        true
    }

    /// Install a fresh controller and RTT estimator, returning the ones they replace
    fn reset_path_state(&mut self, now: Instant) -> SavedPathState {
        let send_algorithm = self
            .config
            .congestion_controller_factory
            .clone()
            .build(now, self.creator.max_packet_length());
        SavedPathState {
            send_algorithm: self.tracker.replace_send_algorithm(send_algorithm),
            rtt: self.tracker.replace_rtt(RttEstimator::new(self.config.initial_rtt)),
        }
    }

    fn path_to(&self, remote: SocketAddr) -> Option<&PathState> {
        if self.path.remote == remote {
            return Some(&self.path);
        }
        self.alternative_path.as_ref().filter(|p| p.remote == remote)
    }

    fn path_to_mut(&mut self, remote: SocketAddr) -> Option<&mut PathState> {
        if self.path.remote == remote {
            return Some(&mut self.path);
        }
        self.alternative_path.as_mut().filter(|p| p.remote == remote)
    }

    /// The peer sent a probing packet from, or to, an address other than the default path's
    fn on_connectivity_probe_received(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        datagram_len: usize,
        now: Instant,
    ) {
        self.stats.connectivity_probes_received += 1;
        debug!(%local, %remote, "connectivity probe received");
        if self.side.is_client() {
            return;
        }
        if !self.config.ietf_frames {
            // Answered in kind; the peer decides whether to migrate
            if self.path_to(remote).is_none() && !self.path_validator.is_validating() {
                let mut path = PathState::new(local, remote, self.cids.remote(), false);
                path.on_datagram_received(datagram_len);
                self.alternative_path = Some(path);
            }
            let pad_to = usize::from(self.creator.max_packet_length());
            if self.send_standalone(vec![Frame::Ping], local, remote, Some(pad_to)) {
                self.stats.connectivity_probes_sent += 1;
            }
            return;
        }
        if self.path_validator.is_validating_path(remote)
            || self
                .alternative_path
                .as_ref()
                .is_some_and(|p| p.remote == remote)
        {
            return;
        }
        let mut path = PathState::new(local, remote, self.cids.remote(), false);
        path.on_datagram_received(datagram_len);
        self.alternative_path = Some(path);
        self.start_path_validation(local, remote, ValidationReason::ProbeReceived, now);
    }

    /// Switch the default path to the peer's new address
    fn start_effective_peer_migration(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        datagram_len: usize,
        now: Instant,
    ) {
        let change = AddressChange::between(self.path.remote, remote);
        debug!(from = %self.path.remote, to = %remote, ?change, "peer migrated");
        let mut path = match self.alternative_path.take() {
            Some(path) if path.remote == remote => path,
            _ => {
                let mut path = PathState::new(local, remote, self.cids.remote(), false);
                path.on_datagram_received(datagram_len);
                path
            }
        };
        path.local = local;
        if self.config.peer_migration == MigrationPolicy::TrustUnvalidated {
            path.mark_validated();
        }

        let reset = !change.is_rebinding();
        if reset {
            let saved = self.reset_path_state(now);
            self.path.saved = Some(saved);
        }
        self.tracker.on_connection_migration(reset);
        let previous = mem::replace(&mut self.path, path);
        if previous.validated {
            self.previous_path = Some(previous);
        }
        self.active_migration = Some(ActiveMigration {
            change,
            largest_sent_before: self.tracker.largest_sent(SpaceId::Data),
        });
        self.visitor.on_connection_migration(change);

        if self.path.validated {
            self.on_effective_peer_migration_validated();
        } else if self.config.ietf_frames {
            self.start_path_validation(local, remote, ValidationReason::ReversePathValidation, now);
        }
    }

    fn on_effective_peer_migration_validated(&mut self) {
        let Some(migration) = self.active_migration.take() else {
            return;
        };
        debug!(remote = %self.path.remote, change = ?migration.change, "peer migration validated");
        self.stats.validated_peer_migrations += 1;
        self.previous_path = None;
    }

    /// Return to the last validated default path after a migration failed validation
    fn restore_to_last_validated_path(&mut self) {
        self.active_migration = None;
        let Some(mut previous) = self.previous_path.take() else {
            self.close_connection(
                QuicErrorCode::NoValidatedPath,
                "Peer migration failed and no validated path remains.",
                ConnectionCloseBehavior::SilentClose,
            );
            return;
        };
        debug!(from = %self.path.remote, to = %previous.remote, "reverting to last validated path");
        let saved = previous.saved.take();
        let reset = saved.is_some();
        if let Some(saved) = saved {
            self.tracker.replace_send_algorithm(saved.send_algorithm);
            self.tracker.replace_rtt(saved.rtt);
        }
        self.tracker.on_connection_migration(reset);
        self.path = previous;
        self.creator.set_destination_cid(self.path.remote_cid);
    }

    fn start_path_validation(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        reason: ValidationReason,
        now: Instant,
    ) {
        let (challenge, superseded) = self
            .path_validator
            .start(&mut self.rng, local, remote, reason);
        if let Some(finished) = superseded {
            self.on_validation_finished(finished);
        }
        self.send_path_challenge(challenge, local, remote);
        let timeout = self.path_validation_timeout(remote);
        self.timers.set(Timer::PathValidation, now + timeout);
    }

    fn path_validation_timeout(&self, remote: SocketAddr) -> crate::Duration {
        match remote == self.path.remote {
            true => self.tracker.pto_delay(SpaceId::Data),
            false => 3 * self.config.initial_rtt,
        }
    }

    fn send_path_challenge(&mut self, challenge: u64, local: SocketAddr, remote: SocketAddr) {
        let pad_to = usize::from(MIN_INITIAL_SIZE);
        self.send_standalone(vec![Frame::PathChallenge(challenge)], local, remote, Some(pad_to));
    }

    fn on_path_response(&mut self, token: u64, local: SocketAddr) {
        if let Some(finished) = self.path_validator.on_path_response(token, local) {
            self.timers.stop(Timer::PathValidation);
            self.on_validation_finished(finished);
        }
    }

    fn on_validation_finished(&mut self, mut finished: Finished) {
        finished.notify_delegate();
        let Finished {
            remote,
            reason,
            outcome,
            ..
        } = finished;
        match (reason, outcome) {
            (ValidationReason::ReversePathValidation, PathValidationOutcome::Validated) => {
                if self.path.remote == remote {
                    self.path.mark_validated();
                    self.on_effective_peer_migration_validated();
                }
            }
            (ValidationReason::ReversePathValidation, PathValidationOutcome::TimedOut) => {
                if self.path.remote == remote {
                    self.stats.invalid_peer_migrations += 1;
                    self.restore_to_last_validated_path();
                }
            }
            (ValidationReason::ReversePathValidation, PathValidationOutcome::Cancelled) => {}
            (_, PathValidationOutcome::Validated) => {
                if let Some(path) = self.alternative_path.as_mut().filter(|p| p.remote == remote) {
                    path.mark_validated();
                }
            }
            (_, _) => {
                let abandoned = !self.path_validator.is_validating_path(remote)
                    && self
                        .alternative_path
                        .as_ref()
                        .is_some_and(|p| p.remote == remote);
                if abandoned {
                    self.alternative_path = None;
                }
            }
        }
    }

    //
    // Sending: internals
    //

    /// The level application data is sent at, if keys for one are available
    fn application_level(&self) -> Option<EncryptionLevel> {
        if self.codec.has_encrypter(EncryptionLevel::ForwardSecure) {
            Some(EncryptionLevel::ForwardSecure)
        } else if self.side.is_client() && self.codec.has_encrypter(EncryptionLevel::ZeroRtt) {
            Some(EncryptionLevel::ZeroRtt)
        } else {
            None
        }
    }

    /// Whether the anti-amplification limit forbids another full packet on the default path
    fn is_amplification_limited(&self) -> bool {
        let pending = self.coalescer.length()
            + self.creator.open_length()
            + usize::from(self.creator.max_packet_length());
        self.path
            .anti_amplification_blocked(self.config.anti_amplification_factor, pending as u64)
    }

    /// Whether a packet may be sent on the default path now
    ///
    /// Data that is not retransmittable, such as ACKs, is exempt from congestion control and
    /// pacing. When pacing is what prevents sending, the send alarm is armed.
    fn can_write(&mut self, retransmittable: bool) -> bool {
        if !self.connected {
            return false;
        }
        if self.is_amplification_limited() {
            trace!("blocked by the anti-amplification limit");
            self.stats.amplification_throttling += 1;
            return false;
        }
        if self.writer.is_write_blocked() || !self.buffered.is_empty() {
            return false;
        }
        if !retransmittable {
            return true;
        }
        if self.timers.is_set(Timer::Send) {
            return false;
        }
        let now = self.clock.approximate_now();
        let mtu = self.creator.max_packet_length();
        match self.tracker.next_send_time(now, mtu) {
            None => false,
            Some(time) if time <= now => true,
            Some(time) => {
                self.timers.set(Timer::Send, time);
                false
            }
        }
    }

    /// Queue `frame` at the current level, bundling a pending ACK first
    fn add_frame(&mut self, frame: Frame) -> bool {
        self.maybe_bundle_ack();
        let added = self.creator.add_frame(&*self.codec, frame);
        self.dispatch_finished_packets();
        added
    }

    fn maybe_bundle_ack(&mut self) {
        let level = self.creator.level();
        if level == EncryptionLevel::ZeroRtt || self.creator.has_ack() {
            return;
        }
        let space = level.space();
        if self.receiver.ack_pending(space) {
            self.add_ack(space);
        }
    }

    fn add_ack(&mut self, space: SpaceId) -> bool {
        let now = self.clock.approximate_now();
        let Some(ack) = self.receiver.ack_frame(space, now) else {
            return false;
        };
        let largest = ack.largest;
        if !self.creator.add_ack(&*self.codec, Frame::Ack(ack), largest) {
            return false;
        }
        self.receiver.on_ack_sent(space);
        self.dispatch_finished_packets();
        true
    }

    /// Send ACKs for every space with one pending, or only those whose delay expired
    fn send_pending_acks(&mut self, now: Instant, due_only: bool) {
        for space in SpaceId::iter() {
            let due = self
                .receiver
                .ack_timeout(space)
                .is_some_and(|deadline| !due_only || deadline <= now);
            if !due {
                continue;
            }
            let level = match space {
                SpaceId::Initial => EncryptionLevel::Initial,
                SpaceId::Handshake => EncryptionLevel::Handshake,
                SpaceId::Data => EncryptionLevel::ForwardSecure,
            };
            if !self.codec.has_encrypter(level) {
                continue;
            }
            if !self.can_write(false) {
                return;
            }
            self.with_encryption_level(level, |conn| {
                if conn.creator.has_ack() || !conn.add_ack(space) {
                    return;
                }
                if space == SpaceId::Data
                    && !conn.creator.has_pending_retransmittable_frames()
                    && conn.consecutive_non_retransmittable
                        >= MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS
                {
                    let frame = conn
                        .visitor
                        .retransmittable_frame_for_ack()
                        .unwrap_or(Frame::Ping);
                    trace!(ty = %frame.ty(), "making ACK-only packet ack-eliciting");
                    conn.creator.add_frame(&*conn.codec, frame);
                }
            });
        }
    }

    fn write_pending(&mut self) {
        self.write_queued_packets();
        if !self.connected || self.writer.is_write_blocked() || !self.buffered.is_empty() {
            return;
        }
        self.send_path_responses();
        self.send_pending_control_frames();
        self.send_retransmissions();
        self.send_probe_packets();
        if self.connected && self.visitor.willing_and_able_to_write() && self.can_write(true) {
            self.visitor.on_can_write();
        }
    }

    fn send_path_responses(&mut self) {
        if self.path_responses.is_empty()
            || !self.codec.has_encrypter(EncryptionLevel::ForwardSecure)
        {
            return;
        }
        if let Some(token) = self.path_responses.pop_for(self.path.remote) {
            if !self.is_amplification_limited() {
                self.with_encryption_level(EncryptionLevel::ForwardSecure, |conn| {
                    conn.add_frame(Frame::PathResponse(token))
                });
            }
        }
        while let Some((token, remote)) = self.path_responses.pop_off_path(self.path.remote) {
            let local = self.path_to(remote).map_or(self.path.local, |p| p.local);
            let pad_to = usize::from(MIN_INITIAL_SIZE);
            self.send_standalone(vec![Frame::PathResponse(token)], local, remote, Some(pad_to));
        }
    }

    fn send_pending_control_frames(&mut self) {
        if !self.codec.has_encrypter(EncryptionLevel::ForwardSecure) {
            return;
        }
        while let Some(frame) = self.pending_control.front() {
            let retransmittable = frame.is_retransmittable();
            if !self.can_write(retransmittable) {
                break;
            }
            let Some(frame) = self.pending_control.pop_front() else {
                break;
            };
            self.with_encryption_level(EncryptionLevel::ForwardSecure, |conn| {
                conn.add_frame(frame)
            });
        }
    }

    fn send_retransmissions(&mut self) {
        while let Some(next) = self.retransmissions.front() {
            let level = match next.level {
                EncryptionLevel::ZeroRtt
                    if self.codec.has_encrypter(EncryptionLevel::ForwardSecure) =>
                {
                    EncryptionLevel::ForwardSecure
                }
                level => level,
            };
            if !self.codec.has_encrypter(level) {
                trace!(%level, "dropping retransmission; keys are gone");
                self.retransmissions.pop_front();
                continue;
            }
            if !self.can_write(true) {
                break;
            }
            let Some(retransmission) = self.retransmissions.pop_front() else {
                break;
            };
            self.creator
                .set_transmission_type(retransmission.transmission);
            self.with_encryption_level(level, |conn| {
                for frame in retransmission.frames {
                    conn.maybe_bundle_ack();
                    conn.creator.add_retransmission(&*conn.codec, frame);
                    conn.dispatch_finished_packets();
                }
            });
        }
    }

    /// Use up the transmissions the retransmission timer granted
    fn send_probe_packets(&mut self) {
        while self.connected && self.tracker.pending_timer_transmission_count() > 0 {
            let before = self.tracker.pending_timer_transmission_count();
            if !self.retransmissions.is_empty() {
                self.send_retransmissions();
            } else {
                let space = self.tracker.earliest_pto_space();
                match space.and_then(|space| self.tracker.retransmit_data_of_space(space)) {
                    Some((level, frames)) => {
                        self.retransmissions.push_back(Retransmission {
                            level,
                            frames,
                            transmission: self.probe_transmission,
                        });
                        self.send_retransmissions();
                    }
                    None => self.send_probe_ping(space),
                }
            }
            self.flush_packets();
            if self.tracker.pending_timer_transmission_count() == before {
                break;
            }
        }
    }

    fn send_probe_ping(&mut self, space: Option<SpaceId>) {
        let level = match space {
            Some(SpaceId::Initial) => Some(EncryptionLevel::Initial),
            Some(SpaceId::Handshake) => Some(EncryptionLevel::Handshake),
            Some(SpaceId::Data) => self.application_level(),
            None if self.handshake_state >= HandshakeState::Confirmed => self.application_level(),
            // Anti-deadlock probe of a client the server cannot answer yet
            None => [EncryptionLevel::Handshake, EncryptionLevel::Initial]
                .into_iter()
                .find(|&level| self.codec.has_encrypter(level)),
        };
        let Some(level) = level.filter(|&level| self.codec.has_encrypter(level)) else {
            return;
        };
        if self.is_amplification_limited() {
            return;
        }
        self.creator.set_transmission_type(self.probe_transmission);
        self.with_encryption_level(level, |conn| conn.add_frame(Frame::Ping));
    }

    /// Send `frames` in a packet of their own from `local` to `remote`, at 1-RTT
    ///
    /// Used off the default path, where nothing may be coalesced. Padding to `pad_to` is
    /// dropped if it would exceed the anti-amplification budget of the path.
    fn send_standalone(
        &mut self,
        frames: Vec<Frame>,
        local: SocketAddr,
        remote: SocketAddr,
        mut pad_to: Option<usize>,
    ) -> bool {
        let level = EncryptionLevel::ForwardSecure;
        if !self.codec.has_encrypter(level) {
            return false;
        }
        // Keep packet numbers increasing in the order packets are written
        self.dispatch_finished_packets();
        self.flush_coalesced_packet();
        let length = self
            .codec
            .packet_overhead(level, self.creator.destination_cid().len())
            + frames.iter().map(|f| self.codec.frame_size(f)).sum::<usize>();
        if self.side.is_server() {
            let factor = self.config.anti_amplification_factor;
            // The open packet goes out on the default path too
            let queued = match remote == self.path.remote {
                true => self.creator.open_length(),
                false => 0,
            };
            // Nothing was counted for an address without path state
            let blocked = self.path_to(remote).map_or(true, |path| {
                path.anti_amplification_blocked(factor, (queued + length) as u64)
            });
            if blocked {
                trace!(%remote, "standalone packet blocked by the anti-amplification limit");
                self.stats.amplification_throttling += 1;
                return false;
            }
            if pad_to.is_some_and(|target| {
                self.path_to(remote).map_or(true, |path| {
                    path.anti_amplification_blocked(factor, (queued + target) as u64)
                })
            }) {
                pad_to = None;
            }
        }
        let packet = self
            .creator
            .serialize_standalone(&*self.codec, level, frames, pad_to, false);
        self.write_packets(local, remote, vec![packet], false);
        true
    }

    fn flush_packets(&mut self) {
        self.creator.flush(&*self.codec);
        self.dispatch_finished_packets();
        self.flush_coalesced_packet();
    }

    fn dispatch_finished_packets(&mut self) {
        while self.connected {
            let Some(packet) = self.creator.take_finished() else {
                return;
            };
            self.send_pending_packet(packet);
        }
    }

    /// Decide what happens to a finished packet
    fn packet_fate(&self, packet: &PendingPacket) -> PacketFate {
        let level = packet.level();
        if !self.codec.has_encrypter(level) {
            return PacketFate::Discard;
        }
        if self.side.is_client()
            && level == EncryptionLevel::Initial
            && self.config.legacy_encapsulation.is_some()
        {
            return PacketFate::LegacyVersionEncapsulate;
        }
        if !packet.is_mtu_probe
            && (self.handshake_state < HandshakeState::Confirmed || !self.coalescer.is_empty())
        {
            return PacketFate::Coalesce;
        }
        if !self.buffered.is_empty() || self.writer.is_write_blocked() {
            return PacketFate::Buffer;
        }
        PacketFate::SendToWriter
    }

    fn send_pending_packet(&mut self, packet: PendingPacket) {
        let (local, remote) = (self.path.local, self.path.remote);
        let fate = self.packet_fate(&packet);
        trace!(level = %packet.level(), number = packet.number(), ?fate, "packet ready");
        match fate {
            PacketFate::Discard => {
                debug!(
                    level = %packet.level(),
                    number = packet.number(),
                    "discarding packet without keys"
                );
            }
            PacketFate::LegacyVersionEncapsulate => {
                self.flush_coalesced_packet();
                self.write_packets(local, remote, vec![packet], true);
            }
            PacketFate::Coalesce => self.coalesce_packet(packet, local, remote),
            PacketFate::Buffer | PacketFate::SendToWriter => {
                self.write_packets(local, remote, vec![packet], false);
            }
        }
    }

    fn coalesce_packet(&mut self, packet: PendingPacket, local: SocketAddr, remote: SocketAddr) {
        let max_length = usize::from(self.creator.max_packet_length());
        if let Err(packet) = self
            .coalescer
            .maybe_coalesce(packet, local, remote, max_length)
        {
            self.flush_coalesced_packet();
            if let Err(packet) = self
                .coalescer
                .maybe_coalesce(packet, local, remote, max_length)
            {
                self.write_packets(local, remote, vec![packet], false);
            }
        }
        self.creator
            .set_soft_max_length(self.coalescer.remaining_space());
    }

    fn flush_coalesced_packet(&mut self) {
        let Some((local, remote, packets)) = self.coalescer.take() else {
            return;
        };
        self.creator.set_soft_max_length(None);
        if packets.len() > 1 {
            self.stats.coalesced_datagrams_sent += 1;
        }
        self.write_packets(local, remote, packets, false);
    }

    /// Encode `packets` into one datagram, record them as sent, and write it
    fn write_packets(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        mut packets: Vec<PendingPacket>,
        legacy: bool,
    ) {
        let pad_initial = self.side.is_client()
            || packets
                .iter()
                .any(|p| p.level() == EncryptionLevel::Initial && p.ack_eliciting);
        let mut data = Vec::with_capacity(usize::from(self.creator.max_packet_length()));
        let encoded =
            CoalescedPackets::encode(&mut *self.codec, &mut packets, pad_initial, &mut data);
        let sizes = match encoded {
            Ok(sizes) => sizes,
            Err(e) => {
                error!("failed to serialize packet: {e}");
                self.close_connection(
                    QuicErrorCode::InternalError,
                    format!("Failed to serialize packet: {e}"),
                    ConnectionCloseBehavior::SilentClose,
                );
                return;
            }
        };
        if legacy {
            let server_name = self.config.legacy_encapsulation.clone().unwrap_or_default();
            match self.codec.encapsulate_legacy(&data, &server_name) {
                Some(wrapped) => data = wrapped,
                None => trace!("legacy encapsulation unsupported; sending packet as is"),
            }
        }

        let now = self.clock.approximate_now();
        let is_mtu_probe = packets.iter().any(|p| p.is_mtu_probe);
        for (packet, size) in packets.iter().zip(sizes) {
            self.on_packet_sent(packet, size, now);
        }
        if !self.connected {
            return;
        }
        self.write_datagram(BufferedDatagram {
            data,
            local,
            remote,
            is_mtu_probe,
        });
    }

    fn on_packet_sent(&mut self, packet: &PendingPacket, size: usize, now: Instant) {
        let level = packet.level();
        let space = packet.space();
        let number = packet.number();
        let span = trace_span!("send", ?space, pn = number);
        let _guard = span.enter();
        trace!(%level, size, frames = packet.frames.len(), "packet sent");

        self.stats.packets_sent += 1;
        for frame in &packet.frames {
            self.stats.frame_tx.record(frame);
        }
        let retransmittable = packet.has_retransmittable_frames();
        if retransmittable && packet.transmission != TransmissionType::NotRetransmission {
            self.stats.packets_retransmitted += 1;
        }
        if packet.ack_eliciting {
            self.consecutive_non_retransmittable = 0;
        } else if packet.largest_acked.is_some() {
            self.consecutive_non_retransmittable += 1;
        }
        if level == EncryptionLevel::ForwardSecure {
            self.keys.on_packet_sent(number);
        }

        let sent = packet.to_sent(size, now);
        let in_flight = sent.in_flight;
        self.tracker.on_packet_sent(space, number, sent, now);
        if packet.is_mtu_probe {
            self.mtud.on_probe_sent(number);
            self.stats.mtu_probes_sent += 1;
        }
        if packet.ack_eliciting {
            self.idle
                .on_packet_sent(now, self.tracker.pto_delay(SpaceId::Data));
        }
        if in_flight && packet.ack_eliciting && !self.blackhole.is_in_progress() {
            self.restart_blackhole_detection(now);
        }
        if space == SpaceId::Data
            && self.mtud.should_probe(number)
            && !self.timers.is_set(Timer::MtuDiscovery)
        {
            self.timers.set(Timer::MtuDiscovery, now);
        }
        if self.side.is_client()
            && level == EncryptionLevel::Handshake
            && self.codec.has_encrypter(EncryptionLevel::Initial)
        {
            self.discard_keys(EncryptionLevel::Initial);
        }

        if self.tracker.outstanding_packets() > self.config.max_tracked_packets {
            self.close_connection(
                QuicErrorCode::TooManyOutstandingSentPackets,
                format!(
                    "More than {} outstanding sent packets.",
                    self.config.max_tracked_packets
                ),
                ConnectionCloseBehavior::SendConnectionClosePacket,
            );
            return;
        }

        if level == EncryptionLevel::ForwardSecure {
            let update_supported = self.config.key_update_supported
                && self.handshake_state >= HandshakeState::Confirmed;
            let limit = self.keys.check_confidentiality(
                number,
                self.codec.confidentiality_limit(),
                self.config.key_update_offset,
                update_supported,
                self.tracker.largest_acked(SpaceId::Data),
            );
            match limit {
                AeadLimit::Within => {}
                AeadLimit::UpdateKeys => {
                    self.initiate_key_update(KeyUpdateReason::LocalAeadConfidentialityLimit);
                }
                AeadLimit::Exhausted => self.close_connection(
                    QuicErrorCode::AeadLimitReached,
                    "AEAD limit reached",
                    ConnectionCloseBehavior::SendConnectionClosePacket,
                ),
            }
        }
    }

    fn restart_blackhole_detection(&mut self, now: Instant) {
        let confirmed = self.handshake_state >= HandshakeState::Confirmed;
        let detection = self.config.blackhole_detection;
        let path_degrading = (confirmed
            && !self.path_degrading
            && detection != BlackholeDetection::Disabled)
            .then(|| now + self.tracker.path_degrading_delay(self.config.path_degrading_ptos));
        let (blackhole, mtu_reduction) = match detection {
            BlackholeDetection::Enabled { num_rtos } if confirmed => (
                Some(now + self.tracker.network_blackhole_delay(num_rtos)),
                self.mtud
                    .prev_validated()
                    .map(|_| now + self.tracker.mtu_reduction_delay(num_rtos)),
            ),
            _ => (None, None),
        };
        self.blackhole.restart(path_degrading, blackhole, mtu_reduction);
        self.timers
            .update(Timer::NetworkBlackhole, self.blackhole.deadline());
    }

    fn set_max_packet_length(&mut self, length: u16) {
        debug!(from = self.creator.max_packet_length(), to = length, "packet length changed");
        self.creator.set_max_packet_length(length);
        self.tracker.on_mtu_update(length);
    }

    fn write_datagram(&mut self, datagram: BufferedDatagram) {
        let len = datagram.data.len();
        self.stats.udp_tx.on_datagram(len);
        if let Some(path) = self.path_to_mut(datagram.remote) {
            path.on_datagram_sent(len);
        }
        if !self.buffered.is_empty() || self.writer.is_write_blocked() {
            trace!(len, "writer blocked; buffering datagram");
            self.buffered.push_back(datagram);
            return;
        }
        let result = self
            .writer
            .write(&datagram.data, datagram.local, datagram.remote);
        self.handle_write_result(result, datagram);
    }

    /// Write buffered datagrams until the writer blocks again
    fn write_queued_packets(&mut self) {
        while self.connected && !self.writer.is_write_blocked() {
            let Some(datagram) = self.buffered.pop_front() else {
                return;
            };
            let result = self
                .writer
                .write(&datagram.data, datagram.local, datagram.remote);
            let blocked = result.is_blocked();
            self.handle_write_result(result, datagram);
            if blocked {
                return;
            }
        }
    }

    fn handle_write_result(&mut self, result: WriteResult, datagram: BufferedDatagram) {
        match result {
            WriteResult::Ok(_) => {}
            WriteResult::BlockedDataBuffered => {
                trace!("writer blocked; datagram kept by the writer");
                self.visitor.on_write_blocked();
            }
            WriteResult::Blocked => {
                trace!("writer blocked");
                self.buffered.push_front(datagram);
                self.visitor.on_write_blocked();
            }
            WriteResult::MsgTooBig if datagram.is_mtu_probe => {
                debug!(len = datagram.data.len(), "MTU probe too big for the socket");
                self.mtud.disable();
                if let Some(length) = self.mtud.take_prev_validated() {
                    self.set_max_packet_length(length);
                }
            }
            WriteResult::MsgTooBig => self.close_connection(
                QuicErrorCode::PacketWriteError,
                "Write failed: message too big.",
                ConnectionCloseBehavior::SilentClose,
            ),
            WriteResult::Error(code) => {
                error!(code, "write failed");
                self.close_connection(
                    QuicErrorCode::PacketWriteError,
                    format!("Write failed with error code {code}."),
                    ConnectionCloseBehavior::SilentClose,
                );
            }
        }
    }

    fn handle_flush_result(&mut self, result: WriteResult) {
        match result {
            WriteResult::Ok(_) => {}
            WriteResult::Blocked | WriteResult::BlockedDataBuffered => {
                self.visitor.on_write_blocked();
            }
            WriteResult::MsgTooBig | WriteResult::Error(_) => {
                error!(?result, "flushing the writer failed");
                self.close_connection(
                    QuicErrorCode::PacketWriteError,
                    format!("Flush failed: {result:?}."),
                    ConnectionCloseBehavior::SilentClose,
                );
            }
        }
    }

    //
    // Closing
    //

    /// Close the connection
    ///
    /// Unless `behavior` is [`ConnectionCloseBehavior::SilentClose`], CONNECTION_CLOSE is sent
    /// at every level the peer might be able to read. Closing an already closed connection does
    /// nothing.
    pub fn close_connection(
        &mut self,
        code: QuicErrorCode,
        details: impl Into<String>,
        behavior: ConnectionCloseBehavior,
    ) {
        if !self.connected || self.closing {
            return;
        }
        let details = details.into();
        self.closing = true;
        debug!(%code, %details, ?behavior, "closing connection");
        if behavior != ConnectionCloseBehavior::SilentClose {
            self.send_connection_close_packets(code, &details, behavior);
        }
        self.tear_down(ConnectionError::local(code, details));
    }

    fn send_connection_close_packets(
        &mut self,
        code: QuicErrorCode,
        details: &str,
        behavior: ConnectionCloseBehavior,
    ) {
        self.creator.clear();
        self.coalescer.clear();
        self.creator.set_soft_max_length(None);
        self.creator
            .set_transmission_type(TransmissionType::NotRetransmission);

        let mut levels = Vec::with_capacity(3);
        if self.config.ietf_frames {
            for level in [EncryptionLevel::Initial, EncryptionLevel::Handshake] {
                if self.codec.has_encrypter(level) {
                    levels.push(level);
                }
            }
            if self.codec.has_encrypter(EncryptionLevel::ForwardSecure)
                && (self.handshake_state >= HandshakeState::Confirmed || levels.is_empty())
            {
                levels.push(EncryptionLevel::ForwardSecure);
            }
        } else if let Some(level) = [
            EncryptionLevel::ForwardSecure,
            EncryptionLevel::Handshake,
            EncryptionLevel::Initial,
        ]
        .into_iter()
        .find(|&level| self.codec.has_encrypter(level))
        {
            levels.push(level);
        }

        let now = self.clock.approximate_now();
        let reason = Bytes::copy_from_slice(details.as_bytes());
        for level in levels {
            let mut frames = Vec::with_capacity(2);
            let mut largest_acked = None;
            if behavior == ConnectionCloseBehavior::SendConnectionClosePacket {
                if let Some(ack) = self.receiver.ack_frame(level.space(), now) {
                    largest_acked = Some(ack.largest);
                    frames.push(Frame::Ack(ack));
                }
            }
            let close = match code {
                QuicErrorCode::Application(error_code)
                    if level == EncryptionLevel::ForwardSecure =>
                {
                    Close {
                        error_code,
                        frame_type: None,
                        reason: reason.clone(),
                        application: true,
                    }
                }
                _ => Close {
                    error_code: code.transport_code().into(),
                    frame_type: None,
                    reason: reason.clone(),
                    application: false,
                },
            };
            frames.push(Frame::Close(close));
            let mut packet = self
                .creator
                .serialize_standalone(&*self.codec, level, frames, None, false);
            packet.largest_acked = largest_acked;
            trace!(%level, "sending CONNECTION_CLOSE");
            self.send_pending_packet(packet);
        }
        self.flush_coalesced_packet();
        if self.writer.is_batch_mode() {
            let result = self.writer.flush();
            if result.is_error() {
                debug!(?result, "flushing CONNECTION_CLOSE failed");
            }
        }
    }

    /// Release everything and tell the visitor; the connection is unusable afterwards
    fn tear_down(&mut self, error: ConnectionError) {
        if !self.connected {
            return;
        }
        self.connected = false;
        debug!(%error, "connection closed");
        self.timers.reset();
        self.blackhole.stop(true);
        self.idle.stop();
        self.pings.stop();
        if let Some(mut finished) = self.path_validator.cancel() {
            finished.notify_delegate();
        }
        self.undecryptable.clear();
        self.buffered.clear();
        self.pending_control.clear();
        self.retransmissions.clear();
        self.path_responses.clear();
        self.coalescer.clear();
        self.creator.clear();
        self.visitor.on_connection_closed(&error);
        self.close_error = Some(error);
    }

    #[cfg(test)]
    pub(crate) fn armed_timers(&self) -> Vec<Timer> {
        self.timers.armed()
    }

    #[cfg(test)]
    pub(crate) fn timer_deadline(&self, timer: Timer) -> Option<Instant> {
        self.timers.get(timer)
    }

    #[cfg(test)]
    pub(crate) fn outstanding_packets(&self) -> usize {
        self.tracker.outstanding_packets()
    }

    #[cfg(test)]
    pub(crate) fn largest_sent(&self, space: SpaceId) -> Option<u64> {
        self.tracker.largest_sent(space)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("connected", &self.connected)
            .field("handshake_state", &self.handshake_state)
            .field("level", &self.default_level)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Reasons why an unreliable message could not be sent
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum SendMessageError {
    /// The message does not fit in a packet
    #[error("message too large")]
    TooLarge,
    /// Congestion control, pacing or the writer prevent sending now
    #[error("blocked")]
    Blocked,
    /// Neither 0-RTT nor 1-RTT keys are available
    #[error("encryption not established")]
    EncryptionNotEstablished,
    /// The connection is closed
    #[error("connection closed")]
    ConnectionClosed,
}

/// Where a finished packet goes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PacketFate {
    /// No keys to protect it
    Discard,
    /// Held to share a datagram with packets of other levels
    Coalesce,
    /// Queued behind a blocked writer
    Buffer,
    SendToWriter,
    /// Wrapped in a legacy version handshake, for a client Initial
    LegacyVersionEncapsulate,
}

/// The packet whose frames are being processed
#[derive(Debug, Copy, Clone)]
struct IncomingPacket {
    level: EncryptionLevel,
    number: u64,
    local: SocketAddr,
    remote: SocketAddr,
    dst_cid: ConnectionId,
}

/// A packet that arrived before the keys to open it
#[derive(Debug)]
struct UndecryptablePacket {
    level: EncryptionLevel,
    data: Bytes,
    local: SocketAddr,
    remote: SocketAddr,
}

/// A datagram the writer refused while blocked
#[derive(Debug)]
struct BufferedDatagram {
    data: Vec<u8>,
    local: SocketAddr,
    remote: SocketAddr,
    is_mtu_probe: bool,
}

/// Frames to send again, and why
#[derive(Debug)]
struct Retransmission {
    level: EncryptionLevel,
    frames: Vec<Frame>,
    transmission: TransmissionType,
}

/// A peer migration whose new address is not validated yet
#[derive(Debug, Copy, Clone)]
struct ActiveMigration {
    change: AddressChange,
    /// Largest 1-RTT packet number sent before the migration
    largest_sent_before: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_error_display() {
        assert_eq!(SendMessageError::TooLarge.to_string(), "message too large");
        assert_eq!(
            SendMessageError::EncryptionNotEstablished.to_string(),
            "encryption not established"
        );
    }
}
