use std::{
    cmp,
    collections::{BTreeMap, btree_map},
    mem,
};

use tracing::{debug, trace};

use crate::{
    Duration, EncryptionLevel, Instant, SpaceId, TIMER_GRANULARITY,
    config::{ConnectionConfig, RetransmissionScheme},
    congestion::SendAlgorithm,
    frame::Frame,
};

use super::{pacing::Pacer, paths::RttEstimator};

/// Floor of the tail loss probe delay when a single packet is in flight
const MIN_RETRANSMISSION_TIME: Duration = Duration::from_millis(200);
/// Floor of the tail loss probe delay with several packets in flight
const MIN_TAIL_LOSS_PROBE_TIMEOUT: Duration = Duration::from_millis(10);
/// RTO used before any RTT sample exists
const DEFAULT_RETRANSMISSION_TIME: Duration = Duration::from_millis(500);
/// Floor of the handshake retransmission delay
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10);
/// Largest exponent applied to backed-off timeouts
const MAX_BACKOFF_EXPONENT: u32 = 10;
/// Packets sent when the probe timer fires, bypassing the congestion window
const MAX_PROBE_PACKETS_PER_PTO: u32 = 2;
/// Packets retransmitted when the RTO timer fires
const MAX_RTO_PACKETS: u32 = 2;

/// Why a packet carrying retransmittable frames is sent
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TransmissionType {
    NotRetransmission,
    Handshake,
    Loss,
    Tlp,
    Rto,
    Pto,
    /// Data resent on a new path after migration
    Path,
}

/// What the retransmission timer does when it fires
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RetransmissionMode {
    /// Resend all outstanding handshake data
    Handshake,
    /// Declare packets lost whose time threshold expired
    Loss,
    /// Send a tail loss probe
    Tlp,
    /// Retransmission timeout; resend the oldest packets
    Rto,
    /// Probe timeout
    Pto,
}

/// Result of processing a complete ACK frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckResult {
    /// At least one outstanding packet was acknowledged
    PacketsNewlyAcked,
    /// Everything acknowledged had already been acknowledged or declared lost
    NoPacketsNewlyAcked,
    /// The ACK covered a packet number that was never sent
    UnsentPacketsAcked,
    /// The ACK arrived for a packet number space whose keys were already dropped
    UnackablePacketsAcked,
}

/// An outstanding packet
#[derive(Debug, Clone)]
pub(super) struct SentPacket {
    pub(super) level: EncryptionLevel,
    pub(super) transmission: TransmissionType,
    pub(super) time_sent: Instant,
    pub(super) size: u16,
    /// Whether the packet counts towards bytes in flight
    pub(super) in_flight: bool,
    pub(super) ack_eliciting: bool,
    /// Frames to resend if this packet is lost
    pub(super) retransmittable: Vec<Frame>,
    /// Largest packet number acknowledged by an ACK frame in this packet
    pub(super) largest_acked: Option<u64>,
    pub(super) is_mtu_probe: bool,
}

impl SentPacket {
    fn has_crypto(&self) -> bool {
        self.retransmittable.iter().any(Frame::is_crypto)
    }
}

/// Packets acknowledged and lost as a consequence of one ACK frame or timeout
#[derive(Debug)]
pub(super) struct AckOutcome {
    pub(super) result: AckResult,
    pub(super) space: SpaceId,
    pub(super) acked: Vec<(u64, SentPacket)>,
    pub(super) lost: Vec<(u64, SentPacket)>,
}

/// Work the connection must do after the retransmission timer fired
#[derive(Debug)]
pub(super) struct TimeoutOutcome {
    pub(super) mode: RetransmissionMode,
    pub(super) lost: Vec<(u64, SentPacket)>,
    /// Frames to resend immediately, grouped by the level they were first sent at
    pub(super) retransmit: Vec<(EncryptionLevel, Vec<Frame>, TransmissionType)>,
}

#[derive(Debug)]
struct AckInProgress {
    space: SpaceId,
    largest: u64,
    delay: Duration,
    newly_acked: Vec<u64>,
    unsent_acked: bool,
    timestamps: usize,
}

#[derive(Debug, Default)]
struct Space {
    packets: BTreeMap<u64, SentPacket>,
    largest_sent: Option<u64>,
    largest_acked: Option<u64>,
    /// Packet number deliberately left unused to elicit an immediate ACK
    skipped: Option<u64>,
    /// Earliest time a packet below `largest_acked` will cross the time threshold
    loss_time: Option<Instant>,
    time_of_last_ack_eliciting: Option<Instant>,
    ack_eliciting_in_flight: u64,
    discarded: bool,
}

/// Tracks outstanding packets, measures RTT, detects losses and schedules retransmissions
///
/// Congestion control is delegated to the owned [`SendAlgorithm`].
#[derive(Debug)]
pub(super) struct SentPacketTracker {
    spaces: [Space; 3],
    rtt: RttEstimator,
    send_algorithm: Box<dyn SendAlgorithm>,
    pacer: Option<Pacer>,
    scheme: RetransmissionScheme,
    max_tail_loss_probes: u32,
    packet_threshold: u32,
    time_threshold: f32,
    is_client: bool,
    bytes_in_flight: u64,
    peer_max_ack_delay: Duration,
    handshake_confirmed: bool,
    consecutive_tlp_count: u32,
    consecutive_rto_count: u32,
    consecutive_pto_count: u32,
    consecutive_crypto_retransmission_count: u32,
    /// Packets that may be sent regardless of the congestion window because a timer fired
    pending_timer_transmission_count: u32,
    /// Largest packet number sent when the most recent RTO fired
    largest_sent_before_rto: Option<u64>,
    last_send_time: Option<Instant>,
    last_crypto_send_time: Option<Instant>,
    ack_in_progress: Option<AckInProgress>,
}

impl SentPacketTracker {
    pub(super) fn new(
        config: &ConnectionConfig,
        send_algorithm: Box<dyn SendAlgorithm>,
        is_client: bool,
        mtu: u16,
        now: Instant,
    ) -> Self {
        let rtt = RttEstimator::new(config.initial_rtt);
        let pacer = config
            .pacing
            .then(|| Pacer::new(rtt.get(), send_algorithm.congestion_window(), mtu, now));
        Self {
            spaces: Default::default(),
            rtt,
            send_algorithm,
            pacer,
            scheme: config.retransmission,
            max_tail_loss_probes: config.max_tail_loss_probes,
            packet_threshold: config.packet_threshold,
            time_threshold: config.time_threshold,
            is_client,
            bytes_in_flight: 0,
            peer_max_ack_delay: Duration::from_millis(25),
            handshake_confirmed: false,
            consecutive_tlp_count: 0,
            consecutive_rto_count: 0,
            consecutive_pto_count: 0,
            consecutive_crypto_retransmission_count: 0,
            pending_timer_transmission_count: 0,
            largest_sent_before_rto: None,
            last_send_time: None,
            last_crypto_send_time: None,
            ack_in_progress: None,
        }
    }

    //
    // Sending
    //

    pub(super) fn on_packet_sent(
        &mut self,
        space_id: SpaceId,
        number: u64,
        packet: SentPacket,
        now: Instant,
    ) {
        let space = &mut self.spaces[space_id];
        debug_assert!(
            space.largest_sent.map_or(true, |largest| number > largest),
            "packet numbers must increase"
        );
        space.largest_sent = Some(number);
        self.last_send_time = Some(now);

        if packet.in_flight {
            self.send_algorithm.on_packet_sent(
                now,
                self.bytes_in_flight,
                number,
                packet.size.into(),
                !packet.retransmittable.is_empty(),
            );
            self.bytes_in_flight += u64::from(packet.size);
            if let Some(pacer) = &mut self.pacer {
                pacer.on_transmit(packet.size);
            }
        }
        if packet.ack_eliciting {
            space.time_of_last_ack_eliciting = Some(now);
            space.ack_eliciting_in_flight += 1;
            self.pending_timer_transmission_count =
                self.pending_timer_transmission_count.saturating_sub(1);
        }
        if packet.has_crypto() {
            self.last_crypto_send_time = Some(now);
        }
        space.packets.insert(number, packet);
    }

    /// Record that `number` was skipped, so that an ACK of it is recognised as bogus
    pub(super) fn on_packet_number_skipped(&mut self, space: SpaceId, number: u64) {
        let space = &mut self.spaces[space];
        space.skipped = Some(number);
        space.largest_sent = Some(number);
    }

    /// When the next packet may be sent, or `None` if the congestion window is full
    pub(super) fn next_send_time(&mut self, now: Instant, mtu: u16) -> Option<Instant> {
        if self.pending_timer_transmission_count > 0 {
            return Some(now);
        }
        let wait = self
            .send_algorithm
            .time_until_send(now, self.bytes_in_flight)?;
        let window = self.send_algorithm.congestion_window();
        let paced = match &mut self.pacer {
            Some(pacer) => pacer.delay(self.rtt.get(), mtu.into(), mtu, window.max(1), now),
            None => None,
        };
        Some(cmp::max(now + wait, paced.unwrap_or(now)))
    }

    pub(super) fn pending_timer_transmission_count(&self) -> u32 {
        self.pending_timer_transmission_count
    }

    //
    // ACK processing
    //

    pub(super) fn ack_in_progress(&self) -> bool {
        self.ack_in_progress.is_some()
    }

    pub(super) fn on_ack_frame_start(
        &mut self,
        space: SpaceId,
        largest_acked: u64,
        ack_delay: Duration,
    ) {
        debug_assert!(self.ack_in_progress.is_none());
        self.ack_in_progress = Some(AckInProgress {
            space,
            largest: largest_acked,
            delay: ack_delay,
            newly_acked: Vec::new(),
            unsent_acked: false,
            timestamps: 0,
        });
    }

    /// Acknowledge the packet numbers in `range`
    pub(super) fn on_ack_range(&mut self, range: std::ops::Range<u64>) {
        let Some(ack) = &mut self.ack_in_progress else {
            return;
        };
        let space = &self.spaces[ack.space];
        if space
            .skipped
            .is_some_and(|skipped| range.contains(&skipped))
            || space
                .largest_sent
                .map_or(true, |largest| range.end > largest + 1)
        {
            ack.unsent_acked = true;
        }
        ack.newly_acked
            .extend(space.packets.range(range).map(|(&pn, _)| pn));
    }

    pub(super) fn on_ack_timestamp(&mut self, number: u64, _timestamp: Duration) {
        if let Some(ack) = &mut self.ack_in_progress {
            trace!(number, "ack timestamp");
            ack.timestamps += 1;
        }
    }

    pub(super) fn on_ack_frame_end(&mut self, now: Instant) -> AckOutcome {
        let Some(ack) = self.ack_in_progress.take() else {
            return AckOutcome::empty(SpaceId::Data, AckResult::NoPacketsNewlyAcked);
        };
        let space_id = ack.space;
        if ack.unsent_acked {
            return AckOutcome::empty(space_id, AckResult::UnsentPacketsAcked);
        }
        if self.spaces[space_id].discarded {
            return AckOutcome::empty(space_id, AckResult::UnackablePacketsAcked);
        }

        if let Some(largest) = self.spaces[space_id].packets.get(&ack.largest) {
            if largest.ack_eliciting {
                let ack_delay = match space_id {
                    SpaceId::Data => cmp::min(ack.delay, self.peer_max_ack_delay),
                    _ => Duration::ZERO,
                };
                let sample = now.saturating_duration_since(largest.time_sent);
                self.rtt.update(ack_delay, sample);
            }
        }

        let space = &mut self.spaces[space_id];
        space.largest_acked = cmp::max(space.largest_acked, Some(ack.largest));

        let mut acked = Vec::with_capacity(ack.newly_acked.len());
        for pn in ack.newly_acked {
            let Some(packet) = space.packets.remove(&pn) else {
                continue;
            };
            if packet.ack_eliciting {
                space.ack_eliciting_in_flight -= 1;
            }
            if packet.in_flight {
                let prior_in_flight = self.bytes_in_flight;
                self.bytes_in_flight -= u64::from(packet.size);
                self.send_algorithm.on_packet_acked(
                    now,
                    pn,
                    packet.size.into(),
                    prior_in_flight,
                    &self.rtt,
                );
            }
            acked.push((pn, packet));
        }

        if !acked.is_empty() {
            if self.consecutive_rto_count > 0 {
                let verified = self
                    .largest_sent_before_rto
                    .is_some_and(|before| acked.iter().any(|&(pn, _)| pn > before));
                self.send_algorithm.on_retransmission_timeout(verified);
            }
            self.consecutive_tlp_count = 0;
            self.consecutive_rto_count = 0;
            self.consecutive_pto_count = 0;
            self.consecutive_crypto_retransmission_count = 0;
            self.pending_timer_transmission_count = 0;
        }

        let lost = self.detect_lost_packets(space_id, now);
        trace!(
            space = ?space_id,
            acked = acked.len(),
            lost = lost.len(),
            in_flight = self.bytes_in_flight,
            timestamps = ack.timestamps,
            "processed ACK"
        );

        AckOutcome {
            result: match acked.is_empty() {
                true => AckResult::NoPacketsNewlyAcked,
                false => AckResult::PacketsNewlyAcked,
            },
            space: space_id,
            acked,
            lost,
        }
    }

    /// Declare lost every packet below the largest acknowledged that crossed a threshold
    fn detect_lost_packets(&mut self, space_id: SpaceId, now: Instant) -> Vec<(u64, SentPacket)> {
        let rtt = cmp::max(self.rtt.latest(), self.rtt.get());
        let loss_delay = cmp::max(rtt.mul_f32(self.time_threshold), TIMER_GRANULARITY);
        let lost_send_time = now.checked_sub(loss_delay);
        let packet_threshold = u64::from(self.packet_threshold);

        let space = &mut self.spaces[space_id];
        space.loss_time = None;
        let Some(largest_acked) = space.largest_acked else {
            return Vec::new();
        };

        let mut lost_numbers = Vec::new();
        for (&pn, packet) in space.packets.range(..largest_acked) {
            if lost_send_time.is_some_and(|t| packet.time_sent <= t)
                || largest_acked >= pn + packet_threshold
            {
                lost_numbers.push(pn);
            } else {
                let when = packet.time_sent + loss_delay;
                space.loss_time = Some(space.loss_time.map_or(when, |t| cmp::min(t, when)));
            }
        }

        let mut lost = Vec::with_capacity(lost_numbers.len());
        for pn in lost_numbers {
            let Some(packet) = space.packets.remove(&pn) else {
                continue;
            };
            if packet.ack_eliciting {
                space.ack_eliciting_in_flight -= 1;
            }
            if packet.in_flight {
                let prior_in_flight = self.bytes_in_flight;
                self.bytes_in_flight -= u64::from(packet.size);
                if !packet.is_mtu_probe {
                    self.send_algorithm
                        .on_packet_lost(now, pn, packet.size.into(), prior_in_flight);
                }
            }
            lost.push((pn, packet));
        }
        lost
    }

    //
    // Timers
    //

    pub(super) fn retransmission_mode(&self) -> RetransmissionMode {
        if self.scheme == RetransmissionScheme::TlpRto
            && !self.handshake_confirmed
            && self.has_unacked_crypto_packets()
        {
            return RetransmissionMode::Handshake;
        }
        if self.spaces.iter().any(|s| s.loss_time.is_some()) {
            return RetransmissionMode::Loss;
        }
        if !self.has_ack_eliciting_in_flight() && !self.needs_anti_deadlock_probe() {
            // Nothing to probe for
            return RetransmissionMode::Loss;
        }
        match self.scheme {
            RetransmissionScheme::Pto => RetransmissionMode::Pto,
            RetransmissionScheme::TlpRto
                if self.consecutive_tlp_count < self.max_tail_loss_probes =>
            {
                RetransmissionMode::Tlp
            }
            RetransmissionScheme::TlpRto => RetransmissionMode::Rto,
        }
    }

    /// When the retransmission timer should fire, if at all
    pub(super) fn retransmission_deadline(&self) -> Option<Instant> {
        match self.retransmission_mode() {
            RetransmissionMode::Handshake => {
                Some(self.last_crypto_send_time? + self.crypto_retransmission_delay())
            }
            RetransmissionMode::Loss => self.spaces.iter().filter_map(|s| s.loss_time).min(),
            RetransmissionMode::Tlp => {
                Some(self.last_ack_eliciting_send_time()? + self.tail_loss_probe_delay())
            }
            RetransmissionMode::Rto => {
                Some(self.last_ack_eliciting_send_time()? + self.retransmission_delay())
            }
            RetransmissionMode::Pto => self.pto_deadline(),
        }
    }

    fn pto_deadline(&self) -> Option<Instant> {
        if !self.has_ack_eliciting_in_flight() {
            // Client anti-deadlock: the server may be blocked by its amplification limit
            return Some(self.last_send_time? + self.pto_delay(SpaceId::Handshake));
        }
        let handshake_in_flight = self.spaces[SpaceId::Initial].ack_eliciting_in_flight > 0
            || self.spaces[SpaceId::Handshake].ack_eliciting_in_flight > 0;
        SpaceId::iter()
            .filter(|&id| self.spaces[id].ack_eliciting_in_flight > 0)
            // Application data is only probed once the handshake no longer needs it
            .filter(|&id| id != SpaceId::Data || self.handshake_confirmed || !handshake_in_flight)
            .filter_map(|id| Some(self.spaces[id].time_of_last_ack_eliciting? + self.pto_delay(id)))
            .min()
    }

    /// Handle the retransmission timer firing
    pub(super) fn on_retransmission_timeout(&mut self, now: Instant) -> TimeoutOutcome {
        let mode = self.retransmission_mode();
        let mut outcome = TimeoutOutcome {
            mode,
            lost: Vec::new(),
            retransmit: Vec::new(),
        };
        match mode {
            RetransmissionMode::Handshake => {
                self.consecutive_crypto_retransmission_count += 1;
                for space_id in [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data] {
                    for packet in self.spaces[space_id].packets.values_mut() {
                        if !packet.has_crypto() {
                            continue;
                        }
                        let frames = mem::take(&mut packet.retransmittable);
                        outcome
                            .retransmit
                            .push((packet.level, frames, TransmissionType::Handshake));
                    }
                }
            }
            RetransmissionMode::Loss => {
                for space_id in SpaceId::iter() {
                    if self.spaces[space_id].loss_time.is_some_and(|t| t <= now) {
                        let lost = self.detect_lost_packets(space_id, now);
                        outcome.lost.extend(lost);
                    }
                }
            }
            RetransmissionMode::Tlp => {
                self.consecutive_tlp_count += 1;
                self.pending_timer_transmission_count = 1;
            }
            RetransmissionMode::Rto => {
                self.consecutive_rto_count += 1;
                self.largest_sent_before_rto = self.spaces[SpaceId::Data].largest_sent;
                self.pending_timer_transmission_count = MAX_RTO_PACKETS;
                for _ in 0..MAX_RTO_PACKETS {
                    match self.retransmit_data_of_space(SpaceId::Data) {
                        Some((level, frames)) => {
                            outcome.retransmit.push((level, frames, TransmissionType::Rto))
                        }
                        None => break,
                    }
                }
            }
            RetransmissionMode::Pto => {
                self.consecutive_pto_count += 1;
                self.pending_timer_transmission_count = MAX_PROBE_PACKETS_PER_PTO;
            }
        }
        debug!(?mode, pto_count = self.consecutive_pto_count, "retransmission timeout");
        outcome
    }

    /// Take the frames of the oldest ack-eliciting packet in `space` for resending
    ///
    /// The original stays outstanding so that a late acknowledgement is still recognised.
    pub(super) fn retransmit_data_of_space(
        &mut self,
        space: SpaceId,
    ) -> Option<(EncryptionLevel, Vec<Frame>)> {
        let packet = self.spaces[space]
            .packets
            .values_mut()
            .find(|p| p.in_flight && !p.retransmittable.is_empty())?;
        Some((packet.level, mem::take(&mut packet.retransmittable)))
    }

    /// The space a probe should be sent in: the one whose PTO would fire first
    pub(super) fn earliest_pto_space(&self) -> Option<SpaceId> {
        SpaceId::iter()
            .filter(|&id| self.spaces[id].ack_eliciting_in_flight > 0)
            .min_by_key(|&id| self.spaces[id].time_of_last_ack_eliciting)
    }

    fn needs_anti_deadlock_probe(&self) -> bool {
        self.is_client && !self.handshake_confirmed && self.last_send_time.is_some()
    }

    fn last_ack_eliciting_send_time(&self) -> Option<Instant> {
        self.spaces
            .iter()
            .filter_map(|s| s.time_of_last_ack_eliciting)
            .max()
    }

    fn crypto_retransmission_delay(&self) -> Duration {
        let delay = cmp::max(MIN_HANDSHAKE_TIMEOUT, self.rtt.get().mul_f32(1.5));
        delay * 2u32.pow(cmp::min(
            self.consecutive_crypto_retransmission_count,
            MAX_BACKOFF_EXPONENT,
        ))
    }

    fn tail_loss_probe_delay(&self) -> Duration {
        let srtt = self.rtt.get();
        let floor = if self.bytes_in_flight > u64::from(u16::MAX)
            || self.ack_eliciting_in_flight() > 1
        {
            MIN_TAIL_LOSS_PROBE_TIMEOUT
        } else {
            srtt.mul_f32(1.5) + MIN_RETRANSMISSION_TIME / 2
        };
        cmp::max(2 * srtt, floor)
    }

    /// Base RTO, without backoff
    fn rto_base(&self) -> Duration {
        if !self.rtt.has_samples() {
            return DEFAULT_RETRANSMISSION_TIME;
        }
        cmp::max(
            self.rtt.get() + 4 * self.rtt.var(),
            MIN_RETRANSMISSION_TIME,
        )
    }

    fn retransmission_delay(&self) -> Duration {
        self.rto_base() * 2u32.pow(cmp::min(self.consecutive_rto_count, MAX_BACKOFF_EXPONENT))
    }

    /// Probe timeout for `space`, including backoff
    pub(super) fn pto_delay(&self, space: SpaceId) -> Duration {
        self.pto_base(space)
            * 2u32.pow(cmp::min(self.consecutive_pto_count, MAX_BACKOFF_EXPONENT))
    }

    fn pto_base(&self, space: SpaceId) -> Duration {
        let max_ack_delay = match space {
            SpaceId::Data => self.peer_max_ack_delay,
            _ => Duration::ZERO,
        };
        self.rtt.pto_base() + max_ack_delay
    }

    /// Time without forward progress after which the path is considered degrading
    pub(super) fn path_degrading_delay(&self, num_ptos: u32) -> Duration {
        self.pto_base(SpaceId::Data) * num_ptos
    }

    /// Time without forward progress after which the network is considered a blackhole
    pub(super) fn network_blackhole_delay(&self, num_rtos: u32) -> Duration {
        self.consecutive_timeouts_delay(self.max_tail_loss_probes + num_rtos)
    }

    /// Time after which a raised packet length is suspected to be the cause of losses
    pub(super) fn mtu_reduction_delay(&self, num_rtos: u32) -> Duration {
        self.network_blackhole_delay(num_rtos / 2)
    }

    /// Total time spent waiting for `num_timeouts` consecutive timeouts to fire
    fn consecutive_timeouts_delay(&self, num_timeouts: u32) -> Duration {
        let num_tlps = cmp::min(num_timeouts, self.max_tail_loss_probes);
        let num_rtos = cmp::min(num_timeouts - num_tlps, MAX_BACKOFF_EXPONENT);
        let tlps = self.tail_loss_probe_delay() * num_tlps;
        // Each RTO doubles the previous one
        tlps + self.rto_base() * (2u32.pow(num_rtos) - 1)
    }

    //
    // State
    //

    pub(super) fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub(super) fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub(super) fn has_in_flight_packets(&self) -> bool {
        self.bytes_in_flight > 0
    }

    pub(super) fn has_ack_eliciting_in_flight(&self) -> bool {
        self.ack_eliciting_in_flight() > 0
    }

    fn ack_eliciting_in_flight(&self) -> u64 {
        self.spaces.iter().map(|s| s.ack_eliciting_in_flight).sum()
    }

    pub(super) fn has_unacked_crypto_packets(&self) -> bool {
        self.spaces
            .iter()
            .any(|s| s.packets.values().any(|p| p.has_crypto()))
    }

    pub(super) fn largest_sent(&self, space: SpaceId) -> Option<u64> {
        self.spaces[space].largest_sent
    }

    pub(super) fn largest_acked(&self, space: SpaceId) -> Option<u64> {
        self.spaces[space].largest_acked
    }

    /// Smallest packet number in `space` whose fate is unknown
    pub(super) fn least_unacked(&self, space: SpaceId) -> u64 {
        let space = &self.spaces[space];
        space
            .packets
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| space.largest_sent.map_or(0, |pn| pn + 1))
    }

    pub(super) fn outstanding_packets(&self) -> usize {
        self.spaces.iter().map(|s| s.packets.len()).sum()
    }

    pub(super) fn outstanding(&self, space: SpaceId) -> btree_map::Keys<'_, u64, SentPacket> {
        self.spaces[space].packets.keys()
    }

    pub(super) fn consecutive_pto_count(&self) -> u32 {
        self.consecutive_pto_count
    }

    pub(super) fn congestion_window(&self) -> u64 {
        self.send_algorithm.congestion_window()
    }

    pub(super) fn set_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
    }

    pub(super) fn set_peer_max_ack_delay(&mut self, value: Duration) {
        self.peer_max_ack_delay = value;
    }

    pub(super) fn on_mtu_update(&mut self, mtu: u16) {
        self.send_algorithm.on_mtu_update(mtu);
    }

    /// Drop all packets of a space whose keys are gone, without informing congestion control
    pub(super) fn neuter_packets(&mut self, space_id: SpaceId) {
        let space = &mut self.spaces[space_id];
        for packet in mem::take(&mut space.packets).into_values() {
            if packet.in_flight {
                self.bytes_in_flight -= u64::from(packet.size);
            }
        }
        space.ack_eliciting_in_flight = 0;
        space.loss_time = None;
        space.time_of_last_ack_eliciting = None;
        space.discarded = true;
        if space_id != SpaceId::Data {
            self.consecutive_pto_count = 0;
        }
    }

    //
    // Migration
    //

    /// Install `replacement`, returning the previous owner's state
    pub(super) fn replace_send_algorithm(
        &mut self,
        replacement: Box<dyn SendAlgorithm>,
    ) -> Box<dyn SendAlgorithm> {
        mem::replace(&mut self.send_algorithm, replacement)
    }

    /// Install `replacement`, returning the previous RTT state
    pub(super) fn replace_rtt(&mut self, replacement: RttEstimator) -> RttEstimator {
        mem::replace(&mut self.rtt, replacement)
    }

    /// The peer address changed
    ///
    /// With `reset_send_algorithm`, a fresh controller was installed: packets sent on the old
    /// path remain tracked for acknowledgement, but no longer occupy the new path's window.
    /// Otherwise the existing controller is told and keeps its in-flight accounting.
    pub(super) fn on_connection_migration(&mut self, reset_send_algorithm: bool) {
        if reset_send_algorithm {
            for space in &mut self.spaces {
                for packet in space.packets.values_mut() {
                    packet.in_flight = false;
                }
            }
            self.bytes_in_flight = 0;
        } else {
            self.send_algorithm.on_connection_migration();
        }
        self.consecutive_tlp_count = 0;
        self.consecutive_rto_count = 0;
        self.consecutive_pto_count = 0;
    }

    /// Frames of every outstanding packet sent on the previous path that still need delivery
    pub(super) fn take_retransmittable_data(&mut self) -> Vec<(EncryptionLevel, Vec<Frame>)> {
        let mut frames = Vec::new();
        for space in &mut self.spaces {
            for packet in space.packets.values_mut() {
                if !packet.retransmittable.is_empty() {
                    frames.push((packet.level, mem::take(&mut packet.retransmittable)));
                }
            }
        }
        frames
    }
}

impl AckOutcome {
    fn empty(space: SpaceId, result: AckResult) -> Self {
        Self {
            result,
            space,
            acked: Vec::new(),
            lost: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::congestion::{ControllerFactory, FixedWindowConfig};

    fn tracker(scheme: RetransmissionScheme) -> (SentPacketTracker, Instant) {
        let mut config = ConnectionConfig::default();
        config.retransmission(scheme).pacing(false);
        let now = Instant::now();
        let cc = Arc::new(FixedWindowConfig::default()).build(now, 1200);
        (SentPacketTracker::new(&config, cc, false, 1200, now), now)
    }

    fn data_packet(now: Instant) -> SentPacket {
        SentPacket {
            level: EncryptionLevel::ForwardSecure,
            transmission: TransmissionType::NotRetransmission,
            time_sent: now,
            size: 1000,
            in_flight: true,
            ack_eliciting: true,
            retransmittable: vec![Frame::MaxData(100)],
            largest_acked: None,
            is_mtu_probe: false,
        }
    }

    fn ack(
        tracker: &mut SentPacketTracker,
        largest: u64,
        ranges: &[std::ops::Range<u64>],
        now: Instant,
    ) -> AckOutcome {
        tracker.on_ack_frame_start(SpaceId::Data, largest, Duration::ZERO);
        for range in ranges {
            tracker.on_ack_range(range.clone());
        }
        tracker.on_ack_frame_end(now)
    }

    #[test]
    fn ack_removes_packets_and_samples_rtt() {
        let (mut tracker, now) = tracker(RetransmissionScheme::Pto);
        for pn in 0..3 {
            tracker.on_packet_sent(SpaceId::Data, pn, data_packet(now), now);
        }
        assert_eq!(tracker.bytes_in_flight(), 3000);

        let later = now + Duration::from_millis(30);
        let outcome = ack(&mut tracker, 2, &[2..3, 0..2], later);
        assert_eq!(outcome.result, AckResult::PacketsNewlyAcked);
        assert_eq!(outcome.acked.len(), 3);
        assert_eq!(tracker.rtt().get(), Duration::from_millis(30));
        assert_eq!(tracker.bytes_in_flight(), 0);

        // Acknowledging the same packets again is harmless
        let outcome = ack(&mut tracker, 2, &[0..3], later);
        assert_eq!(outcome.result, AckResult::NoPacketsNewlyAcked);
    }

    #[test]
    fn packet_threshold_loss() {
        let (mut tracker, now) = tracker(RetransmissionScheme::Pto);
        for pn in 0..5 {
            tracker.on_packet_sent(SpaceId::Data, pn, data_packet(now), now);
        }
        let outcome = ack(&mut tracker, 4, &[3..5], now);
        let lost = outcome.lost.iter().map(|&(pn, _)| pn).collect::<Vec<_>>();
        assert_eq!(lost, vec![0, 1]);
        // Packet 2 waits for the time threshold
        assert_eq!(tracker.retransmission_mode(), RetransmissionMode::Loss);
        assert!(tracker.retransmission_deadline().is_some());
    }

    #[test]
    fn acking_unsent_packet_is_detected() {
        let (mut tracker, now) = tracker(RetransmissionScheme::Pto);
        tracker.on_packet_sent(SpaceId::Data, 0, data_packet(now), now);
        tracker.on_packet_number_skipped(SpaceId::Data, 1);
        tracker.on_packet_sent(SpaceId::Data, 2, data_packet(now), now);
        let outcome = ack(&mut tracker, 2, &[0..3], now);
        assert_eq!(outcome.result, AckResult::UnsentPacketsAcked);
        assert_eq!(tracker.outstanding_packets(), 2);
    }

    #[test]
    fn pto_backs_off() {
        let (mut tracker, now) = tracker(RetransmissionScheme::Pto);
        tracker.on_packet_sent(SpaceId::Data, 0, data_packet(now), now);
        tracker.set_handshake_confirmed();
        let first = tracker.retransmission_deadline().unwrap();
        let outcome = tracker.on_retransmission_timeout(first);
        assert_eq!(outcome.mode, RetransmissionMode::Pto);
        assert_eq!(tracker.pending_timer_transmission_count(), 2);
        let second = tracker.retransmission_deadline().unwrap();
        assert_eq!(second - now, 2 * (first - now));
    }

    #[test]
    fn quiescence_is_loss_mode() {
        let (mut tracker, now) = tracker(RetransmissionScheme::Pto);
        tracker.set_handshake_confirmed();
        assert_eq!(tracker.retransmission_mode(), RetransmissionMode::Loss);
        assert_eq!(tracker.retransmission_deadline(), None);
        let outcome = tracker.on_retransmission_timeout(now);
        assert_eq!(outcome.mode, RetransmissionMode::Loss);
        assert!(outcome.lost.is_empty());
        assert_eq!(tracker.pending_timer_transmission_count(), 0);
    }

    #[test]
    fn tlp_then_rto() {
        let (mut tracker, now) = tracker(RetransmissionScheme::TlpRto);
        tracker.set_handshake_confirmed();
        tracker.on_packet_sent(SpaceId::Data, 0, data_packet(now), now);
        for _ in 0..2 {
            assert_eq!(tracker.retransmission_mode(), RetransmissionMode::Tlp);
            tracker.on_retransmission_timeout(now);
        }
        assert_eq!(tracker.retransmission_mode(), RetransmissionMode::Rto);
        let outcome = tracker.on_retransmission_timeout(now);
        assert_matches!(
            outcome.retransmit.as_slice(),
            [(EncryptionLevel::ForwardSecure, frames, TransmissionType::Rto)]
                if frames == &vec![Frame::MaxData(100)]
        );
    }

    #[test]
    fn send_algorithm_ownership_moves() {
        let (mut tracker, now) = tracker(RetransmissionScheme::Pto);
        let mut config = FixedWindowConfig::default();
        config.window_packets(2);
        let small = Arc::new(config).build(now, 1200);
        let old = tracker.replace_send_algorithm(small);
        assert_eq!(old.congestion_window(), 32 * 1200);
        assert_eq!(tracker.congestion_window(), 2 * 1200);
    }

    #[test]
    fn neutered_space_rejects_acks() {
        let (mut tracker, now) = tracker(RetransmissionScheme::Pto);
        let mut packet = data_packet(now);
        packet.level = EncryptionLevel::Initial;
        tracker.on_packet_sent(SpaceId::Initial, 0, packet, now);
        tracker.neuter_packets(SpaceId::Initial);
        assert_eq!(tracker.bytes_in_flight(), 0);
        tracker.on_ack_frame_start(SpaceId::Initial, 0, Duration::ZERO);
        tracker.on_ack_range(0..1);
        assert_eq!(
            tracker.on_ack_frame_end(now).result,
            AckResult::UnackablePacketsAcked
        );
    }
}
