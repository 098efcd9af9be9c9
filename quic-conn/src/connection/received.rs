use std::{cmp, mem};

use tracing::trace;

use crate::{
    Duration, Instant, SpaceId,
    config::AckDecimationConfig,
    frame::{Ack, AckFrequency},
    range_set::RangeSet,
};

/// Maximum number of ranges reported in one ACK frame
const MAX_ACK_RANGES: usize = 64;

/// Tracks received packet numbers and decides when to acknowledge them
#[derive(Debug)]
pub(super) struct ReceivedPacketManager {
    spaces: [ReceivedPackets; 3],
    config: AckDecimationConfig,
    max_ack_delay: Duration,
    /// Peer-requested override of `config.ack_eliciting_threshold` and `max_ack_delay`
    peer_request: Option<AckFrequency>,
}

impl ReceivedPacketManager {
    pub(super) fn new(config: AckDecimationConfig, max_ack_delay: Duration) -> Self {
        Self {
            spaces: Default::default(),
            config,
            max_ack_delay,
            peer_request: None,
        }
    }

    /// Whether a packet with this number may still be processed
    ///
    /// False for duplicates and for packets below the peer's least-unacked hint.
    pub(super) fn is_awaiting_packet(&self, space: SpaceId, number: u64) -> bool {
        let space = &self.spaces[space];
        number >= space.least_awaited && !space.dedup.is_duplicate(number)
    }

    pub(super) fn largest_observed(&self, space: SpaceId) -> Option<u64> {
        self.spaces[space].largest.map(|(pn, _)| pn)
    }

    pub(super) fn largest_received(&self) -> [Option<u64>; 3] {
        [
            self.largest_observed(SpaceId::Initial),
            self.largest_observed(SpaceId::Handshake),
            self.largest_observed(SpaceId::Data),
        ]
    }

    /// Record a fully processed packet
    pub(super) fn record_packet_received(
        &mut self,
        space_id: SpaceId,
        number: u64,
        now: Instant,
        ack_eliciting: bool,
        min_rtt: Duration,
    ) {
        let space = &mut self.spaces[space_id];
        if space.dedup.insert(number) {
            // Callers check `is_awaiting_packet` first
            trace!(number, "recorded duplicate packet");
            return;
        }

        let previous_largest = space.largest.map(|(pn, _)| pn);
        let out_of_order = match previous_largest {
            Some(largest) => number < largest || number > largest + 1,
            None => false,
        };
        if previous_largest.map_or(true, |largest| number > largest) {
            space.largest = Some((number, now));
        }
        space.ranges.insert_one(number);
        while space.ranges.len() > MAX_ACK_RANGES {
            space.ranges.pop_min();
        }
        space.packets_received += 1;
        space.ack_frame_updated = true;

        if !ack_eliciting {
            return;
        }
        space.ack_eliciting_since_last_ack += 1;

        if space_id != SpaceId::Data || out_of_order {
            // Handshake progress and gaps are reported without delay
            space.ack_timeout = Some(now);
            return;
        }

        let decimating = self.config.enabled
            && space.packets_received >= self.config.min_received_before_decimation;
        let (threshold, max_delay) = match self.peer_request {
            Some(ref req) => (req.ack_eliciting_threshold + 1, req.request_max_ack_delay),
            None if decimating => (
                self.config.decimated_ack_frequency,
                cmp::min(
                    self.max_ack_delay,
                    Duration::from_nanos(
                        (min_rtt.as_nanos() as f64
                            * f64::from(self.config.delay_fraction_of_min_rtt))
                            as u64,
                    ),
                ),
            ),
            None => (self.config.ack_eliciting_threshold, self.max_ack_delay),
        };

        if space.ack_eliciting_since_last_ack >= threshold {
            space.ack_timeout = Some(now);
            return;
        }
        let deadline = now + max_delay;
        space.ack_timeout = Some(space.ack_timeout.map_or(deadline, |t| cmp::min(t, deadline)));
    }

    /// Build an ACK frame for everything received in `space`, if anything new arrived
    pub(super) fn ack_frame(&self, space: SpaceId, now: Instant) -> Option<Ack> {
        let space = &self.spaces[space];
        if !space.ack_frame_updated {
            return None;
        }
        let (_, received) = space.largest?;
        Ack::new(space.ranges.clone(), now.saturating_duration_since(received))
    }

    /// Whether an ACK should be bundled with whatever is sent next
    pub(super) fn ack_pending(&self, space: SpaceId) -> bool {
        self.spaces[space].ack_frame_updated
    }

    /// Deadline of the delayed ACK in `space`
    pub(super) fn ack_timeout(&self, space: SpaceId) -> Option<Instant> {
        self.spaces[space].ack_timeout
    }

    /// Earliest delayed ACK deadline over all spaces
    pub(super) fn earliest_ack_timeout(&self) -> Option<Instant> {
        self.spaces.iter().filter_map(|s| s.ack_timeout).min()
    }

    /// An ACK frame for `space` was just sent
    pub(super) fn on_ack_sent(&mut self, space: SpaceId) {
        let space = &mut self.spaces[space];
        space.ack_frame_updated = false;
        space.ack_timeout = None;
        space.ack_eliciting_since_last_ack = 0;
    }

    /// The peer promised not to retransmit anything below `least_unacked`
    pub(super) fn dont_wait_for_packets_before(&mut self, space: SpaceId, least_unacked: u64) {
        let space = &mut self.spaces[space];
        if least_unacked <= space.least_awaited {
            return;
        }
        space.least_awaited = least_unacked;
        if space.ranges.remove(0..least_unacked) {
            space.ack_frame_updated = !space.ranges.is_empty();
        }
    }

    /// The peer acknowledged a packet of ours that carried an ACK frame up to `largest`
    ///
    /// The peer knows about everything below `largest`; stop reporting it.
    pub(super) fn on_ack_of_ack(&mut self, space: SpaceId, largest: u64) {
        self.spaces[space].ranges.remove(0..largest);
    }

    pub(super) fn set_peer_ack_frequency(&mut self, frame: AckFrequency) -> bool {
        if self
            .peer_request
            .is_some_and(|current| current.sequence >= frame.sequence)
        {
            return false;
        }
        self.peer_request = Some(frame);
        true
    }

    /// Forget all state of a space whose keys were dropped
    pub(super) fn discard(&mut self, space: SpaceId) {
        let largest = mem::take(&mut self.spaces[space]).largest;
        // Keep the largest seen so that stragglers are still recognised as old
        self.spaces[space].largest = largest;
        if let Some((largest, _)) = largest {
            self.spaces[space].least_awaited = largest + 1;
        }
    }
}

#[derive(Debug, Default)]
struct ReceivedPackets {
    dedup: Dedup,
    /// Packet numbers to report in the next ACK frame
    ranges: RangeSet,
    /// Largest packet number received and when it arrived
    largest: Option<(u64, Instant)>,
    /// Smallest packet number the peer may still send
    least_awaited: u64,
    packets_received: u64,
    ack_eliciting_since_last_ack: u64,
    /// Whether `ranges` changed since the last ACK frame was sent
    ack_frame_updated: bool,
    ack_timeout: Option<Instant>,
}

/// RFC4303-style sliding window packet number deduplicator.
///
/// A contiguous bitfield, where each bit corresponds to a packet number and the rightmost bit is
/// always set. A set bit represents a packet that has been successfully processed. Bits to the left
/// of the window are assumed to be set.
#[derive(Debug, Default)]
struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated.
    next: u64,
}

/// Inner bitfield type.
///
/// Because QUIC never reuses packet numbers, this only needs to be large enough to deal with
/// packets that are reordered but still delivered in a timely manner.
type Window = u128;

/// Number of packets tracked by `Dedup`.
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    /// Highest packet number authenticated.
    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Whether `packet` was already recorded, without recording it
    fn is_duplicate(&self, packet: u64) -> bool {
        if packet >= self.next {
            return false;
        }
        let offset = self.highest() - packet;
        match offset.checked_sub(1) {
            None => true,
            Some(bit) if bit < WINDOW_SIZE - 1 => self.window & (1 << bit) != 0,
            Some(_) => true,
        }
    }

    /// Record a newly authenticated packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of window
            self.window = ((self.window << 1) | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}
