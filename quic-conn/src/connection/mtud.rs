use tracing::{debug, trace};

use crate::config::MtuDiscoveryConfig;

/// Searches for a larger packet length by sending padded probes
///
/// There is a single probe target. Probes go out once enough packets were sent since the last
/// one, and each unanswered probe doubles that gap. An acknowledged probe raises the packet
/// length and ends the search; the previous length is remembered so that it can be restored if
/// the larger packets turn out to be dropped.
#[derive(Debug, Clone)]
pub(super) struct MtuDiscoverer {
    state: Option<Search>,
    /// Length in use before the last successful probe
    prev_validated: Option<u16>,
}

#[derive(Debug, Clone)]
struct Search {
    target: u16,
    packets_between_probes: u64,
    remaining_probes: u32,
    /// Packet number at or after which the next probe may be sent
    next_probe_at: u64,
    in_flight: Option<u64>,
}

impl MtuDiscoverer {
    pub(super) fn disabled() -> Self {
        Self {
            state: None,
            prev_validated: None,
        }
    }

    /// Start searching once the packet number space reaches `largest_sent` plus the gap
    pub(super) fn enable(&mut self, config: &MtuDiscoveryConfig, current: u16, largest_sent: u64) {
        if config.upper_bound <= current || config.max_probes == 0 {
            return;
        }
        debug!(target = config.upper_bound, "enabling MTU discovery");
        self.state = Some(Search {
            target: config.upper_bound,
            packets_between_probes: config.packets_between_probes,
            remaining_probes: config.max_probes,
            next_probe_at: largest_sent + config.packets_between_probes,
            in_flight: None,
        });
    }

    /// Whether a probe should be sent now that `largest_sent` is the latest packet number
    pub(super) fn should_probe(&self, largest_sent: u64) -> bool {
        self.state.as_ref().is_some_and(|s| {
            s.in_flight.is_none() && s.remaining_probes > 0 && largest_sent >= s.next_probe_at
        })
    }

    /// Length of the next probe
    pub(super) fn probe_length(&self) -> Option<u16> {
        self.state.as_ref().map(|s| s.target)
    }

    pub(super) fn on_probe_sent(&mut self, number: u64) {
        let Some(state) = &mut self.state else {
            return;
        };
        state.packets_between_probes = state.packets_between_probes.saturating_mul(2);
        state.next_probe_at = number + state.packets_between_probes + 1;
        state.remaining_probes -= 1;
        state.in_flight = Some(number);
        trace!(number, remaining = state.remaining_probes, "MTU probe sent");
    }

    /// Returns the new packet length if `number` was the outstanding probe
    pub(super) fn on_packet_acked(&mut self, number: u64, current: u16) -> Option<u16> {
        let state = self.state.as_ref()?;
        if state.in_flight != Some(number) {
            return None;
        }
        let target = state.target;
        debug!(from = current, to = target, "MTU probe acknowledged");
        self.state = None;
        self.prev_validated = Some(current);
        Some(target)
    }

    pub(super) fn on_packet_lost(&mut self, number: u64) {
        if let Some(state) = &mut self.state {
            if state.in_flight == Some(number) {
                trace!(number, "MTU probe lost");
                state.in_flight = None;
                if state.remaining_probes == 0 {
                    self.state = None;
                }
            }
        }
    }

    /// Stop probing for good
    pub(super) fn disable(&mut self) {
        self.state = None;
    }

    /// Packet length to fall back to if the raised one appears to be dropped
    pub(super) fn prev_validated(&self) -> Option<u16> {
        self.prev_validated
    }

    /// Forget the previous length after reverting to it
    pub(super) fn take_prev_validated(&mut self) -> Option<u16> {
        self.prev_validated.take()
    }
}
