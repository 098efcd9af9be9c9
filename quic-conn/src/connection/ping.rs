use std::cmp;

use tracing::trace;

use crate::{Duration, Instant, Side, config::PingConfig};

/// Decides when a PING keeps the connection alive or the path busy
///
/// Two deadlines are tracked. The keep-alive deadline fires after a quiet period while the
/// session wants the connection kept open. The retransmittable-on-wire deadline fires sooner,
/// when nothing ack-eliciting is in flight, so that path problems are noticed quickly; it backs
/// off exponentially once it fired too often in a row.
#[derive(Debug)]
pub(super) struct PingManager {
    side: Side,
    keep_alive: Option<Duration>,
    initial_retransmittable_on_wire: Option<Duration>,
    max_aggressive: u32,
    max_total: u32,
    /// Retransmittable-on-wire pings sent since the peer last sent something retransmittable
    consecutive_retransmittable_on_wire: u32,
    /// Retransmittable-on-wire pings sent over the connection's lifetime
    retransmittable_on_wire_count: u32,
    keep_alive_deadline: Option<Instant>,
    retransmittable_on_wire_deadline: Option<Instant>,
}

impl PingManager {
    pub(super) fn new(config: &PingConfig, side: Side) -> Self {
        Self {
            side,
            keep_alive: config.keep_alive,
            initial_retransmittable_on_wire: config.retransmittable_on_wire,
            max_aggressive: config.max_aggressive_retransmittable_on_wire_pings,
            max_total: config.max_retransmittable_on_wire_pings,
            consecutive_retransmittable_on_wire: 0,
            retransmittable_on_wire_count: 0,
            keep_alive_deadline: None,
            retransmittable_on_wire_deadline: None,
        }
    }

    /// Recompute the deadlines, returning when the ping timer should fire
    pub(super) fn set_alarm(
        &mut self,
        now: Instant,
        should_keep_alive: bool,
        has_in_flight_packets: bool,
    ) -> Option<Instant> {
        self.update_deadlines(now, should_keep_alive, has_in_flight_packets);
        self.earliest_deadline()
    }

    /// The ping timer fired; returns whether a PING should be sent
    pub(super) fn on_alarm(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.earliest_deadline() else {
            return false;
        };
        if deadline > now {
            return false;
        }
        if self.retransmittable_on_wire_deadline == Some(deadline) {
            self.consecutive_retransmittable_on_wire += 1;
            self.retransmittable_on_wire_count += 1;
            trace!(
                consecutive = self.consecutive_retransmittable_on_wire,
                "retransmittable-on-wire ping"
            );
        } else {
            trace!("keep-alive ping");
        }
        self.retransmittable_on_wire_deadline = None;
        self.keep_alive_deadline = None;
        true
    }

    /// The peer sent something retransmittable, so the path is evidently alive
    pub(super) fn reset_consecutive_retransmittable_on_wire_count(&mut self) {
        self.consecutive_retransmittable_on_wire = 0;
    }

    pub(super) fn stop(&mut self) {
        self.keep_alive_deadline = None;
        self.retransmittable_on_wire_deadline = None;
    }

    fn update_deadlines(&mut self, now: Instant, should_keep_alive: bool, has_in_flight: bool) {
        self.keep_alive_deadline = None;
        self.retransmittable_on_wire_deadline = None;
        if !should_keep_alive {
            self.consecutive_retransmittable_on_wire = 0;
            return;
        }
        if self.side.is_server() && self.initial_retransmittable_on_wire.is_none() {
            // Servers only ping to keep the path busy, never to keep it open
            return;
        }
        if let Some(keep_alive) = self.keep_alive {
            self.keep_alive_deadline = Some(now + keep_alive);
        }

        let Some(initial) = self.initial_retransmittable_on_wire else {
            return;
        };
        if has_in_flight || self.retransmittable_on_wire_count > self.max_total {
            return;
        }
        let mut timeout = initial;
        if self.consecutive_retransmittable_on_wire > self.max_aggressive {
            let excess = self.consecutive_retransmittable_on_wire - self.max_aggressive;
            let shift = cmp::min(excess, 10);
            timeout = initial * (1 << shift);
        }
        if self.keep_alive.map_or(true, |keep_alive| timeout < keep_alive) {
            self.retransmittable_on_wire_deadline = Some(now + timeout);
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        match (self.keep_alive_deadline, self.retransmittable_on_wire_deadline) {
            (Some(a), Some(b)) => Some(cmp::min(a, b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(rtow: Option<Duration>) -> PingManager {
        let mut config = PingConfig::default();
        config
            .retransmittable_on_wire(rtow)
            .max_aggressive_retransmittable_on_wire_pings(2)
            .max_retransmittable_on_wire_pings(4);
        PingManager::new(&config, Side::Client)
    }

    #[test]
    fn keep_alive_only_when_wanted() {
        let now = Instant::now();
        let mut pings = manager(None);
        assert_eq!(pings.set_alarm(now, false, false), None);
        assert_eq!(
            pings.set_alarm(now, true, true),
            Some(now + Duration::from_secs(15))
        );
        assert!(!pings.on_alarm(now));
        assert!(pings.on_alarm(now + Duration::from_secs(15)));
    }

    #[test]
    fn server_does_not_keep_alive() {
        let now = Instant::now();
        let mut pings = PingManager::new(&PingConfig::default(), Side::Server);
        assert_eq!(pings.set_alarm(now, true, false), None);
    }

    #[test]
    fn retransmittable_on_wire_backs_off() {
        let now = Instant::now();
        let initial = Duration::from_millis(200);
        let mut pings = manager(Some(initial));
        // Suppressed while something is in flight
        assert_eq!(pings.set_alarm(now, true, true), Some(now + Duration::from_secs(15)));

        let mut delays = Vec::new();
        for _ in 0..4 {
            let deadline = pings.set_alarm(now, true, false).unwrap();
            delays.push(deadline - now);
            assert!(pings.on_alarm(deadline));
        }
        assert_eq!(delays, vec![initial, initial, initial, initial * 2]);

        pings.reset_consecutive_retransmittable_on_wire_count();
        assert_eq!(pings.set_alarm(now, true, false), Some(now + initial));
        assert!(pings.on_alarm(now + initial));
        // The lifetime cap is reached
        assert_eq!(pings.set_alarm(now, true, false), Some(now + Duration::from_secs(15)));
    }
}
