use std::cmp;

use tracing::{debug, trace};

use crate::{Duration, Instant};

/// What the network blackhole alarm found
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum BlackholeEvent {
    /// No forward progress for a while; the session may want to migrate
    PathDegrading,
    /// No forward progress for long enough that the path is considered dead
    Blackhole,
    /// Losses started after the packet length was raised
    MtuReduction,
}

/// Watches for a lack of forward progress while data is outstanding
///
/// Three independent deadlines are armed together when retransmittable data goes out and
/// cleared when an acknowledgement shows progress. A detector stopped permanently, on close,
/// ignores every later restart.
#[derive(Debug, Default)]
pub(super) struct BlackholeDetector {
    path_degrading: Option<Instant>,
    blackhole: Option<Instant>,
    mtu_reduction: Option<Instant>,
    permanently_stopped: bool,
}

impl BlackholeDetector {
    pub(super) fn restart(
        &mut self,
        path_degrading: Option<Instant>,
        blackhole: Option<Instant>,
        mtu_reduction: Option<Instant>,
    ) {
        if self.permanently_stopped {
            return;
        }
        trace!(?path_degrading, ?blackhole, ?mtu_reduction, "blackhole detection armed");
        self.path_degrading = path_degrading;
        self.blackhole = blackhole;
        self.mtu_reduction = mtu_reduction;
    }

    pub(super) fn stop(&mut self, permanently: bool) {
        self.path_degrading = None;
        self.blackhole = None;
        self.mtu_reduction = None;
        self.permanently_stopped |= permanently;
    }

    pub(super) fn is_in_progress(&self) -> bool {
        self.deadline().is_some()
    }

    /// The earliest armed deadline
    pub(super) fn deadline(&self) -> Option<Instant> {
        [self.path_degrading, self.blackhole, self.mtu_reduction]
            .into_iter()
            .flatten()
            .min()
    }

    /// The alarm fired; report the earliest expired deadline, if any
    pub(super) fn on_alarm(&mut self, now: Instant) -> Option<BlackholeEvent> {
        let deadline = self.deadline().filter(|&d| d <= now)?;
        let event = if self.path_degrading == Some(deadline) {
            self.path_degrading = None;
            BlackholeEvent::PathDegrading
        } else if self.mtu_reduction == Some(deadline) {
            self.mtu_reduction = None;
            BlackholeEvent::MtuReduction
        } else {
            // Nothing else matters once the path is dead
            self.stop(false);
            BlackholeEvent::Blackhole
        };
        debug!(?event, "blackhole detector fired");
        Some(event)
    }
}

/// What the idle alarm found
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum IdleEvent {
    HandshakeTimeout,
    IdleTimeout,
}

/// Closes connections whose handshake takes too long or that have gone quiet
///
/// Activity is a received packet, or the first packet sent after one. Later sends without
/// anything received in between do not extend the deadline, so a peer that vanished is
/// eventually noticed even while this side keeps retransmitting.
#[derive(Debug)]
pub(super) struct IdleDetector {
    /// Applies until the handshake completes
    handshake_timeout: Option<Duration>,
    idle_timeout: Duration,
    /// Floor of the idle timeout, three probe timeouts as of the last send
    min_idle: Duration,
    start_time: Instant,
    last_received: Instant,
    first_sent_after_receiving: Option<Instant>,
    stopped: bool,
}

impl IdleDetector {
    pub(super) fn new(handshake_timeout: Duration, idle_timeout: Duration, now: Instant) -> Self {
        Self {
            handshake_timeout: Some(handshake_timeout),
            idle_timeout,
            min_idle: Duration::ZERO,
            start_time: now,
            last_received: now,
            first_sent_after_receiving: None,
            stopped: false,
        }
    }

    /// The handshake finished; only the idle timeout applies from now on
    pub(super) fn on_handshake_complete(&mut self) {
        self.handshake_timeout = None;
    }

    pub(super) fn on_packet_received(&mut self, now: Instant) {
        self.last_received = cmp::max(self.last_received, now);
    }

    pub(super) fn on_packet_sent(&mut self, now: Instant, pto_delay: Duration) {
        self.min_idle = 3 * pto_delay;
        if self
            .first_sent_after_receiving
            .is_some_and(|t| t > self.last_received)
        {
            return;
        }
        self.first_sent_after_receiving = Some(cmp::max(now, self.last_received));
    }

    fn last_network_activity(&self) -> Instant {
        cmp::max(
            self.last_received,
            self.first_sent_after_receiving.unwrap_or(self.last_received),
        )
    }

    pub(super) fn deadline(&self) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        let idle = self.last_network_activity() + cmp::max(self.idle_timeout, self.min_idle);
        let handshake = self.handshake_timeout.map(|t| self.start_time + t);
        Some(handshake.map_or(idle, |h| cmp::min(h, idle)))
    }

    pub(super) fn on_alarm(&mut self, now: Instant) -> Option<IdleEvent> {
        let deadline = self.deadline().filter(|&d| d <= now)?;
        self.stopped = true;
        if self
            .handshake_timeout
            .is_some_and(|t| self.start_time + t == deadline)
        {
            return Some(IdleEvent::HandshakeTimeout);
        }
        Some(IdleEvent::IdleTimeout)
    }

    pub(super) fn stop(&mut self) {
        self.stopped = true;
    }
}
