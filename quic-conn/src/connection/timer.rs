use crate::Instant;

/// Alarms owned by a connection
///
/// The connection keeps one deadline per alarm and dispatches expired ones from
/// [`Connection::handle_timeout`](super::Connection::handle_timeout).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum Timer {
    /// When to send an ACK that has been held back
    Ack = 0,
    /// When to run loss detection, a tail loss probe, RTO or PTO
    Retransmission = 1,
    /// When pacing will allow us to send a packet
    Send = 2,
    /// When to send a keep-alive or retransmittable-on-wire PING
    Ping = 3,
    /// When to send the next MTU probe
    MtuDiscovery = 4,
    /// When to retry packets that arrived before their keys
    ProcessUndecryptable = 5,
    /// When to drop the 1-RTT keys of the previous key phase
    DiscardPreviousOneRttKeys = 6,
    /// When to drop 0-RTT keys after 1-RTT packets have been received
    DiscardZeroRttKeys = 7,
    /// When the handshake or idle timeout closes the connection
    IdleNetwork = 8,
    /// When the path is degrading, the network is a blackhole, or the MTU must be reverted
    NetworkBlackhole = 9,
    /// When to resend a PATH_CHALLENGE or give up on validation
    PathValidation = 10,
}

impl Timer {
    pub(crate) const VALUES: [Self; 11] = [
        Self::Ack,
        Self::Retransmission,
        Self::Send,
        Self::Ping,
        Self::MtuDiscovery,
        Self::ProcessUndecryptable,
        Self::DiscardPreviousOneRttKeys,
        Self::DiscardZeroRttKeys,
        Self::IdleNetwork,
        Self::NetworkBlackhole,
        Self::PathValidation,
    ];
}

/// A table of data associated with each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; Timer::VALUES.len()],
}

impl TimerTable {
    /// Arm `timer`, replacing any previous deadline
    pub(super) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    /// Arm `timer` if `time` is `Some`, otherwise cancel it
    pub(super) fn update(&mut self, timer: Timer, time: Option<Instant>) {
        self.data[timer as usize] = time;
    }

    pub(super) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    /// Cancel `timer`; a no-op if it is not armed
    pub(super) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    pub(super) fn is_set(&self, timer: Timer) -> bool {
        self.data[timer as usize].is_some()
    }

    /// Get the next queued timeout
    pub(super) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Whether `timer` is armed with a deadline at or before `now`
    pub(super) fn is_expired(&self, timer: Timer, now: Instant) -> bool {
        self.data[timer as usize].is_some_and(|time| time <= now)
    }

    /// Cancel every timer
    pub(super) fn reset(&mut self) {
        self.data = Default::default();
    }

    #[cfg(test)]
    pub(super) fn armed(&self) -> Vec<Timer> {
        Timer::VALUES
            .iter()
            .copied()
            .filter(|&timer| self.is_set(timer))
            .collect()
    }
}
