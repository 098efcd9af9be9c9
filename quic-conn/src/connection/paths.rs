use std::{cmp, fmt, net::SocketAddr};

use tracing::trace;

use crate::{
    Duration, TIMER_GRANULARITY, congestion::SendAlgorithm, shared::ConnectionId,
};

/// Description of a particular network path
///
/// A connection has a default path, used for all sends, and at most one alternative path whose
/// validation is in progress.
pub(super) struct PathState {
    pub(super) local: SocketAddr,
    pub(super) remote: SocketAddr,
    /// Connection ID the peer is reached through on this path
    pub(super) remote_cid: ConnectionId,
    /// Whether the peer is known to own `remote`
    pub(super) validated: bool,
    /// Total size of all datagrams received from `remote` before validation
    pub(super) bytes_received_before_validation: u64,
    /// Total size of all datagrams sent to `remote` before validation
    pub(super) bytes_sent_before_validation: u64,
    /// Congestion and RTT state that belongs to this path while it is not the default path
    pub(super) saved: Option<SavedPathState>,
}

impl PathState {
    pub(super) fn new(
        local: SocketAddr,
        remote: SocketAddr,
        remote_cid: ConnectionId,
        validated: bool,
    ) -> Self {
        Self {
            local,
            remote,
            remote_cid,
            validated,
            bytes_received_before_validation: 0,
            bytes_sent_before_validation: 0,
            saved: None,
        }
    }

    /// Whether sending `bytes` more would exceed the anti-amplification budget
    ///
    /// The check counts the packet about to be sent, so the amount sent never reaches
    /// `factor` times the amount received.
    pub(super) fn anti_amplification_blocked(&self, factor: u32, bytes: u64) -> bool {
        !self.validated
            && self.bytes_sent_before_validation + bytes
                >= u64::from(factor) * self.bytes_received_before_validation
    }

    pub(super) fn on_datagram_received(&mut self, len: usize) {
        if !self.validated {
            self.bytes_received_before_validation += len as u64;
        }
    }

    pub(super) fn on_datagram_sent(&mut self, len: usize) {
        if !self.validated {
            self.bytes_sent_before_validation += len as u64;
        }
    }

    pub(super) fn mark_validated(&mut self) {
        if !self.validated {
            trace!(remote = %self.remote, "path validated");
        }
        self.validated = true;
        self.bytes_received_before_validation = 0;
        self.bytes_sent_before_validation = 0;
    }
}

impl fmt::Debug for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathState")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("remote_cid", &self.remote_cid)
            .field("validated", &self.validated)
            .field("bytes_received", &self.bytes_received_before_validation)
            .field("bytes_sent", &self.bytes_sent_before_validation)
            .field("saved", &self.saved.is_some())
            .finish()
    }
}

/// Congestion and RTT state moved out of the sent-packet tracker for a path that is no longer
/// the default
///
/// Exactly one owner exists at any time: either the tracker, or the path this is stored in.
#[derive(Debug)]
pub(super) struct SavedPathState {
    pub(super) send_algorithm: Box<dyn SendAlgorithm>,
    pub(super) rtt: RttEstimator,
}

/// RTT estimation for a particular network path
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay.
    min: Duration,
    initial: Duration,
}

impl RttEstimator {
    pub(crate) fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
            initial: initial_rtt,
        }
    }

    /// The current best RTT estimation.
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Whether any sample has been taken
    pub fn has_samples(&self) -> bool {
        self.smoothed.is_some()
    }

    /// Conservative estimate of RTT
    ///
    /// Takes the maximum of smoothed and latest RTT, as recommended
    /// in 6.1.2 of the recovery spec (draft 29).
    pub fn conservative(&self) -> Duration {
        self.get().max(self.latest)
    }

    /// Minimum RTT registered so far for this estimator.
    pub fn min(&self) -> Duration {
        self.min
    }

    /// The most recent sample
    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Mean deviation of the samples
    pub fn var(&self) -> Duration {
        self.var
    }

    /// The configured RTT used before the first sample
    pub fn initial(&self) -> Duration {
        self.initial
    }

    // PTO computed as described in RFC9002#6.2.1
    pub(crate) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    pub(crate) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay.
        self.min = cmp::min(self.min, self.latest);
        if let Some(smoothed) = self.smoothed {
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                self.latest - ack_delay
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct PathResponse {
    /// The packet number the corresponding PATH_CHALLENGE was received in
    packet: u64,
    token: u64,
    /// The address the corresponding PATH_CHALLENGE was received from
    remote: SocketAddr,
}

/// PATH_RESPONSE frames owed to the peer
#[derive(Debug, Default)]
pub(super) struct PathResponses {
    pending: Vec<PathResponse>,
}

impl PathResponses {
    pub(super) fn push(&mut self, packet: u64, token: u64, remote: SocketAddr) {
        /// Arbitrary permissive limit to prevent abuse
        const MAX_PATH_RESPONSES: usize = 16;
        let response = PathResponse {
            packet,
            token,
            remote,
        };
        let existing = self.pending.iter_mut().find(|x| x.remote == remote);
        if let Some(existing) = existing {
            // Answer the most recent challenge only
            if existing.packet <= packet {
                *existing = response;
            }
            return;
        }
        if self.pending.len() < MAX_PATH_RESPONSES {
            self.pending.push(response);
        } else {
            trace!("ignoring excessive PATH_CHALLENGE");
        }
    }

    /// Take a response owed on the path to `remote`
    pub(super) fn pop_for(&mut self, remote: SocketAddr) -> Option<u64> {
        let idx = self.pending.iter().position(|x| x.remote == remote)?;
        Some(self.pending.swap_remove(idx).token)
    }

    /// Take a response owed on any path other than `remote`
    pub(super) fn pop_off_path(&mut self, remote: SocketAddr) -> Option<(u64, SocketAddr)> {
        let idx = self.pending.iter().position(|x| x.remote != remote)?;
        let response = self.pending.swap_remove(idx);
        Some((response.token, response.remote))
    }

    pub(super) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(super) fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn amplification_budget() {
        let mut path = PathState::new(addr(1), addr(2), ConnectionId::EMPTY, false);
        path.on_datagram_received(1200);
        assert!(!path.anti_amplification_blocked(3, 1200));
        path.on_datagram_sent(1200);
        path.on_datagram_sent(1200);
        assert!(!path.anti_amplification_blocked(3, 1199));
        assert!(path.anti_amplification_blocked(3, 1200));
        path.mark_validated();
        assert!(!path.anti_amplification_blocked(3, 1_000_000));
    }

    #[test]
    fn rtt_first_sample() {
        let mut rtt = RttEstimator::new(Duration::from_millis(100));
        assert!(!rtt.has_samples());
        rtt.update(Duration::ZERO, Duration::from_millis(40));
        assert_eq!(rtt.get(), Duration::from_millis(40));
        assert_eq!(rtt.min(), Duration::from_millis(40));
        assert_eq!(rtt.var(), Duration::from_millis(20));
        rtt.update(Duration::from_millis(10), Duration::from_millis(60));
        // adjusted sample is 50ms
        assert_eq!(rtt.get(), Duration::from_micros(41_250));
        rtt.reset();
        assert_eq!(rtt.get(), Duration::from_millis(100));
    }

    #[test]
    fn path_responses_keep_latest_per_remote() {
        let mut responses = PathResponses::default();
        responses.push(5, 1, addr(10));
        responses.push(3, 2, addr(10));
        responses.push(7, 3, addr(11));
        assert_eq!(responses.pop_off_path(addr(11)), Some((1, addr(10))));
        assert_eq!(responses.pop_for(addr(11)), Some(3));
        assert!(responses.is_empty());
    }
}
