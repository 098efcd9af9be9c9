use tracing::{debug, trace};

/// What the confidentiality limit requires after a 1-RTT packet was sent
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum AeadLimit {
    Within,
    /// Close to the limit; move to new keys
    UpdateKeys,
    /// The limit is reached; the connection must close
    Exhausted,
}

/// Key phase bookkeeping for 1-RTT packets
///
/// Packet protection itself lives in the codec. This tracks how much each generation of keys
/// was used, so that keys are rotated before the AEAD confidentiality limit and the connection
/// is closed once the integrity limit is exceeded.
#[derive(Debug, Default)]
pub(super) struct KeyPhase {
    /// Value of the key phase bit of the current keys
    phase: bool,
    lowest_sent_in_phase: Option<u64>,
    lowest_received_in_phase: Option<u64>,
    /// Keys of the previous phase are still kept for reordered packets
    discard_pending: bool,
    /// The current phase was entered by a local update
    local_update: bool,
    failed_authentications: u64,
}

impl KeyPhase {
    pub(super) fn phase(&self) -> bool {
        self.phase
    }

    pub(super) fn on_packet_sent(&mut self, number: u64) {
        if self.lowest_sent_in_phase.is_none() {
            self.lowest_sent_in_phase = Some(number);
        }
    }

    /// A 1-RTT packet protected with key phase bit `phase` was opened
    pub(super) fn on_packet_received(&mut self, phase: bool, number: u64) {
        if phase == self.phase && self.lowest_received_in_phase.is_none() {
            self.lowest_received_in_phase = Some(number);
        }
    }

    /// Whether a packet protected with key phase bit `phase` starts a peer-initiated update
    ///
    /// Packets of the previous phase that arrive late are not an update. Until the peer is
    /// seen using keys this endpoint moved to, any packet with the old bit is such a packet.
    pub(super) fn is_remote_update(&self, phase: bool, number: u64) -> bool {
        if phase == self.phase {
            return false;
        }
        match self.lowest_received_in_phase {
            Some(lowest) => number > lowest,
            None => !self.local_update,
        }
    }

    /// Check the confidentiality limit after sending 1-RTT packet `number`
    ///
    /// `update_supported` says whether this endpoint initiates updates at all and the handshake
    /// is confirmed. A local update additionally requires an acknowledgement of a packet sent
    /// close to the start of the current phase, proving that the peer has the current keys.
    pub(super) fn check_confidentiality(
        &self,
        number: u64,
        limit: u64,
        offset: u64,
        update_supported: bool,
        largest_acked: Option<u64>,
    ) -> AeadLimit {
        let Some(lowest) = self.lowest_sent_in_phase else {
            return AeadLimit::Within;
        };
        let sent = number.saturating_sub(lowest) + 1;
        if sent >= limit {
            return AeadLimit::Exhausted;
        }
        if self.update_allowed(update_supported, largest_acked)
            && sent >= limit.saturating_sub(offset)
        {
            trace!(sent, limit, "approaching confidentiality limit");
            return AeadLimit::UpdateKeys;
        }
        AeadLimit::Within
    }

    pub(super) fn update_allowed(
        &self,
        update_supported: bool,
        largest_acked: Option<u64>,
    ) -> bool {
        update_supported
            && !self.discard_pending
            && match (largest_acked, self.lowest_sent_in_phase) {
                (Some(acked), Some(lowest)) => acked + 1 >= lowest,
                _ => false,
            }
    }

    /// Move to the next key phase, on our own initiative if `local`
    pub(super) fn on_key_update(&mut self, local: bool) {
        self.phase = !self.phase;
        self.local_update = local;
        self.lowest_sent_in_phase = None;
        self.lowest_received_in_phase = None;
        self.discard_pending = true;
        debug!(phase = self.phase, "key phase changed");
    }

    pub(super) fn on_previous_keys_discarded(&mut self) {
        self.discard_pending = false;
    }

    /// Count a packet that failed authentication; true once `limit` is reached
    pub(super) fn on_authentication_failed(&mut self, limit: u64) -> bool {
        self.failed_authentications += 1;
        self.failed_authentications >= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_at_limit_without_update() {
        let mut keys = KeyPhase::default();
        keys.on_packet_sent(10);
        assert_eq!(keys.check_confidentiality(18, 10, 5, false, Some(12)), AeadLimit::Within);
        assert_eq!(keys.check_confidentiality(19, 10, 5, false, Some(12)), AeadLimit::Exhausted);
    }

    #[test]
    fn update_before_limit() {
        let mut keys = KeyPhase::default();
        keys.on_packet_sent(0);
        // Nothing acknowledged yet in this phase
        assert_eq!(keys.check_confidentiality(5, 10, 5, true, None), AeadLimit::Within);
        assert_eq!(keys.check_confidentiality(4, 10, 5, true, Some(0)), AeadLimit::UpdateKeys);
        keys.on_key_update(true);
        assert!(keys.discard_pending);
        keys.on_packet_sent(6);
        assert_eq!(keys.check_confidentiality(6, 10, 5, true, Some(5)), AeadLimit::Within);
        assert!(!keys.update_allowed(true, Some(5)));
        keys.on_previous_keys_discarded();
        assert!(keys.update_allowed(true, Some(5)));
    }

    #[test]
    fn late_packets_of_previous_phase() {
        let mut keys = KeyPhase::default();
        keys.on_packet_received(false, 3);
        assert!(keys.is_remote_update(true, 7));
        keys.on_key_update(false);
        keys.on_packet_received(true, 7);
        assert!(!keys.is_remote_update(false, 5));
        assert!(keys.is_remote_update(false, 9));
    }

    #[test]
    fn old_phase_after_local_update() {
        let mut keys = KeyPhase::default();
        keys.on_packet_received(false, 0);
        keys.on_key_update(true);
        // The peer has not switched yet
        assert!(!keys.is_remote_update(false, 4));
        keys.on_packet_received(false, 4);
        assert!(!keys.is_remote_update(false, 5));
        keys.on_packet_received(true, 6);
        assert!(!keys.is_remote_update(false, 5));
        assert!(keys.is_remote_update(false, 8));
    }

    #[test]
    fn integrity_limit() {
        let mut keys = KeyPhase::default();
        assert!(!keys.on_authentication_failed(2));
        assert!(keys.on_authentication_failed(2));
    }
}
