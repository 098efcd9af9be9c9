//! Logic for controlling the rate at which data is sent

use std::{any::Any, fmt, sync::Arc};

use crate::{Duration, Instant, connection::RttEstimator};

mod fixed_window;

pub use fixed_window::{FixedWindow, FixedWindowConfig};

/// Common interface for congestion control strategies
///
/// The sent-packet tracker owns exactly one `SendAlgorithm` at a time. During peer migration the
/// connection moves it out of the tracker, parks it with the previous path, and may move it back
/// if the migration is reverted.
pub trait SendAlgorithm: Send + fmt::Debug {
    /// A packet was just sent
    ///
    /// `bytes_in_flight` is the amount in flight before this packet was counted.
    fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        packet_number: u64,
        bytes: u64,
        is_retransmittable: bool,
    );

    /// A packet was acknowledged
    fn on_packet_acked(
        &mut self,
        now: Instant,
        packet_number: u64,
        bytes: u64,
        prior_in_flight: u64,
        rtt: &RttEstimator,
    );

    /// A packet was declared lost
    fn on_packet_lost(
        &mut self,
        now: Instant,
        packet_number: u64,
        bytes: u64,
        prior_in_flight: u64,
    );

    /// The retransmission timer fired in RTO mode
    #[allow(unused_variables)]
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {}

    /// The peer address changed and the path characteristics are unknown again
    fn on_connection_migration(&mut self) {}

    /// The known MTU for the current network path has been updated
    #[allow(unused_variables)]
    fn on_mtu_update(&mut self, max_packet_size: u16) {}

    /// Whether another packet may be sent with `bytes_in_flight` outstanding
    fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.congestion_window()
    }

    /// How long until the next packet may be sent, or `None` if the window is full
    ///
    /// Pacing is applied separately by the tracker; this only reflects the window.
    fn time_until_send(&self, _now: Instant, bytes_in_flight: u64) -> Option<Duration> {
        match self.can_send(bytes_in_flight) {
            true => Some(Duration::ZERO),
            false => None,
        }
    }

    /// Number of bytes that may be in flight
    fn congestion_window(&self) -> u64;

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn SendAlgorithm>;

    /// Returns Self for use in down-casting to extract implementation details
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Constructs send algorithms on demand
pub trait ControllerFactory: Send + Sync + fmt::Debug {
    /// Construct a fresh `SendAlgorithm`
    fn build(self: Arc<Self>, now: Instant, max_packet_size: u16) -> Box<dyn SendAlgorithm>;
}
