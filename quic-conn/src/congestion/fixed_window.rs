use std::{any::Any, sync::Arc};

use super::{ControllerFactory, SendAlgorithm};
use crate::{Instant, connection::RttEstimator};

/// A congestion controller that never adapts its window
///
/// Useful as a fallback, on links with known capacity, and in tests. Losses and timeouts are
/// recorded but do not shrink the window.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    config: Arc<FixedWindowConfig>,
    max_packet_size: u64,
    /// Packets reported lost since construction
    lost_packets: u64,
}

impl FixedWindow {
    /// Construct a controller with the given configuration
    pub fn new(config: Arc<FixedWindowConfig>, _now: Instant, max_packet_size: u16) -> Self {
        Self {
            config,
            max_packet_size: max_packet_size.into(),
            lost_packets: 0,
        }
    }

    /// Packets reported lost so far
    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }
}

impl SendAlgorithm for FixedWindow {
    fn on_packet_sent(
        &mut self,
        _now: Instant,
        _bytes_in_flight: u64,
        _packet_number: u64,
        _bytes: u64,
        _is_retransmittable: bool,
    ) {
    }

    fn on_packet_acked(
        &mut self,
        _now: Instant,
        _packet_number: u64,
        _bytes: u64,
        _prior_in_flight: u64,
        _rtt: &RttEstimator,
    ) {
    }

    fn on_packet_lost(
        &mut self,
        _now: Instant,
        _packet_number: u64,
        _bytes: u64,
        _prior_in_flight: u64,
    ) {
        self.lost_packets += 1;
    }

    fn on_mtu_update(&mut self, max_packet_size: u16) {
        self.max_packet_size = max_packet_size.into();
    }

    fn congestion_window(&self) -> u64 {
        self.config.window_packets * self.max_packet_size
    }

    fn clone_box(&self) -> Box<dyn SendAlgorithm> {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Configuration for the [`FixedWindow`] congestion controller
#[derive(Debug, Clone)]
pub struct FixedWindowConfig {
    window_packets: u64,
}

impl FixedWindowConfig {
    /// Window size in full-sized packets
    ///
    /// The window in bytes follows the current maximum packet size.
    pub fn window_packets(&mut self, value: u64) -> &mut Self {
        self.window_packets = value;
        self
    }
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self { window_packets: 32 }
    }
}

impl ControllerFactory for FixedWindowConfig {
    fn build(self: Arc<Self>, now: Instant, max_packet_size: u16) -> Box<dyn SendAlgorithm> {
        Box::new(FixedWindow::new(self, now, max_packet_size))
    }
}
