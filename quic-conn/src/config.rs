use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    Duration, INITIAL_MTU, MAX_UDP_PAYLOAD,
    congestion::{ControllerFactory, FixedWindowConfig},
};

/// Parameters governing a single connection
///
/// Built once, validated with [`validate`](Self::validate), and shared immutably for the life of
/// the connection. Default values are chosen for internet paths.
pub struct ConnectionConfig {
    pub(crate) initial_rtt: Duration,
    pub(crate) max_packet_length: u16,
    pub(crate) mtu_discovery: Option<MtuDiscoveryConfig>,
    pub(crate) max_undecryptable_packets: usize,
    pub(crate) anti_amplification_factor: u32,
    pub(crate) ack_decimation: AckDecimationConfig,
    pub(crate) max_ack_delay: Duration,
    pub(crate) ping: PingConfig,
    pub(crate) handshake_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) idle_close_behavior: IdleCloseBehavior,
    pub(crate) blackhole_detection: BlackholeDetection,
    pub(crate) path_degrading_ptos: u32,
    pub(crate) peer_migration: MigrationPolicy,
    pub(crate) retransmission: RetransmissionScheme,
    pub(crate) max_tail_loss_probes: u32,
    pub(crate) packet_threshold: u32,
    pub(crate) time_threshold: f32,
    pub(crate) key_update_supported: bool,
    pub(crate) key_update_offset: u64,
    pub(crate) ietf_frames: bool,
    pub(crate) active_connection_id_limit: usize,
    pub(crate) max_tracked_packets: usize,
    pub(crate) pacing: bool,
    pub(crate) legacy_encapsulation: Option<String>,
    pub(crate) congestion_controller_factory: Arc<dyn ControllerFactory>,
}

impl ConnectionConfig {
    /// The RTT used before an RTT sample is taken
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// Packet length to use before MTU discovery raises it
    ///
    /// Must be at least 1200, the length every QUIC path is required to carry.
    pub fn max_packet_length(&mut self, value: u16) -> &mut Self {
        self.max_packet_length = value;
        self
    }

    /// Enable MTU discovery with the given parameters, or disable it with `None` (the default)
    pub fn mtu_discovery(&mut self, value: Option<MtuDiscoveryConfig>) -> &mut Self {
        self.mtu_discovery = value;
        self
    }

    /// Maximum number of packets held while waiting for the keys to open them
    pub fn max_undecryptable_packets(&mut self, value: usize) -> &mut Self {
        self.max_undecryptable_packets = value;
        self
    }

    /// How many bytes a server may send to an unvalidated address per byte received from it
    ///
    /// Defaults to 3.
    pub fn anti_amplification_factor(&mut self, value: u32) -> &mut Self {
        self.anti_amplification_factor = value;
        self
    }

    /// Acknowledgement decimation parameters
    pub fn ack_decimation(&mut self, value: AckDecimationConfig) -> &mut Self {
        self.ack_decimation = value;
        self
    }

    /// Longest time an acknowledgement of an ack-eliciting packet is delayed
    pub fn max_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.max_ack_delay = value;
        self
    }

    /// Keep-alive and retransmittable-on-wire ping parameters
    pub fn ping(&mut self, value: PingConfig) -> &mut Self {
        self.ping = value;
        self
    }

    /// Time allowed for the handshake to complete
    pub fn handshake_timeout(&mut self, value: Duration) -> &mut Self {
        self.handshake_timeout = value;
        self
    }

    /// Maximum duration of inactivity once the handshake is complete
    pub fn idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Whether the peer is told when the idle timeout closes the connection
    pub fn idle_close_behavior(&mut self, value: IdleCloseBehavior) -> &mut Self {
        self.idle_close_behavior = value;
        self
    }

    /// Path degradation and network blackhole detection
    pub fn blackhole_detection(&mut self, value: BlackholeDetection) -> &mut Self {
        self.blackhole_detection = value;
        self
    }

    /// Number of probe timeouts without forward progress after which the path is degrading
    pub fn path_degrading_ptos(&mut self, value: u32) -> &mut Self {
        self.path_degrading_ptos = value;
        self
    }

    /// How a server reacts to a peer changing its address
    pub fn peer_migration(&mut self, value: MigrationPolicy) -> &mut Self {
        self.peer_migration = value;
        self
    }

    /// Timer-driven retransmission strategy
    pub fn retransmission(&mut self, value: RetransmissionScheme) -> &mut Self {
        self.retransmission = value;
        self
    }

    /// Tail loss probes sent before falling back to RTO in [`RetransmissionScheme::TlpRto`]
    pub fn max_tail_loss_probes(&mut self, value: u32) -> &mut Self {
        self.max_tail_loss_probes = value;
        self
    }

    /// Maximum reordering in packet number space before FACK style loss detection considers a
    /// packet lost. Should not be less than 3, per RFC5681.
    pub fn packet_threshold(&mut self, value: u32) -> &mut Self {
        self.packet_threshold = value;
        self
    }

    /// Maximum reordering in time space before time based loss detection considers a packet lost,
    /// as a factor of RTT
    pub fn time_threshold(&mut self, value: f32) -> &mut Self {
        self.time_threshold = value;
        self
    }

    /// Whether this endpoint initiates 1-RTT key updates
    pub fn key_update_supported(&mut self, value: bool) -> &mut Self {
        self.key_update_supported = value;
        self
    }

    /// How many packets before the AEAD confidentiality limit a key update is initiated
    pub fn key_update_offset(&mut self, value: u64) -> &mut Self {
        self.key_update_offset = value;
        self
    }

    /// Whether the peer speaks IETF QUIC framing
    ///
    /// Determines how connectivity probes are built and recognised: PATH_CHALLENGE based when
    /// set, padded PING based otherwise.
    pub fn ietf_frames(&mut self, value: bool) -> &mut Self {
        self.ietf_frames = value;
        self
    }

    /// Number of peer-issued connection IDs kept in reserve
    pub fn active_connection_id_limit(&mut self, value: usize) -> &mut Self {
        self.active_connection_id_limit = value;
        self
    }

    /// Maximum number of unacknowledged sent packets before the connection is closed
    pub fn max_tracked_packets(&mut self, value: usize) -> &mut Self {
        self.max_tracked_packets = value;
        self
    }

    /// Whether transmissions are paced over the round trip
    pub fn pacing(&mut self, value: bool) -> &mut Self {
        self.pacing = value;
        self
    }

    /// Wrap client Initial packets in a legacy version handshake carrying this server name
    pub fn legacy_encapsulation(&mut self, server_name: Option<String>) -> &mut Self {
        self.legacy_encapsulation = server_name;
        self
    }

    /// How to construct new `SendAlgorithm`s
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn ControllerFactory + Send + Sync + 'static>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }

    /// Check the configuration for values that cannot work together
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.anti_amplification_factor == 0 {
            return Err(ConfigError::IllegalValue(
                "anti-amplification factor must be at least 1",
            ));
        }
        if self.max_packet_length < INITIAL_MTU {
            return Err(ConfigError::IllegalValue(
                "max packet length must be at least 1200",
            ));
        }
        if self.max_packet_length > MAX_UDP_PAYLOAD {
            return Err(ConfigError::OutOfBounds);
        }
        if let Some(mtud) = &self.mtu_discovery {
            if mtud.upper_bound <= self.max_packet_length {
                return Err(ConfigError::IllegalValue(
                    "MTU discovery upper bound must exceed the initial packet length",
                ));
            }
        }
        if self.packet_threshold == 0 || self.time_threshold < 1.0 {
            return Err(ConfigError::IllegalValue("loss detection thresholds too small"));
        }
        if self.path_degrading_ptos == 0 {
            return Err(ConfigError::IllegalValue(
                "path degrading needs at least one probe timeout",
            ));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_rtt: Duration::from_millis(100),
            max_packet_length: 1350,
            mtu_discovery: None,
            max_undecryptable_packets: 10,
            anti_amplification_factor: 3,
            ack_decimation: AckDecimationConfig::default(),
            max_ack_delay: Duration::from_millis(25),
            ping: PingConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            idle_close_behavior: IdleCloseBehavior::Silent,
            blackhole_detection: BlackholeDetection::default(),
            path_degrading_ptos: 4,
            peer_migration: MigrationPolicy::ReverseValidation,
            retransmission: RetransmissionScheme::Pto,
            max_tail_loss_probes: 2,
            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            key_update_supported: true,
            key_update_offset: 1000,
            ietf_frames: true,
            active_connection_id_limit: 4,
            max_tracked_packets: 10_000,
            pacing: true,
            legacy_encapsulation: None,
            congestion_controller_factory: Arc::new(FixedWindowConfig::default()),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ConnectionConfig")
            .field("initial_rtt", &self.initial_rtt)
            .field("max_packet_length", &self.max_packet_length)
            .field("mtu_discovery", &self.mtu_discovery)
            .field("max_undecryptable_packets", &self.max_undecryptable_packets)
            .field("anti_amplification_factor", &self.anti_amplification_factor)
            .field("ack_decimation", &self.ack_decimation)
            .field("max_ack_delay", &self.max_ack_delay)
            .field("ping", &self.ping)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("idle_close_behavior", &self.idle_close_behavior)
            .field("blackhole_detection", &self.blackhole_detection)
            .field("path_degrading_ptos", &self.path_degrading_ptos)
            .field("peer_migration", &self.peer_migration)
            .field("retransmission", &self.retransmission)
            .field("max_tail_loss_probes", &self.max_tail_loss_probes)
            .field("packet_threshold", &self.packet_threshold)
            .field("time_threshold", &self.time_threshold)
            .field("key_update_supported", &self.key_update_supported)
            .field("key_update_offset", &self.key_update_offset)
            .field("ietf_frames", &self.ietf_frames)
            .field("active_connection_id_limit", &self.active_connection_id_limit)
            .field("max_tracked_packets", &self.max_tracked_packets)
            .field("pacing", &self.pacing)
            .field("legacy_encapsulation", &self.legacy_encapsulation)
            .finish_non_exhaustive()
    }
}

/// Parameters governing MTU discovery
///
/// Probing starts after `packets_between_probes` packets have been sent. Each failed probe
/// doubles the gap before the next one, and probing stops for good after `max_probes`
/// attempts, on success, or when the writer reports a datagram as too big.
#[derive(Clone, Debug)]
pub struct MtuDiscoveryConfig {
    pub(crate) upper_bound: u16,
    pub(crate) packets_between_probes: u64,
    pub(crate) max_probes: u32,
}

impl MtuDiscoveryConfig {
    /// Packet length the probe tries to establish
    ///
    /// Defaults to 1452, to stay within Ethernet's MTU when using IPv4 and IPv6.
    pub fn upper_bound(&mut self, value: u16) -> &mut Self {
        self.upper_bound = value.min(MAX_UDP_PAYLOAD);
        self
    }

    /// Packets sent before the first probe
    pub fn packets_between_probes(&mut self, value: u64) -> &mut Self {
        self.packets_between_probes = value;
        self
    }

    /// Probes sent before giving up
    pub fn max_probes(&mut self, value: u32) -> &mut Self {
        self.max_probes = value;
        self
    }
}

impl Default for MtuDiscoveryConfig {
    fn default() -> Self {
        Self {
            upper_bound: 1452,
            packets_between_probes: 100,
            max_probes: 3,
        }
    }
}

/// When acknowledgements are sent
#[derive(Clone, Debug)]
pub struct AckDecimationConfig {
    pub(crate) enabled: bool,
    pub(crate) ack_eliciting_threshold: u64,
    pub(crate) min_received_before_decimation: u64,
    pub(crate) decimated_ack_frequency: u64,
    pub(crate) delay_fraction_of_min_rtt: f32,
}

impl AckDecimationConfig {
    /// Whether acknowledgements are decimated once enough packets have been received
    pub fn enabled(&mut self, value: bool) -> &mut Self {
        self.enabled = value;
        self
    }

    /// Ack-eliciting packets received before an immediate acknowledgement, before decimation
    pub fn ack_eliciting_threshold(&mut self, value: u64) -> &mut Self {
        self.ack_eliciting_threshold = value;
        self
    }

    /// Packets received before decimation starts
    pub fn min_received_before_decimation(&mut self, value: u64) -> &mut Self {
        self.min_received_before_decimation = value;
        self
    }

    /// Ack-eliciting packets received before an immediate acknowledgement while decimating
    pub fn decimated_ack_frequency(&mut self, value: u64) -> &mut Self {
        self.decimated_ack_frequency = value;
        self
    }

    /// Acknowledgement delay while decimating, as a fraction of the minimum RTT
    pub fn delay_fraction_of_min_rtt(&mut self, value: f32) -> &mut Self {
        self.delay_fraction_of_min_rtt = value;
        self
    }
}

impl Default for AckDecimationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ack_eliciting_threshold: 2,
            min_received_before_decimation: 100,
            decimated_ack_frequency: 10,
            delay_fraction_of_min_rtt: 0.25,
        }
    }
}

/// Keep-alive behaviour
///
/// A keep-alive PING is sent when nothing has been sent for `keep_alive`, but only while streams
/// are open. With `retransmittable_on_wire` set, a PING is also sent that long after the last
/// ack-eliciting packet was acknowledged, so that the path never goes quiet. The latter backs off
/// exponentially after `max_aggressive_retransmittable_on_wire_pings` and stops after
/// `max_retransmittable_on_wire_pings`.
#[derive(Clone, Debug)]
pub struct PingConfig {
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) retransmittable_on_wire: Option<Duration>,
    pub(crate) max_aggressive_retransmittable_on_wire_pings: u32,
    pub(crate) max_retransmittable_on_wire_pings: u32,
}

impl PingConfig {
    /// Interval of keep-alive pings, 15 seconds by default
    pub fn keep_alive(&mut self, value: Option<Duration>) -> &mut Self {
        self.keep_alive = value;
        self
    }

    /// Initial retransmittable-on-wire timeout, disabled by default
    pub fn retransmittable_on_wire(&mut self, value: Option<Duration>) -> &mut Self {
        self.retransmittable_on_wire = value;
        self
    }

    /// Pings sent at the initial retransmittable-on-wire timeout before backing off
    pub fn max_aggressive_retransmittable_on_wire_pings(&mut self, value: u32) -> &mut Self {
        self.max_aggressive_retransmittable_on_wire_pings = value;
        self
    }

    /// Retransmittable-on-wire pings sent before giving up
    pub fn max_retransmittable_on_wire_pings(&mut self, value: u32) -> &mut Self {
        self.max_retransmittable_on_wire_pings = value;
        self
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            keep_alive: Some(Duration::from_secs(15)),
            retransmittable_on_wire: None,
            max_aggressive_retransmittable_on_wire_pings: 5,
            max_retransmittable_on_wire_pings: 100,
        }
    }
}

/// Whether the peer learns about an idle timeout
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IdleCloseBehavior {
    /// Tear down local state only
    Silent,
    /// Send CONNECTION_CLOSE before tearing down
    SendConnectionClose,
}

/// Path degradation and network blackhole detection
///
/// These are a single setting so that there is exactly one answer to whether a connection
/// with no forward progress is eventually closed, independent of migration settings.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlackholeDetection {
    /// Neither report degradation nor close
    Disabled,
    /// Report path degradation to the visitor but never close
    PathDegradingOnly,
    /// Report degradation, and close after `num_rtos` retransmission timeouts beyond the
    /// tail loss probes without forward progress
    ///
    /// When MTU discovery is enabled, a raised packet length is also reverted after half as many
    /// timeouts.
    Enabled {
        /// Consecutive retransmission timeouts tolerated
        num_rtos: u32,
    },
}

impl Default for BlackholeDetection {
    fn default() -> Self {
        Self::Enabled { num_rtos: 5 }
    }
}

/// How a server reacts to a non-probing packet from a new peer address
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MigrationPolicy {
    /// Drop such packets and keep using the current address
    Disabled,
    /// Switch to the new address immediately, limit sending to it by the anti-amplification
    /// factor, and validate it with a PATH_CHALLENGE
    ReverseValidation,
    /// Switch to the new address and trust it without validation
    TrustUnvalidated,
}

/// Timer-driven retransmission strategy
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetransmissionScheme {
    /// Probe timeouts as in RFC 9002
    Pto,
    /// Tail loss probes followed by retransmission timeouts
    TlpRto,
}

/// Errors in the configuration of a connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
    /// Value is nonsensical in combination with the rest of the configuration
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}
