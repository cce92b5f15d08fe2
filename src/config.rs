use std::{fmt, sync::Arc, time::Duration};

use crate::{congestion, VarInt, VarIntBoundsExceeded};

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications.
///
/// In some cases, performance or resource requirements can be improved by tuning these values to
/// suit a particular application and/or network connection.
pub struct TransportConfig {
    pub(crate) max_idle_timeout: Option<VarInt>,
    pub(crate) keep_alive_interval: Option<Duration>,
    pub(crate) initial_rtt: Duration,
    pub(crate) initial_mtu: u16,

    pub(crate) packet_threshold: u32,
    pub(crate) time_threshold: f32,
    pub(crate) persistent_congestion_threshold: u32,

    pub(crate) ack_eliciting_threshold: VarInt,
    pub(crate) reordering_threshold: VarInt,
    pub(crate) max_ack_delay: Duration,

    pub(crate) anti_amplification_factor: u64,
    pub(crate) max_consecutive_ptos: u32,
    pub(crate) path_degrading_pto_count: u32,
    pub(crate) path_validation_retries: u32,
    pub(crate) migration: bool,
    pub(crate) cid_rotation_interval: Option<Duration>,

    pub(crate) max_undecryptable_packets: usize,
    pub(crate) max_tracked_sent_packets: usize,
    pub(crate) crypto_buffer_size: usize,
    pub(crate) allow_spin: bool,
    #[cfg(test)]
    pub(crate) deterministic_packet_numbers: bool,

    pub(crate) congestion_controller_factory: Arc<dyn congestion::ControllerFactory + Send + Sync>,
}

impl TransportConfig {
    /// Maximum duration of inactivity to accept before timing out the connection.
    ///
    /// The true idle timeout is the minimum of this and the peer's own max idle timeout. `None`
    /// represents an infinite timeout. Defaults to 30 seconds.
    ///
    /// **WARNING**: If a peer or its network path malfunctions or acts maliciously, an infinite
    /// idle timeout can result in permanently hung connections!
    pub fn max_idle_timeout(&mut self, value: Option<IdleTimeout>) -> &mut Self {
        self.max_idle_timeout = value.map(|t| t.0);
        self
    }

    /// Period of inactivity before sending a keep-alive packet
    ///
    /// Keep-alive packets prevent an inactive but otherwise healthy connection from timing out.
    /// `None` to disable, which is the default. Only one side of any given connection needs
    /// keep-alive enabled for the connection to be preserved.
    ///
    /// Must be set lower than the idle_timeout of both peers to be effective.
    pub fn keep_alive_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.keep_alive_interval = value;
        self
    }

    /// Initial round-trip-time estimate, used before an RTT sample is available
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// UDP payload size the connection assumes the path supports, in bytes
    ///
    /// There is no discovery of larger sizes. Values below 1200 are interpreted as 1200.
    pub fn initial_mtu(&mut self, value: u16) -> &mut Self {
        self.initial_mtu = value.max(crate::MIN_INITIAL_SIZE as u16);
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

    /// Number of consecutive PTOs after which network is considered to be experiencing persistent
    /// congestion
    pub fn persistent_congestion_threshold(&mut self, value: u32) -> &mut Self {
        self.persistent_congestion_threshold = value;
        self
    }

    /// Number of ack-eliciting packets that may be received before an ACK must be sent
    ///
    /// The peer can raise this at runtime with an ACK_FREQUENCY frame. Defaults to 1, i.e. every
    /// other ack-eliciting packet triggers an immediate acknowledgement.
    pub fn ack_eliciting_threshold(&mut self, value: VarInt) -> &mut Self {
        self.ack_eliciting_threshold = value;
        self
    }

    /// Degree of packet reordering that triggers an immediate acknowledgement
    ///
    /// Defaults to 1: any out-of-order arrival is acknowledged without delay, which speeds up
    /// the peer's loss detection.
    pub fn reordering_threshold(&mut self, value: VarInt) -> &mut Self {
        self.reordering_threshold = value;
        self
    }

    /// Maximum time to hold a pending acknowledgement before sending it
    pub fn max_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.max_ack_delay = value;
        self
    }

    /// Multiple of bytes received from an unvalidated address that may be sent back to it
    ///
    /// Bounds the bandwidth of address-spoofing amplification attacks. Defaults to 3, the
    /// minimum RFC 9000 permits.
    pub fn anti_amplification_factor(&mut self, value: u64) -> &mut Self {
        self.anti_amplification_factor = value.max(3);
        self
    }

    /// Number of consecutive probe timeouts after which the connection is presumed dead
    pub fn max_consecutive_ptos(&mut self, value: u32) -> &mut Self {
        self.max_consecutive_ptos = value;
        self
    }

    /// Number of consecutive probe timeouts after which the path is reported degrading
    pub fn path_degrading_pto_count(&mut self, value: u32) -> &mut Self {
        self.path_degrading_pto_count = value;
        self
    }

    /// Number of times a path challenge is retransmitted before validation fails
    pub fn path_validation_retries(&mut self, value: u32) -> &mut Self {
        self.path_validation_retries = value;
        self
    }

    /// Whether to accept a peer migrating to a new address (servers only)
    pub fn migration(&mut self, value: bool) -> &mut Self {
        self.migration = value;
        self
    }

    /// How long locally issued connection IDs remain in use before being rotated out
    ///
    /// Rotation limits the time any one connection ID is exposed to on-path observers. `None`
    /// to never rotate, which is the default.
    pub fn cid_rotation_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.cid_rotation_interval = value;
        self
    }

    /// Number of packets arriving before their keys to buffer for later decryption
    pub fn max_undecryptable_packets(&mut self, value: usize) -> &mut Self {
        self.max_undecryptable_packets = value;
        self
    }

    /// Maximum number of unacknowledged sent packets tracked in any one packet-number space
    ///
    /// Exceeding this closes the connection, bounding memory when a peer refuses to acknowledge
    /// anything.
    pub fn max_tracked_sent_packets(&mut self, value: usize) -> &mut Self {
        self.max_tracked_sent_packets = value;
        self
    }

    /// Maximum quantity of out-of-order crypto layer data to buffer
    pub fn crypto_buffer_size(&mut self, value: usize) -> &mut Self {
        self.crypto_buffer_size = value;
        self
    }

    /// Whether the implementation is permitted to set the spin bit on this connection
    ///
    /// This allows passive observers to easily judge the round trip time of a connection, which
    /// can be useful for network administration but sacrifices a small amount of privacy.
    pub fn allow_spin(&mut self, value: bool) -> &mut Self {
        self.allow_spin = value;
        self
    }

    /// How to construct new `congestion::Controller`s
    ///
    /// Typically the refcounted configuration of a `congestion::Controller`,
    /// e.g. a `congestion::NewRenoConfig`.
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn congestion::ControllerFactory + Send + Sync>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_timeout: Some(VarInt::from_u32(30_000)),
            keep_alive_interval: None,
            initial_rtt: Duration::from_millis(333), // per RFC 9002 §6.2.2
            initial_mtu: crate::MIN_INITIAL_SIZE as u16,

            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            persistent_congestion_threshold: 3,

            ack_eliciting_threshold: VarInt(1),
            reordering_threshold: VarInt(1),
            max_ack_delay: Duration::from_millis(25),

            anti_amplification_factor: 3,
            max_consecutive_ptos: 6,
            path_degrading_pto_count: 4,
            path_validation_retries: 5,
            migration: true,
            cid_rotation_interval: None,

            max_undecryptable_packets: 10,
            max_tracked_sent_packets: 4096,
            crypto_buffer_size: 16 * 1024,
            allow_spin: false,
            #[cfg(test)]
            deterministic_packet_numbers: false,

            congestion_controller_factory: Arc::new(congestion::NewRenoConfig::default()),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            max_idle_timeout,
            keep_alive_interval,
            initial_rtt,
            initial_mtu,
            packet_threshold,
            time_threshold,
            persistent_congestion_threshold,
            ack_eliciting_threshold,
            reordering_threshold,
            max_ack_delay,
            anti_amplification_factor,
            max_consecutive_ptos,
            path_degrading_pto_count,
            path_validation_retries,
            migration,
            cid_rotation_interval,
            max_undecryptable_packets,
            max_tracked_sent_packets,
            crypto_buffer_size,
            allow_spin,
            #[cfg(test)]
                deterministic_packet_numbers: _,
            congestion_controller_factory: _,
        } = self;
        fmt.debug_struct("TransportConfig")
            .field("max_idle_timeout", max_idle_timeout)
            .field("keep_alive_interval", keep_alive_interval)
            .field("initial_rtt", initial_rtt)
            .field("initial_mtu", initial_mtu)
            .field("packet_threshold", packet_threshold)
            .field("time_threshold", time_threshold)
            .field(
                "persistent_congestion_threshold",
                persistent_congestion_threshold,
            )
            .field("ack_eliciting_threshold", ack_eliciting_threshold)
            .field("reordering_threshold", reordering_threshold)
            .field("max_ack_delay", max_ack_delay)
            .field("anti_amplification_factor", anti_amplification_factor)
            .field("max_consecutive_ptos", max_consecutive_ptos)
            .field("path_degrading_pto_count", path_degrading_pto_count)
            .field("path_validation_retries", path_validation_retries)
            .field("migration", migration)
            .field("cid_rotation_interval", cid_rotation_interval)
            .field("max_undecryptable_packets", max_undecryptable_packets)
            .field("max_tracked_sent_packets", max_tracked_sent_packets)
            .field("crypto_buffer_size", crypto_buffer_size)
            .field("allow_spin", allow_spin)
            .finish_non_exhaustive()
    }
}

/// Maximum duration of inactivity to accept before timing out the connection
///
/// This wraps an underlying [`VarInt`], representing the duration in milliseconds. Values can be
/// constructed by converting directly from `VarInt`, or using `TryFrom<Duration>`.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IdleTimeout(VarInt);

impl From<VarInt> for IdleTimeout {
    fn from(inner: VarInt) -> Self {
        Self(inner)
    }
}

impl std::convert::TryFrom<Duration> for IdleTimeout {
    type Error = VarIntBoundsExceeded;

    fn try_from(timeout: Duration) -> Result<Self, Self::Error> {
        let inner = VarInt::try_from(timeout.as_millis())?;
        Ok(Self(inner))
    }
}
