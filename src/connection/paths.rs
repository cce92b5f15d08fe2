use std::{
    cmp,
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::trace;

use super::spaces::{PacketSpace, SentPacket};
use crate::{congestion, packet::SpaceId, TransportConfig, TIMER_GRANULARITY};

/// Description of a particular network path
pub(super) struct PathData {
    pub(super) remote: SocketAddr,
    pub(super) rtt: RttEstimator,
    /// Whether we're enabling ECN on outgoing packets
    pub(super) sending_ecn: bool,
    /// Congestion controller state
    pub(super) congestion: Box<dyn congestion::Controller>,
    /// Whether we're certain the peer can both send and receive on this address
    ///
    /// Initially true for clients, and for servers once a handshake packet
    /// arrives. Becomes false again on every migration.
    pub(super) validated: bool,
    /// Total size of all UDP datagrams sent on this path
    pub(super) total_sent: u64,
    /// Total size of all UDP datagrams received on this path
    pub(super) total_recvd: u64,
    /// Maximum UDP payload this path is assumed to carry
    current_mtu: u16,
    /// Packet number of the first packet sent after an RTT sample was collected on this path
    ///
    /// Used in persistent congestion determination.
    pub(super) first_packet_after_rtt_sample: Option<(SpaceId, u64)>,
    pub(super) in_flight: InFlight,
    /// Number of the first packet sent on this path
    ///
    /// Used to determine whether a packet was sent on an earlier path. Insufficient to determine if
    /// a packet was sent on a later path.
    first_packet: Option<u64>,
}

impl PathData {
    pub(super) fn new(remote: SocketAddr, now: Instant, config: &TransportConfig) -> Self {
        let congestion = config
            .congestion_controller_factory
            .clone()
            .build(now, config.initial_mtu);
        Self {
            remote,
            rtt: RttEstimator::new(config.initial_rtt),
            sending_ecn: true,
            congestion,
            validated: false,
            total_sent: 0,
            total_recvd: 0,
            current_mtu: config.initial_mtu,
            first_packet_after_rtt_sample: None,
            in_flight: InFlight::new(),
            first_packet: None,
        }
    }

    /// Construct a path sharing the predecessor's RTT and congestion state
    ///
    /// Only appropriate when the underlying link is known to be unchanged, i.e.
    /// a pure port rebind.
    pub(super) fn from_previous(remote: SocketAddr, prev: &Self) -> Self {
        Self {
            remote,
            rtt: prev.rtt,
            sending_ecn: true,
            congestion: prev.congestion.clone_box(),
            validated: false,
            total_sent: 0,
            total_recvd: 0,
            current_mtu: prev.current_mtu,
            first_packet_after_rtt_sample: prev.first_packet_after_rtt_sample,
            in_flight: InFlight::new(),
            first_packet: None,
        }
    }

    /// Indicates whether we're a server that hasn't validated the peer's address and hasn't
    /// received enough data from the peer to permit sending `bytes_to_send` additional bytes
    pub(super) fn anti_amplification_blocked(&self, factor: u64, bytes_to_send: u64) -> bool {
        !self.validated && self.total_recvd * factor < self.total_sent + bytes_to_send
    }

    /// The path's current MTU
    pub(super) fn current_mtu(&self) -> u16 {
        self.current_mtu
    }

    /// Account for transmission of `packet` with number `pn` in `space`
    pub(super) fn sent(&mut self, pn: u64, packet: SentPacket, space: &mut PacketSpace) {
        self.in_flight.insert(&packet);
        if self.first_packet.is_none() {
            self.first_packet = Some(pn);
        }
        self.in_flight.bytes -= space.sent(pn, packet);
    }

    /// Remove `packet` with number `pn` from this path's congestion control counters, or return
    /// `false` if `pn` was sent before this path was established.
    pub(super) fn remove_in_flight(&mut self, pn: u64, packet: &SentPacket) -> bool {
        if self.first_packet.map_or(true, |first| first > pn) {
            return false;
        }
        self.in_flight.remove(packet);
        true
    }
}

/// RTT estimation for a particular network path
#[derive(Copy, Clone)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay.
    min: Duration,
}

impl RttEstimator {
    pub(crate) fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation.
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
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

    // PTO computed as described in RFC9002#6.2.1
    pub(crate) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    pub(crate) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay.
        self.min = cmp::min(self.min, self.latest);
        // Based on RFC6298.
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

/// Why a path validation was started
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PathValidationReason {
    /// A non-probing packet arrived from a new peer address
    Migration,
    /// Checking whether the path we migrated away from is still usable
    Reversion,
    /// The local application asked for a candidate path to be probed
    Probe,
}

/// Challenge/response state for proving a single remote address reachable
///
/// A fresh random payload is generated for every retransmission so that a
/// response can be matched to the challenge that actually elicited it.
pub(super) struct PathValidator {
    pub(super) remote: SocketAddr,
    pub(super) reason: PathValidationReason,
    challenge: u64,
    /// Whether the current challenge still needs to be transmitted
    pending: bool,
    retries_left: u32,
    retry_interval: Duration,
}

impl PathValidator {
    /// Start validating `remote`
    ///
    /// `timeout` is the total time budget, divided evenly over the configured
    /// number of attempts.
    pub(super) fn new<R: Rng>(
        remote: SocketAddr,
        reason: PathValidationReason,
        timeout: Duration,
        attempts: u32,
        rng: &mut R,
    ) -> Self {
        let attempts = attempts.max(1);
        Self {
            remote,
            reason,
            challenge: rng.gen(),
            pending: true,
            retries_left: attempts - 1,
            retry_interval: timeout / attempts,
        }
    }

    /// Payload to send in the next PATH_CHALLENGE
    pub(super) fn challenge(&self) -> u64 {
        self.challenge
    }

    pub(super) fn is_pending(&self) -> bool {
        self.pending
    }

    /// Mark the current challenge as transmitted, returning the retry deadline
    pub(super) fn challenge_sent(&mut self, now: Instant) -> Instant {
        self.pending = false;
        now + self.retry_interval
    }

    /// Handle expiry of the retry deadline
    ///
    /// Returns `false` when all attempts are exhausted and the validation has
    /// failed.
    pub(super) fn on_timeout<R: Rng>(&mut self, rng: &mut R) -> bool {
        if self.retries_left == 0 {
            return false;
        }
        self.retries_left -= 1;
        self.challenge = rng.gen();
        self.pending = true;
        true
    }

    /// Whether `token`, arriving from `remote`, answers the outstanding challenge
    pub(super) fn matches(&self, token: u64, remote: SocketAddr) -> bool {
        !self.pending && token == self.challenge && remote == self.remote
    }
}

#[derive(Default)]
pub(crate) struct PathResponses {
    pending: Vec<PathResponse>,
}

impl PathResponses {
    pub(crate) fn push(&mut self, packet: u64, token: u64, remote: SocketAddr) {
        /// Arbitrary permissive limit to prevent abuse
        const MAX_PATH_RESPONSES: usize = 16;
        let response = PathResponse {
            packet,
            token,
            remote,
        };
        let existing = self.pending.iter_mut().find(|x| x.remote == remote);
        if let Some(existing) = existing {
            // Update a queued response
            if existing.packet <= packet {
                *existing = response;
            }
            return;
        }
        if self.pending.len() < MAX_PATH_RESPONSES {
            self.pending.push(response);
        } else {
            // We don't expect to ever hit this with well-behaved peers, so we don't bother dropping
            // older challenges.
            trace!("ignoring excessive PATH_CHALLENGE");
        }
    }

    pub(crate) fn pop_off_path(&mut self, remote: SocketAddr) -> Option<(u64, SocketAddr)> {
        let response = *self.pending.last()?;
        if response.remote == remote {
            // We don't bother searching further because we expect that the on-path response will
            // get drained in the immediate future by a call to `pop_on_path`
            return None;
        }
        self.pending.pop();
        Some((response.token, response.remote))
    }

    pub(crate) fn pop_on_path(&mut self, remote: SocketAddr) -> Option<u64> {
        let response = *self.pending.last()?;
        if response.remote != remote {
            // We don't bother searching further because we expect that the off-path response will
            // get drained in the immediate future by a call to `pop_off_path`
            return None;
        }
        self.pending.pop();
        Some(response.token)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Copy, Clone)]
struct PathResponse {
    /// The packet number the corresponding PATH_CHALLENGE was received in
    packet: u64,
    token: u64,
    /// The address the corresponding PATH_CHALLENGE was received from
    remote: SocketAddr,
}

/// Summary statistics of packets that have been sent on a particular path, but which have not yet
/// been acked or deemed lost
pub(super) struct InFlight {
    /// Sum of the sizes of all sent packets considered "in flight" by congestion control
    ///
    /// The size does not include IP or UDP overhead. Packets only containing ACK frames do not
    /// count towards this to ensure congestion control does not impede congestion feedback.
    pub(super) bytes: u64,
    /// Number of packets in flight containing frames other than ACK and PADDING
    ///
    /// This can be 0 even when bytes is not 0 because PADDING frames cause a packet to be
    /// considered "in flight" by congestion control. However, if this is nonzero, bytes will always
    /// also be nonzero.
    pub(super) ack_eliciting: u64,
}

impl InFlight {
    fn new() -> Self {
        Self {
            bytes: 0,
            ack_eliciting: 0,
        }
    }

    fn insert(&mut self, packet: &SentPacket) {
        self.bytes += u64::from(packet.size);
        self.ack_eliciting += u64::from(packet.ack_eliciting);
    }

    /// Update counters to account for a packet becoming acknowledged, lost, or abandoned
    fn remove(&mut self, packet: &SentPacket) {
        self.bytes -= u64::from(packet.size);
        self.ack_eliciting -= u64::from(packet.ack_eliciting);
    }
}
