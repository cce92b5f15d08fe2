use std::{
    cmp,
    collections::VecDeque,
    mem,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace, trace_span};

use crate::{
    cid_queue::{CidQueue, InsertError},
    coding::BufMutExt,
    config::TransportConfig,
    crypto::{self, KeyPair, Keys, PacketKey, TransportParameters},
    frame::{self, Close, Frame, FrameType},
    instant_saturating_sub,
    packet::{Header, InitialHeader, Packet, PartialDecode, SpaceId},
    range_set::ArrayRangeSet,
    shared::{
        ConnectionEvent, ConnectionEventInner, ConnectionId, EcnCodepoint, EndpointEvent,
        ResetToken,
    },
    Side, Transmit, TransportError, VarInt, LOC_CID_COUNT, MAX_CID_SIZE, MIN_INITIAL_SIZE,
    RESET_TOKEN_SIZE, TIMER_GRANULARITY,
};

mod cid_state;
use cid_state::CidState;

mod packet_builder;
use packet_builder::PacketBuilder;

mod paths;
pub use paths::{PathValidationReason, RttEstimator};
use paths::{PathData, PathResponses, PathValidator};

mod spaces;
use spaces::{PacketNumberFilter, PacketSpace, SentPacket, ThinRetransmits};

mod stats;
pub use stats::{ConnectionStats, DroppedPacketStats, FrameStats, PathStats, UdpStats};

mod timer;
pub use timer::Timer;
use timer::TimerTable;

/// Largest exponent used when backing off the probe timeout
const MAX_BACKOFF_EXPONENT: u32 = 16;
/// Exponent with which we encode the ACK delay field of outgoing ACK frames
const ACK_DELAY_EXPONENT: u64 = 3;

/// Protocol state and logic for a single QUIC connection
///
/// Objects of this type receive [`ConnectionEvent`]s and emit [`EndpointEvent`]s and application
/// [`Event`]s to make progress. To handle timeouts, a `Connection` returns timer updates via
/// [`Connection::poll_timeout`] and expects timeouts through [`Connection::handle_timeout`].
/// Datagrams to be transmitted are drained from [`Connection::poll_transmit`].
///
/// The entire API is *sans I/O*: no sockets are touched and the current time is always an
/// explicit argument, which makes the state machine fully deterministic and testable.
pub struct Connection {
    config: Arc<TransportConfig>,
    crypto: Box<dyn crypto::Session>,
    side: Side,
    state: State,
    rng: StdRng,
    /// The CID we initially chose, for use during the handshake
    handshake_cid: ConnectionId,
    /// The CID the peer initially chose, for use during the handshake
    rem_handshake_cid: ConnectionId,
    /// Attributes of CIDs issued on our behalf by the driving endpoint
    local_cid_state: CidState,
    path: PathData,
    /// The path most recently migrated away from, retained so late ACKs still count and so the
    /// connection can fall back if validating the new path fails
    prev_path: Option<PathData>,
    /// State of an outstanding reachability check, if any
    path_validator: Option<PathValidator>,
    /// Incoming PATH_CHALLENGEs waiting for a PATH_RESPONSE
    path_responses: PathResponses,
    /// Retry token to include in Initial packets; empty when no Retry was processed
    retry_token: Bytes,
    /// Destination CIDs usable for packets we send
    rem_cids: CidQueue,
    /// Whether the peer's first long header has fixed its CID choice
    rem_cid_confirmed: bool,
    version: u32,
    spaces: [PacketSpace; 3],
    /// Highest packet number space with usable keys
    highest_space: SpaceId,
    /// 1-RTT keys used prior to a key update
    prev_crypto: Option<PrevCrypto>,
    /// 1-RTT keys to be used for the next key update
    ///
    /// These are generated in advance to prevent timing attacks and/or DoS by third-party
    /// attackers spoofing key updates.
    next_crypto: Option<KeyPair<Box<dyn PacketKey>>>,
    /// Current key phase bit
    key_phase: bool,
    /// Number of packets to send in each key phase before initiating a routine update
    key_phase_size: u64,
    /// Number of the first 1-RTT packet sent under the current key phase
    key_phase_start: u64,
    /// Whether a packet protected by the current key phase has been acknowledged
    ///
    /// A fresh update may only be initiated once this holds (RFC 9001 §6.1).
    key_phase_acked: bool,
    peer_params: TransportParameters,
    peer_params_seen: bool,
    /// Stateless reset token the peer would use to abandon this connection
    peer_reset_token: Option<ResetToken>,
    /// Negotiated idle timeout
    idle_timeout: Option<Duration>,
    /// Maximum delay before acknowledging incoming ack-eliciting packets
    ///
    /// Starts from the local configuration; the peer may raise it with ACK_FREQUENCY.
    max_ack_delay: Duration,
    /// Sequence number of the most recent incoming ACK_FREQUENCY frame applied
    last_ack_frequency_seq: Option<u64>,
    /// Sequence number for the next outgoing ACK_FREQUENCY frame
    ack_frequency_sequence: u64,
    timers: TimerTable,
    /// Why the connection was lost, if it has been
    error: Option<ConnectionError>,
    events: VecDeque<Event>,
    endpoint_events: VecDeque<EndpointEvent>,
    /// Whether the spin bit is in use on this connection
    spin_enabled: bool,
    /// Outgoing spin bit state
    spin: bool,
    /// Packets received before their keys, retried once the keys arrive
    undecryptable: VecDeque<(SocketAddr, Option<EcnCodepoint>, BytesMut)>,
    /// Number of incoming packets that failed authentication
    authentication_failures: u64,
    /// Whether the handshake has been confirmed per RFC 9001
    handshake_confirmed: bool,
    /// Whether an outgoing CONNECTION_CLOSE still needs transmitting
    close: bool,
    /// Whether consecutive PTOs have flagged the path as degrading
    path_degraded: bool,
    /// Number of probe timeouts that elapsed without forward progress
    pto_count: u32,
    /// Whether the idle timer should be reset on the next ack-eliciting packet transmission
    permit_idle_reset: bool,
    /// Datagrams the driver could not send, transmitted again in order before anything new
    queued_transmits: VecDeque<Transmit>,
    packet_number_filter: PacketNumberFilter,
    stats: ConnectionStats,
}

impl Connection {
    /// Initialize connection state for `side`, communicating with `remote`
    ///
    /// `local_cid` is the first connection ID issued for routing to this connection (sequence 0).
    /// `rem_cid` is the destination CID for the first packets sent: the peer's source CID for a
    /// server, or a random placeholder for a client. Clients immediately queue their first
    /// handshake flight.
    pub fn new(
        config: Arc<TransportConfig>,
        crypto: Box<dyn crypto::Session>,
        side: Side,
        remote: SocketAddr,
        local_cid: ConnectionId,
        rem_cid: ConnectionId,
        now: Instant,
    ) -> Self {
        let mut rng = StdRng::from_entropy();
        let initial_keys = crypto.initial_keys(&rem_cid, side);
        #[cfg(test)]
        let packet_number_filter = match config.deterministic_packet_numbers {
            true => PacketNumberFilter::disabled(),
            false => PacketNumberFilter::new(&mut rng),
        };
        #[cfg(not(test))]
        let packet_number_filter = PacketNumberFilter::new(&mut rng);

        let mut this = Self {
            crypto,
            side,
            state: State::Handshake,
            handshake_cid: local_cid,
            rem_handshake_cid: rem_cid,
            local_cid_state: CidState::new(local_cid.len(), config.cid_rotation_interval, now, 1),
            path: PathData::new(remote, now, &config),
            prev_path: None,
            path_validator: None,
            path_responses: PathResponses::default(),
            retry_token: Bytes::new(),
            rem_cids: CidQueue::new(rem_cid),
            rem_cid_confirmed: side.is_server(),
            version: crate::VERSION,
            spaces: [
                PacketSpace::new(now),
                PacketSpace::new(now),
                PacketSpace::new(now),
            ],
            highest_space: SpaceId::Initial,
            prev_crypto: None,
            next_crypto: None,
            key_phase: false,
            key_phase_size: u64::MAX / 8,
            key_phase_start: 0,
            key_phase_acked: false,
            peer_params: TransportParameters::default(),
            peer_params_seen: false,
            peer_reset_token: None,
            idle_timeout: config.max_idle_timeout.map(|x| Duration::from_millis(x.0)),
            max_ack_delay: config.max_ack_delay,
            last_ack_frequency_seq: None,
            ack_frequency_sequence: 0,
            timers: TimerTable::default(),
            error: None,
            events: VecDeque::new(),
            endpoint_events: VecDeque::new(),
            spin_enabled: config.allow_spin && rng.gen_ratio(7, 8),
            spin: false,
            undecryptable: VecDeque::new(),
            authentication_failures: 0,
            handshake_confirmed: false,
            close: false,
            path_degraded: false,
            pto_count: 0,
            permit_idle_reset: true,
            queued_transmits: VecDeque::new(),
            packet_number_filter,
            stats: ConnectionStats::default(),
            config,
            rng,
        };
        this.spaces[SpaceId::Initial].crypto = Some(initial_keys);
        // Clients know the server's address works; servers must prove the reverse
        this.path.validated = side.is_client();
        if side.is_client() {
            this.write_crypto(now);
        }
        if let Some(t) = this.local_cid_state.next_timeout() {
            this.timers.set(Timer::PushNewCid, t);
        }
        this.reset_idle_timeout(now, SpaceId::Initial);
        this
    }

    /// Process `event`, queueing any resulting application or endpoint events
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event.0 {
            ConnectionEventInner::Datagram {
                now,
                remote,
                ecn,
                data,
            } => {
                if self.is_drained() {
                    return;
                }
                if remote != self.path.remote && !self.remote_permitted(remote) {
                    trace!(%remote, "discarding packet from unrecognized peer");
                    self.stats.dropped.unknown_remote += 1;
                    return;
                }
                self.stats.udp_rx.on_datagram(data.len() as u64);
                let len = data.len() as u64;
                let mut remaining = Some(data);
                while let Some(data) = remaining {
                    match PartialDecode::new(data, self.local_cid_state.cid_len()) {
                        Ok((partial, rest)) => {
                            remaining = rest;
                            self.handle_decode(now, remote, ecn, partial);
                            if self.is_drained() {
                                return;
                            }
                        }
                        Err(e) => {
                            trace!("malformed header: {e}");
                            self.stats.dropped.header_parse += 1;
                            break;
                        }
                    }
                }
                // Credit the anti-amplification budget of whichever path the datagram
                // arrived on, which may have changed if it triggered a migration
                if remote == self.path.remote {
                    self.path.total_recvd = self.path.total_recvd.saturating_add(len);
                }
            }
            ConnectionEventInner::NewIdentifiers(ids, now) => {
                self.local_cid_state.new_cids(&ids, now);
                self.spaces[SpaceId::Data].pending.new_cids.extend(ids);
                if let Some(t) = self.local_cid_state.next_timeout() {
                    self.timers.set(Timer::PushNewCid, t);
                }
            }
        }
    }

    /// Process timer expirations
    ///
    /// Executes protocol logic, potentially preparing signals (including application `Event`s,
    /// `EndpointEvent`s and outgoing datagrams) that should be extracted through the relevant
    /// methods.
    pub fn handle_timeout(&mut self, now: Instant) {
        for &timer in &Timer::VALUES {
            if !self.timers.is_expired(timer, now) {
                continue;
            }
            self.timers.stop(timer);
            trace!(timer = ?timer, "timeout");
            match timer {
                Timer::Close => {
                    self.state = State::Drained;
                    self.endpoint_events.push_back(EndpointEvent::Drained);
                }
                Timer::Idle => {
                    self.kill(ConnectionError::TimedOut);
                }
                Timer::KeepAlive => {
                    trace!("sending keep-alive");
                    self.ping();
                }
                Timer::LossDetection => {
                    self.on_loss_detection_timeout(now);
                }
                Timer::KeyDiscard => {
                    self.prev_crypto = None;
                }
                Timer::PathValidation => {
                    self.on_path_validation_timeout();
                }
                Timer::PushNewCid => {
                    if self.local_cid_state.on_cid_timeout() {
                        // A NEW_CONNECTION_ID with the advanced retire_prior_to rides out
                        // with the replacement identifier
                        self.endpoint_events
                            .push_back(EndpointEvent::NeedIdentifiers(1));
                    }
                    if let Some(t) = self.local_cid_state.next_timeout() {
                        self.timers.set(Timer::PushNewCid, t);
                    }
                }
                Timer::MaxAckDelay => {
                    trace!("max ack delay reached");
                    self.spaces[SpaceId::Data]
                        .pending_acks
                        .on_max_ack_delay_timeout();
                }
            }
        }
    }

    /// Returns application-facing events
    ///
    /// Connections should be polled for events after:
    /// - a call was made to `handle_event`
    /// - a call was made to `handle_timeout`
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Return endpoint-facing events
    pub fn poll_endpoint_events(&mut self) -> Option<EndpointEvent> {
        self.endpoint_events.pop_front()
    }

    /// Returns the next time at which `handle_timeout` should be called
    ///
    /// The value returned may change after:
    /// - the application performed some I/O on the connection
    /// - a call was made to `handle_event`
    /// - a call to `poll_transmit` returned `Some`
    /// - a call was made to `handle_timeout`
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Close a connection immediately
    ///
    /// This does not ensure delivery of outstanding data. It is the application's responsibility
    /// to call this only when all important communications have been completed, e.g. by calling
    /// it only after all data has been acknowledged by the peer. A CONNECTION_CLOSE frame goes
    /// out with the next [`Connection::poll_transmit`].
    pub fn close(&mut self, now: Instant, error_code: VarInt, reason: Bytes) {
        self.close_inner(
            now,
            Close::Application(frame::ApplicationClose { error_code, reason }),
        );
    }

    /// Queue a PING frame, requesting an immediate acknowledgement from the peer
    pub fn ping(&mut self) {
        self.spaces[self.highest_space].ping_pending = true;
    }

    /// Begin checking reachability of `remote` without migrating to it
    ///
    /// The outcome is reported via [`Event::PathValidated`] or
    /// [`Event::PathValidationFailed`] with [`PathValidationReason::Probe`]. Ignored if another
    /// validation is already in progress or 1-RTT keys are not yet available.
    pub fn probe_path(&mut self, remote: SocketAddr) {
        if self.path_validator.is_some()
            || self.spaces[SpaceId::Data].crypto.is_none()
            || self.state.is_closed()
        {
            return;
        }
        let timeout = self.path_validation_timeout();
        let retries = self.config.path_validation_retries;
        self.path_validator = Some(PathValidator::new(
            remote,
            PathValidationReason::Probe,
            timeout,
            retries,
            &mut self.rng,
        ));
    }

    /// Hand a datagram back after the driver failed to send it
    ///
    /// Requeued datagrams are returned by subsequent [`Connection::poll_transmit`] calls before
    /// any newly built datagram, in the order they were queued.
    pub fn requeue_transmit(&mut self, transmit: Transmit) {
        self.queued_transmits.push_back(transmit);
    }

    /// Which side of the connection we are
    pub fn side(&self) -> Side {
        self.side
    }

    /// The address the connection currently sends to and expects traffic from
    pub fn remote_address(&self) -> SocketAddr {
        self.path.remote
    }

    /// Current best estimate of this connection's latency (round-trip-time)
    pub fn rtt(&self) -> Duration {
        self.path.rtt.get()
    }

    /// Connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats;
        stats.path.rtt = self.path.rtt.get();
        stats.path.cwnd = self.path.congestion.window();
        stats
    }

    /// Whether the cryptographic handshake is still in progress
    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, State::Handshake)
    }

    /// Whether the connection is closed
    ///
    /// Closed connections cannot transport any further data. A connection becomes closed when
    /// either peer application intentionally closes it, or when either transport layer detects
    /// an error such as a time-out or certificate validation failure. A closed connection must
    /// still be driven until [`Connection::is_drained`] to free up its resources.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether there is no longer any need to keep the connection around
    ///
    /// All drained connections have been closed. The reverse does not hold: closed connections
    /// linger long enough to guarantee that packets sent by the peer before it learned of the
    /// close do not provoke a fresh connection.
    pub fn is_drained(&self) -> bool {
        matches!(self.state, State::Drained)
    }

    /// Whether a datagram from `remote` may be processed at all
    fn remote_permitted(&self, remote: SocketAddr) -> bool {
        if self.side.is_server() && self.config.migration {
            return true;
        }
        // Answers to an outstanding path probe arrive off the active path
        self.path_validator
            .as_ref()
            .is_some_and(|v| v.remote == remote)
    }
}

impl Connection {
    fn handle_decode(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        partial: PartialDecode,
    ) {
        let Some(space_id) = partial.space() else {
            trace!("dropping unsupported packet");
            self.stats.dropped.header_parse += 1;
            return;
        };
        if partial.is_0rtt() {
            trace!("dropping 0-RTT packet");
            self.stats.dropped.stale_space += 1;
            return;
        }
        if self.spaces[space_id].crypto.is_none() {
            if space_id > self.highest_space {
                // Keys should arrive momentarily; stash the packet so it isn't lost to the race
                if self.undecryptable.len() < self.config.max_undecryptable_packets {
                    self.undecryptable.push_back((remote, ecn, partial.data()));
                } else {
                    self.stats.dropped.buffer_overflow += 1;
                }
            } else {
                trace!(space = ?space_id, "dropping packet for discarded space");
                self.stats.dropped.stale_space += 1;
            }
            return;
        }

        let packet = {
            let keys = self.spaces[space_id].crypto.as_ref().unwrap();
            partial.finish(Some(&*keys.header.remote))
        };
        let mut packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                trace!("unable to complete packet decoding: {e}");
                self.stats.dropped.header_parse += 1;
                return;
            }
        };

        let number = match self.decrypt_packet(now, space_id, &mut packet) {
            Ok(number) => number,
            Err(Some(e)) => {
                self.on_transport_error(now, e);
                return;
            }
            Err(None) => {
                if self.stateless_reset_detected(&packet) {
                    debug!("got stateless reset");
                    self.kill(ConnectionError::Reset);
                } else {
                    trace!("failed to authenticate packet");
                    self.stats.dropped.decrypt_failed += 1;
                    self.authentication_failures += 1;
                    let integrity_limit = self.spaces[space_id]
                        .crypto
                        .as_ref()
                        .unwrap()
                        .packet
                        .local
                        .integrity_limit();
                    if self.authentication_failures > integrity_limit {
                        self.kill(
                            TransportError::AEAD_LIMIT_REACHED("integrity limit violated").into(),
                        );
                    }
                }
                return;
            }
        };

        let span = trace_span!("recv", space = ?space_id, pn = number);
        let _guard = span.enter();

        if self.spaces[space_id].dedup.insert(number) {
            trace!("discarding possible duplicate packet");
            self.stats.dropped.duplicate += 1;
            return;
        }
        if !packet.reserved_bits_valid() {
            self.on_transport_error(now, TransportError::PROTOCOL_VIOLATION("reserved bits set"));
            return;
        }

        // The peer's first long header settles which source CID it is using
        if !self.rem_cid_confirmed {
            let src_cid = match packet.header {
                Header::Initial(InitialHeader { src_cid, .. }) => Some(src_cid),
                Header::Long { src_cid, .. } => Some(src_cid),
                _ => None,
            };
            if let Some(src_cid) = src_cid {
                self.rem_cid_confirmed = true;
                self.rem_handshake_cid = src_cid;
                self.rem_cids.update_initial_cid(src_cid);
            }
        }

        self.on_packet_authenticated(now, space_id, ecn, number, &packet);

        match self.state {
            State::Handshake | State::Established => {
                if let Err(e) = self.process_payload(now, remote, space_id, number, packet) {
                    self.on_transport_error(now, e);
                }
            }
            State::Closed(_) => {
                // Re-announce our close in case the previous announcement was lost
                self.close = true;
                if let Ok(iter) = frame::Iter::new(packet.payload.freeze()) {
                    for frame in iter.flatten() {
                        if let Frame::Close(_) = frame {
                            trace!("peer closed as well; draining");
                            self.state = State::Draining;
                            break;
                        }
                    }
                }
            }
            State::Draining | State::Drained => {}
        }
    }

    fn on_packet_authenticated(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        ecn: Option<EcnCodepoint>,
        number: u64,
        packet: &Packet,
    ) {
        trace!("authenticated");
        self.reset_idle_timeout(now, space_id);
        self.permit_idle_reset = true;
        if let Some(x) = ecn {
            self.spaces[space_id].ecn_counters += x;
        }
        self.spaces[space_id].rx_packet = cmp::max(self.spaces[space_id].rx_packet, number);

        if let Header::Short { spin, .. } = packet.header {
            if number == self.spaces[space_id].rx_packet {
                self.spin = match self.side {
                    Side::Client => !spin,
                    Side::Server => spin,
                };
            }
        }

        if space_id == SpaceId::Handshake && self.spaces[SpaceId::Initial].crypto.is_some() {
            // A Handshake packet proves the peer processed our Initial, so those keys (and the
            // server's doubts about our address) can be dropped
            if self.side.is_server() {
                self.path.validated = true;
            }
            self.discard_space(now, SpaceId::Initial);
        }
    }

    fn process_payload(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        space_id: SpaceId,
        number: u64,
        packet: Packet,
    ) -> Result<(), TransportError> {
        let payload = packet.payload.freeze();
        let mut is_probing_packet = true;
        let mut ack_eliciting = false;
        let mut close = None;
        for result in frame::Iter::new(payload)? {
            let frame = result?;
            let ty = frame.ty();
            self.stats.frame_rx.record(&frame);
            if space_id != SpaceId::Data
                && !matches!(
                    frame,
                    Frame::Padding
                        | Frame::Ping
                        | Frame::Ack(_)
                        | Frame::Crypto(_)
                        | Frame::Close(Close::Connection(_))
                )
            {
                let mut err =
                    TransportError::PROTOCOL_VIOLATION("illegal frame type in handshake packet");
                err.frame = Some(ty);
                return Err(err);
            }
            ack_eliciting |= frame.is_ack_eliciting();
            if !frame.is_probing() {
                is_probing_packet = false;
            }
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Crypto(frame) => {
                    self.read_crypto(now, space_id, frame)?;
                }
                Frame::Ack(ack) => {
                    self.on_ack_received(now, space_id, ack)?;
                }
                Frame::Close(reason) => {
                    close = Some(reason);
                }
                Frame::PathChallenge(token) => {
                    self.path_responses.push(number, token, remote);
                }
                Frame::PathResponse(token) => {
                    if self
                        .path_validator
                        .as_ref()
                        .is_some_and(|v| v.matches(token, remote))
                    {
                        let validator = self.path_validator.take().unwrap();
                        self.timers.stop(Timer::PathValidation);
                        trace!(remote = %validator.remote, "path validated");
                        if validator.remote == self.path.remote {
                            self.path.validated = true;
                            if matches!(validator.reason, PathValidationReason::Migration) {
                                self.prev_path = None;
                            }
                        }
                        self.events.push_back(Event::PathValidated {
                            reason: validator.reason,
                        });
                    } else {
                        debug!(token, "ignoring invalid PATH_RESPONSE");
                    }
                }
                Frame::NewConnectionId(frame) => {
                    trace!(
                        sequence = frame.sequence,
                        id = %frame.id,
                        retire_prior_to = frame.retire_prior_to,
                        "got NEW_CONNECTION_ID",
                    );
                    if self.rem_cids.active().is_empty() {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "NEW_CONNECTION_ID when CIDs aren't in use",
                        ));
                    }
                    match self.rem_cids.insert(frame) {
                        Ok(None) => {}
                        Ok(Some((retired, reset_token))) => {
                            // The peer's retire_prior_to also retired our active CID, so a
                            // replacement was activated along with its reset token
                            self.spaces[SpaceId::Data]
                                .pending
                                .retire_cids
                                .extend(retired);
                            self.set_reset_token(reset_token);
                        }
                        Err(InsertError::ExceedsLimit) => {
                            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR(""));
                        }
                        Err(InsertError::Retired) => {
                            trace!("discarding already-retired CID");
                            self.spaces[SpaceId::Data]
                                .pending
                                .retire_cids
                                .push(frame.sequence);
                        }
                    }
                }
                Frame::RetireConnectionId { sequence } => {
                    let limit = cmp::min(
                        LOC_CID_COUNT,
                        self.peer_params.active_connection_id_limit.into_inner(),
                    );
                    if self.local_cid_state.on_cid_retirement(sequence, limit)? {
                        self.endpoint_events
                            .push_back(EndpointEvent::NeedIdentifiers(1));
                    }
                    self.endpoint_events
                        .push_back(EndpointEvent::RetireConnectionId(sequence));
                }
                Frame::NewToken(frame::NewToken { token }) => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION("client sent NEW_TOKEN"));
                    }
                    if token.is_empty() {
                        return Err(TransportError::FRAME_ENCODING_ERROR("empty token"));
                    }
                    trace!("got address validation token");
                    self.events.push_back(Event::NewToken { token });
                }
                Frame::HandshakeDone => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "client sent HANDSHAKE_DONE",
                        ));
                    }
                    if !self.handshake_confirmed {
                        self.handshake_confirmed = true;
                        if self.spaces[SpaceId::Handshake].crypto.is_some() {
                            self.discard_space(now, SpaceId::Handshake);
                        }
                    }
                }
                Frame::AckFrequency(frame) => {
                    if self
                        .last_ack_frequency_seq
                        .is_some_and(|seq| frame.sequence.into_inner() <= seq)
                    {
                        // Stale update
                        continue;
                    }
                    let delay = Duration::from_micros(frame.request_max_ack_delay.into_inner());
                    if delay < TIMER_GRANULARITY {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "implausible max ACK delay",
                        ));
                    }
                    self.last_ack_frequency_seq = Some(frame.sequence.into_inner());
                    self.max_ack_delay = delay;
                    self.spaces[SpaceId::Data]
                        .pending_acks
                        .set_ack_frequency_params(&frame);
                }
                Frame::ImmediateAck => {
                    self.spaces[space_id]
                        .pending_acks
                        .set_immediate_ack_required();
                }
                Frame::Stream(stream) => {
                    self.events.push_back(Event::Stream(stream));
                }
                _ => {
                    // Flow control and stream lifecycle are the caller's concern
                    trace!("ignoring {ty:?} frame");
                }
            }
        }

        if let Some(reason) = close {
            self.on_peer_close(now, reason);
            return Ok(());
        }

        let arm_ack_timer = {
            let space = &mut self.spaces[space_id];
            space.pending_acks.insert_one(number, now);
            space
                .pending_acks
                .packet_received(now, number, ack_eliciting, &space.dedup)
        };
        if ack_eliciting && space_id != SpaceId::Data {
            // Acknowledge handshake packets without delay to keep the handshake moving
            self.spaces[space_id]
                .pending_acks
                .set_immediate_ack_required();
        } else if arm_ack_timer {
            self.timers
                .set(Timer::MaxAckDelay, now + self.max_ack_delay);
        }

        // An incoming non-probing 1-RTT packet at the top of the packet number sequence moves
        // the connection to the address it came from
        if remote != self.path.remote
            && space_id == SpaceId::Data
            && !is_probing_packet
            && self.side.is_server()
            && self.config.migration
            && number == self.spaces[SpaceId::Data].rx_packet
        {
            self.migrate(now, remote);
            // Switch CIDs to avoid linking the old and new paths, when possible
            self.update_rem_cid();
        }

        Ok(())
    }

    fn on_ack_received(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.spaces[space_id].next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked"));
        }
        let new_largest = {
            let space = &mut self.spaces[space_id];
            if space
                .largest_acked_packet
                .map_or(true, |pn| ack.largest > pn)
            {
                space.largest_acked_packet = Some(ack.largest);
                if let Some(info) = space.sent_packets.get(&ack.largest) {
                    // This should always succeed, but a misbehaving peer might ACK a packet we
                    // never sent, which we tolerate here after the filter check below
                    space.largest_acked_packet_sent = info.time_sent;
                }
                true
            } else {
                false
            }
        };

        // Avoid DoS from unreasonably huge ack ranges by filtering out just the new acks
        let mut newly_acked = ArrayRangeSet::default();
        for range in ack.iter() {
            self.packet_number_filter.check_ack(space_id, range.clone())?;
            for (&pn, _) in self.spaces[space_id].sent_packets.range(range) {
                newly_acked.insert_one(pn);
            }
        }

        let mut ack_eliciting_acked = false;
        for packet in newly_acked.elts() {
            if let Some(info) = self.spaces[space_id].take(packet) {
                if let Some(acked) = info.largest_acked {
                    // Assume ACKs for all packets below the largest acknowledged in `packet` have
                    // been received. This can cause the peer to spuriously retransmit if some of
                    // our earlier ACKs were lost, but allows for simpler state tracking.
                    self.spaces[space_id].pending_acks.subtract_below(acked);
                }
                ack_eliciting_acked |= info.ack_eliciting;

                // If a packet sent under the fresh key phase was acked, the update is confirmed
                if let Some(prev) = &mut self.prev_crypto {
                    if prev.end_packet.is_some_and(|(pn, _)| packet >= pn) {
                        prev.update_unacked = false;
                    }
                }
                if space_id == SpaceId::Data && packet >= self.key_phase_start {
                    self.key_phase_acked = true;
                }

                self.on_packet_acked(now, packet, info);
            }
        }

        if new_largest && ack_eliciting_acked {
            let ack_delay = match space_id {
                SpaceId::Data => cmp::min(
                    self.peer_max_ack_delay(),
                    Duration::from_micros(
                        ack.delay << self.peer_params.ack_delay_exponent.into_inner().min(20),
                    ),
                ),
                _ => Duration::from_micros(0),
            };
            let rtt = instant_saturating_sub(now, self.spaces[space_id].largest_acked_packet_sent);
            self.path.rtt.update(ack_delay, rtt);
            if self.path.first_packet_after_rtt_sample.is_none() {
                self.path.first_packet_after_rtt_sample =
                    Some((space_id, self.spaces[space_id].next_packet_number));
            }
        }

        if !newly_acked.is_empty() {
            self.pto_count = 0;
            if self.path_degraded {
                self.path_degraded = false;
                self.events.push_back(Event::PathRecovered);
            }
        }

        if self.path.sending_ecn {
            if let Some(ecn) = ack.ecn {
                // Only examine ECN counters from ACKs that we are certain we received in transmit
                // order, allowing us to compute an increase in ECN counts to compare against the
                // number of newly acked packets that remains well-defined in the presence of
                // arbitrary packet reordering
                if new_largest {
                    let sent = self.spaces[space_id].largest_acked_packet_sent;
                    self.process_ecn(now, space_id, newly_acked.len() as u64, ecn, sent);
                }
            } else {
                // We always start out sending ECN, so any ack that doesn't acknowledge it
                // disables it
                debug!("ECN not acknowledged by peer");
                self.path.sending_ecn = false;
            }
        }

        self.detect_lost_packets(now, space_id);
        self.set_loss_detection_timer(now);
        Ok(())
    }

    fn process_ecn(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        newly_acked: u64,
        ecn: frame::EcnCounts,
        largest_sent_time: Instant,
    ) {
        match self.spaces[space_id].detect_ecn(newly_acked, ecn) {
            Err(e) => {
                debug!("halting ECN due to verification failure: {e}");
                self.path.sending_ecn = false;
                // Wipe out the existing value because it might be garbage and could interfere
                // with future attempts to use ECN on new paths
                self.spaces[space_id].ecn_feedback = frame::EcnCounts::ZERO;
            }
            Ok(false) => {}
            Ok(true) => {
                self.stats.path.congestion_events += 1;
                self.path
                    .congestion
                    .on_congestion_event(now, largest_sent_time, false, 0);
            }
        }
    }

    fn on_packet_acked(&mut self, now: Instant, packet: u64, info: SentPacket) {
        if self.path.remove_in_flight(packet, &info) {
            if info.ack_eliciting {
                self.path.congestion.on_ack(
                    now,
                    info.time_sent,
                    u64::from(info.size),
                    false,
                    &self.path.rtt,
                );
            }
        } else if let Some(prev) = &mut self.prev_path {
            prev.remove_in_flight(packet, &info);
        }
    }

    fn detect_lost_packets(&mut self, now: Instant, pn_space: SpaceId) {
        let largest_acked = match self.spaces[pn_space].largest_acked_packet {
            Some(x) => x,
            None => return,
        };
        let loss_delay = cmp::max(
            self.path
                .rtt
                .conservative()
                .mul_f32(self.config.time_threshold),
            TIMER_GRANULARITY,
        );
        // Packets sent before this time are deemed lost
        let lost_send_time = now.checked_sub(loss_delay);
        let packet_threshold = u64::from(self.config.packet_threshold);

        let mut lost_packets = Vec::<u64>::new();
        let mut new_loss_time = None;
        for (&packet, info) in self.spaces[pn_space].sent_packets.range(0..largest_acked) {
            if lost_send_time.is_some_and(|t| info.time_sent <= t)
                || largest_acked >= packet + packet_threshold
            {
                lost_packets.push(packet);
            } else {
                let next_loss_time = info.time_sent + loss_delay;
                new_loss_time = Some(match new_loss_time {
                    None => next_loss_time,
                    Some(x) => cmp::min(x, next_loss_time),
                });
            }
        }
        self.spaces[pn_space].loss_time = new_loss_time;

        if lost_packets.is_empty() {
            return;
        }
        debug!("packets lost: {lost_packets:?}");

        let old_bytes_in_flight = self.path.in_flight.bytes;
        let first_lost = lost_packets[0];
        let largest_lost = *lost_packets.last().unwrap();
        let mut largest_lost_sent = None;
        let mut earliest_lost_sent = None;
        let mut lost_bytes = 0;
        for &packet in &lost_packets {
            let info = match self.spaces[pn_space].take(packet) {
                Some(x) => x,
                None => continue,
            };
            if packet == largest_lost {
                largest_lost_sent = Some(info.time_sent);
            }
            earliest_lost_sent.get_or_insert(info.time_sent);
            self.remove_in_flight(packet, &info);
            lost_bytes += u64::from(info.size);
            self.stats.path.lost_packets += 1;
            self.stats.path.lost_bytes += u64::from(info.size);
            self.spaces[pn_space].pending |= info.retransmits;
        }

        // Don't apply congestion penalty for lost ack-only packets
        if self.path.in_flight.bytes != old_bytes_in_flight {
            let largest_lost_sent = largest_lost_sent.unwrap();
            let persistent = self.in_persistent_congestion(
                pn_space,
                first_lost,
                earliest_lost_sent.unwrap(),
                largest_lost_sent,
            );
            self.stats.path.congestion_events += 1;
            self.path
                .congestion
                .on_congestion_event(now, largest_lost_sent, persistent, lost_bytes);
        }
    }

    /// Whether a span of losses establishes persistent congestion per RFC 9002
    ///
    /// Only packets sent after an RTT sample was taken may contribute, so that the congestion
    /// period is measured against a meaningful PTO.
    fn in_persistent_congestion(
        &self,
        space: SpaceId,
        earliest_lost_packet: u64,
        earliest_lost_sent: Instant,
        largest_lost_sent: Instant,
    ) -> bool {
        let Some((sample_space, sample_packet)) = self.path.first_packet_after_rtt_sample else {
            return false;
        };
        if (sample_space, sample_packet) > (space, earliest_lost_packet) {
            return false;
        }
        let congestion_period =
            self.pto(SpaceId::Data) * self.config.persistent_congestion_threshold;
        instant_saturating_sub(largest_lost_sent, earliest_lost_sent) > congestion_period
    }

    fn loss_time_and_space(&self) -> Option<(Instant, SpaceId)> {
        SpaceId::iter()
            .filter_map(|id| Some((self.spaces[id].loss_time?, id)))
            .min_by_key(|&(time, _)| time)
    }

    fn pto_time_and_space(&self, now: Instant) -> Option<(Instant, SpaceId)> {
        let backoff = 2u32.saturating_pow(self.pto_count.min(MAX_BACKOFF_EXPONENT));
        let mut duration = self.path.rtt.pto_base() * backoff;

        if self.path.in_flight.ack_eliciting == 0 {
            if !self.peer_awaiting_address_validation() {
                return None;
            }
            // Arm the PTO anyway so an anti-amplification-blocked server can't deadlock us
            let space = match self.spaces[SpaceId::Handshake].crypto.is_some() {
                true => SpaceId::Handshake,
                false => SpaceId::Initial,
            };
            return Some((now + duration, space));
        }

        let mut result = None;
        for space in SpaceId::iter() {
            if self.spaces[space].crypto.is_none() {
                continue;
            }
            let Some(last) = self.spaces[space].time_of_last_ack_eliciting_packet else {
                continue;
            };
            if space == SpaceId::Data {
                // The PTO timer must not be armed for the data space until the handshake is
                // confirmed, per RFC 9002
                if !self.handshake_confirmed {
                    continue;
                }
                duration += self.peer_max_ack_delay() * backoff;
            }
            let timeout = last + duration;
            if result.map_or(true, |(t, _)| timeout < t) {
                result = Some((timeout, space));
            }
        }
        result
    }

    /// Whether we need to send handshake probes even with nothing ack-eliciting in flight, lest
    /// the peer be unable to respond due to its own anti-amplification limit
    fn peer_awaiting_address_validation(&self) -> bool {
        self.side.is_client() && self.is_handshaking()
    }

    pub(super) fn set_loss_detection_timer(&mut self, now: Instant) {
        if self.state.is_closed() {
            // No loss detection takes place on closed connections
            self.timers.stop(Timer::LossDetection);
            return;
        }
        if let Some((loss_time, _)) = self.loss_time_and_space() {
            // Time threshold loss detection
            self.timers.set(Timer::LossDetection, loss_time);
            return;
        }
        if self
            .path
            .anti_amplification_blocked(self.config.anti_amplification_factor, 1)
        {
            // We wouldn't be able to send the probe anyway; wait for more datagrams to arrive
            self.timers.stop(Timer::LossDetection);
            return;
        }
        match self.pto_time_and_space(now) {
            Some((timeout, _)) => self.timers.set(Timer::LossDetection, timeout),
            None => self.timers.stop(Timer::LossDetection),
        }
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) {
        if let Some((_, pn_space)) = self.loss_time_and_space() {
            // Time threshold loss detection
            self.detect_lost_packets(now, pn_space);
            self.set_loss_detection_timer(now);
            return;
        }

        let (_, space) = match self.pto_time_and_space(now) {
            Some(x) => x,
            None => {
                self.timers.stop(Timer::LossDetection);
                return;
            }
        };
        trace!(
            in_flight = self.path.in_flight.bytes,
            count = self.pto_count,
            ?space,
            "PTO fired",
        );
        self.pto_count = self.pto_count.saturating_add(1);

        if self.handshake_confirmed && self.path.in_flight.ack_eliciting > 0 {
            if self.pto_count > self.config.max_consecutive_ptos {
                self.kill(ConnectionError::TooManyPtos);
                return;
            }
            if !self.path_degraded && self.pto_count >= self.config.path_degrading_pto_count {
                self.path_degraded = true;
                self.events.push_back(Event::PathDegrading);
            }
        }

        self.spaces[space].loss_probes = self.spaces[space].loss_probes.saturating_add(2);
        self.set_loss_detection_timer(now);
    }

    fn pto(&self, space: SpaceId) -> Duration {
        let max_ack_delay = match space {
            SpaceId::Initial | SpaceId::Handshake => Duration::ZERO,
            SpaceId::Data => self.peer_max_ack_delay(),
        };
        self.path.rtt.pto_base() + max_ack_delay
    }

    fn peer_max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.peer_params.max_ack_delay.into_inner())
    }

    fn peer_supports_ack_frequency(&self) -> bool {
        self.peer_params.min_ack_delay.is_some()
    }

    fn path_validation_timeout(&self) -> Duration {
        cmp::max(3 * self.pto(SpaceId::Data), 6 * self.config.initial_rtt)
    }

    fn write_crypto(&mut self, now: Instant) {
        loop {
            let space = self.highest_space;
            let mut outgoing = Vec::new();
            let new_keys = self.crypto.write_handshake(&mut outgoing);
            let wrote = !outgoing.is_empty();
            if wrote {
                // Outgoing bytes always belong to the space that was current when they were
                // produced, even if they arrive together with an upgrade
                let offset = self.spaces[space].crypto_offset;
                let outgoing = Bytes::from(outgoing);
                trace!(space = ?space, offset, size = outgoing.len(), "wrote handshake bytes");
                self.spaces[space].crypto_offset += outgoing.len() as u64;
                self.spaces[space].pending.crypto.push_back(frame::Crypto {
                    offset,
                    data: outgoing,
                });
            }
            match new_keys {
                Some(crypto) => match space {
                    SpaceId::Initial => self.upgrade_crypto(now, SpaceId::Handshake, crypto),
                    SpaceId::Handshake => self.upgrade_crypto(now, SpaceId::Data, crypto),
                    _ => unreachable!("got updated secrets during 1-RTT"),
                },
                None => {
                    if !wrote {
                        break;
                    }
                }
            }
        }
    }

    /// Switch to stronger cryptography during handshake
    fn upgrade_crypto(&mut self, now: Instant, space: SpaceId, crypto: Keys) {
        debug_assert!(
            self.spaces[space].crypto.is_none(),
            "already reached packet space {space:?}"
        );
        trace!("{space:?} keys ready");
        if space == SpaceId::Data {
            // Precompute the first key update
            self.next_crypto = self.crypto.next_1rtt_keys();
            self.key_phase_size = crypto
                .packet
                .local
                .confidentiality_limit()
                .saturating_div(8);
        }
        self.spaces[space].crypto = Some(crypto);
        debug_assert!(space as usize > self.highest_space as usize);
        self.highest_space = space;

        // Packets that arrived before the keys can now be decrypted
        let stashed = mem::take(&mut self.undecryptable);
        for (remote, ecn, data) in stashed {
            match PartialDecode::new(data, self.local_cid_state.cid_len()) {
                Ok((partial, _)) => self.handle_decode(now, remote, ecn, partial),
                Err(_) => {
                    self.stats.dropped.header_parse += 1;
                }
            }
        }
    }

    fn read_crypto(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        crypto: frame::Crypto,
    ) -> Result<(), TransportError> {
        trace!(
            offset = crypto.offset,
            len = crypto.data.len(),
            "got crypto frame",
        );
        {
            let space = &mut self.spaces[space_id];
            space.crypto_stream.insert(
                crypto.offset,
                crypto.data,
                self.config.crypto_buffer_size,
            )?;
        }
        while let Some(chunk) = self.spaces[space_id].crypto_stream.read() {
            trace!("consumed {} handshake bytes", chunk.len());
            self.crypto.read_handshake(&chunk)?;
        }

        if !self.peer_params_seen {
            if let Some(params) = self.crypto.transport_parameters()? {
                self.handle_peer_params(params)?;
            }
        }
        self.write_crypto(now);

        if self.crypto.is_handshaking() || !matches!(self.state, State::Handshake) {
            return Ok(());
        }
        if !self.peer_params_seen {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "transport parameters missing",
            ));
        }

        self.events.push_back(Event::Connected);
        self.state = State::Established;
        trace!("established");
        if self.side.is_server() {
            // The server is implicitly confirmed by completing the handshake, and must tell the
            // client so it can discard its handshake state too
            self.spaces[SpaceId::Data].pending.handshake_done = true;
            self.handshake_confirmed = true;
            if self.spaces[SpaceId::Handshake].crypto.is_some() {
                self.discard_space(now, SpaceId::Handshake);
            }
            // Grant the client a token it can use to skip address validation in the future
            self.spaces[SpaceId::Data]
                .pending
                .new_tokens
                .push(self.path.remote);
        }
        Ok(())
    }

    fn handle_peer_params(&mut self, params: TransportParameters) -> Result<(), TransportError> {
        if Some(self.rem_handshake_cid) != params.initial_src_cid {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "initial_source_connection_id mismatch",
            ));
        }
        if self.side.is_server() && params.stateless_reset_token.is_some() {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "client sent stateless_reset_token",
            ));
        }
        if let Some(min_ack_delay) = params.min_ack_delay {
            // max_ack_delay is in milliseconds, min_ack_delay in microseconds
            if min_ack_delay.into_inner() > params.max_ack_delay.into_inner() * 1_000 {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "min_ack_delay exceeds max_ack_delay",
                ));
            }
        }
        if params.active_connection_id_limit.into_inner() < 2 && self.local_cid_state.cid_len() != 0
        {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "active_connection_id_limit too small",
            ));
        }

        // The effective idle timeout is the smaller of the two advertised values, where zero
        // disables enforcement
        let peer_timeout = params.max_idle_timeout.into_inner();
        self.idle_timeout = match (self.config.max_idle_timeout, peer_timeout) {
            (None, 0) => None,
            (None, x) => Some(Duration::from_millis(x)),
            (Some(x), 0) => Some(Duration::from_millis(x.into_inner())),
            (Some(x), y) => Some(Duration::from_millis(cmp::min(x.into_inner(), y))),
        };

        if let Some(token) = params.stateless_reset_token {
            self.set_reset_token(token);
        }
        if self.local_cid_state.cid_len() != 0 {
            // Now that we know the peer's CID capacity, top up its supply
            let limit = cmp::min(LOC_CID_COUNT, params.active_connection_id_limit.into_inner());
            let deficit = limit.saturating_sub(self.local_cid_state.active_cids());
            if deficit > 0 {
                self.endpoint_events
                    .push_back(EndpointEvent::NeedIdentifiers(deficit));
            }
        }
        if params.min_ack_delay.is_some() {
            // The peer understands ACK_FREQUENCY; share our preferences
            self.spaces[SpaceId::Data].pending.ack_frequency = true;
        }
        self.peer_params = params;
        self.peer_params_seen = true;
        trace!("got transport parameters");
        Ok(())
    }

    fn set_reset_token(&mut self, reset_token: ResetToken) {
        self.endpoint_events
            .push_back(EndpointEvent::ResetToken(self.path.remote, reset_token));
        self.peer_reset_token = Some(reset_token);
    }

    /// Decrypt a packet's payload in place, returning its full packet number
    ///
    /// `Err(None)` indicates the packet could not be authenticated, which the caller must treat
    /// as expected behavior from an attacker on the wire.
    fn decrypt_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        packet: &mut Packet,
    ) -> Result<u64, Option<TransportError>> {
        let number = packet
            .header
            .number()
            .ok_or(None)?
            .expand(self.spaces[space_id].rx_packet + 1);

        if packet.header.is_1rtt() && packet.header.key_phase() != self.key_phase {
            if let Some(prev) = &self.prev_crypto {
                if prev.end_packet.map_or(true, |(pn, _)| number < pn) {
                    // Straggler from the previous key phase
                    prev.crypto
                        .remote
                        .decrypt(number, &packet.header_data, &mut packet.payload)
                        .map_err(|_| None)?;
                    return Ok(number);
                }
            }
            // This may be the start of a peer-initiated key update
            let next = self.next_crypto.as_ref().ok_or(None)?;
            next.remote
                .decrypt(number, &packet.header_data, &mut packet.payload)
                .map_err(|_| None)?;
            if let Some(prev) = &self.prev_crypto {
                if prev.update_unacked {
                    // The peer started another update before we could acknowledge the last one
                    return Err(Some(TransportError::KEY_UPDATE_ERROR("")));
                }
            }
            trace!("key update authenticated");
            self.update_keys(Some((number, now)), true);
            self.set_key_discard_timer(now);
            return Ok(number);
        }

        let keys = self.spaces[space_id].crypto.as_ref().unwrap();
        keys.packet
            .remote
            .decrypt(number, &packet.header_data, &mut packet.payload)
            .map_err(|_| None)?;
        Ok(number)
    }

    fn update_keys(&mut self, end_packet: Option<(u64, Instant)>, remote_initiated: bool) {
        trace!("executing key update");
        // Generate keys for the key phase after the one we're switching to, store the current
        // key phase's keys in `prev_crypto`
        let new = self
            .next_crypto
            .take()
            .unwrap_or_else(|| unreachable!("updates are only possible with 1-RTT keys"));
        self.key_phase = !self.key_phase;
        let old = mem::replace(
            &mut self.spaces[SpaceId::Data]
                .crypto
                .as_mut()
                .unwrap()
                .packet,
            new,
        );
        self.spaces[SpaceId::Data].sent_with_keys = 0;
        self.key_phase_start = self.spaces[SpaceId::Data].next_packet_number;
        self.key_phase_acked = false;
        self.prev_crypto = Some(PrevCrypto {
            crypto: old,
            end_packet,
            update_unacked: remote_initiated,
        });
        self.next_crypto = self.crypto.next_1rtt_keys();
    }

    pub(super) fn force_key_update(&mut self) {
        if self.prev_crypto.is_some() || !self.key_phase_acked {
            // An update is already in progress, or the peer hasn't yet acknowledged a packet
            // from the current phase
            return;
        }
        debug!("initiating key update");
        self.update_keys(None, false);
    }

    fn set_key_discard_timer(&mut self, now: Instant) {
        self.timers
            .set(Timer::KeyDiscard, now + 3 * self.pto(SpaceId::Data));
    }

    fn discard_space(&mut self, now: Instant, space_id: SpaceId) {
        debug_assert!(space_id != SpaceId::Data);
        trace!("discarding {space_id:?} keys");
        if space_id == SpaceId::Initial {
            // No longer needed
            self.retry_token = Bytes::new();
        }
        let space = &mut self.spaces[space_id];
        space.crypto = None;
        space.time_of_last_ack_eliciting_packet = None;
        space.loss_time = None;
        space.loss_probes = 0;
        let sent_packets = mem::take(&mut space.sent_packets);
        for (pn, packet) in sent_packets {
            self.remove_in_flight(pn, &packet);
        }
        self.set_loss_detection_timer(now)
    }

    /// Update counters to account for a packet no longer being in flight
    fn remove_in_flight(&mut self, pn: u64, packet: &SentPacket) -> bool {
        if self.path.remove_in_flight(pn, packet) {
            return true;
        }
        if let Some(prev) = &mut self.prev_path {
            return prev.remove_in_flight(pn, packet);
        }
        false
    }

    fn stateless_reset_detected(&self, packet: &Packet) -> bool {
        if !packet.header.is_1rtt() {
            return false;
        }
        let token = match self.peer_reset_token {
            Some(x) => x,
            None => return false,
        };
        if packet.payload.len() < RESET_TOKEN_SIZE {
            return false;
        }
        let mut tail = [0; RESET_TOKEN_SIZE];
        tail.copy_from_slice(&packet.payload[packet.payload.len() - RESET_TOKEN_SIZE..]);
        ResetToken::from(tail) == token
    }

    fn migrate(&mut self, now: Instant, remote: SocketAddr) {
        let kind = MigrationType::classify(self.path.remote, remote);
        trace!(%remote, ?kind, "migration initiated");
        // Only one validation may be outstanding; anything in flight is reported failed
        // before the migration's own challenge is created
        if let Some(validator) = self.path_validator.take() {
            debug!(remote = %validator.remote, "abandoning path validation");
            self.events.push_back(Event::PathValidationFailed {
                reason: validator.reason,
            });
        }
        // A NAT rebinding doesn't change the underlying network path, so its congestion and RTT
        // state carries over; anything else starts from scratch
        let mut new_path = match kind {
            MigrationType::RebindPort => PathData::from_previous(remote, &self.path),
            _ => PathData::new(remote, now, &self.config),
        };
        new_path.validated = false;
        let old_path = mem::replace(&mut self.path, new_path);
        self.prev_path = Some(old_path);
        self.events.push_back(Event::Migrated { remote, kind });

        let timeout = self.path_validation_timeout();
        self.path_validator = Some(PathValidator::new(
            remote,
            PathValidationReason::Migration,
            timeout,
            self.config.path_validation_retries,
            &mut self.rng,
        ));
    }

    /// Switch to a previously unused remote connection ID, if possible
    fn update_rem_cid(&mut self) {
        let (reset_token, retired) = match self.rem_cids.next() {
            Some(x) => x,
            None => return,
        };
        // Retire the current remote CID and any CIDs we had to skip
        self.spaces[SpaceId::Data]
            .pending
            .retire_cids
            .extend(retired);
        self.set_reset_token(reset_token);
    }

    fn on_path_validation_timeout(&mut self) {
        let Some(validator) = &mut self.path_validator else {
            return;
        };
        if validator.on_timeout(&mut self.rng) {
            // A fresh challenge goes out with the next transmit
            trace!(remote = %validator.remote, "retrying path validation");
            return;
        }
        let validator = self.path_validator.take().unwrap();
        debug!(remote = %validator.remote, "path validation failed");
        self.events.push_back(Event::PathValidationFailed {
            reason: validator.reason,
        });
        if matches!(validator.reason, PathValidationReason::Migration) {
            if let Some(prev) = self.prev_path.take() {
                // Fall back to the last known-good path
                let remote = prev.remote;
                debug!(%remote, "reverting to previous path");
                self.path = prev;
                if !self.path.validated {
                    let timeout = self.path_validation_timeout();
                    self.path_validator = Some(PathValidator::new(
                        remote,
                        PathValidationReason::Reversion,
                        timeout,
                        self.config.path_validation_retries,
                        &mut self.rng,
                    ));
                }
            }
        }
    }

    fn on_peer_close(&mut self, now: Instant, reason: Close) {
        trace!("peer closed the connection");
        let error = ConnectionError::from(reason);
        self.error = Some(error.clone());
        self.events.push_back(Event::ConnectionLost { reason: error });
        self.close_common();
        self.set_close_timer(now);
        self.state = State::Draining;
    }

    fn on_transport_error(&mut self, now: Instant, err: TransportError) {
        debug!("transport error: {err}");
        let reason = Close::from(err.clone());
        let error = ConnectionError::from(err);
        self.error = Some(error.clone());
        self.events.push_back(Event::ConnectionLost { reason: error });
        self.close_common();
        self.set_close_timer(now);
        self.close = true;
        self.state = State::Closed(reason);
    }

    pub(super) fn close_inner(&mut self, now: Instant, reason: Close) {
        if self.state.is_closed() {
            return;
        }
        self.error = Some(ConnectionError::LocallyClosed);
        self.close_common();
        self.set_close_timer(now);
        self.close = true;
        self.state = State::Closed(reason);
    }

    pub(super) fn kill(&mut self, reason: ConnectionError) {
        if self.state.is_closed() {
            return;
        }
        debug!("connection terminated: {reason}");
        self.error = Some(reason.clone());
        self.events.push_back(Event::ConnectionLost { reason });
        self.state = State::Drained;
        self.endpoint_events.push_back(EndpointEvent::Drained);
        self.close_common();
    }

    fn close_common(&mut self) {
        trace!("connection closed");
        for &timer in &Timer::VALUES {
            self.timers.stop(timer);
        }
    }

    fn set_close_timer(&mut self, now: Instant) {
        self.timers
            .set(Timer::Close, now + 3 * self.pto(self.highest_space));
    }

    pub(super) fn reset_idle_timeout(&mut self, now: Instant, space: SpaceId) {
        let timeout = match self.idle_timeout {
            None => return,
            Some(dt) => dt,
        };
        if self.state.is_closed() {
            return;
        }
        let dt = cmp::max(timeout, 3 * self.pto(space));
        self.timers.set(Timer::Idle, now + dt);
    }

    pub(super) fn reset_keep_alive(&mut self, now: Instant) {
        let interval = match self.config.keep_alive_interval {
            Some(x) if self.state.is_established() => x,
            _ => return,
        };
        self.timers.set(Timer::KeepAlive, now + interval);
    }
}

impl Connection {
    /// Returns the next datagram to transmit, if any
    ///
    /// Datagrams handed back through [`Connection::requeue_transmit`] are returned first, in
    /// order. Assumes the datagram is sent immediately: the time until transmission should next
    /// be attempted is signalled through [`Connection::poll_timeout`].
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if let Some(transmit) = self.queued_transmits.pop_front() {
            return Some(transmit);
        }
        match self.state {
            State::Draining | State::Drained => return None,
            _ => {}
        }

        // If a probe is pending, ensure there's something to put in it
        for space in SpaceId::iter() {
            let request_immediate_ack =
                space == SpaceId::Data && self.peer_supports_ack_frequency();
            self.spaces[space].maybe_queue_probe(request_immediate_ack);
        }

        // Check the sent-packet limit before allocating any packet numbers
        for space in SpaceId::iter() {
            if self.spaces[space].sent_packets.len() >= self.config.max_tracked_sent_packets {
                self.kill(
                    TransportError::INTERNAL_ERROR("too many sent packets pending acknowledgement")
                        .into(),
                );
                return None;
            }
        }

        let buffer_capacity = self.path.current_mtu() as usize;

        // Limit transmission until the peer's address is validated
        if self
            .path
            .anti_amplification_blocked(self.config.anti_amplification_factor, 1)
        {
            trace!("blocked by anti-amplification");
            return None;
        }

        if let State::Closed(_) = self.state {
            if !mem::replace(&mut self.close, false) {
                return None;
            }
            return self.send_close(now, buffer_capacity);
        }

        // An outstanding path challenge rides alone in a datagram addressed to the path under
        // scrutiny
        if self.spaces[SpaceId::Data].crypto.is_some() {
            let pending_challenge = self
                .path_validator
                .as_ref()
                .filter(|v| v.is_pending())
                .map(|v| (v.remote, v.challenge()));
            if let Some((remote, token)) = pending_challenge {
                let mut buf = Vec::with_capacity(buffer_capacity);
                let dst_cid = self.rem_cids.active();
                let mut builder = PacketBuilder::new(
                    now,
                    SpaceId::Data,
                    dst_cid,
                    &mut buf,
                    buffer_capacity,
                    0,
                    true,
                    self,
                )?;
                trace!(token, "PATH_CHALLENGE");
                buf.write(FrameType::PATH_CHALLENGE);
                buf.write(token);
                self.stats.frame_tx.path_challenge += 1;
                // Probe datagrams are expanded to the minimum MTU, except when the
                // amplification budget of an unvalidated path cannot cover that much
                if !self.path.anti_amplification_blocked(
                    self.config.anti_amplification_factor,
                    MIN_INITIAL_SIZE as u64,
                ) {
                    builder.pad_to(MIN_INITIAL_SIZE as u16);
                }
                builder.finish_and_track(now, self, Some(SentFrames::default()), &mut buf);
                if let Some(validator) = &mut self.path_validator {
                    let deadline = validator.challenge_sent(now);
                    self.timers.set(Timer::PathValidation, deadline);
                }
                self.stats.udp_tx.on_datagram(buf.len() as u64);
                if remote == self.path.remote {
                    self.path.total_sent = self.path.total_sent.saturating_add(buf.len() as u64);
                }
                return Some(Transmit {
                    destination: remote,
                    ecn: self.path.sending_ecn.then_some(EcnCodepoint::Ect0),
                    contents: buf.into(),
                });
            }

            // Answer a challenge received on an address other than the active path
            if let Some((token, remote)) = self.path_responses.pop_off_path(self.path.remote) {
                let mut buf = Vec::with_capacity(buffer_capacity);
                let dst_cid = self.rem_cids.active();
                let mut builder = PacketBuilder::new(
                    now,
                    SpaceId::Data,
                    dst_cid,
                    &mut buf,
                    buffer_capacity,
                    0,
                    true,
                    self,
                )?;
                trace!(token, "PATH_RESPONSE (off-path)");
                buf.write(FrameType::PATH_RESPONSE);
                buf.write(token);
                self.stats.frame_tx.path_response += 1;
                if !self.path.anti_amplification_blocked(
                    self.config.anti_amplification_factor,
                    MIN_INITIAL_SIZE as u64,
                ) {
                    builder.pad_to(MIN_INITIAL_SIZE as u16);
                }
                builder.finish_and_track(now, self, Some(SentFrames::default()), &mut buf);
                self.stats.udp_tx.on_datagram(buf.len() as u64);
                return Some(Transmit {
                    destination: remote,
                    ecn: self.path.sending_ecn.then_some(EcnCodepoint::Ect0),
                    contents: buf.into(),
                });
            }
        }

        let mut buf = Vec::with_capacity(buffer_capacity);
        let mut pending: Option<(PacketBuilder, SentFrames)> = None;
        let mut pad_datagram = false;
        let congestion_blocked = self.path.in_flight.bytes + u64::from(self.path.current_mtu())
            >= self.path.congestion.window();

        for space_id in SpaceId::iter() {
            if self.spaces[space_id].crypto.is_none() {
                continue;
            }

            let path_response = match space_id {
                SpaceId::Data => self.path_responses.pop_on_path(self.path.remote),
                _ => None,
            };
            let sending_probe = self.spaces[space_id].loss_probes != 0;
            // Probes are exempt from congestion control to avoid deadlock when the window is
            // filled by lost tail packets
            let permit_other = sending_probe || !congestion_blocked;
            let can_send = self.spaces[space_id].can_send();
            let sendable = can_send.acks
                || sending_probe
                || path_response.is_some()
                || (permit_other && can_send.other);
            if !sendable {
                continue;
            }

            if sending_probe {
                self.spaces[space_id].loss_probes -= 1;
            }
            // We're committed to sending from this space; piggyback any lazy ACKs
            if sending_probe || path_response.is_some() || (permit_other && can_send.other) {
                self.spaces[space_id].pending_acks.maybe_ack_non_eliciting();
            }

            // Finish the previous space's packet, coalescing it into the same datagram
            if let Some((prev_builder, prev_sent)) = pending.take() {
                prev_builder.finish_and_track(now, self, Some(prev_sent), &mut buf);
            }

            let ack_eliciting = sending_probe
                || path_response.is_some()
                || (permit_other
                    && (!self.spaces[space_id].pending.is_empty()
                        || self.spaces[space_id].ping_pending
                        || self.spaces[space_id].immediate_ack_pending));

            let dst_cid = self.rem_cids.active();
            let builder = PacketBuilder::new(
                now,
                space_id,
                dst_cid,
                &mut buf,
                buffer_capacity,
                0,
                ack_eliciting,
                self,
            )?;

            if space_id == SpaceId::Data {
                if let Some(prev) = &mut self.prev_crypto {
                    // This packet is protected by the new phase, so the peer is free to
                    // initiate the next update as soon as it has seen it
                    prev.update_unacked = false;
                }
            }

            if space_id == SpaceId::Data
                && ack_eliciting
                && self
                    .prev_crypto
                    .as_ref()
                    .is_some_and(|x| x.end_packet.is_none())
            {
                // The first ack-eliciting packet of the new phase: an ACK at or above its number
                // confirms the peer caught up, and the old keys expire shortly after
                let pto = 3 * self.pto(SpaceId::Data);
                if let Some(prev) = self.prev_crypto.as_mut() {
                    prev.end_packet = Some((builder.exact_number, now));
                }
                self.timers.set(Timer::KeyDiscard, now + pto);
            }

            let sent = self.populate_packet(
                now,
                space_id,
                &mut buf,
                builder.max_size,
                permit_other,
                path_response,
            );
            pad_datagram |=
                space_id == SpaceId::Initial && (self.side.is_client() || ack_eliciting);
            pending = Some((builder, sent));
        }

        let (mut builder, sent) = pending?;
        if pad_datagram {
            builder.pad_to(MIN_INITIAL_SIZE as u16);
        }
        let last_packet_number = builder.exact_number;
        builder.finish_and_track(now, self, Some(sent), &mut buf);
        if buf.is_empty() {
            return None;
        }
        self.path
            .congestion
            .on_sent(now, buf.len() as u64, last_packet_number);
        self.stats.udp_tx.on_datagram(buf.len() as u64);
        self.path.total_sent = self.path.total_sent.saturating_add(buf.len() as u64);
        trace!(len = buf.len(), "sending datagram");
        Some(Transmit {
            destination: self.path.remote,
            ecn: self.path.sending_ecn.then_some(EcnCodepoint::Ect0),
            contents: buf.into(),
        })
    }

    /// Announce the connection close at every encryption level the peer might be reading
    fn send_close(&mut self, now: Instant, buffer_capacity: usize) -> Option<Transmit> {
        let reason = match &self.state {
            State::Closed(reason) => reason.clone(),
            _ => return None,
        };
        // Until handshake keys are discarded we can't know which levels the peer can read, so
        // the close is repeated at every level we can still write
        let close_spaces: Vec<SpaceId> = SpaceId::iter()
            .filter(|&s| self.spaces[s].crypto.is_some())
            .collect();

        let mut buf = Vec::with_capacity(buffer_capacity);
        let mut pending: Option<PacketBuilder> = None;
        let mut pad_datagram = false;
        for space_id in close_spaces {
            if let Some(prev_builder) = pending.take() {
                let _ = prev_builder.finish(self, &mut buf);
            }
            let dst_cid = self.rem_cids.active();
            let builder = PacketBuilder::new(
                now,
                space_id,
                dst_cid,
                &mut buf,
                buffer_capacity,
                0,
                false,
                self,
            )?;
            let max_len = builder.frame_space_remaining(&buf);
            reason.encode(&mut buf, max_len);
            self.stats.frame_tx.connection_close += 1;
            pad_datagram |= space_id == SpaceId::Initial;
            pending = Some(builder);
        }
        let mut builder = pending?;
        if pad_datagram {
            builder.pad_to(MIN_INITIAL_SIZE as u16);
        }
        let _ = builder.finish(self, &mut buf);
        if buf.is_empty() {
            return None;
        }
        self.stats.udp_tx.on_datagram(buf.len() as u64);
        self.path.total_sent = self.path.total_sent.saturating_add(buf.len() as u64);
        Some(Transmit {
            destination: self.path.remote,
            ecn: self.path.sending_ecn.then_some(EcnCodepoint::Ect0),
            contents: buf.into(),
        })
    }

    fn populate_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        max_size: usize,
        permit_other: bool,
        path_response: Option<u64>,
    ) -> SentFrames {
        let mut sent = SentFrames::default();
        let is_1rtt = space_id == SpaceId::Data;

        // ACK
        {
            let space = &mut self.spaces[space_id];
            if space.pending_acks.can_send() {
                debug_assert!(!space.pending_acks.ranges().is_empty());
                let counts = space.ecn_counters;
                let delay = space.pending_acks.ack_delay(now).as_micros() as u64
                    >> ACK_DELAY_EXPONENT;
                trace!("ACK");
                sent.largest_acked = space.pending_acks.ranges().max();
                frame::Ack::encode(
                    delay,
                    space.pending_acks.ranges(),
                    (counts != frame::EcnCounts::ZERO).then_some(&counts),
                    buf,
                );
                space.pending_acks.acks_sent();
                self.stats.frame_tx.acks += 1;
                self.timers.stop(Timer::MaxAckDelay);
            }
        }

        // PATH_RESPONSE, exempt from congestion control like the challenge that prompted it
        if let Some(token) = path_response {
            trace!(token, "PATH_RESPONSE");
            buf.write(FrameType::PATH_RESPONSE);
            buf.write(token);
            self.stats.frame_tx.path_response += 1;
        }

        if permit_other {
            let space = &mut self.spaces[space_id];

            // HANDSHAKE_DONE
            if mem::replace(&mut space.pending.handshake_done, false) {
                trace!("HANDSHAKE_DONE");
                buf.write(FrameType::HANDSHAKE_DONE);
                sent.retransmits.get_or_create().handshake_done = true;
                self.stats.frame_tx.handshake_done =
                    self.stats.frame_tx.handshake_done.saturating_add(1);
            }

            // PING
            if mem::replace(&mut space.ping_pending, false) {
                trace!("PING");
                buf.write(FrameType::PING);
                self.stats.frame_tx.ping += 1;
            }

            // IMMEDIATE_ACK
            if mem::replace(&mut space.immediate_ack_pending, false) {
                trace!("IMMEDIATE_ACK");
                buf.write(FrameType::IMMEDIATE_ACK);
                self.stats.frame_tx.immediate_ack += 1;
            }

            // CRYPTO
            while buf.len() + frame::Crypto::SIZE_BOUND < max_size {
                let mut frame = match space.pending.crypto.pop_front() {
                    Some(x) => x,
                    None => break,
                };
                let max_crypto_data_size = max_size - buf.len() - frame::Crypto::SIZE_BOUND;
                let len = cmp::min(frame.data.len(), max_crypto_data_size);
                let data = frame.data.split_to(len);
                let truncated = frame::Crypto {
                    offset: frame.offset,
                    data,
                };
                trace!(
                    offset = truncated.offset,
                    len = truncated.data.len(),
                    "CRYPTO",
                );
                truncated.encode(buf);
                self.stats.frame_tx.crypto += 1;
                sent.retransmits.get_or_create().crypto.push_back(truncated);
                if !frame.data.is_empty() {
                    // The rest goes in a later packet
                    frame.offset += len as u64;
                    space.pending.crypto.push_front(frame);
                    break;
                }
            }

            if is_1rtt {
                // NEW_CONNECTION_ID
                const NEW_CID_SIZE_BOUND: usize =
                    1 + 8 + 8 + 1 + MAX_CID_SIZE + RESET_TOKEN_SIZE;
                while buf.len() + NEW_CID_SIZE_BOUND < max_size {
                    let issued = match space.pending.new_cids.pop() {
                        Some(x) => x,
                        None => break,
                    };
                    trace!(sequence = issued.sequence, id = %issued.id, "NEW_CONNECTION_ID");
                    frame::NewConnectionId {
                        sequence: issued.sequence,
                        retire_prior_to: self.local_cid_state.retire_prior_to(),
                        id: issued.id,
                        reset_token: issued.reset_token,
                    }
                    .encode(buf);
                    sent.retransmits.get_or_create().new_cids.push(issued);
                    self.stats.frame_tx.new_connection_id += 1;
                }

                // RETIRE_CONNECTION_ID
                while buf.len() + frame::RETIRE_CONNECTION_ID_SIZE_BOUND < max_size {
                    let sequence = match space.pending.retire_cids.pop() {
                        Some(x) => x,
                        None => break,
                    };
                    trace!(sequence, "RETIRE_CONNECTION_ID");
                    buf.write(FrameType::RETIRE_CONNECTION_ID);
                    buf.write_var(sequence);
                    sent.retransmits.get_or_create().retire_cids.push(sequence);
                    self.stats.frame_tx.retire_connection_id += 1;
                }

                // ACK_FREQUENCY
                if space.pending.ack_frequency && buf.len() + ACK_FREQUENCY_SIZE_BOUND < max_size {
                    space.pending.ack_frequency = false;
                    let sequence = self.ack_frequency_sequence;
                    self.ack_frequency_sequence += 1;
                    trace!(sequence, "ACK_FREQUENCY");
                    frame::AckFrequency {
                        sequence: VarInt(sequence),
                        ack_eliciting_threshold: self.config.ack_eliciting_threshold,
                        request_max_ack_delay: VarInt(
                            self.config.max_ack_delay.as_micros() as u64
                        ),
                        reordering_threshold: self.config.reordering_threshold,
                    }
                    .encode(buf);
                    sent.retransmits.get_or_create().ack_frequency = true;
                    self.stats.frame_tx.ack_frequency += 1;
                }

                // NEW_TOKEN
                while let Some(remote) = space.pending.new_tokens.pop() {
                    if remote != self.path.remote {
                        // Tokens are bound to the client's address; any queued for an old path
                        // are useless now
                        continue;
                    }
                    let mut token_bytes = [0; NEW_TOKEN_SIZE];
                    self.rng.fill_bytes(&mut token_bytes);
                    let token = frame::NewToken {
                        token: Bytes::copy_from_slice(&token_bytes),
                    };
                    if buf.len() + token.size() >= max_size {
                        space.pending.new_tokens.push(remote);
                        break;
                    }
                    trace!("NEW_TOKEN");
                    token.encode(buf);
                    sent.retransmits.get_or_create().new_tokens.push(remote);
                    self.stats.frame_tx.new_token += 1;
                }
            }
        }

        sent
    }
}

#[cfg(test)]
impl Connection {
    pub(crate) fn initiate_key_update(&mut self) {
        self.force_key_update();
    }

    pub(crate) fn set_key_phase_size(&mut self, size: u64) {
        self.key_phase_size = size;
    }
}

/// Bytes a worst-case ACK_FREQUENCY frame occupies: the type plus four varints
const ACK_FREQUENCY_SIZE_BOUND: usize = 2 + 4 * 8;

/// Size of the tokens minted for NEW_TOKEN frames
const NEW_TOKEN_SIZE: usize = 32;

struct PrevCrypto {
    /// The keys used for the previous key phase, temporarily retained
    crypto: KeyPair<Box<dyn PacketKey>>,
    /// The incoming packet that ends the interval for which these keys are applicable, and the
    /// time of its receipt
    ///
    /// Incoming packets should be decrypted using these keys iff this is `None` or their packet
    /// number is lower. `None` indicates that we have not yet received a packet using newer keys,
    /// which implies that the update was locally initiated.
    end_packet: Option<(u64, Instant)>,
    /// Whether the following key phase is from a remotely initiated update that we haven't acked
    update_unacked: bool,
}

/// The frames retained for retransmission from a single outgoing packet
#[derive(Default)]
pub(super) struct SentFrames {
    pub(super) retransmits: ThinRetransmits,
    pub(super) largest_acked: Option<u64>,
}

#[allow(clippy::large_enum_variant)]
enum State {
    Handshake,
    Established,
    /// Closed locally; the reason is retransmitted until the peer confirms or time runs out
    Closed(Close),
    /// The peer closed; we linger briefly in case its close announcement needs re-acknowledging
    Draining,
    Drained,
}

impl State {
    fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Draining | Self::Drained)
    }

    fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }
}

/// Things of interest that a connection reports to its driving application
#[derive(Debug)]
pub enum Event {
    /// The connection's handshake completed
    Connected,
    /// The connection was lost
    ///
    /// Emitted when the peer closes the connection or a fatal error is encountered.
    ConnectionLost {
        /// Why the connection was closed
        reason: ConnectionError,
    },
    /// Stream data arrived from the peer
    Stream(frame::Stream),
    /// The server granted a token for skipping address validation on future connections
    NewToken {
        /// The opaque token
        token: Bytes,
    },
    /// Packet flow switched to a new remote address
    Migrated {
        /// The address the connection now sends to
        remote: SocketAddr,
        /// Classification of the address change
        kind: MigrationType,
    },
    /// A reachability check of a network path concluded successfully
    PathValidated {
        /// Why the path was being checked
        reason: PathValidationReason,
    },
    /// A reachability check exhausted its retries without an answer
    PathValidationFailed {
        /// Why the path was being checked
        reason: PathValidationReason,
    },
    /// Consecutive probe timeouts suggest the network path may have failed
    PathDegrading,
    /// Acknowledgements resumed on a path previously reported as degrading
    PathRecovered,
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("aborted by peer: {0}")]
    ConnectionClosed(frame::ConnectionClose),
    /// The peer closed the connection
    #[error("closed by peer: {0}")]
    ApplicationClosed(frame::ApplicationClose),
    /// The peer is unable to continue processing this connection, usually due to having restarted
    #[error("reset by peer")]
    Reset,
    /// Communication with the peer has lapsed for longer than the negotiated idle timeout
    #[error("timed out")]
    TimedOut,
    /// The peer failed to respond to repeated probes
    #[error("unresponsive peer")]
    TooManyPtos,
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
}

impl From<Close> for ConnectionError {
    fn from(x: Close) -> Self {
        match x {
            Close::Connection(reason) => Self::ConnectionClosed(reason),
            Close::Application(reason) => Self::ApplicationClosed(reason),
        }
    }
}

/// Classification of a peer address change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationType {
    /// Same IP address, different port, typical of NAT rebinding
    RebindPort,
    /// A different IP address within the same /24 (IPv4) or /64 (IPv6)
    SubnetChange,
    /// A different IP address further afield
    IpChange,
    /// A switch between IPv4 and IPv6
    FamilyChange,
}

impl MigrationType {
    fn classify(old: SocketAddr, new: SocketAddr) -> Self {
        match (old.ip(), new.ip()) {
            (a, b) if a == b => Self::RebindPort,
            (IpAddr::V4(a), IpAddr::V4(b)) => match a.octets()[..3] == b.octets()[..3] {
                true => Self::SubnetChange,
                false => Self::IpChange,
            },
            (IpAddr::V6(a), IpAddr::V6(b)) => match a.octets()[..8] == b.octets()[..8] {
                true => Self::SubnetChange,
                false => Self::IpChange,
            },
            _ => Self::FamilyChange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::from(ip), port))
    }

    #[test]
    fn migration_classification() {
        let base = addr([192, 0, 2, 1], 4433);
        assert_eq!(
            MigrationType::classify(base, addr([192, 0, 2, 1], 9000)),
            MigrationType::RebindPort
        );
        assert_eq!(
            MigrationType::classify(base, addr([192, 0, 2, 99], 4433)),
            MigrationType::SubnetChange
        );
        assert_eq!(
            MigrationType::classify(base, addr([203, 0, 113, 1], 4433)),
            MigrationType::IpChange
        );
        assert_eq!(
            MigrationType::classify(base, "[2001:db8::1]:4433".parse().unwrap()),
            MigrationType::FamilyChange
        );
    }
}
