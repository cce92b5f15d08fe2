use std::{
    cmp,
    collections::VecDeque,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{info_span, trace};

use crate::{
    crypto::{testing, TransportParameters},
    Connection, ConnectionEvent, ConnectionId, EndpointEvent, Event, IssuedCid, ResetToken, Side,
    TransportConfig, Transmit, VarInt,
};

pub(super) const CID_LEN: usize = 8;
/// Stateless reset token the server advertises in its transport parameters
pub(super) const RESET_TOKEN: [u8; 16] = [0xaa; 16];

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

pub(super) fn config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.deterministic_packet_numbers = true;
    config
}

pub(super) fn client_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(198, 51, 100, 1), 44_000))
}

pub(super) fn server_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 4433))
}

fn params(initial_src_cid: ConnectionId) -> TransportParameters {
    TransportParameters {
        max_idle_timeout: VarInt(30_000),
        active_connection_id_limit: VarInt(TransportParameters::MAX_ACTIVE_CID_LIMIT),
        initial_src_cid: Some(initial_src_cid),
        ..TransportParameters::default()
    }
}

/// A client and server connection joined by a simulated network
///
/// Datagrams cross the network with a fixed one-way latency, and either
/// direction can be severed to model an outage.
pub(super) struct Pair {
    pub(super) time: Instant,
    latency: Duration,
    pub(super) client: TestEndpoint,
    pub(super) server: TestEndpoint,
    /// Drop all datagrams heading to the client
    pub(super) drop_to_client: bool,
    /// Drop all datagrams heading to the server
    pub(super) drop_to_server: bool,
}

impl Pair {
    pub(super) fn new(client_config: TransportConfig, server_config: TransportConfig) -> Self {
        Self::new_ext(client_config, server_config, None)
    }

    /// Like [`Pair::new`], but the client may advertise `min_ack_delay` to
    /// negotiate the ACK frequency extension
    pub(super) fn new_ext(
        client_config: TransportConfig,
        server_config: TransportConfig,
        client_min_ack_delay: Option<VarInt>,
    ) -> Self {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(0x0ddb_a11);
        let client_cid = ConnectionId::random(&mut rng, CID_LEN);
        let server_cid = ConnectionId::random(&mut rng, CID_LEN);
        // The CID the client addresses its first flight to, before the server's choice arrives
        let initial_dst = ConnectionId::random(&mut rng, CID_LEN);

        let mut client_params = params(client_cid);
        client_params.min_ack_delay = client_min_ack_delay;
        let mut server_params = params(server_cid);
        server_params.stateless_reset_token = Some(RESET_TOKEN.into());

        let client = Connection::new(
            Arc::new(client_config),
            Box::new(testing::client_session(client_params)),
            Side::Client,
            server_addr(),
            client_cid,
            initial_dst,
            now,
        );
        let server = Connection::new(
            Arc::new(server_config),
            Box::new(testing::server_session(server_params)),
            Side::Server,
            client_addr(),
            server_cid,
            client_cid,
            now,
        );
        Self {
            time: now,
            latency: Duration::from_millis(10),
            client: TestEndpoint::new(client, client_addr(), "client", 1),
            server: TestEndpoint::new(server, server_addr(), "server", 2),
            drop_to_client: false,
            drop_to_server: false,
        }
    }

    /// Run the handshake to completion on both sides
    pub(super) fn connect(&mut self) {
        self.drive_for(Duration::from_secs(1));
        assert!(!self.client.conn.is_handshaking());
        assert!(!self.server.conn.is_handshaking());
        assert!(self.client.saw(|e| matches!(e, Event::Connected)));
        assert!(self.server.saw(|e| matches!(e, Event::Connected)));
    }

    /// Run until neither connection can make further progress
    pub(super) fn drive(&mut self) {
        for _ in 0..100_000 {
            if !self.step(None) {
                return;
            }
        }
        panic!("simulation failed to go idle");
    }

    /// Run for `duration` of simulated time
    pub(super) fn drive_for(&mut self, duration: Duration) {
        let deadline = self.time + duration;
        for _ in 0..100_000 {
            if !self.step(Some(deadline)) {
                self.time = deadline;
                return;
            }
        }
        panic!("simulation failed to reach its deadline");
    }

    /// Exchange timeouts, events, transmissions, and deliveries once
    ///
    /// Returns whether anything happened; when nothing did, time is advanced to the next
    /// instant of interest, or `false` is returned if there is none before `deadline`.
    fn step(&mut self, deadline: Option<Instant>) -> bool {
        let now = self.time;
        self.client.handle_timeout(now);
        self.server.handle_timeout(now);
        self.client.service(now);
        self.server.service(now);

        let mut progress = false;
        while let Some(transmit) = self.client.poll_transmit(now) {
            progress = true;
            self.client.udp_bytes_sent += transmit.contents.len() as u64;
            if !self.drop_to_server && transmit.destination == self.server.addr {
                self.server
                    .inbound
                    .push_back((now + self.latency, self.client.addr, transmit));
            }
        }
        while let Some(transmit) = self.server.poll_transmit(now) {
            progress = true;
            self.server.udp_bytes_sent += transmit.contents.len() as u64;
            if !self.drop_to_client && transmit.destination == self.client.addr {
                self.client
                    .inbound
                    .push_back((now + self.latency, self.server.addr, transmit));
            }
        }
        self.client.service(now);
        self.server.service(now);

        progress |= self.client.deliver_due(now);
        progress |= self.server.deliver_due(now);
        if progress {
            return true;
        }

        let next = [
            self.client.conn.poll_timeout(),
            self.server.conn.poll_timeout(),
            self.client.next_arrival(),
            self.server.next_arrival(),
        ]
        .into_iter()
        .flatten()
        .min();
        let Some(next) = next else {
            return false;
        };
        if let Some(deadline) = deadline {
            if next >= deadline {
                self.time = deadline;
                return false;
            }
        }
        self.time = cmp::max(self.time, next);
        true
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new(config(), config())
    }
}

/// One [`Connection`] plus the endpoint duties the connection delegates upward:
/// issuing connection IDs, recording retirements, and moving datagrams.
pub(super) struct TestEndpoint {
    pub(super) conn: Connection,
    pub(super) addr: SocketAddr,
    /// In-flight datagrams headed here, in arrival order
    inbound: VecDeque<(Instant, SocketAddr, Transmit)>,
    next_cid_seq: u64,
    rng: StdRng,
    /// Application events drained from the connection, oldest first
    pub(super) events: Vec<Event>,
    /// Sequence numbers of local CIDs the peer has retired
    pub(super) retired: Vec<u64>,
    pub(super) drained: bool,
    /// Bytes handed to the simulated network, dropped or not
    pub(super) udp_bytes_sent: u64,
    span: tracing::Span,
}

impl TestEndpoint {
    fn new(conn: Connection, addr: SocketAddr, name: &'static str, seed: u64) -> Self {
        Self {
            conn,
            addr,
            inbound: VecDeque::new(),
            // Sequence 0 was issued at connection setup
            next_cid_seq: 1,
            rng: StdRng::seed_from_u64(seed),
            events: Vec::new(),
            retired: Vec::new(),
            drained: false,
            udp_bytes_sent: 0,
            span: info_span!("peer", side = name),
        }
    }

    fn handle_timeout(&mut self, now: Instant) {
        let _guard = self.span.enter();
        self.conn.handle_timeout(now);
    }

    fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        let _guard = self.span.enter();
        self.conn.poll_transmit(now)
    }

    /// Drain connection-generated events, answering identifier requests inline
    pub(super) fn service(&mut self, now: Instant) {
        let _guard = self.span.enter();
        while let Some(event) = self.conn.poll_endpoint_events() {
            match event {
                EndpointEvent::NeedIdentifiers(n) => {
                    let ids = (0..n)
                        .map(|_| {
                            let sequence = self.next_cid_seq;
                            self.next_cid_seq += 1;
                            IssuedCid {
                                sequence,
                                id: ConnectionId::random(&mut self.rng, CID_LEN),
                                reset_token: ResetToken::random(&mut self.rng),
                            }
                        })
                        .collect();
                    self.conn
                        .handle_event(ConnectionEvent::new_identifiers(ids, now));
                }
                EndpointEvent::RetireConnectionId(sequence) => self.retired.push(sequence),
                EndpointEvent::ResetToken(_, _) => {}
                EndpointEvent::Drained => self.drained = true,
            }
        }
        while let Some(event) = self.conn.poll() {
            trace!("event: {event:?}");
            self.events.push(event);
        }
    }

    fn next_arrival(&self) -> Option<Instant> {
        self.inbound.front().map(|&(arrival, _, _)| arrival)
    }

    fn deliver_due(&mut self, now: Instant) -> bool {
        let _guard = self.span.enter();
        let mut progress = false;
        while self
            .inbound
            .front()
            .is_some_and(|&(arrival, _, _)| arrival <= now)
        {
            let (_, source, transmit) = self.inbound.pop_front().unwrap();
            self.conn.handle_event(ConnectionEvent::datagram(
                now,
                source,
                transmit.ecn,
                BytesMut::from(&transmit.contents[..]),
            ));
            progress = true;
        }
        progress
    }

    /// Whether any recorded application event matches `f`
    pub(super) fn saw(&self, f: impl Fn(&Event) -> bool) -> bool {
        self.events.iter().any(f)
    }
}
