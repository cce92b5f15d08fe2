use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use rand::{rngs::StdRng, RngCore, SeedableRng};

use super::*;

mod util;
use util::*;

#[test]
fn handshake_completes() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    // The server granted an address validation token once established
    assert!(pair.client.saw(|e| matches!(e, Event::NewToken { .. })));
    assert!(pair.client.conn.stats().frame_rx.acks > 0);
    assert_eq!(pair.client.conn.remote_address(), pair.server.addr);
    // RTT converges on the simulated round trip
    assert!(pair.client.conn.rtt() >= Duration::from_millis(20));
    assert!(pair.client.conn.rtt() < Duration::from_millis(100));
}

#[test]
fn app_close_reaches_peer() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let now = pair.time;
    pair.client
        .conn
        .close(now, VarInt(42), Bytes::from_static(b"goodbye"));
    pair.drive();
    assert!(pair.server.saw(|e| matches!(
        e,
        Event::ConnectionLost {
            reason: ConnectionError::ApplicationClosed(close),
        } if close.error_code == VarInt(42) && close.reason[..] == *b"goodbye"
    )));
    assert!(pair.client.drained);
    assert!(pair.server.drained);
}

#[test]
fn idle_connections_time_out() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let start = pair.time;
    pair.drive();
    assert!(pair.client.saw(|e| matches!(
        e,
        Event::ConnectionLost {
            reason: ConnectionError::TimedOut,
        }
    )));
    assert!(pair.server.saw(|e| matches!(
        e,
        Event::ConnectionLost {
            reason: ConnectionError::TimedOut,
        }
    )));
    assert!(pair.client.drained);
    assert!(pair.server.drained);
    assert!(pair.time.duration_since(start) >= Duration::from_secs(29));
}

#[test]
fn keep_alive_defers_idle_timeout() {
    let _guard = subscribe();
    let mut client_config = config();
    client_config.keep_alive_interval(Some(Duration::from_secs(2)));
    let mut pair = Pair::new(client_config, config());
    pair.connect();
    pair.drive_for(Duration::from_secs(45));
    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
    assert!(pair.server.conn.stats().frame_rx.ping > 10);
}

#[test]
fn unresponsive_peer_aborts_after_max_probes() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.drop_to_server = true;
    pair.drop_to_client = true;
    pair.client.conn.ping();
    pair.drive();
    assert!(pair.client.saw(|e| matches!(e, Event::PathDegrading)));
    assert!(pair.client.saw(|e| matches!(
        e,
        Event::ConnectionLost {
            reason: ConnectionError::TooManyPtos,
        }
    )));
    assert!(pair.client.drained);
}

#[test]
fn path_degrades_and_recovers() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.drop_to_server = true;
    pair.client.conn.ping();
    pair.drive_for(Duration::from_secs(2));
    assert!(pair.client.saw(|e| matches!(e, Event::PathDegrading)));
    assert!(!pair.client.conn.is_closed());

    pair.drop_to_server = false;
    pair.drive_for(Duration::from_secs(5));
    assert!(pair.client.saw(|e| matches!(e, Event::PathRecovered)));
    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn nat_rebind_migrates_and_validates() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let new_port = pair.client.addr.port() + 1;
    pair.client.addr.set_port(new_port);
    pair.client.conn.ping();
    pair.drive_for(Duration::from_secs(3));
    assert!(pair.server.saw(|e| matches!(
        e,
        Event::Migrated {
            kind: MigrationType::RebindPort,
            remote,
        } if remote.port() == new_port
    )));
    assert!(pair.server.saw(|e| matches!(
        e,
        Event::PathValidated {
            reason: PathValidationReason::Migration,
        }
    )));
    assert_eq!(pair.server.conn.remote_address(), pair.client.addr);
    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn migration_fails_outstanding_probe() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let unreachable = SocketAddr::from((Ipv4Addr::new(203, 0, 113, 9), 443));
    pair.server.conn.probe_path(unreachable);
    let new_port = pair.client.addr.port() + 1;
    pair.client.addr.set_port(new_port);
    pair.client.conn.ping();
    pair.drive_for(Duration::from_secs(3));
    // The probe's failure is reported before the migration's validation concludes
    let failed = pair.server.events.iter().position(|e| {
        matches!(
            e,
            Event::PathValidationFailed {
                reason: PathValidationReason::Probe,
            }
        )
    });
    let validated = pair.server.events.iter().position(|e| {
        matches!(
            e,
            Event::PathValidated {
                reason: PathValidationReason::Migration,
            }
        )
    });
    assert!(failed.is_some());
    assert!(validated.is_some());
    assert!(failed < validated);
    assert_eq!(pair.server.conn.remote_address(), pair.client.addr);
}

#[test]
fn handshake_packets_do_not_trigger_migration() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let now = pair.time;
    let first = pair.client.conn.poll_transmit(now).unwrap();
    // The same first flight, claimed to originate elsewhere
    let spoofed = SocketAddr::from((Ipv4Addr::new(203, 0, 113, 77), 9999));
    pair.server.conn.handle_event(ConnectionEvent::datagram(
        now,
        spoofed,
        first.ecn,
        BytesMut::from(&first.contents[..]),
    ));
    pair.server.service(now);
    assert!(!pair.server.saw(|e| matches!(e, Event::Migrated { .. })));
    assert_eq!(pair.server.conn.remote_address(), pair.client.addr);
    assert!(pair.server.conn.is_handshaking());
}

#[test]
fn path_probe_succeeds() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.client.conn.probe_path(pair.server.addr);
    pair.drive_for(Duration::from_secs(2));
    assert!(pair.client.saw(|e| matches!(
        e,
        Event::PathValidated {
            reason: PathValidationReason::Probe,
        }
    )));
    // Probing never moves traffic off the active path
    assert_eq!(pair.client.conn.remote_address(), pair.server.addr);
}

#[test]
fn path_probe_fails_without_answer() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let unreachable = SocketAddr::from((Ipv4Addr::new(203, 0, 113, 9), 443));
    pair.client.conn.probe_path(unreachable);
    pair.drive_for(Duration::from_secs(5));
    assert!(pair.client.saw(|e| matches!(
        e,
        Event::PathValidationFailed {
            reason: PathValidationReason::Probe,
        }
    )));
    assert_eq!(pair.client.conn.remote_address(), pair.server.addr);
    assert!(!pair.client.conn.is_closed());
}

#[test]
fn key_update_survives_both_directions() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let before = pair.server.conn.stats().frame_rx.ping;
    pair.client.conn.initiate_key_update();
    pair.client.conn.ping();
    pair.drive_for(Duration::from_secs(1));
    assert!(pair.server.conn.stats().frame_rx.ping > before);

    let before = pair.client.conn.stats().frame_rx.ping;
    pair.server.conn.initiate_key_update();
    pair.server.conn.ping();
    pair.drive_for(Duration::from_secs(1));
    assert!(pair.client.conn.stats().frame_rx.ping > before);

    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn routine_key_updates_under_traffic() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let before = pair.server.conn.stats().frame_rx.ping;
    // Exhaust each phase after a single packet, forcing an update per flight
    pair.client.conn.set_key_phase_size(1);
    for _ in 0..8 {
        pair.client.conn.ping();
        pair.drive_for(Duration::from_millis(200));
    }
    assert!(pair.server.conn.stats().frame_rx.ping >= before + 8);
    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn repeated_key_updates_pace_on_acks() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    for _ in 0..4 {
        pair.client.conn.initiate_key_update();
        pair.client.conn.ping();
        pair.drive_for(Duration::from_millis(500));
    }
    // A peer that only ever sends ACKs must tolerate every update
    assert!(pair.server.conn.stats().frame_rx.ping >= 4);
    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn stateless_reset_from_token_holder() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let mut buf = vec![0u8; 64];
    let mut rng = StdRng::seed_from_u64(9);
    rng.fill_bytes(&mut buf);
    // Shaped like a short-header packet, authenticated only by its trailing token
    buf[0] = 0x40;
    let len = buf.len();
    buf[len - RESET_TOKEN.len()..].copy_from_slice(&RESET_TOKEN);
    let now = pair.time;
    pair.client.conn.handle_event(ConnectionEvent::datagram(
        now,
        pair.server.addr,
        None,
        BytesMut::from(&buf[..]),
    ));
    pair.client.service(now);
    assert!(pair.client.saw(|e| matches!(
        e,
        Event::ConnectionLost {
            reason: ConnectionError::Reset,
        }
    )));
    assert!(pair.client.drained);
}

#[test]
fn stateless_reset_after_close_is_ignored() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    let now = pair.time;
    pair.client.conn.close(now, VarInt(0), Bytes::new());
    let mut buf = vec![0u8; 64];
    let mut rng = StdRng::seed_from_u64(44);
    rng.fill_bytes(&mut buf);
    buf[0] = 0x40;
    let len = buf.len();
    buf[len - RESET_TOKEN.len()..].copy_from_slice(&RESET_TOKEN);
    pair.client.conn.handle_event(ConnectionEvent::datagram(
        now,
        pair.server.addr,
        None,
        BytesMut::from(&buf[..]),
    ));
    pair.client.service(now);
    // The close already decided this connection's fate
    assert!(!pair
        .client
        .saw(|e| matches!(e, Event::ConnectionLost { .. })));
    assert!(pair.client.conn.is_closed());
    assert!(!pair.client.drained);
}

#[test]
fn server_respects_amplification_limit() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let now = pair.time;
    // Deliver the client's first flight by hand, then sever the network entirely
    let first = pair.client.conn.poll_transmit(now).unwrap();
    let first_len = first.contents.len() as u64;
    pair.server.conn.handle_event(ConnectionEvent::datagram(
        now,
        pair.client.addr,
        first.ecn,
        BytesMut::from(&first.contents[..]),
    ));
    pair.drop_to_client = true;
    pair.drop_to_server = true;
    pair.drive_for(Duration::from_secs(5));
    assert!(pair.server.udp_bytes_sent > 0);
    // Three times what was received, with at most one datagram of overshoot
    assert!(pair.server.udp_bytes_sent <= 3 * first_len + 1200);
    assert!(pair.server.conn.is_handshaking());
}

#[test]
fn cid_supply_stops_at_advertised_limit() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.drive_for(Duration::from_secs(1));
    // The peer tops us up to the limit we advertised and no further
    assert_eq!(
        pair.client.conn.stats().frame_rx.new_connection_id,
        crypto::TransportParameters::MAX_ACTIVE_CID_LIMIT - 1
    );
    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn cid_rotation_retires_old_ids() {
    let _guard = subscribe();
    let mut server_config = config();
    server_config.cid_rotation_interval(Some(Duration::from_secs(2)));
    let mut pair = Pair::new(config(), server_config);
    pair.connect();
    pair.drive_for(Duration::from_secs(8));
    // The client acted on retire_prior_to and told the server to forget its first CID
    assert!(pair.server.retired.contains(&0));
    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
}

#[test]
fn ack_frequency_negotiated_and_used() {
    let _guard = subscribe();
    let mut pair = Pair::new_ext(config(), config(), Some(VarInt(1_000)));
    pair.connect();
    pair.client.conn.ping();
    pair.drive_for(Duration::from_secs(1));
    // The server learned the client honors ACK_FREQUENCY and stated its preferences
    assert!(pair.server.conn.stats().frame_tx.ack_frequency >= 1);
    assert!(pair.client.conn.stats().frame_rx.ack_frequency >= 1);
    assert!(!pair.client.conn.is_closed());
    assert!(!pair.server.conn.is_closed());
}
