//! Traits and types for abstracting over the cryptographic handshake
//!
//! The connection state machine is generic over the TLS-like protocol that authenticates the
//! peer and produces packet protection keys. Implementations pump handshake bytes through
//! [`Session::read_handshake`]/[`Session::write_handshake`] and surface keys for successive
//! encryption levels as the handshake advances.

use bytes::BytesMut;

use crate::{shared::ConnectionId, transport_error::Error as TransportError, ResetToken, Side, VarInt};

/// A cryptographic session capable of driving a handshake and deriving packet keys
pub trait Session: Send + 'static {
    /// Compute the keys used to protect Initial packets for the given destination CID
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys;

    /// Whether the handshake is still in progress
    fn is_handshaking(&self) -> bool;

    /// Consume handshake bytes received from the peer at the current encryption level
    fn read_handshake(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// The peer's QUIC transport parameters, once the handshake has carried them
    ///
    /// `None` until the peer's first handshake flight has been processed.
    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError>;

    /// Append handshake bytes to send to the peer at the current encryption level
    ///
    /// Returns keys for the next encryption level when it becomes available, exactly once per
    /// level.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys>;

    /// Derive the packet keys for the next key phase
    ///
    /// `None` before the handshake has produced 1-RTT keys.
    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>>;

    /// Keys for protecting 0-RTT data, if supported and available
    fn early_crypto(&self) -> Option<(Box<dyn HeaderKey>, Box<dyn PacketKey>)>;
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Key for encrypting data sent to the peer
    pub local: T,
    /// Key for decrypting data received from the peer
    pub remote: T,
}

/// A complete set of keys for a certain packet space
pub struct Keys {
    /// Header protection keys
    pub header: KeyPair<Box<dyn HeaderKey>>,
    /// Packet protection keys
    pub packet: KeyPair<Box<dyn PacketKey>>,
}

/// Keys for header protection
pub trait HeaderKey: Send + Sync {
    /// Decrypt the given packet's header
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Encrypt the given packet's header
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// The sample size used for this key's algorithm
    fn sample_size(&self) -> usize;
}

/// Keys for protecting packet payloads
pub trait PacketKey: Send + Sync {
    /// Encrypt the packet payload with the given packet number
    ///
    /// `buf` contains the full packet with `tag_len` bytes of space reserved at the end;
    /// `buf[..header_len]` is authenticated but not encrypted.
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize);
    /// Decrypt the packet payload with the given packet number, stripping the tag
    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets
    fn tag_len(&self) -> usize;
    /// Maximum number of packets that may be sent using this key
    fn confidentiality_limit(&self) -> u64;
    /// Maximum number of incoming packets that may fail decryption before the connection must be
    /// abandoned
    fn integrity_limit(&self) -> u64;
}

/// Generic crypto errors
#[derive(Debug)]
pub struct CryptoError;

/// QUIC transport parameters carried in the handshake
///
/// Only the fields the connection core consumes are modeled; encoding them into the handshake
/// is the [`Session`] implementation's concern.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    /// Milliseconds, disabled if zero
    pub max_idle_timeout: VarInt,
    /// Limits the size of UDP payloads that the endpoint is willing to receive
    pub max_udp_payload_size: VarInt,
    /// Exponent used to decode the ACK Delay field in the ACK frame
    pub ack_delay_exponent: VarInt,
    /// Maximum amount of time in milliseconds by which the endpoint will delay sending
    /// acknowledgments
    pub max_ack_delay: VarInt,
    /// Maximum number of connection IDs from the peer that an endpoint is willing to store
    ///
    /// Must not exceed [`TransportParameters::MAX_ACTIVE_CID_LIMIT`]; CIDs the peer issues past
    /// that bound cannot be stored and are treated as a protocol violation.
    pub active_connection_id_limit: VarInt,
    /// The value that the endpoint included in the Source Connection ID field of the first
    /// Initial packet it sends for the connection
    pub initial_src_cid: Option<ConnectionId>,
    /// Token used by the endpoint to verify a stateless reset from the peer
    pub stateless_reset_token: Option<ResetToken>,
    /// The endpoint does not support active connection migration
    pub disable_active_migration: bool,
    /// Smallest ACK delay the endpoint can honor, in microseconds; advertises ACK_FREQUENCY
    /// support
    pub min_ack_delay: Option<VarInt>,
}

impl TransportParameters {
    /// The largest `active_connection_id_limit` this implementation can honor
    ///
    /// Connection IDs issued by the peer are kept in a window of this many sequence numbers.
    pub const MAX_ACTIVE_CID_LIMIT: u64 = crate::cid_queue::CidQueue::WINDOW as u64;
}

impl Default for TransportParameters {
    /// Standard defaults, used if the peer does not supply a given parameter
    fn default() -> Self {
        Self {
            max_idle_timeout: VarInt(0),
            max_udp_payload_size: VarInt(65527),
            ack_delay_exponent: VarInt(3),
            max_ack_delay: VarInt(25),
            active_connection_id_limit: VarInt(2),
            initial_src_cid: None,
            stateless_reset_token: None,
            disable_active_migration: false,
            min_ack_delay: None,
        }
    }
}

/// Deterministic stand-in crypto for exercising the state machine without TLS
///
/// The "handshake" is a three-message dance carrying each side's transport parameters, and
/// "encryption" is an XOR keystream with an additive tag. It provides no confidentiality, but it
/// reproduces the key schedule: per-level keys, key-phase rollover, and authentication failures
/// under mismatched keys.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::coding::{BufExt, BufMutExt, Codec};
    use crate::packet::PacketNumber;
    use crate::RESET_TOKEN_SIZE;

    const TAG_LEN: usize = 16;

    /// Writer-side key identifier; lets mismatched keys fail authentication
    fn key_id(space: u8, writer: Side, phase: u64) -> u8 {
        0x40 | (space << 4) | (((phase & 0x3) as u8) << 2) | writer as u8
    }

    fn keys_for(space: u8, side: Side, phase: u64) -> Keys {
        Keys {
            header: KeyPair {
                local: Box::new(XorHeaderKey {
                    id: key_id(space, side, 0),
                }),
                remote: Box::new(XorHeaderKey {
                    id: key_id(space, !side, 0),
                }),
            },
            packet: KeyPair {
                local: Box::new(XorPacketKey {
                    id: key_id(space, side, phase),
                }),
                remote: Box::new(XorPacketKey {
                    id: key_id(space, !side, phase),
                }),
            },
        }
    }

    /// Initial-level keys, as derivable by any observer of the wire
    pub(crate) fn keys(side: Side) -> Keys {
        keys_for(0, side, 0)
    }

    pub(crate) struct XorHeaderKey {
        id: u8,
    }

    impl HeaderKey for XorHeaderKey {
        fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
            // Long headers protect the low 4 bits of the first byte, short headers 5
            packet[0] ^= match packet[0] & 0x80 {
                0 => self.id & 0x1f,
                _ => self.id & 0x0f,
            };
            let pn_len = PacketNumber::decode_len(packet[0]);
            for b in &mut packet[pn_offset..pn_offset + pn_len] {
                *b ^= self.id;
            }
        }

        fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
            let pn_len = PacketNumber::decode_len(packet[0]);
            for b in &mut packet[pn_offset..pn_offset + pn_len] {
                *b ^= self.id;
            }
            packet[0] ^= match packet[0] & 0x80 {
                0 => self.id & 0x1f,
                _ => self.id & 0x0f,
            };
        }

        fn sample_size(&self) -> usize {
            16
        }
    }

    pub(crate) struct XorPacketKey {
        id: u8,
    }

    impl XorPacketKey {
        fn tag(&self, packet: u64, header: &[u8], ciphertext: &[u8]) -> [u8; TAG_LEN] {
            let mut tag = [0; TAG_LEN];
            tag[0] = self.id;
            tag[1..9].copy_from_slice(&packet.to_be_bytes());
            let mut sum: u8 = 0;
            for &b in header.iter().chain(ciphertext) {
                sum = sum.wrapping_add(b);
            }
            tag[9] = sum;
            tag
        }
    }

    impl PacketKey for XorPacketKey {
        fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) {
            let tag_start = buf.len() - TAG_LEN;
            for b in &mut buf[header_len..tag_start] {
                *b ^= self.id;
            }
            let (rest, tag_buf) = buf.split_at_mut(tag_start);
            let (header, ciphertext) = rest.split_at(header_len);
            tag_buf.copy_from_slice(&self.tag(packet, header, ciphertext));
        }

        fn decrypt(
            &self,
            packet: u64,
            header: &[u8],
            payload: &mut BytesMut,
        ) -> Result<(), CryptoError> {
            if payload.len() < TAG_LEN {
                return Err(CryptoError);
            }
            let tag_start = payload.len() - TAG_LEN;
            let expected = self.tag(packet, header, &payload[..tag_start]);
            if payload[tag_start..] != expected[..] {
                return Err(CryptoError);
            }
            payload.truncate(tag_start);
            for b in payload.iter_mut() {
                *b ^= self.id;
            }
            Ok(())
        }

        fn tag_len(&self) -> usize {
            TAG_LEN
        }

        fn confidentiality_limit(&self) -> u64 {
            1 << 20
        }

        fn integrity_limit(&self) -> u64 {
            1 << 10
        }
    }

    const CLIENT_HELLO: u8 = 1;
    const SERVER_HELLO: u8 = 2;
    const FINISHED: u8 = 3;

    fn write_params(buf: &mut Vec<u8>, params: &TransportParameters) {
        buf.write(params.max_idle_timeout);
        buf.write(params.max_udp_payload_size);
        buf.write(params.ack_delay_exponent);
        buf.write(params.max_ack_delay);
        buf.write(params.active_connection_id_limit);
        match params.initial_src_cid {
            Some(cid) => {
                buf.write(1u8);
                buf.write(cid.len() as u8);
                buf.extend_from_slice(&cid);
            }
            None => buf.write(0u8),
        }
        match params.stateless_reset_token {
            Some(token) => {
                buf.write(1u8);
                buf.extend_from_slice(&token);
            }
            None => buf.write(0u8),
        }
        buf.write(params.disable_active_migration as u8);
        match params.min_ack_delay {
            Some(x) => {
                buf.write(1u8);
                buf.write(x);
            }
            None => buf.write(0u8),
        }
    }

    fn read_params(buf: &mut &[u8]) -> Result<TransportParameters, TransportError> {
        let malformed = || TransportError::TRANSPORT_PARAMETER_ERROR("malformed");
        let mut params = TransportParameters {
            max_idle_timeout: VarInt::decode(buf).map_err(|_| malformed())?,
            max_udp_payload_size: VarInt::decode(buf).map_err(|_| malformed())?,
            ack_delay_exponent: VarInt::decode(buf).map_err(|_| malformed())?,
            max_ack_delay: VarInt::decode(buf).map_err(|_| malformed())?,
            active_connection_id_limit: VarInt::decode(buf).map_err(|_| malformed())?,
            ..TransportParameters::default()
        };
        if buf.get::<u8>().map_err(|_| malformed())? != 0 {
            let len = buf.get::<u8>().map_err(|_| malformed())? as usize;
            if buf.len() < len {
                return Err(malformed());
            }
            params.initial_src_cid = Some(ConnectionId::new(&buf[..len]));
            *buf = &buf[len..];
        }
        if buf.get::<u8>().map_err(|_| malformed())? != 0 {
            if buf.len() < RESET_TOKEN_SIZE {
                return Err(malformed());
            }
            let mut token = [0; RESET_TOKEN_SIZE];
            token.copy_from_slice(&buf[..RESET_TOKEN_SIZE]);
            params.stateless_reset_token = Some(token.into());
            *buf = &buf[RESET_TOKEN_SIZE..];
        }
        params.disable_active_migration = buf.get::<u8>().map_err(|_| malformed())? != 0;
        if buf.get::<u8>().map_err(|_| malformed())? != 0 {
            params.min_ack_delay = Some(VarInt::decode(buf).map_err(|_| malformed())?);
        }
        Ok(params)
    }

    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    enum State {
        /// Next step is writing our hello (client only)
        SendHello,
        /// Next step is reading the peer's hello
        ExpectHello,
        /// Hello read; the next write surfaces handshake keys
        HelloRead,
        /// Handshake keys surfaced; the next write emits FINISHED and surfaces 1-RTT keys
        WriteFinished,
        /// Waiting for the peer's FINISHED
        ExpectFinished,
        Complete,
    }

    pub(crate) struct Session {
        side: Side,
        params: TransportParameters,
        peer_params: Option<TransportParameters>,
        state: State,
        peer_finished: bool,
        /// Levels for which keys have been surfaced (1 = handshake, 2 = data)
        keys_issued: u8,
        phase: u64,
    }

    /// Create a client-side handshake session
    pub(crate) fn client_session(params: TransportParameters) -> Session {
        Session {
            side: Side::Client,
            params,
            peer_params: None,
            state: State::SendHello,
            peer_finished: false,
            keys_issued: 0,
            phase: 0,
        }
    }

    /// Create a server-side handshake session
    pub(crate) fn server_session(params: TransportParameters) -> Session {
        Session {
            side: Side::Server,
            params,
            peer_params: None,
            state: State::ExpectHello,
            peer_finished: false,
            keys_issued: 0,
            phase: 0,
        }
    }

    impl super::Session for Session {
        fn initial_keys(&self, _dst_cid: &ConnectionId, side: Side) -> Keys {
            keys_for(0, side, 0)
        }

        fn is_handshaking(&self) -> bool {
            self.state != State::Complete
        }

        fn read_handshake(&mut self, buf: &[u8]) -> Result<(), TransportError> {
            let mut buf = buf;
            while !buf.is_empty() {
                let ty = buf[0];
                buf = &buf[1..];
                match (ty, self.state) {
                    (CLIENT_HELLO, State::ExpectHello) if self.side.is_server() => {
                        self.peer_params = Some(read_params(&mut buf)?);
                        self.state = State::HelloRead;
                    }
                    (SERVER_HELLO, State::ExpectHello) if self.side.is_client() => {
                        self.peer_params = Some(read_params(&mut buf)?);
                        self.state = State::HelloRead;
                    }
                    // The peer's FINISHED can race our own writes, so accept it in any
                    // post-hello state
                    (FINISHED, State::HelloRead)
                    | (FINISHED, State::WriteFinished)
                    | (FINISHED, State::ExpectFinished)
                    | (FINISHED, State::Complete) => {
                        self.peer_finished = true;
                        if self.state == State::ExpectFinished {
                            self.state = State::Complete;
                        }
                    }
                    _ => {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "unexpected handshake message",
                        ));
                    }
                }
            }
            Ok(())
        }

        fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError> {
            Ok(self.peer_params)
        }

        fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys> {
            match self.state {
                State::SendHello => {
                    debug_assert!(self.side.is_client());
                    buf.push(CLIENT_HELLO);
                    write_params(buf, &self.params);
                    self.state = State::ExpectHello;
                    None
                }
                State::HelloRead => {
                    if self.side.is_server() {
                        buf.push(SERVER_HELLO);
                        write_params(buf, &self.params);
                    }
                    self.state = State::WriteFinished;
                    self.keys_issued = 1;
                    Some(keys_for(1, self.side, 0))
                }
                State::WriteFinished => {
                    // Written after the handshake-keys upgrade, so it rides the Handshake level
                    buf.push(FINISHED);
                    self.state = match self.side {
                        // The client's FINISHED completes its handshake once sent
                        Side::Client => State::Complete,
                        Side::Server if self.peer_finished => State::Complete,
                        Side::Server => State::ExpectFinished,
                    };
                    self.keys_issued = 2;
                    Some(keys_for(2, self.side, 0))
                }
                _ => None,
            }
        }

        fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>> {
            if self.keys_issued < 2 {
                return None;
            }
            self.phase += 1;
            let keys = keys_for(2, self.side, self.phase);
            Some(keys.packet)
        }

        fn early_crypto(&self) -> Option<(Box<dyn HeaderKey>, Box<dyn PacketKey>)> {
            None
        }
    }

    #[cfg(test)]
    mod tests {
        use super::super::Session as _;
        use super::*;

        #[test]
        fn packet_protection_roundtrip() {
            let client = keys(Side::Client);
            let server = keys(Side::Server);
            let header = b"hdr".to_vec();
            let mut buf = header.clone();
            buf.extend_from_slice(b"payload");
            buf.extend_from_slice(&[0; TAG_LEN]);
            client.packet.local.encrypt(7, &mut buf, header.len());
            assert_ne!(&buf[header.len()..header.len() + 7], b"payload");

            let mut payload = BytesMut::from(&buf[header.len()..]);
            server
                .packet
                .remote
                .decrypt(7, &header, &mut payload)
                .unwrap();
            assert_eq!(&payload[..], b"payload");

            // Wrong packet number fails authentication
            let mut payload = BytesMut::from(&buf[header.len()..]);
            assert!(server
                .packet
                .remote
                .decrypt(8, &header, &mut payload)
                .is_err());
        }

        #[test]
        fn handshake_dance() {
            let mut client = client_session(TransportParameters::default());
            let mut server = server_session(TransportParameters::default());

            let mut hello = Vec::new();
            assert!(client.write_handshake(&mut hello).is_none());
            server.read_handshake(&hello).unwrap();
            assert!(server.transport_parameters().unwrap().is_some());

            let mut server_hello = Vec::new();
            assert!(server.write_handshake(&mut server_hello).is_some()); // handshake keys
            let mut server_fin = Vec::new();
            assert!(server.write_handshake(&mut server_fin).is_some()); // 1-rtt keys

            client.read_handshake(&server_hello).unwrap();
            assert!(client.transport_parameters().unwrap().is_some());
            assert!(client.write_handshake(&mut Vec::new()).is_some()); // handshake keys
            client.read_handshake(&server_fin).unwrap();
            let mut client_fin = Vec::new();
            assert!(client.write_handshake(&mut client_fin).is_some()); // 1-rtt keys
            assert!(!client.is_handshaking());

            server.read_handshake(&client_fin).unwrap();
            assert!(!server.is_handshaking());

            // Key update produces fresh packet keys on both sides
            assert!(client.next_1rtt_keys().is_some());
            assert!(server.next_1rtt_keys().is_some());
        }
    }
}
