use std::{fmt, net::SocketAddr, ops, time::Instant};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;

use crate::{coding::BufExt, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Events fed into a `Connection` by its driver
#[derive(Debug)]
pub struct ConnectionEvent(pub(crate) ConnectionEventInner);

impl ConnectionEvent {
    /// A datagram has arrived for the connection
    pub fn datagram(
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
    ) -> Self {
        Self(ConnectionEventInner::Datagram {
            now,
            remote,
            ecn,
            data,
        })
    }

    /// New connection identifiers have been issued for the connection
    ///
    /// Answers a previous [`EndpointEvent::NeedIdentifiers`].
    pub fn new_identifiers(ids: Vec<IssuedCid>, now: Instant) -> Self {
        Self(ConnectionEventInner::NewIdentifiers(ids, now))
    }
}

#[derive(Debug)]
pub(crate) enum ConnectionEventInner {
    /// A datagram has been received for the Connection
    Datagram {
        now: Instant,
        remote: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: BytesMut,
    },
    /// New connection identifiers have been issued for the Connection
    NewIdentifiers(Vec<IssuedCid>, Instant),
}

/// Events a `Connection` reports to whatever routes its packets
///
/// Drained via [`Connection::poll_endpoint_events`](crate::Connection::poll_endpoint_events).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EndpointEvent {
    /// The connection has been fully torn down and will emit no further events
    Drained,
    /// The stateless reset token to recognize for the current remote address has changed
    ResetToken(SocketAddr, ResetToken),
    /// The connection needs `n` fresh connection identifiers routed to it
    NeedIdentifiers(u64),
    /// Stop routing the connection ID with this sequence number to the connection
    RetireConnectionId(u64),
}

impl EndpointEvent {
    /// Determine whether this is the last event a `Connection` will emit
    pub fn is_drained(&self) -> bool {
        *self == Self::Drained
    }
}

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire with tools like Wireshark.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Construct cid by reading `len` bytes from a `Buf`
    ///
    /// Callers need to assure that `buf.remaining() >= len`
    pub(crate) fn from_buf(buf: &mut impl Buf, len: usize) -> Self {
        debug_assert!(buf.remaining() >= len);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut res[..len]);
        res
    }

    /// Generate a random cid of the given length
    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Decode from long header format
    pub(crate) fn decode_long(buf: &mut impl Buf) -> Option<Self> {
        let len = buf.get::<u8>().ok()? as usize;
        match len > MAX_CID_SIZE || buf.remaining() < len {
            false => Some(Self::from_buf(buf, len)),
            true => None,
        }
    }

    /// Encode in long header format
    pub(crate) fn encode_long(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len() as u8);
        buf.put_slice(self);
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl ops::DerefMut for ConnectionId {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Explicit congestion notification codepoint
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EcnCodepoint {
    /// The ECT(0) codepoint, indicating that an endpoint is ECN-capable
    Ect0 = 0b10,
    /// The ECT(1) codepoint, indicating that an endpoint is ECN-capable
    Ect1 = 0b01,
    /// The CE codepoint, signalling that congestion was experienced
    Ce = 0b11,
}

impl EcnCodepoint {
    /// Create new object from the given bits
    pub fn from_bits(x: u8) -> Option<Self> {
        use self::EcnCodepoint::*;
        Some(match x & 0b11 {
            0b10 => Ect0,
            0b01 => Ect1,
            0b11 => Ce,
            _ => {
                return None;
            }
        })
    }

    /// Whether the codepoint is CE, signalling that congestion was experienced
    pub fn is_ce(self) -> bool {
        matches!(self, Self::Ce)
    }
}

/// Stateless reset token
///
/// Used for an endpoint to securely communicate that it has lost state for a connection.
#[derive(Debug, Copy, Clone, Eq)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    /// Generate a fresh random token
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0; RESET_TOKEN_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl PartialEq for ResetToken {
    fn eq(&self, other: &Self) -> bool {
        // Timing-independent comparison, since tokens gate stateless resets
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// A connection ID issued to a peer along with routing metadata
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IssuedCid {
    /// Sequence number of the ID, monotonic over the life of the connection
    pub sequence: u64,
    /// The ID itself
    pub id: ConnectionId,
    /// Token with which the issuer can signal loss of state for this ID
    pub reset_token: ResetToken,
}
