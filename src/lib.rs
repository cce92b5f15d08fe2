//! Protocol logic for the core of a QUIC transport connection
//!
//! This crate contains a fully deterministic implementation of the
//! per-connection QUIC state machine: packet-number spaces and key rollover,
//! congestion- and loss-aware sending, ACK generation, path validation, and
//! connection migration. It contains no networking code and never reads the
//! system clock; timestamps enter through method arguments and I/O happens
//! through values returned from and fed into a [`Connection`].
//!
//! The cryptographic handshake, the congestion control algorithm, and stream
//! multiplexing above the connection are external collaborators, consumed
//! through the traits in [`crypto`] and [`congestion`] and the events
//! emitted from [`Connection::poll`].

#![warn(missing_docs)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::too_many_arguments)]

use std::{fmt, ops, time::Duration};

mod cid_queue;
#[doc(hidden)]
pub mod coding;
mod range_set;
mod transport_error;
mod varint;

pub use varint::{VarInt, VarIntBoundsExceeded};

mod connection;
pub use crate::connection::{
    Connection, ConnectionError, ConnectionStats, DroppedPacketStats, Event, FrameStats,
    MigrationType, PathStats, PathValidationReason, RttEstimator, Timer, UdpStats,
};

pub mod congestion;
pub mod crypto;

mod frame;
pub use crate::frame::{ApplicationClose, ConnectionClose, FrameType, Stream as StreamFrame};

mod shared;
pub use crate::shared::{
    ConnectionEvent, ConnectionId, EcnCodepoint, EndpointEvent, IssuedCid, ResetToken,
};

mod config;
pub use crate::config::{IdleTimeout, TransportConfig};

mod packet;
pub use crate::packet::SpaceId;

pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Dir::*;
        f.pad(match *self {
            Bi => "bidirectional",
            Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// Stream payloads are relayed to the layer above; the identifier is decoded
/// here only so that frames can be validated and attributed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(#[doc(hidden)] pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(
            f,
            "{} {}directional stream {}",
            initiator,
            dir,
            self.index()
        )
    }
}

impl StreamId {
    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }
    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }
    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).unwrap().encode(buf);
    }
}

/// An outgoing UDP datagram, possibly containing multiple coalesced packets
#[derive(Debug)]
pub struct Transmit {
    /// The socket this datagram should be sent to
    pub destination: std::net::SocketAddr,
    /// Explicit congestion notification bits to set on the packet
    pub ecn: Option<EcnCodepoint>,
    /// Contents of the datagram
    pub contents: Box<[u8]>,
}

//
// Useful internal constants
//

/// The maximum number of CIDs we bother to issue per connection
const LOC_CID_COUNT: u64 = 8;
const RESET_TOKEN_SIZE: usize = 16;
const MAX_CID_SIZE: usize = 20;
/// Minimum size of an Initial-bearing datagram, and of path-probing datagrams
const MIN_INITIAL_SIZE: usize = 1200;
const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Subtraction that saturates to zero rather than underflowing
fn instant_saturating_sub(x: std::time::Instant, y: std::time::Instant) -> Duration {
    if x > y {
        x - y
    } else {
        Duration::new(0, 0)
    }
}

#[cfg(test)]
mod tests;
