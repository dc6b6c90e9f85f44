//! Packets and their association with tracked connections
//!
//! A [`Packet`] is an owned IPv4/IPv6 datagram plus the connection the
//! tracker attached to it. The L3/L4 adapter in [`parse`] finds the
//! transport header, [`checksum`] validates it, and [`builder`] assembles
//! well-formed packets for tests, benchmarks and the workload driver.

pub mod builder;
pub mod checksum;
pub mod parse;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::conn::Connection;
use crate::tuple::{Direction, Zone};

pub use builder::{IcmpMessage, TcpFlags, TcpSegment, UdpDatagram};
pub use parse::{l4_offset_and_proto, l4_offset_and_proto_quoted, L4Header};

/// Outcome of classifying a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Let the packet continue
    Accept,
    /// Discard the packet
    Drop,
    /// Re-run classification from scratch
    Repeat,
    /// Ownership moved to a collaborator; the caller must not touch the packet
    Stolen,
}

/// Hook points a packet can be classified at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    PreRouting,
    LocalIn,
    Forward,
    LocalOut,
    PostRouting,
}

/// How a packet relates to its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtInfo {
    /// Original direction of a connection that has seen a reply
    Established,
    /// Original direction of an expected child connection
    Related,
    /// Original direction, no reply seen yet
    New,
    /// Reply direction
    EstablishedReply,
    /// Reply direction of a related flow (ICMP errors)
    RelatedReply,
}

impl CtInfo {
    /// Direction the packet travels in
    #[must_use]
    pub const fn direction(self) -> Direction {
        match self {
            Self::Established | Self::Related | Self::New => Direction::Original,
            Self::EstablishedReply | Self::RelatedReply => Direction::Reply,
        }
    }

    /// Check if the packet travels in the reply direction
    #[must_use]
    pub const fn is_reply(self) -> bool {
        matches!(self.direction(), Direction::Reply)
    }
}

/// An IP datagram moving through the hooks
#[derive(Default, Clone)]
pub struct Packet {
    data: Bytes,
    nfct: Option<(Arc<Connection>, CtInfo)>,
    /// Zone the packet is classified in
    pub zone: Zone,
    /// Opaque packet mark
    pub mark: u32,
}

impl Packet {
    /// Wrap raw datagram bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            nfct: None,
            zone: Zone::DEFAULT,
            mark: 0,
        }
    }

    /// Set the zone the packet is classified in
    #[must_use]
    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zone = zone;
        self
    }

    /// Raw datagram bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the datagram bytes
    pub(crate) fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Datagram length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the datagram is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Connection and classification attached by the tracker
    pub fn conntrack(&self) -> Option<(&Arc<Connection>, CtInfo)> {
        self.nfct.as_ref().map(|(conn, info)| (conn, *info))
    }

    /// Classification attached by the tracker
    pub fn ctinfo(&self) -> Option<CtInfo> {
        self.nfct.as_ref().map(|(_, info)| *info)
    }

    pub(crate) fn set_conntrack(&mut self, conn: Arc<Connection>, info: CtInfo) {
        self.nfct = Some((conn, info));
    }

    pub(crate) fn clear_conntrack(&mut self) -> Option<(Arc<Connection>, CtInfo)> {
        self.nfct.take()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("conn", &self.nfct.as_ref().map(|(c, info)| (c.id(), *info)))
            .field("zone", &self.zone)
            .field("mark", &self.mark)
            .finish()
    }
}
