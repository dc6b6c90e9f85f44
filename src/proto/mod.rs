//! Per-protocol trackers
//!
//! Each transport protocol plugs in through [`L4Tracker`]: it extracts the
//! tuple, inverts it, validates packets before a lookup, initializes state
//! for a new connection and advances that state on every packet. Protocols
//! without a registered tracker fall back to [`generic::GenericTracker`].

pub mod generic;
pub mod icmp;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::conn::Connection;
use crate::error::PacketError;
use crate::netns::TrackerSettings;
use crate::packet::parse::read_ports;
use crate::packet::{CtInfo, Hook, L4Header};
use crate::tuple::Tuple;

pub use generic::GenericTracker;
pub use icmp::IcmpTracker;
pub use tcp::{TcpConn, TcpState, TcpTimeouts, TcpTracker};
pub use udp::{UdpConn, UdpTracker};

/// A parsed datagram as trackers see it
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    /// Whole datagram, network header included
    pub data: &'a [u8],
    pub hdr: L4Header,
    pub hook: Hook,
}

impl<'a> PacketView<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8], hdr: L4Header, hook: Hook) -> Self {
        Self { data, hdr, hook }
    }

    /// Transport header and payload
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &'a [u8] {
        self.hdr.transport(self.data)
    }
}

/// Per-packet inputs to [`L4Tracker::packet`]
#[derive(Debug, Clone, Copy)]
pub struct PacketCtx<'a> {
    pub now_ms: u64,
    pub ctinfo: CtInfo,
    pub settings: &'a TrackerSettings,
}

/// Inputs to [`L4Tracker::error`]
#[derive(Clone, Copy)]
pub struct ErrorCtx<'a> {
    pub settings: &'a TrackerSettings,
    /// For trackers that need to parse a quoted inner datagram
    pub registry: &'a TrackerRegistry,
}

/// Result of the pre-lookup validity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCheck {
    /// Track the packet normally
    Track,
    /// Drop as invalid
    Invalid(PacketError),
    /// An error message quoting `inner`; attach it to the flow `inner` names
    Related {
        /// Quoted tuple, already inverted into the direction it would be looked up in
        inner: Tuple,
        /// Destination of the outer packet
        outer_dst: IpAddr,
    },
}

/// What the engine should do after a tracker saw a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackAction {
    Accept,
    /// Invalid for this connection
    Drop,
    /// Delete the connection, let the packet through
    Kill,
    /// Delete the connection and classify the packet again
    Repeat,
}

/// Protocol-private connection state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProtoState {
    #[default]
    None,
    Tcp(TcpConn),
    Udp(UdpConn),
}

/// Timeout table of one tracker in one namespace, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timeouts {
    Tcp(TcpTimeouts),
    Udp { unreplied_ms: u64, stream_ms: u64 },
    Single(u64),
}

impl Timeouts {
    /// Timeout of a flow that has not yet seen a reply
    #[must_use]
    pub fn initial_ms(&self) -> u64 {
        match self {
            Self::Tcp(tcp) => tcp.for_state(TcpState::SynSent),
            Self::Udp { unreplied_ms, .. } => *unreplied_ms,
            Self::Single(ms) => *ms,
        }
    }
}

/// A transport protocol tracker
pub trait L4Tracker: Send + Sync + fmt::Debug {
    /// IP protocol number this tracker handles
    fn protonum(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Extract the original-direction tuple from a packet
    ///
    /// # Errors
    ///
    /// Returns a `PacketError` when the transport header is too short.
    fn pkt_to_tuple(&self, view: &PacketView<'_>) -> Result<Tuple, PacketError> {
        let (src_port, dst_port) = read_ports(view.transport()).ok_or_else(|| {
            PacketError::truncated(self.name(), 4, view.hdr.transport_len())
        })?;
        Ok(Tuple::new(
            view.hdr.src,
            view.hdr.dst,
            view.hdr.protonum,
            src_port,
            dst_port,
        ))
    }

    /// Tuple of the opposite direction, or `None` when it has none
    fn invert(&self, tuple: &Tuple) -> Option<Tuple> {
        Some(tuple.swapped())
    }

    /// Validate a packet before lookup
    fn error(&self, _view: &PacketView<'_>, _ctx: &ErrorCtx<'_>) -> ErrorCheck {
        ErrorCheck::Track
    }

    /// Initialize state for a fresh connection; `false` refuses to track it
    fn new_conn(&self, conn: &Connection, view: &PacketView<'_>, settings: &TrackerSettings) -> bool;

    /// Advance state and refresh the timeout
    fn packet(&self, conn: &Connection, view: &PacketView<'_>, ctx: &PacketCtx<'_>) -> TrackAction;

    /// Timeouts this tracker applies under a namespace's settings
    fn timeouts(&self, settings: &TrackerSettings) -> Timeouts;

    /// Two connections for the same tuples may be merged at insert time
    fn allow_clash(&self) -> bool {
        false
    }

    /// Eligible for eviction under table pressure despite being assured
    fn can_early_drop(&self, _conn: &Connection) -> bool {
        false
    }

    /// Bulk sweeps that run on behalf of a user may remove this connection
    fn sweep_user_ok(&self, _conn: &Connection) -> bool {
        true
    }
}

/// Trackers by IP protocol number
pub struct TrackerRegistry {
    trackers: Box<[Option<Arc<dyn L4Tracker>>]>,
    generic: Arc<dyn L4Tracker>,
}

impl TrackerRegistry {
    /// Registry with the built-in TCP, UDP, ICMP and ICMPv6 trackers
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            trackers: (0..=u8::MAX).map(|_| None).collect(),
            generic: Arc::new(GenericTracker),
        };
        registry.register(Arc::new(TcpTracker));
        registry.register(Arc::new(UdpTracker));
        registry.register(Arc::new(IcmpTracker::v4()));
        registry.register(Arc::new(IcmpTracker::v6()));
        registry
    }

    /// Install or replace the tracker for its protocol number
    pub fn register(&mut self, tracker: Arc<dyn L4Tracker>) {
        let protonum = usize::from(tracker.protonum());
        self.trackers[protonum] = Some(tracker);
    }

    /// Tracker for `protonum`, falling back to the generic one
    #[must_use]
    pub fn get(&self, protonum: u8) -> &dyn L4Tracker {
        self.trackers[usize::from(protonum)]
            .as_deref()
            .unwrap_or_else(|| self.generic.as_ref())
    }

    /// Tuple of a parsed packet, through its protocol's tracker
    ///
    /// # Errors
    ///
    /// Propagates the tracker's extraction error.
    pub fn tuple_from_packet(&self, view: &PacketView<'_>) -> Result<Tuple, PacketError> {
        self.get(view.hdr.protonum).pkt_to_tuple(view)
    }

    /// Inverse of `tuple` through its protocol's tracker
    #[must_use]
    pub fn invert(&self, tuple: &Tuple) -> Option<Tuple> {
        self.get(tuple.protonum).invert(tuple)
    }
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self.trackers.iter().flatten().map(|t| t.name()).collect();
        f.debug_struct("TrackerRegistry")
            .field("trackers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{l4_offset_and_proto, TcpSegment, UdpDatagram};
    use crate::tuple::{Direction, L3Proto, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

    #[test]
    fn test_registry_builtins() {
        let registry = TrackerRegistry::new();
        assert_eq!(registry.get(IPPROTO_TCP).name(), "tcp");
        assert_eq!(registry.get(IPPROTO_UDP).name(), "udp");
        assert_eq!(registry.get(IPPROTO_ICMP).name(), "icmp");
        assert_eq!(registry.get(IPPROTO_ICMPV6).name(), "icmpv6");
        assert_eq!(registry.get(132).name(), "generic");
    }

    #[test]
    fn test_tuple_from_tcp_packet() {
        let registry = TrackerRegistry::new();
        let pkt = TcpSegment::new("10.0.0.1:40000".parse().unwrap(), "10.0.0.2:80".parse().unwrap())
            .syn()
            .build();
        let hdr = l4_offset_and_proto(pkt.data(), L3Proto::Ipv4).unwrap();
        let view = PacketView::new(pkt.data(), hdr, Hook::PreRouting);

        let tuple = registry.tuple_from_packet(&view).unwrap();
        assert_eq!(tuple, Tuple::tcp("10.0.0.1:40000".parse().unwrap(), "10.0.0.2:80".parse().unwrap()));
        assert_eq!(tuple.dir, Direction::Original);
    }

    #[test]
    fn test_timeouts_follow_settings() {
        let registry = TrackerRegistry::new();
        let mut settings = TrackerSettings::default();
        settings.udp_unreplied_ms = 5_000;
        settings.generic_ms = 9_000;

        assert_eq!(
            registry.get(IPPROTO_UDP).timeouts(&settings),
            Timeouts::Udp { unreplied_ms: 5_000, stream_ms: settings.udp_stream_ms }
        );
        assert_eq!(registry.get(132).timeouts(&settings).initial_ms(), 9_000);
        assert_eq!(
            registry.get(IPPROTO_ICMP).timeouts(&settings).initial_ms(),
            settings.icmp_ms
        );
        assert_eq!(
            registry.get(IPPROTO_TCP).timeouts(&settings).initial_ms(),
            settings.tcp_timeouts.for_state(TcpState::SynSent)
        );
    }

    #[test]
    fn test_invert_through_registry() {
        let registry = TrackerRegistry::new();
        let pkt = UdpDatagram::new("[2001:db8::1]:5000".parse().unwrap(), "[2001:db8::2]:53".parse().unwrap())
            .payload(b"q")
            .build();
        let hdr = l4_offset_and_proto(pkt.data(), L3Proto::Ipv6).unwrap();
        let view = PacketView::new(pkt.data(), hdr, Hook::LocalOut);
        let tuple = registry.tuple_from_packet(&view).unwrap();

        let reply = registry.invert(&tuple).unwrap();
        assert_eq!(reply.src, tuple.dst);
        assert_eq!(reply.src_port, 53);
        assert_eq!(reply.dir, Direction::Reply);
    }
}
