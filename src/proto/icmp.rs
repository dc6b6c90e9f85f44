//! ICMP and ICMPv6 trackers
//!
//! Query messages (echo, timestamp, information, address mask, node
//! information) are tracked as flows keyed by identifier, type and code.
//! Error messages never create a flow: they quote the offending datagram,
//! and the engine attaches them to the flow that datagram belongs to.

use crate::conn::Connection;
use crate::error::PacketError;
use crate::netns::TrackerSettings;
use crate::packet::checksum::{verify_plain, verify_transport};
use crate::packet::{l4_offset_and_proto_quoted, Hook};
use crate::tuple::{Tuple, IPPROTO_ICMP, IPPROTO_ICMPV6};

use super::{ErrorCheck, ErrorCtx, L4Tracker, PacketCtx, PacketView, Timeouts, TrackAction};

const ICMP_HEADER: usize = 8;
/// Highest ICMPv4 type with a defined meaning
const NR_ICMP_TYPES: u8 = 18;

const ICMP_ECHOREPLY: u8 = 0;
const ICMP_DEST_UNREACH: u8 = 3;
const ICMP_SOURCE_QUENCH: u8 = 4;
const ICMP_REDIRECT: u8 = 5;
const ICMP_ECHO: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMP_PARAMETERPROB: u8 = 12;
const ICMP_TIMESTAMP: u8 = 13;
const ICMP_TIMESTAMPREPLY: u8 = 14;
const ICMP_INFO_REQUEST: u8 = 15;
const ICMP_INFO_REPLY: u8 = 16;
const ICMP_ADDRESS: u8 = 17;
const ICMP_ADDRESSREPLY: u8 = 18;

const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMPV6_NI_QUERY: u8 = 139;
const ICMPV6_NI_REPLY: u8 = 140;
/// ICMPv6 types below this are error messages
const ICMPV6_INFO_MIN: u8 = 128;

/// Tracker for ICMP (`v6 == false`) or ICMPv6
#[derive(Debug, Clone, Copy)]
pub struct IcmpTracker {
    v6: bool,
}

impl IcmpTracker {
    #[must_use]
    pub const fn v4() -> Self {
        Self { v6: false }
    }

    #[must_use]
    pub const fn v6() -> Self {
        Self { v6: true }
    }

    /// Reply type for a query type, and the reverse
    #[must_use]
    pub const fn inverse_type(&self, icmp_type: u8) -> Option<u8> {
        let inverse = if self.v6 {
            match icmp_type {
                ICMPV6_ECHO_REQUEST => ICMPV6_ECHO_REPLY,
                ICMPV6_ECHO_REPLY => ICMPV6_ECHO_REQUEST,
                ICMPV6_NI_QUERY => ICMPV6_NI_REPLY,
                ICMPV6_NI_REPLY => ICMPV6_NI_QUERY,
                _ => return None,
            }
        } else {
            match icmp_type {
                ICMP_ECHO => ICMP_ECHOREPLY,
                ICMP_ECHOREPLY => ICMP_ECHO,
                ICMP_TIMESTAMP => ICMP_TIMESTAMPREPLY,
                ICMP_TIMESTAMPREPLY => ICMP_TIMESTAMP,
                ICMP_INFO_REQUEST => ICMP_INFO_REPLY,
                ICMP_INFO_REPLY => ICMP_INFO_REQUEST,
                ICMP_ADDRESS => ICMP_ADDRESSREPLY,
                ICMP_ADDRESSREPLY => ICMP_ADDRESS,
                _ => return None,
            }
        };
        Some(inverse)
    }

    /// Types that may open a flow
    #[must_use]
    pub const fn is_query(&self, icmp_type: u8) -> bool {
        if self.v6 {
            matches!(icmp_type, ICMPV6_ECHO_REQUEST | ICMPV6_NI_QUERY)
        } else {
            matches!(icmp_type, ICMP_ECHO | ICMP_TIMESTAMP | ICMP_INFO_REQUEST | ICMP_ADDRESS)
        }
    }

    /// Types that quote an offending datagram
    #[must_use]
    pub const fn is_error(&self, icmp_type: u8) -> bool {
        if self.v6 {
            icmp_type < ICMPV6_INFO_MIN
        } else {
            matches!(
                icmp_type,
                ICMP_DEST_UNREACH
                    | ICMP_SOURCE_QUENCH
                    | ICMP_REDIRECT
                    | ICMP_TIME_EXCEEDED
                    | ICMP_PARAMETERPROB
            )
        }
    }

    fn checksum_ok(&self, view: &PacketView<'_>) -> bool {
        if self.v6 {
            verify_transport(view.data, &view.hdr)
        } else {
            verify_plain(view.transport())
        }
    }

    /// Find the flow an error message refers to
    fn error_message(&self, view: &PacketView<'_>, ctx: &ErrorCtx<'_>) -> ErrorCheck {
        let quoted = &view.transport()[ICMP_HEADER..];
        let inner_hdr = match l4_offset_and_proto_quoted(quoted, view.hdr.l3) {
            Ok(hdr) => hdr,
            Err(e) => return ErrorCheck::Invalid(e),
        };
        let inner_view = PacketView::new(quoted, inner_hdr, view.hook);
        let inner = match ctx.registry.tuple_from_packet(&inner_view) {
            Ok(tuple) => tuple,
            Err(e) => return ErrorCheck::Invalid(e),
        };
        // The quoted datagram travelled towards the error's sender
        match ctx.registry.invert(&inner) {
            Some(inverted) => ErrorCheck::Related {
                inner: inverted,
                outer_dst: view.hdr.dst,
            },
            None => ErrorCheck::Invalid(PacketError::NotInvertible),
        }
    }
}

impl L4Tracker for IcmpTracker {
    fn protonum(&self) -> u8 {
        if self.v6 {
            IPPROTO_ICMPV6
        } else {
            IPPROTO_ICMP
        }
    }

    fn name(&self) -> &'static str {
        if self.v6 {
            "icmpv6"
        } else {
            "icmp"
        }
    }

    fn pkt_to_tuple(&self, view: &PacketView<'_>) -> Result<Tuple, PacketError> {
        let transport = view.transport();
        if transport.len() < ICMP_HEADER {
            return Err(PacketError::truncated(self.name(), ICMP_HEADER, transport.len()));
        }
        let id = u16::from_be_bytes([transport[4], transport[5]]);
        let type_code = u16::from_be_bytes([transport[0], transport[1]]);
        Ok(Tuple::new(view.hdr.src, view.hdr.dst, view.hdr.protonum, id, type_code))
    }

    fn invert(&self, tuple: &Tuple) -> Option<Tuple> {
        let inverse = self.inverse_type(tuple.icmp_type())?;
        let mut reply = tuple.swapped();
        reply.src_port = tuple.src_port;
        reply.dst_port = (u16::from(inverse) << 8) | u16::from(tuple.icmp_code());
        Some(reply)
    }

    fn error(&self, view: &PacketView<'_>, ctx: &ErrorCtx<'_>) -> ErrorCheck {
        let transport = view.transport();
        if transport.len() < ICMP_HEADER {
            return ErrorCheck::Invalid(PacketError::truncated(self.name(), ICMP_HEADER, transport.len()));
        }
        if ctx.settings.checksum && view.hook == Hook::PreRouting && !self.checksum_ok(view) {
            return ErrorCheck::Invalid(PacketError::BadChecksum { protocol: self.name() });
        }
        let icmp_type = transport[0];
        if !self.v6 && icmp_type > NR_ICMP_TYPES {
            return ErrorCheck::Invalid(PacketError::InvalidType(icmp_type));
        }
        if self.is_error(icmp_type) {
            return self.error_message(view, ctx);
        }
        ErrorCheck::Track
    }

    fn new_conn(&self, _conn: &Connection, view: &PacketView<'_>, _settings: &TrackerSettings) -> bool {
        view.transport()
            .first()
            .is_some_and(|&icmp_type| self.is_query(icmp_type))
    }

    fn packet(&self, conn: &Connection, _view: &PacketView<'_>, ctx: &PacketCtx<'_>) -> TrackAction {
        conn.refresh(ctx.now_ms, self.timeouts(ctx.settings).initial_ms());
        TrackAction::Accept
    }

    fn timeouts(&self, settings: &TrackerSettings) -> Timeouts {
        Timeouts::Single(settings.icmp_ms)
    }
}
