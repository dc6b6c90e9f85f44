//! UDP tracker

use crate::conn::{Connection, Status};
use crate::error::PacketError;
use crate::netns::TrackerSettings;
use crate::packet::checksum::verify_transport;
use crate::packet::Hook;
use crate::tuple::{L3Proto, IPPROTO_UDP};

use super::{ErrorCheck, ErrorCtx, L4Tracker, PacketCtx, PacketView, ProtoState, Timeouts, TrackAction};

const UDP_HEADER: usize = 8;
/// How long a flow must live after creation before replies make it a stream
const STREAM_AFTER_MS: u64 = 2_000;

/// UDP sub-state of a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpConn {
    /// Engine time after which a replied flow counts as a stream
    pub stream_ts_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTracker;

impl L4Tracker for UdpTracker {
    fn protonum(&self) -> u8 {
        IPPROTO_UDP
    }

    fn name(&self) -> &'static str {
        "udp"
    }

    fn error(&self, view: &PacketView<'_>, ctx: &ErrorCtx<'_>) -> ErrorCheck {
        let transport = view.transport();
        if transport.len() < UDP_HEADER {
            return ErrorCheck::Invalid(PacketError::truncated("UDP", UDP_HEADER, transport.len()));
        }
        let declared = usize::from(u16::from_be_bytes([transport[4], transport[5]]));
        if declared < UDP_HEADER || declared > transport.len() {
            return ErrorCheck::Invalid(PacketError::Malformed("UDP length outside header and datagram"));
        }
        let check = u16::from_be_bytes([transport[6], transport[7]]);
        // A zero checksum means "not computed", which only IPv4 allows
        if check == 0 && view.hdr.l3 == L3Proto::Ipv4 {
            return ErrorCheck::Track;
        }
        if ctx.settings.checksum
            && view.hook == Hook::PreRouting
            && !verify_transport(view.data, &view.hdr)
        {
            return ErrorCheck::Invalid(PacketError::BadChecksum { protocol: "UDP" });
        }
        ErrorCheck::Track
    }

    fn new_conn(&self, conn: &Connection, _view: &PacketView<'_>, _settings: &TrackerSettings) -> bool {
        *conn.proto() = ProtoState::Udp(UdpConn::default());
        true
    }

    fn packet(&self, conn: &Connection, _view: &PacketView<'_>, ctx: &PacketCtx<'_>) -> TrackAction {
        let Timeouts::Udp { unreplied_ms, stream_ms } = self.timeouts(ctx.settings) else {
            return TrackAction::Drop;
        };
        let stream_ts = {
            let mut proto = conn.proto();
            match &mut *proto {
                ProtoState::Udp(udp) => {
                    if !conn.is_confirmed() {
                        udp.stream_ts_ms = ctx.now_ms + STREAM_AFTER_MS;
                    }
                    udp.stream_ts_ms
                }
                _ => return TrackAction::Drop,
            }
        };

        if conn.test(Status::SEEN_REPLY) {
            if ctx.now_ms > stream_ts {
                conn.refresh(ctx.now_ms, stream_ms);
                conn.set_status(Status::ASSURED);
            } else {
                conn.refresh(ctx.now_ms, unreplied_ms);
            }
        } else {
            conn.refresh(ctx.now_ms, unreplied_ms);
        }
        TrackAction::Accept
    }

    fn timeouts(&self, settings: &TrackerSettings) -> Timeouts {
        Timeouts::Udp {
            unreplied_ms: settings.udp_unreplied_ms,
            stream_ms: settings.udp_stream_ms,
        }
    }

    fn allow_clash(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::netns::Namespace;
    use crate::packet::{l4_offset_and_proto, CtInfo, UdpDatagram};
    use crate::proto::TrackerRegistry;
    use crate::tuple::{Tuple, Zone};

    fn conn(settings: &TrackerSettings) -> Arc<Connection> {
        let ns = Namespace::new(1, settings.clone(), 1);
        let orig = Tuple::udp("10.0.0.1:5000".parse().unwrap(), "10.0.0.2:53".parse().unwrap());
        ns.charge();
        Arc::new(Connection::new(ns, Zone::DEFAULT, orig, orig.swapped(), settings))
    }

    fn run(conn: &Connection, settings: &TrackerSettings, now_ms: u64, ctinfo: CtInfo) -> TrackAction {
        let pkt = UdpDatagram::new("10.0.0.1:5000".parse().unwrap(), "10.0.0.2:53".parse().unwrap())
            .payload(b"query")
            .build();
        let hdr = l4_offset_and_proto(pkt.data(), L3Proto::Ipv4).unwrap();
        let view = PacketView::new(pkt.data(), hdr, Hook::PreRouting);
        let ctx = PacketCtx { now_ms, ctinfo, settings };
        UdpTracker.packet(conn, &view, &ctx)
    }

    #[test]
    fn test_unreplied_timeout() {
        let settings = TrackerSettings::default();
        let conn = conn(&settings);
        let pkt = UdpDatagram::new("10.0.0.1:5000".parse().unwrap(), "10.0.0.2:53".parse().unwrap()).build();
        let hdr = l4_offset_and_proto(pkt.data(), L3Proto::Ipv4).unwrap();
        assert!(UdpTracker.new_conn(&conn, &PacketView::new(pkt.data(), hdr, Hook::PreRouting), &settings));

        assert_eq!(run(&conn, &settings, 1_000, CtInfo::New), TrackAction::Accept);
        assert_eq!(conn.timeout_raw(), settings.udp_unreplied_ms);
        assert_eq!(conn.proto_state(), ProtoState::Udp(UdpConn { stream_ts_ms: 3_000 }));
    }

    #[test]
    fn test_stream_after_two_seconds_of_replies() {
        let settings = TrackerSettings::default();
        let conn = conn(&settings);
        *conn.proto() = ProtoState::Udp(UdpConn::default());
        run(&conn, &settings, 1_000, CtInfo::New);

        conn.set_status(Status::CONFIRMED | Status::SEEN_REPLY);
        run(&conn, &settings, 2_500, CtInfo::EstablishedReply);
        assert!(!conn.is_assured());
        assert_eq!(conn.timeout_raw(), 2_500 + settings.udp_unreplied_ms);

        run(&conn, &settings, 3_500, CtInfo::Established);
        assert!(conn.is_assured());
        assert_eq!(conn.timeout_raw(), 3_500 + settings.udp_stream_ms);
    }

    #[test]
    fn test_error_checks() {
        let registry = TrackerRegistry::new();
        let settings = TrackerSettings::default();
        let ctx = ErrorCtx { settings: &settings, registry: &registry };

        let pkt = UdpDatagram::new("10.0.0.1:5000".parse().unwrap(), "10.0.0.2:53".parse().unwrap())
            .payload(b"x")
            .bad_checksum()
            .build();
        let hdr = l4_offset_and_proto(pkt.data(), L3Proto::Ipv4).unwrap();
        let view = PacketView::new(pkt.data(), hdr, Hook::PreRouting);
        assert_eq!(
            UdpTracker.error(&view, &ctx),
            ErrorCheck::Invalid(PacketError::BadChecksum { protocol: "UDP" })
        );

        let mut short = hdr;
        short.end = short.offset + 6;
        let view = PacketView::new(pkt.data(), short, Hook::PreRouting);
        assert!(matches!(UdpTracker.error(&view, &ctx), ErrorCheck::Invalid(PacketError::Truncated { .. })));
    }
}
