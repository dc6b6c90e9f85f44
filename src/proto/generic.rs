//! Fallback tracker for transport protocols without their own

use crate::conn::Connection;
use crate::error::PacketError;
use crate::netns::TrackerSettings;
use crate::tuple::Tuple;

use super::{L4Tracker, PacketCtx, PacketView, Timeouts, TrackAction};

/// Tracks any protocol by addresses alone, with a fixed timeout
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericTracker;

impl L4Tracker for GenericTracker {
    /// Never registered; the registry falls back to it
    fn protonum(&self) -> u8 {
        0
    }

    fn name(&self) -> &'static str {
        "generic"
    }

    fn pkt_to_tuple(&self, view: &PacketView<'_>) -> Result<Tuple, PacketError> {
        Ok(Tuple::new(view.hdr.src, view.hdr.dst, view.hdr.protonum, 0, 0))
    }

    fn new_conn(&self, _conn: &Connection, _view: &PacketView<'_>, _settings: &TrackerSettings) -> bool {
        true
    }

    fn packet(&self, conn: &Connection, _view: &PacketView<'_>, ctx: &PacketCtx<'_>) -> TrackAction {
        conn.refresh(ctx.now_ms, self.timeouts(ctx.settings).initial_ms());
        TrackAction::Accept
    }

    fn timeouts(&self, settings: &TrackerSettings) -> Timeouts {
        Timeouts::Single(settings.generic_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CtInfo, Hook, L4Header};
    use crate::proto::TrackerRegistry;
    use crate::tuple::L3Proto;

    #[test]
    fn test_generic_tuple_has_no_ports() {
        let data = [0u8; 4];
        let hdr = L4Header {
            l3: L3Proto::Ipv4,
            src: "192.0.2.1".parse().unwrap(),
            dst: "192.0.2.2".parse().unwrap(),
            protonum: 47,
            offset: 0,
            end: data.len(),
        };
        let view = PacketView::new(&data, hdr, Hook::Forward);
        let registry = TrackerRegistry::new();

        let tuple = registry.tuple_from_packet(&view).unwrap();
        assert_eq!(tuple.protonum, 47);
        assert_eq!((tuple.src_port, tuple.dst_port), (0, 0));
        assert_eq!(registry.invert(&tuple).unwrap().src, hdr.dst);
    }

    #[test]
    fn test_generic_timeout() {
        use crate::netns::Namespace;
        use crate::tuple::Zone;
        use std::sync::Arc;

        let settings = TrackerSettings::default();
        let ns = Namespace::new(1, settings.clone(), 1);
        let orig = Tuple::new("192.0.2.1".parse().unwrap(), "192.0.2.2".parse().unwrap(), 47, 0, 0);
        ns.charge();
        let conn = Arc::new(Connection::new(ns, Zone::DEFAULT, orig, orig.swapped(), &settings));

        let data = [0u8; 4];
        let hdr = L4Header {
            l3: L3Proto::Ipv4,
            src: orig.src,
            dst: orig.dst,
            protonum: 47,
            offset: 0,
            end: 4,
        };
        let view = PacketView::new(&data, hdr, Hook::PreRouting);
        let ctx = PacketCtx { now_ms: 0, ctinfo: CtInfo::New, settings: &settings };
        assert_eq!(GenericTracker.packet(&conn, &view, &ctx), TrackAction::Accept);
        assert_eq!(conn.timeout_raw(), 600_000);
    }
}
