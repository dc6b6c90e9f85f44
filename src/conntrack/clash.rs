//! Resolving insert races at confirm time
//!
//! Two workers can create unconfirmed connections for the same tuple at
//! once, typically for UDP where a client fires parallel queries from one
//! socket. The first to confirm wins; the loser either adopts the winner or
//! has its packet dropped.

use std::sync::Arc;

use tracing::debug;

use super::Conntrack;
use crate::conn::{Connection, Status};
use crate::packet::{CtInfo, Packet, Verdict};

/// Same tuples in both directions and same zone
fn same_flow(a: &Connection, b: &Connection) -> bool {
    a.tuples() == b.tuples() && a.zone() == b.zone()
}

impl Conntrack {
    /// The loser's packet found `winner` already in the table
    pub(super) fn resolve_clash(&self, packet: &mut Packet, loser: &Arc<Connection>, winner: Arc<Connection>) -> Verdict {
        let ns = loser.namespace();
        let tracker = self.registry.get(loser.protonum());
        let nat_done = winner.status().intersects(Status::NAT_DONE_MASK);

        if tracker.allow_clash() && !winner.is_dying() && (!nat_done || same_flow(&winner, loser)) {
            let ctinfo = packet.ctinfo().unwrap_or(CtInfo::New);
            if let (Some(into), Some(from)) = (winner.acct(), loser.acct()) {
                into.merge_from(from, ctinfo.direction());
            }
            ns.stats().record_clash_resolve();
            debug!(
                winner = winner.id(),
                loser = loser.id(),
                proto = tracker.name(),
                "insert clash resolved"
            );
            packet.set_conntrack(winner, ctinfo);
            return Verdict::Accept;
        }

        ns.stats().record_drop();
        ns.stats().record_insert_failed();
        debug!(
            winner = winner.id(),
            loser = loser.id(),
            proto = tracker.name(),
            "insert clash, dropping packet"
        );
        Verdict::Drop
    }
}
