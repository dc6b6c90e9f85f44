//! Creating, confirming and deleting connections

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, trace, warn};

use super::Conntrack;
use crate::conn::{Connection, Status};
use crate::error::TableError;
use crate::netns::{Namespace, TrackerSettings};
use crate::packet::{Packet, Verdict};
use crate::proto::{L4Tracker, PacketView};
use crate::table::{hash_tuple, scale, TupleHash};
use crate::tuple::{Direction, Tuple, Zone};

/// Chains at least this long are always accepted at confirm time
const MIN_CHAINLEN: usize = 8;
/// Random extra chain length allowed on top of `MIN_CHAINLEN`
const CHAINLEN_JITTER: usize = 32 - MIN_CHAINLEN;

enum BucketScan {
    Clear,
    Clash(Arc<Connection>),
    TooLong,
}

fn scan_bucket(bucket: &[TupleHash], tuple: &Tuple, zone: &Zone, ns: &Namespace, max_chain: usize) -> BucketScan {
    for (chainlen, node) in bucket.iter().enumerate() {
        if node.matches(tuple, zone, ns) {
            return BucketScan::Clash(Arc::clone(&node.conn));
        }
        if chainlen > max_chain {
            return BucketScan::TooLong;
        }
    }
    BucketScan::Clear
}

impl Conntrack {
    /// Charge a new connection against its namespace and build it
    ///
    /// When the namespace is over `max_connections`, one non-assured
    /// connection near the new flow's bucket is evicted to make room.
    ///
    /// # Errors
    ///
    /// Returns `TableError::Full` when nothing could be evicted.
    pub fn allocate(
        &self,
        ns: &Arc<Namespace>,
        zone: Zone,
        orig: Tuple,
        reply: Tuple,
    ) -> Result<Arc<Connection>, TableError> {
        let max = self.max_connections();
        let count = ns.charge();
        if max != 0 && count > max {
            let hash = hash_tuple(&orig, zone.id_for(Direction::Original), ns.hash_mix());
            if !self.early_drop(ns, hash) {
                ns.uncharge();
                self.set_pressure();
                return Err(TableError::full(max));
            }
        }
        Ok(Arc::new(Connection::new(
            Arc::clone(ns),
            zone,
            orig,
            reply,
            &ns.settings(),
        )))
    }

    /// Build an unconfirmed connection for a packet that missed the table
    pub(super) fn init_conntrack(
        &self,
        ns: &Arc<Namespace>,
        tracker: &dyn L4Tracker,
        view: &PacketView<'_>,
        tuple: Tuple,
        zone: Zone,
        settings: &TrackerSettings,
    ) -> Option<Arc<Connection>> {
        let Some(reply) = tracker.invert(&tuple) else {
            ns.stats().record_invalid();
            debug!(proto = tracker.name(), %tuple, "cannot invert tuple");
            return None;
        };

        let conn = match self.allocate(ns, zone, tuple, reply) {
            Ok(conn) => conn,
            Err(TableError::Full { max }) => {
                ns.stats().record_drop();
                self.warn_table_full(ns, max);
                return None;
            }
            Err(e) => {
                ns.stats().record_drop();
                debug!(error = %e, "allocation failed");
                return None;
            }
        };

        if !tracker.new_conn(&conn, view, settings) {
            ns.stats().record_invalid();
            trace!(proto = tracker.name(), %tuple, "tracker refused new connection");
            return None;
        }

        if let Some(exp) = self.expectations.find_expectation(ns, &zone, &tuple) {
            conn.set_status(Status::EXPECTED);
            conn.set_master(Arc::clone(&exp.master));
            conn.set_mark(exp.master.mark());
            conn.set_secmark(exp.master.secmark());
            ns.stats().record_expect_new();
            debug!(conn_id = conn.id(), master = exp.master.id(), "expected connection");
        }

        ns.add_unconfirmed(&conn);
        trace!(conn_id = conn.id(), %tuple, proto = tracker.name(), "new connection");
        Some(conn)
    }

    /// Confirm the connection a packet carries
    ///
    /// Only the first original-direction packet of an unconfirmed
    /// connection does anything: the connection is inserted into the flow
    /// table under both tuples. Losing an insert race is handed to the clash
    /// resolver. Packets without a connection, reply-direction packets and
    /// packets of confirmed connections are accepted untouched.
    pub fn confirm(&self, packet: &mut Packet) -> Verdict {
        let Some((conn, ctinfo)) = packet.conntrack().map(|(conn, info)| (Arc::clone(conn), info)) else {
            return Verdict::Accept;
        };
        if conn.is_confirmed() {
            return Verdict::Accept;
        }
        if ctinfo.direction() != Direction::Original {
            debug!(conn_id = conn.id(), ?ctinfo, "reply packet of unconfirmed connection");
            return Verdict::Accept;
        }

        let verdict = self.insert_confirmed(&conn, packet);
        if verdict == Verdict::Drop {
            packet.clear_conntrack();
        }
        verdict
    }

    fn insert_confirmed(&self, conn: &Arc<Connection>, packet: &mut Packet) -> Verdict {
        let ns = Arc::clone(conn.namespace());
        let zone = conn.zone();
        let [orig, reply] = conn.tuples();

        let pair = self.table.lock_conn(conn);
        if conn.is_confirmed() {
            debug!(conn_id = conn.id(), "connection confirmed twice");
            return Verdict::Drop;
        }

        ns.remove_from_lists(conn);
        if conn.is_dying() {
            ns.add_dying(conn);
            ns.stats().record_insert_failed();
            return Verdict::Drop;
        }

        let max_chain = MIN_CHAINLEN + rand::thread_rng().gen_range(0..CHAINLEN_JITTER);
        let scan = match scan_bucket(&pair.orig_bucket(), &orig, &zone, &ns, max_chain) {
            BucketScan::Clear => scan_bucket(&pair.reply_bucket(), &reply, &zone, &ns, max_chain),
            other => other,
        };

        match scan {
            BucketScan::Clear => {
                conn.rebase_timeout(self.now_ms());
                conn.set_status(Status::CONFIRMED);
                if let Some(ts) = conn.tstamp() {
                    ts.start();
                }
                pair.insert(conn);
                drop(pair);
                ns.stats().record_insert();
                trace!(conn_id = conn.id(), %orig, "connection confirmed");
                Verdict::Accept
            }
            BucketScan::TooLong => {
                ns.add_dying(conn);
                drop(pair);
                ns.stats().record_chaintoolong();
                ns.stats().record_insert_failed();
                debug!(conn_id = conn.id(), max_chain, "bucket chain too long");
                Verdict::Drop
            }
            BucketScan::Clash(winner) => {
                ns.add_dying(conn);
                drop(pair);
                self.resolve_clash(packet, conn, winner)
            }
        }
    }

    /// Delete a connection
    ///
    /// Returns false if another caller already deleted it.
    pub fn delete(&self, conn: &Arc<Connection>) -> bool {
        if conn.test_and_set(Status::DYING) {
            return false;
        }
        let ns = conn.namespace();
        {
            // Serialises against a concurrent confirm of the same connection
            let pair = self.table.lock_conn(conn);
            if conn.is_confirmed() {
                pair.remove(conn);
            }
        }
        ns.add_dying(conn);
        let expectations = self.expectations.remove_for_master(conn);
        debug!(
            conn_id = conn.id(),
            namespace = ns.id(),
            expectations,
            "connection deleted"
        );
        true
    }

    /// Delete `conn` if it is confirmed and past its deadline
    pub(crate) fn reap_expired(&self, conn: &Arc<Connection>, now_ms: u64) -> bool {
        if conn.is_expired(now_ms) && !conn.is_dying() && self.delete(conn) {
            conn.namespace().stats().record_expired();
            trace!(conn_id = conn.id(), "expired connection reaped");
            return true;
        }
        false
    }

    /// Replace the reply tuple of an unconfirmed connection (NAT)
    ///
    /// # Errors
    ///
    /// Returns `TableError::AlreadyConfirmed` once the connection is in the table.
    pub fn alter_reply(&self, conn: &Connection, reply: Tuple) -> Result<(), TableError> {
        if conn.is_confirmed() {
            return Err(TableError::AlreadyConfirmed { id: conn.id() });
        }
        debug!(conn_id = conn.id(), %reply, "reply tuple altered");
        conn.set_reply_tuple(reply);
        Ok(())
    }

    /// Whether a live connection other than `ignored` already uses `tuple`
    ///
    /// `tuple` is a reply-direction candidate, as produced by NAT port
    /// selection for `ignored`.
    pub fn tuple_taken(&self, tuple: &Tuple, ignored: &Connection) -> bool {
        let ns = ignored.namespace();
        let zone = ignored.zone();
        let hash = hash_tuple(tuple, zone.id_for(Direction::Reply), ns.hash_mix());
        let now = self.now_ms();
        loop {
            let start = self.table.locks().read_begin();
            if let Some(bucket) = self.table.bucket(scale(hash, self.table.size())) {
                for node in bucket.iter() {
                    if std::ptr::eq(node.conn.as_ref(), ignored) {
                        continue;
                    }
                    if node.conn.is_expired(now) {
                        self.reap_expired(&node.conn, now);
                        continue;
                    }
                    if !node.conn.is_dying() && node.matches(tuple, &zone, ns) {
                        return true;
                    }
                }
            }
            if !self.table.locks().read_retry(start) {
                return false;
            }
        }
    }

    /// Delete every confirmed connection `pred` selects
    ///
    /// `ns` restricts the sweep to one namespace. Connections whose tracker
    /// refuses user sweeps are left alone. Returns how many were deleted.
    pub fn iterate_cleanup(&self, ns: Option<&Namespace>, pred: impl FnMut(&Connection) -> bool) -> usize {
        self.sweep(ns.map(Namespace::id), pred, false)
    }

    /// Delete every connection of a namespace
    pub fn flush(&self, ns: &Namespace) -> usize {
        let deleted = self.iterate_cleanup(Some(ns), |_| true);
        info!(namespace = ns.id(), deleted, "namespace flushed");
        deleted
    }

    fn sweep(&self, ns_id: Option<u32>, mut pred: impl FnMut(&Connection) -> bool, force: bool) -> usize {
        let victims: Vec<Arc<Connection>> = self
            .table
            .connections()
            .into_iter()
            .filter(|conn| ns_id.map_or(true, |id| conn.namespace().id() == id))
            .filter(|conn| !conn.is_dying())
            .filter(|conn| force || self.registry.get(conn.protonum()).sweep_user_ok(conn))
            .filter(|conn| pred(conn))
            .collect();
        victims.iter().filter(|conn| self.delete(conn)).count()
    }

    /// Tear down every connection and expectation of a namespace
    ///
    /// Unconfirmed connections are marked dying so their confirm fails,
    /// then the table is swept until the namespace's live count reaches
    /// zero or a round makes no progress because the survivors are still
    /// referenced by packets in flight. Returns how many were deleted.
    pub fn cleanup_namespace(&self, ns: &Arc<Namespace>) -> usize {
        let mut deleted = 0;
        loop {
            let fresh = ns
                .unconfirmed()
                .iter()
                .filter(|conn| !conn.test_and_set(Status::DYING))
                .count();
            let round = self.sweep(Some(ns.id()), |_| true, true);
            deleted += round;
            self.expectations.remove_for_namespace(ns.id());

            let live = ns.count();
            if live == 0 {
                break;
            }
            if round == 0 && fresh == 0 {
                warn!(namespace = ns.id(), remaining = live, "connections still referenced after cleanup");
                break;
            }
            std::thread::yield_now();
        }
        info!(namespace = ns.id(), deleted, "namespace cleaned up");
        deleted
    }

    /// Remove a namespace after tearing down its connections
    pub fn remove_namespace(&self, id: u32) -> bool {
        let Some((_, ns)) = self.namespaces.remove(&id) else {
            return false;
        };
        self.cleanup_namespace(&ns);
        true
    }

    /// Resize the flow table, returning the previous bucket count
    ///
    /// # Errors
    ///
    /// Returns `TableError::InvalidSize` below the minimum bucket count.
    pub fn set_hashsize(&self, size: usize) -> Result<usize, TableError> {
        self.table.resize(size)
    }

    /// Change the per-namespace connection limit; 0 means unlimited
    pub fn set_max_connections(&self, max: usize) {
        let old = self
            .max_connections
            .swap(max, std::sync::atomic::Ordering::Relaxed);
        info!(old, new = max, "max connections changed");
    }
}
