//! Network namespaces
//!
//! A [`Namespace`] owns everything the tracker keeps per network namespace:
//! the hash seed mixed into every tuple hash, the live connection count used
//! for admission control, statistics, the tracker settings in effect, and the
//! per-worker lists of unconfirmed and dying connections.
//!
//! Worker lists hold weak references. A connection removes itself from its
//! list when the last strong reference goes away, so an `Arc<Connection>`
//! must never be dropped while a worker list lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::duration_ms;
use crate::config::Config;
use crate::conn::Connection;
use crate::proto::tcp::TcpTimeouts;
use crate::stats::{NamespaceStats, StatsSnapshot};

static NEXT_WORKER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static WORKER_ID: usize = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);
}

/// Index of the calling thread's worker list, given `count` lists
#[must_use]
pub fn current_worker(count: usize) -> usize {
    WORKER_ID.with(|id| *id % count.max(1))
}

/// Per-namespace tracker tunables, in engine milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    /// Verify transport checksums at PRE_ROUTING
    pub checksum: bool,
    /// Attach packet/byte counters to new connections
    pub acct: bool,
    /// Attach start/stop timestamps to new connections
    pub timestamp: bool,
    pub tcp_loose: bool,
    pub tcp_be_liberal: bool,
    pub tcp_max_retrans: u8,
    pub tcp_timeouts: TcpTimeouts,
    pub udp_unreplied_ms: u64,
    pub udp_stream_ms: u64,
    pub icmp_ms: u64,
    pub generic_ms: u64,
}

impl TrackerSettings {
    /// Derive settings from a validated configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            checksum: config.table.checksum,
            acct: config.accounting.acct,
            timestamp: config.accounting.timestamp,
            tcp_loose: config.tcp.loose,
            tcp_be_liberal: config.tcp.be_liberal,
            tcp_max_retrans: config.tcp.max_retrans,
            tcp_timeouts: TcpTimeouts::from_config(&config.tcp.timeouts),
            udp_unreplied_ms: duration_ms(config.udp.timeout_unreplied()),
            udp_stream_ms: duration_ms(config.udp.timeout_stream()),
            icmp_ms: duration_ms(config.icmp.timeout()),
            generic_ms: duration_ms(config.generic.timeout()),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Which worker list a connection sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListKind {
    Unconfirmed,
    Dying,
}

/// Position of a connection in its namespace's worker lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListSlot {
    pub kind: ListKind,
    pub worker: usize,
}

#[derive(Debug, Default)]
struct WorkerLists {
    unconfirmed: HashMap<u64, Weak<Connection>>,
    dying: HashMap<u64, Weak<Connection>>,
}

impl WorkerLists {
    fn list_mut(&mut self, kind: ListKind) -> &mut HashMap<u64, Weak<Connection>> {
        match kind {
            ListKind::Unconfirmed => &mut self.unconfirmed,
            ListKind::Dying => &mut self.dying,
        }
    }
}

/// A network namespace as seen by the tracker
#[derive(Debug)]
pub struct Namespace {
    id: u32,
    hash_mix: u32,
    count: AtomicUsize,
    stats: NamespaceStats,
    settings: ArcSwap<TrackerSettings>,
    workers: Box<[Mutex<WorkerLists>]>,
}

impl Namespace {
    /// Create a namespace with `workers` unconfirmed/dying list pairs
    #[must_use]
    pub fn new(id: u32, settings: TrackerSettings, workers: usize) -> Arc<Self> {
        let workers = (0..workers.max(1))
            .map(|_| Mutex::new(WorkerLists::default()))
            .collect();
        Arc::new(Self {
            id,
            hash_mix: rand::random(),
            count: AtomicUsize::new(0),
            stats: NamespaceStats::new(),
            settings: ArcSwap::from_pointee(settings),
            workers,
        })
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Per-namespace seed mixed into tuple hashes
    #[inline]
    #[must_use]
    pub const fn hash_mix(&self) -> u32 {
        self.hash_mix
    }

    /// Live connections: unconfirmed, confirmed and dying
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> &NamespaceStats {
        &self.stats
    }

    /// Statistics snapshot including the live count
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.id, self.count())
    }

    /// Tracker settings currently in effect
    #[inline]
    pub fn settings(&self) -> Guard<Arc<TrackerSettings>> {
        self.settings.load()
    }

    /// Swap in new tracker settings; packets already in flight finish with the old ones
    pub fn update_settings(&self, settings: TrackerSettings) {
        debug!(namespace = self.id, ?settings, "tracker settings updated");
        self.settings.store(Arc::new(settings));
    }

    /// Charge one connection against the live count, returning the new count
    pub(crate) fn charge(&self) -> usize {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn uncharge(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of per-worker list pairs
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Connections waiting for confirmation
    #[must_use]
    pub fn unconfirmed_count(&self) -> usize {
        self.workers.iter().map(|w| w.lock().unconfirmed.len()).sum()
    }

    /// Deleted connections still referenced somewhere
    #[must_use]
    pub fn dying_count(&self) -> usize {
        self.workers.iter().map(|w| w.lock().dying.len()).sum()
    }

    /// Publish a fresh connection on the calling worker's unconfirmed list
    pub(crate) fn add_unconfirmed(&self, conn: &Arc<Connection>) {
        self.place(conn, ListKind::Unconfirmed);
    }

    /// Move a connection to the calling worker's dying list
    pub(crate) fn add_dying(&self, conn: &Arc<Connection>) {
        self.place(conn, ListKind::Dying);
    }

    /// Take a connection off whatever list it is on
    pub(crate) fn remove_from_lists(&self, conn: &Connection) {
        let mut slot = conn.list_slot().lock();
        if let Some(old) = slot.take() {
            self.workers[old.worker]
                .lock()
                .list_mut(old.kind)
                .remove(&conn.id());
        }
    }

    fn place(&self, conn: &Arc<Connection>, kind: ListKind) {
        let worker = current_worker(self.workers.len());
        let mut slot = conn.list_slot().lock();
        if let Some(old) = slot.take() {
            self.workers[old.worker]
                .lock()
                .list_mut(old.kind)
                .remove(&conn.id());
        }
        self.workers[worker]
            .lock()
            .list_mut(kind)
            .insert(conn.id(), Arc::downgrade(conn));
        *slot = Some(ListSlot { kind, worker });
    }

    /// Called from `Connection::drop`, which owns the slot exclusively
    pub(crate) fn forget(&self, slot: ListSlot, id: u64) {
        if let Some(lists) = self.workers.get(slot.worker) {
            lists.lock().list_mut(slot.kind).remove(&id);
        }
    }

    /// Strong references to every unconfirmed connection
    ///
    /// Upgrades happen under each worker lock; the returned references are
    /// dropped by the caller after all locks are released.
    pub(crate) fn unconfirmed(&self) -> Vec<Arc<Connection>> {
        let mut out = Vec::new();
        for lists in self.workers.iter() {
            let lists = lists.lock();
            out.extend(lists.unconfirmed.values().filter_map(Weak::upgrade));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{Tuple, Zone};

    fn make_conn(ns: &Arc<Namespace>, port: u16) -> Arc<Connection> {
        let orig = Tuple::tcp(
            format!("10.0.0.1:{port}").parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        );
        ns.charge();
        Arc::new(Connection::new(
            Arc::clone(ns),
            Zone::DEFAULT,
            orig,
            orig.swapped(),
            &ns.settings(),
        ))
    }

    #[test]
    fn test_current_worker_is_stable() {
        let a = current_worker(4);
        let b = current_worker(4);
        assert_eq!(a, b);
        assert!(a < 4);
        assert_eq!(current_worker(0), 0);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.tcp.be_liberal = true;
        config.udp.timeout_stream_secs = 180;
        let settings = TrackerSettings::from_config(&config);
        assert!(settings.tcp_be_liberal);
        assert_eq!(settings.udp_stream_ms, 180_000);
        assert_eq!(settings.generic_ms, 600_000);
    }

    #[test]
    fn test_update_settings() {
        let ns = Namespace::new(1, TrackerSettings::default(), 2);
        assert!(ns.settings().tcp_loose);

        let mut settings = TrackerSettings::default();
        settings.tcp_loose = false;
        ns.update_settings(settings);
        assert!(!ns.settings().tcp_loose);
    }

    #[test]
    fn test_lists_track_membership() {
        let ns = Namespace::new(1, TrackerSettings::default(), 2);
        let conn = make_conn(&ns, 1000);

        ns.add_unconfirmed(&conn);
        assert_eq!(ns.unconfirmed_count(), 1);
        assert_eq!(ns.unconfirmed().len(), 1);

        ns.add_dying(&conn);
        assert_eq!(ns.unconfirmed_count(), 0);
        assert_eq!(ns.dying_count(), 1);

        ns.remove_from_lists(&conn);
        assert_eq!(ns.dying_count(), 0);
    }

    #[test]
    fn test_drop_unlinks_and_uncharges() {
        let ns = Namespace::new(1, TrackerSettings::default(), 1);
        let conn = make_conn(&ns, 1001);
        ns.add_unconfirmed(&conn);
        assert_eq!(ns.count(), 1);

        drop(conn);
        assert_eq!(ns.count(), 0);
        assert_eq!(ns.unconfirmed_count(), 0);
    }
}
