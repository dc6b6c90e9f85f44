//! Early drop: making room when a namespace is at capacity

use std::sync::atomic::Ordering;

use tracing::debug;

use super::Conntrack;
use crate::conn::Status;
use crate::netns::Namespace;
use crate::table::scale;

/// Buckets scanned from the new flow's bucket onwards
pub const EARLY_DROP_BUCKETS: usize = 8;

impl Conntrack {
    /// Evict one connection of `ns` near the bucket `hash` maps to
    ///
    /// Assured, offloaded, dying and unconfirmed connections are never
    /// chosen. Expired entries met on the way are reaped but do not count
    /// as an eviction. Returns whether a connection was evicted.
    pub(super) fn early_drop(&self, ns: &Namespace, hash: u32) -> bool {
        let now = self.now_ms();
        let size = self.table.size();
        let first = scale(hash, size);

        for step in 0..EARLY_DROP_BUCKETS.min(size) {
            let idx = (first + step) % size;
            let Some(bucket) = self.table.bucket(idx) else {
                continue;
            };
            for node in bucket.iter() {
                let conn = &node.conn;
                if conn.test(Status::OFFLOAD) {
                    continue;
                }
                if conn.is_expired(now) {
                    self.reap_expired(conn, now);
                    continue;
                }
                if conn.is_assured()
                    || conn.is_dying()
                    || !conn.is_confirmed()
                    || !std::ptr::eq(conn.namespace().as_ref(), ns)
                {
                    continue;
                }
                if self.delete(conn) {
                    ns.stats().record_early_drop();
                    debug!(conn_id = conn.id(), bucket = idx, "early drop");
                    return true;
                }
            }
        }
        false
    }

    /// An admission failed; GC should evict harder on its next pass
    pub(crate) fn set_pressure(&self) {
        self.gc_pressure.store(true, Ordering::Relaxed);
    }

    pub(crate) fn under_pressure(&self) -> bool {
        self.gc_pressure.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_pressure(&self) {
        self.gc_pressure.store(false, Ordering::Relaxed);
    }
}
