//! Connection tracking statistics
//!
//! Per-namespace counters mirroring what the packet path, the confirm step,
//! eviction and GC did. All updates are relaxed atomics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::clock::unix_millis;

/// Atomic per-namespace statistics
#[derive(Debug, Default)]
pub struct NamespaceStats {
    /// Lookups that hit an existing connection
    found: AtomicU64,
    /// Packets classified invalid
    invalid: AtomicU64,
    /// Connections confirmed into the table
    insert: AtomicU64,
    /// Confirmations that failed (clash drop, dying, chain too long)
    insert_failed: AtomicU64,
    /// Packets dropped for resource reasons
    drop: AtomicU64,
    /// Connections evicted to admit new ones
    early_drop: AtomicU64,
    /// Packets rejected by a tracker's error check
    error: AtomicU64,
    /// Connections created from an expectation
    expect_new: AtomicU64,
    /// Confirm races resolved by merging into the winner
    clash_resolve: AtomicU64,
    /// Lookups restarted because the table was resized underneath them
    search_restart: AtomicU64,
    /// Inserts refused because a bucket chain was too long
    chaintoolong: AtomicU64,
    /// Expired connections reclaimed by lookup or GC
    expired: AtomicU64,
}

impl NamespaceStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_found(&self) {
        self.found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self) {
        self.insert.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert_failed(&self) {
        self.insert_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drop.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_drop(&self) {
        self.early_drop.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expect_new(&self) {
        self.expect_new.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clash_resolve(&self) {
        self.clash_resolve.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_search_restart(&self) {
        self.search_restart.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chaintoolong(&self) {
        self.chaintoolong.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn found(&self) -> u64 {
        self.found.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn invalid(&self) -> u64 {
        self.invalid.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn insert(&self) -> u64 {
        self.insert.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn insert_failed(&self) -> u64 {
        self.insert_failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.drop.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn early_drop(&self) -> u64 {
        self.early_drop.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn error(&self) -> u64 {
        self.error.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn expect_new(&self) -> u64 {
        self.expect_new.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn clash_resolve(&self) -> u64 {
        self.clash_resolve.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn search_restart(&self) -> u64 {
        self.search_restart.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn chaintoolong(&self) -> u64 {
        self.chaintoolong.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self, namespace: u32, count: usize) -> StatsSnapshot {
        StatsSnapshot {
            namespace,
            count: count as u64,
            found: self.found(),
            invalid: self.invalid(),
            insert: self.insert(),
            insert_failed: self.insert_failed(),
            drop: self.drop_count(),
            early_drop: self.early_drop(),
            error: self.error(),
            expect_new: self.expect_new(),
            clash_resolve: self.clash_resolve(),
            search_restart: self.search_restart(),
            chaintoolong: self.chaintoolong(),
            expired: self.expired(),
            timestamp_ms: unix_millis(),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.found,
            &self.invalid,
            &self.insert,
            &self.insert_failed,
            &self.drop,
            &self.early_drop,
            &self.error,
            &self.expect_new,
            &self.clash_resolve,
            &self.search_restart,
            &self.chaintoolong,
            &self.expired,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Serializable snapshot of namespace statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub namespace: u32,
    /// Live connections (confirmed, unconfirmed and dying)
    pub count: u64,
    pub found: u64,
    pub invalid: u64,
    pub insert: u64,
    pub insert_failed: u64,
    pub drop: u64,
    pub early_drop: u64,
    pub error: u64,
    pub expect_new: u64,
    pub clash_resolve: u64,
    pub search_restart: u64,
    pub chaintoolong: u64,
    pub expired: u64,
    pub timestamp_ms: u64,
}
