//! Optional connection extensions: accounting and timestamps

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::clock::unix_millis;
use crate::tuple::Direction;

/// Per-direction packet and byte counters
#[derive(Debug, Default)]
pub struct Accounting {
    packets: [AtomicU64; 2],
    bytes: [AtomicU64; 2],
}

impl Accounting {
    /// Count one packet of `len` bytes travelling in `dir`
    pub fn add(&self, dir: Direction, len: usize) {
        self.packets[dir.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes[dir.index()].fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Fold the bytes another record saw in `dir` into this one as a single packet
    pub fn merge_from(&self, other: &Self, dir: Direction) {
        let bytes = other.bytes[dir.index()].load(Ordering::Relaxed);
        self.packets[dir.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes[dir.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn packets(&self, dir: Direction) -> u64 {
        self.packets[dir.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes(&self, dir: Direction) -> u64 {
        self.bytes[dir.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> AcctSnapshot {
        AcctSnapshot {
            orig_packets: self.packets(Direction::Original),
            orig_bytes: self.bytes(Direction::Original),
            reply_packets: self.packets(Direction::Reply),
            reply_bytes: self.bytes(Direction::Reply),
        }
    }
}

/// Serializable view of [`Accounting`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcctSnapshot {
    pub orig_packets: u64,
    pub orig_bytes: u64,
    pub reply_packets: u64,
    pub reply_bytes: u64,
}

/// Wall-clock lifetime of a confirmed connection, in Unix milliseconds
#[derive(Debug, Default)]
pub struct Timestamp {
    start: AtomicU64,
    stop: AtomicU64,
}

impl Timestamp {
    pub(crate) fn start(&self) {
        self.start.store(unix_millis(), Ordering::Relaxed);
    }

    pub(crate) fn stop(&self) {
        self.stop.store(unix_millis(), Ordering::Relaxed);
    }

    /// Set at confirmation; 0 before
    #[must_use]
    pub fn started_ms(&self) -> u64 {
        self.start.load(Ordering::Relaxed)
    }

    /// Set at destruction; 0 before
    #[must_use]
    pub fn stopped_ms(&self) -> u64 {
        self.stop.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounting_per_direction() {
        let acct = Accounting::default();
        acct.add(Direction::Original, 60);
        acct.add(Direction::Original, 1500);
        acct.add(Direction::Reply, 40);

        let snap = acct.snapshot();
        assert_eq!(snap.orig_packets, 2);
        assert_eq!(snap.orig_bytes, 1560);
        assert_eq!(snap.reply_packets, 1);
        assert_eq!(snap.reply_bytes, 40);
    }

    #[test]
    fn test_accounting_merge() {
        let winner = Accounting::default();
        let loser = Accounting::default();
        winner.add(Direction::Original, 100);
        loser.add(Direction::Original, 80);

        winner.merge_from(&loser, Direction::Original);
        assert_eq!(winner.packets(Direction::Original), 2);
        assert_eq!(winner.bytes(Direction::Original), 180);
        assert_eq!(winner.bytes(Direction::Reply), 0);
    }

    #[test]
    fn test_timestamp_lifecycle() {
        let ts = Timestamp::default();
        assert_eq!(ts.started_ms(), 0);
        ts.start();
        ts.stop();
        assert!(ts.started_ms() > 0);
        assert!(ts.stopped_ms() >= ts.started_ms());
    }
}
