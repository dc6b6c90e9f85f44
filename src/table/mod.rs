//! The flow table
//!
//! A fixed-but-resizable array of buckets, each holding the [`TupleHash`]
//! nodes that hashed there. Every confirmed connection has exactly two
//! nodes, one per direction, possibly in different buckets.
//!
//! Buckets are immutable snapshots behind [`ArcSwap`]: lookups load the
//! current array and bucket without any lock, writers replace a bucket's
//! node list under its stripe lock. A lookup that misses while the
//! generation moved (a resize ran) restarts, because the entry it wanted
//! may only exist in the new array.

mod hash;
mod locks;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::config::MIN_HASHSIZE;
use crate::conn::Connection;
use crate::error::TableError;
use crate::netns::Namespace;
use crate::tuple::{Direction, Tuple, Zone};

pub use hash::{hash_tuple, scale};
pub use locks::{PairGuard, StripeLocks, CONNTRACK_LOCKS};

/// One direction of a connection as stored in a bucket
#[derive(Debug, Clone)]
pub struct TupleHash {
    /// Tuple for this direction; `tuple.dir` says which
    pub tuple: Tuple,
    pub conn: Arc<Connection>,
}

impl TupleHash {
    /// Same namespace, same zone for this node's direction, equal tuple, confirmed
    #[must_use]
    pub fn matches(&self, tuple: &Tuple, zone: &Zone, ns: &Namespace) -> bool {
        self.tuple == *tuple
            && self.conn.zone().equal_for(zone, self.tuple.dir)
            && self.conn.is_confirmed()
            && std::ptr::eq(self.conn.namespace().as_ref(), ns)
    }
}

type Bucket = Arc<Vec<TupleHash>>;

struct BucketArray {
    buckets: Box<[ArcSwap<Vec<TupleHash>>]>,
}

impl BucketArray {
    fn empty(size: usize) -> Self {
        let empty: Bucket = Arc::new(Vec::new());
        Self {
            buckets: (0..size).map(|_| ArcSwap::new(Arc::clone(&empty))).collect(),
        }
    }

    fn from_lists(lists: Vec<Vec<TupleHash>>) -> Self {
        let empty: Bucket = Arc::new(Vec::new());
        Self {
            buckets: lists
                .into_iter()
                .map(|list| {
                    if list.is_empty() {
                        ArcSwap::new(Arc::clone(&empty))
                    } else {
                        ArcSwap::from_pointee(list)
                    }
                })
                .collect(),
        }
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }

    fn push(&self, idx: usize, node: TupleHash) -> usize {
        let current = self.buckets[idx].load_full();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(node);
        let len = next.len();
        self.buckets[idx].store(Arc::new(next));
        len
    }

    fn remove(&self, idx: usize, conn: &Connection) -> usize {
        let current = self.buckets[idx].load_full();
        let before = current.len();
        let next: Vec<TupleHash> = current
            .iter()
            .filter(|node| !std::ptr::eq(node.conn.as_ref(), conn))
            .cloned()
            .collect();
        let removed = before - next.len();
        if removed > 0 {
            self.buckets[idx].store(Arc::new(next));
        }
        removed
    }
}

/// Hash of a connection's tuple for one direction
#[must_use]
pub fn conn_hash(conn: &Connection, dir: Direction) -> u32 {
    hash_tuple(
        &conn.tuple(dir),
        conn.zone().id_for(dir),
        conn.namespace().hash_mix(),
    )
}

/// Sharded, resizable hash table of connections
pub struct FlowTable {
    array: ArcSwap<BucketArray>,
    locks: StripeLocks,
    entries: AtomicUsize,
}

/// Both buckets of a connection, locked
pub struct LockedPair<'a> {
    _guard: PairGuard<'a>,
    array: Arc<BucketArray>,
    orig: usize,
    reply: usize,
    entries: &'a AtomicUsize,
}

impl LockedPair<'_> {
    /// Bucket index of the original tuple
    #[must_use]
    pub const fn orig_index(&self) -> usize {
        self.orig
    }

    /// Bucket index of the reply tuple
    #[must_use]
    pub const fn reply_index(&self) -> usize {
        self.reply
    }

    /// Nodes currently in the original tuple's bucket
    #[must_use]
    pub fn orig_bucket(&self) -> Bucket {
        self.array.buckets[self.orig].load_full()
    }

    /// Nodes currently in the reply tuple's bucket
    #[must_use]
    pub fn reply_bucket(&self) -> Bucket {
        self.array.buckets[self.reply].load_full()
    }

    /// Publish both nodes of `conn`; the caller has set every field lookups read
    pub fn insert(&self, conn: &Arc<Connection>) {
        let [orig, reply] = conn.tuples();
        self.array.push(
            self.orig,
            TupleHash {
                tuple: orig,
                conn: Arc::clone(conn),
            },
        );
        self.array.push(
            self.reply,
            TupleHash {
                tuple: reply,
                conn: Arc::clone(conn),
            },
        );
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Unpublish both nodes of `conn`; false if it was not in the table
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut removed = self.array.remove(self.orig, conn);
        if self.reply != self.orig {
            removed += self.array.remove(self.reply, conn);
        }
        if removed > 0 {
            self.entries.fetch_sub(1, Ordering::Relaxed);
        }
        removed > 0
    }
}

impl FlowTable {
    /// Create a table with `size` buckets
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            array: ArcSwap::from_pointee(BucketArray::empty(size.max(1))),
            locks: StripeLocks::new(),
            entries: AtomicUsize::new(0),
        }
    }

    /// Current bucket count
    #[must_use]
    pub fn size(&self) -> usize {
        self.array.load().len()
    }

    /// Confirmed connections in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn locks(&self) -> &StripeLocks {
        &self.locks
    }

    /// Snapshot of one bucket of the current array; `None` past the end
    #[must_use]
    pub fn bucket(&self, idx: usize) -> Option<Bucket> {
        self.array.load().buckets.get(idx).map(|b| b.load_full())
    }

    /// Lockless lookup of a confirmed, live connection
    ///
    /// Expired entries passed over are handed to `reap`. Dying entries are
    /// skipped. Returns the connection and the direction `tuple` matched.
    pub fn find(
        &self,
        ns: &Namespace,
        zone: &Zone,
        tuple: &Tuple,
        hash: u32,
        now_ms: u64,
        mut reap: impl FnMut(&Arc<Connection>),
    ) -> Option<(Arc<Connection>, Direction)> {
        loop {
            let start = self.locks.read_begin();
            let array = self.array.load();
            let bucket = array.buckets[scale(hash, array.len())].load();

            for node in bucket.iter() {
                if node.conn.is_expired(now_ms) {
                    reap(&node.conn);
                    continue;
                }
                if node.conn.is_dying() {
                    continue;
                }
                if node.matches(tuple, zone, ns) {
                    return Some((Arc::clone(&node.conn), node.tuple.dir));
                }
            }

            if !self.locks.read_retry(start) {
                return None;
            }
            ns.stats().record_search_restart();
        }
    }

    /// Lock the buckets of two hashes against the current array
    pub fn lock_pair(&self, orig_hash: u32, reply_hash: u32) -> LockedPair<'_> {
        loop {
            let start = self.locks.read_begin();
            let array = self.array.load_full();
            let orig = scale(orig_hash, array.len());
            let reply = scale(reply_hash, array.len());
            if let Some(guard) = self.locks.lock_two(orig, reply, start) {
                return LockedPair {
                    _guard: guard,
                    array,
                    orig,
                    reply,
                    entries: &self.entries,
                };
            }
        }
    }

    /// Lock the buckets a connection hashes to
    pub fn lock_conn(&self, conn: &Connection) -> LockedPair<'_> {
        self.lock_pair(
            conn_hash(conn, Direction::Original),
            conn_hash(conn, Direction::Reply),
        )
    }

    /// Remove both nodes of a connection
    pub fn unlink(&self, conn: &Connection) -> bool {
        self.lock_conn(conn).remove(conn)
    }

    /// Original-direction node of every connection in the table
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let array = self.array.load();
        array
            .buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .load()
                    .iter()
                    .filter(|node| node.tuple.dir == Direction::Original)
                    .map(|node| Arc::clone(&node.conn))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Rebuild the table with `new_size` buckets, returning the old size
    ///
    /// # Errors
    ///
    /// Returns `TableError::InvalidSize` below the minimum bucket count.
    pub fn resize(&self, new_size: usize) -> Result<usize, TableError> {
        if new_size < MIN_HASHSIZE {
            return Err(TableError::InvalidSize {
                size: new_size,
                min: MIN_HASHSIZE,
            });
        }

        let guard = self.locks.lock_all();
        let old = self.array.load_full();
        let old_size = old.len();
        if old_size == new_size {
            self.locks.end_write(guard);
            return Ok(old_size);
        }

        let mut lists: Vec<Vec<TupleHash>> = vec![Vec::new(); new_size];
        let mut moved = 0usize;
        for bucket in old.buckets.iter() {
            for node in bucket.load().iter() {
                let hash = hash_tuple(
                    &node.tuple,
                    node.conn.zone().id_for(node.tuple.dir),
                    node.conn.namespace().hash_mix(),
                );
                lists[scale(hash, new_size)].push(node.clone());
                moved += 1;
            }
        }
        self.array.store(Arc::new(BucketArray::from_lists(lists)));
        self.locks.end_write(guard);
        drop(old);

        info!(old_size, new_size, nodes = moved, "flow table resized");
        Ok(old_size)
    }
}

impl FlowTable {
    /// Longest bucket chain, for diagnostics
    #[must_use]
    pub fn longest_chain(&self) -> usize {
        let array = self.array.load();
        let longest = array
            .buckets
            .iter()
            .map(|b| b.load().len())
            .max()
            .unwrap_or(0);
        debug!(size = array.len(), longest, "chain length scan");
        longest
    }
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("size", &self.size())
            .field("entries", &self.len())
            .field("generation", &self.locks.generation())
            .finish()
    }
}
