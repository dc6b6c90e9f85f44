//! Expected connections
//!
//! An application-level helper that learns about a future flow (an FTP data
//! channel, a SIP media stream) registers an [`Expectation`] against the
//! control connection. When the first packet of a matching flow arrives,
//! the new connection is tied to its master and classified `Related`.
//!
//! Expectations are bucketed by namespace, zone and destination; the
//! source side may be wildcarded through a [`TupleMask`].

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::conn::Connection;
use crate::error::ExpectationError;
use crate::netns::Namespace;
use crate::tuple::{Direction, L3Proto, Tuple, Zone};

static NEXT_EXPECT_ID: AtomicU64 = AtomicU64::new(1);

/// Which source fields an expectation compares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleMask {
    /// Compare the source address
    pub src_addr: bool,
    /// Bits of the source port to compare
    pub src_port: u16,
}

impl TupleMask {
    /// Every field must match
    pub const EXACT: Self = Self {
        src_addr: true,
        src_port: u16::MAX,
    };

    /// Known source address, any source port
    pub const ANY_PORT: Self = Self {
        src_addr: true,
        src_port: 0,
    };

    /// `tuple` matches `expected` under this mask
    #[must_use]
    pub fn matches(&self, expected: &Tuple, tuple: &Tuple) -> bool {
        expected.l3 == tuple.l3
            && expected.protonum == tuple.protonum
            && expected.dst == tuple.dst
            && expected.dst_port == tuple.dst_port
            && (!self.src_addr || expected.src == tuple.src)
            && (expected.src_port & self.src_port) == (tuple.src_port & self.src_port)
    }
}

/// Expectation flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExpectFlags(u32);

impl ExpectFlags {
    /// Survives being matched
    pub const PERMANENT: Self = Self(1 << 0);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A flow some master connection expects to see
#[derive(Debug)]
pub struct Expectation {
    id: u64,
    pub master: Arc<Connection>,
    /// Original-direction tuple of the expected flow
    pub tuple: Tuple,
    pub mask: TupleMask,
    pub zone: Zone,
    pub flags: ExpectFlags,
}

impl Expectation {
    #[must_use]
    pub fn new(master: Arc<Connection>, tuple: Tuple, mask: TupleMask) -> Self {
        let zone = master.zone();
        Self {
            id: NEXT_EXPECT_ID.fetch_add(1, Ordering::Relaxed),
            master,
            tuple: tuple.with_dir(Direction::Original),
            mask,
            zone,
            flags: ExpectFlags::default(),
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ExpectFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    fn key(&self) -> ExpectKey {
        ExpectKey::new(self.master.namespace().id(), &self.zone, &self.tuple)
    }

    fn same_as(&self, other: &Self) -> bool {
        self.mask == other.mask
            && self.mask.matches(&self.tuple, &other.tuple)
            && Arc::ptr_eq(&self.master, &other.master)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExpectKey {
    ns: u32,
    zone: u16,
    l3: L3Proto,
    protonum: u8,
    dst: IpAddr,
    dst_port: u16,
}

impl ExpectKey {
    fn new(ns: u32, zone: &Zone, tuple: &Tuple) -> Self {
        Self {
            ns,
            zone: zone.id_for(Direction::Original),
            l3: tuple.l3,
            protonum: tuple.protonum,
            dst: tuple.dst,
            dst_port: tuple.dst_port,
        }
    }
}

/// All registered expectations of an engine
#[derive(Debug, Default)]
pub struct ExpectationTable {
    buckets: DashMap<ExpectKey, Vec<Arc<Expectation>>>,
}

impl ExpectationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an expectation
    ///
    /// # Errors
    ///
    /// Returns `ExpectationError::MasterDying` when the master is being
    /// deleted and `ExpectationError::Duplicate` when the same master already
    /// expects the same flow.
    pub fn expect(&self, exp: Expectation) -> Result<Arc<Expectation>, ExpectationError> {
        if exp.master.is_dying() {
            return Err(ExpectationError::MasterDying { id: exp.master.id() });
        }
        let mut list = self.buckets.entry(exp.key()).or_default();
        if list.iter().any(|existing| existing.same_as(&exp)) {
            return Err(ExpectationError::Duplicate {
                tuple: exp.tuple.to_string(),
            });
        }
        debug!(
            expect_id = exp.id,
            master = exp.master.id(),
            tuple = %exp.tuple,
            "expectation registered"
        );
        let exp = Arc::new(exp);
        list.push(Arc::clone(&exp));
        Ok(exp)
    }

    /// First live expectation matching an original-direction tuple
    ///
    /// Expectations whose master is dying are discarded on the way. A
    /// matched expectation is consumed unless it is permanent.
    #[must_use]
    pub fn find_expectation(&self, ns: &Namespace, zone: &Zone, tuple: &Tuple) -> Option<Arc<Expectation>> {
        let key = ExpectKey::new(ns.id(), zone, tuple);
        let (found, empty) = {
            let mut list = self.buckets.get_mut(&key)?;
            list.retain(|exp| !exp.master.is_dying());
            let idx = list.iter().position(|exp| exp.mask.matches(&exp.tuple, tuple));
            let found = idx.map(|idx| {
                if list[idx].flags.contains(ExpectFlags::PERMANENT) {
                    Arc::clone(&list[idx])
                } else {
                    list.remove(idx)
                }
            });
            (found, list.is_empty())
        };
        if empty {
            self.buckets.remove_if(&key, |_, list| list.is_empty());
        }
        found
    }

    /// Drop every expectation of a master; returns how many went
    pub fn remove_for_master(&self, master: &Connection) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, list| {
            let before = list.len();
            list.retain(|exp| !std::ptr::eq(exp.master.as_ref(), master));
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Drop every expectation registered in a namespace
    pub fn remove_for_namespace(&self, ns_id: u32) -> usize {
        let mut removed = 0;
        self.buckets.retain(|key, list| {
            if key.ns == ns_id {
                removed += list.len();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of registered expectations
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|entry| entry.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Status;
    use crate::netns::TrackerSettings;

    fn master(ns: &Arc<Namespace>) -> Arc<Connection> {
        let settings = TrackerSettings::default();
        let orig = Tuple::tcp("10.0.0.1:40000".parse().unwrap(), "10.0.0.2:21".parse().unwrap());
        ns.charge();
        Arc::new(Connection::new(Arc::clone(ns), Zone::DEFAULT, orig, orig.swapped(), &settings))
    }

    fn data_channel(src_port: u16) -> Tuple {
        Tuple::tcp(
            format!("10.0.0.1:{src_port}").parse().unwrap(),
            "10.0.0.2:20000".parse().unwrap(),
        )
    }

    #[test]
    fn test_expect_and_consume() {
        let ns = Namespace::new(1, TrackerSettings::default(), 1);
        let table = ExpectationTable::new();
        table
            .expect(Expectation::new(master(&ns), data_channel(0), TupleMask::ANY_PORT))
            .unwrap();
        assert_eq!(table.len(), 1);

        let found = table.find_expectation(&ns, &Zone::DEFAULT, &data_channel(41000));
        assert!(found.is_some());
        assert!(table.is_empty());
        assert!(table.find_expectation(&ns, &Zone::DEFAULT, &data_channel(41000)).is_none());
    }

    #[test]
    fn test_permanent_survives_match() {
        let ns = Namespace::new(1, TrackerSettings::default(), 1);
        let table = ExpectationTable::new();
        table
            .expect(
                Expectation::new(master(&ns), data_channel(0), TupleMask::ANY_PORT)
                    .with_flags(ExpectFlags::PERMANENT),
            )
            .unwrap();
        assert!(table.find_expectation(&ns, &Zone::DEFAULT, &data_channel(1)).is_some());
        assert!(table.find_expectation(&ns, &Zone::DEFAULT, &data_channel(2)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_exact_mask_and_other_namespace() {
        let ns = Namespace::new(1, TrackerSettings::default(), 1);
        let other = Namespace::new(2, TrackerSettings::default(), 1);
        let table = ExpectationTable::new();
        table
            .expect(Expectation::new(master(&ns), data_channel(41000), TupleMask::EXACT))
            .unwrap();

        assert!(table.find_expectation(&ns, &Zone::DEFAULT, &data_channel(41001)).is_none());
        assert!(table.find_expectation(&other, &Zone::DEFAULT, &data_channel(41000)).is_none());
        assert!(table.find_expectation(&ns, &Zone::DEFAULT, &data_channel(41000)).is_some());
    }

    #[test]
    fn test_duplicate_and_dying_master_rejected() {
        let ns = Namespace::new(1, TrackerSettings::default(), 1);
        let table = ExpectationTable::new();
        let m = master(&ns);
        table
            .expect(Expectation::new(Arc::clone(&m), data_channel(0), TupleMask::ANY_PORT))
            .unwrap();
        assert!(matches!(
            table.expect(Expectation::new(Arc::clone(&m), data_channel(0), TupleMask::ANY_PORT)),
            Err(ExpectationError::Duplicate { .. })
        ));

        m.set_status(Status::DYING);
        assert!(matches!(
            table.expect(Expectation::new(Arc::clone(&m), data_channel(5), TupleMask::EXACT)),
            Err(ExpectationError::MasterDying { .. })
        ));
        // Dying masters' expectations are discarded on lookup
        assert!(table.find_expectation(&ns, &Zone::DEFAULT, &data_channel(9)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_for_master_and_namespace() {
        let ns = Namespace::new(1, TrackerSettings::default(), 1);
        let table = ExpectationTable::new();
        let m = master(&ns);
        table
            .expect(Expectation::new(Arc::clone(&m), data_channel(0), TupleMask::ANY_PORT))
            .unwrap();
        table
            .expect(Expectation::new(master(&ns), data_channel(7), TupleMask::EXACT))
            .unwrap();

        assert_eq!(table.remove_for_master(&m), 1);
        assert_eq!(table.remove_for_namespace(1), 1);
        assert!(table.is_empty());
    }
}
