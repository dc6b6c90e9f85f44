//! Tracked connections
//!
//! A [`Connection`] is shared through `Arc`. The flow table holds one
//! reference per inserted direction, a packet holds one while it is being
//! classified, and worker lists only hold weak references. Upgrading a weak
//! reference fails once the last strong reference is gone, which gives the
//! increment-if-nonzero rule lookups need.
//!
//! The timeout field changes meaning at confirmation: before, it holds the
//! relative extension the tracker asked for; from confirmation on, it is an
//! absolute deadline on the engine clock.

pub mod ext;

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::trace;

use crate::netns::{ListSlot, Namespace, TrackerSettings};
use crate::proto::tcp::TcpState;
use crate::proto::ProtoState;
use crate::tuple::{Direction, Tuple, Zone};

pub use ext::{AcctSnapshot, Accounting, Timestamp};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Connection status bits
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Status(u32);

impl Status {
    /// Child of an expectation
    pub const EXPECTED: Self = Self(1 << 0);
    /// Traffic seen in the reply direction
    pub const SEEN_REPLY: Self = Self(1 << 1);
    /// Protected from early drop
    pub const ASSURED: Self = Self(1 << 2);
    /// Inserted into the flow table
    pub const CONFIRMED: Self = Self(1 << 3);
    pub const SRC_NAT: Self = Self(1 << 4);
    pub const DST_NAT: Self = Self(1 << 5);
    pub const SRC_NAT_DONE: Self = Self(1 << 7);
    pub const DST_NAT_DONE: Self = Self(1 << 8);
    /// Deleted; waiting for the last reference to go away
    pub const DYING: Self = Self(1 << 9);
    /// Timeout is never refreshed
    pub const FIXED_TIMEOUT: Self = Self(1 << 10);
    pub const TEMPLATE: Self = Self(1 << 11);
    /// Owned by a fast path
    pub const OFFLOAD: Self = Self(1 << 14);
    /// Exempt from the security label collaborator
    pub const SECMARK_SKIP: Self = Self(1 << 16);

    pub const NAT_DONE_MASK: Self = Self(Self::SRC_NAT_DONE.0 | Self::DST_NAT_DONE.0);

    const NAMES: [(Self, &'static str); 13] = [
        (Self::EXPECTED, "EXPECTED"),
        (Self::SEEN_REPLY, "SEEN_REPLY"),
        (Self::ASSURED, "ASSURED"),
        (Self::CONFIRMED, "CONFIRMED"),
        (Self::SRC_NAT, "SRC_NAT"),
        (Self::DST_NAT, "DST_NAT"),
        (Self::SRC_NAT_DONE, "SRC_NAT_DONE"),
        (Self::DST_NAT_DONE, "DST_NAT_DONE"),
        (Self::DYING, "DYING"),
        (Self::FIXED_TIMEOUT, "FIXED_TIMEOUT"),
        (Self::TEMPLATE, "TEMPLATE"),
        (Self::OFFLOAD, "OFFLOAD"),
        (Self::SECMARK_SKIP, "SECMARK_SKIP"),
    ];

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// All bits of `other` are set
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Status {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (bit, name) in Self::NAMES {
            if self.contains(bit) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// A tracked flow
pub struct Connection {
    id: u64,
    ns: Arc<Namespace>,
    zone: Zone,
    tuples: RwLock<[Tuple; 2]>,
    status: AtomicU32,
    timeout: AtomicU64,
    master: OnceLock<Arc<Connection>>,
    mark: AtomicU32,
    secmark: AtomicU32,
    proto: Mutex<ProtoState>,
    acct: Option<Accounting>,
    tstamp: Option<Timestamp>,
    list: Mutex<Option<ListSlot>>,
}

impl Connection {
    /// Build an unconfirmed record; the caller has already charged `ns`
    pub(crate) fn new(
        ns: Arc<Namespace>,
        zone: Zone,
        orig: Tuple,
        reply: Tuple,
        settings: &TrackerSettings,
    ) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            ns,
            zone,
            tuples: RwLock::new([
                orig.with_dir(Direction::Original),
                reply.with_dir(Direction::Reply),
            ]),
            status: AtomicU32::new(0),
            timeout: AtomicU64::new(0),
            master: OnceLock::new(),
            mark: AtomicU32::new(0),
            secmark: AtomicU32::new(0),
            proto: Mutex::new(ProtoState::None),
            acct: settings.acct.then(Accounting::default),
            tstamp: settings.timestamp.then(Timestamp::default),
            list: Mutex::new(None),
        }
    }

    /// Process-unique identifier
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    #[inline]
    #[must_use]
    pub const fn zone(&self) -> Zone {
        self.zone
    }

    /// Tuple for one direction
    #[must_use]
    pub fn tuple(&self, dir: Direction) -> Tuple {
        self.tuples.read()[dir.index()]
    }

    /// Both tuples, original first
    #[must_use]
    pub fn tuples(&self) -> [Tuple; 2] {
        *self.tuples.read()
    }

    pub(crate) fn set_reply_tuple(&self, reply: Tuple) {
        self.tuples.write()[Direction::Reply.index()] = reply.with_dir(Direction::Reply);
    }

    /// Transport protocol number
    #[must_use]
    pub fn protonum(&self) -> u8 {
        self.tuples.read()[0].protonum
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> Status {
        Status(self.status.load(Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn test(&self, bits: Status) -> bool {
        self.status().contains(bits)
    }

    pub fn set_status(&self, bits: Status) {
        self.status.fetch_or(bits.0, Ordering::AcqRel);
    }

    pub fn clear_status(&self, bits: Status) {
        self.status.fetch_and(!bits.0, Ordering::AcqRel);
    }

    /// Set `bits`, returning whether all of them were already set
    pub fn test_and_set(&self, bits: Status) -> bool {
        Status(self.status.fetch_or(bits.0, Ordering::AcqRel)).contains(bits)
    }

    #[inline]
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.test(Status::CONFIRMED)
    }

    #[inline]
    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.test(Status::DYING)
    }

    #[inline]
    #[must_use]
    pub fn is_assured(&self) -> bool {
        self.test(Status::ASSURED)
    }

    /// Raw timeout field: relative before confirmation, absolute after
    #[must_use]
    pub fn timeout_raw(&self) -> u64 {
        self.timeout.load(Ordering::Acquire)
    }

    /// Confirmed and past its deadline
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.is_confirmed() && self.timeout_raw() <= now_ms
    }

    /// Milliseconds left before expiry
    #[must_use]
    pub fn expires_in(&self, now_ms: u64) -> u64 {
        if self.is_confirmed() {
            self.timeout_raw().saturating_sub(now_ms)
        } else {
            self.timeout_raw()
        }
    }

    /// Extend the lifetime to `extra_ms` from now
    pub fn refresh(&self, now_ms: u64, extra_ms: u64) {
        if self.test(Status::FIXED_TIMEOUT) {
            return;
        }
        let value = if self.is_confirmed() {
            now_ms.saturating_add(extra_ms)
        } else {
            extra_ms
        };
        if self.timeout.load(Ordering::Relaxed) != value {
            self.timeout.store(value, Ordering::Release);
        }
    }

    /// Turn the relative timeout into a deadline; only at confirmation
    pub(crate) fn rebase_timeout(&self, now_ms: u64) {
        self.timeout.fetch_add(now_ms, Ordering::AcqRel);
    }

    /// Force the deadline to `deadline_ms`; used when a collaborator expires a flow
    pub fn set_deadline(&self, deadline_ms: u64) {
        self.timeout.store(deadline_ms, Ordering::Release);
    }

    /// Parent flow for expectation children
    #[must_use]
    pub fn master(&self) -> Option<&Arc<Connection>> {
        self.master.get()
    }

    pub(crate) fn set_master(&self, master: Arc<Connection>) {
        if self.master.set(master).is_err() {
            trace!(conn_id = self.id, "master already set");
        }
    }

    #[must_use]
    pub fn mark(&self) -> u32 {
        self.mark.load(Ordering::Relaxed)
    }

    pub fn set_mark(&self, mark: u32) {
        self.mark.store(mark, Ordering::Relaxed);
    }

    #[must_use]
    pub fn secmark(&self) -> u32 {
        self.secmark.load(Ordering::Relaxed)
    }

    pub fn set_secmark(&self, secmark: u32) {
        self.secmark.store(secmark, Ordering::Relaxed);
    }

    /// Packet/byte counters, when accounting is enabled
    #[must_use]
    pub fn acct(&self) -> Option<&Accounting> {
        self.acct.as_ref()
    }

    /// Lifetime timestamps, when enabled
    #[must_use]
    pub fn tstamp(&self) -> Option<&Timestamp> {
        self.tstamp.as_ref()
    }

    /// Count a packet against the accounting extension
    pub(crate) fn account(&self, dir: Direction, len: usize) {
        if let Some(acct) = &self.acct {
            acct.add(dir, len);
        }
    }

    /// Lock the protocol sub-state
    pub(crate) fn proto(&self) -> MutexGuard<'_, ProtoState> {
        self.proto.lock()
    }

    /// Copy of the protocol sub-state
    #[must_use]
    pub fn proto_state(&self) -> ProtoState {
        self.proto.lock().clone()
    }

    /// TCP state, for TCP connections
    #[must_use]
    pub fn tcp_state(&self) -> Option<TcpState> {
        match &*self.proto.lock() {
            ProtoState::Tcp(tcp) => Some(tcp.state),
            _ => None,
        }
    }

    pub(crate) fn list_slot(&self) -> &Mutex<Option<ListSlot>> {
        &self.list
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tuples = self.tuples();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("namespace", &self.ns.id())
            .field("zone", &self.zone)
            .field("orig", &format_args!("{}", tuples[0]))
            .field("reply", &format_args!("{}", tuples[1]))
            .field("status", &self.status())
            .field("timeout", &self.timeout_raw())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(slot) = self.list.get_mut().take() {
            self.ns.forget(slot, self.id);
        }
        if let Some(ts) = &self.tstamp {
            ts.stop();
        }
        self.ns.uncharge();
        trace!(conn_id = self.id, namespace = self.ns.id(), "connection destroyed");
    }
}
