//! The connection tracking engine
//!
//! [`Conntrack`] ties the flow table, the protocol trackers, the
//! expectation table and the namespaces together behind one entry point,
//! [`Conntrack::classify`]. Everything on the packet path is synchronous and
//! non-blocking; rejections become a [`Verdict`], never an `Err`.
//!
//! # Hook placement
//!
//! ```text
//! PRE_ROUTING ─► classify ─► (routing) ─► LOCAL_IN ─► confirm
//!                                   └──► FORWARD ─► POST_ROUTING ─► confirm
//! LOCAL_OUT ──► classify ─► label ──────────────────► POST_ROUTING ─► confirm
//! ```
//!
//! # Example
//!
//! ```
//! use rust_conntrack::{Config, Conntrack, Hook, L3Proto, TcpSegment, Verdict};
//!
//! let engine = Conntrack::builder(Config::default()).build().unwrap();
//! let ns = engine.namespace(0);
//! let mut syn = TcpSegment::new("10.0.0.1:40000".parse().unwrap(), "10.0.0.2:80".parse().unwrap())
//!     .syn()
//!     .seq(100)
//!     .build();
//!
//! assert_eq!(engine.classify(&ns, L3Proto::Ipv4, Hook::PreRouting, &mut syn), Verdict::Accept);
//! assert_eq!(engine.classify(&ns, L3Proto::Ipv4, Hook::PostRouting, &mut syn), Verdict::Accept);
//! assert_eq!(engine.table().len(), 1);
//! ```

mod clash;
mod evict;
mod hooks;
mod lifecycle;

use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::conn::{Connection, Status};
use crate::error::ConfigError;
use crate::expect::ExpectationTable;
use crate::netns::{Namespace, TrackerSettings};
use crate::packet::{l4_offset_and_proto, CtInfo, Hook, Packet, Verdict};
use crate::proto::{
    ErrorCheck, ErrorCtx, L4Tracker, PacketCtx, PacketView, Timeouts, TrackAction, TrackerRegistry,
};
use crate::stats::StatsSnapshot;
use crate::table::{hash_tuple, FlowTable};
use crate::tuple::{Direction, L3Proto, Tuple, Zone};

pub use evict::EARLY_DROP_BUCKETS;
pub use hooks::{FastPath, LabelDecision, SecurityLabel};

type DiagLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Table-full warnings allowed in a burst before the one-per-second limit applies
const TABLE_FULL_BURST: u32 = 5;

/// Connection tracking engine
pub struct Conntrack {
    /// Source of engine time
    clock: Arc<dyn Clock>,

    /// Per-protocol trackers
    registry: TrackerRegistry,

    /// Confirmed connections of every namespace
    table: FlowTable,

    /// Outstanding expected flows
    expectations: ExpectationTable,

    /// Namespaces by id
    namespaces: DashMap<u32, Arc<Namespace>>,

    /// Tracker settings new namespaces start with
    settings: TrackerSettings,

    /// Worker list pairs per namespace
    workers: usize,

    /// Live connections allowed per namespace; 0 means unlimited
    max_connections: AtomicUsize,

    /// An admission failed since the last full GC pass
    gc_pressure: AtomicBool,

    /// Whether the binary should run the GC task
    gc_enabled: bool,

    security: Option<Arc<dyn SecurityLabel>>,
    fast_path: Option<Arc<dyn FastPath>>,

    /// Limits "table full" warnings
    full_warnings: DiagLimiter,
}

/// Builder for [`Conntrack`]
pub struct ConntrackBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    registry: TrackerRegistry,
    security: Option<Arc<dyn SecurityLabel>>,
    fast_path: Option<Arc<dyn FastPath>>,
}

impl ConntrackBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            registry: TrackerRegistry::new(),
            security: None,
            fast_path: None,
        }
    }

    /// Use a custom clock (tests step a [`crate::clock::ManualClock`])
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register or replace a protocol tracker
    #[must_use]
    pub fn tracker(mut self, tracker: Arc<dyn L4Tracker>) -> Self {
        self.registry.register(tracker);
        self
    }

    #[must_use]
    pub fn security_label(mut self, label: Arc<dyn SecurityLabel>) -> Self {
        self.security = Some(label);
        self
    }

    #[must_use]
    pub fn fast_path(mut self, fast_path: Arc<dyn FastPath>) -> Self {
        self.fast_path = Some(fast_path);
        self
    }

    /// Validate the configuration and build the engine
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the configuration is invalid.
    pub fn build(self) -> Result<Conntrack, ConfigError> {
        self.config.validate()?;

        let hashsize = self.config.table.effective_hashsize();
        let workers = self.config.table.effective_workers();
        let burst = NonZeroU32::new(TABLE_FULL_BURST).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(NonZeroU32::MIN).allow_burst(burst);

        info!(
            hashsize,
            max_connections = self.config.table.max_connections,
            workers,
            "connection tracker created"
        );

        Ok(Conntrack {
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            registry: self.registry,
            table: FlowTable::new(hashsize),
            expectations: ExpectationTable::new(),
            namespaces: DashMap::new(),
            settings: TrackerSettings::from_config(&self.config),
            workers,
            max_connections: AtomicUsize::new(self.config.table.max_connections),
            gc_pressure: AtomicBool::new(false),
            gc_enabled: self.config.gc.enabled,
            security: self.security,
            fast_path: self.fast_path,
            full_warnings: RateLimiter::direct(quota),
        })
    }
}

impl Conntrack {
    /// Start building an engine
    #[must_use]
    pub fn builder(config: Config) -> ConntrackBuilder {
        ConntrackBuilder::new(config)
    }

    /// Current engine time in milliseconds
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    #[must_use]
    pub const fn table(&self) -> &FlowTable {
        &self.table
    }

    #[must_use]
    pub const fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn expectations(&self) -> &ExpectationTable {
        &self.expectations
    }

    /// Timeouts the tracker for `protonum` applies in `ns`
    #[must_use]
    pub fn timeouts(&self, ns: &Namespace, protonum: u8) -> Timeouts {
        self.registry.get(protonum).timeouts(&ns.settings())
    }

    /// Whether background GC should run for this engine
    #[must_use]
    pub const fn gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    /// Live connections allowed per namespace; 0 means unlimited
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }

    /// Namespace `id`, created with the default tracker settings on first use
    pub fn namespace(&self, id: u32) -> Arc<Namespace> {
        if let Some(ns) = self.namespaces.get(&id) {
            return Arc::clone(ns.value());
        }
        let entry = self.namespaces.entry(id).or_insert_with(|| {
            info!(namespace = id, "namespace created");
            Namespace::new(id, self.settings.clone(), self.workers)
        });
        Arc::clone(entry.value())
    }

    /// Namespace `id` if it exists
    #[must_use]
    pub fn get_namespace(&self, id: u32) -> Option<Arc<Namespace>> {
        self.namespaces.get(&id).map(|ns| Arc::clone(ns.value()))
    }

    /// Every namespace, ordered by id
    #[must_use]
    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        let mut all: Vec<_> = self.namespaces.iter().map(|ns| Arc::clone(ns.value())).collect();
        all.sort_by_key(|ns| ns.id());
        all
    }

    /// Statistics of every namespace
    #[must_use]
    pub fn stats(&self) -> Vec<StatsSnapshot> {
        self.namespaces().iter().map(|ns| ns.snapshot()).collect()
    }

    /// Classify a packet at a hook point
    ///
    /// PRE_ROUTING and LOCAL_OUT look the packet up (creating an unconfirmed
    /// connection on a miss) and run its protocol tracker. LOCAL_IN and
    /// POST_ROUTING confirm the connection the packet carries. FORWARD
    /// passes packets through.
    pub fn classify(&self, ns: &Arc<Namespace>, l3: L3Proto, hook: Hook, packet: &mut Packet) -> Verdict {
        match hook {
            Hook::PreRouting | Hook::LocalOut => {
                let verdict = self.conntrack_in(ns, l3, hook, packet);
                if verdict == Verdict::Accept && hook == Hook::LocalOut {
                    self.apply_label(packet, false);
                }
                verdict
            }
            Hook::LocalIn | Hook::PostRouting => {
                let verdict = self.confirm(packet);
                if verdict == Verdict::Accept && hook == Hook::LocalIn {
                    self.apply_label(packet, true);
                }
                verdict
            }
            Hook::Forward => Verdict::Accept,
        }
    }

    /// Look up a confirmed connection by tuple
    ///
    /// Tries the zone id in effect for the original direction first and,
    /// when it differs, the one for the reply direction.
    pub fn find(&self, ns: &Namespace, zone: &Zone, tuple: &Tuple) -> Option<(Arc<Connection>, Direction)> {
        let now = self.now_ms();
        let orig_zone = zone.id_for(Direction::Original);
        let found = self.table.find(
            ns,
            zone,
            tuple,
            hash_tuple(tuple, orig_zone, ns.hash_mix()),
            now,
            |conn| {
                self.reap_expired(conn, now);
            },
        );
        if found.is_some() {
            return found;
        }
        let reply_zone = zone.id_for(Direction::Reply);
        if reply_zone == orig_zone {
            return None;
        }
        self.table.find(
            ns,
            zone,
            tuple,
            hash_tuple(tuple, reply_zone, ns.hash_mix()),
            now,
            |conn| {
                self.reap_expired(conn, now);
            },
        )
    }

    fn conntrack_in(&self, ns: &Arc<Namespace>, l3: L3Proto, hook: Hook, packet: &mut Packet) -> Verdict {
        if packet.conntrack().is_some() {
            return Verdict::Accept;
        }

        let data = packet.bytes();
        let hdr = match l4_offset_and_proto(&data, l3) {
            Ok(hdr) => hdr,
            Err(e) if e.is_untrackable() => {
                ns.stats().record_invalid();
                trace!(error = %e, "untrackable packet");
                return Verdict::Accept;
            }
            Err(e) => {
                ns.stats().record_invalid();
                debug!(error = %e, "malformed packet");
                return Verdict::Drop;
            }
        };

        let settings = ns.settings();
        let tracker = self.registry.get(hdr.protonum);
        let view = PacketView::new(&data, hdr, hook);
        let ctx = ErrorCtx {
            settings: &settings,
            registry: &self.registry,
        };
        match tracker.error(&view, &ctx) {
            ErrorCheck::Track => {}
            ErrorCheck::Invalid(e) => {
                ns.stats().record_error();
                ns.stats().record_invalid();
                debug!(proto = tracker.name(), error = %e, "invalid packet");
                return Verdict::Drop;
            }
            ErrorCheck::Related { inner, outer_dst } => {
                self.attach_related(ns, packet, &inner, outer_dst);
                return Verdict::Accept;
            }
        }

        let tuple = match tracker.pkt_to_tuple(&view) {
            Ok(tuple) => tuple,
            Err(e) => {
                ns.stats().record_invalid();
                debug!(proto = tracker.name(), error = %e, "cannot build tuple");
                return Verdict::Drop;
            }
        };

        let Some((conn, ctinfo)) = self.resolve_or_create(ns, tracker, &view, tuple, packet.zone, &settings) else {
            return Verdict::Drop;
        };

        let ctx = PacketCtx {
            now_ms: self.now_ms(),
            ctinfo,
            settings: &settings,
        };
        match tracker.packet(&conn, &view, &ctx) {
            TrackAction::Accept => {}
            TrackAction::Drop => {
                ns.stats().record_invalid();
                trace!(conn_id = conn.id(), ?ctinfo, "packet rejected by tracker");
                return Verdict::Drop;
            }
            TrackAction::Kill => {
                self.delete(&conn);
            }
            TrackAction::Repeat => {
                return if self.delete(&conn) {
                    debug!(conn_id = conn.id(), "closed connection reopened");
                    Verdict::Repeat
                } else {
                    Verdict::Drop
                };
            }
        }

        if ctinfo == CtInfo::EstablishedReply && !conn.test_and_set(Status::SEEN_REPLY) {
            trace!(conn_id = conn.id(), "reply seen");
        }
        conn.account(ctinfo.direction(), packet.len());
        packet.set_conntrack(Arc::clone(&conn), ctinfo);

        if hook == Hook::PreRouting && conn.test(Status::OFFLOAD) {
            if let Some(fast_path) = &self.fast_path {
                fast_path.forward(std::mem::take(packet), &conn);
                return Verdict::Stolen;
            }
        }
        Verdict::Accept
    }

    /// Find or create the connection a packet belongs to
    ///
    /// Returns `None` when the packet must be dropped: its tuple cannot be
    /// inverted, the table is full, or the tracker refuses to open a
    /// connection with it.
    pub fn resolve_or_create(
        &self,
        ns: &Arc<Namespace>,
        tracker: &dyn L4Tracker,
        view: &PacketView<'_>,
        tuple: Tuple,
        zone: Zone,
        settings: &TrackerSettings,
    ) -> Option<(Arc<Connection>, CtInfo)> {
        if let Some((conn, dir)) = self.find(ns, &zone, &tuple) {
            ns.stats().record_found();
            let ctinfo = if dir == Direction::Reply {
                CtInfo::EstablishedReply
            } else if conn.test(Status::SEEN_REPLY) {
                CtInfo::Established
            } else if conn.test(Status::EXPECTED) {
                CtInfo::Related
            } else {
                CtInfo::New
            };
            return Some((conn, ctinfo));
        }

        let conn = self.init_conntrack(ns, tracker, view, tuple, zone, settings)?;
        let ctinfo = if conn.test(Status::EXPECTED) {
            CtInfo::Related
        } else {
            CtInfo::New
        };
        Some((conn, ctinfo))
    }

    /// Associate an ICMP error with the connection its quoted packet belongs to
    fn attach_related(&self, ns: &Namespace, packet: &mut Packet, inner: &Tuple, outer_dst: IpAddr) {
        let Some((conn, dir)) = self.find(ns, &packet.zone, inner) else {
            ns.stats().record_error();
            ns.stats().record_invalid();
            trace!(tuple = %inner, "ICMP error for unknown flow");
            return;
        };
        // IPv6 errors may legitimately arrive for another local address
        if conn.tuple(dir).dst != outer_dst && inner.l3 == L3Proto::Ipv4 {
            ns.stats().record_error();
            ns.stats().record_invalid();
            debug!(conn_id = conn.id(), %outer_dst, "ICMP error outer destination mismatch");
            return;
        }
        let ctinfo = if dir == Direction::Reply {
            CtInfo::RelatedReply
        } else {
            CtInfo::Related
        };
        trace!(conn_id = conn.id(), ?ctinfo, "ICMP error related to flow");
        packet.set_conntrack(conn, ctinfo);
    }

    fn apply_label(&self, packet: &Packet, is_input: bool) {
        let Some(security) = &self.security else {
            return;
        };
        let Some((conn, _)) = packet.conntrack() else {
            return;
        };
        if conn.test(Status::SECMARK_SKIP) {
            return;
        }
        if security.label(packet, conn, is_input) == LabelDecision::Skip {
            conn.set_status(Status::SECMARK_SKIP);
            trace!(conn_id = conn.id(), "connection exempt from labelling");
        }
    }

    fn warn_table_full(&self, ns: &Namespace, max: usize) {
        if self.full_warnings.check().is_ok() {
            warn!(namespace = ns.id(), max, "table full, dropping packet");
        }
    }
}

impl fmt::Debug for Conntrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conntrack")
            .field("table", &self.table)
            .field("namespaces", &self.namespaces.len())
            .field("expectations", &self.expectations.len())
            .field("max_connections", &self.max_connections())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
