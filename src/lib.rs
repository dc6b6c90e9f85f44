//! rust-conntrack: stateful connection tracking for IPv4 and IPv6
//!
//! This crate classifies packets into bidirectional flows the way a
//! stateful firewall or NAT needs them classified: every packet leaves
//! with a [`Verdict`] and, when tracked, a reference to its
//! [`Connection`] and a [`CtInfo`] saying how it relates to that flow.
//!
//! # Features
//!
//! - **Flow table**: Sharded, resizable hash table with lock-free lookups
//! - **Protocol trackers**: TCP state machine and window tracking, UDP, ICMP/ICMPv6, generic
//! - **Expectations**: Related flows announced by application helpers
//! - **Admission control**: Per-namespace limits with early drop of unassured flows
//! - **Adaptive GC**: Background reaping paced by the remaining lifetime of flows
//! - **Namespaces and zones**: Isolated tables sharing one engine
//!
//! # Architecture
//!
//! ```text
//! Packet → classify(PRE_ROUTING) → tuple → FlowTable lookup ─┬─ hit → L4 tracker
//!                                                             └─ miss → new unconfirmed
//!                                                                         ↓
//!                            classify(POST_ROUTING / LOCAL_IN) → confirm → FlowTable
//!                                                                         ↑
//!                                                                GC reaps expired flows
//! ```
//!
//! # Quick Start
//!
//! ```
//! use rust_conntrack::{Config, Conntrack, CtInfo, Hook, L3Proto, TcpSegment, Verdict};
//!
//! let engine = Conntrack::builder(Config::default()).build().unwrap();
//! let ns = engine.namespace(0);
//!
//! let client = "192.168.1.10:51000".parse().unwrap();
//! let server = "93.184.216.34:443".parse().unwrap();
//! let mut syn = TcpSegment::new(client, server).syn().seq(1).build();
//!
//! assert_eq!(engine.classify(&ns, L3Proto::Ipv4, Hook::LocalOut, &mut syn), Verdict::Accept);
//! assert_eq!(syn.ctinfo(), Some(CtInfo::New));
//! assert_eq!(engine.classify(&ns, L3Proto::Ipv4, Hook::PostRouting, &mut syn), Verdict::Accept);
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`conntrack`]: The engine and its hook entry points
//! - [`conn`]: Tracked connections and their extensions
//! - [`table`]: The flow table
//! - [`proto`]: Per-protocol trackers
//! - [`expect`]: Expected related flows
//! - [`gc`]: Background garbage collection
//! - [`packet`]: Packets, parsing and builders

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod clock;
pub mod config;
pub mod conn;
pub mod conntrack;
pub mod error;
pub mod expect;
pub mod gc;
pub mod netns;
pub mod packet;
pub mod proto;
pub mod stats;
pub mod table;
pub mod tuple;

// Re-export commonly used types at the crate root
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{load_config, load_config_with_env, Config};
pub use conn::{Connection, Status};
pub use conntrack::{Conntrack, ConntrackBuilder, FastPath, LabelDecision, SecurityLabel};
pub use error::{ConfigError, ConntrackError, ExpectationError, PacketError, TableError};
pub use expect::{Expectation, ExpectationTable, TupleMask};
pub use gc::{GcCycle, GcHandle, GcWorker};
pub use netns::{Namespace, TrackerSettings};
pub use packet::{CtInfo, Hook, IcmpMessage, Packet, TcpSegment, UdpDatagram, Verdict};
pub use proto::{L4Tracker, TcpState, Timeouts};
pub use stats::{NamespaceStats, StatsSnapshot};
pub use table::FlowTable;
pub use tuple::{Direction, L3Proto, Tuple, Zone};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
