//! Shared harness for the integration tests

use std::net::SocketAddr;
use std::sync::Arc;

use rust_conntrack::proto::tcp::window::TcpDirState;
use rust_conntrack::proto::ProtoState;
use rust_conntrack::{
    Config, Connection, Conntrack, Hook, L3Proto, ManualClock, Namespace, Packet, Verdict,
};

pub const CLIENT: &str = "192.168.1.10:40000";
pub const SERVER: &str = "203.0.113.5:80";

/// Engine start time on the manual clock
pub const START_MS: u64 = 10_000;

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.table.hashsize = 1024;
    config.table.workers = 4;
    config
}

/// An engine on a manual clock with namespace 0 ready
pub struct Harness {
    pub engine: Arc<Conntrack>,
    pub clock: Arc<ManualClock>,
    pub ns: Arc<Namespace>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let engine = Conntrack::builder(config).clock(clock.clone()).build().unwrap();
        let ns = engine.namespace(0);
        Self {
            engine: Arc::new(engine),
            clock,
            ns,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(test_config())
    }

    /// PRE_ROUTING then POST_ROUTING, stopping at the first non-accept
    pub fn forward(&self, pkt: &mut Packet) -> Verdict {
        forward_in(&self.engine, &self.ns, pkt)
    }
}

pub fn forward_in(engine: &Conntrack, ns: &Arc<Namespace>, pkt: &mut Packet) -> Verdict {
    let verdict = engine.classify(ns, L3Proto::Ipv4, Hook::PreRouting, pkt);
    if verdict != Verdict::Accept {
        return verdict;
    }
    engine.classify(ns, L3Proto::Ipv4, Hook::PostRouting, pkt)
}

pub fn conn_of(pkt: &Packet) -> Arc<Connection> {
    Arc::clone(pkt.conntrack().unwrap().0)
}

/// Window state of both directions of a TCP connection
pub fn windows(conn: &Connection) -> [TcpDirState; 2] {
    match conn.proto_state() {
        ProtoState::Tcp(tcp) => tcp.seen,
        other => panic!("not a TCP connection: {other:?}"),
    }
}
