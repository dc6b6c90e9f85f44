//! End-to-end flows through the hooks
//!
//! Each test follows one packet sequence from first sight to its effect on
//! the table, the connection state and the namespace counters.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_conntrack::table::{conn_hash, hash_tuple, scale};
use rust_conntrack::conntrack::EARLY_DROP_BUCKETS;
use rust_conntrack::{
    Connection, CtInfo, Direction, GcWorker, Status, TcpSegment, TcpState, Tuple, Verdict,
};

use super::common::{addr, conn_of, test_config, windows, Harness, CLIENT, SERVER};

// ============================================================================
// Test Helpers
// ============================================================================

const WIN: u16 = 8192;

fn client() -> TcpSegment {
    TcpSegment::new(addr(CLIENT), addr(SERVER)).window(WIN)
}

fn server() -> TcpSegment {
    TcpSegment::new(addr(SERVER), addr(CLIENT)).window(WIN)
}

/// SYN(100) / SYN+ACK(500, 101) / ACK(101, 501)
fn handshake(h: &Harness) -> Arc<Connection> {
    let mut syn = client().syn().seq(100).build();
    assert_eq!(h.forward(&mut syn), Verdict::Accept);
    let conn = conn_of(&syn);

    let mut syn_ack = server().syn().seq(500).ack(101).build();
    assert_eq!(h.forward(&mut syn_ack), Verdict::Accept);

    let mut ack = client().seq(101).ack(501).build();
    assert_eq!(h.forward(&mut ack), Verdict::Accept);
    conn
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_tcp_handshake_establishes_and_assures() {
    let h = Harness::with_defaults();

    let mut syn = client().syn().seq(100).build();
    assert_eq!(h.forward(&mut syn), Verdict::Accept);
    assert_eq!(syn.ctinfo(), Some(CtInfo::New));
    let conn = conn_of(&syn);
    assert_eq!(conn.tcp_state(), Some(TcpState::SynSent));
    assert!(conn.is_confirmed());

    let mut syn_ack = server().syn().seq(500).ack(101).build();
    assert_eq!(h.forward(&mut syn_ack), Verdict::Accept);
    assert_eq!(syn_ack.ctinfo(), Some(CtInfo::EstablishedReply));
    assert_eq!(conn.tcp_state(), Some(TcpState::SynRecv));
    assert!(conn.test(Status::SEEN_REPLY));
    assert!(!conn.is_assured());

    let mut ack = client().seq(101).ack(501).build();
    assert_eq!(h.forward(&mut ack), Verdict::Accept);
    assert_eq!(ack.ctinfo(), Some(CtInfo::Established));
    assert_eq!(conn.tcp_state(), Some(TcpState::Established));
    assert!(conn.is_assured());

    assert_eq!(h.engine.table().len(), 1);
    assert_eq!(h.ns.stats().insert(), 1);
    assert_eq!(h.ns.stats().invalid(), 0);
}

#[test]
fn test_out_of_window_segment_dropped() {
    let h = Harness::with_defaults();
    let conn = handshake(&h);

    let before = windows(&conn);
    let seq = before[0].td_maxend.wrapping_add(50_000);
    let mut data = client().seq(seq).ack(501).payload(&[0x55; 100]).build();

    assert_eq!(h.forward(&mut data), Verdict::Drop);
    assert_eq!(h.ns.stats().invalid(), 1);
    assert_eq!(conn.tcp_state(), Some(TcpState::Established));
    assert_eq!(windows(&conn), before);
}

#[test]
fn test_out_of_window_segment_accepted_when_liberal() {
    let mut config = test_config();
    config.tcp.be_liberal = true;
    let h = Harness::new(config);
    let conn = handshake(&h);

    let before = windows(&conn);
    let seq = before[0].td_maxend.wrapping_add(50_000);
    let mut data = client().seq(seq).ack(501).payload(&[0x55; 100]).build();

    assert_eq!(h.forward(&mut data), Verdict::Accept);
    assert_eq!(h.ns.stats().invalid(), 0);
    assert_eq!(conn.tcp_state(), Some(TcpState::Established));
    // The receiver's view of what the client may send is untouched
    assert_eq!(windows(&conn)[1].td_maxend, before[1].td_maxend);
}

#[test]
fn test_idle_flow_reaped_by_gc() {
    let h = Harness::with_defaults();
    let conn = handshake(&h);
    assert_eq!(conn.tcp_state(), Some(TcpState::Established));

    let mut gc = GcWorker::new(Arc::clone(&h.engine));
    let cycle = gc.run_cycle();
    assert!(cycle.complete);
    assert_eq!(cycle.expired, 0);
    assert_eq!(h.engine.table().connections().len(), 1);

    let idle = conn.expires_in(h.engine.now_ms());
    h.clock.advance(Duration::from_millis(idle + 1));

    let cycle = gc.run_cycle();
    assert_eq!(cycle.expired, 1);
    assert!(h.engine.table().connections().is_empty());
    assert!(conn.is_dying());
    assert_eq!(h.ns.stats().expired(), 1);

    drop(conn);
    assert_eq!(h.ns.count(), 0);
}

#[test]
fn test_table_full_evicts_one_unassured_flow() {
    const MAX: usize = 4;
    let mut config = test_config();
    config.table.max_connections = MAX;
    let h = Harness::new(config);

    let mut existing = Vec::new();
    for port in 0..MAX {
        let src = SocketAddr::new(addr(CLIENT).ip(), 41_000 + u16::try_from(port).unwrap());
        let mut syn = TcpSegment::new(src, addr(SERVER)).syn().seq(1).build();
        assert_eq!(h.forward(&mut syn), Verdict::Accept);
        existing.push(conn_of(&syn));
    }
    assert_eq!(h.ns.count(), MAX);
    assert!(existing.iter().all(|c| !c.is_assured()));

    // A newcomer whose early-drop window covers the first flow's bucket
    let size = h.engine.table().size();
    let target = scale(conn_hash(&existing[0], Direction::Original), size);
    let newcomer = (1024..u16::MAX)
        .map(|port| SocketAddr::new(addr("192.168.1.99:0").ip(), port))
        .find(|src| {
            let tuple = Tuple::tcp(*src, addr(SERVER));
            let idx = scale(hash_tuple(&tuple, 0, h.ns.hash_mix()), size);
            (target + size - idx) % size < EARLY_DROP_BUCKETS
        })
        .unwrap();

    let mut syn = TcpSegment::new(newcomer, addr(SERVER)).syn().seq(1).build();
    assert_eq!(h.forward(&mut syn), Verdict::Accept);
    assert!(conn_of(&syn).is_confirmed());

    assert_eq!(h.ns.stats().early_drop(), 1);
    assert_eq!(existing.iter().filter(|c| c.is_dying()).count(), 1);
    assert_eq!(h.engine.table().len(), MAX);

    drop(existing);
    assert_eq!(h.ns.count(), MAX);
}

#[test]
fn test_simultaneous_open_reaches_syn_sent2() {
    let h = Harness::with_defaults();

    let mut syn = client().syn().seq(100).build();
    assert_eq!(h.forward(&mut syn), Verdict::Accept);
    let conn = conn_of(&syn);

    let mut crossing = server().syn().seq(500).build();
    assert_eq!(h.forward(&mut crossing), Verdict::Accept);
    assert_eq!(crossing.ctinfo(), Some(CtInfo::EstablishedReply));
    assert_eq!(conn.tcp_state(), Some(TcpState::SynSent2));
    assert_eq!(h.ns.stats().invalid(), 0);
}
