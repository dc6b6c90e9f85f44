//! Connection lifetime from teardown to reaping, plus the ambient pieces
//! that shape it: accounting, the GC task, namespaces and config files.

use std::sync::Arc;
use std::time::Duration;

use rust_conntrack::config::load_config;
use rust_conntrack::{
    Conntrack, CtInfo, Direction, GcHandle, Hook, L3Proto, TcpSegment, TcpState, UdpDatagram,
    Verdict, Zone,
};

use super::common::{addr, conn_of, forward_in, test_config, windows, Harness, CLIENT, SERVER};

const WIN: u16 = 8192;

fn client() -> TcpSegment {
    TcpSegment::new(addr(CLIENT), addr(SERVER)).window(WIN)
}

fn server() -> TcpSegment {
    TcpSegment::new(addr(SERVER), addr(CLIENT)).window(WIN)
}

fn send(h: &Harness, seg: TcpSegment) {
    let mut pkt = seg.build();
    assert_eq!(h.forward(&mut pkt), Verdict::Accept);
}

fn established(h: &Harness) -> Arc<rust_conntrack::Connection> {
    let mut syn = client().syn().seq(100).build();
    assert_eq!(h.forward(&mut syn), Verdict::Accept);
    let conn = conn_of(&syn);
    send(h, server().syn().seq(500).ack(101));
    send(h, client().seq(101).ack(501));
    assert_eq!(conn.tcp_state(), Some(TcpState::Established));
    conn
}

fn close(h: &Harness) {
    send(h, client().seq(101).ack(501).fin());
    send(h, server().seq(501).ack(102));
    send(h, server().seq(501).ack(102).fin());
    send(h, client().seq(102).ack(502));
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_teardown_reaches_time_wait_then_expires() {
    let h = Harness::with_defaults();
    let conn = established(&h);
    close(&h);
    assert_eq!(conn.tcp_state(), Some(TcpState::TimeWait));

    let tuple = conn.tuple(Direction::Original);
    assert!(h.engine.find(&h.ns, &Zone::DEFAULT, &tuple).is_some());

    h.clock.advance(Duration::from_secs(120) + Duration::from_millis(1));
    assert!(h.engine.find(&h.ns, &Zone::DEFAULT, &tuple).is_none());
    assert!(conn.is_dying());
    assert_eq!(h.ns.stats().expired(), 1);
}

#[test]
fn test_syn_reopens_time_wait_flow() {
    let h = Harness::with_defaults();
    let old = established(&h);
    close(&h);

    let mut syn = client().syn().seq(90_000).build();
    assert_eq!(
        h.engine.classify(&h.ns, L3Proto::Ipv4, Hook::PreRouting, &mut syn),
        Verdict::Repeat
    );
    assert!(old.is_dying());

    assert_eq!(h.forward(&mut syn), Verdict::Accept);
    assert_eq!(syn.ctinfo(), Some(CtInfo::New));
    let new = conn_of(&syn);
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.tcp_state(), Some(TcpState::SynSent));
    assert_eq!(h.engine.table().len(), 1);
}

// ============================================================================
// Window tracking
// ============================================================================

#[test]
fn test_window_edges_never_shrink() {
    let h = Harness::with_defaults();
    let conn = established(&h);

    let mut edges = vec![(windows(&conn)[0].td_end, windows(&conn)[0].td_maxend)];
    let segments = [
        client().seq(101).ack(501).payload(&[1; 100]),
        client().seq(201).ack(501).payload(&[2; 100]),
        server().seq(501).ack(301),
        client().seq(301).ack(501).payload(&[3; 100]),
        // Retransmission of the first segment
        client().seq(101).ack(501).payload(&[1; 100]),
        server().seq(501).ack(401),
    ];
    for seg in segments {
        send(&h, seg);
        let client_dir = windows(&conn)[0];
        edges.push((client_dir.td_end, client_dir.td_maxend));
    }

    for pair in edges.windows(2) {
        assert!(pair[1].0 >= pair[0].0, "td_end shrank: {pair:?}");
        assert!(pair[1].1 >= pair[0].1, "td_maxend shrank: {pair:?}");
    }
    assert_eq!(windows(&conn)[0].td_end, 401);
}

// ============================================================================
// Extensions
// ============================================================================

#[test]
fn test_accounting_counts_both_directions() {
    let mut config = test_config();
    config.accounting.acct = true;
    config.accounting.timestamp = true;
    let h = Harness::new(config);
    let conn = established(&h);

    let acct = conn.acct().unwrap().snapshot();
    assert_eq!(acct.orig_packets, 2);
    assert_eq!(acct.reply_packets, 1);
    assert!(acct.orig_bytes > 0);
    assert!(acct.reply_bytes > 0);
    assert!(conn.tstamp().unwrap().started_ms() > 0);
}

// ============================================================================
// GC task
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_gc_task_reaps_idle_flow() {
    let h = Harness::with_defaults();
    let mut pkt = UdpDatagram::new(addr("10.5.0.1:5000"), addr("10.5.0.2:53")).build();
    assert_eq!(h.forward(&mut pkt), Verdict::Accept);
    drop(pkt);

    let gc = GcHandle::spawn(Arc::clone(&h.engine));
    tokio::task::yield_now().await;
    assert_eq!(h.engine.table().len(), 1);

    h.clock.advance(Duration::from_secs(31));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(h.engine.table().is_empty());
    assert_eq!(h.ns.count(), 0);

    gc.shutdown().await;
}

// ============================================================================
// Namespaces
// ============================================================================

#[test]
fn test_namespace_removal_leaves_others() {
    let h = Harness::with_defaults();
    let other = h.engine.namespace(7);

    let mut first = client().syn().seq(1).build();
    assert_eq!(h.forward(&mut first), Verdict::Accept);
    let mut second = client().syn().seq(1).build();
    assert_eq!(forward_in(&h.engine, &other, &mut second), Verdict::Accept);
    drop(second);

    assert_eq!(h.engine.table().len(), 2);
    assert_eq!(h.engine.namespaces().len(), 2);

    assert!(h.engine.remove_namespace(7));
    assert!(!h.engine.remove_namespace(7));
    assert_eq!(other.count(), 0);
    assert_eq!(h.engine.table().len(), 1);

    let tuple = conn_of(&first).tuple(Direction::Original);
    assert!(h.engine.find(&h.ns, &Zone::DEFAULT, &tuple).is_some());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_file_drives_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conntrack.json");
    std::fs::write(
        &path,
        r#"{
            "table": { "hashsize": 128, "max_connections": 10, "workers": 2 },
            "tcp": { "be_liberal": true },
            "gc": { "enabled": false }
        }"#,
    )
    .unwrap();

    let config = load_config(&path).unwrap();
    let engine = Conntrack::builder(config).build().unwrap();
    assert_eq!(engine.table().size(), 128);
    assert_eq!(engine.max_connections(), 10);
    assert!(!engine.gc_enabled());
    assert!(engine.namespace(0).settings().tcp_be_liberal);
}

#[test]
fn test_invalid_config_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conntrack.json");
    std::fs::write(&path, r#"{ "table": { "hashsize": 3 } }"#).unwrap();
    assert!(load_config(&path).is_err());
    assert!(load_config(dir.path().join("missing.json")).is_err());
}
