//! Races between workers sharing one engine
//!
//! These tests use real threads released together by a barrier. They check
//! outcomes that must hold for every interleaving, never a particular one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rust_conntrack::{Direction, Status, TcpSegment, Tuple, UdpDatagram, Verdict, Zone};

use super::common::{addr, conn_of, forward_in, test_config, Harness, SERVER};

/// Worker threads per test
const THREADS: usize = 8;

#[test]
fn test_concurrent_udp_confirm_keeps_one_connection() {
    let h = Harness::with_defaults();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            let ns = Arc::clone(&h.ns);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut pkt = UdpDatagram::new(addr("10.1.0.1:5353"), addr("10.1.0.2:53"))
                    .payload(b"query")
                    .build();
                barrier.wait();
                let verdict = forward_in(&engine, &ns, &mut pkt);
                (verdict, pkt.conntrack().map(|(conn, _)| Arc::clone(conn)))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();
    assert!(results.iter().all(|(verdict, _)| *verdict == Verdict::Accept));

    let winner = results[0].1.clone().unwrap();
    for (_, conn) in &results {
        assert!(Arc::ptr_eq(conn.as_ref().unwrap(), &winner));
    }
    assert!(winner.is_confirmed());
    assert_eq!(h.engine.table().len(), 1);
    assert_eq!(h.ns.stats().insert(), 1);

    drop(results);
    drop(winner);
    assert_eq!(h.ns.count(), 1);
    assert_eq!(h.ns.unconfirmed_count(), 0);
}

#[test]
fn test_concurrent_tcp_confirm_inserts_once() {
    let h = Harness::with_defaults();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            let ns = Arc::clone(&h.ns);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut pkt = TcpSegment::new(addr("10.1.0.1:40000"), addr(SERVER))
                    .syn()
                    .seq(7)
                    .build();
                barrier.wait();
                forward_in(&engine, &ns, &mut pkt)
            })
        })
        .collect();

    let verdicts: Vec<Verdict> = handles.into_iter().map(|t| t.join().unwrap()).collect();
    assert!(verdicts.contains(&Verdict::Accept));
    assert!(verdicts.iter().all(|v| matches!(v, Verdict::Accept | Verdict::Drop)));
    assert_eq!(h.engine.table().len(), 1);
    assert_eq!(h.ns.stats().insert(), 1);
    assert_eq!(h.ns.count(), 1);
}

#[test]
fn test_lookups_survive_concurrent_resize() {
    const FLOWS: u16 = 300;
    let h = Harness::with_defaults();

    let tuples: Vec<Tuple> = (0..FLOWS)
        .map(|i| {
            let src = SocketAddr::new(addr("10.2.0.1:0").ip(), 20_000 + i);
            let mut pkt = UdpDatagram::new(src, addr("10.2.0.2:53")).build();
            assert_eq!(h.forward(&mut pkt), Verdict::Accept);
            conn_of(&pkt).tuple(Direction::Original)
        })
        .collect();
    let tuples = Arc::new(tuples);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..THREADS / 2)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            let ns = Arc::clone(&h.ns);
            let tuples = Arc::clone(&tuples);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut misses = 0usize;
                while !done.load(Ordering::Relaxed) {
                    for tuple in tuples.iter() {
                        if engine.find(&ns, &Zone::DEFAULT, tuple).is_none() {
                            misses += 1;
                        }
                        let reply = tuple.swapped();
                        if engine.find(&ns, &Zone::DEFAULT, &reply).is_none() {
                            misses += 1;
                        }
                    }
                }
                misses
            })
        })
        .collect();

    for round in 0..20 {
        let size = if round % 2 == 0 { 64 } else { 4096 };
        h.engine.set_hashsize(size).unwrap();
    }
    done.store(true, Ordering::Relaxed);

    for reader in readers {
        assert_eq!(reader.join().unwrap(), 0);
    }
    assert_eq!(h.engine.table().len(), usize::from(FLOWS));
    assert_eq!(h.engine.table().size(), 4096);
}

#[test]
fn test_eviction_under_churn_spares_assured() {
    const MAX: usize = 64;
    const ASSURED: u16 = 32;
    let mut config = test_config();
    config.table.max_connections = MAX;
    let h = Harness::new(config);

    let assured: Vec<_> = (0..ASSURED)
        .map(|i| {
            let src = SocketAddr::new(addr("10.3.0.1:0").ip(), 30_000 + i);
            let mut syn = TcpSegment::new(src, addr(SERVER)).syn().seq(1).build();
            assert_eq!(h.forward(&mut syn), Verdict::Accept);
            let conn = conn_of(&syn);
            conn.set_status(Status::ASSURED);
            conn
        })
        .collect();

    let barrier = Arc::new(Barrier::new(THREADS));
    let churners: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&h.engine);
            let ns = Arc::clone(&h.ns);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..200u16 {
                    let ip = format!("10.4.{t}.1:{}", 10_000 + i);
                    let mut syn = TcpSegment::new(addr(&ip), addr(SERVER)).syn().seq(1).build();
                    let verdict = forward_in(&engine, &ns, &mut syn);
                    assert!(matches!(verdict, Verdict::Accept | Verdict::Drop));
                }
            })
        })
        .collect();
    for churner in churners {
        churner.join().unwrap();
    }

    for conn in &assured {
        assert!(conn.is_confirmed());
        assert!(!conn.is_dying());
        let found = h.engine.find(&h.ns, &Zone::DEFAULT, &conn.tuple(Direction::Original));
        assert!(found.is_some_and(|(c, _)| Arc::ptr_eq(&c, conn)));
    }
    assert!(h.ns.count() <= MAX);
    assert!(h.ns.stats().early_drop() > 0);
}
