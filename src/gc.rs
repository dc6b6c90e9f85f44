//! Adaptive garbage collection of expired connections
//!
//! Lookups reap expired entries they walk over, but idle flows are only
//! found by a background scan. [`GcWorker`] walks the table a bounded slice
//! at a time and picks its next wake-up from the average remaining lifetime
//! of what it saw: a table full of short-lived UDP flows is scanned often,
//! one full of established TCP flows rarely.
//!
//! When admission has failed since the last full pass the scan also evicts
//! non-assured connections while a namespace sits at or above 95% of the
//! connection limit. Assured connections are evicted too when their tracker
//! reports them droppable, as TCP does for flows already closing. Admission
//! early drop never evicts an assured connection; only this scan does.
//!
//! ```text
//! run_cycle ──► bucket i ──► expired?  ── yes ──► reap
//!                  │            │ no
//!                  │            └──► fold remaining lifetime into next_run
//!                  │                 pressure? ──► evict if not assured
//!                  └── > 64 reaped or 10ms spent ──► save position, return
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::conn::{Connection, Status};
use crate::conntrack::Conntrack;
use crate::tuple::Direction;

/// Longest pause between cycles
pub const GC_SCAN_INTERVAL_MAX_MS: u64 = 60_000;

/// Shortest pause between full passes
pub const GC_SCAN_INTERVAL_MIN_MS: u64 = 1_000;

/// Remaining lifetimes are clamped to this before averaging
pub const GC_SCAN_INTERVAL_CLAMP_MS: u64 = 300_000;

/// Time budget of one cycle
pub const GC_SCAN_MAX_DURATION_MS: u64 = 10;

/// Reaped or evicted connections after which a cycle yields early
pub const GC_SCAN_EXPIRED_MAX: usize = 64;

/// Weight of the initial `GC_SCAN_INTERVAL_MAX_MS` guess in the average
const GC_SCAN_INITIAL_COUNT: i64 = 100;

/// Outcome of one [`GcWorker::run_cycle`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcCycle {
    /// Connections examined
    pub scanned: usize,
    /// Connections reaped because their deadline passed
    pub expired: usize,
    /// Connections evicted under pressure
    pub evicted: usize,
    /// Pause before the next cycle; zero means run again right away
    pub next_run: Duration,
    /// Whether the cycle finished a pass over the whole table
    pub complete: bool,
}

/// Resumable scan state
#[derive(Debug)]
pub struct GcWorker {
    engine: Arc<Conntrack>,
    next_bucket: usize,
    avg_timeout: i64,
    count: i64,
    start_ms: u64,
}

#[allow(clippy::cast_possible_wrap)]
const fn ms_i64(ms: u64) -> i64 {
    ms as i64
}

impl GcWorker {
    /// Create a worker that starts at bucket 0
    #[must_use]
    pub fn new(engine: Arc<Conntrack>) -> Self {
        Self {
            engine,
            next_bucket: 0,
            avg_timeout: ms_i64(GC_SCAN_INTERVAL_MAX_MS),
            count: GC_SCAN_INITIAL_COUNT,
            start_ms: 0,
        }
    }

    /// Engine this worker collects for
    #[must_use]
    pub fn engine(&self) -> &Arc<Conntrack> {
        &self.engine
    }

    /// Bucket the next cycle resumes from
    #[must_use]
    pub const fn next_bucket(&self) -> usize {
        self.next_bucket
    }

    /// Scan from the saved position until the table ends or a budget runs out
    pub fn run_cycle(&mut self) -> GcCycle {
        let engine = Arc::clone(&self.engine);
        let started = engine.now_ms();
        let deadline = started + GC_SCAN_MAX_DURATION_MS;

        let max = engine.max_connections();
        let max95 = if engine.under_pressure() { max / 100 * 95 } else { 0 };

        if self.next_bucket == 0 {
            self.avg_timeout = ms_i64(GC_SCAN_INTERVAL_MAX_MS);
            self.count = GC_SCAN_INITIAL_COUNT;
            self.start_ms = started;
        }
        let mut next_run = self.avg_timeout;
        let mut count = self.count;
        let mut cycle = GcCycle::default();

        let mut i = self.next_bucket;
        loop {
            let size = engine.table().size();
            if i >= size {
                break;
            }
            // Each connection once, through its original-direction node.
            // The snapshot is released before deleting so the last
            // reference of an evicted connection goes with the loop variable.
            let conns: Vec<Arc<Connection>> = match engine.table().bucket(i) {
                Some(bucket) => bucket
                    .iter()
                    .filter(|node| node.tuple.dir == Direction::Original)
                    .map(|node| Arc::clone(&node.conn))
                    .collect(),
                None => Vec::new(),
            };
            i += 1;

            for conn in conns {
                if conn.test(Status::OFFLOAD) && max95 == 0 {
                    continue;
                }
                if cycle.expired + cycle.evicted > GC_SCAN_EXPIRED_MAX {
                    self.save(i - 1, next_run, count);
                    let elapsed = engine.now_ms().saturating_sub(self.start_ms);
                    cycle.next_run = if elapsed < GC_SCAN_INTERVAL_MAX_MS {
                        Duration::from_millis(1)
                    } else {
                        Duration::ZERO
                    };
                    return self.finish(cycle);
                }
                cycle.scanned += 1;

                let now = engine.now_ms();
                if conn.is_expired(now) {
                    if engine.reap_expired(&conn, now) {
                        cycle.expired += 1;
                    }
                    continue;
                }

                let expires = ms_i64(
                    conn.expires_in(now)
                        .clamp(GC_SCAN_INTERVAL_MIN_MS, GC_SCAN_INTERVAL_CLAMP_MS),
                );
                count += 1;
                next_run += (expires - next_run) / count;

                if max95 == 0 || !conn.is_confirmed() || conn.is_dying() {
                    continue;
                }
                if conn.namespace().count() < max95 {
                    continue;
                }
                // Assured flows go only if the tracker says so (TCP closing states)
                let tracker = engine.registry().get(conn.protonum());
                if (!conn.is_assured() || tracker.can_early_drop(&conn)) && engine.delete(&conn) {
                    conn.namespace().stats().record_early_drop();
                    trace!(conn_id = conn.id(), "evicted by gc");
                    cycle.evicted += 1;
                }
            }

            if engine.now_ms() > deadline && i < engine.table().size() {
                self.save(i, next_run, count);
                cycle.next_run = Duration::ZERO;
                return self.finish(cycle);
            }
        }

        self.next_bucket = 0;
        cycle.complete = true;

        let next = u64::try_from(next_run)
            .unwrap_or(0)
            .clamp(GC_SCAN_INTERVAL_MIN_MS, GC_SCAN_INTERVAL_MAX_MS);
        let elapsed = engine.now_ms().saturating_sub(self.start_ms).max(1);
        let next = if next > elapsed { next - elapsed } else { 1 };
        cycle.next_run = Duration::from_millis(next);
        self.finish(cycle)
    }

    fn save(&mut self, bucket: usize, avg_timeout: i64, count: i64) {
        self.next_bucket = bucket;
        self.avg_timeout = avg_timeout;
        self.count = count;
    }

    fn finish(&self, cycle: GcCycle) -> GcCycle {
        if !cycle.next_run.is_zero() {
            self.engine.clear_pressure();
        }
        if cycle.expired > 0 || cycle.evicted > 0 {
            debug!(
                scanned = cycle.scanned,
                expired = cycle.expired,
                evicted = cycle.evicted,
                next_run_ms = cycle.next_run.as_millis(),
                complete = cycle.complete,
                "gc cycle"
            );
        }
        cycle
    }
}

/// Background GC task
///
/// Dropping the handle without calling [`GcHandle::shutdown`] leaves the
/// task running until the runtime stops.
#[derive(Debug)]
pub struct GcHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl GcHandle {
    /// Start collecting on the current tokio runtime
    #[must_use]
    pub fn spawn(engine: Arc<Conntrack>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = GcWorker::new(engine);
        let task = tokio::spawn(run_gc(worker, shutdown_rx));
        info!("conntrack gc started");
        Self { shutdown_tx, task }
    }

    /// Stop the task and wait for it to exit
    pub async fn shutdown(self) {
        // The task may already be gone if the runtime is shutting down
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            debug!("gc task ended abnormally: {}", e);
        }
    }
}

async fn run_gc(mut worker: GcWorker, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        let cycle = worker.run_cycle();
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("gc task received shutdown signal");
                break;
            }
            () = pause(cycle.next_run) => {}
        }
    }
    info!("conntrack gc stopped");
}

async fn pause(next_run: Duration) {
    if next_run.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(next_run).await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::netns::{Namespace, TrackerSettings};
    use crate::packet::{Hook, Packet, TcpSegment, UdpDatagram, Verdict};
    use crate::proto::{ProtoState, TcpState};
    use crate::tuple::L3Proto;

    fn engine() -> (Arc<Conntrack>, Arc<ManualClock>) {
        let mut config = Config::default();
        config.table.hashsize = 1024;
        config.table.workers = 2;
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = Conntrack::builder(config).clock(clock.clone()).build().unwrap();
        (Arc::new(engine), clock)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn track(ct: &Conntrack, ns: &Arc<Namespace>, mut pkt: Packet) {
        assert_eq!(ct.classify(ns, L3Proto::Ipv4, Hook::PreRouting, &mut pkt), Verdict::Accept);
        assert_eq!(ct.classify(ns, L3Proto::Ipv4, Hook::PostRouting, &mut pkt), Verdict::Accept);
    }

    fn udp_flow(ct: &Conntrack, ns: &Arc<Namespace>, port: u16) {
        let pkt = UdpDatagram::new(addr(&format!("10.0.0.1:{port}")), addr("10.0.0.2:53")).build();
        track(ct, ns, pkt);
    }

    #[test]
    fn test_empty_table_sleeps_long() {
        let (ct, _clock) = engine();
        let mut gc = GcWorker::new(ct);
        let cycle = gc.run_cycle();
        assert!(cycle.complete);
        assert_eq!(cycle.scanned, 0);
        assert_eq!(cycle.next_run, Duration::from_millis(GC_SCAN_INTERVAL_MAX_MS - 1));
    }

    #[test]
    fn test_expired_connections_reaped() {
        let (ct, clock) = engine();
        let ns = ct.namespace(0);
        for port in 1000..1010 {
            udp_flow(&ct, &ns, port);
        }
        assert_eq!(ct.table().len(), 10);
        assert_eq!(ns.count(), 10);

        let mut gc = GcWorker::new(Arc::clone(&ct));
        let cycle = gc.run_cycle();
        assert_eq!(cycle.expired, 0);
        assert_eq!(cycle.scanned, 10);

        clock.advance(Duration::from_secs(31));
        let cycle = gc.run_cycle();
        assert!(cycle.complete);
        assert_eq!(cycle.expired, 10);
        assert!(ct.table().is_empty());
        assert_eq!(ns.count(), 0);
        assert_eq!(ns.stats().expired(), 10);
    }

    #[test]
    fn test_next_run_follows_remaining_lifetime() {
        let (ct, _clock) = engine();
        let ns = ct.namespace(0);
        for port in 1000..1200 {
            udp_flow(&ct, &ns, port);
        }
        let mut gc = GcWorker::new(ct);
        let cycle = gc.run_cycle();
        assert!(cycle.complete);
        // 200 flows with 30s left pull the 60s initial guess down
        assert!(cycle.next_run < Duration::from_secs(45));
        assert!(cycle.next_run >= Duration::from_millis(1));
    }

    #[test]
    fn test_next_run_clamped() {
        let (ct, clock) = engine();
        let ns = ct.namespace(0);
        let mut settings = TrackerSettings::clone(&ns.settings());
        settings.udp_unreplied_ms = 10;
        ns.update_settings(settings);
        for port in 1000..1500 {
            udp_flow(&ct, &ns, port);
        }
        let mut gc = GcWorker::new(ct);
        let cycle = gc.run_cycle();
        assert!(cycle.next_run >= Duration::from_millis(1));
        assert!(cycle.next_run <= Duration::from_millis(GC_SCAN_INTERVAL_MAX_MS));

        clock.advance(Duration::from_secs(3600));
        let cycle = gc.run_cycle();
        assert!(cycle.next_run <= Duration::from_millis(GC_SCAN_INTERVAL_MAX_MS));
    }

    #[test]
    fn test_many_expired_yields_early() {
        let (ct, clock) = engine();
        let ns = ct.namespace(0);
        for port in 1000..1200 {
            udp_flow(&ct, &ns, port);
        }
        clock.advance(Duration::from_secs(60));

        let mut gc = GcWorker::new(Arc::clone(&ct));
        let first = gc.run_cycle();
        assert!(!first.complete);
        assert_eq!(first.expired, GC_SCAN_EXPIRED_MAX + 1);
        assert_eq!(first.next_run, Duration::from_millis(1));
        assert!(gc.next_bucket() > 0);

        let mut total = first.expired;
        loop {
            let cycle = gc.run_cycle();
            total += cycle.expired;
            if cycle.complete {
                break;
            }
        }
        assert_eq!(total, 200);
        assert!(ct.table().is_empty());
    }

    #[test]
    fn test_pressure_evicts_unassured() {
        let (ct, _clock) = engine();
        ct.set_max_connections(100);
        let ns = ct.namespace(0);
        for port in 1000..1100 {
            udp_flow(&ct, &ns, port);
        }
        assert_eq!(ns.count(), 100);

        // No pressure: nothing is evicted
        let mut gc = GcWorker::new(Arc::clone(&ct));
        let cycle = gc.run_cycle();
        assert_eq!(cycle.evicted, 0);

        ct.set_pressure();
        let cycle = gc.run_cycle();
        assert!(cycle.evicted > 0);
        assert!(ns.count() < 95);
        assert!(!ct.under_pressure());
    }

    #[test]
    fn test_pressure_spares_assured() {
        let (ct, _clock) = engine();
        ct.set_max_connections(100);
        let ns = ct.namespace(0);
        for port in 1000..1100 {
            let client = addr(&format!("10.0.0.1:{port}"));
            let server = addr("10.0.0.2:80");
            let mut pkt = TcpSegment::new(client, server).syn().seq(100).build();
            assert_eq!(ct.classify(&ns, L3Proto::Ipv4, Hook::PreRouting, &mut pkt), Verdict::Accept);
            assert_eq!(ct.classify(&ns, L3Proto::Ipv4, Hook::PostRouting, &mut pkt), Verdict::Accept);
            let (conn, _) = pkt.conntrack().unwrap();
            conn.set_status(Status::ASSURED);
        }
        ct.set_pressure();
        let mut gc = GcWorker::new(Arc::clone(&ct));
        let cycle = gc.run_cycle();
        assert_eq!(cycle.evicted, 0);
        assert_eq!(ns.count(), 100);
    }

    #[test]
    fn test_pressure_evicts_assured_closing_flow() {
        let (ct, _clock) = engine();
        ct.set_max_connections(100);
        let ns = ct.namespace(0);
        let mut closing = None;
        for port in 1000..1100 {
            let client = addr(&format!("10.0.0.1:{port}"));
            let mut pkt = TcpSegment::new(client, addr("10.0.0.2:80")).syn().seq(100).build();
            assert_eq!(ct.classify(&ns, L3Proto::Ipv4, Hook::PreRouting, &mut pkt), Verdict::Accept);
            assert_eq!(ct.classify(&ns, L3Proto::Ipv4, Hook::PostRouting, &mut pkt), Verdict::Accept);
            let (conn, _) = pkt.conntrack().unwrap();
            conn.set_status(Status::ASSURED);
            if port == 1050 {
                if let ProtoState::Tcp(tcp) = &mut *conn.proto() {
                    tcp.state = TcpState::FinWait;
                }
                closing = Some(Arc::clone(conn));
            }
        }
        let closing = closing.unwrap();

        ct.set_pressure();
        let mut gc = GcWorker::new(Arc::clone(&ct));
        let cycle = gc.run_cycle();
        assert_eq!(cycle.evicted, 1);
        assert!(closing.is_dying());
        drop(closing);
        assert_eq!(ns.count(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_and_shutdown() {
        let (ct, clock) = engine();
        let ns = ct.namespace(0);
        udp_flow(&ct, &ns, 1000);
        clock.advance(Duration::from_secs(31));

        let handle = GcHandle::spawn(Arc::clone(&ct));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ct.table().is_empty());
        handle.shutdown().await;
    }
}
