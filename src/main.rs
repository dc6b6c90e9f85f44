//! rust-conntrack: connection tracking engine driver
//!
//! Builds the engine from a configuration file, runs the GC task, and
//! replays a synthetic TCP workload through the hooks while printing
//! statistics.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./rust-conntrack
//!
//! # Run with custom configuration and a heavier workload
//! ./rust-conntrack -c /path/to/config.json --flows 100000 --threads 8
//!
//! # Run with environment overrides
//! CONNTRACK_LOG_LEVEL=debug ./rust-conntrack --seconds 10
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use rust_conntrack::config::{create_default_config, load_config_with_env, Config};
use rust_conntrack::{Conntrack, GcHandle, Hook, L3Proto, Namespace, Packet, TcpSegment, Verdict};

const DEFAULT_CONFIG_PATH: &str = "/etc/rust-conntrack/config.json";

/// Passes allowed for a packet the engine keeps answering `Repeat` for
const MAX_REPEATS: usize = 3;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: Option<PathBuf>,
    /// Write a default configuration here and exit
    generate_config: Option<PathBuf>,
    /// Check configuration only
    check_config: bool,
    /// Distinct client flows replayed per run
    flows: usize,
    /// Workload threads
    threads: usize,
    /// Stop after this many seconds; 0 runs until interrupted
    seconds: u64,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: None,
            generate_config: None,
            check_config: false,
            flows: 10_000,
            threads: 4,
            seconds: 0,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    parsed.config_path = args.next().map(PathBuf::from);
                }
                "-g" | "--generate-config" => {
                    let path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
                    parsed.generate_config = Some(PathBuf::from(path));
                }
                "--check" => {
                    parsed.check_config = true;
                }
                "--flows" => {
                    parsed.flows = numeric(&arg, args.next());
                }
                "--threads" => {
                    parsed.threads = numeric(&arg, args.next());
                }
                "--seconds" => {
                    parsed.seconds = numeric(&arg, args.next());
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("rust-conntrack v{}", rust_conntrack::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed.threads = parsed.threads.max(1);
        parsed.flows = parsed.flows.max(parsed.threads);
        parsed
    }
}

fn numeric<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    match value.as_deref().map(str::parse) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("{flag} requires a numeric argument");
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"rust-conntrack v{}

Connection tracking engine with a synthetic TCP workload driver.

USAGE:
    rust-conntrack [OPTIONS]

OPTIONS:
    -c, --config <PATH>            Configuration file path [default: built-in defaults]
    -g, --generate-config [PATH]   Write default configuration and exit [default: {}]
    --check                        Check configuration and exit
    --flows <N>                    Distinct client flows [default: 10000]
    --threads <N>                  Workload threads [default: 4]
    --seconds <N>                  Stop after N seconds, 0 runs until Ctrl-C [default: 0]
    -h, --help                     Print help information
    -v, --version                  Print version information

ENVIRONMENT:
    CONNTRACK_LOG_LEVEL        Override log level (trace, debug, info, warn, error)
    CONNTRACK_MAX              Override maximum connections per namespace
    CONNTRACK_HASHSIZE         Override bucket count
    CONNTRACK_TCP_LOOSE        Pick up established TCP flows mid-stream (true/false)
    CONNTRACK_TCP_BE_LIBERAL   Only mark RST segments out of window (true/false)
    CONNTRACK_CHECKSUM         Verify L4 checksums (true/false)
"#,
        rust_conntrack::VERSION,
        DEFAULT_CONFIG_PATH
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Verdict counters shared by the workload threads
#[derive(Debug, Default)]
struct WorkloadStats {
    packets: AtomicU64,
    dropped: AtomicU64,
    flows: AtomicU64,
}

/// One client replaying handshake, request, response and teardown
struct FlowDriver<'a> {
    engine: &'a Conntrack,
    ns: &'a Arc<Namespace>,
    stats: &'a WorkloadStats,
}

impl FlowDriver<'_> {
    /// Locally generated packet: LOCAL_OUT then POST_ROUTING
    fn send(&self, pkt: Packet) -> bool {
        self.traverse(Hook::LocalOut, Hook::PostRouting, pkt)
    }

    /// Packet for this host: PRE_ROUTING then LOCAL_IN
    fn receive(&self, pkt: Packet) -> bool {
        self.traverse(Hook::PreRouting, Hook::LocalIn, pkt)
    }

    fn traverse(&self, entry: Hook, exit: Hook, mut pkt: Packet) -> bool {
        self.stats.packets.fetch_add(1, Ordering::Relaxed);
        let mut verdict = Verdict::Repeat;
        // A SYN reopening a closed flow asks for one more pass
        for _ in 0..MAX_REPEATS {
            verdict = self.engine.classify(self.ns, L3Proto::Ipv4, entry, &mut pkt);
            if verdict != Verdict::Repeat {
                break;
            }
        }
        if verdict == Verdict::Accept {
            verdict = self.engine.classify(self.ns, L3Proto::Ipv4, exit, &mut pkt);
        }
        self.count(verdict)
    }

    fn count(&self, verdict: Verdict) -> bool {
        if verdict == Verdict::Accept {
            true
        } else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn run(&self, client: SocketAddr, server: SocketAddr, isn: u32) {
        let c = isn;
        let s = isn.wrapping_mul(7).wrapping_add(1);
        let request = [0x47u8; 128];
        let response = [0x48u8; 512];

        let steps = [
            (true, TcpSegment::new(client, server).syn().seq(c).window(65_535).wscale(7).sack_perm()),
            (
                false,
                TcpSegment::new(server, client)
                    .syn()
                    .seq(s)
                    .ack(c.wrapping_add(1))
                    .window(65_535)
                    .wscale(7)
                    .sack_perm(),
            ),
            (true, TcpSegment::new(client, server).seq(c.wrapping_add(1)).ack(s.wrapping_add(1))),
            (
                true,
                TcpSegment::new(client, server)
                    .seq(c.wrapping_add(1))
                    .ack(s.wrapping_add(1))
                    .psh()
                    .payload(&request),
            ),
            (
                false,
                TcpSegment::new(server, client)
                    .seq(s.wrapping_add(1))
                    .ack(c.wrapping_add(129))
                    .psh()
                    .payload(&response),
            ),
            (
                true,
                TcpSegment::new(client, server)
                    .seq(c.wrapping_add(129))
                    .ack(s.wrapping_add(513))
                    .fin(),
            ),
            (
                false,
                TcpSegment::new(server, client)
                    .seq(s.wrapping_add(513))
                    .ack(c.wrapping_add(130))
                    .fin(),
            ),
            (true, TcpSegment::new(client, server).seq(c.wrapping_add(130)).ack(s.wrapping_add(514))),
        ];

        for (outbound, segment) in steps {
            let pkt = segment.build();
            let accepted = if outbound { self.send(pkt) } else { self.receive(pkt) };
            if !accepted {
                return;
            }
        }
        self.stats.flows.fetch_add(1, Ordering::Relaxed);
    }
}

fn spawn_workload(
    engine: &Arc<Conntrack>,
    args: &Args,
    stop: &Arc<AtomicBool>,
    stats: &Arc<WorkloadStats>,
) -> Vec<thread::JoinHandle<()>> {
    let per_thread = args.flows / args.threads;
    (0..args.threads)
        .map(|t| {
            let engine = Arc::clone(engine);
            let stop = Arc::clone(stop);
            let stats = Arc::clone(stats);
            thread::spawn(move || {
                let ns = engine.namespace(0);
                let driver = FlowDriver {
                    engine: &engine,
                    ns: &ns,
                    stats: &stats,
                };
                let server = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 443));
                let mut round: u32 = 0;
                while !stop.load(Ordering::Relaxed) {
                    for i in 0..per_thread {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let host = u32::try_from(i / 50_000).unwrap_or(0);
                        let port = 1024 + u16::try_from(i % 50_000).unwrap_or(0);
                        let ip = Ipv4Addr::from(0x0a00_0000 | (u32::try_from(t).unwrap_or(0) << 16) | host);
                        let client = SocketAddr::V4(SocketAddrV4::new(ip, port));
                        let isn = rand::random::<u32>() ^ round;
                        driver.run(client, server, isn);
                    }
                    round = round.wrapping_add(1);
                }
            })
        })
        .collect()
}

fn print_snapshot(engine: &Conntrack, stats: &WorkloadStats, started: Instant) {
    let snapshot = serde_json::json!({
        "elapsed_secs": started.elapsed().as_secs_f64(),
        "connections": engine.table().len(),
        "buckets": engine.table().size(),
        "packets": stats.packets.load(Ordering::Relaxed),
        "dropped": stats.dropped.load(Ordering::Relaxed),
        "flows_completed": stats.flows.load(Ordering::Relaxed),
        "namespaces": engine.stats(),
    });
    println!("{snapshot}");
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if let Some(path) = &args.generate_config {
        create_default_config(path)?;
        println!("Generated default configuration at {}", path.display());
        return Ok(());
    }

    // Load configuration
    let config = match &args.config_path {
        Some(path) => load_config_with_env(path)
            .map_err(|e| anyhow::anyhow!("Failed to load configuration from {}: {}", path.display(), e))?,
        None => {
            let mut config = Config::default();
            rust_conntrack::config::apply_env_overrides(&mut config)?;
            config.validate()?;
            config
        }
    };

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("rust-conntrack v{}", rust_conntrack::VERSION);
    if let Some(path) = &args.config_path {
        info!("Configuration loaded from {}", path.display());
    }

    let gc_enabled = config.gc.enabled;
    let engine = Arc::new(Conntrack::builder(config).build()?);
    let gc = gc_enabled.then(|| GcHandle::spawn(Arc::clone(&engine)));
    if gc.is_none() {
        warn!("gc disabled; expired connections are only reaped by lookups");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(WorkloadStats::default());
    let workers = spawn_workload(&engine, &args, &stop, &stats);

    info!(
        "Workload started: {} flows on {} threads, startup took {:.2}ms",
        args.flows,
        args.threads,
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let run_for = async {
        if args.seconds == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(args.seconds)).await;
        }
    };
    let ctrl_c = signal::ctrl_c();
    let sigterm = wait_for_sigterm();
    tokio::pin!(run_for, ctrl_c, sigterm);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                print_snapshot(&engine, &stats, start_time);
            }
            () = &mut run_for => {
                info!("Run time elapsed, stopping...");
                break;
            }
            _ = &mut ctrl_c => {
                info!("Received SIGINT, initiating shutdown...");
                break;
            }
            () = &mut sigterm => {
                info!("Received SIGTERM, initiating shutdown...");
                break;
            }
        }
    }

    // Graceful shutdown
    stop.store(true, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || {
        for worker in workers {
            if worker.join().is_err() {
                warn!("workload thread panicked");
            }
        }
    })
    .await?;

    if let Some(gc) = gc {
        gc.shutdown().await;
    }

    print_snapshot(&engine, &stats, start_time);
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await;
}
