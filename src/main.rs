// gl_node - run one side of the protocol as its own process
//
// Usage:
//   gl_node coordinator --peers 6 --group 3 --iterations 2 [--port 10578] [--workers 50]
//   gl_node peers --server 127.0.0.1:10578 --count 6 [--round-timeout-ms 10000] [--csv out.csv]
//
// Add --verbose to either for debug logging.

use std::collections::{HashMap, HashSet};
use std::env;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::process;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use gl_rust::gl_interface::{DEFAULT_PORT, DEFAULT_WORKER_COUNT};
use gl_rust::{
    Coordinator, CoordinatorConfig, CsvMetricsSink, MetricRecord, MetricsSink, PeerConfig,
    PeerNode, RelayConfig, SimParams, SimulationReport,
};

const SWITCHES: &[&str] = &["--verbose"];

/// `--name value` pairs plus bare switches
struct Flags {
    values: HashMap<String, String>,
    switches: HashSet<String>,
}

impl Flags {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut values = HashMap::new();
        let mut switches = HashSet::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if !arg.starts_with("--") {
                return Err(format!("unexpected argument: {}", arg));
            }
            if SWITCHES.contains(&arg.as_str()) {
                switches.insert(arg.clone());
                continue;
            }
            let value = iter
                .next()
                .ok_or_else(|| format!("missing value for {}", arg))?;
            values.insert(arg.clone(), value.clone());
        }

        Ok(Self { values, switches })
    }

    fn get<T: FromStr>(&self, name: &str, default: T) -> Result<T, String> {
        match self.values.get(name) {
            Some(raw) => raw
                .parse()
                .map_err(|_| format!("invalid value for {}: {}", name, raw)),
            None => Ok(default),
        }
    }

    fn require(&self, name: &str) -> Result<&str, String> {
        self.values
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| format!("{} is required", name))
    }

    fn has(&self, name: &str) -> bool {
        self.switches.contains(name)
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        usage(&args[0]);
        process::exit(1);
    }

    let flags = Flags::parse(&args[2..]).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        usage(&args[0]);
        process::exit(1);
    });

    let level = if flags.has("--verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new().with_level(level).init().unwrap();

    let result = match args[1].as_str() {
        "coordinator" => run_coordinator(&flags),
        "peers" => run_peers(&flags),
        other => {
            eprintln!("Unknown command: {}", other);
            usage(&args[0]);
            process::exit(1);
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

fn usage(program: &str) {
    eprintln!("Usage: {} <coordinator | peers> [options]", program);
    eprintln!("\nCoordinator options:");
    eprintln!("  --peers N  --group V  --iterations S  [--bind IP] [--port P] [--workers W] [--csv PATH]");
    eprintln!("\nPeer options:");
    eprintln!("  --server HOST:PORT  --count K  [--round-timeout-ms T] [--stagger-ms D] [--csv PATH]");
    eprintln!("\nCommon:");
    eprintln!("  --verbose");
}

fn run_coordinator(flags: &Flags) -> Result<(), String> {
    let params = SimParams::new(
        flags.get("--peers", 6)?,
        flags.get("--group", 3)?,
        flags.get("--iterations", 2)?,
    );

    let defaults = CoordinatorConfig::default();
    let config = CoordinatorConfig {
        bind_ip: flags.get::<IpAddr>("--bind", defaults.bind_ip)?,
        port: flags.get("--port", DEFAULT_PORT)?,
        params,
        relay: RelayConfig {
            workers: flags.get("--workers", DEFAULT_WORKER_COUNT)?,
            ..RelayConfig::default()
        },
    };

    let coordinator = Coordinator::bind(config).map_err(|e| e.to_string())?;
    let summary = coordinator.run().map_err(|e| e.to_string())?;

    if let Some(path) = flags.values.get("--csv") {
        let mut sink = CsvMetricsSink::open(path).map_err(|e| e.to_string())?;
        sink.record(MetricRecord::Throughput {
            peers: params.num_peers,
            bits_per_sec: summary.throughput_bps(),
        })
        .map_err(|e| e.to_string())?;
    }

    Ok(())
}

fn run_peers(flags: &Flags) -> Result<(), String> {
    let server = resolve(flags.require("--server")?)?;
    let count: usize = flags.get("--count", 1)?;
    let stagger = Duration::from_millis(flags.get("--stagger-ms", 5)?);

    let config = PeerConfig {
        coordinator: server,
        round_timeout: Duration::from_millis(flags.get("--round-timeout-ms", 10_000)?),
        ..PeerConfig::default()
    };

    info!("launching {} peers against {}", count, server);
    let started = Instant::now();

    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let config = config.clone();
        let handle = thread::Builder::new()
            .name(format!("peer-{}", i))
            .spawn(move || PeerNode::new(config).run())
            .map_err(|e| e.to_string())?;
        handles.push(handle);
        thread::sleep(stagger);
    }

    let mut outcomes = Vec::with_capacity(count);
    for handle in handles {
        match handle.join() {
            Ok(outcome) => outcomes.push(outcome),
            Err(_) => error!("peer thread panicked"),
        }
    }

    let report = SimulationReport::from_outcomes(&outcomes);
    report.print_summary();
    info!("peers finished in {:.2}s", started.elapsed().as_secs_f64());

    if let Some(path) = flags.values.get("--csv") {
        let mut sink = CsvMetricsSink::open(path).map_err(|e| e.to_string())?;
        report.write_metrics(&mut sink).map_err(|e| e.to_string())?;
    }

    if report.is_full_success() {
        Ok(())
    } else {
        Err(format!("{} of {} peers failed", report.failed(), report.total_peers))
    }
}

fn resolve(server: &str) -> Result<SocketAddr, String> {
    server
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}: {}", server, e))?
        .next()
        .ok_or_else(|| format!("no address for {}", server))
}
