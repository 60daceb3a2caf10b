// Scenario Runner - Load and execute lockstep scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/basic.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/basic.yaml --seed 42 --verbose

mod lockstep;

use lockstep::{LockstepConfig, LockstepRunner};
use gl_rust::SimParams;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scenario file format
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    /// Scenario metadata
    #[serde(default)]
    meta: ScenarioMeta,

    /// Configuration
    config: ScenarioConfig,

    /// Output options
    #[serde(default)]
    output: OutputOverrides,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,

    /// Configuration is expected to fail validation
    #[serde(default)]
    expect_rejected: bool,
}

#[derive(Debug, serde::Deserialize)]
struct ScenarioConfig {
    // Core settings (N, V, S)
    #[serde(flatten)]
    params: SimParams,

    #[serde(default = "default_stagger")]
    stagger_ms: u64,

    // Peer config overrides (optional)
    #[serde(default)]
    peer: Option<PeerOverrides>,

    // Coordinator config overrides (optional)
    #[serde(default)]
    coordinator: Option<CoordinatorOverrides>,

    // Network config overrides (optional)
    #[serde(default)]
    network: Option<NetworkOverrides>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct PeerOverrides {
    round_timeout_ms: Option<u64>,
    start_timeout_ms: Option<u64>,
    release_poll_ms: Option<u64>,
    release_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct CoordinatorOverrides {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    max_duration_ms: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct NetworkOverrides {
    /// Inbound ACK loss on every peer
    loss_fraction: Option<f64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct OutputOverrides {
    csv: Option<PathBuf>,
    #[serde(default)]
    verbose: bool,
}

fn default_stagger() -> u64 {
    5
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed N] [--verbose]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/basic.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/lossy_acks.yaml --seed 42", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);

    // Parse optional flags
    let mut seed: Option<u64> = None;
    let mut verbose = false;
    let mut rest = args[2..].iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--seed" => {
                seed = rest.next().and_then(|s| s.parse().ok());
                if seed.is_none() {
                    eprintln!("Invalid or missing value for --seed");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbose = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
    }

    let scenarios = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        find_scenarios(path)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    let scenarios: Vec<(PathBuf, ScenarioFile)> = scenarios
        .into_iter()
        .map(|p| {
            let scenario = load_scenario(&p);
            (p, scenario)
        })
        .collect();

    let level = if verbose || scenarios.iter().any(|(_, s)| s.output.verbose) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new().with_level(level).init().unwrap();

    if scenarios.len() > 1 {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║  SCENARIO RUNNER - Multiple Scenarios                  ║");
        println!("╚════════════════════════════════════════════════════════╝\n");
        println!("Found {} scenario(s) to run\n", scenarios.len());
    }

    let total = scenarios.len();
    let mut failures = 0;
    for (i, (scenario_path, scenario)) in scenarios.into_iter().enumerate() {
        if total > 1 {
            println!("\n{}/{} Running: {}\n", i + 1, total, scenario_path.display());
        }
        if !run_scenario(&scenario_path, scenario, seed) {
            failures += 1;
        }
    }

    if total > 1 {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║  All scenarios complete!                               ║");
        println!("╚════════════════════════════════════════════════════════╝\n");
    }

    if failures > 0 {
        std::process::exit(1);
    }
}

fn find_scenarios(dir: &Path) -> Vec<PathBuf> {
    let mut scenarios = Vec::new();

    // Find all .yaml files
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some("yaml") || ext == Some("yml") {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }
    scenarios
}

fn load_scenario(path: &Path) -> ScenarioFile {
    let yaml_content = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path.display(), e);
        std::process::exit(1);
    });

    serde_yaml::from_str(&yaml_content).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path.display(), e);
        std::process::exit(1);
    })
}

/// Returns true when the scenario behaved as expected: full success, or
/// rejection for scenarios marked `expect_rejected`
fn run_scenario(path: &Path, scenario: ScenarioFile, seed: Option<u64>) -> bool {
    // Print scenario header
    println!("\n╔════════════════════════════════════════════════════════╗");
    let title = match scenario.meta.name {
        Some(ref name) => name.clone(),
        None => format!(
            "Scenario: {}",
            path.file_stem().and_then(|s| s.to_str()).unwrap_or("?")
        ),
    };
    println!("║  {}{}║", title, " ".repeat(54_usize.saturating_sub(title.len())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let expect_rejected = scenario.meta.expect_rejected;

    // Build configuration
    let mut config = LockstepConfig {
        params: scenario.config.params,
        stagger: Duration::from_millis(scenario.config.stagger_ms),
        seed,
        csv_path: scenario.output.csv,
        ..LockstepConfig::default()
    };

    // Apply peer overrides
    if let Some(ref peer) = scenario.config.peer {
        if let Some(v) = peer.round_timeout_ms {
            config.peer.round_timeout = Duration::from_millis(v);
        }
        if let Some(v) = peer.start_timeout_ms {
            config.peer.start_timeout = Duration::from_millis(v);
        }
        if let Some(v) = peer.release_poll_ms {
            config.peer.release_poll = Duration::from_millis(v);
        }
        if let Some(v) = peer.release_timeout_ms {
            config.peer.release_timeout = Duration::from_millis(v);
        }
    }

    // Apply coordinator overrides
    if let Some(ref coordinator) = scenario.config.coordinator {
        if let Some(v) = coordinator.workers {
            config.relay.workers = v;
        }
        if let Some(v) = coordinator.queue_capacity {
            config.relay.queue_capacity = v;
        }
        if let Some(v) = coordinator.max_duration_ms {
            config.relay.max_duration = Some(Duration::from_millis(v));
        }
    }

    // Apply network overrides
    if let Some(ref network) = scenario.config.network {
        if let Some(v) = network.loss_fraction {
            config.peer.ack_loss_fraction = v.clamp(0.0, 1.0);
        }
    }

    println!("Configuration:");
    println!("  Peers: {}", config.params.num_peers);
    println!("  Group Size: {}", config.params.group_size);
    println!("  Iterations: {}", config.params.iterations);
    println!("  Round Timeout: {:?}", config.peer.round_timeout);
    println!("  Workers: {}", config.relay.workers);
    println!("\nStarting simulation...\n");

    match LockstepRunner::new(config).run() {
        Ok(result) => {
            result.print_summary();
            println!("\n✓ Scenario complete!\n");
            !expect_rejected && result.report.is_full_success()
        }
        Err(e) => {
            if expect_rejected {
                println!("✓ Scenario rejected as expected: {}\n", e);
            } else {
                println!("✗ Scenario rejected: {}\n", e);
            }
            expect_rejected
        }
    }
}
