// Lockstep Simulator Runner

use super::config::LockstepConfig;
use gl_rust::{
    Coordinator, CoordinatorConfig, CsvMetricsSink, PeerConfig, PeerNode, PeerOutcome,
    RelaySummary, Result, SimulationReport,
};
use log::{error, info};
use std::net::{IpAddr, Ipv4Addr};
use std::thread;
use std::time::{Duration, Instant};

/// Result of one scenario run
pub struct LockstepResult {
    pub config_summary: String,
    pub report: SimulationReport,
    pub relay: Option<RelaySummary>,
    pub elapsed: Duration,
}

impl LockstepResult {
    pub fn print_summary(&self) {
        println!("Configuration: {}", self.config_summary);
        println!("Elapsed: {:.2}s", self.elapsed.as_secs_f64());
        if let Some(ref relay) = self.relay {
            println!(
                "Relay: {} datagrams in, {} out, {} malformed, {} unknown, {} dropped",
                relay.received,
                relay.relayed_datagrams,
                relay.malformed,
                relay.unknown_sender,
                relay.dropped_overload
            );
        }
        self.report.print_summary();
    }
}

pub struct LockstepRunner {
    config: LockstepConfig,
}

impl LockstepRunner {
    pub fn new(config: LockstepConfig) -> Self {
        Self { config }
    }

    pub fn run(self) -> Result<LockstepResult> {
        // rejects an uneven partition before any socket exists
        self.config.params.validate()?;

        let coordinator = Coordinator::bind(CoordinatorConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            params: self.config.params,
            relay: self.config.relay.clone(),
        })?;
        let addr = coordinator.local_addr()?;
        let started = Instant::now();

        let server = thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || coordinator.run())?;

        let mut handles = Vec::with_capacity(self.config.params.num_peers);
        for i in 0..self.config.params.num_peers {
            let peer = PeerConfig {
                coordinator: addr,
                seed: self.config.seed.map(|s| s.wrapping_add(i as u64)),
                ..self.config.peer.clone()
            };
            let handle = thread::Builder::new()
                .name(format!("peer-{}", i))
                .spawn(move || PeerNode::new(peer).run())?;
            handles.push(handle);
            thread::sleep(self.config.stagger);
        }

        let outcomes: Vec<PeerOutcome> = handles
            .into_iter()
            .filter_map(|h| match h.join() {
                Ok(outcome) => Some(outcome),
                Err(_) => {
                    error!("peer thread panicked");
                    None
                }
            })
            .collect();

        let relay = match server.join() {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(e)) => {
                error!("coordinator failed: {}", e);
                None
            }
            Err(_) => {
                error!("coordinator thread panicked");
                None
            }
        };

        let mut report = SimulationReport::from_outcomes(&outcomes);
        report.total_peers = self.config.params.num_peers;
        if let Some(ref relay) = relay {
            report = report.with_relay(relay);
        }

        if let Some(ref path) = self.config.csv_path {
            let mut sink = CsvMetricsSink::open(path)?;
            report.write_metrics(&mut sink)?;
            info!("metrics appended to {}", path.display());
        }

        Ok(LockstepResult {
            config_summary: self.config.summary(),
            report,
            relay,
            elapsed: started.elapsed(),
        })
    }
}
