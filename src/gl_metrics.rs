//! Aggregated results: the append-only metrics sink and the final run report.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::gl_error::Result;
use crate::gl_interface::{GroupId, PeerId};
use crate::gl_peer::{mean, PeerOutcome};
use crate::gl_relay::RelaySummary;

// ============================================================================
// Metrics Sink
// ============================================================================

/// One aggregated row, keyed by the scale it was measured at
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricRecord {
    PeerLatency { peers: usize, mean_ms: f64 },
    GroupLatency { groups: usize, mean_ms: f64 },
    Throughput { peers: usize, bits_per_sec: f64 },
}

impl MetricRecord {
    fn kind(&self) -> &'static str {
        match self {
            MetricRecord::PeerLatency { .. } => "peer_latency",
            MetricRecord::GroupLatency { .. } => "group_latency",
            MetricRecord::Throughput { .. } => "throughput",
        }
    }

    fn to_csv_row(&self) -> String {
        let (count, value) = match *self {
            MetricRecord::PeerLatency { peers, mean_ms } => (peers, mean_ms),
            MetricRecord::GroupLatency { groups, mean_ms } => (groups, mean_ms),
            MetricRecord::Throughput {
                peers,
                bits_per_sec,
            } => (peers, bits_per_sec),
        };
        format!("{},{},{:.3}", self.kind(), count, value)
    }
}

pub trait MetricsSink {
    fn record(&mut self, record: MetricRecord) -> Result<()>;
}

/// Discards everything
pub struct NoOpSink;

impl MetricsSink for NoOpSink {
    #[inline(always)]
    fn record(&mut self, _record: MetricRecord) -> Result<()> {
        Ok(())
    }
}

pub const CSV_HEADER: &str = "kind,count,value";

/// Appends rows to a CSV file; the header is written only when the file is
/// new or empty, so repeated runs accumulate in one table.
pub struct CsvMetricsSink {
    path: PathBuf,
}

impl CsvMetricsSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{}", CSV_HEADER)?;
            debug!("initialised metrics file {}", path.display());
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for CsvMetricsSink {
    fn record(&mut self, record: MetricRecord) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", record.to_csv_row())?;
        Ok(())
    }
}

// ============================================================================
// Simulation Report
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    pub total_peers: usize,
    pub successful: usize,
    /// Failed peers that obtained an identity
    pub failed_ids: Vec<PeerId>,
    /// Failed before registration completed
    pub failed_unregistered: usize,
    pub timeouts: usize,
    pub duplicate_acks: usize,
    pub stale_acks: usize,
    /// Mean of the successful peers' mean round latency
    pub global_mean_ms: f64,
    pub group_mean_ms: BTreeMap<GroupId, f64>,
    pub throughput_bps: Option<f64>,
    pub releases_sent: Option<usize>,
}

impl SimulationReport {
    pub fn from_outcomes(outcomes: &[PeerOutcome]) -> Self {
        let mut report = SimulationReport {
            total_peers: outcomes.len(),
            ..Default::default()
        };

        let mut per_group: BTreeMap<GroupId, Vec<f64>> = BTreeMap::new();
        let mut latencies = Vec::new();

        for outcome in outcomes {
            report.timeouts += outcome.timeouts;
            report.duplicate_acks += outcome.duplicate_acks;
            report.stale_acks += outcome.stale_acks;

            if outcome.is_success() {
                report.successful += 1;
                latencies.push(outcome.mean_latency_ms);
                if let Some(group) = outcome.group {
                    per_group
                        .entry(group)
                        .or_default()
                        .push(outcome.mean_latency_ms);
                }
            } else {
                match outcome.id {
                    Some(id) => report.failed_ids.push(id),
                    None => report.failed_unregistered += 1,
                }
            }
        }

        report.failed_ids.sort_unstable();
        report.global_mean_ms = mean(&latencies);
        report.group_mean_ms = per_group
            .into_iter()
            .map(|(group, values)| (group, mean(&values)))
            .collect();
        report
    }

    /// Attach coordinator-side counters
    pub fn with_relay(mut self, relay: &RelaySummary) -> Self {
        self.throughput_bps = Some(relay.throughput_bps());
        self.releases_sent = Some(relay.releases_sent);
        self
    }

    pub fn failed(&self) -> usize {
        self.failed_ids.len() + self.failed_unregistered
    }

    pub fn is_full_success(&self) -> bool {
        self.total_peers > 0 && self.successful == self.total_peers
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_peers == 0 {
            0.0
        } else {
            self.successful as f64 / self.total_peers as f64 * 100.0
        }
    }

    pub fn write_metrics(&self, sink: &mut dyn MetricsSink) -> Result<()> {
        sink.record(MetricRecord::PeerLatency {
            peers: self.total_peers,
            mean_ms: self.global_mean_ms,
        })?;

        let group_values: Vec<f64> = self.group_mean_ms.values().copied().collect();
        sink.record(MetricRecord::GroupLatency {
            groups: group_values.len(),
            mean_ms: mean(&group_values),
        })?;

        if let Some(bits_per_sec) = self.throughput_bps {
            sink.record(MetricRecord::Throughput {
                peers: self.total_peers,
                bits_per_sec,
            })?;
        }

        info!("metrics recorded for {} peers", self.total_peers);
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    GROUP LOCKSTEP SIMULATION RESULTS                   ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("═══ Peers ═══");
        println!("  Total: {}", self.total_peers);
        println!(
            "  Successful: {} ({:.1}%)",
            self.successful,
            self.success_rate()
        );
        println!("  Failed: {}", self.failed());
        if !self.failed_ids.is_empty() {
            let ids: Vec<String> = self.failed_ids.iter().map(|id| id.to_string()).collect();
            println!("  Failed ids: {}", ids.join(", "));
        }
        if self.failed_unregistered > 0 {
            println!("  Failed before registration: {}", self.failed_unregistered);
        }
        println!();

        println!("═══ Latency ═══");
        println!("  Global mean: {:.3} ms", self.global_mean_ms);
        for (group, latency) in &self.group_mean_ms {
            println!("  Group {:3}: {:.3} ms", group, latency);
        }
        println!();

        println!("═══ Rounds ═══");
        println!("  Timeouts: {}", self.timeouts);
        println!("  Duplicate ACKs: {}", self.duplicate_acks);
        println!("  Stale ACKs: {}", self.stale_acks);
        println!();

        if self.throughput_bps.is_some() || self.releases_sent.is_some() {
            println!("═══ Coordinator ═══");
            if let Some(releases) = self.releases_sent {
                println!("  Group releases: {}", releases);
            }
            if let Some(bps) = self.throughput_bps {
                println!("  Throughput: {:.0} bit/s", bps);
            }
            println!();
        }

        if self.is_full_success() {
            println!("Status: FULL SUCCESS");
        } else {
            println!("Status: COMPLETED WITH ERRORS");
        }
    }
}
