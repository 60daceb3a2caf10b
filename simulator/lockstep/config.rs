// Lockstep Simulator Configuration

use gl_rust::{PeerConfig, RelayConfig, SimParams};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Main Configuration
// ============================================================================

/// One in-process run: a loopback coordinator and N peer threads
#[derive(Debug, Clone)]
pub struct LockstepConfig {
    /// N, V, S
    pub params: SimParams,

    /// Template for every peer; the coordinator address is filled in at launch
    pub peer: PeerConfig,

    /// Coordinator dispatch settings
    pub relay: RelayConfig,

    /// Delay between peer launches
    pub stagger: Duration,

    /// Base seed; peer i uses seed + i
    pub seed: Option<u64>,

    /// Append aggregated metrics to this CSV file
    pub csv_path: Option<PathBuf>,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            params: SimParams::default(),
            peer: PeerConfig::default(),
            relay: RelayConfig {
                // a peer that fails never sends DONE
                max_duration: Some(Duration::from_secs(120)),
                ..RelayConfig::default()
            },
            stagger: Duration::from_millis(5),
            seed: None,
            csv_path: None,
        }
    }
}

impl LockstepConfig {
    pub fn summary(&self) -> String {
        format!(
            "N={} V={} S={} groups={} round_timeout={:?} ack_loss={:.0}%",
            self.params.num_peers,
            self.params.group_size,
            self.params.iterations,
            self.params.num_groups(),
            self.peer.round_timeout,
            self.peer.ack_loss_fraction * 100.0
        )
    }
}
