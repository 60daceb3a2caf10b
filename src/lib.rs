//! # glRust - Group Lockstep Coordination
//!
//! A coordinator and peer implementation of a two-channel lockstep protocol.
//! Peers register over TCP, are partitioned into fixed-size groups, then run a
//! number of rounds over UDP: each round a peer broadcasts a position to its
//! group through the coordinator and waits for one acknowledgment from every
//! other member. When a whole group has reported completion the coordinator
//! releases its members.
//!
//! ## Core Components
//!
//! - **Message**: wire record shared by both channels
//! - **RegistrationService**: identity and group assignment (TCP)
//! - **RelayEngine**: single intake thread feeding a fixed dispatch pool (UDP)
//! - **GroupBarrier**: per-group completion count and one-shot release
//! - **PeerNode**: round driver plus listener thread on the peer side
//!
//! ```no_run
//! use gl_rust::{Coordinator, CoordinatorConfig, PeerConfig, PeerNode, SimParams};
//!
//! let coordinator = Coordinator::bind(CoordinatorConfig {
//!     params: SimParams::new(6, 3, 2),
//!     ..CoordinatorConfig::default()
//! })?;
//! let addr = coordinator.local_addr()?;
//! let server = std::thread::spawn(move || coordinator.run());
//!
//! let peers: Vec<_> = (0..6)
//!     .map(|_| {
//!         let config = PeerConfig { coordinator: addr, ..PeerConfig::default() };
//!         std::thread::spawn(move || PeerNode::new(config).run())
//!     })
//!     .collect();
//! # Ok::<(), gl_rust::GlError>(())
//! ```
//!
//! ## Testing and Simulation
//!
//! `simulator/` holds the YAML-driven scenario runner that launches a
//! coordinator and N peers inside one process.

pub mod gl_error;
pub mod gl_interface;
pub mod gl_message;

// Coordinator side
pub mod gl_barrier;
pub mod gl_coordinator;
pub mod gl_registration;
pub mod gl_registry;
pub mod gl_relay;

// Peer side
pub mod gl_peer;

pub mod gl_metrics;

// Re-export commonly used types
pub use gl_coordinator::{Coordinator, CoordinatorConfig};
pub use gl_error::{GlError, Result};
pub use gl_interface::{GroupId, Iteration, PeerId, SimParams};
pub use gl_message::{Message, MessageKind};
pub use gl_metrics::{CsvMetricsSink, MetricRecord, MetricsSink, NoOpSink, SimulationReport};
pub use gl_peer::{PeerConfig, PeerNode, PeerOutcome, PeerState};
pub use gl_relay::{RelayConfig, RelaySummary};
