use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::gl_error::{GlError, Result};

// all the same numeric type to allow casting onto the wire
pub type PeerId = u32;
pub type GroupId = u32;
pub type Iteration = u32;

/// Port used for both the registration (TCP) and simulation (UDP) channel
pub const DEFAULT_PORT: u16 = 10578;

/// Largest datagram the coordinator or a peer will read
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Fixed size of the coordinator's dispatch pool, independent of N
pub const DEFAULT_WORKER_COUNT: usize = 50;

/// A round is abandoned (not retried) once this elapses without V-1 acknowledgments
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a peer checks whether its group has been released
pub const DEFAULT_RELEASE_POLL: Duration = Duration::from_millis(250);

/// Bounded wait when joining the listener thread on shutdown
pub const DEFAULT_LISTENER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Simulation Parameters
// ============================================================================

/// The fixed simulation parameters shared by the coordinator and every peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct SimParams {
    /// Total number of peers (N)
    pub num_peers: usize,

    /// Peers per group (V)
    pub group_size: usize,

    /// Lockstep rounds each peer runs (S)
    pub iterations: u32,
}

impl SimParams {
    pub fn new(num_peers: usize, group_size: usize, iterations: u32) -> Self {
        Self {
            num_peers,
            group_size,
            iterations,
        }
    }

    /// Reject partitions that would leave a group short.
    ///
    /// Must run before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.num_peers == 0 {
            return Err(GlError::InvalidConfig("peer count must be positive".into()));
        }
        if self.group_size == 0 {
            return Err(GlError::InvalidConfig("group size must be positive".into()));
        }
        if self.num_peers % self.group_size != 0 {
            return Err(GlError::InvalidConfig(format!(
                "peer count {} is not a multiple of group size {}",
                self.num_peers, self.group_size
            )));
        }
        if self.num_peers > PeerId::MAX as usize {
            return Err(GlError::InvalidConfig(format!(
                "peer count {} does not fit a peer id",
                self.num_peers
            )));
        }
        Ok(())
    }

    pub fn num_groups(&self) -> usize {
        if self.group_size == 0 {
            0
        } else {
            self.num_peers / self.group_size
        }
    }

    pub fn group_of(&self, peer: PeerId) -> GroupId {
        group_of(peer, self.group_size)
    }
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            num_peers: 6,
            group_size: 3,
            iterations: 2,
        }
    }
}

/// Group membership is contiguous id ranges of `group_size`
#[inline]
pub fn group_of(peer: PeerId, group_size: usize) -> GroupId {
    peer / group_size as u32
}

// ============================================================================
// Datagram Output
// ============================================================================

/// Send side of the unreliable channel, shared by the relay workers
pub trait DatagramSink: Send + Sync {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    #[inline]
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, bytes, addr)
    }
}
