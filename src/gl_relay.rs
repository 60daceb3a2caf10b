//! Coordinator relay: one intake thread feeding a fixed pool of dispatch workers.
//!
//! The intake loop is the only caller of the blocking receive. Every datagram is
//! copied out of the receive buffer before it is queued, so the next receive can
//! reuse the buffer while workers decode and relay concurrently.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, TrySendError};
use log::{debug, error, info, trace, warn};

use crate::gl_barrier::{DoneOutcome, GroupBarrier};
use crate::gl_error::{is_timeout, GlError, Result};
use crate::gl_interface::{DatagramSink, GroupId, DEFAULT_WORKER_COUNT, MAX_DATAGRAM_SIZE};
use crate::gl_message::{Message, MessageKind};
use crate::gl_registry::{PeerRecord, PeerRegistry};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Dispatch workers (fixed, independent of peer count)
    pub workers: usize,

    /// Datagrams allowed to wait for a worker before intake starts dropping
    pub queue_capacity: usize,

    /// Receive timeout so intake notices completion without further traffic
    pub intake_poll: Duration,

    /// Give up on stragglers after this long (None = wait for every DONE)
    pub max_duration: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNT,
            queue_capacity: 8192,
            intake_poll: Duration::from_millis(200),
            max_duration: None,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// A datagram whose bytes are owned, detached from the receive buffer
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct RelayStats {
    received: AtomicUsize,
    malformed: AtomicUsize,
    unknown_sender: AtomicUsize,
    dropped_overload: AtomicUsize,
    duplicate_done: AtomicUsize,
    send_failures: AtomicUsize,
    relayed_datagrams: AtomicUsize,
    relayed_bytes: AtomicU64,
}

/// Decode-and-act logic run by each worker
pub struct Dispatcher<S: DatagramSink> {
    registry: Arc<PeerRegistry>,
    barrier: Arc<GroupBarrier>,
    sink: Arc<S>,
    completed: AtomicUsize,
    stats: RelayStats,
}

impl<S: DatagramSink> Dispatcher<S> {
    pub fn new(registry: Arc<PeerRegistry>, barrier: Arc<GroupBarrier>, sink: Arc<S>) -> Self {
        Self {
            registry,
            barrier,
            sink,
            completed: AtomicUsize::new(0),
            stats: RelayStats::default(),
        }
    }

    /// Peers whose DONE has been counted
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Handle one datagram; failures are counted and logged, never propagated
    pub fn process(&self, datagram: Datagram) {
        let from = datagram.from;
        match self.handle(datagram) {
            Ok(()) => {}
            Err(GlError::MalformedMessage(reason)) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("dropping malformed datagram from {}: {}", from, reason);
            }
            Err(GlError::UnknownPeer(addr)) => {
                self.stats.unknown_sender.fetch_add(1, Ordering::Relaxed);
                debug!("dropping datagram from unregistered {}", addr);
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!("relay of datagram from {} failed: {}", from, e);
            }
        }
    }

    pub fn handle(&self, datagram: Datagram) -> Result<()> {
        let msg = Message::decode(&datagram.bytes)?;
        let sender = self
            .registry
            .lookup_addr(&datagram.from)
            .ok_or(GlError::UnknownPeer(datagram.from))?;

        trace!("peer {} -> {}", sender.id, msg);

        match msg.kind {
            MessageKind::Broadcast => self.relay_broadcast(&sender, &msg),
            MessageKind::Ack => self.relay_ack(&sender, &msg),
            MessageKind::Done => self.record_done(&sender, &msg),
            other => {
                debug!("ignoring {} from peer {}", other, sender.id);
                Ok(())
            }
        }
    }

    /// Forward to every other member of the sender's group
    fn relay_broadcast(&self, sender: &PeerRecord, msg: &Message) -> Result<()> {
        for member in self.registry.group_members(sender.group) {
            if member.id == sender.id {
                continue;
            }
            let relayed = Message::broadcast(sender.id, msg.payload.clone(), msg.iteration);
            // one unreachable member must not starve the rest of the group
            if let Err(e) = self.send(&relayed, member.addr) {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!("broadcast relay to peer {} failed: {}", member.id, e);
            }
        }
        Ok(())
    }

    /// Route an acknowledgment back to the peer that broadcast
    fn relay_ack(&self, sender: &PeerRecord, msg: &Message) -> Result<()> {
        let destination = msg.payload_peer()?;
        let target = self.registry.get(destination).ok_or_else(|| {
            GlError::MalformedMessage(format!("ACK addressed to unregistered peer {}", destination))
        })?;

        self.send(&Message::relayed_ack(sender.id, msg.iteration), target.addr)
    }

    fn record_done(&self, sender: &PeerRecord, msg: &Message) -> Result<()> {
        let latency = msg.payload_latency()?;

        let release = match self.barrier.record_done(sender, latency)? {
            DoneOutcome::Duplicate => {
                self.stats.duplicate_done.fetch_add(1, Ordering::Relaxed);
                debug!("duplicate DONE from peer {}", sender.id);
                return Ok(());
            }
            DoneOutcome::Counted { group_count } => {
                debug!(
                    "peer {} done ({:.3} ms), group {} at {}",
                    sender.id, latency, sender.group, group_count
                );
                Ok(0)
            }
            DoneOutcome::GroupComplete => {
                self.barrier.check_and_release(sender.group, self.sink.as_ref())
            }
        };

        // counted after any release burst so intake never stops ahead of it
        let finished = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        info!("peer {} finished ({} done)", sender.id, finished);
        release.map(|_| ())
    }

    fn send(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        let bytes = msg.encode()?;
        self.sink.send_to(&bytes, addr)?;
        self.stats.relayed_datagrams.fetch_add(1, Ordering::Relaxed);
        self.stats
            .relayed_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Counters collected over the relay phase
#[derive(Debug, Clone, Default)]
pub struct RelaySummary {
    pub received: usize,
    pub malformed: usize,
    pub unknown_sender: usize,
    pub dropped_overload: usize,
    pub duplicate_done: usize,
    pub send_failures: usize,
    pub relayed_datagrams: usize,
    pub relayed_bytes: u64,
    pub completed_peers: usize,
    pub releases_sent: usize,
    pub group_latency_ms: BTreeMap<GroupId, f64>,
    pub duration: Duration,
}

impl RelaySummary {
    /// Relayed payload rate over the relay phase
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            (self.relayed_bytes * 8) as f64 / secs
        } else {
            0.0
        }
    }

    /// Mean of the per-group means
    pub fn mean_latency_ms(&self) -> f64 {
        if self.group_latency_ms.is_empty() {
            0.0
        } else {
            self.group_latency_ms.values().sum::<f64>() / self.group_latency_ms.len() as f64
        }
    }
}

pub struct RelayEngine {
    socket: UdpSocket,
    dispatcher: Arc<Dispatcher<UdpSocket>>,
    barrier: Arc<GroupBarrier>,
    num_peers: usize,
    config: RelayConfig,
}

impl RelayEngine {
    pub fn new(
        socket: UdpSocket,
        registry: Arc<PeerRegistry>,
        barrier: Arc<GroupBarrier>,
        num_peers: usize,
        config: RelayConfig,
    ) -> Result<Self> {
        let sink = Arc::new(socket.try_clone()?);
        let dispatcher = Arc::new(Dispatcher::new(registry, barrier.clone(), sink));
        Ok(Self {
            socket,
            dispatcher,
            barrier,
            num_peers,
            config,
        })
    }

    /// Run until every peer reported DONE, then drain the workers
    pub fn run(self) -> Result<RelaySummary> {
        self.socket.set_read_timeout(Some(self.config.intake_poll))?;

        let (tx, rx) = channel::bounded::<Datagram>(self.config.queue_capacity.max(1));
        let workers = self.spawn_workers(rx)?;

        info!(
            "relaying for {} peers with {} workers",
            self.num_peers,
            workers.len()
        );

        let started = Instant::now();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut outcome = Ok(());

        while self.dispatcher.completed() < self.num_peers {
            if let Some(max) = self.config.max_duration {
                if started.elapsed() >= max {
                    warn!(
                        "relay deadline reached with {}/{} peers done",
                        self.dispatcher.completed(),
                        self.num_peers
                    );
                    break;
                }
            }

            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    self.dispatcher.stats.received.fetch_add(1, Ordering::Relaxed);
                    let datagram = Datagram {
                        from,
                        bytes: buf[..len].to_vec(),
                    };
                    match tx.try_send(datagram) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.dispatcher
                                .stats
                                .dropped_overload
                                .fetch_add(1, Ordering::Relaxed);
                            warn!("work queue full, dropping datagram from {}", from);
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            outcome = Err(GlError::ChannelClosed);
                            break;
                        }
                    }
                }
                Err(e) if is_timeout(&e) => continue,
                // ICMP unreachable from a peer that already left
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    error!("intake receive failed: {}", e);
                    outcome = Err(e.into());
                    break;
                }
            }
        }

        // disconnect the queue; workers finish what is already queued
        drop(tx);
        for worker in workers {
            if worker.join().is_err() {
                error!("relay worker panicked");
            }
        }

        let summary = self.summary(started.elapsed());
        info!(
            "relay finished: {}/{} peers done, {} releases, {} datagrams relayed",
            summary.completed_peers, self.num_peers, summary.releases_sent, summary.relayed_datagrams
        );

        outcome.map(|_| summary)
    }

    fn spawn_workers(&self, rx: Receiver<Datagram>) -> Result<Vec<JoinHandle<()>>> {
        let mut workers = Vec::with_capacity(self.config.workers.max(1));
        for i in 0..self.config.workers.max(1) {
            let rx = rx.clone();
            let dispatcher = self.dispatcher.clone();
            let handle = thread::Builder::new()
                .name(format!("relay-worker-{}", i))
                .spawn(move || {
                    for datagram in rx.iter() {
                        dispatcher.process(datagram);
                    }
                })?;
            workers.push(handle);
        }
        Ok(workers)
    }

    fn summary(&self, duration: Duration) -> RelaySummary {
        let stats = &self.dispatcher.stats;
        RelaySummary {
            received: stats.received.load(Ordering::Relaxed),
            malformed: stats.malformed.load(Ordering::Relaxed),
            unknown_sender: stats.unknown_sender.load(Ordering::Relaxed),
            dropped_overload: stats.dropped_overload.load(Ordering::Relaxed),
            duplicate_done: stats.duplicate_done.load(Ordering::Relaxed),
            send_failures: stats.send_failures.load(Ordering::Relaxed),
            relayed_datagrams: stats.relayed_datagrams.load(Ordering::Relaxed),
            relayed_bytes: stats.relayed_bytes.load(Ordering::Relaxed),
            completed_peers: self.dispatcher.completed(),
            releases_sent: self.barrier.releases_sent(),
            group_latency_ms: self.barrier.group_latencies(),
            duration,
        }
    }
}
