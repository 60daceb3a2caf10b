use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use log::{debug, error, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::gl_error::{is_timeout, GlError, Result};
use crate::gl_interface::{
    GroupId, Iteration, PeerId, DEFAULT_LISTENER_JOIN_TIMEOUT, DEFAULT_PORT, DEFAULT_RELEASE_POLL,
    DEFAULT_ROUND_TIMEOUT, MAX_DATAGRAM_SIZE,
};
use crate::gl_message::{Message, MessageKind};
use crate::gl_registration::{register_with_coordinator, Registration};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Coordinator address, same port for registration and simulation
    pub coordinator: SocketAddr,

    // ===== Round Timing =====
    /// Abandon a round after this long without V-1 acknowledgments (default: 10s)
    pub round_timeout: Duration,

    /// How long to wait for START after registering (default: 60s)
    pub start_timeout: Duration,

    // ===== Release =====
    /// Check interval for the release flag (default: 250ms)
    pub release_poll: Duration,

    /// Fail if the group is not released within this long (default: 60s)
    pub release_timeout: Duration,

    // ===== Listener =====
    /// Listener receive timeout; bounds how quickly it notices cancellation
    pub listener_poll: Duration,

    /// Bounded join on shutdown (default: 1s)
    pub listener_join_timeout: Duration,

    // ===== Fault Injection =====
    /// Fraction of inbound ACKs silently discarded (0.0 to 1.0)
    pub ack_loss_fraction: f64,

    /// Seed for payloads and loss decisions (None = entropy)
    pub seed: Option<u64>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            coordinator: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            start_timeout: Duration::from_secs(60),
            release_poll: DEFAULT_RELEASE_POLL,
            release_timeout: Duration::from_secs(60),
            listener_poll: Duration::from_millis(100),
            listener_join_timeout: DEFAULT_LISTENER_JOIN_TIMEOUT,
            ack_loss_fraction: 0.0,
            seed: None,
        }
    }
}

// ============================================================================
// Peer State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Registering,
    AwaitingStart,
    /// Lockstep round, 1-based
    Round(Iteration),
    Reporting,
    AwaitingRelease,
    Terminated,
    /// Absorbing; reachable from every other state
    Failed,
}

/// Everything a finished (or failed) peer hands back to its launcher
#[derive(Debug, Clone)]
pub struct PeerOutcome {
    pub id: Option<PeerId>,
    pub group: Option<GroupId>,
    pub state: PeerState,
    pub round_times_ms: Vec<f64>,
    /// Distinct acknowledgments counted when each round ended
    pub round_acks: Vec<usize>,
    /// Arithmetic mean of `round_times_ms` (0 for zero rounds)
    pub mean_latency_ms: f64,
    pub timeouts: usize,
    pub duplicate_acks: usize,
    pub stale_acks: usize,
    pub error: Option<String>,
}

impl Default for PeerOutcome {
    fn default() -> Self {
        Self {
            id: None,
            group: None,
            state: PeerState::Registering,
            round_times_ms: Vec::new(),
            round_acks: Vec::new(),
            mean_latency_ms: 0.0,
            timeouts: 0,
            duplicate_acks: 0,
            stale_acks: 0,
            error: None,
        }
    }
}

impl PeerOutcome {
    pub fn is_success(&self) -> bool {
        self.state == PeerState::Terminated
    }
}

// ============================================================================
// Round Acknowledgments
// ============================================================================

/// How an inbound acknowledgment was treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    Counted,
    /// Same acknowledging peer already counted this round
    Duplicate,
    /// Tagged with another round's iteration
    Stale,
}

#[derive(Debug, Default)]
struct AckState {
    iteration: Iteration,
    from: HashSet<PeerId>,
    duplicates: usize,
    stale: usize,
}

/// The only state shared between the round driver and the listener
#[derive(Debug, Default)]
pub struct RoundAcks {
    state: Mutex<AckState>,
    changed: Condvar,
}

impl RoundAcks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clear the set and accept only `iteration` from now on
    pub fn begin_round(&self, iteration: Iteration) {
        let mut state = self.lock();
        state.iteration = iteration;
        state.from.clear();
    }

    pub fn record(&self, iteration: Iteration, from: PeerId) -> AckRecord {
        let mut state = self.lock();
        if iteration != state.iteration {
            state.stale += 1;
            return AckRecord::Stale;
        }
        if !state.from.insert(from) {
            state.duplicates += 1;
            return AckRecord::Duplicate;
        }
        self.changed.notify_all();
        AckRecord::Counted
    }

    /// Block until `expected` distinct peers acknowledged the current round.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_for(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.from.len() < expected {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    pub fn count(&self) -> usize {
        self.lock().from.len()
    }

    pub fn duplicates(&self) -> usize {
        self.lock().duplicates
    }

    pub fn stale(&self) -> usize {
        self.lock().stale
    }
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerStats {
    pub acks_sent: usize,
    pub acks_dropped: usize,
    pub malformed: usize,
}

struct ListenerContext {
    id: PeerId,
    socket: UdpSocket,
    acks: Arc<RoundAcks>,
    released: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    ack_loss_fraction: f64,
    rng: StdRng,
}

/// Owns the receive path from START until the peer terminates
struct Listener {
    acks: Arc<RoundAcks>,
    released: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<ListenerStats>>,
}

impl Listener {
    fn spawn(id: PeerId, socket: UdpSocket, ack_loss_fraction: f64, rng: StdRng) -> Result<Self> {
        let acks = Arc::new(RoundAcks::new());
        let released = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let ctx = ListenerContext {
            id,
            socket,
            acks: acks.clone(),
            released: released.clone(),
            stop: stop.clone(),
            ack_loss_fraction: ack_loss_fraction.clamp(0.0, 1.0),
            rng,
        };

        let handle = thread::Builder::new()
            .name(format!("peer-{}-listener", id))
            .spawn(move || run_listener(ctx))?;

        Ok(Self {
            acks,
            released,
            stop,
            handle,
        })
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and join with a bounded wait; a listener that does not stop in
    /// time is left detached.
    fn shutdown(self, id: PeerId, timeout: Duration) -> Option<ListenerStats> {
        self.stop.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("peer {}: listener did not stop within {:?}", id, timeout);
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }

        match self.handle.join() {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                warn!("peer {}: listener ended with {}", id, e);
                None
            }
            Err(_) => {
                error!("peer {}: listener panicked", id);
                None
            }
        }
    }
}

fn run_listener(mut ctx: ListenerContext) -> Result<ListenerStats> {
    let mut stats = ListenerStats::default();
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while !ctx.stop.load(Ordering::SeqCst) {
        let (len, from) = match ctx.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if is_timeout(&e) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                if ctx.stop.load(Ordering::SeqCst) {
                    break;
                }
                error!("peer {}: receive failed: {}", ctx.id, e);
                return Err(GlError::ChannelClosed);
            }
        };

        let msg = match Message::decode(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                stats.malformed += 1;
                warn!("peer {}: {}", ctx.id, e);
                continue;
            }
        };

        match msg.kind {
            MessageKind::Broadcast => {
                let ack = Message::ack(ctx.id, msg.sender, msg.iteration);
                match ctx.socket.send_to(&ack.encode()?, from) {
                    Ok(_) => stats.acks_sent += 1,
                    Err(e) => warn!("peer {}: ack to {} failed: {}", ctx.id, msg.sender, e),
                }
            }
            MessageKind::Ack => {
                if ctx.ack_loss_fraction > 0.0 && ctx.rng.gen_bool(ctx.ack_loss_fraction) {
                    stats.acks_dropped += 1;
                    continue;
                }
                let record = ctx.acks.record(msg.iteration, msg.sender);
                trace!(
                    "peer {}: ack from {} it:{} {:?}",
                    ctx.id,
                    msg.sender,
                    msg.iteration,
                    record
                );
            }
            MessageKind::GroupRelease => {
                debug!("peer {}: group released", ctx.id);
                ctx.released.store(true, Ordering::SeqCst);
            }
            other => trace!("peer {}: ignoring {}", ctx.id, other),
        }
    }

    Ok(stats)
}

// ============================================================================
// Round Driver
// ============================================================================

pub struct PeerNode {
    config: PeerConfig,
    state: PeerState,
    id: Option<PeerId>,
    rng: StdRng,
}

impl PeerNode {
    pub fn new(config: PeerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            state: PeerState::Registering,
            id: None,
            rng,
        }
    }

    /// Drive the whole lifecycle. Never panics on protocol or I/O failure;
    /// the outcome is `Failed` instead.
    pub fn run(mut self) -> PeerOutcome {
        let mut outcome = PeerOutcome::default();

        match self.drive(&mut outcome) {
            Ok(()) => self.transition(PeerState::Terminated),
            Err(e) if e.is_timeout() => {
                warn!("peer {:?}: timed out in {:?}: {}", self.id, self.state, e);
                outcome.error = Some(e.to_string());
                self.transition(PeerState::Failed);
            }
            Err(e) => {
                error!("peer {:?}: failed in {:?}: {}", self.id, self.state, e);
                outcome.error = Some(e.to_string());
                self.transition(PeerState::Failed);
            }
        }

        outcome.state = self.state;
        outcome
    }

    fn transition(&mut self, next: PeerState) {
        trace!("peer {:?}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    fn drive(&mut self, outcome: &mut PeerOutcome) -> Result<()> {
        let coordinator = self.config.coordinator;
        let socket = UdpSocket::bind(SocketAddr::new(local_bind_ip(coordinator.ip()), 0))?;

        let registration = register_with_coordinator(coordinator, socket.local_addr()?.port())?;
        self.id = Some(registration.id);
        outcome.id = Some(registration.id);
        outcome.group = Some(registration.group);
        info!(
            "peer {} registered in group {} (V={}, S={})",
            registration.id, registration.group, registration.group_size, registration.iterations
        );

        self.transition(PeerState::AwaitingStart);
        self.await_start(&socket)?;

        socket.set_read_timeout(Some(self.config.listener_poll))?;
        let listener_rng = StdRng::seed_from_u64(self.rng.gen());
        let listener = Listener::spawn(
            registration.id,
            socket.try_clone()?,
            self.config.ack_loss_fraction,
            listener_rng,
        )?;

        let result = self
            .run_rounds(&socket, &registration, &listener, outcome)
            .and_then(|mean| self.report(&socket, &registration, mean))
            .and_then(|_| self.await_release(&listener));

        outcome.duplicate_acks = listener.acks.duplicates();
        outcome.stale_acks = listener.acks.stale();
        listener.shutdown(registration.id, self.config.listener_join_timeout);

        result
    }

    fn await_start(&mut self, socket: &UdpSocket) -> Result<()> {
        socket.set_read_timeout(Some(self.config.start_timeout))?;

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = socket.recv_from(&mut buf)?;
        let msg = Message::decode(&buf[..len])?;

        if msg.kind != MessageKind::Start {
            return Err(GlError::ProtocolViolation(format!(
                "expected START, got {}",
                msg.kind
            )));
        }
        debug!("peer {:?}: start received", self.id);
        Ok(())
    }

    /// Returns the mean round duration in milliseconds
    fn run_rounds(
        &mut self,
        socket: &UdpSocket,
        registration: &Registration,
        listener: &Listener,
        outcome: &mut PeerOutcome,
    ) -> Result<f64> {
        let expected = registration.group_size.saturating_sub(1);

        for iteration in 1..=registration.iterations {
            self.transition(PeerState::Round(iteration));
            listener.acks.begin_round(iteration);

            let msg = Message::broadcast(registration.id, self.random_position(), iteration);
            let bytes = msg.encode()?;

            let started = Instant::now();
            socket.send_to(&bytes, self.config.coordinator)?;

            // best effort: missing acknowledgments are not re-requested
            if !listener.acks.wait_for(expected, self.config.round_timeout) {
                outcome.timeouts += 1;
                warn!(
                    "peer {}: {} ({}/{} acks)",
                    registration.id,
                    GlError::RoundTimeout { iteration },
                    listener.acks.count(),
                    expected
                );
            }

            outcome
                .round_times_ms
                .push(started.elapsed().as_secs_f64() * 1000.0);
            outcome.round_acks.push(listener.acks.count());
        }

        outcome.mean_latency_ms = mean(&outcome.round_times_ms);
        Ok(outcome.mean_latency_ms)
    }

    fn report(&mut self, socket: &UdpSocket, registration: &Registration, mean_ms: f64) -> Result<()> {
        self.transition(PeerState::Reporting);
        let done = Message::done(registration.id, mean_ms, registration.iterations);
        socket.send_to(&done.encode()?, self.config.coordinator)?;
        debug!("peer {}: reported mean {:.3} ms", registration.id, mean_ms);
        Ok(())
    }

    fn await_release(&mut self, listener: &Listener) -> Result<()> {
        self.transition(PeerState::AwaitingRelease);

        let started = Instant::now();
        while !listener.is_released() {
            if listener.is_finished() {
                return Err(GlError::ChannelClosed);
            }
            if started.elapsed() >= self.config.release_timeout {
                return Err(GlError::ProtocolViolation(format!(
                    "no GROUP_RELEASE within {:?}",
                    self.config.release_timeout
                )));
            }
            thread::sleep(self.config.release_poll);
        }
        Ok(())
    }

    fn random_position(&mut self) -> String {
        format!(
            "({},{},{})",
            self.rng.gen_range(0..=100),
            self.rng.gen_range(0..=100),
            self.rng.gen_range(0..=100)
        )
    }
}

/// Arithmetic mean, 0 for an empty slice
/// Same address family as the coordinator, so its START can reach us
fn local_bind_ip(coordinator: IpAddr) -> IpAddr {
    match coordinator {
        IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(ip) if ip.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[4.0]), 4.0);
        assert_eq!(mean(&[10.0, 20.0]), 15.0);
    }

    #[test]
    fn test_acks_filtered_by_iteration() {
        let acks = RoundAcks::new();
        acks.begin_round(2);

        assert_eq!(acks.record(1, 5), AckRecord::Stale);
        assert_eq!(acks.record(3, 5), AckRecord::Stale);
        assert_eq!(acks.count(), 0);

        assert_eq!(acks.record(2, 5), AckRecord::Counted);
        assert_eq!(acks.count(), 1);
        assert_eq!(acks.stale(), 2);
    }

    #[test]
    fn test_duplicate_ack_counted_once() {
        let acks = RoundAcks::new();
        acks.begin_round(1);

        assert_eq!(acks.record(1, 3), AckRecord::Counted);
        assert_eq!(acks.record(1, 3), AckRecord::Duplicate);
        assert_eq!(acks.count(), 1);
        assert_eq!(acks.duplicates(), 1);
        assert!(!acks.wait_for(2, Duration::from_millis(20)));
    }

    #[test]
    fn test_begin_round_clears_previous() {
        let acks = RoundAcks::new();
        acks.begin_round(1);
        acks.record(1, 1);
        acks.record(1, 2);
        assert_eq!(acks.count(), 2);

        acks.begin_round(2);
        assert_eq!(acks.count(), 0);
        // late ack from round 1 does not count toward round 2
        assert_eq!(acks.record(1, 1), AckRecord::Stale);
        assert!(!acks.wait_for(1, Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_for_zero_expected_returns_immediately() {
        let acks = RoundAcks::new();
        acks.begin_round(1);
        assert!(acks.wait_for(0, Duration::from_millis(0)));
    }

    #[test]
    fn test_wait_for_wakes_on_concurrent_record() {
        let acks = Arc::new(RoundAcks::new());
        acks.begin_round(4);

        let writer = {
            let acks = acks.clone();
            thread::spawn(move || {
                for from in [1, 2] {
                    thread::sleep(Duration::from_millis(20));
                    acks.record(4, from);
                }
            })
        };

        let started = Instant::now();
        assert!(acks.wait_for(2, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        writer.join().unwrap();
    }

    #[test]
    fn test_listener_acks_broadcast_and_sets_release() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let coordinator = UdpSocket::bind("127.0.0.1:0").unwrap();
        coordinator
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let listener = Listener::spawn(7, peer, 0.0, StdRng::seed_from_u64(1)).unwrap();
        listener.acks.begin_round(3);

        let send = |msg: Message| {
            coordinator.send_to(&msg.encode().unwrap(), peer_addr).unwrap();
        };

        send(Message::broadcast(6, "(1,1,1)", 3));
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = coordinator.recv_from(&mut buf).unwrap();
        assert_eq!(Message::decode(&buf[..len]).unwrap(), Message::ack(7, 6, 3));

        send(Message::relayed_ack(8, 3));
        assert!(listener.acks.wait_for(1, Duration::from_secs(5)));

        send(Message::group_release());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !listener.is_released() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(listener.is_released());

        let stats = listener.shutdown(7, Duration::from_secs(2)).unwrap();
        assert_eq!(stats.acks_sent, 1);
    }

    #[test]
    fn test_listener_drops_all_acks_under_full_loss() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let listener = Listener::spawn(0, peer, 1.0, StdRng::seed_from_u64(9)).unwrap();
        listener.acks.begin_round(1);
        for from in 1..3 {
            sender
                .send_to(&Message::relayed_ack(from, 1).encode().unwrap(), peer_addr)
                .unwrap();
        }

        assert!(!listener.acks.wait_for(1, Duration::from_millis(200)));
        let stats = listener.shutdown(0, Duration::from_secs(2)).unwrap();
        assert_eq!(stats.acks_dropped, 2);
    }

    #[test]
    fn test_bind_ip_follows_coordinator_family() {
        let cases = [
            ("127.0.0.1", "127.0.0.1"),
            ("10.0.0.5", "0.0.0.0"),
            ("::1", "::1"),
            ("fe80::1", "::"),
        ];
        for (coordinator, expected) in cases {
            let bound = local_bind_ip(coordinator.parse().unwrap());
            assert_eq!(bound, expected.parse::<IpAddr>().unwrap(), "{}", coordinator);
            assert_eq!(bound.is_ipv6(), coordinator.contains(':'));
        }
    }

    #[test]
    fn test_non_start_message_fails_peer() {
        use std::io::{Read, Write};

        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let coordinator = tcp.local_addr().unwrap();

        // hands out id 0 in a group of two, then sends a BROADCAST where START belongs
        let fake = thread::spawn(move || {
            let (mut stream, remote) = tcp.accept().unwrap();
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).unwrap();
            let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut frame).unwrap();
            let request = Message::decode(&frame).unwrap();
            assert_eq!(request.kind, MessageKind::RegisterRequest);
            let udp_port: u16 = request.payload.parse().unwrap();

            let reply = Message::new(MessageKind::RegisterReply, 0, "0,2", 1)
                .encode()
                .unwrap();
            stream.write_all(&(reply.len() as u32).to_be_bytes()).unwrap();
            stream.write_all(&reply).unwrap();
            drop(stream);

            let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
            let peer_addr = SocketAddr::new(remote.ip(), udp_port);
            // the peer's socket is bound before it registers, so this queues
            let stray = Message::broadcast(1, "(1,1,1)", 1).encode().unwrap();
            udp.send_to(&stray, peer_addr).unwrap();
        });

        let outcome = PeerNode::new(PeerConfig {
            coordinator,
            start_timeout: Duration::from_secs(5),
            ..PeerConfig::default()
        })
        .run();
        fake.join().unwrap();

        assert_eq!(outcome.state, PeerState::Failed);
        assert_eq!(outcome.id, Some(0));
        assert_eq!(outcome.group, Some(0));
        let error = outcome.error.unwrap();
        assert!(error.contains("protocol violation"), "{}", error);
        assert!(error.contains("START"), "{}", error);
    }

    #[test]
    fn test_unreachable_coordinator_fails_peer() {
        // nothing listens on this port
        let vacated = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let coordinator = vacated.local_addr().unwrap();
        drop(vacated);

        let outcome = PeerNode::new(PeerConfig {
            coordinator,
            ..PeerConfig::default()
        })
        .run();

        assert_eq!(outcome.state, PeerState::Failed);
        assert!(!outcome.is_success());
        assert!(outcome.id.is_none());
        assert!(outcome.error.is_some());
    }
}
