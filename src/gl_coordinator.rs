use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::gl_barrier::GroupBarrier;
use crate::gl_error::Result;
use crate::gl_interface::{SimParams, DEFAULT_PORT};
use crate::gl_message::Message;
use crate::gl_registration::{Registrar, RegistrationService};
use crate::gl_registry::PeerRegistry;
use crate::gl_relay::{RelayConfig, RelayEngine, RelaySummary};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    // ===== Network =====
    pub bind_ip: IpAddr,

    /// Shared by the TCP listener and the UDP socket; 0 picks a free port
    pub port: u16,

    // ===== Simulation =====
    pub params: SimParams,

    // ===== Dispatch =====
    pub relay: RelayConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            params: SimParams::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Owns both channels and the shared registry for one simulation run.
///
/// Lifecycle: registration until N peers are known, one START per peer, then
/// relay until every peer reported DONE.
pub struct Coordinator {
    config: CoordinatorConfig,
    udp: UdpSocket,
    tcp: TcpListener,
    registry: Arc<PeerRegistry>,
    barrier: Arc<GroupBarrier>,
}

impl Coordinator {
    /// Validate parameters, then bind both channels on the same port
    pub fn bind(config: CoordinatorConfig) -> Result<Self> {
        config.params.validate()?;

        let udp = UdpSocket::bind(SocketAddr::new(config.bind_ip, config.port))?;
        let port = udp.local_addr()?.port();
        let tcp = TcpListener::bind(SocketAddr::new(config.bind_ip, port))?;

        let registry = Arc::new(PeerRegistry::new());
        let barrier = Arc::new(GroupBarrier::new(config.params.group_size, registry.clone()));

        info!(
            "coordinator bound on {} (N={}, V={}, S={}, {} groups)",
            udp.local_addr()?,
            config.params.num_peers,
            config.params.group_size,
            config.params.iterations,
            config.params.num_groups()
        );

        Ok(Self {
            config,
            udp,
            tcp,
            registry,
            barrier,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub fn run(self) -> Result<RelaySummary> {
        let Coordinator {
            config,
            udp,
            tcp,
            registry,
            barrier,
        } = self;
        let params = config.params;

        let registrar = Registrar::new(params, registry.clone());
        RegistrationService::new(tcp, registrar).serve()?;

        send_start(&udp, &registry)?;

        let engine = RelayEngine::new(udp, registry, barrier, params.num_peers, config.relay)?;
        let summary = engine.run()?;

        for (group, latency) in &summary.group_latency_ms {
            info!("group {} mean round latency {:.3} ms", group, latency);
        }
        info!(
            "simulation complete: {}/{} peers done, {} releases, mean {:.3} ms, {:.0} bit/s",
            summary.completed_peers,
            params.num_peers,
            summary.releases_sent,
            summary.mean_latency_ms(),
            summary.throughput_bps()
        );

        Ok(summary)
    }
}

/// One START per registered peer, in identity order. Returns how many went out.
fn send_start(udp: &UdpSocket, registry: &PeerRegistry) -> Result<usize> {
    let mut sent = 0;
    for peer in registry.all() {
        let bytes = Message::start(peer.id).encode()?;
        match udp.send_to(&bytes, peer.addr) {
            Ok(_) => {
                debug!("START -> peer {}", peer.id);
                sent += 1;
            }
            // the peer will never leave AWAITING_START; others still run
            Err(e) => warn!("START to peer {} failed: {}", peer.id, e),
        }
    }
    info!("START sent to {}/{} peers", sent, registry.len());
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl_error::GlError;
    use crate::gl_registration::register_with_coordinator;
    use std::time::Duration;

    fn loopback(params: SimParams) -> CoordinatorConfig {
        CoordinatorConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            params,
            relay: RelayConfig {
                workers: 4,
                max_duration: Some(Duration::from_secs(10)),
                ..RelayConfig::default()
            },
        }
    }

    #[test]
    fn test_bind_rejects_uneven_partition() {
        let result = Coordinator::bind(loopback(SimParams::new(5, 2, 1)));
        assert!(matches!(result, Err(GlError::InvalidConfig(_))));
    }

    #[test]
    fn test_send_start_reaches_every_registered_peer() {
        let registry = PeerRegistry::new();
        let peers: Vec<UdpSocket> = (0..3)
            .map(|_| {
                let s = UdpSocket::bind("127.0.0.1:0").unwrap();
                s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                s
            })
            .collect();
        for (id, s) in peers.iter().enumerate() {
            registry
                .insert(crate::gl_registry::PeerRecord {
                    id: id as u32,
                    group: 0,
                    addr: s.local_addr().unwrap(),
                })
                .unwrap();
        }

        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert_eq!(send_start(&udp, &registry).unwrap(), 3);

        let mut buf = [0u8; 64];
        for (id, s) in peers.iter().enumerate() {
            let (len, _) = s.recv_from(&mut buf).unwrap();
            assert_eq!(Message::decode(&buf[..len]).unwrap(), Message::start(id as u32));
        }
    }

    #[test]
    fn test_start_sent_after_registration() {
        let coordinator = Coordinator::bind(loopback(SimParams::new(2, 2, 1))).unwrap();
        let addr = coordinator.local_addr().unwrap();
        let registry = coordinator.registry();
        let handle = std::thread::spawn(move || coordinator.run());

        let sockets: Vec<UdpSocket> = (0..2)
            .map(|_| {
                let s = UdpSocket::bind("127.0.0.1:0").unwrap();
                s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                s
            })
            .collect();
        for s in &sockets {
            register_with_coordinator(addr, s.local_addr().unwrap().port()).unwrap();
        }

        let mut buf = [0u8; 64];
        for (id, s) in sockets.iter().enumerate() {
            let (len, from) = s.recv_from(&mut buf).unwrap();
            assert_eq!(from.port(), addr.port());
            assert_eq!(Message::decode(&buf[..len]).unwrap(), Message::start(id as u32));
        }
        assert_eq!(registry.len(), 2);

        // both report immediately: zero rounds
        for (id, s) in sockets.iter().enumerate() {
            s.send_to(&Message::done(id as u32, 0.0, 0).encode().unwrap(), addr)
                .unwrap();
        }
        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.completed_peers, 2);
        assert_eq!(summary.releases_sent, 1);
    }
}
