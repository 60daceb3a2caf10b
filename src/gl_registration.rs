//! Reliable registration handshake.
//!
//! Each exchange is one `REGISTER_REQUEST` / `REGISTER_REPLY` pair over a fresh
//! TCP connection, each frame a u32 big-endian length followed by the codec bytes.
//! The connection is closed as soon as the reply is written.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::gl_error::{GlError, Result};
use crate::gl_interface::{group_of, GroupId, Iteration, PeerId, SimParams, MAX_DATAGRAM_SIZE};
use crate::gl_message::{Message, MessageKind};
use crate::gl_registry::{PeerRecord, PeerRegistry};

/// Bounded wait for a single handshake read
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a peer learns from the coordinator at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: PeerId,
    pub group: GroupId,
    pub group_size: usize,
    pub iterations: Iteration,
}

impl Registration {
    fn to_reply(self) -> Message {
        Message::new(
            MessageKind::RegisterReply,
            self.id,
            format!("{},{}", self.group, self.group_size),
            self.iterations,
        )
    }

    fn from_reply(msg: &Message) -> Result<Self> {
        if msg.kind != MessageKind::RegisterReply {
            return Err(GlError::ProtocolViolation(format!(
                "expected REGISTER_REPLY, got {}",
                msg.kind
            )));
        }

        let (group, group_size) = msg
            .payload
            .split_once(',')
            .ok_or_else(|| GlError::MalformedMessage(format!("bad reply {:?}", msg.payload)))?;
        let group: GroupId = group
            .parse()
            .map_err(|_| GlError::MalformedMessage(format!("bad group {:?}", group)))?;
        let group_size: usize = group_size
            .parse()
            .map_err(|_| GlError::MalformedMessage(format!("bad group size {:?}", group_size)))?;
        if group_size == 0 {
            return Err(GlError::MalformedMessage("group size 0".into()));
        }

        Ok(Self {
            id: msg.sender,
            group,
            group_size,
            iterations: msg.iteration,
        })
    }
}

// ============================================================================
// Coordinator Side
// ============================================================================

/// Serialized identity assignment.
///
/// Accepting may be concurrent, but every assignment goes through one mutex so
/// identities form the exact sequence 0..N.
pub struct Registrar {
    params: SimParams,
    registry: Arc<PeerRegistry>,
    next_id: Mutex<PeerId>,
}

impl Registrar {
    pub fn new(params: SimParams, registry: Arc<PeerRegistry>) -> Self {
        Self {
            params,
            registry,
            next_id: Mutex::new(0),
        }
    }

    pub fn register(&self, peer_addr: SocketAddr) -> Result<Registration> {
        let mut next_id = self.next_id.lock().map_err(|_| GlError::ChannelClosed)?;
        if *next_id as usize >= self.params.num_peers {
            return Err(GlError::RegistrationClosed);
        }

        let id = *next_id;
        let group = group_of(id, self.params.group_size);
        self.registry.insert(PeerRecord {
            id,
            group,
            addr: peer_addr,
        })?;
        *next_id += 1;

        info!("peer {} registered: group {} udp {}", id, group, peer_addr);

        Ok(Registration {
            id,
            group,
            group_size: self.params.group_size,
            iterations: self.params.iterations,
        })
    }

    pub fn registered(&self) -> usize {
        self.next_id.lock().map(|n| *n as usize).unwrap_or(0)
    }

    pub fn is_sealed(&self) -> bool {
        self.registered() >= self.params.num_peers
    }
}

/// Accepts handshakes until N peers are registered, then closes the listener
pub struct RegistrationService {
    listener: TcpListener,
    registrar: Registrar,
}

impl RegistrationService {
    pub fn new(listener: TcpListener, registrar: Registrar) -> Self {
        Self {
            listener,
            registrar,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until registration is sealed. A failed handshake costs no identity.
    pub fn serve(self) -> Result<()> {
        info!(
            "waiting for {} peers on {}",
            self.registrar.params.num_peers,
            self.local_addr()?
        );

        while !self.registrar.is_sealed() {
            let (stream, remote) = self.listener.accept()?;
            if let Err(e) = self.handle_connection(stream, remote) {
                warn!("registration from {} failed: {}", remote, e);
            }
        }

        info!("registration sealed with {} peers", self.registrar.registered());
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let request = read_frame(&mut stream)?;
        if request.kind != MessageKind::RegisterRequest {
            return Err(GlError::ProtocolViolation(format!(
                "expected REGISTER_REQUEST, got {}",
                request.kind
            )));
        }

        let udp_port: u16 = request.payload.trim().parse().map_err(|_| {
            GlError::MalformedMessage(format!("bad udp port {:?}", request.payload))
        })?;
        let peer_addr = SocketAddr::new(remote.ip(), udp_port);

        let registration = self.registrar.register(peer_addr)?;
        write_frame(&mut stream, &registration.to_reply())?;
        debug!("reply sent to peer {}", registration.id);
        Ok(())
    }
}

// ============================================================================
// Peer Side
// ============================================================================

/// Perform the handshake, announcing the peer's locally bound UDP port
pub fn register_with_coordinator(coordinator: SocketAddr, udp_port: u16) -> Result<Registration> {
    let mut stream = match TcpStream::connect_timeout(&coordinator, HANDSHAKE_TIMEOUT) {
        Ok(stream) => stream,
        // listener already sealed and dropped
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(GlError::RegistrationClosed)
        }
        Err(e) => return Err(e.into()),
    };
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let request = Message::new(MessageKind::RegisterRequest, 0, udp_port.to_string(), 0);
    write_frame(&mut stream, &request)?;

    let reply = match read_frame(&mut stream) {
        Ok(reply) => reply,
        // coordinator hung up without replying: no identity left for us
        Err(GlError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(GlError::RegistrationClosed)
        }
        Err(e) => return Err(e),
    };

    Registration::from_reply(&reply)
}

fn write_frame(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    let bytes = msg.encode()?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Message> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_DATAGRAM_SIZE {
        return Err(GlError::MalformedMessage(format!("frame of {} bytes", len)));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Message::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_assigns_sequential_ids() {
        let registry = Arc::new(PeerRegistry::new());
        let registrar = Registrar::new(SimParams::new(6, 3, 2), registry.clone());

        for port in 0..6u16 {
            let reg = registrar.register(addr(7000 + port)).unwrap();
            assert_eq!(reg.id, port as PeerId);
            assert_eq!(reg.group, reg.id / 3);
            assert_eq!(reg.group_size, 3);
            assert_eq!(reg.iterations, 2);
        }
        assert!(registrar.is_sealed());
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn test_register_closed_after_n() {
        let registrar = Registrar::new(SimParams::new(2, 2, 1), Arc::new(PeerRegistry::new()));
        registrar.register(addr(7000)).unwrap();
        registrar.register(addr(7001)).unwrap();

        assert!(matches!(
            registrar.register(addr(7002)),
            Err(GlError::RegistrationClosed)
        ));
        assert_eq!(registrar.registered(), 2);
    }

    #[test]
    fn test_duplicate_address_does_not_consume_identity() {
        let registrar = Registrar::new(SimParams::new(2, 1, 1), Arc::new(PeerRegistry::new()));
        registrar.register(addr(7000)).unwrap();
        assert!(registrar.register(addr(7000)).is_err());
        assert_eq!(registrar.register(addr(7001)).unwrap().id, 1);
    }

    #[test]
    fn test_concurrent_registration_has_no_collisions() {
        let n = 40;
        let registrar = Arc::new(Registrar::new(
            SimParams::new(n, 4, 1),
            Arc::new(PeerRegistry::new()),
        ));

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let registrar = registrar.clone();
                thread::spawn(move || registrar.register(addr(8000 + i as u16)).unwrap())
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            let reg = handle.join().unwrap();
            assert_eq!(reg.group, reg.id / 4);
            assert!(ids.insert(reg.id));
        }
        assert_eq!(ids, (0..n as PeerId).collect::<HashSet<_>>());
    }

    #[test]
    fn test_reply_round_trip() {
        let reg = Registration {
            id: 7,
            group: 2,
            group_size: 3,
            iterations: 10,
        };
        assert_eq!(Registration::from_reply(&reg.to_reply()).unwrap(), reg);
        assert!(Registration::from_reply(&Message::start(1)).is_err());
    }

    #[test]
    fn test_handshake_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        let registry = Arc::new(PeerRegistry::new());
        let service = RegistrationService::new(
            listener,
            Registrar::new(SimParams::new(2, 2, 3), registry.clone()),
        );
        let server = thread::spawn(move || service.serve());

        let first = register_with_coordinator(server_addr, 9100).unwrap();
        let second = register_with_coordinator(server_addr, 9101).unwrap();
        server.join().unwrap().unwrap();

        assert_eq!((first.id, first.group, first.group_size, first.iterations), (0, 0, 2, 3));
        assert_eq!(second.id, 1);
        assert_eq!(registry.get(1).unwrap().addr, addr(9101));

        // listener is gone once sealed
        let late = register_with_coordinator(server_addr, 9102);
        assert!(matches!(late, Err(GlError::RegistrationClosed)), "{:?}", late);
    }
}
