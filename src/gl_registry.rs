use std::net::SocketAddr;
use std::sync::RwLock;

use hashbrown::HashMap;
use indexmap::IndexMap;

use crate::gl_error::{GlError, Result};
use crate::gl_interface::{GroupId, PeerId};

/// Coordinator-side view of a registered peer. Never mutated after insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub group: GroupId,
    /// Address the peer's UDP socket sends from (registration ip + reported port)
    pub addr: SocketAddr,
}

#[derive(Default)]
struct RegistryInner {
    /// Records in identity order
    records: IndexMap<PeerId, PeerRecord>,
    by_addr: HashMap<SocketAddr, PeerId>,
}

/// Thread-safe store of registered peers, shared read-only with the relay workers
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. Identities and addresses are both unique.
    pub fn insert(&self, record: PeerRecord) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| GlError::ChannelClosed)?;

        if inner.records.contains_key(&record.id) {
            return Err(GlError::ProtocolViolation(format!(
                "peer {} already registered",
                record.id
            )));
        }
        if let Some(existing) = inner.by_addr.get(&record.addr) {
            return Err(GlError::ProtocolViolation(format!(
                "address {} already registered as peer {}",
                record.addr, existing
            )));
        }

        inner.by_addr.insert(record.addr, record.id);
        inner.records.insert(record.id, record);
        Ok(())
    }

    pub fn get(&self, id: PeerId) -> Option<PeerRecord> {
        let inner = self.inner.read().ok()?;
        inner.records.get(&id).copied()
    }

    /// Resolve the sender of a datagram
    pub fn lookup_addr(&self, addr: &SocketAddr) -> Option<PeerRecord> {
        let inner = self.inner.read().ok()?;
        let id = inner.by_addr.get(addr)?;
        inner.records.get(id).copied()
    }

    pub fn group_members(&self, group: GroupId) -> Vec<PeerRecord> {
        match self.inner.read() {
            Ok(inner) => inner
                .records
                .values()
                .filter(|r| r.group == group)
                .copied()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn all(&self) -> Vec<PeerRecord> {
        match self.inner.read() {
            Ok(inner) => inner.records.values().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: PeerId, group: GroupId, port: u16) -> PeerRecord {
        PeerRecord {
            id,
            group,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = PeerRegistry::new();
        registry.insert(record(0, 0, 5000)).unwrap();
        registry.insert(record(1, 0, 5001)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().addr.port(), 5001);
        assert_eq!(
            registry
                .lookup_addr(&SocketAddr::from(([127, 0, 0, 1], 5000)))
                .unwrap()
                .id,
            0
        );
        assert!(registry
            .lookup_addr(&SocketAddr::from(([127, 0, 0, 1], 6000)))
            .is_none());
    }

    #[test]
    fn test_same_port_other_ip_is_unknown() {
        let registry = PeerRegistry::new();
        registry.insert(record(0, 0, 5000)).unwrap();
        assert!(registry
            .lookup_addr(&SocketAddr::from(([10, 0, 0, 1], 5000)))
            .is_none());
    }

    #[test]
    fn test_rejects_duplicates() {
        let registry = PeerRegistry::new();
        registry.insert(record(0, 0, 5000)).unwrap();
        assert!(registry.insert(record(0, 0, 5001)).is_err());
        assert!(registry.insert(record(1, 0, 5000)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_group_members_in_identity_order() {
        let registry = PeerRegistry::new();
        for id in 0..6 {
            registry.insert(record(id, id / 3, 5000 + id as u16)).unwrap();
        }

        let ids: Vec<PeerId> = registry.group_members(1).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(registry.group_members(7).is_empty());
    }
}
