use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};

use crate::gl_error::{GlError, Result};
use crate::gl_interface::{DatagramSink, GroupId, PeerId};
use crate::gl_message::Message;
use crate::gl_registry::{PeerRecord, PeerRegistry};

/// Result of recording one DONE report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    /// Peer already reported; nothing counted
    Duplicate,

    /// Counted, group still waiting on members
    Counted { group_count: usize },

    /// Counted and the group just reached full membership
    GroupComplete,
}

#[derive(Debug, Default)]
struct GroupProgress {
    done: usize,
    latency_sum_ms: f64,
    /// Release burst already sent
    sealed: bool,
}

#[derive(Default)]
struct BarrierState {
    reported: HashSet<PeerId>,
    groups: HashMap<GroupId, GroupProgress>,
}

/// Per-group completion counting and the one-shot release burst
pub struct GroupBarrier {
    group_size: usize,
    registry: Arc<PeerRegistry>,
    state: Mutex<BarrierState>,
    releases_sent: AtomicUsize,
}

impl GroupBarrier {
    pub fn new(group_size: usize, registry: Arc<PeerRegistry>) -> Self {
        Self {
            group_size,
            registry,
            state: Mutex::new(BarrierState::default()),
            releases_sent: AtomicUsize::new(0),
        }
    }

    /// Count a peer's DONE. Increment and read happen under one lock.
    pub fn record_done(&self, peer: &PeerRecord, mean_round_ms: f64) -> Result<DoneOutcome> {
        let mut state = self.state.lock().map_err(|_| GlError::ChannelClosed)?;

        if !state.reported.insert(peer.id) {
            return Ok(DoneOutcome::Duplicate);
        }

        let progress = state.groups.entry(peer.group).or_default();
        if progress.done >= self.group_size {
            return Err(GlError::ProtocolViolation(format!(
                "group {} already has {} completions",
                peer.group, progress.done
            )));
        }
        progress.done += 1;
        progress.latency_sum_ms += mean_round_ms;

        if progress.done == self.group_size {
            Ok(DoneOutcome::GroupComplete)
        } else {
            Ok(DoneOutcome::Counted {
                group_count: progress.done,
            })
        }
    }

    /// Send GROUP_RELEASE to every member once the group counter equals V.
    ///
    /// Returns the number of release datagrams sent; 0 if the group is not
    /// complete or was already released.
    pub fn check_and_release<S: DatagramSink + ?Sized>(&self, group: GroupId, sink: &S) -> Result<usize> {
        {
            let mut state = self.state.lock().map_err(|_| GlError::ChannelClosed)?;
            match state.groups.get_mut(&group) {
                Some(progress) if progress.done == self.group_size && !progress.sealed => {
                    progress.sealed = true;
                }
                _ => return Ok(0),
            }
        }

        info!("group {} complete, releasing members", group);

        let mut sent = 0;
        let mut last_error = None;
        for member in self.registry.group_members(group) {
            // fresh message per member
            let bytes = Message::group_release().encode()?;
            match sink.send_to(&bytes, member.addr) {
                Ok(_) => {
                    debug!("release -> peer {}", member.id);
                    sent += 1;
                }
                Err(e) => {
                    warn!("release to peer {} failed: {}", member.id, e);
                    last_error = Some(e);
                }
            }
        }
        self.releases_sent.fetch_add(1, Ordering::SeqCst);

        match last_error {
            Some(e) if sent == 0 => Err(e.into()),
            _ => Ok(sent),
        }
    }

    pub fn group_count(&self, group: GroupId) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.groups.get(&group).map(|p| p.done))
            .unwrap_or(0)
    }

    pub fn is_released(&self, group: GroupId) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.groups.get(&group).map(|p| p.sealed))
            .unwrap_or(false)
    }

    /// Number of groups that received their release burst
    pub fn releases_sent(&self) -> usize {
        self.releases_sent.load(Ordering::SeqCst)
    }

    /// Mean of the reported round latencies per group
    pub fn group_latencies(&self) -> BTreeMap<GroupId, f64> {
        match self.state.lock() {
            Ok(state) => state
                .groups
                .iter()
                .filter(|(_, p)| p.done > 0)
                .map(|(g, p)| (*g, p.latency_sum_ms / p.done as f64))
                .collect(),
            Err(_) => BTreeMap::new(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;

    /// Captures every datagram instead of sending it
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl RecordingSink {
        pub fn messages_to(&self, addr: SocketAddr) -> Vec<Message> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, _)| *a == addr)
                .map(|(_, b)| Message::decode(b).unwrap())
                .collect()
        }

        pub fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl DatagramSink for RecordingSink {
        fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push((addr, bytes.to_vec()));
            Ok(bytes.len())
        }
    }

    fn setup(num_peers: u32, group_size: usize) -> (Arc<PeerRegistry>, GroupBarrier) {
        let registry = Arc::new(PeerRegistry::new());
        for id in 0..num_peers {
            registry
                .insert(PeerRecord {
                    id,
                    group: id / group_size as u32,
                    addr: SocketAddr::from(([127, 0, 0, 1], 6000 + id as u16)),
                })
                .unwrap();
        }
        let barrier = GroupBarrier::new(group_size, registry.clone());
        (registry, barrier)
    }

    #[test]
    fn test_release_only_when_full() {
        let (registry, barrier) = setup(6, 3);
        let sink = RecordingSink::default();

        let p0 = registry.get(0).unwrap();
        let p1 = registry.get(1).unwrap();
        let p2 = registry.get(2).unwrap();

        assert_eq!(
            barrier.record_done(&p0, 10.0).unwrap(),
            DoneOutcome::Counted { group_count: 1 }
        );
        assert_eq!(barrier.check_and_release(0, &sink).unwrap(), 0);
        barrier.record_done(&p1, 20.0).unwrap();
        assert_eq!(barrier.check_and_release(0, &sink).unwrap(), 0);
        assert_eq!(sink.count(), 0);

        assert_eq!(barrier.record_done(&p2, 30.0).unwrap(), DoneOutcome::GroupComplete);
        assert_eq!(barrier.check_and_release(0, &sink).unwrap(), 3);

        for id in 0..3 {
            let msgs = sink.messages_to(registry.get(id).unwrap().addr);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0], Message::group_release());
        }
        // other group untouched
        assert!(sink.messages_to(registry.get(3).unwrap().addr).is_empty());
        assert_eq!(barrier.group_latencies().get(&0), Some(&20.0));
    }

    #[test]
    fn test_release_fires_once() {
        let (registry, barrier) = setup(2, 2);
        let sink = RecordingSink::default();

        barrier.record_done(&registry.get(0).unwrap(), 1.0).unwrap();
        barrier.record_done(&registry.get(1).unwrap(), 1.0).unwrap();

        assert_eq!(barrier.check_and_release(0, &sink).unwrap(), 2);
        assert_eq!(barrier.check_and_release(0, &sink).unwrap(), 0);
        assert_eq!(sink.count(), 2);
        assert_eq!(barrier.releases_sent(), 1);
        assert!(barrier.is_released(0));
    }

    #[test]
    fn test_duplicate_done_not_counted() {
        let (registry, barrier) = setup(3, 3);
        let p0 = registry.get(0).unwrap();

        barrier.record_done(&p0, 5.0).unwrap();
        assert_eq!(barrier.record_done(&p0, 5.0).unwrap(), DoneOutcome::Duplicate);
        assert_eq!(barrier.record_done(&p0, 5.0).unwrap(), DoneOutcome::Duplicate);
        assert_eq!(barrier.group_count(0), 1);
        assert!(!barrier.is_released(0));
    }

    #[test]
    fn test_concurrent_done_releases_each_group_once() {
        let (registry, barrier) = setup(12, 4);
        let barrier = Arc::new(barrier);
        let sink = Arc::new(RecordingSink::default());

        let handles: Vec<_> = (0..12)
            .map(|id| {
                let barrier = barrier.clone();
                let sink = sink.clone();
                let peer = registry.get(id).unwrap();
                std::thread::spawn(move || {
                    // duplicated send on purpose
                    for _ in 0..2 {
                        barrier.record_done(&peer, 1.0).unwrap();
                        barrier.check_and_release(peer.group, sink.as_ref()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(barrier.releases_sent(), 3);
        assert_eq!(sink.count(), 12);
        for group in 0..3 {
            assert_eq!(barrier.group_count(group), 4);
        }
    }
}
