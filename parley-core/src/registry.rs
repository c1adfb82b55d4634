//! Discovery registry: the set of visible, not-yet-connected peers.

use crate::peer::{PeerHandle, PeerId};

/// Insertion-ordered set of discovered peers, unique by identity.
///
/// Single-writer: only the facade's event handling mutates it. Loss events
/// for peers that already vanished (consumed by a connection, or reported
/// twice by the transport) are tolerated as no-ops, since transport-level
/// loss detection lags actual departure.
#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    peers: Vec<PeerHandle>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if absent. Returns true when the set changed.
    pub fn found(&mut self, handle: PeerHandle) -> bool {
        if self.contains(&handle.id) {
            return false;
        }
        self.peers.push(handle);
        true
    }

    /// Remove if present. Returns true when the set changed; stale loss
    /// events return false and are otherwise ignored.
    pub fn lost(&mut self, id: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.id != *id);
        self.peers.len() != before
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|p| p.id == *id)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn peers(&self) -> &[PeerHandle] {
        &self.peers
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> PeerHandle {
        PeerHandle::new(PeerId::random(), name)
    }

    #[test]
    fn found_is_idempotent() {
        let mut reg = DiscoveryRegistry::new();
        let a = handle("a");
        assert!(reg.found(a.clone()));
        assert!(!reg.found(a.clone()));
        assert_eq!(reg.peers().len(), 1);
    }

    #[test]
    fn lost_removes_and_tolerates_stale() {
        let mut reg = DiscoveryRegistry::new();
        let a = handle("a");
        reg.found(a.clone());
        assert!(reg.lost(&a.id));
        assert!(!reg.lost(&a.id));
        assert!(reg.is_empty());
    }

    #[test]
    fn found_lost_sequences_leave_exact_set() {
        let mut reg = DiscoveryRegistry::new();
        let a = handle("a");
        let b = handle("b");
        let c = handle("c");
        reg.found(a.clone());
        reg.found(b.clone());
        reg.found(a.clone());
        reg.found(c.clone());
        reg.lost(&b.id);
        reg.lost(&b.id);
        let ids: Vec<PeerId> = reg.peers().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[test]
    fn clear_empties() {
        let mut reg = DiscoveryRegistry::new();
        reg.found(handle("a"));
        reg.found(handle("b"));
        reg.clear();
        assert!(reg.is_empty());
    }
}
