//! Authoritative peer map. Only discovery and transport callbacks mutate it.

use std::collections::HashMap;

use chrono::Utc;

use crate::common::{ConnectionState, PeerId, PeerRecord};
use crate::error::SessionError;

/// Result of a state update that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Changed {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Transports repeat themselves; reporting the current state again is
    /// accepted and changes nothing.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct SessionManager {
    peers: HashMap<PeerId, PeerRecord>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the peer was not known before. A known peer gets its
    /// display name and `last_seen` refreshed; its connection state is left
    /// alone.
    pub fn record_discovered(&mut self, peer: PeerId, display_name: impl Into<String>) -> bool {
        let display_name = display_name.into();
        match self.peers.get_mut(&peer) {
            Some(record) => {
                record.display_name = display_name;
                record.last_seen = Utc::now();
                false
            }
            None => {
                log::info!("Discovered peer '{display_name}' ({peer})");
                self.peers
                    .insert(peer.clone(), PeerRecord::new(peer, display_name));
                true
            }
        }
    }

    /// Forget a peer. The removed record tells the caller whether a session
    /// needs tearing down.
    pub fn record_lost(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        let record = self.peers.remove(peer)?;
        log::info!("Lost peer '{}' ({peer})", record.display_name);
        Some(record)
    }

    pub fn record_state_change(
        &mut self,
        peer: &PeerId,
        next: ConnectionState,
    ) -> Result<StateChange, SessionError> {
        let record = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| SessionError::UnknownPeer(peer.clone()))?;
        let current = record.connection_state;
        if current == next {
            return Ok(StateChange::Unchanged);
        }
        if !current.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                peer: peer.clone(),
                from: current,
                to: next,
            });
        }
        record.connection_state = next;
        record.last_seen = Utc::now();
        log::info!(
            "Peer '{}' ({peer}): {current} -> {next}",
            record.display_name
        );
        Ok(StateChange::Changed {
            from: current,
            to: next,
        })
    }

    /// Broadcast fan-out for a send, sorted for determinism.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .values()
            .filter(|record| record.is_connected())
            .map(|record| record.id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Peers currently Connecting or Connected.
    pub fn active_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .values()
            .filter(|record| record.connection_state.is_active())
            .map(|record| record.id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn state_of(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.peers.get(peer).map(|record| record.connection_state)
    }

    /// Copies of every record, ordered by display name then id.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use ConnectionState::*;

    fn manager_with(peer: &str) -> (SessionManager, PeerId) {
        let mut manager = SessionManager::new();
        let id = PeerId::from(peer);
        assert!(manager.record_discovered(id.clone(), peer));
        (manager, id)
    }

    #[test]
    fn discovered_peer_starts_not_connected() {
        let (manager, id) = manager_with("bob");
        assert_eq!(manager.state_of(&id), Some(NotConnected));
        assert!(manager.connected_peers().is_empty());
    }

    #[test]
    fn full_cycle_is_accepted() {
        let (mut manager, id) = manager_with("bob");
        for next in [Connecting, Connected, NotConnected, Connecting, Connected] {
            assert!(matches!(
                manager.record_state_change(&id, next),
                Ok(StateChange::Changed { to, .. }) if to == next
            ));
        }
        assert_eq!(manager.connected_peers(), vec![id]);
    }

    #[test]
    fn skipping_connecting_is_rejected() {
        let (mut manager, id) = manager_with("bob");
        assert_eq!(
            manager.record_state_change(&id, Connected),
            Err(SessionError::InvalidTransition {
                peer: id.clone(),
                from: NotConnected,
                to: Connected,
            })
        );
        assert_eq!(manager.state_of(&id), Some(NotConnected));
    }

    #[test]
    fn connected_cannot_fall_back_to_connecting() {
        let (mut manager, id) = manager_with("bob");
        manager.record_state_change(&id, Connecting).unwrap();
        manager.record_state_change(&id, Connected).unwrap();
        assert!(manager.record_state_change(&id, Connecting).is_err());
        assert_eq!(manager.state_of(&id), Some(Connected));
    }

    #[test]
    fn repeated_state_is_unchanged() {
        let (mut manager, id) = manager_with("bob");
        manager.record_state_change(&id, Connecting).unwrap();
        assert_eq!(
            manager.record_state_change(&id, Connecting),
            Ok(StateChange::Unchanged)
        );
    }

    #[test]
    fn aborted_handshake_returns_to_not_connected() {
        let (mut manager, id) = manager_with("bob");
        manager.record_state_change(&id, Connecting).unwrap();
        assert!(manager.record_state_change(&id, NotConnected).is_ok());
    }

    #[test]
    fn unknown_peer_is_an_error() {
        let mut manager = SessionManager::new();
        let ghost = PeerId::from("ghost");
        assert_eq!(
            manager.record_state_change(&ghost, Connecting),
            Err(SessionError::UnknownPeer(ghost))
        );
    }

    #[test]
    fn rediscovery_refreshes_name_but_keeps_state() {
        let (mut manager, id) = manager_with("bob");
        manager.record_state_change(&id, Connecting).unwrap();
        assert!(!manager.record_discovered(id.clone(), "Bob's laptop"));
        let record = manager.get(&id).unwrap();
        assert_eq!(record.display_name, "Bob's laptop");
        assert_eq!(record.connection_state, Connecting);
    }

    #[test]
    fn lost_peer_is_removed_and_returned() {
        let (mut manager, id) = manager_with("bob");
        manager.record_state_change(&id, Connecting).unwrap();
        let record = manager.record_lost(&id).unwrap();
        assert_eq!(record.connection_state, Connecting);
        assert!(manager.is_empty());
        assert!(manager.record_lost(&id).is_none());
    }

    #[test]
    fn snapshot_is_sorted_copy() {
        let mut manager = SessionManager::new();
        manager.record_discovered(PeerId::from("2"), "zoe");
        manager.record_discovered(PeerId::from("1"), "anna");
        let snapshot = manager.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, ["anna", "zoe"]);
        assert_eq!(manager.len(), 2);
    }

    fn arb_state() -> impl Strategy<Value = ConnectionState> {
        prop_oneof![Just(NotConnected), Just(Connecting), Just(Connected)]
    }

    proptest! {
        #[test]
        fn only_legal_edges_are_ever_taken(
            reports in prop::collection::vec(arb_state(), 0..64),
        ) {
            let (mut manager, id) = manager_with("bob");
            for next in reports {
                let before = manager.state_of(&id).unwrap();
                match manager.record_state_change(&id, next) {
                    Ok(StateChange::Changed { from, to }) => {
                        prop_assert_eq!(from, before);
                        prop_assert_eq!(to, next);
                        prop_assert!(matches!(
                            (from, to),
                            (NotConnected, Connecting)
                                | (Connecting, Connected)
                                | (Connecting, NotConnected)
                                | (Connected, NotConnected)
                        ));
                    }
                    Ok(StateChange::Unchanged) => {
                        prop_assert_eq!(before, next);
                    }
                    Err(_) => {
                        prop_assert_eq!(manager.state_of(&id), Some(before));
                    }
                }
                let expected = if before.can_transition_to(next) { next } else { before };
                prop_assert_eq!(manager.state_of(&id), Some(expected));
            }
        }
    }
}
