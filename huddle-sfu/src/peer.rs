//! Peer registry
//!
//! Every connected client has exactly one record here, created when its
//! signaling channel opens and removed last during disconnect. Other
//! components refer to peers by [`PeerId`] only.

use crate::error::{Result, SfuError};
use crate::types::{PeerId, RoomId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Snapshot of a connected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// Room the peer is currently in, at most one
    pub room: Option<RoomId>,
    pub connected_at: DateTime<Utc>,
    /// When the peer joined `room`
    pub joined_at: Option<DateTime<Utc>>,
}

struct PeerRecord {
    peer: Peer,
    /// Set once removal has started; no new resources may attach after this
    departing: bool,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, PeerRecord>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new peer. Ids are generated by the caller and must be unique.
    pub fn register(&self, peer_id: PeerId) -> Result<Peer> {
        match self.peers.entry(peer_id.clone()) {
            Entry::Occupied(_) => Err(SfuError::DuplicateResource(format!(
                "peer {peer_id} is already registered"
            ))),
            Entry::Vacant(slot) => {
                let peer = Peer {
                    id: peer_id,
                    room: None,
                    connected_at: Utc::now(),
                    joined_at: None,
                };
                slot.insert(PeerRecord {
                    peer: peer.clone(),
                    departing: false,
                });
                debug!(peer_id = %peer.id, total_peers = self.peers.len(), "Peer registered");
                Ok(peer)
            }
        }
    }

    /// Remove a peer; unknown ids are ignored
    pub fn unregister(&self, peer_id: &PeerId) -> Option<Peer> {
        let removed = self.peers.remove(peer_id).map(|(_, record)| record.peer);
        if removed.is_some() {
            debug!(peer_id = %peer_id, total_peers = self.peers.len(), "Peer unregistered");
        }
        removed
    }

    pub fn get(&self, peer_id: &PeerId) -> Result<Peer> {
        self.peers
            .get(peer_id)
            .map(|entry| entry.peer.clone())
            .ok_or_else(|| SfuError::peer_not_found(peer_id))
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Registered and not being removed
    #[must_use]
    pub fn is_active(&self, peer_id: &PeerId) -> bool {
        self.peers.get(peer_id).is_some_and(|record| !record.departing)
    }

    /// Mark a peer as departing. Returns `false` if it is unknown or a removal
    /// is already under way, so only one caller runs the cascade.
    pub fn begin_removal(&self, peer_id: &PeerId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut record) if !record.departing => {
                record.departing = true;
                true
            }
            _ => false,
        }
    }

    /// Current room of a peer, `None` if unknown or not in a room
    #[must_use]
    pub fn room_of(&self, peer_id: &PeerId) -> Option<RoomId> {
        self.peers.get(peer_id).and_then(|record| record.peer.room.clone())
    }

    /// Set (or clear) the current room and stamp the join time
    pub fn set_room(&self, peer_id: &PeerId, room: Option<RoomId>) -> Result<()> {
        let mut record = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::peer_not_found(peer_id))?;
        record.peer.joined_at = room.as_ref().map(|_| Utc::now());
        record.peer.room = room;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let registry = PeerRegistry::new();
        let peer = registry.register(PeerId::from("p1")).unwrap();
        assert_eq!(peer.room, None);
        assert_eq!(registry.get(&PeerId::from("p1")).unwrap().id, peer.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_register_fails() {
        let registry = PeerRegistry::new();
        registry.register(PeerId::from("p1")).unwrap();
        let err = registry.register(PeerId::from("p1")).unwrap_err();
        assert!(matches!(err, SfuError::DuplicateResource(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = PeerRegistry::new();
        registry.register(PeerId::from("p1")).unwrap();
        assert!(registry.unregister(&PeerId::from("p1")).is_some());
        assert!(registry.unregister(&PeerId::from("p1")).is_none());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get(&PeerId::from("p1")),
            Err(SfuError::NotFound(_))
        ));
    }

    #[test]
    fn test_begin_removal_runs_once() {
        let registry = PeerRegistry::new();
        let id = PeerId::from("p1");
        registry.register(id.clone()).unwrap();
        assert!(registry.is_active(&id));

        assert!(registry.begin_removal(&id));
        assert!(!registry.begin_removal(&id));
        assert!(!registry.is_active(&id));
        assert!(registry.contains(&id));

        assert!(!registry.begin_removal(&PeerId::from("ghost")));
    }

    #[test]
    fn test_set_room() {
        let registry = PeerRegistry::new();
        let id = PeerId::from("p1");
        registry.register(id.clone()).unwrap();

        registry.set_room(&id, Some(RoomId::from("r1"))).unwrap();
        let peer = registry.get(&id).unwrap();
        assert_eq!(peer.room, Some(RoomId::from("r1")));
        assert!(peer.joined_at.is_some());

        registry.set_room(&id, None).unwrap();
        let peer = registry.get(&id).unwrap();
        assert_eq!(peer.room, None);
        assert!(peer.joined_at.is_none());

        assert!(registry.set_room(&PeerId::from("ghost"), None).is_err());
    }
}
