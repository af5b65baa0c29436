//! Room directory: room name -> member peer ids

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::types::{PeerId, RoomId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RoomDirectory {
    rooms: DashMap<RoomId, HashSet<PeerId>>,
    config: Arc<SfuConfig>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new(config: Arc<SfuConfig>) -> Self {
        Self {
            rooms: DashMap::new(),
            config,
        }
    }

    /// Add a peer to a room, creating the room on first join.
    ///
    /// Returns `false` when the peer was already a member.
    pub fn join(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<bool> {
        // Room limit is checked before taking the entry: `len()` walks every shard.
        if self.config.max_rooms > 0
            && !self.rooms.contains_key(room_id)
            && self.rooms.len() >= self.config.max_rooms
        {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::LimitExceeded(
                "maximum number of rooms reached".to_string(),
            ));
        }

        let mut members = self.rooms.entry(room_id.clone()).or_default();
        if members.contains(peer_id) {
            return Ok(false);
        }
        if self.config.max_peers_per_room > 0 && members.len() >= self.config.max_peers_per_room
        {
            warn!(
                room_id = %room_id,
                current_peers = members.len(),
                max_peers = self.config.max_peers_per_room,
                "Peer limit reached for room"
            );
            return Err(SfuError::LimitExceeded(format!("room {room_id} is full")));
        }

        members.insert(peer_id.clone());
        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            peer_count = members.len(),
            "Added peer to room"
        );
        Ok(true)
    }

    /// Remove a peer from a room; the room entry goes away with its last member
    pub fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut members) => members.remove(peer_id),
            None => {
                debug!(room_id = %room_id, "Room not found when removing peer");
                return false;
            }
        };

        if self
            .rooms
            .remove_if(room_id, |_, members| members.is_empty())
            .is_some()
        {
            debug!(room_id = %room_id, "Removed empty room");
        }

        if removed {
            info!(room_id = %room_id, peer_id = %peer_id, "Removed peer from room");
        }
        removed
    }

    /// Members of a room; empty for unknown rooms
    #[must_use]
    pub fn members(&self, room_id: &RoomId) -> HashSet<PeerId> {
        self.rooms
            .get(room_id)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    /// Members of a room other than `peer_id`
    #[must_use]
    pub fn others(&self, room_id: &RoomId, peer_id: &PeerId) -> Vec<PeerId> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().filter(|id| *id != peer_id).cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|members| members.contains(peer_id))
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(config: SfuConfig) -> RoomDirectory {
        RoomDirectory::new(Arc::new(config))
    }

    #[test]
    fn test_join_and_leave() {
        let rooms = directory(SfuConfig::default());
        let room = RoomId::from("r1");
        let a = PeerId::from("a");
        let b = PeerId::from("b");

        assert!(rooms.join(&room, &a).unwrap());
        assert!(rooms.join(&room, &b).unwrap());
        assert!(!rooms.join(&room, &a).unwrap());
        assert_eq!(rooms.members(&room).len(), 2);
        assert_eq!(rooms.others(&room, &a), vec![b.clone()]);

        assert!(rooms.leave(&room, &a));
        assert!(!rooms.leave(&room, &a));
        assert_eq!(rooms.room_count(), 1);

        assert!(rooms.leave(&room, &b));
        assert_eq!(rooms.room_count(), 0);
        assert!(rooms.members(&room).is_empty());
    }

    #[test]
    fn test_peer_limit() {
        let rooms = directory(SfuConfig {
            max_peers_per_room: 2,
            ..SfuConfig::default()
        });
        let room = RoomId::from("r1");

        rooms.join(&room, &PeerId::from("p1")).unwrap();
        rooms.join(&room, &PeerId::from("p2")).unwrap();
        let err = rooms.join(&room, &PeerId::from("p3")).unwrap_err();
        assert!(matches!(err, SfuError::LimitExceeded(_)));
        assert_eq!(rooms.members(&room).len(), 2);
    }

    #[test]
    fn test_room_limit() {
        let rooms = directory(SfuConfig {
            max_rooms: 2,
            ..SfuConfig::default()
        });
        let peer = PeerId::from("p1");

        rooms.join(&RoomId::from("room1"), &peer).unwrap();
        rooms.join(&RoomId::from("room2"), &PeerId::from("p2")).unwrap();
        let err = rooms.join(&RoomId::from("room3"), &PeerId::from("p3")).unwrap_err();
        assert!(matches!(err, SfuError::LimitExceeded(_)));

        // Joining an existing room is still allowed at the limit
        rooms.join(&RoomId::from("room1"), &PeerId::from("p3")).unwrap();
    }
}
