//! Per-peer notification channels
//!
//! The hub only knows how to reach an individual peer. Who should be told
//! about what (room fan-out, consumer owners) is decided by the caller.

use crate::protocol::ServerEvent;
use crate::types::PeerId;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Message sender for a peer's signaling channel
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Default)]
pub struct SignalHub {
    channels: DashMap<PeerId, EventSender>,
}

impl SignalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for a peer, replacing any previous one
    pub fn attach(&self, peer_id: PeerId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.channels.insert(peer_id.clone(), tx).is_some() {
            warn!(peer_id = %peer_id, "Replaced existing notification channel");
        }
        rx
    }

    pub fn detach(&self, peer_id: &PeerId) {
        self.channels.remove(peer_id);
    }

    /// Deliver an event to one peer. Returns whether it was queued.
    pub fn send_to(&self, peer_id: &PeerId, event: ServerEvent) -> bool {
        let Some(sender) = self.channels.get(peer_id).map(|entry| entry.value().clone()) else {
            debug!(
                peer_id = %peer_id,
                event_type = event.event_type(),
                "No channel for peer, dropping event"
            );
            return false;
        };

        if sender.send(event).is_err() {
            debug!(peer_id = %peer_id, "Peer channel closed, detaching");
            self.channels.remove_if(peer_id, |_, current| current.same_channel(&sender));
            return false;
        }
        true
    }

    /// Deliver the same event to several peers; returns how many were reached
    pub fn send_to_all<'a>(
        &self,
        peers: impl IntoIterator<Item = &'a PeerId>,
        event: &ServerEvent,
    ) -> usize {
        let sent_count = peers
            .into_iter()
            .filter(|peer_id| self.send_to(peer_id, event.clone()))
            .count();
        debug!(event_type = event.event_type(), sent_count, "Event fan-out complete");
        sent_count
    }

    #[must_use]
    pub fn is_attached(&self, peer_id: &PeerId) -> bool {
        self.channels.contains_key(peer_id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_to_specific_peer() {
        let hub = SignalHub::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let mut rx_a = hub.attach(a.clone());
        let mut rx_b = hub.attach(b.clone());

        assert!(hub.send_to(&a, ServerEvent::UserEnter { peer_id: b.clone() }));

        let received = rx_a.recv().await.unwrap();
        assert_eq!(received.event_type(), "user_enter");

        let nothing = tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await;
        assert!(nothing.is_err(), "b should not have received the event");
    }

    #[tokio::test]
    async fn test_send_to_all() {
        let hub = SignalHub::new();
        let peers: Vec<PeerId> = ["a", "b", "c"].into_iter().map(PeerId::from).collect();
        let mut receivers: Vec<_> = peers.iter().map(|p| hub.attach(p.clone())).collect();

        let event = ServerEvent::UserExit {
            peer_id: PeerId::from("z"),
        };
        assert_eq!(hub.send_to_all(&peers[..2], &event), 2);

        assert_eq!(receivers[0].recv().await.unwrap(), event);
        assert_eq!(receivers[1].recv().await.unwrap(), event);
        assert!(receivers[2].try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_detached() {
        let hub = SignalHub::new();
        let a = PeerId::from("a");
        drop(hub.attach(a.clone()));

        assert!(!hub.send_to(&a, ServerEvent::UserEnter { peer_id: a.clone() }));
        assert!(!hub.is_attached(&a));
        assert_eq!(hub.connection_count(), 0);
    }
}
