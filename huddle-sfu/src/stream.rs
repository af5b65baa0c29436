//! Stream directory: producers (published streams) and consumers (subscriptions)
//!
//! All bookkeeping sits behind one mutex so that creating a consumer and
//! closing its source producer are linearized: a consumer is either inserted
//! before the producer goes away (and is then closed by the cascade) or
//! rejected at insertion. The lock is never held across an engine call.

use crate::engine::{self, MediaEngine, RtpCapabilities, RtpParameters};
use crate::error::{Result, SfuError};
use crate::hub::SignalHub;
use crate::negotiator::CapabilityNegotiator;
use crate::peer::PeerRegistry;
use crate::protocol::ServerEvent;
use crate::room::RoomDirectory;
use crate::transport::TransportManager;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportId, TransportRole};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Published stream as advertised to other peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerDescriptor {
    pub id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Returned to a subscribing peer. Consumers always start paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Clone)]
struct ProducerEntry {
    peer_id: PeerId,
    transport_id: TransportId,
    kind: MediaKind,
    paused: bool,
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    peer_id: PeerId,
    transport_id: TransportId,
    producer_id: ProducerId,
    kind: MediaKind,
    paused: bool,
}

#[derive(Debug, Default)]
struct Owned {
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

#[derive(Debug, Default)]
struct Streams {
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    /// producer -> consumers fed by it
    subscribers: HashMap<ProducerId, HashSet<ConsumerId>>,
    /// peer -> streams it owns
    owned: HashMap<PeerId, Owned>,
}

impl Streams {
    fn insert_producer(&mut self, id: ProducerId, entry: ProducerEntry) {
        self.owned
            .entry(entry.peer_id.clone())
            .or_default()
            .producers
            .insert(id.clone());
        self.producers.insert(id, entry);
    }

    fn insert_consumer(&mut self, id: ConsumerId, entry: ConsumerEntry) {
        self.owned
            .entry(entry.peer_id.clone())
            .or_default()
            .consumers
            .insert(id.clone());
        self.subscribers
            .entry(entry.producer_id.clone())
            .or_default()
            .insert(id.clone());
        self.consumers.insert(id, entry);
    }

    fn remove_consumer(&mut self, id: &ConsumerId) -> Option<ConsumerEntry> {
        let entry = self.consumers.remove(id)?;
        if let Some(subscribers) = self.subscribers.get_mut(&entry.producer_id) {
            subscribers.remove(id);
            if subscribers.is_empty() {
                self.subscribers.remove(&entry.producer_id);
            }
        }
        self.disown(&entry.peer_id, |owned| {
            owned.consumers.remove(id);
        });
        Some(entry)
    }

    /// Remove a producer together with every consumer subscribed to it
    fn remove_producer(
        &mut self,
        id: &ProducerId,
    ) -> Option<(ProducerEntry, Vec<(ConsumerId, ConsumerEntry)>)> {
        let entry = self.producers.remove(id)?;
        self.disown(&entry.peer_id, |owned| {
            owned.producers.remove(id);
        });

        let consumer_ids = self.subscribers.remove(id).unwrap_or_default();
        let consumers = consumer_ids
            .into_iter()
            .filter_map(|cid| self.remove_consumer(&cid).map(|c| (cid, c)))
            .collect();
        Some((entry, consumers))
    }

    fn disown(&mut self, peer_id: &PeerId, f: impl FnOnce(&mut Owned)) {
        if let Some(owned) = self.owned.get_mut(peer_id) {
            f(owned);
            if owned.producers.is_empty() && owned.consumers.is_empty() {
                self.owned.remove(peer_id);
            }
        }
    }
}

/// Engine objects released by a cascade, closed once the lock is dropped
#[derive(Default)]
struct Released {
    producers: Vec<ProducerId>,
    consumers: Vec<ConsumerId>,
}

pub struct StreamDirectory {
    engine: Arc<dyn MediaEngine>,
    peers: Arc<PeerRegistry>,
    rooms: Arc<RoomDirectory>,
    transports: Arc<TransportManager>,
    negotiator: Arc<CapabilityNegotiator>,
    hub: Arc<SignalHub>,
    timeout: Duration,
    streams: Mutex<Streams>,
}

impl StreamDirectory {
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        peers: Arc<PeerRegistry>,
        rooms: Arc<RoomDirectory>,
        transports: Arc<TransportManager>,
        negotiator: Arc<CapabilityNegotiator>,
        hub: Arc<SignalHub>,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            peers,
            rooms,
            transports,
            negotiator,
            hub,
            timeout,
            streams: Mutex::new(Streams::default()),
        }
    }

    /// Publish a stream on the peer's connected send transport and announce it
    /// to the other members of `room_id`.
    ///
    /// The peer must still be in `room_id` when the engine answers, otherwise
    /// the new producer is closed and `NotFound` returned.
    pub async fn create_producer(
        &self,
        peer_id: &PeerId,
        room_id: &RoomId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerDescriptor> {
        let transport_id = self.transports.connected(peer_id, TransportRole::Send)?;

        let producer_id = engine::bounded(
            self.timeout,
            self.engine.produce(&transport_id, kind, rtp_parameters),
        )
        .await
        .map_err(|e| {
            error!(peer_id = %peer_id, kind = %kind, error = %e, "Engine failed to create producer");
            SfuError::from(e)
        })?;

        let inserted = {
            let mut streams = self.streams.lock();
            let still_valid = self.peers.is_active(peer_id)
                && self.peers.room_of(peer_id).as_ref() == Some(room_id)
                && self
                    .transports
                    .is_connected_as(peer_id, TransportRole::Send, &transport_id);
            if still_valid {
                streams.insert_producer(
                    producer_id.clone(),
                    ProducerEntry {
                        peer_id: peer_id.clone(),
                        transport_id: transport_id.clone(),
                        kind,
                        paused: false,
                    },
                );
                // Announced under the lock so nobody hears of a stream after its closure.
                let others = self.rooms.others(room_id, peer_id);
                self.hub.send_to_all(
                    &others,
                    &ServerEvent::NewStream {
                        producer_id: producer_id.clone(),
                        peer_id: peer_id.clone(),
                        kind,
                    },
                );
            }
            still_valid
        };

        if !inserted {
            debug!(producer_id = %producer_id, room_id = %room_id, "Peer left the room or lost its send transport while producing, discarding");
            self.engine.close_producer(&producer_id).await;
            return Err(SfuError::NotFound(format!(
                "peer {peer_id} is no longer producing in room {room_id}"
            )));
        }

        info!(peer_id = %peer_id, producer_id = %producer_id, kind = %kind, "Producer created");
        Ok(ProducerDescriptor {
            id: producer_id,
            peer_id: peer_id.clone(),
            kind,
            paused: false,
        })
    }

    /// Subscribe `peer_id` to `producer_id` over its connected receive transport.
    ///
    /// Both peers must be in `room_id`, before and after the engine call. The
    /// consumer is created paused; the caller resumes it once the client has
    /// finished its local setup.
    pub async fn create_consumer(
        &self,
        peer_id: &PeerId,
        room_id: &RoomId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor> {
        let transport_id = self.transports.connected(peer_id, TransportRole::Receive)?;

        let owner = self
            .streams
            .lock()
            .producers
            .get(producer_id)
            .map(|producer| producer.peer_id.clone())
            .ok_or_else(|| SfuError::NotFound(format!("producer {producer_id}")))?;

        // Streams are only visible inside the room they were published in.
        if self.peers.room_of(&owner).as_ref() != Some(room_id) {
            return Err(SfuError::NotFound(format!(
                "producer {producer_id} is not in this room"
            )));
        }

        self.negotiator.ensure_can_consume(producer_id, rtp_capabilities)?;

        let params = engine::bounded(
            self.timeout,
            self.engine
                .consume(&transport_id, producer_id, rtp_capabilities, true),
        )
        .await
        .map_err(|e| {
            error!(peer_id = %peer_id, producer_id = %producer_id, error = %e, "Engine failed to create consumer");
            SfuError::from(e)
        })?;

        let descriptor = {
            let mut streams = self.streams.lock();
            let producer = streams.producers.get(producer_id).cloned();
            match producer {
                Some(producer)
                    if self.peers.is_active(peer_id)
                        && self.peers.room_of(peer_id).as_ref() == Some(room_id)
                        && self.peers.room_of(&producer.peer_id).as_ref() == Some(room_id)
                        && self.transports.is_connected_as(
                            peer_id,
                            TransportRole::Receive,
                            &transport_id,
                        ) =>
                {
                    streams.insert_consumer(
                        params.id.clone(),
                        ConsumerEntry {
                            peer_id: peer_id.clone(),
                            transport_id: transport_id.clone(),
                            producer_id: producer_id.clone(),
                            kind: producer.kind,
                            paused: true,
                        },
                    );
                    Some(ConsumerDescriptor {
                        id: params.id.clone(),
                        producer_id: producer_id.clone(),
                        kind: producer.kind,
                        rtp_parameters: params.rtp_parameters.clone(),
                        consumer_type: params.consumer_type.clone(),
                        producer_paused: producer.paused,
                        paused: true,
                    })
                }
                _ => None,
            }
        };

        let Some(descriptor) = descriptor else {
            debug!(consumer_id = %params.id, room_id = %room_id, "Producer, transport or room membership went away while consuming, discarding");
            self.engine.close_consumer(&params.id).await;
            return Err(SfuError::NotFound(format!(
                "producer {producer_id} is no longer available in room {room_id}"
            )));
        };

        info!(
            peer_id = %peer_id,
            consumer_id = %descriptor.id,
            producer_id = %producer_id,
            kind = %descriptor.kind,
            "Consumer created"
        );
        Ok(descriptor)
    }

    pub async fn resume_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        self.set_consumer_paused(peer_id, consumer_id, false).await
    }

    pub async fn pause_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        self.set_consumer_paused(peer_id, consumer_id, true).await
    }

    async fn set_consumer_paused(
        &self,
        peer_id: &PeerId,
        consumer_id: &ConsumerId,
        paused: bool,
    ) -> Result<()> {
        {
            let streams = self.streams.lock();
            let consumer = streams
                .consumers
                .get(consumer_id)
                .filter(|consumer| &consumer.peer_id == peer_id)
                .ok_or_else(|| SfuError::NotFound(format!("consumer {consumer_id}")))?;
            if consumer.paused == paused {
                return Ok(());
            }
        }

        let call = if paused {
            self.engine.pause_consumer(consumer_id)
        } else {
            self.engine.resume_consumer(consumer_id)
        };
        engine::bounded(self.timeout, call).await?;

        let mut streams = self.streams.lock();
        let consumer = streams
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SfuError::NotFound(format!("consumer {consumer_id} closed")))?;
        consumer.paused = paused;
        debug!(consumer_id = %consumer_id, paused, "Consumer delivery toggled");
        Ok(())
    }

    pub async fn pause_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Result<()> {
        self.set_producer_paused(peer_id, producer_id, true).await
    }

    pub async fn resume_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Result<()> {
        self.set_producer_paused(peer_id, producer_id, false).await
    }

    async fn set_producer_paused(
        &self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<()> {
        {
            let streams = self.streams.lock();
            let producer = streams
                .producers
                .get(producer_id)
                .filter(|producer| &producer.peer_id == peer_id)
                .ok_or_else(|| SfuError::NotFound(format!("producer {producer_id}")))?;
            if producer.paused == paused {
                return Ok(());
            }
        }

        let call = if paused {
            self.engine.pause_producer(producer_id)
        } else {
            self.engine.resume_producer(producer_id)
        };
        engine::bounded(self.timeout, call).await?;

        let mut streams = self.streams.lock();
        let producer = streams
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| SfuError::NotFound(format!("producer {producer_id} closed")))?;
        producer.paused = paused;
        debug!(producer_id = %producer_id, paused, "Producer delivery toggled");
        Ok(())
    }

    /// Close a producer and every consumer fed by it. Each consumer's owner
    /// receives one `stream_closed`.
    pub async fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        if self.close_producer_inner(producer_id, false).await {
            Ok(())
        } else {
            Err(SfuError::NotFound(format!("producer {producer_id}")))
        }
    }

    /// The engine closed a producer on its own; also tells the owner
    pub async fn producer_closed(&self, producer_id: &ProducerId) -> bool {
        self.close_producer_inner(producer_id, true).await
    }

    async fn close_producer_inner(&self, producer_id: &ProducerId, notify_owner: bool) -> bool {
        let mut released = Released::default();
        let owner = {
            let mut streams = self.streams.lock();
            let Some((producer, consumers)) = streams.remove_producer(producer_id) else {
                return false;
            };
            self.release_producer(producer_id, &producer, consumers, notify_owner, &mut released);
            producer.peer_id
        };
        self.close_released(released).await;
        info!(producer_id = %producer_id, peer_id = %owner, "Producer closed");
        true
    }

    /// Bookkeeping for a removed producer: notify subscribers (and optionally
    /// the owner) and queue the engine objects for closing. Runs under the lock.
    fn release_producer(
        &self,
        producer_id: &ProducerId,
        producer: &ProducerEntry,
        consumers: Vec<(ConsumerId, ConsumerEntry)>,
        notify_owner: bool,
        released: &mut Released,
    ) {
        for (consumer_id, consumer) in consumers {
            self.hub.send_to(
                &consumer.peer_id,
                ServerEvent::StreamClosed {
                    producer_id: producer_id.clone(),
                    consumer_id: consumer_id.clone(),
                },
            );
            released.consumers.push(consumer_id);
        }
        if notify_owner && self.peers.is_active(&producer.peer_id) {
            self.hub.send_to(
                &producer.peer_id,
                ServerEvent::ProducerClosed {
                    producer_id: producer_id.clone(),
                },
            );
        }
        released.producers.push(producer_id.clone());
    }

    /// Close a consumer at its owner's request
    pub async fn close_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        let removed = {
            let mut streams = self.streams.lock();
            let owned = streams
                .consumers
                .get(consumer_id)
                .is_some_and(|consumer| &consumer.peer_id == peer_id);
            if owned {
                streams.remove_consumer(consumer_id)
            } else {
                None
            }
        };
        if removed.is_none() {
            return Err(SfuError::NotFound(format!("consumer {consumer_id}")));
        }
        self.engine.close_consumer(consumer_id).await;
        debug!(peer_id = %peer_id, consumer_id = %consumer_id, "Consumer closed");
        Ok(())
    }

    /// Close every stream carried by a transport that has just been closed.
    ///
    /// Owners that are still connected are told about what they lost.
    pub async fn close_for_transport(&self, transport_id: &TransportId) -> usize {
        let mut released = Released::default();
        {
            let mut streams = self.streams.lock();
            let producer_ids: Vec<ProducerId> = streams
                .producers
                .iter()
                .filter(|(_, producer)| &producer.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            for producer_id in producer_ids {
                if let Some((producer, consumers)) = streams.remove_producer(&producer_id) {
                    self.release_producer(&producer_id, &producer, consumers, true, &mut released);
                }
            }

            let consumer_ids: Vec<ConsumerId> = streams
                .consumers
                .iter()
                .filter(|(_, consumer)| &consumer.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            for consumer_id in consumer_ids {
                if let Some(consumer) = streams.remove_consumer(&consumer_id) {
                    if self.peers.is_active(&consumer.peer_id) {
                        self.hub.send_to(
                            &consumer.peer_id,
                            ServerEvent::StreamClosed {
                                producer_id: consumer.producer_id.clone(),
                                consumer_id: consumer_id.clone(),
                            },
                        );
                    }
                    released.consumers.push(consumer_id);
                }
            }
        }

        let count = released.producers.len() + released.consumers.len();
        if count > 0 {
            debug!(transport_id = %transport_id, closed_streams = count, "Closed streams of transport");
        }
        self.close_released(released).await;
        count
    }

    /// Close every producer and consumer owned by a departing peer
    pub async fn close_all_for_peer(&self, peer_id: &PeerId) -> usize {
        let mut released = Released::default();
        {
            let mut streams = self.streams.lock();
            let Some(owned) = streams.owned.remove(peer_id) else {
                return 0;
            };
            for producer_id in owned.producers {
                if let Some((producer, consumers)) = streams.remove_producer(&producer_id) {
                    self.release_producer(&producer_id, &producer, consumers, false, &mut released);
                }
            }
            for consumer_id in owned.consumers {
                if streams.remove_consumer(&consumer_id).is_some() {
                    released.consumers.push(consumer_id);
                }
            }
        }

        let count = released.producers.len() + released.consumers.len();
        if count > 0 {
            info!(peer_id = %peer_id, closed_streams = count, "Closed remaining streams of peer");
        }
        self.close_released(released).await;
        count
    }

    async fn close_released(&self, released: Released) {
        for consumer_id in &released.consumers {
            self.engine.close_consumer(consumer_id).await;
        }
        for producer_id in &released.producers {
            self.engine.close_producer(producer_id).await;
        }
    }

    #[must_use]
    pub fn producer(&self, producer_id: &ProducerId) -> Option<ProducerDescriptor> {
        self.streams
            .lock()
            .producers
            .get(producer_id)
            .map(|producer| ProducerDescriptor {
                id: producer_id.clone(),
                peer_id: producer.peer_id.clone(),
                kind: producer.kind,
                paused: producer.paused,
            })
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<ConsumerInfo> {
        self.streams
            .lock()
            .consumers
            .get(consumer_id)
            .map(|consumer| ConsumerInfo {
                id: consumer_id.clone(),
                peer_id: consumer.peer_id.clone(),
                producer_id: consumer.producer_id.clone(),
                kind: consumer.kind,
                paused: consumer.paused,
            })
    }

    /// Consumers currently fed by a producer
    #[must_use]
    pub fn consumers_of(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        self.streams
            .lock()
            .subscribers
            .get(producer_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Producers published by members of a room
    #[must_use]
    pub fn producers_in_room(&self, room_id: &RoomId) -> Vec<ProducerInfo> {
        let members = self.rooms.members(room_id);
        let streams = self.streams.lock();
        members
            .iter()
            .filter_map(|peer_id| streams.owned.get(peer_id))
            .flat_map(|owned| owned.producers.iter())
            .filter_map(|producer_id| {
                streams.producers.get(producer_id).map(|producer| ProducerInfo {
                    producer_id: producer_id.clone(),
                    peer_id: producer.peer_id.clone(),
                    kind: producer.kind,
                })
            })
            .collect()
    }

    /// Whether the peer owns any producer or consumer
    #[must_use]
    pub fn has_streams(&self, peer_id: &PeerId) -> bool {
        self.streams.lock().owned.contains_key(peer_id)
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.streams.lock().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.streams.lock().consumers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(peer: &str) -> ProducerEntry {
        ProducerEntry {
            peer_id: PeerId::from(peer),
            transport_id: TransportId::from(format!("{peer}-send")),
            kind: MediaKind::Audio,
            paused: false,
        }
    }

    fn consumer(peer: &str, producer_id: &str) -> ConsumerEntry {
        ConsumerEntry {
            peer_id: PeerId::from(peer),
            transport_id: TransportId::from(format!("{peer}-recv")),
            producer_id: ProducerId::from(producer_id),
            kind: MediaKind::Audio,
            paused: true,
        }
    }

    #[test]
    fn test_remove_producer_takes_its_consumers() {
        let mut streams = Streams::default();
        streams.insert_producer(ProducerId::from("p1"), producer("a"));
        streams.insert_producer(ProducerId::from("p2"), producer("a"));
        streams.insert_consumer(ConsumerId::from("c1"), consumer("b", "p1"));
        streams.insert_consumer(ConsumerId::from("c2"), consumer("c", "p1"));
        streams.insert_consumer(ConsumerId::from("c3"), consumer("b", "p2"));

        let (entry, consumers) = streams.remove_producer(&ProducerId::from("p1")).unwrap();
        assert_eq!(entry.peer_id, PeerId::from("a"));
        let mut removed: Vec<_> = consumers.into_iter().map(|(id, _)| id).collect();
        removed.sort();
        assert_eq!(removed, vec![ConsumerId::from("c1"), ConsumerId::from("c2")]);

        assert_eq!(streams.consumers.len(), 1);
        assert!(!streams.subscribers.contains_key(&ProducerId::from("p1")));
        // c has nothing left, b still owns c3
        assert!(!streams.owned.contains_key(&PeerId::from("c")));
        assert!(streams.owned[&PeerId::from("b")]
            .consumers
            .contains(&ConsumerId::from("c3")));
        assert!(streams.remove_producer(&ProducerId::from("p1")).is_none());
    }

    #[test]
    fn test_remove_consumer_cleans_indexes() {
        let mut streams = Streams::default();
        streams.insert_producer(ProducerId::from("p1"), producer("a"));
        streams.insert_consumer(ConsumerId::from("c1"), consumer("b", "p1"));

        assert!(streams.remove_consumer(&ConsumerId::from("c1")).is_some());
        assert!(streams.remove_consumer(&ConsumerId::from("c1")).is_none());
        assert!(streams.subscribers.is_empty());
        assert!(!streams.owned.contains_key(&PeerId::from("b")));
        assert_eq!(streams.producers.len(), 1);
    }
}
