//! Session coordinator - top-level orchestration of signaling requests
//!
//! The coordinator owns every directory and is the only component that
//! crosses between them. It provides:
//! - Request dispatch with per-request precondition checks
//! - Room membership changes with `user_enter` / `user_exit` fan-out
//! - The ordered disconnect cascade (`remove_peer`)
//! - Translation of media engine notifications into cascades
//! - Global statistics

use crate::config::SfuConfig;
use crate::engine::{EngineEvent, MediaEngine, TransportOptions};
use crate::error::{Result, SfuError};
use crate::hub::SignalHub;
use crate::negotiator::CapabilityNegotiator;
use crate::peer::PeerRegistry;
use crate::protocol::{RelayKind, ServerEvent, SignalRequest, SignalResponse};
use crate::room::RoomDirectory;
use crate::stream::StreamDirectory;
use crate::transport::TransportManager;
use crate::types::{PeerId, RoomId, TransportRole};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Global session statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionStats {
    /// Registered peers
    pub peers: usize,
    /// Rooms with at least one member
    pub rooms: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    /// Open signaling channels
    pub connections: usize,
}

pub struct SessionCoordinator {
    config: Arc<SfuConfig>,
    peers: Arc<PeerRegistry>,
    rooms: Arc<RoomDirectory>,
    negotiator: Arc<CapabilityNegotiator>,
    transports: Arc<TransportManager>,
    streams: Arc<StreamDirectory>,
    hub: Arc<SignalHub>,
    /// Serializes room membership changes against each other and against removal
    membership: Mutex<()>,
    /// Cancelled when the media engine is lost
    shutdown: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(
        config: SfuConfig,
        options: TransportOptions,
        engine: Arc<dyn MediaEngine>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let timeout = config.engine_timeout();
        let peers = Arc::new(PeerRegistry::new());
        let rooms = Arc::new(RoomDirectory::new(Arc::clone(&config)));
        let hub = Arc::new(SignalHub::new());
        let negotiator = Arc::new(CapabilityNegotiator::new(Arc::clone(&engine)));
        let transports = Arc::new(TransportManager::new(
            Arc::clone(&engine),
            Arc::clone(&peers),
            options,
            timeout,
        ));
        let streams = Arc::new(StreamDirectory::new(
            engine,
            Arc::clone(&peers),
            Arc::clone(&rooms),
            Arc::clone(&transports),
            Arc::clone(&negotiator),
            Arc::clone(&hub),
            timeout,
        ));

        info!(
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            engine_timeout_ms = config.engine_timeout_ms,
            "Session coordinator initialized"
        );

        Arc::new(Self {
            config,
            peers,
            rooms,
            negotiator,
            transports,
            streams,
            hub,
            membership: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register a peer whose signaling channel just opened.
    ///
    /// The returned receiver carries every notification for the peer,
    /// starting with `welcome`.
    pub fn connect_peer(&self, peer_id: PeerId) -> Result<mpsc::UnboundedReceiver<ServerEvent>> {
        if self.shutdown.is_cancelled() {
            return Err(SfuError::EngineFailure(
                "media engine is unavailable".to_string(),
            ));
        }
        self.peers.register(peer_id.clone())?;
        let rx = self.hub.attach(peer_id.clone());
        self.hub.send_to(
            &peer_id,
            ServerEvent::Welcome {
                peer_id: peer_id.clone(),
            },
        );
        info!(peer_id = %peer_id, "Peer connected");
        Ok(rx)
    }

    /// Handle one signaling request. Failures are returned to the caller only.
    pub async fn handle(&self, peer_id: &PeerId, request: SignalRequest) -> Result<SignalResponse> {
        let method = request.method();
        let result = self.dispatch(peer_id, request).await;
        if let Err(e) = &result {
            warn!(peer_id = %peer_id, method, code = e.code(), error = %e, "Request rejected");
        }
        result
    }

    async fn dispatch(&self, peer_id: &PeerId, request: SignalRequest) -> Result<SignalResponse> {
        if !self.peers.is_active(peer_id) {
            return Err(SfuError::peer_not_found(peer_id));
        }

        match request {
            SignalRequest::JoinRoom { room_name } => self.join_room(peer_id, &room_name).await,
            SignalRequest::LeaveRoom => {
                self.leave_room(peer_id).await?;
                Ok(SignalResponse::Ack)
            }
            SignalRequest::GetRouterCapabilities => Ok(SignalResponse::RouterCapabilities(
                self.negotiator.server_capabilities().clone(),
            )),
            SignalRequest::CreateSendTransport => self
                .transports
                .create_send_transport(peer_id)
                .await
                .map(SignalResponse::Transport),
            SignalRequest::CreateReceiveTransport => self
                .transports
                .create_receive_transport(peer_id)
                .await
                .map(SignalResponse::Transport),
            SignalRequest::ConnectTransport {
                role,
                dtls_parameters,
            } => {
                self.transports
                    .connect(peer_id, role, &dtls_parameters)
                    .await?;
                Ok(SignalResponse::Ack)
            }
            SignalRequest::Produce {
                kind,
                rtp_parameters,
            } => {
                let room_id = self.require_room(peer_id)?;
                let producer = self
                    .streams
                    .create_producer(peer_id, &room_id, kind, &rtp_parameters)
                    .await?;
                Ok(SignalResponse::Produced { id: producer.id })
            }
            SignalRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let room_id = self.require_room(peer_id)?;
                self.streams
                    .create_consumer(peer_id, &room_id, &producer_id, &rtp_capabilities)
                    .await
                    .map(SignalResponse::Consumed)
            }
            SignalRequest::ResumeConsumer { consumer_id } => {
                self.streams.resume_consumer(peer_id, &consumer_id).await?;
                Ok(SignalResponse::Ack)
            }
            SignalRequest::PauseConsumer { consumer_id } => {
                self.streams.pause_consumer(peer_id, &consumer_id).await?;
                Ok(SignalResponse::Ack)
            }
            SignalRequest::CloseConsumer { consumer_id } => {
                self.streams.close_consumer(peer_id, &consumer_id).await?;
                Ok(SignalResponse::Ack)
            }
            SignalRequest::CloseProducer { producer_id } => {
                let owned = self
                    .streams
                    .producer(&producer_id)
                    .is_some_and(|producer| &producer.peer_id == peer_id);
                if !owned {
                    return Err(SfuError::NotFound(format!("producer {producer_id}")));
                }
                self.streams.close_producer(&producer_id).await?;
                Ok(SignalResponse::Ack)
            }
            SignalRequest::PauseProducer { producer_id } => {
                self.streams.pause_producer(peer_id, &producer_id).await?;
                Ok(SignalResponse::Ack)
            }
            SignalRequest::ResumeProducer { producer_id } => {
                self.streams.resume_producer(peer_id, &producer_id).await?;
                Ok(SignalResponse::Ack)
            }
            SignalRequest::Offer { target, payload } => {
                self.relay(RelayKind::Offer, peer_id, &target, payload)
            }
            SignalRequest::Answer { target, payload } => {
                self.relay(RelayKind::Answer, peer_id, &target, payload)
            }
            SignalRequest::Ice { target, payload } => {
                self.relay(RelayKind::Ice, peer_id, &target, payload)
            }
        }
    }

    fn require_room(&self, peer_id: &PeerId) -> Result<RoomId> {
        self.peers.room_of(peer_id).ok_or_else(|| {
            SfuError::InvalidState(format!("peer {peer_id} has not joined a room"))
        })
    }

    /// Move a peer into `room_id`, leaving its current room first.
    ///
    /// Joining the room the peer is already in changes nothing and notifies
    /// nobody.
    pub async fn join_room(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<SignalResponse> {
        let current = self.peers.room_of(peer_id);
        if current.as_ref() == Some(room_id) {
            return Ok(self.joined(peer_id, room_id));
        }
        if current.is_some() {
            self.leave_room(peer_id).await?;
        }

        {
            let _membership = self.membership.lock();
            if !self.peers.is_active(peer_id) {
                return Err(SfuError::peer_not_found(peer_id));
            }
            if let Some(other) = self.peers.room_of(peer_id) {
                // A concurrent join won the race.
                if &other != room_id {
                    return Err(SfuError::InvalidState(format!(
                        "peer {peer_id} is already in room {other}"
                    )));
                }
            } else {
                // Still listed when rejoining a room whose exit is in progress.
                let entered = self.rooms.join(room_id, peer_id)?;
                self.peers.set_room(peer_id, Some(room_id.clone()))?;
                if entered {
                    let others = self.rooms.others(room_id, peer_id);
                    self.hub.send_to_all(
                        &others,
                        &ServerEvent::UserEnter {
                            peer_id: peer_id.clone(),
                        },
                    );
                }
            }
        }

        Ok(self.joined(peer_id, room_id))
    }

    fn joined(&self, peer_id: &PeerId, room_id: &RoomId) -> SignalResponse {
        let mut peers = self.rooms.others(room_id, peer_id);
        peers.sort();
        let producers = self
            .streams
            .producers_in_room(room_id)
            .into_iter()
            .filter(|producer| &producer.peer_id != peer_id)
            .collect();
        SignalResponse::Joined {
            room: room_id.clone(),
            peers,
            producers,
        }
    }

    /// Leave the current room. No-op outside a room.
    ///
    /// Streams are scoped to the room. The peer's room is cleared first, so a
    /// produce or consume still waiting on the engine is refused when it
    /// completes, then the peer's producers and consumers are closed, and only
    /// then do the other members see `user_exit`.
    pub async fn leave_room(&self, peer_id: &PeerId) -> Result<()> {
        let room_id = {
            let _membership = self.membership.lock();
            let Some(room_id) = self.peers.room_of(peer_id) else {
                return Ok(());
            };
            self.peers.set_room(peer_id, None)?;
            room_id
        };

        self.streams.close_all_for_peer(peer_id).await;

        let _membership = self.membership.lock();
        if self.peers.room_of(peer_id).as_ref() == Some(&room_id) {
            debug!(peer_id = %peer_id, room_id = %room_id, "Peer rejoined the room it was leaving");
            return Ok(());
        }
        self.announce_exit(peer_id, &room_id);
        Ok(())
    }

    /// Membership half of a departure; caller holds the membership lock
    fn exit_room(&self, peer_id: &PeerId, room_id: &RoomId) -> Result<()> {
        self.peers.set_room(peer_id, None)?;
        self.announce_exit(peer_id, room_id);
        Ok(())
    }

    fn announce_exit(&self, peer_id: &PeerId, room_id: &RoomId) {
        self.rooms.leave(room_id, peer_id);
        let remaining = self.rooms.members(room_id);
        self.hub.send_to_all(
            &remaining,
            &ServerEvent::UserExit {
                peer_id: peer_id.clone(),
            },
        );
        info!(peer_id = %peer_id, room_id = %room_id, "Peer left room");
    }

    /// Forward a mesh negotiation payload to another member of the sender's room
    pub fn relay(
        &self,
        kind: RelayKind,
        from: &PeerId,
        target: &PeerId,
        payload: Value,
    ) -> Result<SignalResponse> {
        let room_id = self.require_room(from)?;
        if !self.rooms.contains(&room_id, target) {
            return Err(SfuError::NotFound(format!(
                "peer {target} is not in room {room_id}"
            )));
        }
        if !self
            .hub
            .send_to(target, ServerEvent::relay(kind, from.clone(), payload))
        {
            return Err(SfuError::peer_not_found(target));
        }
        debug!(from = %from, target = %target, kind = ?kind, "Relayed signaling payload");
        Ok(SignalResponse::Ack)
    }

    /// Tear down everything a peer owns, in order: transports (with the
    /// streams they carry), remaining streams, room membership with the
    /// `user_exit` broadcast, and finally the registry record.
    ///
    /// Safe to call more than once and for unknown peers.
    pub async fn remove_peer(&self, peer_id: &PeerId) {
        if !self.peers.begin_removal(peer_id) {
            self.hub.detach(peer_id);
            return;
        }

        for transport_id in self.transports.close_all(peer_id).await {
            self.streams.close_for_transport(&transport_id).await;
        }
        self.streams.close_all_for_peer(peer_id).await;

        {
            let _membership = self.membership.lock();
            if let Some(room_id) = self.peers.room_of(peer_id) {
                if let Err(e) = self.exit_room(peer_id, &room_id) {
                    debug!(peer_id = %peer_id, error = %e, "Peer vanished while leaving its room");
                }
            }
        }

        self.peers.unregister(peer_id);
        self.hub.detach(peer_id);
        info!(peer_id = %peer_id, remaining_peers = self.peers.len(), "Peer removed");
    }

    /// Apply one notification from the media engine
    pub async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportClosed { transport_id } => {
                let Some((peer_id, role)) = self.transports.owner_of(&transport_id) else {
                    debug!(transport_id = %transport_id, "Closed transport is not tracked");
                    return;
                };
                if self.transports.close_if(&peer_id, role, &transport_id).await {
                    warn!(
                        peer_id = %peer_id,
                        role = %role,
                        transport_id = %transport_id,
                        "Transport closed by media engine"
                    );
                    self.streams.close_for_transport(&transport_id).await;
                }
            }
            EngineEvent::ProducerClosed { producer_id } => {
                if self.streams.producer_closed(&producer_id).await {
                    warn!(producer_id = %producer_id, "Producer closed by media engine");
                }
            }
            EngineEvent::WorkerDied { reason } => {
                error!(reason = %reason, "Media engine died, shutting down");
                self.shutdown.cancel();
            }
        }
    }

    /// Drain engine notifications until the channel closes or shutdown starts
    pub async fn run_engine_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_engine_event(event).await,
                    None => {
                        error!("Media engine notification channel closed");
                        self.shutdown.cancel();
                        break;
                    }
                },
            }
        }
        debug!("Engine event loop stopped");
    }

    /// Cancelled once the media engine is gone; the server shuts down on it
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            peers: self.peers.len(),
            rooms: self.rooms.room_count(),
            transports: self.transports.transport_count(),
            producers: self.streams.producer_count(),
            consumers: self.streams.consumer_count(),
            connections: self.hub.connection_count(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    #[must_use]
    pub fn streams(&self) -> &StreamDirectory {
        &self.streams
    }

    #[must_use]
    pub fn transports(&self) -> &TransportManager {
        &self.transports
    }

    /// Whether the peer's `role` transport has completed its handshake
    #[must_use]
    pub fn is_connected(&self, peer_id: &PeerId, role: TransportRole) -> bool {
        self.transports.connected(peer_id, role).is_ok()
    }
}
