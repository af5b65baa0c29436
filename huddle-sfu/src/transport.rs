//! Transport lifecycle management
//!
//! Each peer owns at most one send and one receive transport. A role slot is
//! reserved before the engine is asked to create the transport, so racing
//! creates for the same slot produce exactly one transport. No lock is held
//! while an engine call is in flight; completions re-check that the slot they
//! reserved is still theirs and that the peer is still active, and hand the
//! engine object back otherwise.

use crate::engine::{self, DtlsParameters, MediaEngine, TransportOptions, TransportParams};
use crate::error::{Result, SfuError};
use crate::peer::PeerRegistry;
use crate::types::{PeerId, TransportId, TransportRole, TransportState};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Snapshot of a live transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportInfo {
    pub id: TransportId,
    pub peer_id: PeerId,
    pub role: TransportRole,
    pub state: TransportState,
}

#[derive(Debug)]
enum Slot {
    /// Creation in flight; `ticket` identifies the request that reserved it
    Pending { ticket: u64 },
    Live { id: TransportId, state: TransportState },
}

#[derive(Debug, Default)]
struct PeerTransports {
    send: Option<Slot>,
    receive: Option<Slot>,
}

impl PeerTransports {
    const fn slot(&self, role: TransportRole) -> &Option<Slot> {
        match role {
            TransportRole::Send => &self.send,
            TransportRole::Receive => &self.receive,
        }
    }

    fn slot_mut(&mut self, role: TransportRole) -> &mut Option<Slot> {
        match role {
            TransportRole::Send => &mut self.send,
            TransportRole::Receive => &mut self.receive,
        }
    }

    const fn is_empty(&self) -> bool {
        self.send.is_none() && self.receive.is_none()
    }
}

pub struct TransportManager {
    engine: Arc<dyn MediaEngine>,
    peers: Arc<PeerRegistry>,
    options: TransportOptions,
    timeout: Duration,
    transports: DashMap<PeerId, PeerTransports>,
    /// transport id -> owner, for engine notifications
    index: DashMap<TransportId, (PeerId, TransportRole)>,
    next_ticket: AtomicU64,
}

impl TransportManager {
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        peers: Arc<PeerRegistry>,
        options: TransportOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            peers,
            options,
            timeout,
            transports: DashMap::new(),
            index: DashMap::new(),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub async fn create_send_transport(&self, peer_id: &PeerId) -> Result<TransportParams> {
        self.create(peer_id, TransportRole::Send).await
    }

    pub async fn create_receive_transport(&self, peer_id: &PeerId) -> Result<TransportParams> {
        self.create(peer_id, TransportRole::Receive).await
    }

    /// Create the peer's transport for `role`. Fails with `DuplicateResource`
    /// while one exists (or is being created); close it first to replace it.
    pub async fn create(&self, peer_id: &PeerId, role: TransportRole) -> Result<TransportParams> {
        let ticket = self.reserve(peer_id, role)?;

        let params = match engine::bounded(self.timeout, self.engine.create_transport(&self.options)).await {
            Ok(params) => params,
            Err(e) => {
                error!(peer_id = %peer_id, role = %role, error = %e, "Engine failed to create transport");
                self.release(peer_id, role, ticket);
                return Err(e.into());
            }
        };

        if !self.adopt(peer_id, role, ticket, &params.id) {
            debug!(
                peer_id = %peer_id,
                transport_id = %params.id,
                "Peer or slot went away while creating transport, discarding"
            );
            self.release(peer_id, role, ticket);
            self.engine.close_transport(&params.id).await;
            return Err(SfuError::NotFound(format!(
                "peer {peer_id} disconnected while creating {role} transport"
            )));
        }

        info!(peer_id = %peer_id, role = %role, transport_id = %params.id, "Transport created");
        Ok(params)
    }

    fn reserve(&self, peer_id: &PeerId, role: TransportRole) -> Result<u64> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.transports.entry(peer_id.clone()).or_default();

        // Checked under the entry lock so a concurrent removal cannot slip in between.
        if !self.peers.is_active(peer_id) {
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.transports.remove_if(peer_id, |_, slots| slots.is_empty());
            }
            return Err(SfuError::peer_not_found(peer_id));
        }

        let slot = entry.slot_mut(role);
        if slot.is_some() {
            warn!(peer_id = %peer_id, role = %role, "Transport already exists for peer");
            return Err(SfuError::DuplicateResource(format!(
                "peer {peer_id} already has a {role} transport"
            )));
        }
        *slot = Some(Slot::Pending { ticket });
        Ok(ticket)
    }

    /// Turn our pending reservation into a live transport
    fn adopt(&self, peer_id: &PeerId, role: TransportRole, ticket: u64, id: &TransportId) -> bool {
        let Some(mut entry) = self.transports.get_mut(peer_id) else {
            return false;
        };
        if !self.peers.is_active(peer_id) {
            return false;
        }
        let slot = entry.slot_mut(role);
        if !matches!(slot, Some(Slot::Pending { ticket: t }) if *t == ticket) {
            return false;
        }
        *slot = Some(Slot::Live {
            id: id.clone(),
            state: TransportState::New,
        });
        self.index.insert(id.clone(), (peer_id.clone(), role));
        true
    }

    /// Drop our pending reservation, if it is still ours
    fn release(&self, peer_id: &PeerId, role: TransportRole, ticket: u64) {
        if let Some(mut entry) = self.transports.get_mut(peer_id) {
            let slot = entry.slot_mut(role);
            if matches!(slot, Some(Slot::Pending { ticket: t }) if *t == ticket) {
                *slot = None;
            }
        }
        self.transports.remove_if(peer_id, |_, slots| slots.is_empty());
    }

    /// Complete the DTLS handshake for the peer's `role` transport.
    ///
    /// If the engine rejects the parameters the transport is closed; the
    /// client has to create a new one.
    pub async fn connect(
        &self,
        peer_id: &PeerId,
        role: TransportRole,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        let transport_id = self.begin_connect(peer_id, role)?;

        let result = engine::bounded(
            self.timeout,
            self.engine.connect_transport(&transport_id, dtls_parameters),
        )
        .await;

        match result {
            Ok(()) => {
                if self.set_state(peer_id, role, &transport_id, TransportState::Connected) {
                    info!(peer_id = %peer_id, role = %role, transport_id = %transport_id, "Transport connected");
                    Ok(())
                } else {
                    Err(SfuError::NotFound(format!(
                        "{role} transport {transport_id} closed while connecting"
                    )))
                }
            }
            Err(e) => {
                warn!(
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    error = %e,
                    "Transport connect rejected, closing transport"
                );
                self.close_if(peer_id, role, &transport_id).await;
                Err(e.into())
            }
        }
    }

    fn begin_connect(&self, peer_id: &PeerId, role: TransportRole) -> Result<TransportId> {
        let mut entry = self.transports.get_mut(peer_id).ok_or_else(|| {
            SfuError::NotFound(format!("peer {peer_id} has no {role} transport"))
        })?;
        match entry.slot_mut(role) {
            Some(Slot::Live { id, state }) => {
                if !state.can_transition_to(TransportState::Connecting) {
                    return Err(SfuError::InvalidState(format!(
                        "{role} transport {id} is {state:?}, expected New"
                    )));
                }
                *state = TransportState::Connecting;
                Ok(id.clone())
            }
            Some(Slot::Pending { .. }) => Err(SfuError::InvalidState(format!(
                "{role} transport is still being created"
            ))),
            None => Err(SfuError::NotFound(format!(
                "peer {peer_id} has no {role} transport"
            ))),
        }
    }

    fn set_state(
        &self,
        peer_id: &PeerId,
        role: TransportRole,
        transport_id: &TransportId,
        next: TransportState,
    ) -> bool {
        let Some(mut entry) = self.transports.get_mut(peer_id) else {
            return false;
        };
        match entry.slot_mut(role) {
            Some(Slot::Live { id, state }) if id == transport_id && state.can_transition_to(next) => {
                *state = next;
                true
            }
            _ => false,
        }
    }

    /// Close the peer's `role` transport. Idempotent; returns the id that was
    /// closed so the caller can cascade to streams carried by it.
    pub async fn close(&self, peer_id: &PeerId, role: TransportRole) -> Option<TransportId> {
        let taken = self
            .transports
            .get_mut(peer_id)
            .and_then(|mut entry| entry.slot_mut(role).take());
        self.transports.remove_if(peer_id, |_, slots| slots.is_empty());

        match taken {
            Some(Slot::Live { id, .. }) => {
                self.finish_close(peer_id, role, &id).await;
                Some(id)
            }
            // An in-flight create notices the missing reservation and discards its result.
            Some(Slot::Pending { .. }) | None => None,
        }
    }

    /// Close only if the slot still holds `transport_id`
    pub async fn close_if(
        &self,
        peer_id: &PeerId,
        role: TransportRole,
        transport_id: &TransportId,
    ) -> bool {
        let taken = self.transports.get_mut(peer_id).is_some_and(|mut entry| {
            let slot = entry.slot_mut(role);
            if matches!(slot, Some(Slot::Live { id, .. }) if id == transport_id) {
                *slot = None;
                true
            } else {
                false
            }
        });
        self.transports.remove_if(peer_id, |_, slots| slots.is_empty());

        if taken {
            self.finish_close(peer_id, role, transport_id).await;
        }
        taken
    }

    /// Close both transports of a peer, returning the ids that were closed
    pub async fn close_all(&self, peer_id: &PeerId) -> Vec<TransportId> {
        let mut closed = Vec::new();
        for role in [TransportRole::Send, TransportRole::Receive] {
            if let Some(id) = self.close(peer_id, role).await {
                closed.push(id);
            }
        }
        closed
    }

    async fn finish_close(&self, peer_id: &PeerId, role: TransportRole, transport_id: &TransportId) {
        self.index.remove(transport_id);
        self.engine.close_transport(transport_id).await;
        info!(peer_id = %peer_id, role = %role, transport_id = %transport_id, "Transport closed");
    }

    /// Id of the peer's `role` transport if it is connected.
    ///
    /// `NotFound` when the peer has no such transport, `InvalidState` when it
    /// exists but has not completed its handshake.
    pub fn connected(&self, peer_id: &PeerId, role: TransportRole) -> Result<TransportId> {
        let entry = self.transports.get(peer_id).ok_or_else(|| {
            SfuError::NotFound(format!("peer {peer_id} has no {role} transport"))
        })?;
        match entry.slot(role) {
            Some(Slot::Live {
                id,
                state: TransportState::Connected,
            }) => Ok(id.clone()),
            Some(Slot::Live { id, state }) => Err(SfuError::InvalidState(format!(
                "{role} transport {id} is {state:?}, expected Connected"
            ))),
            Some(Slot::Pending { .. }) => Err(SfuError::InvalidState(format!(
                "{role} transport is still being created"
            ))),
            None => Err(SfuError::NotFound(format!(
                "peer {peer_id} has no {role} transport"
            ))),
        }
    }

    /// Whether `transport_id` is still the peer's connected `role` transport
    #[must_use]
    pub fn is_connected_as(&self, peer_id: &PeerId, role: TransportRole, transport_id: &TransportId) -> bool {
        self.connected(peer_id, role)
            .is_ok_and(|current| &current == transport_id)
    }

    #[must_use]
    pub fn info(&self, peer_id: &PeerId, role: TransportRole) -> Option<TransportInfo> {
        let entry = self.transports.get(peer_id)?;
        match entry.slot(role) {
            Some(Slot::Live { id, state }) => Some(TransportInfo {
                id: id.clone(),
                peer_id: peer_id.clone(),
                role,
                state: *state,
            }),
            _ => None,
        }
    }

    /// Owner of a transport id
    #[must_use]
    pub fn owner_of(&self, transport_id: &TransportId) -> Option<(PeerId, TransportRole)> {
        self.index.get(transport_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.index.len()
    }
}
