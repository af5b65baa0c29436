//! Shared helpers for the session integration tests
//!
//! `FakeEngine` is a scriptable media engine: it can reject DTLS parameters,
//! refuse consumption, and hold one named call until the test releases it.

#![allow(dead_code)]

use async_trait::async_trait;
use huddle_sfu::engine::{DtlsParameters, RtpCapabilities, RtpParameters};
use huddle_sfu::{
    ConsumerId, ConsumerParams, EngineError, MediaEngine, MediaKind, PeerId, ProducerId,
    RoomId, ServerEvent, SessionCoordinator, SfuConfig, SignalRequest, SignalResponse,
    TransportId, TransportOptions, TransportParams, TransportRole,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// A one-shot hold on a named engine call
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
pub struct FakeEngine {
    next_id: AtomicU64,
    pub reject_dtls: AtomicBool,
    pub refuse_consume: AtomicBool,
    gates: Mutex<HashMap<&'static str, Gate>>,
    producers: Mutex<HashMap<ProducerId, MediaKind>>,
    pub closed_transports: Mutex<Vec<TransportId>>,
    pub closed_producers: Mutex<Vec<ProducerId>>,
    pub closed_consumers: Mutex<Vec<ConsumerId>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next call to `method` wait. Returns (entered, release).
    pub fn hold(&self, method: &'static str) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.gates.lock().insert(
            method,
            Gate {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            },
        );
        (entered, release)
    }

    async fn pass(&self, method: &'static str) {
        let gate = self.gates.lock().remove(method);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn capabilities(&self) -> Value {
        json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus"}]})
    }

    async fn create_transport(
        &self,
        _options: &TransportOptions,
    ) -> Result<TransportParams, EngineError> {
        self.pass("create_transport").await;
        Ok(TransportParams {
            id: TransportId::new(self.next("transport")),
            ice_parameters: json!({"usernameFragment": "u", "password": "p"}),
            ice_candidates: json!([]),
            dtls_parameters: json!({"role": "auto", "fingerprints": []}),
        })
    }

    async fn connect_transport(
        &self,
        _transport_id: &TransportId,
        _dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.pass("connect_transport").await;
        if self.reject_dtls.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("bad fingerprint".to_string()));
        }
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        self.closed_transports.lock().push(transport_id.clone());
    }

    async fn produce(
        &self,
        _transport_id: &TransportId,
        kind: MediaKind,
        _rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.pass("produce").await;
        let id = ProducerId::new(self.next("producer"));
        self.producers.lock().insert(id.clone(), kind);
        Ok(id)
    }

    async fn pause_producer(&self, _producer_id: &ProducerId) -> Result<(), EngineError> {
        Ok(())
    }

    async fn resume_producer(&self, _producer_id: &ProducerId) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        self.producers.lock().remove(producer_id);
        self.closed_producers.lock().push(producer_id.clone());
    }

    fn can_consume(&self, producer_id: &ProducerId, _rtp_capabilities: &RtpCapabilities) -> bool {
        !self.refuse_consume.load(Ordering::SeqCst) && self.producers.lock().contains_key(producer_id)
    }

    async fn consume(
        &self,
        _transport_id: &TransportId,
        producer_id: &ProducerId,
        _rtp_capabilities: &RtpCapabilities,
        _paused: bool,
    ) -> Result<ConsumerParams, EngineError> {
        self.pass("consume").await;
        let kind = self
            .producers
            .lock()
            .get(producer_id)
            .copied()
            .ok_or_else(|| EngineError::Rejected(format!("unknown producer {producer_id}")))?;
        Ok(ConsumerParams {
            id: ConsumerId::new(self.next("consumer")),
            kind,
            rtp_parameters: json!({"codecs": [{"mimeType": "audio/opus"}]}),
            consumer_type: "simple".to_string(),
            producer_paused: false,
        })
    }

    async fn pause_consumer(&self, _consumer_id: &ConsumerId) -> Result<(), EngineError> {
        Ok(())
    }

    async fn resume_consumer(&self, _consumer_id: &ConsumerId) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.closed_consumers.lock().push(consumer_id.clone());
    }
}

pub fn setup() -> (Arc<SessionCoordinator>, Arc<FakeEngine>) {
    setup_with(SfuConfig::default())
}

pub fn setup_with(config: SfuConfig) -> (Arc<SessionCoordinator>, Arc<FakeEngine>) {
    let engine = FakeEngine::new();
    let options = TransportOptions::from(&huddle_sfu::EngineConfig::default());
    let coordinator = SessionCoordinator::new(config, options, Arc::clone(&engine) as Arc<dyn MediaEngine>);
    (coordinator, engine)
}

pub type Events = mpsc::UnboundedReceiver<ServerEvent>;

/// Connect a peer and swallow its welcome
pub fn connect(coordinator: &SessionCoordinator, id: &str) -> (PeerId, Events) {
    let peer_id = PeerId::from(id);
    let mut rx = coordinator.connect_peer(peer_id.clone()).unwrap();
    assert!(matches!(rx.try_recv(), Ok(ServerEvent::Welcome { .. })));
    (peer_id, rx)
}

pub async fn join(coordinator: &SessionCoordinator, peer_id: &PeerId, room: &str) {
    coordinator
        .handle(
            peer_id,
            SignalRequest::JoinRoom {
                room_name: RoomId::from(room),
            },
        )
        .await
        .unwrap();
}

pub fn dtls() -> Value {
    json!({"role": "client", "fingerprints": [{"algorithm": "sha-256", "value": "AB:CD"}]})
}

pub fn caps() -> Value {
    json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus"}]})
}

/// Create and connect a transport of `role`
pub async fn ready_transport(
    coordinator: &SessionCoordinator,
    peer_id: &PeerId,
    role: TransportRole,
) -> TransportId {
    let request = match role {
        TransportRole::Send => SignalRequest::CreateSendTransport,
        TransportRole::Receive => SignalRequest::CreateReceiveTransport,
    };
    let SignalResponse::Transport(params) = coordinator.handle(peer_id, request).await.unwrap()
    else {
        panic!("expected transport parameters");
    };
    coordinator
        .handle(
            peer_id,
            SignalRequest::ConnectTransport {
                role,
                dtls_parameters: dtls(),
            },
        )
        .await
        .unwrap();
    params.id
}

pub async fn produce_audio(coordinator: &SessionCoordinator, peer_id: &PeerId) -> ProducerId {
    let response = coordinator
        .handle(
            peer_id,
            SignalRequest::Produce {
                kind: MediaKind::Audio,
                rtp_parameters: json!({"codecs": [{"mimeType": "audio/opus"}]}),
            },
        )
        .await
        .unwrap();
    let SignalResponse::Produced { id } = response else {
        panic!("expected producer id");
    };
    id
}

pub async fn consume(
    coordinator: &SessionCoordinator,
    peer_id: &PeerId,
    producer_id: &ProducerId,
) -> huddle_sfu::Result<ConsumerId> {
    let response = coordinator
        .handle(
            peer_id,
            SignalRequest::Consume {
                producer_id: producer_id.clone(),
                rtp_capabilities: caps(),
            },
        )
        .await?;
    let SignalResponse::Consumed(descriptor) = response else {
        panic!("expected consumer descriptor");
    };
    Ok(descriptor.id)
}

pub fn drain(rx: &mut Events) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Assert nothing more arrives within a short window
pub async fn assert_silent(rx: &mut Events) {
    let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(matches!(next, Err(_) | Ok(None)), "unexpected event: {next:?}");
}

pub fn stream_closed_count(events: &[ServerEvent], producer_id: &ProducerId) -> usize {
    events
        .iter()
        .filter(|event| {
            matches!(event, ServerEvent::StreamClosed { producer_id: p, .. } if p == producer_id)
        })
        .count()
}
