//! Signaling wire protocol
//!
//! Requests carry a client-chosen correlation `id` which is echoed in the
//! matching response. Notifications are pushed as events and carry no id.
//!
//! ```json
//! {"id": 3, "method": "produce", "kind": "audio", "rtp_parameters": {...}}
//! {"type": "response", "id": 3, "ok": true, "data": {"id": "..."}}
//! {"type": "event", "event": "new_stream", "producer_id": "...", "peer_id": "...", "kind": "audio"}
//! ```

use crate::engine::{DtlsParameters, RtpCapabilities, RtpParameters, TransportParams};
use crate::error::SfuError;
use crate::stream::{ConsumerDescriptor, ProducerInfo};
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound frame: correlation id plus the request itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub id: u64,
    #[serde(flatten)]
    pub request: SignalRequest,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Peer-to-peer payloads relayed verbatim (mesh topology)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    Offer,
    Answer,
    Ice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SignalRequest {
    JoinRoom {
        room_name: RoomId,
    },
    LeaveRoom,
    GetRouterCapabilities,
    CreateSendTransport,
    CreateReceiveTransport,
    ConnectTransport {
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    PauseConsumer {
        consumer_id: ConsumerId,
    },
    CloseConsumer {
        consumer_id: ConsumerId,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    PauseProducer {
        producer_id: ProducerId,
    },
    ResumeProducer {
        producer_id: ProducerId,
    },
    Offer {
        target: PeerId,
        payload: Value,
    },
    Answer {
        target: PeerId,
        payload: Value,
    },
    Ice {
        target: PeerId,
        payload: Value,
    },
}

impl SignalRequest {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::GetRouterCapabilities => "get_router_capabilities",
            Self::CreateSendTransport => "create_send_transport",
            Self::CreateReceiveTransport => "create_receive_transport",
            Self::ConnectTransport { .. } => "connect_transport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume_consumer",
            Self::PauseConsumer { .. } => "pause_consumer",
            Self::CloseConsumer { .. } => "close_consumer",
            Self::CloseProducer { .. } => "close_producer",
            Self::PauseProducer { .. } => "pause_producer",
            Self::ResumeProducer { .. } => "resume_producer",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
        }
    }
}

/// Successful result of a request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalResponse {
    Ack,
    Joined {
        room: RoomId,
        /// Members already in the room
        peers: Vec<PeerId>,
        /// Streams already published in the room
        producers: Vec<ProducerInfo>,
    },
    RouterCapabilities(Value),
    Transport(TransportParams),
    Produced {
        id: ProducerId,
    },
    Consumed(ConsumerDescriptor),
}

/// Notifications pushed to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First message on a new channel, carrying the assigned peer id
    Welcome { peer_id: PeerId },
    UserEnter { peer_id: PeerId },
    UserExit { peer_id: PeerId },
    NewStream {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    /// One of this peer's consumers was closed
    StreamClosed {
        producer_id: ProducerId,
        consumer_id: ConsumerId,
    },
    /// One of this peer's producers was closed by the engine
    ProducerClosed { producer_id: ProducerId },
    Offer { from: PeerId, payload: Value },
    Answer { from: PeerId, payload: Value },
    Ice { from: PeerId, payload: Value },
}

impl ServerEvent {
    #[must_use]
    pub fn relay(kind: RelayKind, from: PeerId, payload: Value) -> Self {
        match kind {
            RelayKind::Offer => Self::Offer { from, payload },
            RelayKind::Answer => Self::Answer { from, payload },
            RelayKind::Ice => Self::Ice { from, payload },
        }
    }

    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::UserEnter { .. } => "user_enter",
            Self::UserExit { .. } => "user_exit",
            Self::NewStream { .. } => "new_stream",
            Self::StreamClosed { .. } => "stream_closed",
            Self::ProducerClosed { .. } => "producer_closed",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(ResponseEnvelope),
    Event(ServerEvent),
}

impl ServerMessage {
    /// Wrap a handler result as the response to request `id`
    #[must_use]
    pub fn reply(id: u64, result: Result<SignalResponse, SfuError>) -> Self {
        match result.map(|response| serde_json::to_value(response)) {
            Ok(Ok(data)) => Self::Response(ResponseEnvelope {
                id,
                ok: true,
                data: Some(data),
                error: None,
            }),
            Ok(Err(e)) => Self::failure(id, "internal", e.to_string()),
            Err(e) => Self::failure(id, e.code(), e.to_string()),
        }
    }

    #[must_use]
    pub fn failure(id: u64, code: &str, message: impl Into<String>) -> Self {
        Self::Response(ResponseEnvelope {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
