//! Media engine contract
//!
//! The session layer never touches ICE, DTLS or RTP itself. Everything that
//! happens on the media path goes through [`MediaEngine`], and everything the
//! engine decides on its own (a transport dropping, a producer going away, the
//! worker process dying) comes back as an [`EngineEvent`] on a channel the
//! engine hands out at construction.
//!
//! Engine payloads (capabilities, ICE/DTLS/RTP parameters) are opaque JSON to
//! this layer and are passed through to clients untouched.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Router capability descriptor (codecs, header extensions)
pub type RouterCapabilities = Value;
/// Receive capabilities declared by a consuming peer
pub type RtpCapabilities = Value;
/// RTP parameters of a produced or consumed stream
pub type RtpParameters = Value;
/// Remote DTLS parameters supplied by the client
pub type DtlsParameters = Value;

/// Options for creating a transport, derived from [`EngineConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub listen_ip: String,
    pub announced_ip: String,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

impl From<&EngineConfig> for TransportOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.public_ip().to_string(),
            enable_udp: config.enable_udp,
            enable_tcp: config.enable_tcp,
            prefer_udp: config.prefer_udp,
            initial_available_outgoing_bitrate: config.initial_available_outgoing_bitrate,
        }
    }
}

/// Connection parameters a client needs to set up its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// What the engine returns for a newly created consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
}

/// Notifications the engine raises on its own initiative
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A transport closed underneath us (e.g. DTLS state went to closed)
    TransportClosed { transport_id: TransportId },
    /// A producer closed underneath us
    ProducerClosed { producer_id: ProducerId },
    /// The engine worker terminated; every session is gone
    WorkerDied { reason: String },
}

/// The media engine collaborator.
///
/// Close operations are fire-and-forget and must tolerate ids that are
/// already closed.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Capabilities computed once from the configured codec set
    fn capabilities(&self) -> RouterCapabilities;

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<TransportParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn close_transport(&self, transport_id: &TransportId);

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    async fn pause_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError>;

    async fn resume_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &ProducerId);

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, EngineError>;

    async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &ConsumerId);
}

/// Run an engine call with an upper bound on how long it may take
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(
            u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), EngineError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(EngineError::Timeout(10)));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded(Duration::from_secs(1), async { Ok::<_, EngineError>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn test_transport_options_use_announced_ip() {
        let mut config = EngineConfig::default();
        config.announced_ip = Some("192.0.2.10".to_string());
        let options = TransportOptions::from(&config);
        assert_eq!(options.listen_ip, "0.0.0.0");
        assert_eq!(options.announced_ip, "192.0.2.10");
    }
}
