//! In-process media engine
//!
//! `LocalEngine` implements the control surface of [`MediaEngine`] without a
//! packet path: it hands out ids, ICE credentials, DTLS fingerprints and
//! ports from the configured RTC range, validates codecs against the router
//! codec set and tracks which objects exist. It is what the server runs with
//! when no external media worker is attached, and it is deterministic enough
//! to back tests.

use crate::config::{payload_type, CodecConfig, EngineConfig, MAX_MEDIA_CODECS};
use crate::engine::{
    ConsumerParams, DtlsParameters, EngineEvent, MediaEngine, RouterCapabilities,
    RtpCapabilities, RtpParameters, TransportOptions, TransportParams,
};
use crate::error::EngineError;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct LocalTransport {
    port: u16,
    connected: bool,
}

struct LocalProducer {
    transport_id: TransportId,
    codec: Value,
    paused: bool,
}

struct LocalConsumer {
    transport_id: TransportId,
    paused: bool,
}

#[derive(Default)]
struct EngineState {
    free_ports: BTreeSet<u16>,
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
}

impl EngineState {
    fn connected_transport(&self, transport_id: &TransportId) -> Result<(), EngineError> {
        match self.transports.get(transport_id) {
            Some(transport) if transport.connected => Ok(()),
            Some(_) => Err(EngineError::Rejected(format!(
                "transport {transport_id} is not connected"
            ))),
            None => Err(EngineError::Rejected(format!(
                "unknown transport {transport_id}"
            ))),
        }
    }
}

pub struct LocalEngine {
    config: EngineConfig,
    capabilities: RouterCapabilities,
    state: Mutex<EngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    alive: AtomicBool,
}

impl LocalEngine {
    /// Build the engine and the channel its lifecycle notifications arrive on
    pub fn new(config: EngineConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let capabilities = router_capabilities(&config.media_codecs);
        let state = EngineState {
            free_ports: (config.rtc_min_port..=config.rtc_max_port).collect(),
            ..EngineState::default()
        };

        if config.media_codecs.len() > MAX_MEDIA_CODECS {
            warn!(
                configured = config.media_codecs.len(),
                advertised = MAX_MEDIA_CODECS,
                "Codecs past the dynamic payload range are ignored"
            );
        }
        info!(
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            codecs = config.media_codecs.len(),
            "Local media engine started"
        );

        let engine = Arc::new(Self {
            config,
            capabilities,
            state: Mutex::new(state),
            events,
            alive: AtomicBool::new(true),
        });
        (engine, rx)
    }

    /// Stop the engine; every later call fails and `WorkerDied` is emitted
    pub fn terminate(&self, reason: impl Into<String>) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let reason = reason.into();
            error!(reason = %reason, "Local media engine terminated");
            let _ = self.events.send(EngineEvent::WorkerDied { reason });
        }
    }

    /// Drop a transport as if its DTLS session had closed remotely
    pub fn drop_transport(&self, transport_id: &TransportId) {
        if self.remove_transport(transport_id) {
            let _ = self.events.send(EngineEvent::TransportClosed {
                transport_id: transport_id.clone(),
            });
        }
    }

    #[must_use]
    pub fn free_port_count(&self) -> usize {
        self.state.lock().free_ports.len()
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unavailable)
        }
    }

    fn remove_transport(&self, transport_id: &TransportId) -> bool {
        let mut state = self.state.lock();
        let Some(transport) = state.transports.remove(transport_id) else {
            return false;
        };
        state.free_ports.insert(transport.port);
        state.producers.retain(|_, p| &p.transport_id != transport_id);
        state.consumers.retain(|_, c| &c.transport_id != transport_id);
        true
    }

    fn find_codec(&self, kind: MediaKind, mime_type: &str) -> Option<(u8, &CodecConfig)> {
        self.config
            .media_codecs
            .iter()
            .enumerate()
            .filter_map(|(index, codec)| payload_type(index).map(|pt| (pt, codec)))
            .find(|(_, codec)| codec.kind == kind && codec.mime_type.eq_ignore_ascii_case(mime_type))
    }

    fn ice_candidates(&self, options: &TransportOptions, port: u16) -> Value {
        let mut candidates = Vec::new();
        let mut protocols = Vec::new();
        if options.enable_udp {
            protocols.push("udp");
        }
        if options.enable_tcp {
            protocols.push("tcp");
        }
        if !options.prefer_udp {
            protocols.reverse();
        }
        for (rank, protocol) in protocols.into_iter().enumerate() {
            let priority = 1_076_302_079_u32 - u32::try_from(rank).unwrap_or(0) * 1_000_000;
            let mut candidate = json!({
                "foundation": format!("{protocol}candidate"),
                "priority": priority,
                "ip": options.announced_ip,
                "address": options.announced_ip,
                "protocol": protocol,
                "port": port,
                "type": "host",
            });
            if protocol == "tcp" {
                candidate["tcpType"] = json!("passive");
            }
            candidates.push(candidate);
        }
        Value::Array(candidates)
    }
}

/// Capability descriptor for a codec list
fn router_capabilities(codecs: &[CodecConfig]) -> RouterCapabilities {
    let codecs: Vec<Value> = codecs
        .iter()
        .enumerate()
        .filter_map(|(index, codec)| payload_type(index).map(|pt| codec_json(pt, codec)))
        .collect();
    json!({ "codecs": codecs, "headerExtensions": [] })
}

fn codec_json(payload_type: u8, codec: &CodecConfig) -> Value {
    let mut value = serde_json::to_value(codec).unwrap_or_else(|_| json!({}));
    value["preferredPayloadType"] = json!(payload_type);
    value
}

fn dtls_fingerprint() -> String {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    hex::encode_upper(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

fn first_mime_type(rtp_parameters: &RtpParameters) -> Option<&str> {
    rtp_parameters
        .get("codecs")?
        .as_array()?
        .first()?
        .get("mimeType")?
        .as_str()
}

fn valid_dtls(dtls_parameters: &DtlsParameters) -> bool {
    dtls_parameters
        .get("fingerprints")
        .and_then(Value::as_array)
        .is_some_and(|fingerprints| {
            !fingerprints.is_empty()
                && fingerprints.iter().all(|fp| {
                    fp.get("algorithm").and_then(Value::as_str).is_some()
                        && fp.get("value").and_then(Value::as_str).is_some()
                })
        })
}

fn declares_mime_type(rtp_capabilities: &RtpCapabilities, mime_type: &str) -> bool {
    rtp_capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .is_some_and(|codecs| {
            codecs.iter().any(|codec| {
                codec
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .is_some_and(|m| m.eq_ignore_ascii_case(mime_type))
            })
        })
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn capabilities(&self) -> RouterCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<TransportParams, EngineError> {
        self.ensure_alive()?;
        let port = self
            .state
            .lock()
            .free_ports
            .pop_first()
            .ok_or_else(|| EngineError::Rejected("no free RTC ports".to_string()))?;

        let id = TransportId::new(Uuid::new_v4().to_string());
        self.state.lock().transports.insert(
            id.clone(),
            LocalTransport {
                port,
                connected: false,
            },
        );
        debug!(transport_id = %id, port, "Local transport allocated");

        Ok(TransportParams {
            ice_parameters: json!({
                "usernameFragment": nanoid::nanoid!(16),
                "password": nanoid::nanoid!(32),
                "iceLite": true,
            }),
            ice_candidates: self.ice_candidates(options, port),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": dtls_fingerprint() }],
            }),
            id,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if !valid_dtls(dtls_parameters) {
            return Err(EngineError::Rejected("invalid DTLS parameters".to_string()));
        }
        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::Rejected(format!("unknown transport {transport_id}")))?;
        if transport.connected {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} already connected"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        if self.remove_transport(transport_id) {
            debug!(transport_id = %transport_id, "Local transport released");
        }
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.ensure_alive()?;
        let mime_type = first_mime_type(rtp_parameters)
            .ok_or_else(|| EngineError::Rejected("rtp parameters carry no codec".to_string()))?;
        let (pt, codec) = self.find_codec(kind, mime_type).ok_or_else(|| {
            EngineError::Rejected(format!("unsupported {kind} codec {mime_type}"))
        })?;
        let codec = codec_json(pt, codec);

        let mut state = self.state.lock();
        state.connected_transport(transport_id)?;
        let id = ProducerId::new(Uuid::new_v4().to_string());
        state.producers.insert(
            id.clone(),
            LocalProducer {
                transport_id: transport_id.clone(),
                codec,
                paused: false,
            },
        );
        Ok(id)
    }

    async fn pause_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let mut state = self.state.lock();
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::Rejected(format!("unknown producer {producer_id}")))?;
        producer.paused = true;
        Ok(())
    }

    async fn resume_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let mut state = self.state.lock();
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::Rejected(format!("unknown producer {producer_id}")))?;
        producer.paused = false;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        self.state.lock().producers.remove(producer_id);
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = self.state.lock();
        state.producers.get(producer_id).is_some_and(|producer| {
            producer
                .codec
                .get("mimeType")
                .and_then(Value::as_str)
                .is_some_and(|mime_type| declares_mime_type(rtp_capabilities, mime_type))
        })
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, EngineError> {
        self.ensure_alive()?;
        if !self.can_consume(producer_id, rtp_capabilities) {
            return Err(EngineError::Rejected(format!(
                "cannot consume producer {producer_id}"
            )));
        }

        let mut state = self.state.lock();
        state.connected_transport(transport_id)?;
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::Rejected(format!("unknown producer {producer_id}")))?;

        let kind = match producer.codec.get("kind").and_then(Value::as_str) {
            Some("audio") => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let mut codec = producer.codec.clone();
        codec["payloadType"] = codec["preferredPayloadType"].clone();
        let uuid = Uuid::new_v4();
        // Low 32 bits of a random uuid make a fine SSRC.
        let ssrc = (uuid.as_u128() & u128::from(u32::MAX)) as u32;
        let producer_paused = producer.paused;

        let id = ConsumerId::new(uuid.to_string());
        state.consumers.insert(
            id.clone(),
            LocalConsumer {
                transport_id: transport_id.clone(),
                paused,
            },
        );

        Ok(ConsumerParams {
            id,
            kind,
            rtp_parameters: json!({
                "codecs": [codec],
                "encodings": [{ "ssrc": ssrc }],
                "headerExtensions": [],
            }),
            consumer_type: "simple".to_string(),
            producer_paused,
        })
    }

    async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::Rejected(format!("unknown consumer {consumer_id}")))?;
        consumer.paused = true;
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::Rejected(format!("unknown consumer {consumer_id}")))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.state.lock().consumers.remove(consumer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> EngineConfig {
        EngineConfig {
            rtc_min_port: 40000,
            rtc_max_port: 40001,
            ..EngineConfig::default()
        }
    }

    fn dtls() -> Value {
        json!({"role": "client", "fingerprints": [{"algorithm": "sha-256", "value": "AA:BB"}]})
    }

    fn opus_parameters() -> Value {
        json!({"codecs": [{"mimeType": "audio/opus", "clockRate": 48000, "payloadType": 111}]})
    }

    async fn connected_transport(engine: &LocalEngine, config: &EngineConfig) -> TransportId {
        let params = engine
            .create_transport(&TransportOptions::from(config))
            .await
            .unwrap();
        engine.connect_transport(&params.id, &dtls()).await.unwrap();
        params.id
    }

    #[test]
    fn test_capabilities_list_configured_codecs() {
        let (engine, _events) = LocalEngine::new(EngineConfig::default());
        let caps = engine.capabilities();
        let codecs = caps["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[0]["mimeType"], "audio/opus");
        assert_eq!(codecs[0]["preferredPayloadType"], 100);
        assert_eq!(codecs[1]["preferredPayloadType"], 101);
    }

    #[test]
    fn test_payload_types_never_collide() {
        let mut config = EngineConfig::default();
        let opus = config.media_codecs[0].clone();
        config.media_codecs = vec![opus; MAX_MEDIA_CODECS + 5];
        let (engine, _events) = LocalEngine::new(config);

        let caps = engine.capabilities();
        let mut payload_types: Vec<u64> = caps["codecs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|codec| codec["preferredPayloadType"].as_u64().unwrap())
            .collect();
        assert_eq!(payload_types.len(), MAX_MEDIA_CODECS);
        payload_types.dedup();
        assert_eq!(payload_types.len(), MAX_MEDIA_CODECS);
        assert_eq!(payload_types.last(), Some(&127));
    }

    #[tokio::test]
    async fn test_port_range_is_exhausted_and_released() {
        let config = small_config();
        let (engine, _events) = LocalEngine::new(config.clone());
        let options = TransportOptions::from(&config);

        let first = engine.create_transport(&options).await.unwrap();
        let _second = engine.create_transport(&options).await.unwrap();
        assert_eq!(engine.free_port_count(), 0);
        assert!(matches!(
            engine.create_transport(&options).await,
            Err(EngineError::Rejected(_))
        ));

        engine.close_transport(&first.id).await;
        assert_eq!(engine.free_port_count(), 1);
        assert!(engine.create_transport(&options).await.is_ok());
    }

    #[tokio::test]
    async fn test_transport_params_shape() {
        let mut config = small_config();
        config.announced_ip = Some("192.0.2.1".to_string());
        let (engine, _events) = LocalEngine::new(config.clone());
        let params = engine
            .create_transport(&TransportOptions::from(&config))
            .await
            .unwrap();

        let candidates = params.ice_candidates.as_array().unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0]["protocol"], "udp");
        assert_eq!(candidates[0]["ip"], "192.0.2.1");
        assert_eq!(candidates[1]["tcpType"], "passive");

        let fingerprint = params.dtls_parameters["fingerprints"][0]["value"]
            .as_str()
            .unwrap();
        assert_eq!(fingerprint.split(':').count(), 32);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_dtls() {
        let config = small_config();
        let (engine, _events) = LocalEngine::new(config.clone());
        let params = engine
            .create_transport(&TransportOptions::from(&config))
            .await
            .unwrap();

        let result = engine.connect_transport(&params.id, &json!({"role": "client"})).await;
        assert!(matches!(result, Err(EngineError::Rejected(_))));
        engine.connect_transport(&params.id, &dtls()).await.unwrap();
        assert!(engine.connect_transport(&params.id, &dtls()).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_and_consume() {
        let config = small_config();
        let (engine, _events) = LocalEngine::new(config.clone());
        let send = connected_transport(&engine, &config).await;
        let recv = connected_transport(&engine, &config).await;

        let bad = json!({"codecs": [{"mimeType": "audio/PCMU"}]});
        assert!(engine.produce(&send, MediaKind::Audio, &bad).await.is_err());

        let producer = engine
            .produce(&send, MediaKind::Audio, &opus_parameters())
            .await
            .unwrap();

        let caps = json!({"codecs": [{"mimeType": "audio/OPUS", "kind": "audio"}]});
        let no_audio = json!({"codecs": [{"mimeType": "video/VP8", "kind": "video"}]});
        assert!(engine.can_consume(&producer, &caps));
        assert!(!engine.can_consume(&producer, &no_audio));
        assert!(!engine.can_consume(&ProducerId::from("missing"), &caps));

        let consumer = engine.consume(&recv, &producer, &caps, true).await.unwrap();
        assert_eq!(consumer.kind, MediaKind::Audio);
        assert_eq!(consumer.consumer_type, "simple");
        assert!(!consumer.producer_paused);
        assert_eq!(consumer.rtp_parameters["codecs"][0]["payloadType"], 100);

        assert!(engine.consume(&recv, &producer, &no_audio, true).await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_emits_worker_died() {
        let config = small_config();
        let (engine, mut events) = LocalEngine::new(config.clone());
        engine.terminate("test");
        engine.terminate("again");

        assert_eq!(
            events.recv().await,
            Some(EngineEvent::WorkerDied {
                reason: "test".to_string()
            })
        );
        assert!(events.try_recv().is_err());
        assert_eq!(
            engine.create_transport(&TransportOptions::from(&config)).await,
            Err(EngineError::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_drop_transport_emits_event() {
        let config = small_config();
        let (engine, mut events) = LocalEngine::new(config.clone());
        let id = connected_transport(&engine, &config).await;

        engine.drop_transport(&id);
        assert_eq!(
            events.recv().await,
            Some(EngineEvent::TransportClosed { transport_id: id.clone() })
        );
        engine.drop_transport(&id);
        assert!(events.try_recv().is_err());
    }
}
