//! SFU Configuration

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Session layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Upper bound for every media engine call, in milliseconds
    pub engine_timeout_ms: u64,
}

impl SfuConfig {
    #[must_use]
    pub const fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 50,
            engine_timeout_ms: 10_000,
        }
    }
}

/// Dynamic RTP payload types handed to configured codecs, in order
const FIRST_PAYLOAD_TYPE: u8 = 100;
const LAST_PAYLOAD_TYPE: u8 = 127;

/// Most codecs the engine can number without reusing a payload type
pub const MAX_MEDIA_CODECS: usize = (LAST_PAYLOAD_TYPE - FIRST_PAYLOAD_TYPE + 1) as usize;

/// Payload type of the codec at `index` in the configured list
pub(crate) fn payload_type(index: usize) -> Option<u8> {
    u8::try_from(index)
        .ok()
        .and_then(|offset| FIRST_PAYLOAD_TYPE.checked_add(offset))
        .filter(|pt| *pt <= LAST_PAYLOAD_TYPE)
}

/// A codec the router is configured to accept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodecConfig {
    pub kind: crate::MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// Media engine configuration: network settings for transports and the codec set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local address transports bind to
    pub listen_ip: String,
    /// Public address advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub media_codecs: Vec<CodecConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut vp8_params = Map::new();
        vp8_params.insert("x-google-start-bitrate".to_string(), json!(1000));

        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            rtc_min_port: 2000,
            rtc_max_port: 2020,
            initial_available_outgoing_bitrate: 1_000_000,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            media_codecs: vec![
                CodecConfig {
                    kind: crate::MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: Map::new(),
                },
                CodecConfig {
                    kind: crate::MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                    parameters: vp8_params,
                },
            ],
        }
    }
}

impl EngineConfig {
    /// Address advertised to clients
    #[must_use]
    pub fn public_ip(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.listen_ip)
    }

    /// Collect configuration problems; empty when valid
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "engine.rtc_min_port ({}) is greater than engine.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if !self.enable_udp && !self.enable_tcp {
            errors.push("engine: at least one of enable_udp/enable_tcp must be set".to_string());
        }
        if self.media_codecs.is_empty() {
            errors.push("engine.media_codecs must not be empty".to_string());
        }
        if self.media_codecs.len() > MAX_MEDIA_CODECS {
            errors.push(format!(
                "engine.media_codecs lists {} codecs, at most {MAX_MEDIA_CODECS} fit the dynamic payload range",
                self.media_codecs.len()
            ));
        }
        for codec in &self.media_codecs {
            let expected_prefix = format!("{}/", codec.kind);
            if !codec.mime_type.to_lowercase().starts_with(&expected_prefix) {
                errors.push(format!(
                    "engine.media_codecs: {} does not match kind {}",
                    codec.mime_type, codec.kind
                ));
            }
        }
        errors
    }
}
