//! Huddle SFU session orchestration
//!
//! This crate is the control plane of a Selective Forwarding Unit. It decides
//! who is in which room, which transports, producers and consumers exist, and
//! who gets told about what. Moving media packets is left to a media engine
//! behind the [`MediaEngine`] trait.
//!
//! ## Architecture
//!
//! - **`PeerRegistry`**: One record per connected client
//! - **`RoomDirectory`**: Room membership, created on first join
//! - **`CapabilityNegotiator`**: Codec compatibility gate before consuming
//! - **`TransportManager`**: Per-peer send/receive transports and their state machine
//! - **`StreamDirectory`**: Producers, consumers and the close cascades between them
//! - **`SignalHub`**: Per-peer outbound notification channels
//! - **`SessionCoordinator`**: Dispatches signaling requests and runs the disconnect cascade
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_sfu::{EngineConfig, LocalEngine, SessionCoordinator, SfuConfig, TransportOptions};
//!
//! let engine_config = EngineConfig::default();
//! let options = TransportOptions::from(&engine_config);
//! let (engine, events) = LocalEngine::new(engine_config);
//!
//! let coordinator = SessionCoordinator::new(SfuConfig::default(), options, engine);
//! tokio::spawn(Arc::clone(&coordinator).run_engine_events(events));
//!
//! let mut notifications = coordinator.connect_peer("peer-1".into())?;
//! let response = coordinator.handle(&"peer-1".into(), request).await?;
//! ```

mod config;
mod coordinator;
pub mod engine;
mod error;
mod hub;
mod local_engine;
mod negotiator;
mod peer;
pub mod protocol;
mod room;
mod stream;
mod transport;
mod types;

pub use config::{CodecConfig, EngineConfig, SfuConfig};
pub use coordinator::{SessionCoordinator, SessionStats};
pub use engine::{ConsumerParams, EngineEvent, MediaEngine, TransportOptions, TransportParams};
pub use error::{EngineError, Result, SfuError};
pub use hub::{EventSender, SignalHub};
pub use local_engine::LocalEngine;
pub use negotiator::CapabilityNegotiator;
pub use peer::{Peer, PeerRegistry};
pub use protocol::{ClientMessage, RelayKind, ServerEvent, ServerMessage, SignalRequest, SignalResponse};
pub use room::RoomDirectory;
pub use stream::{ConsumerDescriptor, ConsumerInfo, ProducerDescriptor, ProducerInfo, StreamDirectory};
pub use transport::{TransportInfo, TransportManager};
pub use types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportId, TransportRole, TransportState};
