//! Common types used throughout the SFU implementation

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a connected peer, assigned when its signaling channel opens
    PeerId
);
string_id!(
    /// Caller-supplied room name
    RoomId
);
string_id!(
    /// Transport identifier assigned by the media engine
    TransportId
);
string_id!(
    /// Producer identifier assigned by the media engine
    ProducerId
);
string_id!(
    /// Consumer identifier assigned by the media engine
    ConsumerId
);

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    /// Carries media published by the peer
    #[serde(alias = "producer")]
    Send,
    /// Carries media delivered to the peer
    #[serde(alias = "consumer")]
    Receive,
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("receive"),
        }
    }
}

/// Connection state of a transport.
///
/// `New -> Connecting -> Connected -> Closed`, with `New`/`Connecting` also
/// allowed to short-circuit to `Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Closed,
}

impl TransportState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::New | Self::Connecting | Self::Connected, Self::Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_state_machine() {
        use TransportState::*;

        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
        assert!(New.can_transition_to(Closed));

        assert!(!New.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(New));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_role_aliases() {
        let role: TransportRole = serde_json::from_str("\"producer\"").unwrap();
        assert_eq!(role, TransportRole::Send);
        let role: TransportRole = serde_json::from_str("\"receive\"").unwrap();
        assert_eq!(role, TransportRole::Receive);
        assert_eq!(serde_json::to_string(&TransportRole::Send).unwrap(), "\"send\"");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = PeerId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        assert_eq!(id.to_string(), "abc");
    }
}
