use std::time::{Duration, SystemTime};

use crate::room::generate_participant_id;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8086/webrtc";

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration for a room session.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// Bounded wait for the signaling handshake; `Error::ConnectionTimeout`
    /// once exceeded.
    pub connect_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RoomConfig {
    pub fn with_signaling_url(url: impl Into<String>) -> Self {
        Self {
            signaling_url: url.into(),
            ..Default::default()
        }
    }
}

/// Client-session state handed to the session explicitly instead of being
/// read out of ad-hoc shared storage. The bearer token, when present, is
/// attached to the signaling handshake as an `Authorization` header. The
/// participant identity is minted once per context and stays stable across
/// every room join made with it; it is never persisted.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub bearer_token: Option<String>,
    pub started_at: Option<SystemTime>,
    pub participant_id: String,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            bearer_token: None,
            started_at: None,
            participant_id: generate_participant_id(),
        }
    }
}

impl SessionContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            started_at: Some(SystemTime::now()),
            ..Self::default()
        }
    }
}
