use thiserror::Error;

/// Crate-wide error taxonomy. Every failure path is expected to leave the
/// session machine in `Idle` with media and peer connection released.
#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for the signaling server handshake")]
    ConnectionTimeout,

    #[error("camera/microphone access denied or unavailable: {0}")]
    MediaAccessDenied(String),

    #[error("negotiation error: {0}")]
    NegotiationError(String),

    #[error("signaling transport is not connected")]
    SignalingUnavailable,

    #[error("peer connection already closed")]
    PeerConnectionClosed,

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("audio device error: {0}")]
    Audio(String),
}

pub type Result<T> = std::result::Result<T, Error>;
