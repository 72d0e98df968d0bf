//! Two-party video room client: WebSocket signaling, call arbitration and
//! WebRTC media for a room identified by a short shareable code.
//!
//! The typical flow is to build a [`WebRtcMedia`] stack from a
//! [`RoomConfig`], then [`RoomSession::create_room`] or
//! [`RoomSession::join_room`]. The room creator is offered the call once a
//! counterpart arrives; accepting drives offer/answer negotiation and
//! surfaces remote tracks through [`RoomSession::remote_media`].

mod audio;
mod call;
mod config;
mod error;
mod media;
mod metrics;
mod room;
mod session;
mod signaling;

pub use call::CallStatus;
pub use config::{RoomConfig, SessionContext};
pub use error::{Error, Result};
pub use media::{MediaEvent, MediaPort, VideoFeed, WebRtcMedia};
pub use metrics::ConnectionQuality;
pub use room::{generate_room_id, room_from_link, room_link};
pub use session::{RoomSession, SessionStatus};
pub use signaling::{IceCandidate, SignalingClient, SignalingMessage};
