use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::{RoomConfig, SessionContext};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 64;

/// A candidate as it travels over the signaling channel. Kept free of
/// `webrtc` types so the wire format and the tests do not depend on the
/// media stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Room-scoped wire events relayed between the two participants.
///
/// `ConnectionLost` never crosses the wire; the read pump synthesizes it
/// when the transport drops so the caller sees transport loss in the same
/// stream as relay traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    JoinRoom {
        room_id: String,
        participant_id: String,
    },
    LeaveRoom {
        room_id: String,
        participant_id: String,
    },
    UserConnected {
        participant_id: String,
    },
    UserDisconnected {
        participant_id: String,
    },
    /// Authoritative membership snapshot in join order, sent by the relay
    /// whenever the room's membership changes.
    RoomRoster {
        participants: Vec<String>,
    },
    Offer {
        room_id: String,
        sdp: String,
        from: String,
    },
    Answer {
        room_id: String,
        sdp: String,
        from: String,
    },
    IceCandidate {
        room_id: String,
        from: String,
        #[serde(flatten)]
        candidate: IceCandidate,
    },
    CallRejected {
        room_id: String,
        from: String,
        to: String,
    },
    ConnectionLost,
}

/// WebSocket client for the signaling relay. Messages are serialized as
/// JSON text frames; an outgoing and an incoming pump task decouple the
/// caller from the socket. No reconnection is attempted here: once the
/// transport drops, the caller tears the session down and may rejoin.
#[derive(Debug)]
pub struct SignalingClient {
    out: mpsc::Sender<SignalingMessage>,
    events: mpsc::Receiver<SignalingMessage>,
    connected: Arc<AtomicBool>,
    joined: Option<(String, String)>,
}

impl SignalingClient {
    /// Opens a connection to the signaling endpoint. Resolves only after
    /// the WebSocket handshake completes; fails with `ConnectionTimeout`
    /// after `config.connect_timeout`.
    pub async fn connect(config: &RoomConfig, ctx: &SessionContext) -> Result<Self> {
        let mut request = config.signaling_url.as_str().into_client_request()?;
        if let Some(token) = &ctx.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Signaling(format!("invalid bearer token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;

        Ok(Self::from_stream(ws))
    }

    fn from_stream<S>(ws: S) -> Self
    where
        S: Stream<Item = tungstenite::Result<Message>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (mut write, mut read) = ws.split();
        let (event_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let (out, mut out_rx) = mpsc::channel::<SignalingMessage>(CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        let write_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("dropping unserializable signaling message: {e}"),
                }
            }
            write_connected.store(false, Ordering::SeqCst);
            let _ = write.close().await;
        });

        let read_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("signaling read failed: {e}");
                        break;
                    }
                };
                let Message::Text(text) = frame else { continue };
                match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(msg) => {
                        if event_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!("discarding unparseable signaling frame: {e}"),
                }
            }
            // Flag flips before the event is queued so that a send attempted
            // after observing ConnectionLost deterministically fails.
            read_connected.store(false, Ordering::SeqCst);
            let _ = event_tx.send(SignalingMessage::ConnectionLost).await;
        });

        Self {
            out,
            events,
            connected,
            joined: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Next inbound relay event. `None` only after `ConnectionLost` has
    /// been delivered and the pump has shut down.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.events.recv().await
    }

    pub async fn join_room(&mut self, room_id: &str, participant_id: &str) -> Result<()> {
        self.send(SignalingMessage::JoinRoom {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
        })
        .await?;
        self.joined = Some((room_id.to_string(), participant_id.to_string()));
        Ok(())
    }

    /// Announces departure. Idempotent: a no-op when not currently joined.
    pub async fn leave_room(&mut self) -> Result<()> {
        let Some((room_id, participant_id)) = self.joined.take() else {
            return Ok(());
        };
        self.send(SignalingMessage::LeaveRoom {
            room_id,
            participant_id,
        })
        .await
    }

    pub async fn send_offer(&self, sdp: String, room_id: &str, from: &str) -> Result<()> {
        self.send(SignalingMessage::Offer {
            room_id: room_id.to_string(),
            sdp,
            from: from.to_string(),
        })
        .await
    }

    pub async fn send_answer(&self, sdp: String, room_id: &str, from: &str) -> Result<()> {
        self.send(SignalingMessage::Answer {
            room_id: room_id.to_string(),
            sdp,
            from: from.to_string(),
        })
        .await
    }

    pub async fn send_ice_candidate(
        &self,
        candidate: IceCandidate,
        room_id: &str,
        from: &str,
    ) -> Result<()> {
        self.send(SignalingMessage::IceCandidate {
            room_id: room_id.to_string(),
            from: from.to_string(),
            candidate,
        })
        .await
    }

    pub async fn send_call_rejected(&self, to: &str, room_id: &str, from: &str) -> Result<()> {
        self.send(SignalingMessage::CallRejected {
            room_id: room_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
    }

    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SignalingUnavailable);
        }
        self.out
            .send(msg)
            .await
            .map_err(|_| Error::SignalingUnavailable)
    }
}
