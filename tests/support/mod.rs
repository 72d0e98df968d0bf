#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;

use rooms_client::{
    Error, IceCandidate, MediaEvent, MediaPort, Result, SessionStatus, SignalingMessage,
};

struct Member {
    id: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

type Rooms = Arc<Mutex<HashMap<String, Vec<Member>>>>;

/// Minimal in-process signaling relay speaking the room wire protocol:
/// join/leave bookkeeping with roster snapshots, and fan-out of
/// negotiation traffic to everyone in the room except the sender.
pub struct LoopbackRelay {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl LoopbackRelay {
    pub async fn start() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, _) = broadcast::channel(1);
        let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));

        let conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(
                    stream,
                    rooms.clone(),
                    conn_shutdown.subscribe(),
                ));
            }
        });

        Self { addr, shutdown }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/webrtc", self.addr)
    }

    /// Closes every live connection, simulating a relay outage.
    pub fn disconnect_all(&self) {
        let _ = self.shutdown.send(());
    }
}

fn routing(msg: &SignalingMessage) -> Option<(&str, &str)> {
    match msg {
        SignalingMessage::Offer { room_id, from, .. }
        | SignalingMessage::Answer { room_id, from, .. }
        | SignalingMessage::IceCandidate { room_id, from, .. }
        | SignalingMessage::CallRejected { room_id, from, .. } => Some((room_id, from)),
        _ => None,
    }
}

async fn serve_connection(stream: TcpStream, rooms: Rooms, mut shutdown: broadcast::Receiver<()>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let json = serde_json::to_string(&msg).unwrap();
                    if write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    let _ = write.close().await;
                    break;
                }
            }
        }
    });

    let mut membership: Option<(String, String)> = None;
    while let Some(Ok(frame)) = read.next().await {
        let Message::Text(text) = frame else { continue };
        let Ok(msg) = serde_json::from_str::<SignalingMessage>(&text) else {
            continue;
        };

        if let Some((room_id, from)) = routing(&msg) {
            let rooms = rooms.lock().await;
            if let Some(members) = rooms.get(room_id) {
                for member in members.iter().filter(|m| m.id != from) {
                    let _ = member.tx.send(msg.clone());
                }
            }
            continue;
        }

        match msg {
            SignalingMessage::JoinRoom {
                room_id,
                participant_id,
            } => {
                let mut rooms = rooms.lock().await;
                let members = rooms.entry(room_id.clone()).or_default();
                for member in members.iter() {
                    let _ = member.tx.send(SignalingMessage::UserConnected {
                        participant_id: participant_id.clone(),
                    });
                }
                members.push(Member {
                    id: participant_id.clone(),
                    tx: tx.clone(),
                });
                let snapshot: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
                for member in members.iter() {
                    let _ = member.tx.send(SignalingMessage::RoomRoster {
                        participants: snapshot.clone(),
                    });
                }
                membership = Some((room_id, participant_id));
            }
            SignalingMessage::LeaveRoom {
                room_id,
                participant_id,
            } => {
                remove_member(&rooms, &room_id, &participant_id).await;
                membership = None;
            }
            _ => {}
        }
    }

    if let Some((room_id, participant_id)) = membership {
        remove_member(&rooms, &room_id, &participant_id).await;
    }
    writer.abort();
}

async fn remove_member(rooms: &Rooms, room_id: &str, participant_id: &str) {
    let mut rooms = rooms.lock().await;
    let Some(members) = rooms.get_mut(room_id) else {
        return;
    };
    members.retain(|m| m.id != participant_id);
    if members.is_empty() {
        rooms.remove(room_id);
        return;
    }
    let snapshot: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
    for member in members.iter() {
        let _ = member.tx.send(SignalingMessage::UserDisconnected {
            participant_id: participant_id.to_string(),
        });
        let _ = member.tx.send(SignalingMessage::RoomRoster {
            participants: snapshot.clone(),
        });
    }
}

/// Media port double for session tests. Negotiation is mimicked without a
/// real peer connection: applying a remote description emits one local
/// candidate, and a remote track surfaces once a description and at least
/// one remote candidate have both arrived.
#[derive(Debug)]
pub struct FakeMedia {
    deny_capture: bool,
    events: Option<mpsc::Sender<MediaEvent<String>>>,
    description_set: bool,
    pending: Vec<IceCandidate>,
    applied: usize,
    track_emitted: bool,
    audio_enabled: bool,
    video_enabled: bool,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self {
            deny_capture: false,
            events: None,
            description_set: false,
            pending: Vec::new(),
            applied: 0,
            track_emitted: false,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    pub fn without_capture_device() -> Self {
        Self {
            deny_capture: true,
            ..Self::new()
        }
    }

    async fn maybe_emit_track(&mut self) {
        if !self.track_emitted && self.description_set && self.applied > 0 {
            if let Some(events) = &self.events {
                let _ = events
                    .send(MediaEvent::RemoteTrack("remote-track".to_string()))
                    .await;
                self.track_emitted = true;
            }
        }
    }
}

#[async_trait]
impl MediaPort for FakeMedia {
    type Remote = String;

    async fn acquire_local_media(&mut self) -> Result<()> {
        if self.deny_capture {
            return Err(Error::MediaAccessDenied("no capture device".to_string()));
        }
        Ok(())
    }

    async fn create_peer_connection(
        &mut self,
        events: mpsc::Sender<MediaEvent<String>>,
    ) -> Result<()> {
        self.events = Some(events);
        self.description_set = false;
        self.pending.clear();
        self.applied = 0;
        self.track_emitted = false;
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<String> {
        if self.events.is_none() {
            return Err(Error::PeerConnectionClosed);
        }
        Ok("offer-sdp".to_string())
    }

    async fn create_answer(&mut self, remote_offer: &str) -> Result<String> {
        self.apply_remote_description(remote_offer).await?;
        Ok("answer-sdp".to_string())
    }

    async fn apply_remote_description(&mut self, _description: &str) -> Result<()> {
        let Some(events) = self.events.clone() else {
            return Err(Error::PeerConnectionClosed);
        };
        self.description_set = true;
        self.applied += self.pending.drain(..).count();
        let _ = events
            .send(MediaEvent::LocalCandidate(IceCandidate {
                candidate: "candidate:1 1 UDP 2122252543 198.51.100.1 4000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }))
            .await;
        self.maybe_emit_track().await;
        Ok(())
    }

    async fn add_remote_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.events.is_none() {
            return Ok(());
        }
        if !self.description_set {
            self.pending.push(candidate);
            return Ok(());
        }
        self.applied += 1;
        self.maybe_emit_track().await;
        Ok(())
    }

    fn toggle_audio(&mut self) -> bool {
        self.audio_enabled = !self.audio_enabled;
        self.audio_enabled
    }

    fn toggle_video(&mut self) -> bool {
        self.video_enabled = !self.video_enabled;
        self.video_enabled
    }

    async fn close_connection(&mut self) {
        self.events = None;
        self.description_set = false;
        self.pending.clear();
        self.applied = 0;
        self.track_emitted = false;
    }

    async fn release(&mut self) {
        self.close_connection().await;
    }
}

/// Waits up to five seconds for the session status to satisfy `predicate`.
pub async fn wait_for_status<F>(rx: &mut watch::Receiver<SessionStatus>, what: &str, predicate: F)
where
    F: Fn(&SessionStatus) -> bool,
{
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if predicate(&rx.borrow()) {
                return true;
            }
            if rx.changed().await.is_err() {
                return predicate(&rx.borrow());
            }
        }
    })
    .await;

    match outcome {
        Ok(true) => {}
        Ok(false) => {
            let last = rx.borrow().clone();
            panic!("session ended before {what}; last status: {last:?}");
        }
        Err(_) => {
            let last = rx.borrow().clone();
            panic!("timed out waiting for {what}; last status: {last:?}");
        }
    }
}
