use std::collections::VecDeque;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::call::{CallEvent, CallMachine, CallStatus, Command};
use crate::config::{RoomConfig, SessionContext};
use crate::error::{Error, Result};
use crate::media::{MediaEvent, MediaPort};
use crate::room::{generate_room_id, room_from_link, room_link};
use crate::signaling::{SignalingClient, SignalingMessage};

const MEDIA_CHANNEL_CAPACITY: usize = 64;
const INTENT_CHANNEL_CAPACITY: usize = 16;

/// Snapshot of everything the presentation layer renders: call state,
/// room membership in join order, and the latest dismissible error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub call: CallStatus,
    pub participants: Vec<String>,
    pub last_error: Option<String>,
}

/// Local user actions, sent into the engine loop.
enum Intent {
    Accept,
    Reject,
    ToggleAudio(oneshot::Sender<bool>),
    ToggleVideo(oneshot::Sender<bool>),
    DismissError,
    Leave(oneshot::Sender<()>),
}

/// Handle to a joined room. Owns nothing but channels; the engine task
/// holds the signaling client and the media stack, and ends when the
/// session leaves or the signaling transport drops.
#[derive(Debug)]
pub struct RoomSession<M: MediaPort> {
    room_id: String,
    participant_id: String,
    intents: mpsc::Sender<Intent>,
    status: watch::Receiver<SessionStatus>,
    remote: watch::Receiver<Vec<M::Remote>>,
}

impl<M: MediaPort> RoomSession<M> {
    /// Creates a room with a fresh id and joins it as its first
    /// participant, making this session the room creator.
    pub async fn create_room(
        config: &RoomConfig,
        ctx: &SessionContext,
        media: M,
    ) -> Result<Self> {
        Self::join_room(config, ctx, media, generate_room_id()).await
    }

    /// Joins an existing room. Local media is acquired before signaling is
    /// touched: a user who cannot capture never appears in the room.
    pub async fn join_room(
        config: &RoomConfig,
        ctx: &SessionContext,
        mut media: M,
        room_id: String,
    ) -> Result<Self> {
        media.acquire_local_media().await?;

        // The identity lives in the context, so rejoining with the same
        // context keeps the same participant id.
        let participant_id = ctx.participant_id.clone();
        let mut signaling = SignalingClient::connect(config, ctx).await?;
        signaling.join_room(&room_id, &participant_id).await?;

        let machine = CallMachine::new(&participant_id);
        let (status_tx, status) = watch::channel(SessionStatus {
            call: machine.status(),
            participants: machine.roster().iter().map(str::to_string).collect(),
            last_error: None,
        });
        let (remote_tx, remote) = watch::channel(Vec::new());
        let (intents_tx, intents_rx) = mpsc::channel(INTENT_CHANNEL_CAPACITY);
        let (media_tx, media_rx) = mpsc::channel(MEDIA_CHANNEL_CAPACITY);

        let engine = Engine {
            signaling,
            media,
            machine,
            room_id: room_id.clone(),
            participant_id: participant_id.clone(),
            status: status_tx,
            remote: remote_tx,
            media_events: media_tx,
        };
        tokio::spawn(engine.run(intents_rx, media_rx));

        Ok(Self {
            room_id,
            participant_id,
            intents: intents_tx,
            status,
            remote,
        })
    }

    /// Joins via a shared link; equivalent to manual room-id entry.
    pub async fn join_link(
        config: &RoomConfig,
        ctx: &SessionContext,
        media: M,
        link: &str,
    ) -> Result<Self> {
        let room_id = room_from_link(link)
            .ok_or_else(|| Error::Signaling(format!("link carries no room id: {link}")))?;
        Self::join_room(config, ctx, media, room_id).await
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Shareable invitation link for this room.
    pub fn share_link(&self, base: &str) -> Option<String> {
        room_link(base, &self.room_id)
    }

    /// Observable session state. `changed()` on the receiver wakes the
    /// caller on every status transition.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Remote media handles, cleared whenever the call ends.
    pub fn remote_media(&self) -> watch::Receiver<Vec<M::Remote>> {
        self.remote.clone()
    }

    pub async fn accept_call(&self) -> Result<()> {
        self.intent(Intent::Accept).await
    }

    pub async fn reject_call(&self) -> Result<()> {
        self.intent(Intent::Reject).await
    }

    /// Flips the microphone gate; returns the new enabled state.
    pub async fn toggle_audio(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.intent(Intent::ToggleAudio(tx)).await?;
        rx.await.map_err(|_| Error::SignalingUnavailable)
    }

    /// Flips the camera gate; returns the new enabled state.
    pub async fn toggle_video(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.intent(Intent::ToggleVideo(tx)).await?;
        rx.await.map_err(|_| Error::SignalingUnavailable)
    }

    pub async fn dismiss_error(&self) -> Result<()> {
        self.intent(Intent::DismissError).await
    }

    /// Leaves the room and waits until local media is released. Safe to
    /// call after the engine has already shut down.
    pub async fn leave(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.intents.send(Intent::Leave(tx)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn intent(&self, intent: Intent) -> Result<()> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| Error::SignalingUnavailable)
    }
}

/// Event loop owning signaling, media and the call machine. Every source
/// of change flows through `CallMachine::handle`; this loop only executes
/// the commands it returns and republishes the status.
struct Engine<M: MediaPort> {
    signaling: SignalingClient,
    media: M,
    machine: CallMachine,
    room_id: String,
    participant_id: String,
    status: watch::Sender<SessionStatus>,
    remote: watch::Sender<Vec<M::Remote>>,
    media_events: mpsc::Sender<MediaEvent<M::Remote>>,
}

impl<M: MediaPort> Engine<M> {
    async fn run(
        mut self,
        mut intents: mpsc::Receiver<Intent>,
        mut media_rx: mpsc::Receiver<MediaEvent<M::Remote>>,
    ) {
        loop {
            tokio::select! {
                signal = self.signaling.recv() => {
                    let Some(signal) = signal else { break };
                    let lost = signal == SignalingMessage::ConnectionLost;
                    if let Some(event) = self.map_signal(signal) {
                        self.dispatch(event).await;
                    }
                    if lost {
                        break;
                    }
                }
                media_event = media_rx.recv() => {
                    // The engine holds a sender clone; recv cannot return None.
                    let Some(media_event) = media_event else { break };
                    match media_event {
                        MediaEvent::LocalCandidate(candidate) => {
                            if let Err(e) = self
                                .signaling
                                .send_ice_candidate(candidate, &self.room_id, &self.participant_id)
                                .await
                            {
                                warn!("failed to relay local candidate: {e}");
                            }
                        }
                        MediaEvent::RemoteTrack(track) => {
                            self.remote.send_modify(|tracks| tracks.push(track));
                            self.dispatch(CallEvent::RemoteTrackArrived).await;
                        }
                    }
                }
                intent = intents.recv() => {
                    match intent {
                        Some(Intent::Accept) => self.dispatch(CallEvent::Accept).await,
                        Some(Intent::Reject) => self.dispatch(CallEvent::Reject).await,
                        Some(Intent::ToggleAudio(ack)) => {
                            let _ = ack.send(self.media.toggle_audio());
                        }
                        Some(Intent::ToggleVideo(ack)) => {
                            let _ = ack.send(self.media.toggle_video());
                        }
                        Some(Intent::DismissError) => {
                            self.status.send_modify(|s| s.last_error = None);
                        }
                        Some(Intent::Leave(ack)) => {
                            self.shutdown().await;
                            let _ = ack.send(());
                            return;
                        }
                        // All handles dropped; tear down as if leaving.
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
            }
        }

        self.media.release().await;
        self.remote.send_replace(Vec::new());
    }

    async fn shutdown(&mut self) {
        self.dispatch(CallEvent::Leave).await;
        if let Err(e) = self.signaling.leave_room().await {
            debug!("leave announcement not delivered: {e}");
        }
        self.media.release().await;
        self.remote.send_replace(Vec::new());
    }

    fn map_signal(&self, signal: SignalingMessage) -> Option<CallEvent> {
        match signal {
            SignalingMessage::UserConnected { participant_id } => {
                Some(CallEvent::PeerJoined(participant_id))
            }
            SignalingMessage::UserDisconnected { participant_id } => {
                Some(CallEvent::PeerLeft(participant_id))
            }
            SignalingMessage::RoomRoster { participants } => {
                Some(CallEvent::RosterReceived(participants))
            }
            SignalingMessage::Offer { sdp, from, .. } => {
                Some(CallEvent::OfferReceived { from, sdp })
            }
            SignalingMessage::Answer { sdp, from, .. } => {
                Some(CallEvent::AnswerReceived { from, sdp })
            }
            SignalingMessage::IceCandidate {
                from, candidate, ..
            } => Some(CallEvent::CandidateReceived { from, candidate }),
            SignalingMessage::CallRejected { from, to, .. } => {
                // The relay fans out to the whole room; only the addressee
                // reacts.
                (to == self.participant_id).then_some(CallEvent::CallRejectedBy(from))
            }
            SignalingMessage::ConnectionLost => Some(CallEvent::SignalingLost),
            SignalingMessage::JoinRoom { .. } | SignalingMessage::LeaveRoom { .. } => None,
        }
    }

    /// Runs one event through the machine, executes the resulting commands
    /// and feeds any follow-up events back through, then republishes the
    /// status once the queue drains.
    async fn dispatch(&mut self, event: CallEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for command in self.machine.handle(event) {
                if let Some(feedback) = self.execute(command).await {
                    // A failed command invalidates the rest of its batch;
                    // the feedback event decides what happens next.
                    let failed = matches!(feedback, CallEvent::NegotiationFailed { .. });
                    queue.push_back(feedback);
                    if failed {
                        break;
                    }
                }
            }
        }
        self.publish_status();
    }

    async fn execute(&mut self, command: Command) -> Option<CallEvent> {
        match command {
            Command::OpenConnection => {
                match self
                    .media
                    .create_peer_connection(self.media_events.clone())
                    .await
                {
                    Ok(()) => None,
                    Err(e) => Some(CallEvent::NegotiationFailed {
                        reason: e.to_string(),
                    }),
                }
            }
            Command::SendOffer => match self.media.create_offer().await {
                Ok(sdp) => match self
                    .signaling
                    .send_offer(sdp, &self.room_id, &self.participant_id)
                    .await
                {
                    Ok(()) => Some(CallEvent::OfferSent),
                    Err(e) => Some(CallEvent::NegotiationFailed {
                        reason: e.to_string(),
                    }),
                },
                Err(e) => Some(CallEvent::NegotiationFailed {
                    reason: e.to_string(),
                }),
            },
            Command::SendAnswer { offer } => match self.media.create_answer(&offer).await {
                Ok(sdp) => match self
                    .signaling
                    .send_answer(sdp, &self.room_id, &self.participant_id)
                    .await
                {
                    Ok(()) => None,
                    Err(e) => Some(CallEvent::NegotiationFailed {
                        reason: e.to_string(),
                    }),
                },
                Err(e) => Some(CallEvent::NegotiationFailed {
                    reason: e.to_string(),
                }),
            },
            Command::ApplyAnswer { sdp } => match self.media.apply_remote_description(&sdp).await {
                Ok(()) => None,
                Err(e) => Some(CallEvent::NegotiationFailed {
                    reason: e.to_string(),
                }),
            },
            Command::ApplyCandidate(candidate) => {
                if let Err(e) = self.media.add_remote_ice_candidate(candidate).await {
                    warn!("remote candidate not applied: {e}");
                }
                None
            }
            Command::SendReject { to } => {
                if let Err(e) = self
                    .signaling
                    .send_call_rejected(&to, &self.room_id, &self.participant_id)
                    .await
                {
                    warn!("rejection notice not delivered: {e}");
                }
                None
            }
            Command::CloseConnection => {
                // Capture stays live across call attempts; only leave
                // releases it.
                self.media.close_connection().await;
                self.remote.send_replace(Vec::new());
                None
            }
            Command::SurfaceError(message) => {
                self.status.send_modify(|s| s.last_error = Some(message));
                None
            }
        }
    }

    fn publish_status(&self) {
        let call = self.machine.status();
        let participants: Vec<String> =
            self.machine.roster().iter().map(str::to_string).collect();
        self.status.send_if_modified(|s| {
            if s.call == call && s.participants == participants {
                return false;
            }
            s.call = call;
            s.participants = participants;
            true
        });
    }
}
