use std::fmt;

use log::debug;

use crate::room::Roster;
use crate::signaling::IceCandidate;

/// Externally observable call lifecycle. `Incoming` is only ever seen by
/// the arbiter; the non-arbiter side goes straight from `Idle` to
/// `Connecting` when the arbiter's offer arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallStatus {
    #[default]
    Idle,
    Incoming,
    Accepted,
    Rejected,
    Connecting,
    Connected,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Idle => write!(f, "idle"),
            CallStatus::Incoming => write!(f, "incoming"),
            CallStatus::Accepted => write!(f, "accepted"),
            CallStatus::Rejected => write!(f, "rejected"),
            CallStatus::Connecting => write!(f, "connecting"),
            CallStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Everything that can happen to a call session, inbound relay traffic and
/// local intents alike. Each event goes through the single transition
/// function; nothing mutates the machine from event callbacks directly.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    PeerJoined(String),
    PeerLeft(String),
    RosterReceived(Vec<String>),
    OfferReceived { from: String, sdp: String },
    AnswerReceived { from: String, sdp: String },
    CandidateReceived { from: String, candidate: IceCandidate },
    CallRejectedBy(String),
    RemoteTrackArrived,
    SignalingLost,
    /// Arbiter accepted the incoming call.
    Accept,
    /// Arbiter declined the incoming call.
    Reject,
    Leave,
    /// Fed back by the engine once the offer was handed to the transport.
    OfferSent,
    /// Fed back by the engine when executing a negotiation command failed.
    NegotiationFailed { reason: String },
}

/// Side effects requested by a transition. The engine executes them in
/// order; the machine itself never touches the network or the media stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create a fresh peer connection, closing any previous one first.
    OpenConnection,
    /// Produce an offer on the current connection and relay it.
    SendOffer,
    /// Apply the remote offer, produce an answer and relay it.
    SendAnswer { offer: String },
    ApplyAnswer { sdp: String },
    ApplyCandidate(IceCandidate),
    SendReject { to: String },
    /// Release the peer connection and clear the remote stream.
    CloseConnection,
    /// Dismissible, user-visible failure message.
    SurfaceError(String),
}

/// Tagged-state call machine for a two-party room. Owns the participant
/// roster; the arbiter is derived from it on every event and never cached.
#[derive(Debug)]
pub struct CallMachine {
    own_id: String,
    roster: Roster,
    status: CallStatus,
}

impl CallMachine {
    pub fn new(own_id: impl Into<String>) -> Self {
        let own_id = own_id.into();
        let mut roster = Roster::new();
        roster.add(&own_id);
        Self {
            own_id,
            roster,
            status: CallStatus::Idle,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn is_arbiter(&self) -> bool {
        self.roster.arbiter() == Some(self.own_id.as_str())
    }

    /// The single transition function. Returns the commands the engine must
    /// execute; `status()` reflects the new state immediately.
    pub fn handle(&mut self, event: CallEvent) -> Vec<Command> {
        match event {
            CallEvent::PeerJoined(id) => {
                if id != self.own_id {
                    self.roster.add(&id);
                }
                self.maybe_ring();
                vec![]
            }
            CallEvent::RosterReceived(snapshot) => {
                self.roster.replace(snapshot);
                // A snapshot sent before the relay processed our own join
                // may not contain us yet.
                self.roster.add(&self.own_id);
                self.maybe_ring();
                vec![]
            }
            CallEvent::PeerLeft(id) => {
                self.roster.remove(&id);
                if self.status == CallStatus::Idle {
                    return vec![];
                }
                // Two-party room: any departure ends the call attempt.
                self.status = CallStatus::Idle;
                vec![Command::CloseConnection]
            }
            CallEvent::OfferReceived { from, sdp } => {
                if from == self.own_id {
                    return vec![];
                }
                self.roster.add(&from);
                self.status = CallStatus::Connecting;
                vec![Command::OpenConnection, Command::SendAnswer { offer: sdp }]
            }
            CallEvent::AnswerReceived { from, sdp } => {
                if from == self.own_id {
                    return vec![];
                }
                // An answer for a connection that is already gone is an
                // expected teardown race, not an error.
                if self.status != CallStatus::Connecting {
                    debug!("answer ignored in status {}", self.status);
                    return vec![];
                }
                vec![Command::ApplyAnswer { sdp }]
            }
            CallEvent::CandidateReceived { from, candidate } => {
                if from == self.own_id {
                    return vec![];
                }
                vec![Command::ApplyCandidate(candidate)]
            }
            CallEvent::Accept => {
                if self.status != CallStatus::Incoming {
                    debug!("accept ignored in status {}", self.status);
                    return vec![];
                }
                self.status = CallStatus::Accepted;
                vec![Command::OpenConnection, Command::SendOffer]
            }
            CallEvent::Reject => {
                if self.status != CallStatus::Incoming {
                    debug!("reject ignored in status {}", self.status);
                    return vec![];
                }
                // Rejected is transient on the arbiter side; the machine
                // settles back to idle so a rejoin can ring again.
                self.status = CallStatus::Idle;
                match self.roster.counterpart(&self.own_id) {
                    Some(to) => vec![Command::SendReject { to: to.to_string() }],
                    None => vec![],
                }
            }
            CallEvent::OfferSent => {
                if self.status == CallStatus::Accepted {
                    self.status = CallStatus::Connecting;
                }
                vec![]
            }
            CallEvent::RemoteTrackArrived => {
                // Tracks surfacing after teardown belong to a dead
                // connection; ignore them.
                if matches!(self.status, CallStatus::Connecting | CallStatus::Connected) {
                    self.status = CallStatus::Connected;
                } else {
                    debug!("remote track ignored in status {}", self.status);
                }
                vec![]
            }
            CallEvent::CallRejectedBy(from) => {
                self.status = CallStatus::Rejected;
                vec![
                    Command::CloseConnection,
                    Command::SurfaceError(format!("call was rejected by {from}")),
                ]
            }
            CallEvent::NegotiationFailed { reason } => {
                self.status = CallStatus::Idle;
                vec![Command::CloseConnection, Command::SurfaceError(reason)]
            }
            CallEvent::SignalingLost => {
                self.roster.clear();
                self.roster.add(&self.own_id);
                self.status = CallStatus::Idle;
                vec![
                    Command::CloseConnection,
                    Command::SurfaceError("signaling connection lost".to_string()),
                ]
            }
            CallEvent::Leave => {
                self.roster.clear();
                self.status = CallStatus::Idle;
                vec![Command::CloseConnection]
            }
        }
    }

    /// Surfaces `Incoming` to the arbiter when a counterpart is present and
    /// no call is already in flight. Non-arbiters never ring; they wait for
    /// the arbiter's offer.
    fn maybe_ring(&mut self) {
        if self.status == CallStatus::Idle
            && self.is_arbiter()
            && self.roster.counterpart(&self.own_id).is_some()
        {
            self.status = CallStatus::Incoming;
        }
    }
}
