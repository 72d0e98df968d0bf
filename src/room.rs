use rand::Rng;
use url::Url;

const ROOM_ID_LEN: usize = 6;
const ROOM_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ROOM_QUERY_PARAM: &str = "room";

/// 6-character uppercase alphanumeric room token.
pub fn generate_room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
        .collect()
}

/// Opaque participant token, minted when a client session starts. Never
/// persisted; a fresh one is expected on every application start.
pub fn generate_participant_id() -> String {
    format!("user-{}", rand::random::<u32>())
}

/// Shareable link carrying the room id as a query parameter. Joining via
/// the link is equivalent to manual room-id entry.
pub fn room_link(base: &str, room_id: &str) -> Option<String> {
    let mut url = Url::parse(base).ok()?;
    url.query_pairs_mut().append_pair(ROOM_QUERY_PARAM, room_id);
    Some(url.into())
}

/// Extracts the room id from a shared link, if one is present.
pub fn room_from_link(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == ROOM_QUERY_PARAM)
        .map(|(_, v)| v.into_owned())
}

/// Ordered, duplicate-free participant list for a room. Order is join
/// order; the first entry is the arbiter. The arbiter designation is never
/// stored, only derived, so it cannot drift from the membership list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    participants: Vec<String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a participant, preserving join order. Idempotent: returns false
    /// and leaves the list untouched if the id is already present.
    pub fn add(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        self.participants.push(id.to_string());
        true
    }

    /// Removes a participant; tolerates ids that were never added.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != id);
        self.participants.len() != before
    }

    /// Replaces the whole list with a relay-provided membership snapshot,
    /// dropping duplicates while keeping the snapshot's order.
    pub fn replace(&mut self, snapshot: Vec<String>) {
        self.participants.clear();
        for id in snapshot {
            if !self.contains(&id) {
                self.participants.push(id);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.iter().any(|p| p == id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    /// The participant first in join order. Recomputed on every call; never
    /// cached, so a reordered or replaced list immediately changes the
    /// answer.
    pub fn arbiter(&self) -> Option<&str> {
        self.participants.first().map(String::as_str)
    }

    /// First participant that is not `own_id`. Rooms are two-party; any
    /// further entries are ignored.
    pub fn counterpart(&self, own_id: &str) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.as_str() != own_id)
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.participants.iter().map(String::as_str)
    }
}
