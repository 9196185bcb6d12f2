//! Who is in the workspace and what they are editing.
//!
//! The roster is rebuilt from `Hello` on every connection and then kept
//! current from presence and awareness broadcasts. None of it is persisted.

use std::collections::BTreeMap;

use boardsync_proto::live::{AwarenessEntry, Peer};

/// Caret colors, picked per user by [`color_for`].
pub const PALETTE: [&str; 6] = [
    "#ef4444", "#10b981", "#3b82f6", "#f59e0b", "#8b5cf6", "#06b6d4",
];

/// Stable palette color for a user id.
#[must_use]
pub fn color_for(user_id: &str) -> &'static str {
    let hash = user_id
        .encode_utf16()
        .fold(0_i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    let index = usize::try_from(hash.unsigned_abs()).unwrap_or(0) % PALETTE.len();
    PALETTE[index]
}

/// Online users and live awareness entries for one workspace.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    you: Option<Peer>,
    online: BTreeMap<String, Peer>,
    awareness: Vec<AwarenessEntry>,
}

impl Roster {
    /// Replaces everything with the contents of a `Hello`.
    pub fn reset(&mut self, you: Peer, online: Vec<Peer>, awareness: Vec<AwarenessEntry>) {
        self.online = online
            .into_iter()
            .map(|p| (p.user_id.clone(), p))
            .collect();
        self.you = Some(you);
        self.awareness = awareness;
    }

    /// Records a presence join.
    pub fn join(&mut self, peer: Peer) {
        self.online.insert(peer.user_id.clone(), peer);
    }

    /// Records a presence leave. The user's awareness entry goes with them.
    pub fn leave(&mut self, user_id: &str) {
        self.online.remove(user_id);
        self.awareness.retain(|e| e.user_id != user_id);
    }

    /// Replaces the awareness entries.
    pub fn set_awareness(&mut self, entries: Vec<AwarenessEntry>) {
        self.awareness = entries;
    }

    /// Clears everything when the connection drops.
    pub fn clear(&mut self) {
        self.online.clear();
        self.awareness.clear();
    }

    /// The authenticated user of the current session, if connected.
    #[must_use]
    pub const fn you(&self) -> Option<&Peer> {
        self.you.as_ref()
    }

    /// Other online users, ordered by user id.
    pub fn online(&self) -> impl Iterator<Item = &Peer> {
        self.online.values()
    }

    /// Returns `true` if `user_id` is online.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains_key(user_id)
    }

    /// Live awareness entries.
    #[must_use]
    pub fn awareness(&self) -> &[AwarenessEntry] {
        &self.awareness
    }

    /// Users whose caret is in `task_id`, excluding the local user.
    pub fn editors_of<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a AwarenessEntry> {
        let me = self.you.as_ref().map(|p| p.user_id.as_str());
        self.awareness
            .iter()
            .filter(move |e| e.task_id == task_id && Some(e.user_id.as_str()) != me)
    }
}
