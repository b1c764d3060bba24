//! What we know about one peer.
//!
//! Two known states are tracked per CoValue: `known` is what the peer has
//! told us it holds; `optimistic` additionally counts content we sent and
//! assume it will accept. Outgoing content is computed against the
//! optimistic state so nothing is sent twice. A correction from the peer
//! resets both.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::debug;

use cosync_core::{CoId, ContentMessage, KnownState};

use crate::messages::{PeerId, SyncMessage};

/// How the peer relates to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// The peer serves us: everything we hold is pushed to it, and values we
    /// cannot find locally are loaded from it.
    Server,
    /// The peer is served by us: it receives updates to what it loaded.
    Client,
}

/// Per-peer sync state.
#[derive(Debug)]
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    known: HashMap<CoId, KnownState>,
    optimistic: HashMap<CoId, KnownState>,
    subscribed: HashSet<CoId>,
    pending_loads: HashSet<CoId>,
}

impl PeerState {
    pub fn new(id: PeerId, role: PeerRole, outgoing: mpsc::UnboundedSender<SyncMessage>) -> Self {
        Self {
            id,
            role,
            outgoing,
            known: HashMap::new(),
            optimistic: HashMap::new(),
            subscribed: HashSet::new(),
            pending_loads: HashSet::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Queue a message to the peer. Returns false if the connection is gone.
    pub fn send(&self, message: SyncMessage) -> bool {
        debug!("-> {} {} {}", self.id, message.action(), message.id());
        self.outgoing.send(message).is_ok()
    }

    /// Send content, counting it towards the optimistic state.
    pub fn send_content(&mut self, message: ContentMessage) -> bool {
        self.optimistic
            .entry(message.id)
            .or_default()
            .combine(&message.known_after());
        self.send(SyncMessage::Content(message))
    }

    /// What the peer confirmed it holds.
    pub fn known(&self, id: &CoId) -> Option<&KnownState> {
        self.known.get(id)
    }

    /// What the peer holds once everything we sent arrives.
    pub fn optimistic(&self, id: &CoId) -> Option<&KnownState> {
        self.optimistic.get(id)
    }

    /// Record what the peer told us it holds.
    pub fn set_known(&mut self, id: CoId, known: &KnownState) {
        self.known.entry(id).or_default().combine(known);
        self.optimistic.entry(id).or_default().combine(known);
    }

    /// The peer holds exactly `known`, whatever we assumed before.
    pub fn correct_known(&mut self, id: CoId, known: KnownState) {
        self.known.insert(id, known.clone());
        self.optimistic.insert(id, known);
    }

    /// Whether updates to `id` should be pushed to this peer.
    pub fn wants(&self, id: &CoId) -> bool {
        self.role == PeerRole::Server || self.subscribed.contains(id)
    }

    pub fn subscribe(&mut self, id: CoId) {
        self.subscribed.insert(id);
    }

    pub fn unsubscribe(&mut self, id: &CoId) {
        self.subscribed.remove(id);
    }

    /// Remember that we asked this peer for `id`.
    pub fn start_load(&mut self, id: CoId) {
        self.pending_loads.insert(id);
    }

    /// The peer answered a load for `id`. Returns true if one was pending.
    pub fn finish_load(&mut self, id: &CoId) -> bool {
        self.pending_loads.remove(id)
    }

    pub fn is_loading(&self, id: &CoId) -> bool {
        self.pending_loads.contains(id)
    }

    /// CoValues the peer has told us about.
    pub fn known_ids(&self) -> impl Iterator<Item = &CoId> {
        self.known.keys()
    }
}
