//! Incoming message queue.
//!
//! Messages are kept FIFO per peer and pulled round-robin across peers, so
//! a peer with a large backlog cannot starve the others. Processing yields
//! to the runtime whenever a time budget is used up.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::messages::{PeerId, SyncMessage};

/// Per-peer FIFO queues drained round-robin.
#[derive(Debug, Default)]
pub struct IncomingQueue {
    queues: HashMap<PeerId, VecDeque<SyncMessage>>,
    /// Peers in pull order; the next pull starts at the front.
    order: VecDeque<PeerId>,
    len: usize,
}

impl IncomingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, peer: PeerId, message: SyncMessage) {
        let queue = self.queues.entry(peer).or_insert_with(|| {
            self.order.push_back(peer);
            VecDeque::new()
        });
        queue.push_back(message);
        self.len += 1;
    }

    /// The oldest message of the next peer in turn.
    pub fn pull(&mut self) -> Option<(PeerId, SyncMessage)> {
        for _ in 0..self.order.len() {
            let peer = self.order.pop_front()?;
            let message = self.queues.get_mut(&peer).and_then(VecDeque::pop_front);
            self.order.push_back(peer);
            if let Some(message) = message {
                self.len -= 1;
                return Some((peer, message));
            }
        }
        None
    }

    /// Drop everything queued for `peer`.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(queue) = self.queues.remove(peer) {
            self.len -= queue.len();
        }
        self.order.retain(|p| p != peer);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Tracks time spent processing since the last yield.
#[derive(Debug)]
pub struct TimeBudget {
    budget: Duration,
    started: Instant,
}

impl TimeBudget {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: Instant::now(),
        }
    }

    pub fn exceeded(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    /// Yield to the runtime if the budget is used up, then start a new one.
    /// Returns true if it yielded.
    pub async fn checkpoint(&mut self) -> bool {
        if !self.exceeded() {
            return false;
        }
        tokio::task::yield_now().await;
        self.started = Instant::now();
        true
    }
}
