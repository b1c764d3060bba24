//! Subscriptions to CoValue content.

use std::sync::Weak;

use tokio::sync::mpsc;

use cosync_core::{CoId, CoValueContent};

use crate::error::{NodeError, Result};
use crate::node::{Inner, LocalNode};

/// A live view of one CoValue.
///
/// Yields the current content first, then the new content after every
/// change, including changes to the owning group. Dropping the handle
/// unsubscribes.
pub struct Subscription {
    id: CoId,
    key: u64,
    receiver: mpsc::UnboundedReceiver<CoValueContent>,
    node: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> CoId {
        self.id
    }

    /// The next content. `None` once the node is gone.
    pub async fn next(&mut self) -> Option<CoValueContent> {
        self.receiver.recv().await
    }

    /// The newest content already delivered, skipping older ones.
    pub fn latest(&mut self) -> Option<CoValueContent> {
        let mut latest = None;
        while let Ok(content) = self.receiver.try_recv() {
            latest = Some(content);
        }
        latest
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.node.upgrade() else {
            return;
        };
        let mut state = inner.lock_state();
        if let Some(listeners) = state.subscribers.get_mut(&self.id) {
            listeners.remove(&self.key);
            if listeners.is_empty() {
                state.subscribers.remove(&self.id);
            }
        }
    }
}

impl LocalNode {
    /// Load `id` and follow its content.
    pub async fn subscribe(&self, id: CoId) -> Result<Subscription> {
        self.load(id).await?;
        let (tx, receiver) = mpsc::unbounded_channel();
        let key = {
            // Read and register under one lock so no change falls between.
            let mut state = self.inner.lock_state();
            let current = state
                .content_of(&id, &self.inner.identity)
                .ok_or(NodeError::Unavailable(id))?;
            let key = state.next_subscriber;
            state.next_subscriber += 1;
            let _ = tx.send(current);
            state.subscribers.entry(id).or_default().insert(key, tx);
            key
        };
        Ok(Subscription {
            id,
            key,
            receiver,
            node: std::sync::Arc::downgrade(&self.inner),
        })
    }
}
