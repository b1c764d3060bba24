//! Transport abstraction for the sync protocol.
//!
//! A transport is one duplex connection to one peer. Implementations may
//! use WebSockets, pipes or anything else that moves whole messages.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::messages::SyncMessage;

/// One connection to a peer.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to the peer.
    async fn send(&self, message: SyncMessage) -> Result<()>;

    /// Receive the next message.
    ///
    /// Blocks until a message arrives. Fails with
    /// [`SyncError::TransportError`](crate::SyncError::TransportError) once
    /// the connection is closed; a message that does not decode fails with
    /// [`SyncError::InvalidMessage`](crate::SyncError::InvalidMessage) and
    /// the connection stays usable.
    async fn recv(&self) -> Result<SyncMessage>;

    /// Receive with timeout.
    ///
    /// Returns None if timeout expires before a message arrives.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<SyncMessage>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Close our sending side. The peer's `recv` fails once it has drained
    /// what was already sent.
    async fn close(&self);
}

/// In-memory connections for testing.
///
/// Messages cross the channel as JSON text, so the wire encoding is
/// exercised on every hop.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use tokio::sync::{mpsc, Mutex};
    use tracing::debug;

    /// One end of an in-memory connection.
    pub struct MemoryTransport {
        sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
        receiver: Mutex<mpsc::UnboundedReceiver<String>>,
    }

    impl MemoryTransport {
        /// Two connected ends.
        pub fn pair() -> (MemoryTransport, MemoryTransport) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            (
                MemoryTransport {
                    sender: Mutex::new(Some(a_tx)),
                    receiver: Mutex::new(b_rx),
                },
                MemoryTransport {
                    sender: Mutex::new(Some(b_tx)),
                    receiver: Mutex::new(a_rx),
                },
            )
        }

        /// Send raw text, bypassing encoding.
        pub async fn send_text(&self, text: String) -> Result<()> {
            let sender = self.sender.lock().await;
            sender
                .as_ref()
                .ok_or_else(|| SyncError::TransportError("connection closed".into()))?
                .send(text)
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, message: SyncMessage) -> Result<()> {
            self.send_text(message.to_json()?).await
        }

        async fn recv(&self) -> Result<SyncMessage> {
            let mut rx = self.receiver.lock().await;
            match rx.recv().await {
                Some(text) => Ok(SyncMessage::from_json(&text)?),
                None => Err(SyncError::TransportError("channel closed".into())),
            }
        }

        async fn close(&self) {
            if self.sender.lock().await.take().is_some() {
                debug!("Closed memory transport");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryTransport;
    use super::*;
    use crate::error::SyncError;
    use crate::messages::KnownMessage;
    use cosync_core::{CoId, KnownState};

    fn load() -> SyncMessage {
        SyncMessage::Load(KnownMessage::new(CoId([9; 32]), KnownState::empty()))
    }

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let (a, b) = MemoryTransport::pair();

        a.send(load()).await.unwrap();
        b.send(SyncMessage::Done { id: CoId([9; 32]) }).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), load());
        assert_eq!(
            a.recv().await.unwrap(),
            SyncMessage::Done { id: CoId([9; 32]) }
        );
    }

    #[tokio::test]
    async fn test_recv_timeout_returns_none() {
        let (_a, b) = MemoryTransport::pair();
        let got = b
            .recv_timeout(std::time::Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_peer_after_drain() {
        let (a, b) = MemoryTransport::pair();
        a.send(load()).await.unwrap();
        a.close().await;

        assert_eq!(b.recv().await.unwrap(), load());
        assert!(matches!(
            b.recv().await,
            Err(SyncError::TransportError(_))
        ));
        assert!(a.send(load()).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_is_invalid_message() {
        let (a, b) = MemoryTransport::pair();
        a.send_text("{\"action\":\"nope\"}".into()).await.unwrap();
        a.send(load()).await.unwrap();

        assert!(matches!(b.recv().await, Err(SyncError::InvalidMessage(_))));
        assert_eq!(b.recv().await.unwrap(), load());
    }
}
