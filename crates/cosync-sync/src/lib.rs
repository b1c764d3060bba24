//! # cosync sync
//!
//! The peer protocol: four messages that let two parties converge on the
//! content of any CoValue with little redundant transfer.
//!
//! ## Key Properties
//!
//! - **Idempotent**: Re-delivered content is trimmed to what is new
//! - **Commutative**: Merging is order-independent, so peers need no
//!   global ordering
//! - **Self-correcting**: Content that assumes more than the receiver holds
//!   is answered with a correction carrying the receiver's real state
//! - **Fair**: Incoming messages are drained round-robin per peer, in
//!   bounded time slices
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cosync_sync::{MemoryTransport, SyncMessage, KnownMessage, Transport};
//! use cosync_core::{CoId, KnownState};
//!
//! async fn example(id: CoId) {
//!     let (ours, theirs) = MemoryTransport::pair();
//!     ours.send(SyncMessage::Load(KnownMessage::new(id, KnownState::empty())))
//!         .await
//!         .unwrap();
//!     let _request = theirs.recv().await.unwrap();
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- load (A's known) ------->|
//!   |<------- known (B's known) -------|
//!   |<------- content (A is missing) --|
//!   |-------- known (A's new known) -->|
//!   |                                  |
//!   |-------- content (gap) ---------->|
//!   |<------- known (isCorrection) ----|
//!   |-------- content (from B's known)>|
//! ```

pub mod error;
pub mod messages;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use error::{Result, SyncError};
pub use messages::{KnownMessage, PeerId, SyncMessage};
pub use peer::{PeerRole, PeerState};
pub use protocol::{apply_content, content_for, split_content, ApplyReport, SyncConfig};
pub use queue::{IncomingQueue, TimeBudget};
pub use transport::{memory::MemoryTransport, Transport};
