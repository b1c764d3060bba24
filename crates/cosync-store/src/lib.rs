//! # cosync store
//!
//! Persistence for CoValues: headers, session rows, transactions and
//! signature checkpoints, behind a row-level [`DbClient`] with SQLite and
//! in-memory implementations.
//!
//! ## Key Types
//!
//! - [`Storage`] - The async, message-level interface the node uses
//! - [`SyncStorage`] - Runs every call inline
//! - [`AsyncStorage`] - Runs calls on blocking threads, stores serialized
//! - [`SqliteClient`] - SQLite tables
//! - [`MemoryClient`] - The same tables in memory, for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cosync_store::{AsyncStorage, SqliteClient, Storage, StorageConfig};
//!
//! async fn example() {
//!     let client = SqliteClient::open("cosync.db").unwrap();
//!     let storage = AsyncStorage::new(client, StorageConfig::default());
//!     // let messages = storage.load(id).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent stores**: Transactions already held are skipped
//! - **Corrections**: A message that assumes more than storage holds is
//!   answered with what storage does hold, so the caller can send the gap
//! - **Checkpoints**: Loaded sessions are split where signatures were kept,
//!   so every piece verifies on its own

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod storage;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryClient;
pub use sqlite::SqliteClient;
pub use storage::{AsyncStorage, StorageConfig, StorageCore, SyncStorage};
pub use traits::{
    CoValueRow, CorrectionCallback, DbClient, SessionRow, SessionUpdate, SignatureRow, Storage,
    StoreOutcome, TransactionRow,
};
