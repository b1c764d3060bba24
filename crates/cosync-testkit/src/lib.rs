//! # cosync testkit
//!
//! Testing utilities for cosync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: authors writing straight into a `CoValueCore`, and small
//!   networks of nodes joined by in-memory transports
//! - **Generators**: proptest strategies for map and list edit sequences
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use cosync_testkit::generators::map_ops;
//! use cosync_testkit::fixtures::{open_core, content_json, TestAuthor};
//!
//! proptest! {
//!     #[test]
//!     fn last_set_wins(ops in map_ops(20)) {
//!         let author = TestAuthor::new();
//!         let mut core = open_core(CoValueType::Map).unwrap();
//!         for (i, op) in ops.iter().enumerate() {
//!             author.write(&mut core, &[op.to_change()], i as i64 + 1).unwrap();
//!         }
//!         let content = content_json(&core);
//!     }
//! }
//! ```
//!
//! ## Test Networks
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cosync_testkit::fixtures::TestNetwork;
//!
//! # async fn example() -> cosync::Result<()> {
//! let network = TestNetwork::new();
//! let alice = network.account("Alice")?;
//! let bob = network.account("Bob")?;
//! network.settle(&[&alice, &bob], Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{authors, connect, TestAuthor, TestNetwork};
