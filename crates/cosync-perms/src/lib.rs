//! # cosync permissions
//!
//! Groups, roles and keys for cosync.
//!
//! ## Overview
//!
//! Access control is itself data. A group is a CoValue whose map holds
//! member roles, the current read key and key reveals. Whether a
//! transaction is valid is decided by replaying the group state as of the
//! transaction's `madeAt`, so every replica reaches the same answer.
//!
//! ## Key Concepts
//!
//! - **Role**: `admin`, `writer`, `reader`, `writeOnly`, `revoked` and the
//!   invite roles
//! - **Parent groups**: a child group inherits roles from its parents
//! - **Key reveals**: `<key>_for_<member|everyone|key>` entries that make a
//!   read key available to exactly those who may read
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cosync_perms::{Resolver, valid_transactions};
//!
//! // let resolver = Resolver::new(&loaded_cores);
//! // let valid = valid_transactions(core, core.decoded_transactions(&keys), &resolver);
//! ```

pub mod error;
pub mod group;
pub mod keys;
pub mod ops;
pub mod role;
pub mod validity;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{PermsError, Result};
pub use group::{GroupView, Resolver};
pub use keys::{current_read_key, current_write_key, key_resolver, read_key, sealer_of, Identity};
pub use ops::{
    accept_invite_changes, account_header, add_everyone, add_member, create_group_changes,
    create_invite, extend, group_header, invite_link, owned_header, parse_invite_link,
    remove_member, revoke_extend, rotate_read_key, GroupEdit,
};
pub use role::{GroupEntryKey, ParentRole, RevealTarget, Role};
pub use validity::valid_transactions;
