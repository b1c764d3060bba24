//! Finding the secrets that open a group's private transactions.
//!
//! A key `k` is revealed through group entries:
//!
//! - `k_for_<actor>`: sealed to the member's sealer
//! - `k_for_everyone`: the key in plain text
//! - `k_for_<other key>`: encrypted with another key of this group or one
//!   of its parents (old read keys, child keys)

use serde_json::Value;
use tracing::{debug, warn};

use cosync_core::{
    ActorId, AgentSecret, CoValueLookup, KeyId, KeySecret, Ruleset, SealerPublic,
};

use crate::group::{GroupView, Resolver};
use crate::role::{GroupEntryKey, ParentRole, RevealTarget, Role};

const MAX_KEY_DEPTH: usize = 16;

/// Who we are when reading and writing: our agent secret and the actor
/// (account or bare agent) our sessions belong to.
#[derive(Debug, Clone)]
pub struct Identity {
    pub agent: AgentSecret,
    pub actor: ActorId,
}

impl Identity {
    pub fn new(agent: AgentSecret, actor: ActorId) -> Self {
        Self { agent, actor }
    }

    /// An identity acting as the bare agent.
    pub fn agent(agent: AgentSecret) -> Self {
        let actor = ActorId::Agent(agent.id());
        Self { agent, actor }
    }

    /// Actors whose sealed entries we can open.
    fn actors(&self) -> [ActorId; 2] {
        [self.actor, ActorId::Agent(self.agent.id())]
    }
}

/// The sealer keys are sealed to for `actor`.
///
/// Agents carry their sealer; accounts use their agent's, which needs the
/// account to be loaded.
pub fn sealer_of(actor: &ActorId, lookup: &dyn CoValueLookup) -> Option<SealerPublic> {
    match actor {
        ActorId::Agent(agent) => Some(agent.sealer()),
        ActorId::Account(account) => {
            let core = lookup.get_core(account)?;
            if !core.header().is_account() {
                return None;
            }
            match core.header().ruleset {
                Ruleset::Group {
                    initial_admin: ActorId::Agent(agent),
                } => Some(agent.sealer()),
                _ => None,
            }
        }
    }
}

/// Recover secret `key_id` of `group`, if any entry reveals it to us.
pub fn read_key(
    group: &GroupView,
    key_id: &KeyId,
    identity: &Identity,
    resolver: &Resolver<'_>,
) -> Option<KeySecret> {
    read_key_depth(group, key_id, identity, resolver, 0)
}

fn read_key_depth(
    group: &GroupView,
    key_id: &KeyId,
    identity: &Identity,
    resolver: &Resolver<'_>,
    depth: usize,
) -> Option<KeySecret> {
    if depth > MAX_KEY_DEPTH {
        debug!("Key chain too deep for {} in {}", key_id, group.id());
        return None;
    }

    for actor in identity.actors() {
        let entry = GroupEntryKey::KeyReveal {
            key: *key_id,
            target: RevealTarget::Member(actor),
        };
        let Some(sealed) = group.entry(&entry).and_then(Value::as_str) else {
            continue;
        };
        match KeySecret::unseal(sealed, identity.agent.sealer()) {
            Ok(secret) if secret.id() == *key_id => return Some(secret),
            Ok(_) => warn!("Sealed key for {} in {} has the wrong id", key_id, group.id()),
            Err(e) => debug!("Cannot unseal {} in {}: {}", key_id, group.id(), e),
        }
    }

    let everyone = GroupEntryKey::KeyReveal {
        key: *key_id,
        target: RevealTarget::Everyone,
    };
    if let Some(text) = group.entry(&everyone).and_then(Value::as_str) {
        match text.parse::<KeySecret>() {
            Ok(secret) if secret.id() == *key_id => return Some(secret),
            _ => warn!("Malformed public key reveal for {} in {}", key_id, group.id()),
        }
    }

    for (entry, value) in group.map().entries() {
        let GroupEntryKey::KeyReveal {
            key,
            target: RevealTarget::Key(other),
        } = GroupEntryKey::parse(entry)
        else {
            continue;
        };
        if key != *key_id {
            continue;
        }
        let Some(encrypted) = value.as_str() else {
            continue;
        };
        let Some(other_secret) = key_in_group_or_parents(group, &other, identity, resolver, depth + 1)
        else {
            continue;
        };
        match other_secret.decrypt_key(encrypted) {
            Ok(secret) if secret.id() == *key_id => return Some(secret),
            Ok(_) => warn!("Key {} decrypted to the wrong id in {}", key_id, group.id()),
            Err(e) => debug!("Cannot decrypt {} with {}: {}", key_id, other, e),
        }
    }

    None
}

fn key_in_group_or_parents(
    group: &GroupView,
    key_id: &KeyId,
    identity: &Identity,
    resolver: &Resolver<'_>,
    depth: usize,
) -> Option<KeySecret> {
    if let Some(secret) = read_key_depth(group, key_id, identity, resolver, depth) {
        return Some(secret);
    }
    group
        .parents_at(None)
        .into_iter()
        .filter(|(_, link)| *link != ParentRole::Revoked)
        .filter_map(|(parent, _)| resolver.group(&parent))
        .find_map(|parent| read_key_depth(&parent, key_id, identity, resolver, depth))
}

/// The group's current read key, if we can open it.
pub fn current_read_key(
    group: &GroupView,
    identity: &Identity,
    resolver: &Resolver<'_>,
) -> Option<KeySecret> {
    read_key(group, &group.read_key_id()?, identity, resolver)
}

/// The key our private writes to values owned by `group` use.
///
/// Write-only members have their own key (`writeKeyFor_<member>`); everyone
/// else writes with the read key.
pub fn current_write_key(
    group: &GroupView,
    identity: &Identity,
    resolver: &Resolver<'_>,
) -> Option<KeySecret> {
    if group.role_of(&identity.actor, resolver) == Some(Role::WriteOnly) {
        let entry = GroupEntryKey::WriteKeyFor(identity.actor);
        let key_id: KeyId = group.entry(&entry)?.as_str()?.parse().ok()?;
        return read_key(group, &key_id, identity, resolver);
    }
    current_read_key(group, identity, resolver)
}

/// A lookup function for [`cosync_core::CoValueCore::decoded_transactions`]
/// that opens keys of `group`.
pub fn key_resolver<'g>(
    group: &'g GroupView,
    identity: &'g Identity,
    resolver: &'g Resolver<'g>,
) -> impl Fn(&KeyId) -> Option<KeySecret> + 'g {
    move |key_id| read_key(group, key_id, identity, resolver)
}
