//! Which transactions of a CoValue are valid.
//!
//! - `unsafeAllowAll`: every signed transaction.
//! - `ownedByGroup`: transactions whose author could write in the owning
//!   group at the transaction's `madeAt`.
//! - `group`: each transaction is checked against the group state built
//!   from the valid transactions before it, plus parent roles at its
//!   `madeAt`. A transaction with any disallowed change is dropped whole.

use serde_json::Value;
use tracing::{debug, warn};

use cosync_core::{
    ActorId, CoId, CoMap, CoValueCore, CoValueHeader, DecodedTransaction, MapChange, Ruleset,
};

use crate::group::{resolve_role, Resolver};
use crate::role::{GroupEntryKey, ParentRole, RevealTarget, Role};

/// Filter `decoded` (in merge order) down to the valid transactions of `core`.
pub fn valid_transactions(
    core: &CoValueCore,
    decoded: Vec<DecodedTransaction>,
    resolver: &Resolver<'_>,
) -> Vec<DecodedTransaction> {
    match &core.header().ruleset {
        Ruleset::UnsafeAllowAll => decoded,
        Ruleset::OwnedByGroup { group } => {
            let Some(view) = resolver.group(group) else {
                debug!("Owner group {} of {} not available", group, core.id());
                return Vec::new();
            };
            decoded
                .into_iter()
                .filter(|tx| {
                    view.role_of_at(&tx.author, Some(tx.made_at), resolver)
                        .map_or(false, Role::can_write)
                })
                .collect()
        }
        Ruleset::Group { .. } => group_valid_transactions(core.id(), core.header(), decoded, resolver),
    }
}

/// Sequential validation of a group's own transactions.
pub(crate) fn group_valid_transactions(
    id: CoId,
    header: &CoValueHeader,
    decoded: Vec<DecodedTransaction>,
    resolver: &Resolver<'_>,
) -> Vec<DecodedTransaction> {
    let Ruleset::Group { initial_admin } = header.ruleset else {
        return Vec::new();
    };
    let checker = GroupChecker {
        id,
        initial_admin,
        is_account: header.is_account(),
        resolver,
    };

    let mut map = CoMap::empty(id);
    let mut valid = Vec::new();

    for tx in decoded {
        let Some(changes) = &tx.changes else {
            debug!("Ignoring private transaction {:?} in group {}", tx.id, id);
            continue;
        };
        let parsed: Option<Vec<MapChange>> = changes
            .iter()
            .map(|c| serde_json::from_value(c.clone()).ok())
            .collect();
        let Some(parsed) = parsed else {
            warn!("Malformed change in group {} transaction {:?}", id, tx.id);
            continue;
        };

        let mut overlay: Vec<(String, Option<Value>)> = Vec::new();
        let mut allowed = true;
        for change in &parsed {
            let state = StateView {
                map: &map,
                overlay: &overlay,
            };
            if !checker.change_allowed(&state, &tx, change) {
                allowed = false;
                break;
            }
            let value = match change {
                MapChange::Set { value, .. } => Some(value.clone()),
                MapChange::Del { .. } => None,
            };
            overlay.push((change.key().to_string(), value));
        }

        if allowed {
            for (change_idx, change) in parsed.into_iter().enumerate() {
                map.apply_change(&tx, change_idx, change);
            }
            valid.push(tx);
        } else {
            debug!("Rejected transaction {:?} in group {}", tx.id, id);
        }
    }
    valid
}

/// Group state before the current change: applied map plus the earlier
/// changes of the same transaction.
struct StateView<'s> {
    map: &'s CoMap,
    overlay: &'s [(String, Option<Value>)],
}

impl StateView<'_> {
    fn entry(&self, key: &str) -> Option<&Value> {
        match self.overlay.iter().rev().find(|(k, _)| k == key) {
            Some((_, value)) => value.as_ref(),
            None => self.map.get(key),
        }
    }

    fn direct_role(&self, actor: &ActorId) -> Option<Role> {
        Role::from_value(self.entry(&actor.to_string())?)
    }

    fn everyone_role(&self) -> Option<Role> {
        Role::from_value(self.entry(&GroupEntryKey::Everyone.to_string())?)
    }

    fn parents(&self) -> Vec<(CoId, ParentRole)> {
        let mut keys: Vec<&str> = self.map.all_keys().collect();
        keys.extend(self.overlay.iter().map(|(k, _)| k.as_str()));
        keys.sort_unstable();
        keys.dedup();
        keys.into_iter()
            .filter_map(|key| match GroupEntryKey::parse(key) {
                GroupEntryKey::Parent(parent) => {
                    Some((parent, ParentRole::from_value(self.entry(key)?)?))
                }
                _ => None,
            })
            .collect()
    }
}

struct GroupChecker<'r, 'a> {
    id: CoId,
    initial_admin: ActorId,
    is_account: bool,
    resolver: &'r Resolver<'a>,
}

impl GroupChecker<'_, '_> {
    fn author_role(&self, state: &StateView<'_>, tx: &DecodedTransaction) -> Option<Role> {
        if self.is_account && tx.author == ActorId::Account(self.id) {
            return Some(Role::Admin);
        }
        resolve_role(
            state.direct_role(&tx.author),
            state.everyone_role(),
            &state.parents(),
            &tx.author,
            Some(tx.made_at),
            self.resolver,
        )
    }

    fn change_allowed(
        &self,
        state: &StateView<'_>,
        tx: &DecodedTransaction,
        change: &MapChange,
    ) -> bool {
        // Group entries are only ever set; removal is a `revoked` role.
        let MapChange::Set { value, .. } = change else {
            return false;
        };
        let author = &tx.author;
        let author_role = self.author_role(state, tx);
        let is_admin = author_role == Some(Role::Admin);

        match GroupEntryKey::parse(change.key()) {
            GroupEntryKey::Member(member) => {
                let Some(new_role) = Role::from_value(value) else {
                    return false;
                };
                let current = state.direct_role(&member);

                // Bootstrap: the initial admin makes itself admin.
                if member == *author
                    && *author == self.initial_admin
                    && new_role == Role::Admin
                    && current.is_none()
                {
                    return true;
                }

                match author_role {
                    Some(Role::Admin) => {
                        !(current == Some(Role::Admin) && member != *author && new_role != Role::Admin)
                    }
                    Some(invite) if invite.is_invite() => {
                        member != *author
                            && invite_can_grant(invite, new_role)
                            && current.map_or(true, |c| c.rank() < new_role.rank())
                    }
                    _ => {
                        member == *author
                            && !new_role.is_invite()
                            && current.map_or(false, |c| new_role.rank() <= c.rank())
                    }
                }
            }
            GroupEntryKey::Everyone => {
                is_admin
                    && Role::from_value(value).map_or(false, |role| {
                        matches!(
                            role,
                            Role::Reader | Role::Writer | Role::WriteOnly | Role::Revoked
                        )
                    })
            }
            GroupEntryKey::Child(_) => author_role.map_or(false, Role::can_read),
            GroupEntryKey::KeyReveal { target, .. } => {
                is_admin
                    || (author_role.map_or(false, Role::is_invite)
                        && matches!(target, RevealTarget::Member(m) if m != *author))
            }
            GroupEntryKey::ReadKey
            | GroupEntryKey::Parent(_)
            | GroupEntryKey::WriteKeyFor(_)
            | GroupEntryKey::Other(_) => is_admin,
        }
    }
}

fn invite_can_grant(invite: Role, role: Role) -> bool {
    match invite.granted_by_invite() {
        Some(granted) => {
            matches!(role, Role::Reader | Role::Writer | Role::Admin) && role.rank() <= granted.rank()
        }
        None => false,
    }
}
