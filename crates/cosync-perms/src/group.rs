//! Group state and role resolution.
//!
//! A group is a map whose entries are roles, keys and links to parent and
//! child groups. Its state is derived from its valid transactions, and can
//! be read as of any point in time for checking transactions made then.

use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::debug;

use cosync_core::{ActorId, CoId, CoMap, CoValueHeader, CoValueLookup, DecodedTransaction, KeyId};

use crate::role::{GroupEntryKey, ParentRole, Role};
use crate::validity::group_valid_transactions;

/// Resolves group views during one permission computation.
///
/// Views are cached for the resolver's lifetime. A group that is reached
/// again while its own view is being computed (a parent cycle) resolves to
/// nothing.
pub struct Resolver<'a> {
    lookup: &'a dyn CoValueLookup,
    views: RefCell<HashMap<CoId, Option<Rc<GroupView>>>>,
    in_progress: RefCell<HashSet<CoId>>,
}

impl<'a> Resolver<'a> {
    pub fn new(lookup: &'a dyn CoValueLookup) -> Self {
        Self {
            lookup,
            views: RefCell::new(HashMap::new()),
            in_progress: RefCell::new(HashSet::new()),
        }
    }

    pub fn lookup(&self) -> &'a dyn CoValueLookup {
        self.lookup
    }

    /// The current view of group `id`, if loaded and a group.
    pub fn group(&self, id: &CoId) -> Option<Rc<GroupView>> {
        if let Some(cached) = self.views.borrow().get(id) {
            return cached.clone();
        }
        if !self.in_progress.borrow_mut().insert(*id) {
            debug!("Parent cycle through group {}", id);
            return None;
        }

        let view = self.compute(id).map(Rc::new);

        self.in_progress.borrow_mut().remove(id);
        self.views.borrow_mut().insert(*id, view.clone());
        view
    }

    fn compute(&self, id: &CoId) -> Option<GroupView> {
        let core = self.lookup.get_core(id)?;
        if !core.header().is_group() {
            return None;
        }
        // Group transactions are trusting; private ones never count.
        let decoded = core.decoded_transactions(&|_| None);
        let valid = group_valid_transactions(core.id(), core.header(), decoded, self);
        Some(GroupView::new(*id, core.header().clone(), &valid))
    }
}

/// Merged state of a group.
#[derive(Debug, Clone)]
pub struct GroupView {
    id: CoId,
    header: CoValueHeader,
    map: CoMap,
    valid: Vec<DecodedTransaction>,
}

impl GroupView {
    pub fn new(id: CoId, header: CoValueHeader, valid: &[DecodedTransaction]) -> Self {
        Self {
            id,
            header,
            map: CoMap::from_transactions(id, valid),
            valid: valid.to_vec(),
        }
    }

    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn map(&self) -> &CoMap {
        &self.map
    }

    /// Valid transactions, in merge order.
    pub fn valid_transactions(&self) -> &[DecodedTransaction] {
        &self.valid
    }

    pub fn is_account(&self) -> bool {
        self.header.is_account()
    }

    /// Entry value now (`at = None`) or as of a point in time.
    pub fn entry_at(&self, key: &str, at: Option<i64>) -> Option<&Value> {
        match at {
            None => self.map.get(key),
            Some(t) => self.map.get_at(key, t),
        }
    }

    pub fn entry(&self, key: &GroupEntryKey) -> Option<&Value> {
        self.map.get(&key.to_string())
    }

    /// Role written directly for `actor`.
    pub fn direct_role_at(&self, actor: &ActorId, at: Option<i64>) -> Option<Role> {
        Role::from_value(self.entry_at(&actor.to_string(), at)?)
    }

    pub fn direct_role(&self, actor: &ActorId) -> Option<Role> {
        self.direct_role_at(actor, None)
    }

    /// Role granted to everyone.
    pub fn everyone_role_at(&self, at: Option<i64>) -> Option<Role> {
        Role::from_value(self.entry_at(&GroupEntryKey::Everyone.to_string(), at)?)
    }

    /// Parent links in effect.
    pub fn parents_at(&self, at: Option<i64>) -> Vec<(CoId, ParentRole)> {
        self.map
            .all_keys()
            .filter_map(|key| match GroupEntryKey::parse(key) {
                GroupEntryKey::Parent(parent) => {
                    let link = ParentRole::from_value(self.entry_at(key, at)?)?;
                    Some((parent, link))
                }
                _ => None,
            })
            .collect()
    }

    /// Child groups currently linked.
    pub fn children(&self) -> Vec<CoId> {
        self.map
            .keys()
            .filter_map(|key| match GroupEntryKey::parse(key) {
                GroupEntryKey::Child(child) => {
                    (self.map.get(key)?.as_str()? != "revoked").then_some(child)
                }
                _ => None,
            })
            .collect()
    }

    /// Members with a directly written role.
    pub fn members(&self) -> Vec<(ActorId, Role)> {
        self.map
            .entries()
            .filter_map(|(key, value)| match GroupEntryKey::parse(key) {
                GroupEntryKey::Member(actor) => Some((actor, Role::from_value(value)?)),
                _ => None,
            })
            .collect()
    }

    /// The id of the current read key.
    pub fn read_key_id(&self) -> Option<KeyId> {
        self.entry(&GroupEntryKey::ReadKey)?.as_str()?.parse().ok()
    }

    /// Effective role of `actor` now.
    pub fn role_of(&self, actor: &ActorId, resolver: &Resolver<'_>) -> Option<Role> {
        self.role_of_at(actor, None, resolver)
    }

    /// Effective role of `actor` at a point in time, including inherited roles.
    pub fn role_of_at(
        &self,
        actor: &ActorId,
        at: Option<i64>,
        resolver: &Resolver<'_>,
    ) -> Option<Role> {
        if self.is_account() && *actor == ActorId::Account(self.id) {
            return Some(Role::Admin);
        }
        resolve_role(
            self.direct_role_at(actor, at),
            self.everyone_role_at(at),
            &self.parents_at(at),
            actor,
            at,
            resolver,
        )
    }

    /// True if `ancestor` is reachable through parent links from this group.
    pub fn has_ancestor(&self, ancestor: &CoId, resolver: &Resolver<'_>) -> bool {
        let mut stack: Vec<CoId> = self.parents_at(None).into_iter().map(|(p, _)| p).collect();
        let mut seen = HashSet::new();
        while let Some(group) = stack.pop() {
            if group == *ancestor {
                return true;
            }
            if !seen.insert(group) {
                continue;
            }
            if let Some(view) = resolver.group(&group) {
                stack.extend(view.parents_at(None).into_iter().map(|(p, _)| p));
            }
        }
        false
    }
}

/// Combine a direct role, the everyone role and inherited roles.
///
/// A direct entry (even `revoked`) is final. Otherwise the strongest of the
/// everyone role and the roles inherited through parent links applies.
pub(crate) fn resolve_role(
    direct: Option<Role>,
    everyone: Option<Role>,
    parents: &[(CoId, ParentRole)],
    actor: &ActorId,
    at: Option<i64>,
    resolver: &Resolver<'_>,
) -> Option<Role> {
    if direct.is_some() {
        return direct;
    }

    let mut best = everyone.filter(|r| *r != Role::Revoked && !r.is_invite());
    for (parent, link) in parents {
        let Some(view) = resolver.group(parent) else {
            continue;
        };
        let inherited = view
            .role_of_at(actor, at, resolver)
            .and_then(|role| link.inherit(role));
        if let Some(inherited) = inherited {
            best = Some(best.map_or(inherited, |b| b.max(inherited)));
        }
    }
    best
}
