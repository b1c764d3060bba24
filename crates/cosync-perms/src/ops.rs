//! Group operations.
//!
//! Each operation checks the caller's role against the current group view
//! and returns the map changes to write. Writing them (in one transaction
//! per group) is up to the caller.

use serde_json::{json, Value};
use tracing::{debug, warn};

use cosync_core::{
    ActorId, AgentSecret, CoId, CoValueHeader, CoValueType, KeySecret, MapChange, Ruleset,
    SealerPublic,
};

use crate::error::{PermsError, Result};
use crate::group::{GroupView, Resolver};
use crate::keys::{current_read_key, sealer_of, Identity};
use crate::role::{GroupEntryKey, ParentRole, RevealTarget, Role};

/// Changes for one group, produced by operations touching several groups.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEdit {
    pub group: CoId,
    pub changes: Vec<Value>,
}

/// Header for a new group administered by `initial_admin`.
pub fn group_header(initial_admin: ActorId, meta: Option<Value>) -> CoValueHeader {
    CoValueHeader::new(CoValueType::Map, Ruleset::Group { initial_admin }, meta)
}

/// Header for an account whose sessions are signed by `agent`.
pub fn account_header(agent: &AgentSecret) -> CoValueHeader {
    group_header(ActorId::Agent(agent.id()), Some(json!({"type": "account"})))
}

/// Header for a value owned by `group`.
pub fn owned_header(value_type: CoValueType, group: CoId, meta: Option<Value>) -> CoValueHeader {
    CoValueHeader::new(value_type, Ruleset::OwnedByGroup { group }, meta)
}

fn set(key: &GroupEntryKey, value: impl Into<Value>) -> Value {
    MapChange::set(key.to_string(), value.into())
}

fn reveal(key: &KeySecret, target: RevealTarget) -> GroupEntryKey {
    GroupEntryKey::KeyReveal {
        key: key.id(),
        target,
    }
}

/// First transaction of a new group: the creator becomes admin and gets
/// the first read key.
///
/// Returns the new read key with the changes.
pub fn create_group_changes(identity: &Identity) -> Result<(KeySecret, Vec<Value>)> {
    let read_key = KeySecret::generate();
    let changes = vec![
        set(&GroupEntryKey::Member(identity.actor), Role::Admin.as_str()),
        set(&GroupEntryKey::ReadKey, read_key.id().to_string()),
        set(
            &reveal(&read_key, RevealTarget::Member(identity.actor)),
            read_key.seal_for(&identity.agent.sealer_public())?,
        ),
    ];
    Ok((read_key, changes))
}

fn require_admin(group: &GroupView, identity: &Identity, resolver: &Resolver<'_>) -> Result<()> {
    match group.role_of(&identity.actor, resolver) {
        Some(Role::Admin) => Ok(()),
        other => Err(PermsError::PermissionDenied(format!(
            "{} is {} in {}, admin required",
            identity.actor,
            other.map_or("not a member", Role::as_str),
            group.id()
        ))),
    }
}

fn read_key_of(group: &GroupView, identity: &Identity, resolver: &Resolver<'_>) -> Result<KeySecret> {
    current_read_key(group, identity, resolver).ok_or(PermsError::MissingReadKey(group.id()))
}

/// Give `member` a role, sharing the keys it needs.
///
/// Readers and invite agents get the read key sealed to them. Write-only
/// members get their own write key, readable by everyone holding the read
/// key.
pub fn add_member(
    group: &GroupView,
    resolver: &Resolver<'_>,
    identity: &Identity,
    member: ActorId,
    role: Role,
) -> Result<Vec<Value>> {
    require_admin(group, identity, resolver)?;
    if role == Role::Revoked {
        return Err(PermsError::InvalidRole(
            "use remove_member to revoke".to_string(),
        ));
    }
    if member != identity.actor
        && group.direct_role(&member) == Some(Role::Admin)
        && role != Role::Admin
    {
        return Err(PermsError::CannotDowngradeAdmin(member));
    }

    let read_key = read_key_of(group, identity, resolver)?;
    let sealer = sealer_of(&member, resolver.lookup()).ok_or(PermsError::MissingSealer(member))?;

    let mut changes = vec![set(&GroupEntryKey::Member(member), role.as_str())];
    if role == Role::WriteOnly {
        let write_key = KeySecret::generate();
        changes.push(set(
            &GroupEntryKey::WriteKeyFor(member),
            write_key.id().to_string(),
        ));
        changes.push(set(
            &reveal(&write_key, RevealTarget::Member(member)),
            write_key.seal_for(&sealer)?,
        ));
        changes.push(set(
            &reveal(&write_key, RevealTarget::Key(read_key.id())),
            read_key.encrypt_key(&write_key)?,
        ));
    } else {
        changes.push(set(
            &reveal(&read_key, RevealTarget::Member(member)),
            read_key.seal_for(&sealer)?,
        ));
    }
    Ok(changes)
}

/// Grant a role to everyone. Readable roles publish the read key.
pub fn add_everyone(
    group: &GroupView,
    resolver: &Resolver<'_>,
    identity: &Identity,
    role: Role,
) -> Result<Vec<Value>> {
    require_admin(group, identity, resolver)?;
    if !matches!(role, Role::Reader | Role::Writer | Role::WriteOnly) {
        return Err(PermsError::InvalidRole(format!(
            "{} cannot be granted to everyone",
            role
        )));
    }

    let mut changes = vec![set(&GroupEntryKey::Everyone, role.as_str())];
    if role.can_read() {
        let read_key = read_key_of(group, identity, resolver)?;
        changes.push(set(
            &reveal(&read_key, RevealTarget::Everyone),
            read_key.to_string(),
        ));
    }
    Ok(changes)
}

/// Revoke `member` and rotate the read key so it cannot read new content.
///
/// Members may remove themselves; that skips the rotation unless they are
/// admin.
pub fn remove_member(
    group: &GroupView,
    resolver: &Resolver<'_>,
    identity: &Identity,
    member: ActorId,
) -> Result<Vec<Value>> {
    let leaving = member == identity.actor;
    let is_admin = group.role_of(&identity.actor, resolver) == Some(Role::Admin);

    if !leaving {
        require_admin(group, identity, resolver)?;
        if group.direct_role(&member) == Some(Role::Admin) {
            return Err(PermsError::CannotDowngradeAdmin(member));
        }
    } else if group.direct_role(&member).is_none() {
        return Err(PermsError::PermissionDenied(format!(
            "{} has no role of its own in {}",
            member,
            group.id()
        )));
    }

    let mut changes = vec![set(&GroupEntryKey::Member(member), Role::Revoked.as_str())];
    if is_admin && !leaving {
        changes.extend(rotation_changes(group, resolver, identity, Some(&member), None)?);
    }
    Ok(changes)
}

/// Replace the read key, revealing the new one to every remaining reader,
/// to holders of the new key through `<old>_for_<new>`, and to parents.
pub fn rotate_read_key(
    group: &GroupView,
    resolver: &Resolver<'_>,
    identity: &Identity,
) -> Result<Vec<Value>> {
    rotation_changes(group, resolver, identity, None, None)
}

fn rotation_changes(
    group: &GroupView,
    resolver: &Resolver<'_>,
    identity: &Identity,
    removed_member: Option<&ActorId>,
    removed_parent: Option<&CoId>,
) -> Result<Vec<Value>> {
    require_admin(group, identity, resolver)?;
    let old_key = read_key_of(group, identity, resolver)?;
    let new_key = KeySecret::generate();
    let mut changes = Vec::new();

    for (member, role) in group.members() {
        if Some(&member) == removed_member || !(role.can_read() || role.is_invite()) {
            continue;
        }
        let sealer =
            sealer_of(&member, resolver.lookup()).ok_or(PermsError::MissingSealer(member))?;
        changes.push(set(
            &reveal(&new_key, RevealTarget::Member(member)),
            new_key.seal_for(&sealer)?,
        ));
    }

    changes.push(set(
        &reveal(&old_key, RevealTarget::Key(new_key.id())),
        new_key.encrypt_key(&old_key)?,
    ));

    if group.everyone_role_at(None).map_or(false, Role::can_read) {
        changes.push(set(
            &reveal(&new_key, RevealTarget::Everyone),
            new_key.to_string(),
        ));
    }

    for (parent, link) in group.parents_at(None) {
        if link == ParentRole::Revoked || Some(&parent) == removed_parent {
            continue;
        }
        let parent_key = resolver
            .group(&parent)
            .and_then(|view| current_read_key(&view, identity, resolver));
        match parent_key {
            Some(parent_key) => changes.push(set(
                &reveal(&new_key, RevealTarget::Key(parent_key.id())),
                parent_key.encrypt_key(&new_key)?,
            )),
            None => warn!(
                "Cannot reveal new key of {} to parent {}: parent key unreadable",
                group.id(),
                parent
            ),
        }
    }

    changes.push(set(&GroupEntryKey::ReadKey, new_key.id().to_string()));
    debug!("Rotating read key of {} to {}", group.id(), new_key.id());
    Ok(changes)
}

/// Make `child` inherit roles from `parent`.
///
/// Needs admin in the child and read access in the parent. The child's
/// read key is revealed to the parent's read key, so parent readers can
/// read the child.
pub fn extend(
    child: &GroupView,
    parent: &GroupView,
    resolver: &Resolver<'_>,
    identity: &Identity,
    link: ParentRole,
) -> Result<Vec<GroupEdit>> {
    require_admin(child, identity, resolver)?;
    if !parent
        .role_of(&identity.actor, resolver)
        .map_or(false, Role::can_read)
    {
        return Err(PermsError::PermissionDenied(format!(
            "{} cannot read parent {}",
            identity.actor,
            parent.id()
        )));
    }
    if link == ParentRole::Revoked {
        return Err(PermsError::InvalidRole("use revoke_extend".to_string()));
    }
    if child.id() == parent.id() || parent.has_ancestor(&child.id(), resolver) {
        return Err(PermsError::ExtendCycle {
            child: child.id(),
            parent: parent.id(),
        });
    }

    let child_key = read_key_of(child, identity, resolver)?;
    let parent_key = read_key_of(parent, identity, resolver)?;

    Ok(vec![
        GroupEdit {
            group: child.id(),
            changes: vec![
                set(&GroupEntryKey::Parent(parent.id()), link.to_value()),
                set(
                    &reveal(&child_key, RevealTarget::Key(parent_key.id())),
                    parent_key.encrypt_key(&child_key)?,
                ),
            ],
        },
        GroupEdit {
            group: parent.id(),
            changes: vec![set(
                &GroupEntryKey::Child(child.id()),
                ParentRole::Extend.to_value(),
            )],
        },
    ])
}

/// Cut the link between `child` and `parent` and rotate the child's key.
pub fn revoke_extend(
    child: &GroupView,
    parent: &GroupView,
    resolver: &Resolver<'_>,
    identity: &Identity,
) -> Result<Vec<GroupEdit>> {
    require_admin(child, identity, resolver)?;
    let mut child_changes = vec![set(
        &GroupEntryKey::Parent(parent.id()),
        ParentRole::Revoked.to_value(),
    )];
    child_changes.extend(rotation_changes(
        child,
        resolver,
        identity,
        None,
        Some(&parent.id()),
    )?);

    let mut edits = vec![GroupEdit {
        group: child.id(),
        changes: child_changes,
    }];
    if parent
        .role_of(&identity.actor, resolver)
        .map_or(false, Role::can_read)
    {
        edits.push(GroupEdit {
            group: parent.id(),
            changes: vec![set(
                &GroupEntryKey::Child(child.id()),
                ParentRole::Revoked.to_value(),
            )],
        });
    }
    Ok(edits)
}

/// Create an invite agent holding the invite role for `role`.
///
/// Returns the invite secret and the changes that register it.
pub fn create_invite(
    group: &GroupView,
    resolver: &Resolver<'_>,
    identity: &Identity,
    role: Role,
) -> Result<(AgentSecret, Vec<Value>)> {
    let invite_role = role
        .invite_role()
        .ok_or_else(|| PermsError::InvalidRole(format!("no invite for {}", role)))?;
    let invite = AgentSecret::generate();
    let changes = add_member(
        group,
        resolver,
        identity,
        ActorId::Agent(invite.id()),
        invite_role,
    )?;
    Ok((invite, changes))
}

/// `<group>/<invite secret>`.
pub fn invite_link(group: &CoId, invite: &AgentSecret) -> String {
    format!("{}/{}", group, invite)
}

/// Split an invite link into group id and invite secret.
pub fn parse_invite_link(link: &str) -> Result<(CoId, AgentSecret)> {
    let (group, secret) = link
        .split_once('/')
        .ok_or_else(|| PermsError::InvalidInvite(link.to_string()))?;
    let group = group
        .parse()
        .map_err(|_| PermsError::InvalidInvite(format!("bad group id {}", group)))?;
    let secret = secret
        .parse()
        .map_err(|_| PermsError::InvalidInvite("bad invite secret".to_string()))?;
    Ok((group, secret))
}

/// Changes the invite agent writes to admit `account`.
///
/// Must be written in a session of the invite agent. Empty if the account
/// already has at least the granted role.
pub fn accept_invite_changes(
    group: &GroupView,
    resolver: &Resolver<'_>,
    invite: &AgentSecret,
    account: ActorId,
    account_sealer: &SealerPublic,
) -> Result<Vec<Value>> {
    let invite_actor = ActorId::Agent(invite.id());
    let granted = group
        .direct_role(&invite_actor)
        .and_then(Role::granted_by_invite)
        .ok_or_else(|| {
            PermsError::InvalidInvite(format!("invite is not valid in {}", group.id()))
        })?;

    if group
        .direct_role(&account)
        .map_or(false, |current| current.rank() >= granted.rank())
    {
        return Ok(Vec::new());
    }

    let identity = Identity::agent(invite.clone());
    let read_key = read_key_of(group, &identity, resolver)?;
    Ok(vec![
        set(&GroupEntryKey::Member(account), granted.as_str()),
        set(
            &reveal(&read_key, RevealTarget::Member(account)),
            read_key.seal_for(account_sealer)?,
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::World;

    #[test]
    fn test_add_member_requires_admin() {
        let mut world = World::new();
        let alice = world.account();
        let bob = world.account();
        let carol = world.account();
        let group = world.create_group(&alice);
        let changes = world
            .with_group(&group, |view, resolver| {
                add_member(view, resolver, &alice, bob.actor, Role::Writer)
            })
            .unwrap();
        world.write(group, &alice, changes);

        let err = world
            .with_group(&group, |view, resolver| {
                add_member(view, resolver, &bob, carol.actor, Role::Reader)
            })
            .unwrap_err();
        assert!(matches!(err, PermsError::PermissionDenied(_)));
    }

    #[test]
    fn test_cannot_downgrade_admin() {
        let mut world = World::new();
        let alice = world.account();
        let bob = world.account();
        let group = world.create_group(&alice);
        let changes = world
            .with_group(&group, |view, resolver| {
                add_member(view, resolver, &alice, bob.actor, Role::Admin)
            })
            .unwrap();
        world.write(group, &alice, changes);

        let result = world.with_group(&group, |view, resolver| {
            add_member(view, resolver, &bob, alice.actor, Role::Reader)
        });
        assert!(matches!(result, Err(PermsError::CannotDowngradeAdmin(actor)) if actor == alice.actor));

        let result = world.with_group(&group, |view, resolver| {
            remove_member(view, resolver, &bob, alice.actor)
        });
        assert!(matches!(result, Err(PermsError::CannotDowngradeAdmin(_))));
    }

    #[test]
    fn test_removed_member_cannot_open_new_key() {
        let mut world = World::new();
        let alice = world.account();
        let bob = world.account();
        let group = world.create_group(&alice);
        let changes = world
            .with_group(&group, |view, resolver| {
                add_member(view, resolver, &alice, bob.actor, Role::Reader)
            })
            .unwrap();
        world.write(group, &alice, changes);

        let changes = world
            .with_group(&group, |view, resolver| {
                remove_member(view, resolver, &alice, bob.actor)
            })
            .unwrap();
        world.write(group, &alice, changes);

        world.with_group(&group, |view, resolver| {
            assert_eq!(view.role_of(&bob.actor, resolver), Some(Role::Revoked));
            assert!(current_read_key(view, &bob, resolver).is_none());
            assert!(current_read_key(view, &alice, resolver).is_some());
        });
    }

    #[test]
    fn test_extend_rejects_cycles() {
        let mut world = World::new();
        let alice = world.account();
        let a = world.create_group(&alice);
        let b = world.create_group(&alice);

        let edits = {
            let resolver = Resolver::new(&world.cores);
            let (va, vb) = (resolver.group(&a).unwrap(), resolver.group(&b).unwrap());
            extend(&va, &vb, &resolver, &alice, ParentRole::Extend).unwrap()
        };
        for edit in edits {
            world.write(edit.group, &alice, edit.changes);
        }

        let resolver = Resolver::new(&world.cores);
        let (va, vb) = (resolver.group(&a).unwrap(), resolver.group(&b).unwrap());
        let err = extend(&vb, &va, &resolver, &alice, ParentRole::Extend).unwrap_err();
        assert!(matches!(err, PermsError::ExtendCycle { .. }));
        let err = extend(&va, &va, &resolver, &alice, ParentRole::Extend).unwrap_err();
        assert!(matches!(err, PermsError::ExtendCycle { .. }));
    }

    #[test]
    fn test_revoke_extend_cuts_inheritance() {
        let mut world = World::new();
        let alice = world.account();
        let bob = world.account();
        let parent = world.create_group(&alice);
        let child = world.create_group(&alice);
        let changes = world
            .with_group(&parent, |view, resolver| {
                add_member(view, resolver, &alice, bob.actor, Role::Writer)
            })
            .unwrap();
        world.write(parent, &alice, changes);

        for step in 0..2 {
            let edits = {
                let resolver = Resolver::new(&world.cores);
                let (vc, vp) = (resolver.group(&child).unwrap(), resolver.group(&parent).unwrap());
                if step == 0 {
                    extend(&vc, &vp, &resolver, &alice, ParentRole::Extend).unwrap()
                } else {
                    revoke_extend(&vc, &vp, &resolver, &alice).unwrap()
                }
            };
            for edit in edits {
                world.write(edit.group, &alice, edit.changes);
            }
        }

        world.with_group(&child, |view, resolver| {
            assert_eq!(view.role_of(&bob.actor, resolver), None);
            assert!(current_read_key(view, &bob, resolver).is_none());
        });
        world.with_group(&parent, |view, _| assert!(view.children().is_empty()));
    }

    #[test]
    fn test_invite_link_and_acceptance() {
        let mut world = World::new();
        let alice = world.account();
        let bob = world.account();
        let group = world.create_group(&alice);

        let (invite, changes) = world
            .with_group(&group, |view, resolver| {
                create_invite(view, resolver, &alice, Role::Writer)
            })
            .unwrap();
        world.write(group, &alice, changes);

        let link = invite_link(&group, &invite);
        let (parsed_group, parsed_invite) = parse_invite_link(&link).unwrap();
        assert_eq!(parsed_group, group);
        assert_eq!(parsed_invite.id(), invite.id());

        let changes = world
            .with_group(&group, |view, resolver| {
                accept_invite_changes(
                    view,
                    resolver,
                    &parsed_invite,
                    bob.actor,
                    &bob.agent.sealer_public(),
                )
            })
            .unwrap();
        world.write(group, &Identity::agent(parsed_invite), changes);

        world.with_group(&group, |view, resolver| {
            assert_eq!(view.role_of(&bob.actor, resolver), Some(Role::Writer));
            assert!(current_read_key(view, &bob, resolver).is_some());
        });
    }

    #[test]
    fn test_parse_invite_link_rejects_garbage() {
        assert!(parse_invite_link("no-slash").is_err());
        assert!(parse_invite_link("co_zzz/sealerSecret_z00/signerSecret_z00").is_err());
    }
}
