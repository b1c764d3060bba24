//! Accounts, groups and invites on a node.
//!
//! Group operations compute their changes from the current group view and
//! write them in one transaction per group, all under the node lock. An
//! operation the caller's role does not allow writes nothing.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use cosync_core::{
    ActorId, AgentSecret, CoId, CoValueHeader, MapChange, Privacy, Ruleset, SessionId,
};
use cosync_perms::{
    accept_invite_changes, account_header, add_everyone, add_member, create_group_changes,
    create_invite, extend, group_header, invite_link, parse_invite_link, remove_member,
    revoke_extend, rotate_read_key, GroupEdit, GroupView, Identity, ParentRole, PermsError,
    Resolver, Role,
};
use cosync_store::Storage;

use crate::error::{NodeError, Result};
use crate::node::{LocalNode, NodeConfig, NodeState};

/// Key of the account entry pointing at the profile map.
const PROFILE_KEY: &str = "profile";

impl LocalNode {
    /// Create a new account and a node acting as it.
    ///
    /// The account gets a profile map, readable by everyone, holding `name`.
    pub fn create_account(
        name: &str,
        storage: Option<Arc<dyn Storage>>,
        config: NodeConfig,
    ) -> Result<LocalNode> {
        let agent = AgentSecret::generate();
        let header = account_header(&agent);
        let account = CoId::from_header(&header)?;
        let node = LocalNode::new(
            Identity::new(agent, ActorId::Account(account)),
            storage,
            config,
        );
        node.bootstrap_account(header)?;

        let profile_group = node.create_group()?;
        node.add_everyone(profile_group, Role::Reader)?;
        let profile = node.create_map(profile_group)?;
        node.map_set(profile, "name", json!(name), Privacy::Trusting)?;
        node.make_transaction(
            account,
            vec![MapChange::set(PROFILE_KEY, json!(profile.to_string()))],
            Privacy::Trusting,
        )?;
        info!("Created account {}", account);
        Ok(node)
    }

    /// A node acting as an existing account, which must be in `storage`.
    pub async fn login(
        agent: AgentSecret,
        account: CoId,
        storage: Arc<dyn Storage>,
        config: NodeConfig,
    ) -> Result<LocalNode> {
        let expected = ActorId::Agent(agent.id());
        let node = LocalNode::new(
            Identity::new(agent, ActorId::Account(account)),
            Some(storage),
            config,
        );
        node.load(account).await?;
        match node.header(&account).map(|h| h.ruleset) {
            Some(Ruleset::Group { initial_admin }) if initial_admin == expected => Ok(node),
            _ => Err(NodeError::InvalidOperation(format!(
                "{} is not an account of this agent",
                account
            ))),
        }
    }

    /// The account map's first transaction: written by the bare agent, it
    /// makes the agent admin and gives it the first read key.
    fn bootstrap_account(&self, header: CoValueHeader) -> Result<()> {
        let bootstrap = Identity::agent(self.inner.identity.agent.clone());
        let (_, changes) = create_group_changes(&bootstrap)?;
        let session = SessionId::new_random(&bootstrap.actor);

        let mut state = self.inner.lock_state();
        let id = self.insert_new(&mut state, header)?;
        self.write_locked(
            &mut state,
            id,
            &session,
            bootstrap.agent.signer(),
            &changes,
            None,
        )?;
        Ok(())
    }

    /// The profile map of a loaded account.
    pub fn profile_of(&self, account: &CoId) -> Result<Option<CoId>> {
        let content = self.content(account)?;
        let map = content
            .as_map()
            .ok_or_else(|| NodeError::InvalidOperation(format!("{} is not an account", account)))?;
        Ok(map
            .get(PROFILE_KEY)
            .and_then(Value::as_str)
            .and_then(|id| id.parse().ok()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group with this node's actor as its admin.
    pub fn create_group(&self) -> Result<CoId> {
        let identity = &self.inner.identity;
        let header = group_header(identity.actor, None);
        let (_, changes) = create_group_changes(identity)?;

        let mut state = self.inner.lock_state();
        let id = self.insert_new(&mut state, header)?;
        self.write_as_self(&mut state, id, &changes, None)?;
        debug!("Created group {}", id);
        Ok(id)
    }

    /// Role of `actor` in `group`, including inherited and `everyone` roles.
    pub fn role_of(&self, group: CoId, actor: &ActorId) -> Result<Option<Role>> {
        let state = self.inner.lock_state();
        let resolver = Resolver::new(&state.cores);
        let view = group_view(&state, &resolver, group)?;
        Ok(view.role_of(actor, &resolver))
    }

    /// Role of this node's actor in `group`.
    pub fn my_role(&self, group: CoId) -> Result<Option<Role>> {
        self.role_of(group, &self.inner.identity.actor)
    }

    /// Give `member` a role in `group`. The member's account must be loaded
    /// so keys can be sealed to it.
    pub fn add_member(&self, group: CoId, member: ActorId, role: Role) -> Result<()> {
        self.edit_group(group, |view, resolver, identity| {
            add_member(view, resolver, identity, member, role)
        })
    }

    /// Give everyone a role in `group`.
    pub fn add_everyone(&self, group: CoId, role: Role) -> Result<()> {
        self.edit_group(group, |view, resolver, identity| {
            add_everyone(view, resolver, identity, role)
        })
    }

    /// Revoke `member` and rotate the read key.
    pub fn remove_member(&self, group: CoId, member: ActorId) -> Result<()> {
        self.edit_group(group, |view, resolver, identity| {
            remove_member(view, resolver, identity, member)
        })
    }

    pub fn rotate_read_key(&self, group: CoId) -> Result<()> {
        self.edit_group(group, |view, resolver, identity| {
            rotate_read_key(view, resolver, identity)
        })
    }

    /// Make `child` inherit roles from `parent`.
    pub fn extend(&self, child: CoId, parent: CoId, link: ParentRole) -> Result<()> {
        self.edit_groups(child, parent, |child, parent, resolver, identity| {
            extend(child, parent, resolver, identity, link)
        })
    }

    /// Cut `child` off from `parent`.
    pub fn revoke_extend(&self, child: CoId, parent: CoId) -> Result<()> {
        self.edit_groups(child, parent, |child, parent, resolver, identity| {
            revoke_extend(child, parent, resolver, identity)
        })
    }

    /// Create an invite granting `role` in `group`.
    ///
    /// Returns the link to hand out: `<group>/<invite secret>`.
    pub fn create_invite(&self, group: CoId, role: Role) -> Result<String> {
        let mut state = self.inner.lock_state();
        let (invite, changes) = {
            let resolver = Resolver::new(&state.cores);
            let view = group_view(&state, &resolver, group)?;
            create_invite(&view, &resolver, &self.inner.identity, role)?
        };
        self.write_as_self(&mut state, group, &changes, None)?;
        debug!("Created {} invite for {}", role.as_str(), group);
        Ok(invite_link(&group, &invite))
    }

    /// Redeem an invite link, loading its group first.
    ///
    /// The membership is written from a session of the invite agent, so it
    /// is authorized by the invite rather than by our own role. Returns the
    /// group.
    pub async fn accept_invite(&self, link: &str) -> Result<CoId> {
        let (group, invite) = parse_invite_link(link)?;
        self.load(group).await?;

        let identity = &self.inner.identity;
        let mut state = self.inner.lock_state();
        let changes = {
            let resolver = Resolver::new(&state.cores);
            let view = group_view(&state, &resolver, group)?;
            accept_invite_changes(
                &view,
                &resolver,
                &invite,
                identity.actor,
                &identity.agent.sealer_public(),
            )?
        };
        if changes.is_empty() {
            debug!("{} already holds the invited role in {}", identity.actor, group);
            return Ok(group);
        }
        let session = SessionId::new_random(&ActorId::Agent(invite.id()));
        self.write_locked(&mut state, group, &session, invite.signer(), &changes, None)?;
        info!("Accepted invite to {}", group);
        Ok(group)
    }

    fn edit_group<F>(&self, group: CoId, edit: F) -> Result<()>
    where
        F: FnOnce(&GroupView, &Resolver<'_>, &Identity) -> cosync_perms::Result<Vec<Value>>,
    {
        let mut state = self.inner.lock_state();
        let changes = {
            let resolver = Resolver::new(&state.cores);
            let view = group_view(&state, &resolver, group)?;
            edit(&*view, &resolver, &self.inner.identity)?
        };
        if !changes.is_empty() {
            self.write_as_self(&mut state, group, &changes, None)?;
        }
        Ok(())
    }

    fn edit_groups<F>(&self, child: CoId, parent: CoId, edit: F) -> Result<()>
    where
        F: FnOnce(
            &GroupView,
            &GroupView,
            &Resolver<'_>,
            &Identity,
        ) -> cosync_perms::Result<Vec<GroupEdit>>,
    {
        let mut state = self.inner.lock_state();
        let edits = {
            let resolver = Resolver::new(&state.cores);
            let child_view = group_view(&state, &resolver, child)?;
            let parent_view = group_view(&state, &resolver, parent)?;
            edit(&*child_view, &*parent_view, &resolver, &self.inner.identity)?
        };
        for GroupEdit { group, changes } in edits {
            self.write_as_self(&mut state, group, &changes, None)?;
        }
        Ok(())
    }
}

fn group_view(
    state: &NodeState,
    resolver: &Resolver<'_>,
    group: CoId,
) -> Result<std::rc::Rc<GroupView>> {
    if !state.cores.contains_key(&group) {
        return Err(NodeError::Unavailable(group));
    }
    resolver
        .group(&group)
        .ok_or_else(|| PermsError::NotAGroup(group).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_account_has_profile() {
        let node = LocalNode::create_account("Alice", None, NodeConfig::default()).unwrap();
        let account = node.account_id().unwrap();
        assert_eq!(node.my_role(account).unwrap(), Some(Role::Admin));

        let profile = node.profile_of(&account).unwrap().unwrap();
        let content = node.content(&profile).unwrap();
        assert_eq!(content.as_map().unwrap().get("name"), Some(&json!("Alice")));
    }

    #[tokio::test]
    async fn test_group_creator_is_admin() {
        let node = LocalNode::create_account("Alice", None, NodeConfig::default()).unwrap();
        let group = node.create_group().unwrap();
        assert_eq!(node.my_role(group).unwrap(), Some(Role::Admin));
    }

    #[tokio::test]
    async fn test_private_writes_readable_by_author() {
        let node = LocalNode::create_account("Alice", None, NodeConfig::default()).unwrap();
        let group = node.create_group().unwrap();
        let map = node.create_map(group).unwrap();
        node.map_set(map, "secret", json!(42), Privacy::Private)
            .unwrap();

        let content = node.content(&map).unwrap();
        assert_eq!(content.as_map().unwrap().get("secret"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_role_of_unknown_group() {
        let node = LocalNode::create_account("Alice", None, NodeConfig::default()).unwrap();
        let missing = CoId([3; 32]);
        assert!(matches!(
            node.role_of(missing, &node.identity().actor),
            Err(NodeError::Unavailable(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_plain_map_is_not_a_group() {
        let node = LocalNode::create_account("Alice", None, NodeConfig::default()).unwrap();
        let group = node.create_group().unwrap();
        let map = node.create_map(group).unwrap();
        assert!(matches!(
            node.create_list(map),
            Err(NodeError::Permission(PermsError::NotAGroup(_)))
        ));
    }

    #[tokio::test]
    async fn test_invite_within_one_node_is_noop_for_admin() {
        let node = LocalNode::create_account("Alice", None, NodeConfig::default()).unwrap();
        let group = node.create_group().unwrap();
        let link = node.create_invite(group, Role::Writer).unwrap();
        assert_eq!(node.accept_invite(&link).await.unwrap(), group);
        assert_eq!(node.my_role(group).unwrap(), Some(Role::Admin));
    }
}
