//! In-memory set of CoValues for permission tests.

use serde_json::Value;
use std::collections::HashMap;

use cosync_core::{
    ActorId, AgentSecret, CoId, CoValueCore, CoValueHeader, CoValueType, KeySecret, SessionId,
    DEFAULT_MAX_RECOMMENDED_TX_SIZE,
};

use crate::group::{GroupView, Resolver};
use crate::keys::Identity;
use crate::ops::{account_header, create_group_changes, group_header, owned_header};

pub(crate) struct World {
    pub cores: HashMap<CoId, CoValueCore>,
    sessions: HashMap<ActorId, SessionId>,
    clock: i64,
}

impl World {
    pub fn new() -> Self {
        Self {
            cores: HashMap::new(),
            sessions: HashMap::new(),
            clock: 1_000,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, header: CoValueHeader) -> CoId {
        let core = CoValueCore::new(header, DEFAULT_MAX_RECOMMENDED_TX_SIZE).unwrap();
        let id = core.id();
        self.cores.insert(id, core);
        id
    }

    /// A loaded account, acting as itself.
    pub fn account(&mut self) -> Identity {
        let agent = AgentSecret::generate();
        let id = self.insert(account_header(&agent));
        let bootstrap = Identity::agent(agent.clone());
        let (_, changes) = create_group_changes(&bootstrap).unwrap();
        self.write(id, &bootstrap, changes);
        Identity::new(agent, ActorId::Account(id))
    }

    pub fn create_group(&mut self, identity: &Identity) -> CoId {
        let id = self.insert(group_header(identity.actor, None));
        let (_, changes) = create_group_changes(identity).unwrap();
        self.write(id, identity, changes);
        id
    }

    pub fn create_owned(&mut self, value_type: CoValueType, group: CoId) -> CoId {
        self.insert(owned_header(value_type, group, None))
    }

    pub fn write(&mut self, id: CoId, identity: &Identity, changes: Vec<Value>) {
        self.write_with_key(id, identity, changes, None);
    }

    pub fn write_with_key(
        &mut self,
        id: CoId,
        identity: &Identity,
        changes: Vec<Value>,
        key: Option<&KeySecret>,
    ) {
        let made_at = self.tick();
        let session = self
            .sessions
            .entry(identity.actor)
            .or_insert_with(|| SessionId::new_random(&identity.actor))
            .clone();
        self.cores
            .get_mut(&id)
            .unwrap()
            .make_transaction(&session, identity.agent.signer(), &changes, made_at, key)
            .unwrap();
    }

    pub fn with_group<T>(&self, id: &CoId, f: impl FnOnce(&GroupView, &Resolver<'_>) -> T) -> T {
        let resolver = Resolver::new(&self.cores);
        let view = resolver.group(id).unwrap();
        f(&view, &resolver)
    }
}
