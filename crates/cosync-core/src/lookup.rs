//! Access to other CoValues during verification and permission checks.

use std::collections::HashMap;
use std::hash::BuildHasher;

use crate::covalue::CoValueCore;
use crate::crypto::Ed25519PublicKey;
use crate::header::Ruleset;
use crate::ids::{ActorId, CoId, SessionId};

/// Read access to loaded CoValues.
pub trait CoValueLookup {
    fn get_core(&self, id: &CoId) -> Option<&CoValueCore>;
}

impl<S: BuildHasher> CoValueLookup for HashMap<CoId, CoValueCore, S> {
    fn get_core(&self, id: &CoId) -> Option<&CoValueCore> {
        self.get(id)
    }
}

/// The key that must have signed `session`.
///
/// Agent sessions are signed by the agent itself. Account sessions are
/// signed by the account's agent, which is the account header's initial
/// admin; `None` means the account is not loaded yet.
pub fn resolve_signer(lookup: &dyn CoValueLookup, session: &SessionId) -> Option<Ed25519PublicKey> {
    match session.actor() {
        ActorId::Agent(agent) => Some(agent.signer()),
        ActorId::Account(account) => account_agent_signer(lookup.get_core(&account)?),
    }
}

fn account_agent_signer(account: &CoValueCore) -> Option<Ed25519PublicKey> {
    if !account.header().is_account() {
        return None;
    }
    match account.header().ruleset {
        Ruleset::Group {
            initial_admin: ActorId::Agent(agent),
        } => Some(agent.signer()),
        _ => None,
    }
}
