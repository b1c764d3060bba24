//! Protocol steps that do not depend on where content lives.
//!
//! Applying received content to a core, and producing the content a peer
//! is missing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use cosync_core::{
    CoId, CoValueCore, ContentMessage, CoreError, Ed25519PublicKey, KnownState, SessionId,
};

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a load waits for storage and peers before the value is
    /// reported unavailable.
    pub load_timeout: Duration,
    /// Processing time after which the incoming queue yields to the runtime.
    pub time_budget: Duration,
    /// Content messages carrying more transactions are split by session.
    pub max_content_message_transactions: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            time_budget: Duration::from_millis(50),
            max_content_message_transactions: 100,
        }
    }
}

/// Result of applying one content message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Transactions appended.
    pub added: usize,
    /// Sessions that start beyond what we hold; the sender needs a correction.
    pub gaps: Vec<SessionId>,
    /// Sessions whose signer is not known yet.
    pub missing_signer: Vec<SessionId>,
    /// Sessions rejected as untrusted.
    pub invalid: Vec<SessionId>,
}

impl ApplyReport {
    pub fn needs_correction(&self) -> bool {
        !self.gaps.is_empty()
    }

    /// Accounts that must be loaded before the parked sessions can be verified.
    pub fn missing_accounts(&self) -> Vec<CoId> {
        let mut accounts: Vec<CoId> = self
            .missing_signer
            .iter()
            .filter_map(|s| s.actor().as_account())
            .collect();
        accounts.sort();
        accounts.dedup();
        accounts
    }
}

/// Apply every session of `message` to `core`.
///
/// Each session is verified against the key `signers` gives for it.
/// Sessions are independent: one failing does not stop the others.
pub fn apply_content(
    core: &mut CoValueCore,
    message: &ContentMessage,
    signers: &HashMap<SessionId, Ed25519PublicKey>,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    for (session, content) in &message.new {
        let Some(signer) = signers.get(session) else {
            debug!("Signer of {} not known yet, parking", session);
            report.missing_signer.push(session.clone());
            continue;
        };
        match core.try_add_transactions(
            session,
            content.after,
            &content.new_transactions,
            &content.last_signature,
            signer,
        ) {
            Ok(added) => report.added += added,
            Err(CoreError::Gap { local, after, .. }) => {
                debug!(
                    "Gap in {} {}: hold {}, content starts at {}",
                    core.id(),
                    session,
                    local,
                    after
                );
                report.gaps.push(session.clone());
            }
            Err(e) => {
                warn!("Rejected content for {} {}: {}", core.id(), session, e);
                report.invalid.push(session.clone());
            }
        }
    }
    report
}

/// Split messages carrying more than `max_transactions` into several, each
/// holding whole session pieces.
///
/// Session pieces keep their signatures, so every part verifies on its
/// own. The first part keeps the header and is told the final state.
pub fn split_content(messages: Vec<ContentMessage>, max_transactions: usize) -> Vec<ContentMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        if message.transaction_count() <= max_transactions.max(1) {
            out.push(message);
            continue;
        }

        let target = message.known_after();
        let ContentMessage {
            id,
            header,
            priority,
            new,
            expect_content_until,
        } = message;

        let mut parts: Vec<ContentMessage> = Vec::new();
        let mut current = ContentMessage::new(id, priority);
        current.header = header;
        for (session, piece) in new {
            let fits = current.transaction_count() + piece.new_transactions.len() <= max_transactions;
            if !fits && !current.new.is_empty() {
                parts.push(std::mem::replace(&mut current, ContentMessage::new(id, priority)));
            }
            current.new.insert(session, piece);
        }
        parts.push(current);

        if parts.len() > 1 {
            parts[0].expect_content_until = Some(expect_content_until.unwrap_or(target));
        } else {
            parts[0].expect_content_until = expect_content_until;
        }
        out.extend(parts);
    }
    out
}

/// Content `core` holds beyond `known`, split for sending.
pub fn content_for(
    core: &CoValueCore,
    known: Option<&KnownState>,
    config: &SyncConfig,
) -> Vec<ContentMessage> {
    split_content(
        core.new_content_since(known),
        config.max_content_message_transactions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::{
        ActorId, AgentSecret, CoValueHeader, CoValueType, MapChange, Ruleset,
        DEFAULT_MAX_RECOMMENDED_TX_SIZE,
    };
    use serde_json::json;

    struct Author {
        agent: AgentSecret,
        session: SessionId,
    }

    impl Author {
        fn new() -> Self {
            let agent = AgentSecret::generate();
            let session = SessionId::new_random(&ActorId::Agent(agent.id()));
            Self { agent, session }
        }

        fn write(&self, core: &mut CoValueCore, n: i64) {
            core.make_transaction(
                &self.session,
                self.agent.signer(),
                &[MapChange::set("n", json!(n))],
                n,
                None,
            )
            .unwrap();
        }

        fn signers(&self) -> HashMap<SessionId, Ed25519PublicKey> {
            HashMap::from([(self.session.clone(), self.agent.signer().public_key())])
        }
    }

    fn new_core() -> CoValueCore {
        let header = CoValueHeader::new(CoValueType::Map, Ruleset::UnsafeAllowAll, None);
        CoValueCore::new(header, DEFAULT_MAX_RECOMMENDED_TX_SIZE).unwrap()
    }

    fn replica_of(core: &CoValueCore) -> CoValueCore {
        CoValueCore::from_received_header(
            core.id(),
            core.header().clone(),
            DEFAULT_MAX_RECOMMENDED_TX_SIZE,
        )
        .unwrap()
    }

    #[test]
    fn test_apply_is_idempotent() {
        let author = Author::new();
        let mut source = new_core();
        for n in 0..3 {
            author.write(&mut source, n);
        }
        let mut replica = replica_of(&source);
        let messages = source.new_content_since(None);

        let report = apply_content(&mut replica, &messages[0], &author.signers());
        assert_eq!(report.added, 3);
        let again = apply_content(&mut replica, &messages[0], &author.signers());
        assert_eq!(again, ApplyReport::default());
        assert_eq!(replica.known_state(), source.known_state());
    }

    #[test]
    fn test_gap_reported() {
        let author = Author::new();
        let mut source = new_core();
        author.write(&mut source, 1);
        let held = source.known_state();
        author.write(&mut source, 2);

        let mut replica = replica_of(&source);
        let ahead = source.new_content_since(Some(&held));
        let report = apply_content(&mut replica, &ahead[0], &author.signers());
        assert!(report.needs_correction());
        assert_eq!(report.gaps, vec![author.session.clone()]);
        assert_eq!(replica.transaction_count(), 0);
    }

    #[test]
    fn test_unknown_signer_parks_session() {
        let author = Author::new();
        let mut source = new_core();
        author.write(&mut source, 1);

        let mut replica = replica_of(&source);
        let report = apply_content(&mut replica, &source.new_content_since(None)[0], &HashMap::new());
        assert_eq!(report.missing_signer.len(), 1);
        assert!(report.missing_accounts().is_empty());
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let author = Author::new();
        let impostor = Author::new();
        let mut source = new_core();
        author.write(&mut source, 1);

        let signers = HashMap::from([(
            author.session.clone(),
            impostor.agent.signer().public_key(),
        )]);
        let mut replica = replica_of(&source);
        let report = apply_content(&mut replica, &source.new_content_since(None)[0], &signers);
        assert_eq!(report.invalid, vec![author.session.clone()]);
        assert_eq!(replica.transaction_count(), 0);
    }

    #[test]
    fn test_split_keeps_sessions_whole() {
        let authors: Vec<Author> = (0..3).map(|_| Author::new()).collect();
        let mut source = new_core();
        for (i, author) in authors.iter().enumerate() {
            for n in 0..2 {
                author.write(&mut source, (i * 10 + n) as i64);
            }
        }

        let parts = split_content(source.new_content_since(None), 3);
        assert_eq!(parts.len(), 3);
        assert!(parts[0].header.is_some());
        assert!(parts[1..].iter().all(|p| p.header.is_none()));
        assert_eq!(parts[0].expect_content_until.as_ref().unwrap().total(), 6);

        let mut signers = HashMap::new();
        for author in &authors {
            signers.extend(author.signers());
        }
        let mut replica = replica_of(&source);
        for part in &parts {
            apply_content(&mut replica, part, &signers);
        }
        assert_eq!(replica.known_state(), source.known_state());
    }

    #[test]
    fn test_small_content_not_split() {
        let author = Author::new();
        let mut source = new_core();
        author.write(&mut source, 1);
        let parts = content_for(&source, None, &SyncConfig::default());
        assert_eq!(parts.len(), 1);
        assert!(parts[0].expect_content_until.is_none());
    }
}
