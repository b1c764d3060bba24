//! CoStream: per-session append-only item feeds.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::ids::{ActorId, CoId, SessionId, TransactionId};
use crate::transaction::DecodedTransaction;

/// One item pushed to a stream. Every change of a transaction is an item.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub value: Value,
    pub made_at: i64,
    pub tx_id: TransactionId,
}

/// Merged view of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CoStream {
    id: CoId,
    items: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl CoStream {
    /// Build from valid transactions in merge order.
    pub fn from_transactions(id: CoId, transactions: &[DecodedTransaction]) -> Self {
        let mut items: BTreeMap<SessionId, Vec<StreamItem>> = BTreeMap::new();
        for tx in transactions {
            let Some(changes) = &tx.changes else {
                continue;
            };
            let session_items = items.entry(tx.id.session_id.clone()).or_default();
            session_items.extend(changes.iter().map(|value| StreamItem {
                value: value.clone(),
                made_at: tx.made_at,
                tx_id: tx.id.clone(),
            }));
        }
        Self { id, items }
    }

    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.items.keys()
    }

    /// Items pushed by one session, in order.
    pub fn session_view(&self, session: &SessionId) -> &[StreamItem] {
        self.items.get(session).map_or(&[][..], Vec::as_slice)
    }

    pub fn last_in_session(&self, session: &SessionId) -> Option<&StreamItem> {
        self.items.get(session)?.last()
    }

    /// Items pushed by all sessions of `actor`, ordered by time.
    pub fn by_account(&self, actor: &ActorId) -> Vec<&StreamItem> {
        let mut items: Vec<&StreamItem> = self
            .items
            .iter()
            .filter(|(session, _)| session.actor() == *actor)
            .flat_map(|(_, items)| items.iter())
            .collect();
        items.sort_by(|a, b| {
            (a.made_at, &a.tx_id).cmp(&(b.made_at, &b.tx_id))
        });
        items
    }

    /// The latest item by any session of `actor`.
    pub fn last_by_account(&self, actor: &ActorId) -> Option<&StreamItem> {
        self.by_account(actor).into_iter().last()
    }

    /// `{ "<session>": [values…] }`
    pub fn to_json(&self) -> Value {
        let object: Map<String, Value> = self
            .items
            .iter()
            .map(|(session, items)| {
                (
                    session.to_string(),
                    Value::Array(items.iter().map(|i| i.value.clone()).collect()),
                )
            })
            .collect();
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(session: &SessionId, index: usize, made_at: i64, values: Vec<Value>) -> DecodedTransaction {
        DecodedTransaction {
            id: TransactionId::new(session.clone(), index),
            author: session.actor(),
            made_at,
            changes: Some(values),
        }
    }

    #[test]
    fn test_items_per_session_and_by_account() {
        let account = ActorId::Account(CoId([1; 32]));
        let s1 = SessionId::new_random(&account);
        let s2 = SessionId::new_random(&account);
        let other = SessionId::new_random(&ActorId::Account(CoId([2; 32])));

        let txs = vec![
            tx(&s1, 0, 1, vec![json!("a"), json!("b")]),
            tx(&other, 0, 2, vec![json!("x")]),
            tx(&s2, 0, 3, vec![json!("c")]),
        ];
        let stream = CoStream::from_transactions(CoId([0; 32]), &txs);

        assert_eq!(stream.session_view(&s1).len(), 2);
        let by_account: Vec<&Value> = stream.by_account(&account).iter().map(|i| &i.value).collect();
        assert_eq!(by_account, vec![&json!("a"), &json!("b"), &json!("c")]);
        assert_eq!(stream.last_by_account(&account).unwrap().value, json!("c"));
        assert_eq!(stream.last_in_session(&other).unwrap().value, json!("x"));
    }
}
