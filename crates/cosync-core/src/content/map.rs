//! CoMap: last-writer-wins map with per-key history.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::ids::{CoId, TransactionId};
use crate::transaction::DecodedTransaction;

/// A change to a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum MapChange {
    #[serde(rename = "set")]
    Set { key: String, value: Value },
    #[serde(rename = "del")]
    Del { key: String },
}

impl MapChange {
    pub fn set(key: impl Into<String>, value: Value) -> Value {
        json!({"op": "set", "key": key.into(), "value": value})
    }

    pub fn del(key: impl Into<String>) -> Value {
        json!({"op": "del", "key": key.into()})
    }

    pub fn key(&self) -> &str {
        match self {
            MapChange::Set { key, .. } | MapChange::Del { key } => key,
        }
    }
}

/// One write to a key. `value: None` is a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct MapOp {
    pub tx_id: TransactionId,
    pub change_idx: usize,
    pub made_at: i64,
    pub value: Option<Value>,
}

/// Merged view of a map. Ops per key are kept in merge order; the last one wins.
#[derive(Debug, Clone, PartialEq)]
pub struct CoMap {
    id: CoId,
    ops: BTreeMap<String, Vec<MapOp>>,
}

impl CoMap {
    pub fn empty(id: CoId) -> Self {
        Self {
            id,
            ops: BTreeMap::new(),
        }
    }

    /// Build from valid transactions in merge order.
    pub fn from_transactions(id: CoId, transactions: &[DecodedTransaction]) -> Self {
        let mut map = Self::empty(id);
        for tx in transactions {
            map.apply_transaction(tx);
        }
        map
    }

    /// Apply every change of one transaction.
    pub fn apply_transaction(&mut self, tx: &DecodedTransaction) {
        let Some(changes) = &tx.changes else {
            return;
        };
        for (change_idx, raw) in changes.iter().enumerate() {
            match serde_json::from_value::<MapChange>(raw.clone()) {
                Ok(change) => self.apply_change(tx, change_idx, change),
                Err(e) => warn!("Skipping malformed map change in {}: {}", self.id, e),
            }
        }
    }

    /// Apply a single parsed change.
    pub fn apply_change(&mut self, tx: &DecodedTransaction, change_idx: usize, change: MapChange) {
        let (key, value) = match change {
            MapChange::Set { key, value } => (key, Some(value)),
            MapChange::Del { key } => (key, None),
        };
        self.ops.entry(key).or_default().push(MapOp {
            tx_id: tx.id.clone(),
            change_idx,
            made_at: tx.made_at,
            value,
        });
    }

    pub fn id(&self) -> CoId {
        self.id
    }

    /// Current value of `key`, if set and not deleted.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.last_op(key)?.value.as_ref()
    }

    /// Value of `key` as of time `t` (ops made at or before `t`).
    pub fn get_at(&self, key: &str, t: i64) -> Option<&Value> {
        self.ops
            .get(key)?
            .iter()
            .rev()
            .find(|op| op.made_at <= t)?
            .value
            .as_ref()
    }

    pub fn last_op(&self, key: &str) -> Option<&MapOp> {
        self.ops.get(key)?.last()
    }

    /// All ops on `key`, oldest first.
    pub fn history(&self, key: &str) -> &[MapOp] {
        self.ops.get(key).map_or(&[][..], Vec::as_slice)
    }

    /// Keys that currently hold a value.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.ops
            .iter()
            .filter(|(_, ops)| ops.last().map_or(false, |op| op.value.is_some()))
            .map(|(key, _)| key.as_str())
    }

    /// Every key ever written, including deleted ones.
    pub fn all_keys(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    /// Current entries.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.ops
            .iter()
            .filter_map(|(key, ops)| Some((key.as_str(), ops.last()?.value.as_ref()?)))
    }

    /// The map as it was at time `t`.
    pub fn at_time(&self, t: i64) -> CoMap {
        let ops = self
            .ops
            .iter()
            .filter_map(|(key, ops)| {
                let kept: Vec<MapOp> = ops.iter().filter(|op| op.made_at <= t).cloned().collect();
                (!kept.is_empty()).then(|| (key.clone(), kept))
            })
            .collect();
        CoMap { id: self.id, ops }
    }

    pub fn to_json(&self) -> Value {
        let object: Map<String, Value> = self
            .entries()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ActorId, SessionId};

    fn tx(session: &SessionId, index: usize, made_at: i64, changes: Vec<Value>) -> DecodedTransaction {
        DecodedTransaction {
            id: TransactionId::new(session.clone(), index),
            author: session.actor(),
            made_at,
            changes: Some(changes),
        }
    }

    fn session(n: u8) -> SessionId {
        SessionId::new_random(&ActorId::Account(CoId([n; 32])))
    }

    #[test]
    fn test_last_writer_wins() {
        let (a, b) = (session(1), session(2));
        let txs = vec![
            tx(&a, 0, 1, vec![MapChange::set("color", json!("red"))]),
            tx(&b, 0, 2, vec![MapChange::set("color", json!("blue"))]),
        ];
        let map = CoMap::from_transactions(CoId([0; 32]), &txs);
        assert_eq!(map.get("color"), Some(&json!("blue")));
        assert_eq!(map.history("color").len(), 2);
    }

    #[test]
    fn test_delete_and_time_travel() {
        let a = session(1);
        let txs = vec![
            tx(&a, 0, 10, vec![MapChange::set("k", json!(1))]),
            tx(&a, 1, 20, vec![MapChange::del("k")]),
        ];
        let map = CoMap::from_transactions(CoId([0; 32]), &txs);
        assert_eq!(map.get("k"), None);
        assert_eq!(map.keys().count(), 0);
        assert_eq!(map.get_at("k", 15), Some(&json!(1)));
        assert_eq!(map.at_time(15).get("k"), Some(&json!(1)));
        assert_eq!(map.get_at("k", 5), None);
    }

    #[test]
    fn test_malformed_change_skipped() {
        let a = session(1);
        let txs = vec![tx(
            &a,
            0,
            1,
            vec![json!({"op": "bogus"}), MapChange::set("ok", json!(true))],
        )];
        let map = CoMap::from_transactions(CoId([0; 32]), &txs);
        assert_eq!(map.to_json(), json!({"ok": true}));
    }
}
