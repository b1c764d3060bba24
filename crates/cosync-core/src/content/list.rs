//! CoList: anchor-based ordered list.
//!
//! Every insertion names an anchor: "append after op X" or "prepend before
//! op Y" (or the list's start/end). Appends after the same anchor are
//! ordered newest first, prepends before the same anchor oldest first.
//! The visible order is a depth-first walk: an entry's prepended ops, the
//! entry itself, then its appended ops.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::ids::{CoId, OpId};
use crate::transaction::DecodedTransaction;

/// Where an insertion attaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListAnchor {
    Start,
    End,
    Op(OpId),
}

impl Serialize for ListAnchor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ListAnchor::Start => serializer.serialize_str("start"),
            ListAnchor::End => serializer.serialize_str("end"),
            ListAnchor::Op(op) => op.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ListAnchor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Named(String),
            Op(OpId),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Named(name) if name == "start" => Ok(ListAnchor::Start),
            Raw::Named(name) if name == "end" => Ok(ListAnchor::End),
            Raw::Named(name) => Err(serde::de::Error::custom(format!(
                "unknown list anchor {:?}",
                name
            ))),
            Raw::Op(op) => Ok(ListAnchor::Op(op)),
        }
    }
}

/// A change to a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ListChange {
    #[serde(rename = "app")]
    Append { value: Value, after: ListAnchor },
    #[serde(rename = "pre")]
    Prepend { value: Value, before: ListAnchor },
    #[serde(rename = "del")]
    Delete { insertion: OpId },
}

impl ListChange {
    fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| CoreError::EncodingError(e.to_string()))
    }
}

#[derive(Debug, Clone)]
struct Insertion {
    value: Value,
    made_at: i64,
    predecessors: Vec<OpId>,
    successors: Vec<OpId>,
}

/// A visible list entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub op_id: OpId,
    pub value: Value,
    pub made_at: i64,
}

/// Merged view of a list.
#[derive(Debug, Clone)]
pub struct CoList {
    id: CoId,
    insertions: BTreeMap<OpId, Insertion>,
    after_start: Vec<OpId>,
    before_end: Vec<OpId>,
    deleted: BTreeSet<OpId>,
    entries: Vec<ListEntry>,
}

impl CoList {
    /// Build from valid transactions in merge order.
    pub fn from_transactions(id: CoId, transactions: &[DecodedTransaction]) -> Self {
        let mut list = Self {
            id,
            insertions: BTreeMap::new(),
            after_start: Vec::new(),
            before_end: Vec::new(),
            deleted: BTreeSet::new(),
            entries: Vec::new(),
        };
        for tx in transactions {
            let Some(changes) = &tx.changes else {
                continue;
            };
            for (change_idx, raw) in changes.iter().enumerate() {
                match serde_json::from_value::<ListChange>(raw.clone()) {
                    Ok(change) => list.apply(OpId::new(&tx.id, change_idx), tx.made_at, change),
                    Err(e) => warn!("Skipping malformed list change in {}: {}", id, e),
                }
            }
        }
        list.entries = list.walk();
        list
    }

    fn apply(&mut self, op_id: OpId, made_at: i64, change: ListChange) {
        match change {
            ListChange::Append { value, after } => {
                match after {
                    ListAnchor::Start => self.after_start.insert(0, op_id.clone()),
                    ListAnchor::Op(anchor) => match self.insertions.get_mut(&anchor) {
                        Some(entry) => entry.successors.insert(0, op_id.clone()),
                        None => {
                            warn!("Append after unknown op {:?} in {}", anchor, self.id);
                            return;
                        }
                    },
                    ListAnchor::End => {
                        warn!("Append after end in {}", self.id);
                        return;
                    }
                }
                self.insertions.insert(op_id, Insertion::new(value, made_at));
            }
            ListChange::Prepend { value, before } => {
                match before {
                    ListAnchor::End => self.before_end.push(op_id.clone()),
                    ListAnchor::Op(anchor) => match self.insertions.get_mut(&anchor) {
                        Some(entry) => entry.predecessors.push(op_id.clone()),
                        None => {
                            warn!("Prepend before unknown op {:?} in {}", anchor, self.id);
                            return;
                        }
                    },
                    ListAnchor::Start => {
                        warn!("Prepend before start in {}", self.id);
                        return;
                    }
                }
                self.insertions.insert(op_id, Insertion::new(value, made_at));
            }
            ListChange::Delete { insertion } => {
                self.deleted.insert(insertion);
            }
        }
    }

    /// Iterative depth-first walk: predecessors, the entry, successors.
    fn walk(&self) -> Vec<ListEntry> {
        enum Step<'a> {
            Visit(&'a OpId),
            Emit(&'a OpId),
        }

        let mut out = Vec::new();
        let mut stack: Vec<Step<'_>> = self
            .after_start
            .iter()
            .chain(self.before_end.iter())
            .rev()
            .map(Step::Visit)
            .collect();

        while let Some(step) = stack.pop() {
            match step {
                Step::Visit(op) => {
                    let Some(entry) = self.insertions.get(op) else {
                        continue;
                    };
                    stack.extend(entry.successors.iter().rev().map(Step::Visit));
                    stack.push(Step::Emit(op));
                    stack.extend(entry.predecessors.iter().rev().map(Step::Visit));
                }
                Step::Emit(op) => {
                    if self.deleted.contains(op) {
                        continue;
                    }
                    if let Some(entry) = self.insertions.get(op) {
                        out.push(ListEntry {
                            op_id: op.clone(),
                            value: entry.value.clone(),
                            made_at: entry.made_at,
                        });
                    }
                }
            }
        }
        out
    }

    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn entries(&self) -> &[ListEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.entries.get(index).map(|e| &e.value)
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|e| e.value.clone()).collect()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.values())
    }

    /// Change inserting `value` after the entry at `after`.
    ///
    /// On an empty list `after` must be 0 and the item goes at the start.
    pub fn append_change(&self, value: Value, after: usize) -> Result<Value> {
        let anchor = if self.entries.is_empty() {
            if after != 0 {
                return Err(self.invalid_position(after));
            }
            ListAnchor::Start
        } else {
            ListAnchor::Op(self.op_at(after)?)
        };
        ListChange::Append {
            value,
            after: anchor,
        }
        .to_value()
    }

    /// Change adding `value` at the end of the list.
    pub fn push_change(&self, value: Value) -> Result<Value> {
        self.append_change(value, self.entries.len().saturating_sub(1))
    }

    /// Change inserting `value` before the entry at `before`.
    ///
    /// On an empty list `before` must be 0 and the item goes at the end.
    pub fn prepend_change(&self, value: Value, before: usize) -> Result<Value> {
        let anchor = if self.entries.is_empty() {
            if before != 0 {
                return Err(self.invalid_position(before));
            }
            ListAnchor::End
        } else {
            ListAnchor::Op(self.op_at(before)?)
        };
        ListChange::Prepend {
            value,
            before: anchor,
        }
        .to_value()
    }

    /// Change removing the entry at `index`.
    pub fn delete_change(&self, index: usize) -> Result<Value> {
        ListChange::Delete {
            insertion: self.op_at(index)?,
        }
        .to_value()
    }

    /// Changes replacing the entry at `index`: insert after it, then delete it.
    pub fn replace_changes(&self, index: usize, value: Value) -> Result<Vec<Value>> {
        Ok(vec![
            self.append_change(value, index)?,
            self.delete_change(index)?,
        ])
    }

    fn op_at(&self, index: usize) -> Result<OpId> {
        self.entries
            .get(index)
            .map(|e| e.op_id.clone())
            .ok_or_else(|| self.invalid_position(index))
    }

    fn invalid_position(&self, index: usize) -> CoreError {
        CoreError::InvalidPosition {
            index,
            len: self.entries.len(),
        }
    }
}

impl Insertion {
    fn new(value: Value, made_at: i64) -> Self {
        Self {
            value,
            made_at,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }
}
