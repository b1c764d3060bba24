//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::Value;

use cosync_core::{AgentSecret, CoList, MapChange};

/// Generate an agent from random seeds.
pub fn agent() -> impl Strategy<Value = AgentSecret> {
    (any::<[u8; 32]>(), any::<[u8; 32]>())
        .prop_map(|(signer, sealer)| AgentSecret::from_seeds(&signer, sealer))
}

/// Generate a small JSON scalar.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ]
}

/// Generate a map key from a small set, so edits collide.
pub fn map_key() -> impl Strategy<Value = String> {
    "[a-d]".prop_map(String::from)
}

/// One map edit.
#[derive(Debug, Clone, PartialEq)]
pub enum MapOp {
    Set(String, Value),
    Delete(String),
}

impl MapOp {
    pub fn to_change(&self) -> Value {
        match self {
            MapOp::Set(key, value) => MapChange::set(key.clone(), value.clone()),
            MapOp::Delete(key) => MapChange::del(key.clone()),
        }
    }
}

pub fn map_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        3 => (map_key(), json_scalar()).prop_map(|(k, v)| MapOp::Set(k, v)),
        1 => map_key().prop_map(MapOp::Delete),
    ]
}

pub fn map_ops(max_len: usize) -> impl Strategy<Value = Vec<MapOp>> {
    prop::collection::vec(map_op(), 0..=max_len)
}

/// One list edit. Positions are taken modulo the list length when applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ListOp {
    Push(Value),
    /// Insert after the item at the position.
    Insert(usize, Value),
    /// Insert before the item at the position.
    Prepend(usize, Value),
    Delete(usize),
    Replace(usize, Value),
}

impl ListOp {
    /// Changes performing this edit on `list`; empty when the edit needs an
    /// item and the list has none.
    pub fn to_changes(&self, list: &CoList) -> cosync_core::Result<Vec<Value>> {
        let len = list.len();
        let at = |pos: usize| if len == 0 { 0 } else { pos % len };
        Ok(match self {
            ListOp::Push(value) => vec![list.push_change(value.clone())?],
            ListOp::Insert(pos, value) => vec![list.append_change(value.clone(), at(*pos))?],
            ListOp::Prepend(pos, value) => vec![list.prepend_change(value.clone(), at(*pos))?],
            ListOp::Delete(_) | ListOp::Replace(..) if len == 0 => Vec::new(),
            ListOp::Delete(pos) => vec![list.delete_change(at(*pos))?],
            ListOp::Replace(pos, value) => list.replace_changes(at(*pos), value.clone())?,
        })
    }

    /// Perform this edit on a plain vector, the way `to_changes` does on a
    /// list.
    pub fn apply_to(&self, model: &mut Vec<Value>) {
        let len = model.len();
        let at = |pos: usize| if len == 0 { 0 } else { pos % len };
        match self {
            ListOp::Push(value) => model.push(value.clone()),
            ListOp::Insert(_, value) if len == 0 => model.push(value.clone()),
            ListOp::Insert(pos, value) => model.insert(at(*pos) + 1, value.clone()),
            ListOp::Prepend(pos, value) => model.insert(at(*pos), value.clone()),
            ListOp::Delete(_) | ListOp::Replace(..) if len == 0 => {}
            ListOp::Delete(pos) => {
                model.remove(at(*pos));
            }
            ListOp::Replace(pos, value) => model[at(*pos)] = value.clone(),
        }
    }
}

pub fn list_op() -> impl Strategy<Value = ListOp> {
    let pos = 0usize..16;
    prop_oneof![
        3 => json_scalar().prop_map(ListOp::Push),
        2 => (pos.clone(), json_scalar()).prop_map(|(p, v)| ListOp::Insert(p, v)),
        2 => (pos.clone(), json_scalar()).prop_map(|(p, v)| ListOp::Prepend(p, v)),
        2 => pos.clone().prop_map(ListOp::Delete),
        1 => (pos, json_scalar()).prop_map(|(p, v)| ListOp::Replace(p, v)),
    ]
}

pub fn list_ops(max_len: usize) -> impl Strategy<Value = Vec<ListOp>> {
    prop::collection::vec(list_op(), 0..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{content_json, content_of, open_core, replica_of, signers_of, TestAuthor};
    use cosync_core::CoValueType;
    use cosync_sync::apply_content;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_list_edits_match_vector_model(ops in list_ops(24)) {
            let author = TestAuthor::new();
            let mut core = open_core(CoValueType::List).unwrap();
            let mut model = Vec::new();

            for (i, op) in ops.iter().enumerate() {
                let content = content_of(&core);
                let list = content.as_list().unwrap();
                let changes = op.to_changes(list).unwrap();
                if !changes.is_empty() {
                    author.write(&mut core, &changes, i as i64 + 1).unwrap();
                }
                op.apply_to(&mut model);
            }

            prop_assert_eq!(content_json(&core), Value::Array(model));
        }

        #[test]
        fn test_concurrent_map_edits_merge_in_any_order(
            ops_a in map_ops(12),
            ops_b in map_ops(12),
        ) {
            let a = TestAuthor::with_seed(1);
            let b = TestAuthor::with_seed(2);
            let mut core_a = open_core(CoValueType::Map).unwrap();
            let mut core_b = replica_of(&core_a).unwrap();
            for (i, op) in ops_a.iter().enumerate() {
                a.write(&mut core_a, &[op.to_change()], i as i64).unwrap();
            }
            for (i, op) in ops_b.iter().enumerate() {
                b.write(&mut core_b, &[op.to_change()], i as i64).unwrap();
            }

            let signers = signers_of(&[a, b]);
            let from_a = core_a.new_content_since(None);
            let from_b = core_b.new_content_since(None);

            let mut ab = replica_of(&core_a).unwrap();
            for msg in from_a.iter().chain(from_b.iter()) {
                apply_content(&mut ab, msg, &signers);
            }
            let mut ba = replica_of(&core_a).unwrap();
            for msg in from_b.iter().chain(from_a.iter()) {
                apply_content(&mut ba, msg, &signers);
            }

            prop_assert_eq!(ab.known_state(), ba.known_state());
            prop_assert_eq!(content_json(&ab), content_json(&ba));
        }
    }
}
