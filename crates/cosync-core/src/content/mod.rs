//! Merged views over valid transactions.
//!
//! Views are pure functions of the ordered valid transactions, so every
//! replica holding the same transactions computes the same view.

pub mod binary;
pub mod list;
pub mod map;
pub mod stream;

use serde_json::Value;

pub use binary::{BinaryCoStream, BinaryStreamInfo, BinaryStreamItem};
pub use list::{CoList, ListAnchor, ListChange, ListEntry};
pub use map::{CoMap, MapChange, MapOp};
pub use stream::{CoStream, StreamItem};

use crate::header::{CoValueHeader, CoValueType};
use crate::ids::CoId;
use crate::transaction::DecodedTransaction;

/// The merged content of a CoValue, by type.
#[derive(Debug, Clone)]
pub enum CoValueContent {
    Map(CoMap),
    List(CoList),
    Stream(CoStream),
    BinaryStream(BinaryCoStream),
}

impl CoValueContent {
    /// Build the view for `header`'s type from valid transactions in merge order.
    pub fn build(id: CoId, header: &CoValueHeader, transactions: &[DecodedTransaction]) -> Self {
        match header.value_type {
            CoValueType::Map => CoValueContent::Map(CoMap::from_transactions(id, transactions)),
            CoValueType::List => CoValueContent::List(CoList::from_transactions(id, transactions)),
            CoValueType::Stream => {
                CoValueContent::Stream(CoStream::from_transactions(id, transactions))
            }
            CoValueType::BinaryStream => {
                CoValueContent::BinaryStream(BinaryCoStream::from_transactions(id, transactions))
            }
        }
    }

    pub fn as_map(&self) -> Option<&CoMap> {
        match self {
            CoValueContent::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&CoList> {
        match self {
            CoValueContent::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&CoStream> {
        match self {
            CoValueContent::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_binary_stream(&self) -> Option<&BinaryCoStream> {
        match self {
            CoValueContent::BinaryStream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Plain JSON rendering of the current state.
    pub fn to_json(&self) -> Value {
        match self {
            CoValueContent::Map(map) => map.to_json(),
            CoValueContent::List(list) => list.to_json(),
            CoValueContent::Stream(stream) => stream.to_json(),
            CoValueContent::BinaryStream(stream) => stream.stream().to_json(),
        }
    }
}
