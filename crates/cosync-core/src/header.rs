//! CoValue headers and rulesets.
//!
//! A header is immutable and its JSON encoding is hashed into the CoId, so
//! field order and encoding here are part of the identity of every value.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ActorId, CoId};

/// The merge semantics of a CoValue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoValueType {
    #[serde(rename = "comap")]
    Map,
    #[serde(rename = "colist")]
    List,
    #[serde(rename = "costream")]
    Stream,
    #[serde(rename = "binarycostream")]
    BinaryStream,
}

/// Decides which transactions of a CoValue are valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Ruleset {
    /// The value is a group; the initial admin may bootstrap its own role.
    #[serde(rename = "group")]
    Group {
        #[serde(rename = "initialAdmin")]
        initial_admin: ActorId,
    },
    /// Write access follows the owning group's roles.
    #[serde(rename = "ownedByGroup")]
    OwnedByGroup { group: CoId },
    /// Every correctly signed transaction is valid.
    #[serde(rename = "unsafeAllowAll")]
    UnsafeAllowAll,
}

/// Makes otherwise identical headers distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Uniqueness {
    Text(String),
    Number(i64),
    /// Deterministic headers (same inputs, same id).
    None,
}

impl Uniqueness {
    /// A random uniqueness value.
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Uniqueness::Text(format!("z{}", hex::encode(bytes)))
    }
}

/// Immutable description of a CoValue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub value_type: CoValueType,
    pub ruleset: Ruleset,
    pub meta: Option<Value>,
    pub uniqueness: Uniqueness,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl CoValueHeader {
    /// A header with random uniqueness.
    pub fn new(value_type: CoValueType, ruleset: Ruleset, meta: Option<Value>) -> Self {
        Self {
            value_type,
            ruleset,
            meta,
            uniqueness: Uniqueness::random(),
            created_at: None,
        }
    }

    /// Value of `meta.type`, if any.
    pub fn meta_type(&self) -> Option<&str> {
        self.meta.as_ref()?.get("type")?.as_str()
    }

    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    /// Accounts are groups tagged with `meta.type = "account"`.
    pub fn is_account(&self) -> bool {
        self.is_group() && self.meta_type() == Some("account")
    }

    /// The owning group, for owned values.
    pub fn owner(&self) -> Option<CoId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(*group),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use serde_json::json;

    #[test]
    fn test_header_json_shape() {
        let header = CoValueHeader {
            value_type: CoValueType::Map,
            ruleset: Ruleset::OwnedByGroup {
                group: CoId([1; 32]),
            },
            meta: None,
            uniqueness: Uniqueness::Text("zabc".into()),
            created_at: None,
        };
        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(value["type"], "comap");
        assert_eq!(value["ruleset"]["type"], "ownedByGroup");
        assert_eq!(value["ruleset"]["group"], CoId([1; 32]).to_string());
        assert_eq!(value["uniqueness"], "zabc");
        assert!(value.get("createdAt").is_none());
    }

    #[test]
    fn test_same_header_same_id() {
        let agent = AgentSecret::generate().id();
        let header = CoValueHeader {
            value_type: CoValueType::Map,
            ruleset: Ruleset::Group {
                initial_admin: ActorId::Agent(agent),
            },
            meta: Some(json!({"type": "account"})),
            uniqueness: Uniqueness::None,
            created_at: None,
        };
        assert_eq!(
            CoId::from_header(&header).unwrap(),
            CoId::from_header(&header.clone()).unwrap()
        );
        assert!(header.is_account());
    }

    #[test]
    fn test_random_uniqueness_distinguishes() {
        let a = CoValueHeader::new(CoValueType::List, Ruleset::UnsafeAllowAll, None);
        let b = CoValueHeader::new(CoValueType::List, Ruleset::UnsafeAllowAll, None);
        assert_ne!(CoId::from_header(&a).unwrap(), CoId::from_header(&b).unwrap());
    }

    #[test]
    fn test_header_roundtrip_through_json() {
        let header = CoValueHeader::new(
            CoValueType::BinaryStream,
            Ruleset::UnsafeAllowAll,
            Some(json!({"type": "binary"})),
        );
        let text = serde_json::to_string(&header).unwrap();
        let parsed: CoValueHeader = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, header);
    }
}
