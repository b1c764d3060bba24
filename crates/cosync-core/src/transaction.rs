//! Transactions: the unit of append in a session log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cipher::{EncryptionNonce, KeyId, KeySecret};
use crate::error::{CoreError, Result};
use crate::ids::{ActorId, CoId, TransactionId};

/// Whether a transaction's changes are readable by anyone holding the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    Trusting,
    Private,
}

/// One signed batch of changes made by a session at a point in time.
///
/// `changes` is the JSON text of an array of change objects. Private
/// transactions carry that text encrypted under a group read key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy")]
pub enum Transaction {
    #[serde(rename = "trusting", rename_all = "camelCase")]
    Trusting { made_at: i64, changes: String },
    #[serde(rename = "private", rename_all = "camelCase")]
    Private {
        made_at: i64,
        key_used: KeyId,
        encrypted_changes: String,
    },
}

impl Transaction {
    /// A trusting transaction over `changes`.
    pub fn trusting(made_at: i64, changes: &[Value]) -> Result<Self> {
        Ok(Transaction::Trusting {
            made_at,
            changes: encode_changes(changes)?,
        })
    }

    /// A private transaction, encrypted for position `tx_id` of `co_id`.
    pub fn private(
        made_at: i64,
        changes: &[Value],
        key: &KeySecret,
        co_id: &CoId,
        tx_id: &TransactionId,
    ) -> Result<Self> {
        let nonce = EncryptionNonce::for_transaction(co_id, &tx_id.session_id, tx_id.tx_index);
        Ok(Transaction::Private {
            made_at,
            key_used: key.id(),
            encrypted_changes: key.encrypt_changes(&encode_changes(changes)?, &nonce)?,
        })
    }

    pub fn made_at(&self) -> i64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
                *made_at
            }
        }
    }

    pub fn privacy(&self) -> Privacy {
        match self {
            Transaction::Trusting { .. } => Privacy::Trusting,
            Transaction::Private { .. } => Privacy::Private,
        }
    }

    /// Size of the (possibly encrypted) change payload.
    pub fn payload_size(&self) -> usize {
        match self {
            Transaction::Trusting { changes, .. } => changes.len(),
            Transaction::Private {
                encrypted_changes, ..
            } => encrypted_changes.len(),
        }
    }

    pub fn key_used(&self) -> Option<KeyId> {
        match self {
            Transaction::Trusting { .. } => None,
            Transaction::Private { key_used, .. } => Some(*key_used),
        }
    }

    /// JSON bytes fed into the session hash chain.
    pub fn hash_input(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::EncodingError(e.to_string()))
    }

    /// Parse the change list of a trusting transaction.
    pub fn trusting_changes(&self) -> Option<Result<Vec<Value>>> {
        match self {
            Transaction::Trusting { changes, .. } => Some(decode_changes(changes)),
            Transaction::Private { .. } => None,
        }
    }

    /// Decrypt and parse the change list of a private transaction.
    pub fn decrypt_changes(
        &self,
        key: &KeySecret,
        co_id: &CoId,
        tx_id: &TransactionId,
    ) -> Result<Vec<Value>> {
        match self {
            Transaction::Trusting { changes, .. } => decode_changes(changes),
            Transaction::Private {
                encrypted_changes, ..
            } => {
                let nonce =
                    EncryptionNonce::for_transaction(co_id, &tx_id.session_id, tx_id.tx_index);
                decode_changes(&key.decrypt_changes(encrypted_changes, &nonce)?)
            }
        }
    }
}

fn encode_changes(changes: &[Value]) -> Result<String> {
    serde_json::to_string(changes).map_err(|e| CoreError::EncodingError(e.to_string()))
}

fn decode_changes(text: &str) -> Result<Vec<Value>> {
    Ok(serde_json::from_str(text)?)
}

/// A transaction after decoding, in merge order.
///
/// `changes` is `None` for private transactions whose key is not
/// available to this agent: they still count for validity, but contribute
/// nothing to the merged view.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTransaction {
    pub id: TransactionId,
    pub author: ActorId,
    pub made_at: i64,
    pub changes: Option<Vec<Value>>,
}

impl DecodedTransaction {
    /// The merge order key: (madeAt, session, index).
    pub fn order_key(&self) -> (i64, &str, usize) {
        (self.made_at, self.id.session_id.as_str(), self.id.tx_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;
    use serde_json::json;

    #[test]
    fn test_trusting_json_shape() {
        let tx = Transaction::trusting(42, &[json!({"op": "set", "key": "a", "value": 1})]).unwrap();
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["privacy"], "trusting");
        assert_eq!(value["madeAt"], 42);
        assert_eq!(
            value["changes"],
            r#"[{"key":"a","op":"set","value":1}]"#
        );
    }

    #[test]
    fn test_private_roundtrip() {
        let key = KeySecret::generate();
        let co_id = CoId([9; 32]);
        let session = SessionId::new_random(&ActorId::Account(CoId([1; 32])));
        let tx_id = TransactionId::new(session, 0);

        let changes = vec![json!({"op": "set", "key": "secret", "value": true})];
        let tx = Transaction::private(7, &changes, &key, &co_id, &tx_id).unwrap();

        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["privacy"], "private");
        assert_eq!(value["keyUsed"], key.id().to_string());
        assert!(value["encryptedChanges"]
            .as_str()
            .unwrap()
            .starts_with("encrypted_U"));

        assert_eq!(tx.decrypt_changes(&key, &co_id, &tx_id).unwrap(), changes);
        assert!(tx
            .decrypt_changes(&KeySecret::generate(), &co_id, &tx_id)
            .is_err());
    }

    #[test]
    fn test_malformed_changes_error() {
        let tx = Transaction::Trusting {
            made_at: 0,
            changes: "not json".into(),
        };
        assert!(tx.trusting_changes().unwrap().is_err());
    }
}
