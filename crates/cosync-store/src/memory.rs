//! In-memory implementation of [`DbClient`].
//!
//! Same semantics as SQLite, nothing persisted. Used in tests and by nodes
//! that only cache.

use std::collections::{BTreeMap, HashMap};

use cosync_core::{CoId, Ed25519Signature, SessionId};

use crate::error::{Result, StoreError};
use crate::traits::{
    CoValueRow, DbClient, SessionRow, SessionUpdate, SignatureRow, TransactionRow,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    co_values: HashMap<CoId, CoValueRow>,
    sessions: BTreeMap<i64, SessionRow>,
    transactions: BTreeMap<(i64, usize), String>,
    signatures: BTreeMap<(i64, usize), Ed25519Signature>,
    next_row_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_row_id += 1;
        self.next_row_id
    }
}

/// In-memory row client.
#[derive(Debug, Default)]
pub struct MemoryClient {
    tables: Tables,
}

impl MemoryClient {
    /// Create a new empty client.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryClient {
    /// Replace a stored transaction row as-is.
    pub(crate) fn overwrite_transaction(&mut self, session: i64, idx: usize, tx: &str) {
        self.tables.transactions.insert((session, idx), tx.to_string());
    }

    pub(crate) fn remove_transaction(&mut self, session: i64, idx: usize) {
        self.tables.transactions.remove(&(session, idx));
    }
}

impl DbClient for MemoryClient {
    fn get_co_value(&self, id: &CoId) -> Result<Option<CoValueRow>> {
        Ok(self.tables.co_values.get(id).cloned())
    }

    fn get_sessions(&self, co_value: i64) -> Result<Vec<SessionRow>> {
        let mut sessions: Vec<SessionRow> = self
            .tables
            .sessions
            .values()
            .filter(|s| s.co_value == co_value)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    fn get_session(&self, co_value: i64, session_id: &SessionId) -> Result<Option<SessionRow>> {
        Ok(self
            .tables
            .sessions
            .values()
            .find(|s| s.co_value == co_value && s.session_id == *session_id)
            .cloned())
    }

    fn get_transactions(&self, session: i64, from_idx: usize) -> Result<Vec<TransactionRow>> {
        Ok(self
            .tables
            .transactions
            .range((session, from_idx)..(session, usize::MAX))
            .map(|(&(_, idx), tx)| TransactionRow {
                idx,
                tx: tx.clone(),
            })
            .collect())
    }

    fn get_signatures(&self, session: i64, from_idx: usize) -> Result<Vec<SignatureRow>> {
        Ok(self
            .tables
            .signatures
            .range((session, from_idx)..(session, usize::MAX))
            .map(|(&(_, idx), signature)| SignatureRow {
                idx,
                signature: *signature,
            })
            .collect())
    }

    fn add_co_value(&mut self, id: &CoId, header: &str) -> Result<i64> {
        if self.tables.co_values.contains_key(id) {
            return Err(StoreError::InvalidData(format!("{} already stored", id)));
        }
        let row_id = self.tables.next_id();
        self.tables.co_values.insert(
            *id,
            CoValueRow {
                row_id,
                id: *id,
                header: header.to_string(),
            },
        );
        Ok(row_id)
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64> {
        let existing = self
            .tables
            .sessions
            .values()
            .find(|s| s.co_value == update.co_value && s.session_id == update.session_id)
            .map(|s| s.row_id);
        let row_id = match existing {
            Some(row_id) => row_id,
            None => self.tables.next_id(),
        };
        self.tables.sessions.insert(
            row_id,
            SessionRow {
                row_id,
                co_value: update.co_value,
                session_id: update.session_id.clone(),
                last_idx: update.last_idx,
                last_signature: update.last_signature,
                bytes_since_last_signature: update.bytes_since_last_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session: i64, idx: usize, tx: &str) -> Result<()> {
        if self.tables.transactions.contains_key(&(session, idx)) {
            return Err(StoreError::InvalidData(format!(
                "transaction {} of session row {} already stored",
                idx, session
            )));
        }
        self.tables.transactions.insert((session, idx), tx.to_string());
        Ok(())
    }

    fn add_signature_after(
        &mut self,
        session: i64,
        idx: usize,
        signature: &Ed25519Signature,
    ) -> Result<()> {
        self.tables.signatures.insert((session, idx), *signature);
        Ok(())
    }

    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let snapshot = self.tables.clone();
        let result = f(self);
        if result.is_err() {
            self.tables = snapshot;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_transaction_restores_tables() {
        let mut client = MemoryClient::new();
        client.add_co_value(&CoId([1; 32]), "{}").unwrap();

        let result: Result<()> = client.transaction(|c| {
            c.add_co_value(&CoId([2; 32]), "{}")?;
            c.add_co_value(&CoId([1; 32]), "{}")?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(client.get_co_value(&CoId([2; 32])).unwrap().is_none());
        assert!(client.get_co_value(&CoId([1; 32])).unwrap().is_some());
    }

    #[test]
    fn test_duplicate_transaction_rejected() {
        let mut client = MemoryClient::new();
        client.add_transaction(1, 0, "a").unwrap();
        assert!(client.add_transaction(1, 0, "b").is_err());
        assert_eq!(client.get_transactions(1, 0).unwrap()[0].tx, "a");
    }
}
