//! SQLite implementation of [`DbClient`].
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite; the async wrapper in [`crate::storage`] keeps it off the runtime
//! threads.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use cosync_core::{CoId, Ed25519Signature, SessionId};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    CoValueRow, DbClient, SessionRow, SessionUpdate, SignatureRow, TransactionRow,
};

/// SQLite-backed row client.
pub struct SqliteClient {
    conn: Connection,
}

impl SqliteClient {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self { conn })
    }
}

fn to_index(value: i64, column: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("negative {} {}", column, value)))
}

fn parse_signature(text: &str) -> Result<Ed25519Signature> {
    text.parse()
        .map_err(|e| StoreError::InvalidData(format!("bad signature {}: {}", text, e)))
}

type RawSession = (i64, i64, String, i64, String, i64);

fn session_from_raw(raw: RawSession) -> Result<Option<SessionRow>> {
    let (row_id, co_value, session_id, last_idx, last_signature, bytes) = raw;
    let session_id = match session_id.parse::<SessionId>() {
        Ok(session_id) => session_id,
        Err(e) => {
            warn!("Skipping stored session with bad id {}: {}", session_id, e);
            return Ok(None);
        }
    };
    Ok(Some(SessionRow {
        row_id,
        co_value,
        session_id,
        last_idx: to_index(last_idx, "lastIdx")?,
        last_signature: parse_signature(&last_signature)?,
        bytes_since_last_signature: to_index(bytes, "bytesSinceLastSignature")?,
    }))
}

fn raw_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok((
        row.get("rowID")?,
        row.get("coValue")?,
        row.get("sessionID")?,
        row.get("lastIdx")?,
        row.get("lastSignature")?,
        row.get("bytesSinceLastSignature")?,
    ))
}

impl DbClient for SqliteClient {
    fn get_co_value(&self, id: &CoId) -> Result<Option<CoValueRow>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT rowID, header FROM coValues WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(row_id, header)| CoValueRow {
            row_id,
            id: *id,
            header,
        }))
    }

    fn get_sessions(&self, co_value: i64) -> Result<Vec<SessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT rowID, coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature
             FROM sessions WHERE coValue = ?1 ORDER BY sessionID",
        )?;
        let raw = stmt
            .query_map(params![co_value], raw_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut sessions = Vec::with_capacity(raw.len());
        for raw in raw {
            if let Some(session) = session_from_raw(raw)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn get_session(&self, co_value: i64, session_id: &SessionId) -> Result<Option<SessionRow>> {
        let raw = self
            .conn
            .query_row(
                "SELECT rowID, coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature
                 FROM sessions WHERE coValue = ?1 AND sessionID = ?2",
                params![co_value, session_id.as_str()],
                raw_session,
            )
            .optional()?;
        match raw {
            Some(raw) => session_from_raw(raw),
            None => Ok(None),
        }
    }

    fn get_transactions(&self, session: i64, from_idx: usize) -> Result<Vec<TransactionRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT idx, tx FROM transactions WHERE ses = ?1 AND idx >= ?2 ORDER BY idx")?;
        let rows = stmt
            .query_map(params![session, from_idx as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(idx, tx)| {
                Ok(TransactionRow {
                    idx: to_index(idx, "idx")?,
                    tx,
                })
            })
            .collect()
    }

    fn get_signatures(&self, session: i64, from_idx: usize) -> Result<Vec<SignatureRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, signature FROM signatureAfter WHERE ses = ?1 AND idx >= ?2 ORDER BY idx",
        )?;
        let rows = stmt
            .query_map(params![session, from_idx as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(idx, signature)| {
                Ok(SignatureRow {
                    idx: to_index(idx, "idx")?,
                    signature: parse_signature(&signature)?,
                })
            })
            .collect()
    }

    fn add_co_value(&mut self, id: &CoId, header: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO coValues (id, header) VALUES (?1, ?2)",
            params![id.to_string(), header],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64> {
        let row_id = self.conn.query_row(
            "INSERT INTO sessions (coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (sessionID, coValue) DO UPDATE SET
                lastIdx = excluded.lastIdx,
                lastSignature = excluded.lastSignature,
                bytesSinceLastSignature = excluded.bytesSinceLastSignature
             RETURNING rowID",
            params![
                update.co_value,
                update.session_id.as_str(),
                update.last_idx as i64,
                update.last_signature.to_string(),
                update.bytes_since_last_signature as i64,
            ],
            |row| row.get(0),
        )?;
        Ok(row_id)
    }

    fn add_transaction(&mut self, session: i64, idx: usize, tx: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)",
            params![session, idx as i64, tx],
        )?;
        Ok(())
    }

    fn add_signature_after(
        &mut self,
        session: i64,
        idx: usize,
        signature: &Ed25519Signature,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)",
            params![session, idx as i64, signature.to_string()],
        )?;
        Ok(())
    }

    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::{ActorId, Keypair};

    fn signature() -> Ed25519Signature {
        Keypair::generate().sign(b"test")
    }

    #[test]
    fn test_co_value_rows() {
        let mut client = SqliteClient::open_memory().unwrap();
        let id = CoId([1; 32]);
        assert!(client.get_co_value(&id).unwrap().is_none());

        let row_id = client.add_co_value(&id, "{}").unwrap();
        let row = client.get_co_value(&id).unwrap().unwrap();
        assert_eq!(row.row_id, row_id);
        assert_eq!(row.header, "{}");
        assert!(client.add_co_value(&id, "{}").is_err());
    }

    #[test]
    fn test_session_upsert_keeps_row_id() {
        let mut client = SqliteClient::open_memory().unwrap();
        let co_value = client.add_co_value(&CoId([1; 32]), "{}").unwrap();
        let session_id = SessionId::new_random(&ActorId::Account(CoId([2; 32])));

        let mut update = SessionUpdate {
            co_value,
            session_id: session_id.clone(),
            last_idx: 2,
            last_signature: signature(),
            bytes_since_last_signature: 10,
        };
        let first = client.add_session_update(&update).unwrap();
        update.last_idx = 5;
        let second = client.add_session_update(&update).unwrap();
        assert_eq!(first, second);

        let stored = client.get_session(co_value, &session_id).unwrap().unwrap();
        assert_eq!(stored.last_idx, 5);
        assert_eq!(client.get_sessions(co_value).unwrap().len(), 1);
    }

    #[test]
    fn test_transactions_and_signatures_in_order() {
        let mut client = SqliteClient::open_memory().unwrap();
        for idx in [2usize, 0, 1] {
            client.add_transaction(7, idx, &format!("tx{idx}")).unwrap();
        }
        client.add_signature_after(7, 1, &signature()).unwrap();

        let rows = client.get_transactions(7, 1).unwrap();
        assert_eq!(rows.iter().map(|r| r.idx).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(client.get_signatures(7, 0).unwrap().len(), 1);
        assert!(client.get_signatures(7, 2).unwrap().is_empty());
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let mut client = SqliteClient::open_memory().unwrap();
        let result: Result<()> = client.transaction(|c| {
            c.add_co_value(&CoId([1; 32]), "{}")?;
            Err(StoreError::InvalidData("boom".into()))
        });
        assert!(result.is_err());
        assert!(client.get_co_value(&CoId([1; 32])).unwrap().is_none());
    }

    #[test]
    fn test_reopen_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cosync.db");
        {
            let mut client = SqliteClient::open(&path).unwrap();
            client.add_co_value(&CoId([3; 32]), "{\"a\":1}").unwrap();
        }
        let client = SqliteClient::open(&path).unwrap();
        assert!(client.get_co_value(&CoId([3; 32])).unwrap().is_some());
    }
}
