//! Session logs: append-only, hash-chained, signed.
//!
//! Each session is written by exactly one actor. The log keeps a streaming
//! Blake3 hash `h_n = H(h_{n-1} || json(tx_n))`; every batch of appended
//! transactions comes with a signature over the new `h_n`. Once more than
//! `max_tx_size` payload bytes accumulate since the last checkpoint, the
//! batch's signature is kept as a checkpoint so the log can later be handed
//! out in independently verifiable pieces.

use std::collections::BTreeMap;

use crate::crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::{CoreError, Result};
use crate::ids::SessionId;
use crate::message::SessionContent;
use crate::transaction::Transaction;

/// One session's transactions and signature state.
#[derive(Debug, Clone)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    last_hash: Blake3Hash,
    last_signature: Option<Ed25519Signature>,
    /// Checkpoint signatures keyed by the index of the last transaction they cover.
    signature_after: BTreeMap<usize, Ed25519Signature>,
    bytes_since_signature: usize,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLog {
    pub fn new() -> Self {
        Self {
            transactions: Vec::new(),
            last_hash: Blake3Hash::ZERO,
            last_signature: None,
            signature_after: BTreeMap::new(),
            bytes_since_signature: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn last_signature(&self) -> Option<Ed25519Signature> {
        self.last_signature
    }

    pub fn last_hash(&self) -> Blake3Hash {
        self.last_hash
    }

    pub fn signature_checkpoints(&self) -> &BTreeMap<usize, Ed25519Signature> {
        &self.signature_after
    }

    /// The hash the log would have after appending `new`.
    pub fn expected_hash_after(&self, new: &[Transaction]) -> Result<Blake3Hash> {
        let mut hash = self.last_hash;
        for tx in new {
            hash = hash.chain(&tx.hash_input()?);
        }
        Ok(hash)
    }

    /// Append transactions received from elsewhere.
    ///
    /// `after` is the index of `transactions[0]`. Transactions already held
    /// are skipped, so re-delivery is harmless. A start beyond the local
    /// length is a [`CoreError::Gap`]. The signature must verify against the
    /// hash after the whole batch; on failure nothing is appended.
    ///
    /// Returns the number of transactions actually appended.
    pub fn try_add(
        &mut self,
        session: &SessionId,
        after: usize,
        transactions: &[Transaction],
        signature: &Ed25519Signature,
        signer: &Ed25519PublicKey,
        max_tx_size: usize,
    ) -> Result<usize> {
        let local = self.transactions.len();
        if after > local {
            return Err(CoreError::Gap {
                session: session.clone(),
                local,
                after,
            });
        }

        let already_held = local - after;
        if already_held >= transactions.len() {
            return Ok(0);
        }

        // The signature covers the chain through the end of the batch, so the
        // overlapping prefix must match what we hold.
        for (offset, tx) in transactions[..already_held].iter().enumerate() {
            if &self.transactions[after + offset] != tx {
                return Err(CoreError::InvalidSignature);
            }
        }

        let new = &transactions[already_held..];
        let hash = self.expected_hash_after(new)?;
        signer.verify(hash.as_bytes(), signature)?;

        self.append_verified(new, hash, *signature, max_tx_size);
        Ok(new.len())
    }

    /// Append one locally made transaction, signing the new hash.
    pub fn add_local(
        &mut self,
        transaction: Transaction,
        keypair: &Keypair,
        max_tx_size: usize,
    ) -> Result<Ed25519Signature> {
        let batch = [transaction];
        let hash = self.expected_hash_after(&batch)?;
        let signature = keypair.sign(hash.as_bytes());
        self.append_verified(&batch, hash, signature, max_tx_size);
        Ok(signature)
    }

    fn append_verified(
        &mut self,
        new: &[Transaction],
        hash: Blake3Hash,
        signature: Ed25519Signature,
        max_tx_size: usize,
    ) {
        self.bytes_since_signature += new.iter().map(Transaction::payload_size).sum::<usize>();
        self.transactions.extend_from_slice(new);
        self.last_hash = hash;
        self.last_signature = Some(signature);

        if self.bytes_since_signature > max_tx_size {
            self.signature_after
                .insert(self.transactions.len() - 1, signature);
            self.bytes_since_signature = 0;
        }
    }

    /// Transactions from index `from` on, split at checkpoints.
    ///
    /// Every piece ends either at a checkpoint or at the end of the log and
    /// carries the signature valid at that point.
    pub fn content_since(&self, from: usize) -> Vec<SessionContent> {
        let Some(last_signature) = self.last_signature else {
            return Vec::new();
        };
        let len = self.transactions.len();
        if from >= len {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        let mut start = from;
        for (&end, signature) in self.signature_after.range(from..) {
            pieces.push(SessionContent {
                after: start,
                new_transactions: self.transactions[start..=end].to_vec(),
                last_signature: *signature,
            });
            start = end + 1;
        }
        if start < len {
            pieces.push(SessionContent {
                after: start,
                new_transactions: self.transactions[start..].to_vec(),
                last_signature,
            });
        }
        pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ActorId, CoId};
    use serde_json::json;

    fn session() -> SessionId {
        SessionId::new_random(&ActorId::Account(CoId([5; 32])))
    }

    fn tx(n: i64) -> Transaction {
        Transaction::trusting(n, &[json!({"op": "set", "key": "k", "value": n})]).unwrap()
    }

    fn signed_batch(keypair: &Keypair, txs: &[Transaction]) -> (Ed25519Signature, SessionLog) {
        let mut log = SessionLog::new();
        let mut sig = None;
        for t in txs {
            sig = Some(log.add_local(t.clone(), keypair, usize::MAX).unwrap());
        }
        (sig.unwrap(), log)
    }

    #[test]
    fn test_add_verified_batch() {
        let keypair = Keypair::generate();
        let txs = vec![tx(1), tx(2), tx(3)];
        let (sig, _) = signed_batch(&keypair, &txs);

        let mut log = SessionLog::new();
        let added = log
            .try_add(&session(), 0, &txs, &sig, &keypair.public_key(), usize::MAX)
            .unwrap();
        assert_eq!(added, 3);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_overlap_is_trimmed() {
        let keypair = Keypair::generate();
        let txs = vec![tx(1), tx(2), tx(3)];
        let (sig, _) = signed_batch(&keypair, &txs);
        let (sig_one, _) = signed_batch(&keypair, &txs[..1]);

        let s = session();
        let mut log = SessionLog::new();
        log.try_add(&s, 0, &txs[..1], &sig_one, &keypair.public_key(), usize::MAX)
            .unwrap();

        let added = log
            .try_add(&s, 0, &txs, &sig, &keypair.public_key(), usize::MAX)
            .unwrap();
        assert_eq!(added, 2);

        let again = log
            .try_add(&s, 0, &txs, &sig, &keypair.public_key(), usize::MAX)
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_gap_rejected() {
        let keypair = Keypair::generate();
        let txs = vec![tx(1)];
        let (sig, _) = signed_batch(&keypair, &txs);

        let mut log = SessionLog::new();
        let err = log
            .try_add(&session(), 2, &txs, &sig, &keypair.public_key(), usize::MAX)
            .unwrap_err();
        assert!(matches!(err, CoreError::Gap { local: 0, after: 2, .. }));
    }

    #[test]
    fn test_bad_signature_leaves_log_unchanged() {
        let keypair = Keypair::generate();
        let txs = vec![tx(1), tx(2)];
        let (sig, _) = signed_batch(&keypair, &txs);

        let mut log = SessionLog::new();
        let err = log
            .try_add(
                &session(),
                0,
                &txs,
                &sig,
                &Keypair::generate().public_key(),
                usize::MAX,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSignature));
        assert!(log.is_empty());
    }

    #[test]
    fn test_tampered_transaction_rejected() {
        let keypair = Keypair::generate();
        let txs = vec![tx(1), tx(2)];
        let (sig, _) = signed_batch(&keypair, &txs);

        let mut tampered = txs.clone();
        tampered[1] = tx(99);

        let mut log = SessionLog::new();
        assert!(log
            .try_add(&session(), 0, &tampered, &sig, &keypair.public_key(), usize::MAX)
            .is_err());
    }

    #[test]
    fn test_content_pieces_split_at_checkpoints() {
        let keypair = Keypair::generate();
        let mut log = SessionLog::new();
        // Every transaction exceeds a 1-byte budget, so each gets a checkpoint.
        for n in 0..4 {
            log.add_local(tx(n), &keypair, 1).unwrap();
        }
        assert_eq!(log.signature_checkpoints().len(), 4);

        let pieces = log.content_since(1);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].after, 1);
        assert_eq!(pieces[2].end(), 4);

        // Each piece verifies independently when applied in order.
        let s = session();
        let mut replica = SessionLog::new();
        for piece in log.content_since(0) {
            replica
                .try_add(
                    &s,
                    piece.after,
                    &piece.new_transactions,
                    &piece.last_signature,
                    &keypair.public_key(),
                    1,
                )
                .unwrap();
        }
        assert_eq!(replica.len(), 4);
        assert_eq!(replica.last_hash(), log.last_hash());
    }

    #[test]
    fn test_content_since_end_is_empty() {
        let keypair = Keypair::generate();
        let (_, log) = signed_batch(&keypair, &[tx(1)]);
        assert!(log.content_since(1).is_empty());
        assert_eq!(log.content_since(0).len(), 1);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn overlapping_redelivery_converges(
                count in 1usize..12,
                cuts in proptest::collection::vec((0usize..12, 0usize..12), 1..8),
            ) {
                let keypair = Keypair::from_seed(&[7; 32]);
                let s = session();
                let mut source = SessionLog::new();
                let mut signatures = Vec::new();
                for n in 0..count {
                    signatures.push(source.add_local(tx(n as i64), &keypair, usize::MAX).unwrap());
                }

                // Deliver arbitrary [start, end) windows; each is signed at its end.
                let mut replica = SessionLog::new();
                for (a, b) in cuts {
                    let (a, b) = (a % count, b % count);
                    let (start, end) = (a.min(b), a.max(b) + 1);
                    let result = replica.try_add(
                        &s,
                        start,
                        &source.transactions()[start..end],
                        &signatures[end - 1],
                        &keypair.public_key(),
                        usize::MAX,
                    );
                    match result {
                        Ok(_) => prop_assert!(replica.len() >= end),
                        Err(CoreError::Gap { .. }) => prop_assert!(start > replica.len()),
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                }
                replica.try_add(&s, 0, source.transactions(), &signatures[count - 1], &keypair.public_key(), usize::MAX).unwrap();
                prop_assert_eq!(replica.last_hash(), source.last_hash());
            }
        }
    }
}
