//! Symmetric encryption and key sealing.
//!
//! Private transactions are encrypted with ChaCha20-Poly1305 under a group
//! read key. Read keys are handed to members by sealing them to the
//! member's X25519 sealer (ephemeral ECDH + Blake3 key derivation), or by
//! encrypting one key under another for key rotation and group extension.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::crypto::decode_prefixed;
use crate::error::{CoreError, Result};
use crate::ids::{CoId, SessionId};

const ENCRYPTED_PREFIX: &str = "encrypted_U";
const SEALED_PREFIX: &str = "sealed_U";
const ENCRYPTED_KEY_PREFIX: &str = "encryptedKey_U";

/// An X25519 public key used to seal secrets to an agent, text form `sealer_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SealerPublic(pub [u8; 32]);

impl SealerPublic {
    const PREFIX: &'static str = "sealer_z";

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for SealerPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sealer({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for SealerPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for SealerPublic {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        decode_prefixed(s, Self::PREFIX).map(Self)
    }
}

/// An X25519 static secret.
#[derive(Clone)]
pub struct SealerSecret(StaticSecret);

impl SealerSecret {
    /// Generate a new random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(StaticSecret::from(bytes))
    }

    /// Create from seed bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Derive the public key.
    pub fn public_key(&self) -> SealerPublic {
        SealerPublic(*PublicKey::from(&self.0).as_bytes())
    }

    fn shared_with(&self, peer: &SealerPublic) -> SharedKey {
        SharedKey(*self.0.diffie_hellman(&peer.to_dalek()).as_bytes())
    }
}

/// A shared secret derived from X25519 key agreement.
struct SharedKey([u8; 32]);

impl SharedKey {
    /// Derive a wrapping key; `context` binds it to the recipient.
    fn derive_wrapping_key(&self, context: &[u8]) -> KeySecret {
        let mut hasher = blake3::Hasher::new_derive_key("cosync-v0-seal");
        hasher.update(&self.0);
        hasher.update(context);
        KeySecret(*hasher.finalize().as_bytes())
    }
}

/// Identifier of a symmetric key, text form `key_z<hex>`.
///
/// Derived from the secret so two holders of the same secret agree on the id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    const PREFIX: &'static str = "key_z";
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for KeyId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        decode_prefixed(s, Self::PREFIX).map(Self)
    }
}

impl TryFrom<String> for KeyId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.to_string()
    }
}

/// A 256-bit symmetric key for ChaCha20-Poly1305, text form `keySecret_z<hex>`.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret([u8; 32]);

impl KeySecret {
    const PREFIX: &'static str = "keySecret_z";

    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn id(&self) -> KeyId {
        let mut hasher = blake3::Hasher::new_derive_key("cosync-v0-key-id");
        hasher.update(&self.0);
        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        KeyId(id)
    }

    fn encrypt(&self, plaintext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;
        cipher
            .encrypt(Nonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::DecryptionError(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce.0), ciphertext)
            .map_err(|e| CoreError::DecryptionError(e.to_string()))
    }

    /// Encrypt a transaction's change list (JSON text).
    pub fn encrypt_changes(&self, changes_json: &str, nonce: &EncryptionNonce) -> Result<String> {
        let ciphertext = self.encrypt(changes_json.as_bytes(), nonce)?;
        Ok(format!("{}{}", ENCRYPTED_PREFIX, hex::encode(ciphertext)))
    }

    /// Decrypt a transaction's change list back to JSON text.
    pub fn decrypt_changes(&self, encrypted: &str, nonce: &EncryptionNonce) -> Result<String> {
        let ciphertext = decode_blob(encrypted, ENCRYPTED_PREFIX)?;
        let plaintext = self.decrypt(&ciphertext, nonce)?;
        String::from_utf8(plaintext).map_err(|e| CoreError::DecryptionError(e.to_string()))
    }

    /// Encrypt another key under this one (`<other>_for_<self>` entries).
    pub fn encrypt_key(&self, other: &KeySecret) -> Result<String> {
        let nonce = EncryptionNonce::generate();
        let envelope = KeyEnvelope {
            ephemeral_public: None,
            nonce,
            ciphertext: self.encrypt(&other.0, &nonce)?,
        };
        Ok(format!("{}{}", ENCRYPTED_KEY_PREFIX, envelope.to_hex()?))
    }

    /// Reverse of [`KeySecret::encrypt_key`].
    pub fn decrypt_key(&self, encrypted: &str) -> Result<KeySecret> {
        let envelope = KeyEnvelope::from_bytes(&decode_blob(encrypted, ENCRYPTED_KEY_PREFIX)?)?;
        key_from_plaintext(self.decrypt(&envelope.ciphertext, &envelope.nonce)?)
    }

    /// Seal this key to a recipient's sealer.
    pub fn seal_for(&self, recipient: &SealerPublic) -> Result<String> {
        let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
        let ephemeral_public = SealerPublic(*PublicKey::from(&ephemeral).as_bytes());
        let shared = SharedKey(*ephemeral.diffie_hellman(&recipient.to_dalek()).as_bytes());
        let wrap_key = shared.derive_wrapping_key(recipient.as_bytes());

        let nonce = EncryptionNonce::generate();
        let envelope = KeyEnvelope {
            ephemeral_public: Some(ephemeral_public),
            nonce,
            ciphertext: wrap_key.encrypt(&self.0, &nonce)?,
        };
        Ok(format!("{}{}", SEALED_PREFIX, envelope.to_hex()?))
    }

    /// Open a key sealed with [`KeySecret::seal_for`].
    pub fn unseal(sealed: &str, recipient: &SealerSecret) -> Result<KeySecret> {
        let envelope = KeyEnvelope::from_bytes(&decode_blob(sealed, SEALED_PREFIX)?)?;
        let ephemeral_public = envelope.ephemeral_public.ok_or_else(|| {
            CoreError::DecryptionError("sealed key without ephemeral key".to_string())
        })?;
        let wrap_key = recipient
            .shared_with(&ephemeral_public)
            .derive_wrapping_key(recipient.public_key().as_bytes());
        key_from_plaintext(wrap_key.decrypt(&envelope.ciphertext, &envelope.nonce)?)
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySecret({})", self.id())
    }
}

impl fmt::Display for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for KeySecret {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        decode_prefixed(s, Self::PREFIX).map(Self)
    }
}

/// A 96-bit nonce for ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionNonce(pub [u8; 12]);

impl EncryptionNonce {
    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The nonce for the transaction at `tx_index` of `session` in `co_id`.
    ///
    /// Each (CoValue, session, index) triple is written exactly once, so the
    /// nonce never repeats under one key.
    pub fn for_transaction(co_id: &CoId, session: &SessionId, tx_index: usize) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("cosync-v0-tx-nonce");
        hasher.update(co_id.as_bytes());
        hasher.update(session.as_str().as_bytes());
        hasher.update(&(tx_index as u64).to_le_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&hasher.finalize().as_bytes()[..12]);
        Self(nonce)
    }
}

/// CBOR envelope for sealed and key-encrypted keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyEnvelope {
    ephemeral_public: Option<SealerPublic>,
    nonce: EncryptionNonce,
    ciphertext: Vec<u8>,
}

impl KeyEnvelope {
    fn to_hex(&self) -> Result<String> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(hex::encode(buf))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

fn decode_blob(value: &str, prefix: &str) -> Result<Vec<u8>> {
    let hex_part = value
        .strip_prefix(prefix)
        .ok_or_else(|| CoreError::DecodingError(format!("expected {} prefix", prefix)))?;
    hex::decode(hex_part).map_err(|e| CoreError::DecodingError(e.to_string()))
}

fn key_from_plaintext(bytes: Vec<u8>) -> Result<KeySecret> {
    let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        CoreError::DecryptionError(format!("invalid key length: expected 32, got {}", b.len()))
    })?;
    Ok(KeySecret(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::ids::ActorId;

    fn session() -> SessionId {
        SessionId::new_random(&ActorId::Agent(AgentSecret::generate().id()))
    }

    #[test]
    fn test_encrypt_decrypt_changes() {
        let key = KeySecret::generate();
        let nonce = EncryptionNonce::for_transaction(&CoId([7; 32]), &session(), 0);

        let encrypted = key.encrypt_changes(r#"[{"op":"set"}]"#, &nonce).unwrap();
        assert!(encrypted.starts_with("encrypted_U"));
        assert_eq!(
            key.decrypt_changes(&encrypted, &nonce).unwrap(),
            r#"[{"op":"set"}]"#
        );
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let nonce = EncryptionNonce::generate();
        let encrypted = KeySecret::generate().encrypt_changes("[]", &nonce).unwrap();
        assert!(KeySecret::generate()
            .decrypt_changes(&encrypted, &nonce)
            .is_err());
    }

    #[test]
    fn test_seal_unseal() {
        let recipient = SealerSecret::generate();
        let key = KeySecret::generate();

        let sealed = key.seal_for(&recipient.public_key()).unwrap();
        assert!(sealed.starts_with("sealed_U"));

        let opened = KeySecret::unseal(&sealed, &recipient).unwrap();
        assert_eq!(opened, key);
        assert!(KeySecret::unseal(&sealed, &SealerSecret::generate()).is_err());
    }

    #[test]
    fn test_key_for_key() {
        let old = KeySecret::generate();
        let new = KeySecret::generate();

        let encrypted = new.encrypt_key(&old).unwrap();
        assert_eq!(new.decrypt_key(&encrypted).unwrap(), old);
    }

    #[test]
    fn test_key_id_is_stable() {
        let key = KeySecret::from_bytes([3; 32]);
        assert_eq!(key.id(), KeySecret::from_bytes([3; 32]).id());
        assert_ne!(key.id(), KeySecret::from_bytes([4; 32]).id());
        assert_eq!(key.id().to_string().parse::<KeyId>().unwrap(), key.id());
    }

    #[test]
    fn test_transaction_nonces_differ_by_index() {
        let s = session();
        let id = CoId([1; 32]);
        assert_ne!(
            EncryptionNonce::for_transaction(&id, &s, 0),
            EncryptionNonce::for_transaction(&id, &s, 1)
        );
    }
}
