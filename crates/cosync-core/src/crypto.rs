//! Cryptographic primitives for cosync.
//!
//! Wraps Ed25519 signing and Blake3 hashing with strong types. Every key
//! and signature has a prefixed hex text form (`signer_z…`, `signature_z…`)
//! which is also its serialized form on the wire.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cipher::{SealerPublic, SealerSecret};
use crate::error::{CoreError, Result};
use crate::ids::AgentId;

/// Decode `<prefix><hex>` into a fixed-size byte array.
pub(crate) fn decode_prefixed<const N: usize>(
    value: &str,
    prefix: &'static str,
) -> Result<[u8; N]> {
    let hex_part = value.strip_prefix(prefix).ok_or(CoreError::InvalidId {
        value: value.to_string(),
        reason: prefix,
    })?;
    let bytes = hex::decode(hex_part).map_err(|_| CoreError::InvalidId {
        value: value.to_string(),
        reason: "invalid hex",
    })?;
    bytes.try_into().map_err(|_| CoreError::InvalidId {
        value: value.to_string(),
        reason: "invalid length",
    })
}

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Extend a hash chain: `H(self || data)`.
    pub fn chain(&self, data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The zero hash, start of every session hash chain.
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Blake3Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Blake3Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A 32-byte Ed25519 public key, text form `signer_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    const PREFIX: &'static str = "signer_z";

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;

        let sig = Signature::from_bytes(&signature.0);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.to_hex())
    }
}

impl FromStr for Ed25519PublicKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        decode_prefixed(s, Self::PREFIX).map(Self)
    }
}

impl From<[u8; 32]> for Ed25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A 64-byte Ed25519 signature, text form `signature_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    const PREFIX: &'static str = "signature_z";

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.to_hex())
    }
}

impl FromStr for Ed25519Signature {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        decode_prefixed(s, Self::PREFIX).map(Self)
    }
}

impl TryFrom<String> for Ed25519Signature {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ed25519Signature> for String {
    fn from(sig: Ed25519Signature) -> Self {
        sig.to_string()
    }
}

/// A keypair for signing session logs.
///
/// This wraps ed25519-dalek's SigningKey.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        Self { signing_key }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        let sig = self.signing_key.sign(message);
        Ed25519Signature(sig.to_bytes())
    }

    /// Get the raw seed bytes (secret key material).
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// The secret half of an agent: a signer plus a sealer.
///
/// Text form is `sealerSecret_z<hex>/signerSecret_z<hex>`; this is also the
/// secret part of an invite link.
#[derive(Clone)]
pub struct AgentSecret {
    signer: Keypair,
    sealer: SealerSecret,
}

impl AgentSecret {
    const SEALER_PREFIX: &'static str = "sealerSecret_z";
    const SIGNER_PREFIX: &'static str = "signerSecret_z";

    /// Generate a fresh agent.
    pub fn generate() -> Self {
        Self {
            signer: Keypair::generate(),
            sealer: SealerSecret::generate(),
        }
    }

    /// Deterministic agent from two seeds. Used by fixtures.
    pub fn from_seeds(signer_seed: &[u8; 32], sealer_seed: [u8; 32]) -> Self {
        Self {
            signer: Keypair::from_seed(signer_seed),
            sealer: SealerSecret::from_bytes(sealer_seed),
        }
    }

    pub fn signer(&self) -> &Keypair {
        &self.signer
    }

    pub fn sealer(&self) -> &SealerSecret {
        &self.sealer
    }

    /// The public identity of this agent.
    pub fn id(&self) -> AgentId {
        AgentId::new(self.sealer.public_key(), self.signer.public_key())
    }

    pub fn sealer_public(&self) -> SealerPublic {
        self.sealer.public_key()
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentSecret({})", self.id())
    }
}

impl fmt::Display for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}{}",
            Self::SEALER_PREFIX,
            hex::encode(self.sealer.to_bytes()),
            Self::SIGNER_PREFIX,
            hex::encode(self.signer.seed())
        )
    }
}

impl FromStr for AgentSecret {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (sealer, signer) = s.split_once('/').ok_or(CoreError::InvalidId {
            value: s.to_string(),
            reason: "missing '/' separator",
        })?;
        let sealer: [u8; 32] = decode_prefixed(sealer, Self::SEALER_PREFIX)?;
        let signer: [u8; 32] = decode_prefixed(signer, Self::SIGNER_PREFIX)?;
        Ok(Self::from_seeds(&signer, sealer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::generate();
        let message = b"hello world";

        let signature = keypair.sign(message);
        let public_key = keypair.public_key();

        assert!(public_key.verify(message, &signature).is_ok());
    }

    #[test]
    fn test_verify_wrong_message() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"hello");

        assert!(keypair.public_key().verify(b"world", &signature).is_err());
    }

    #[test]
    fn test_deterministic_from_seed() {
        let seed = [42u8; 32];
        let kp1 = Keypair::from_seed(&seed);
        let kp2 = Keypair::from_seed(&seed);

        assert_eq!(kp1.public_key(), kp2.public_key());
        assert_eq!(kp1.sign(b"m"), kp2.sign(b"m"));
    }

    #[test]
    fn test_hash_chain_depends_on_prefix() {
        let a = Blake3Hash::ZERO.chain(b"one");
        let b = Blake3Hash::hash(b"x").chain(b"one");
        assert_ne!(a, b);
        assert_eq!(a, Blake3Hash::ZERO.chain(b"one"));
    }

    #[test]
    fn test_signature_text_form() {
        let sig = Keypair::from_seed(&[1; 32]).sign(b"m");
        let text = sig.to_string();
        assert!(text.starts_with("signature_z"));
        assert_eq!(text.parse::<Ed25519Signature>().unwrap(), sig);

        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, format!("\"{}\"", text));
    }

    #[test]
    fn test_agent_secret_text_roundtrip() {
        let agent = AgentSecret::generate();
        let parsed: AgentSecret = agent.to_string().parse().unwrap();
        assert_eq!(parsed.id(), agent.id());
    }

    #[test]
    fn test_rejects_wrong_prefix() {
        assert!("sealer_z00".parse::<Ed25519PublicKey>().is_err());
        assert!("signer_zzz".parse::<Ed25519PublicKey>().is_err());
    }
}
