//! Agent and orchestrator identities using CRYSTALS-Dilithium5 signatures.
//!
//! An [`Address`] is the domain-separated BLAKE3 fingerprint of a signing
//! public key. Agents sign their results with the secret half; the registry
//! keeps the public half so results can be checked against the address they
//! claim.

use std::fmt;
use std::path::Path;

use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    DetachedSignature as SigTrait, PublicKey as SignPkTrait, SecretKey as SignSkTrait,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Hash;

// Expected key sizes for validation
pub(crate) const DILITHIUM5_PK_BYTES: usize = 2592;
pub(crate) const DILITHIUM5_SK_BYTES: usize = 4896;
pub(crate) const DILITHIUM5_SIG_BYTES: usize = 4627;

/// Identity of an agent, buyer, seller or orchestrator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub Hash);

impl Address {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex address (an optional `0x` prefix is accepted).
    pub fn from_hex(s: &str) -> Option<Address> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).ok()?;
        let raw: Hash = bytes.try_into().ok()?;
        Some(Address(raw))
    }

    /// First 8 bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.short())
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s: String = serde::Deserialize::deserialize(d)?;
        Address::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid address: {:?}", s)))
    }
}

// ── Signing (Dilithium5) ──

/// A CRYSTALS-Dilithium5 signing public key (2592 bytes).
///
/// Inner bytes are `pub(crate)` to prevent external construction of
/// unvalidated keys. Use [`SigningKeypair::generate`] or [`SigningPublicKey::from_bytes`].
#[derive(Clone, PartialEq, Eq)]
pub struct SigningPublicKey(pub(crate) Vec<u8>);

/// A CRYSTALS-Dilithium5 signing secret key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecretKey(pub(crate) Vec<u8>);

/// A Dilithium5 detached signature (4627 bytes, ML-DSA-87).
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// Create an empty signature. Never verifies.
    pub fn empty() -> Self {
        Signature(vec![])
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse a hex signature, rejecting anything that is not exactly one
    /// Dilithium5 signature long.
    pub fn from_hex(s: &str) -> Option<Signature> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        // Cheap length check before decoding attacker-supplied input.
        if s.len() != DILITHIUM5_SIG_BYTES * 2 {
            return None;
        }
        hex::decode(s).ok().map(Signature)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// A Dilithium5 signing keypair.
///
/// The secret key is zeroized on drop via [`ZeroizeOnDrop`] on [`SigningSecretKey`].
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: SigningPublicKey,
    pub secret: SigningSecretKey,
}

impl SigningKeypair {
    /// Generate a new random Dilithium5 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium5::keypair();
        SigningKeypair {
            public: SigningPublicKey(pk.as_bytes().to_vec()),
            secret: SigningSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Sign a message, producing a detached signature.
    ///
    /// If the internal secret key is somehow corrupted, logs an error and
    /// returns an empty signature instead of panicking. An empty signature
    /// always fails verification.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sk = match dilithium5::SecretKey::from_bytes(&self.secret.0) {
            Ok(sk) => sk,
            Err(_) => {
                tracing::error!("SigningKeypair::sign called with corrupted secret key");
                return Signature::empty();
            }
        };
        let sig = dilithium5::detached_sign(message, &sk);
        Signature(sig.as_bytes().to_vec())
    }

    /// Create a keypair from raw bytes, validating key sizes.
    pub fn from_bytes(public: Vec<u8>, secret: Vec<u8>) -> Option<Self> {
        dilithium5::PublicKey::from_bytes(&public).ok()?;
        dilithium5::SecretKey::from_bytes(&secret).ok()?;
        Some(SigningKeypair {
            public: SigningPublicKey(public),
            secret: SigningSecretKey(secret),
        })
    }

    pub fn address(&self) -> Address {
        self.public.address()
    }
}

impl SigningPublicKey {
    /// Validate and wrap raw public key bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        dilithium5::PublicKey::from_bytes(&bytes).ok()?;
        Some(SigningPublicKey(bytes))
    }

    /// Access the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        Self::from_bytes(bytes)
    }

    /// Verify a detached signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let pk = match dilithium5::PublicKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match dilithium5::DetachedSignature::from_bytes(&signature.0) {
            Ok(s) => s,
            Err(_) => return false,
        };
        dilithium5::verify_detached_signature(&sig, message, &pk).is_ok()
    }

    /// The address this key signs for (BLAKE3 fingerprint of the key).
    pub fn address(&self) -> Address {
        Address(crate::hash_domain(b"verity.signing.fingerprint", &self.0))
    }

    /// Check if this public key has the correct size.
    pub fn is_valid_size(&self) -> bool {
        self.0.len() == DILITHIUM5_PK_BYTES
    }
}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey({})", self.address().short())
    }
}

impl Serialize for SigningPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != DILITHIUM5_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium5 public key: expected {} bytes, got {}",
                DILITHIUM5_PK_BYTES,
                bytes.len()
            )));
        }
        Ok(SigningPublicKey(bytes))
    }
}

/// Load a keypair from `path`, or generate one and write it there.
///
/// File format: `[pk_len: u32 LE][pk_bytes][sk_bytes]`.
pub fn load_or_generate_keypair(path: &Path) -> Result<SigningKeypair, std::io::Error> {
    if path.exists() {
        let keypair = load_keypair(path)?;
        tracing::info!(address = %keypair.address().short(), "Loaded signing key");
        return Ok(keypair);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let keypair = SigningKeypair::generate();
    let pk_len = (keypair.public.0.len() as u32).to_le_bytes();
    let mut bytes = Vec::with_capacity(4 + DILITHIUM5_PK_BYTES + DILITHIUM5_SK_BYTES);
    bytes.extend_from_slice(&pk_len);
    bytes.extend_from_slice(&keypair.public.0);
    bytes.extend_from_slice(&keypair.secret.0);
    std::fs::write(path, &bytes)?;
    bytes.zeroize();
    // Restrict key file permissions to owner-only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    tracing::info!(address = %keypair.address().short(), "Generated signing key");
    Ok(keypair)
}

/// Load an existing keypair file.
pub fn load_keypair(path: &Path) -> Result<SigningKeypair, std::io::Error> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());

    let mut bytes = std::fs::read(path)?;
    if bytes.len() < 4 {
        return Err(invalid("key file too short"));
    }
    let pk_len = u32::from_le_bytes(
        bytes[..4]
            .try_into()
            .map_err(|_| invalid("key file header corrupted"))?,
    ) as usize;
    if pk_len != DILITHIUM5_PK_BYTES || bytes.len() != 4 + pk_len + DILITHIUM5_SK_BYTES {
        bytes.zeroize();
        return Err(invalid("key file truncated or wrong size"));
    }
    let pk_bytes = bytes[4..4 + pk_len].to_vec();
    let sk_bytes = bytes[4 + pk_len..].to_vec();
    bytes.zeroize();
    SigningKeypair::from_bytes(pk_bytes, sk_bytes).ok_or_else(|| invalid("invalid key data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = SigningKeypair::generate();
        let msg = b"verity test message";
        let sig = kp.sign(msg);
        assert!(kp.public.verify(msg, &sig));
        assert!(!kp.public.verify(b"wrong message", &sig));
    }

    #[test]
    fn verify_rejects_zero_signature() {
        let kp = SigningKeypair::generate();
        let zero_sig = Signature(vec![0u8; DILITHIUM5_SIG_BYTES]);
        assert!(!kp.public.verify(b"test message", &zero_sig));
    }

    #[test]
    fn signature_correct_size() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"test");
        assert_eq!(sig.as_bytes().len(), DILITHIUM5_SIG_BYTES);
    }

    #[test]
    fn signature_hex_parsing_checks_length() {
        let kp = SigningKeypair::generate();
        let sig = kp.sign(b"payload");
        let parsed = Signature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(parsed, sig);
        assert!(Signature::from_hex("").is_none());
        assert!(Signature::from_hex("abcd").is_none());
        assert!(Signature::from_hex(&"zz".repeat(DILITHIUM5_SIG_BYTES)).is_none());
    }

    #[test]
    fn address_is_deterministic_and_distinct() {
        let kp1 = SigningKeypair::generate();
        let kp2 = SigningKeypair::generate();
        assert_eq!(kp1.address(), kp1.public.address());
        assert_ne!(kp1.address(), kp2.address());
    }

    #[test]
    fn address_hex_accepts_prefix() {
        let addr = Address([0xAB; 32]);
        assert_eq!(Address::from_hex(&addr.to_hex()), Some(addr));
        assert_eq!(Address::from_hex(&format!("0x{}", addr.to_hex())), Some(addr));
        assert_eq!(Address::from_hex("0x1234"), None);
        assert_eq!(Address::from_hex("not hex"), None);
    }

    #[test]
    fn address_serializes_as_hex_string() {
        let addr = Address([1u8; 32]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr.to_hex()));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn signing_keypair_from_bytes_rejects_invalid() {
        let result = SigningKeypair::from_bytes(vec![0u8; 10], vec![0u8; 100]);
        assert!(result.is_none());
        assert!(SigningPublicKey::from_bytes(vec![0u8; 10]).is_none());
    }

    #[test]
    fn public_key_hex_roundtrip_keeps_address() {
        let kp = SigningKeypair::generate();
        let pk = SigningPublicKey::from_hex(&kp.public.to_hex()).unwrap();
        assert!(pk.is_valid_size());
        assert_eq!(pk.address(), kp.address());
    }

    #[test]
    fn key_file_generate_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("agent.key");
        let generated = load_or_generate_keypair(&path).unwrap();
        let loaded = load_or_generate_keypair(&path).unwrap();
        assert_eq!(generated.address(), loaded.address());

        let sig = loaded.sign(b"hello");
        assert!(generated.public.verify(b"hello", &sig));
    }

    #[test]
    fn truncated_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, [0u8; 12]).unwrap();
        assert!(load_keypair(&path).is_err());
    }
}
