//! Signing capability injected into the verification pipeline.
//!
//! The pipeline never touches key material directly: agents sign through a
//! [`MessageSigner`] and results are checked through a [`SignatureVerifier`],
//! so the Dilithium5 backend in [`keys`] can be swapped without touching the
//! consensus or settlement code.

pub mod keys;

use std::collections::HashMap;

use crate::TaskId;
use keys::{Address, Signature, SigningKeypair, SigningPublicKey};

/// Produces signatures on behalf of one address.
pub trait MessageSigner: Send + Sync {
    fn address(&self) -> Address;
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Checks that `signature` over `message` was produced by `address`.
///
/// Implementations must return `false` (never panic) for unknown addresses
/// and malformed signatures.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, address: &Address, message: &[u8], signature: &Signature) -> bool;

    /// Whether answers signed by `address` may take part in a vote.
    fn is_eligible(&self, _address: &Address) -> bool {
        true
    }
}

impl MessageSigner for SigningKeypair {
    fn address(&self) -> Address {
        SigningKeypair::address(self)
    }

    fn sign(&self, message: &[u8]) -> Signature {
        SigningKeypair::sign(self, message)
    }
}

/// Fixed set of known public keys, indexed by address.
#[derive(Clone, Debug, Default)]
pub struct KeyDirectory {
    keys: HashMap<Address, SigningPublicKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: SigningPublicKey) -> Address {
        let address = key.address();
        self.keys.insert(address, key);
        address
    }
}

impl SignatureVerifier for KeyDirectory {
    fn verify(&self, address: &Address, message: &[u8], signature: &Signature) -> bool {
        match self.keys.get(address) {
            Some(key) => key.verify(message, signature),
            None => false,
        }
    }
}

/// Canonical message an agent signs for a task result.
///
/// Binds the payload to the task so a signed answer cannot be replayed into
/// a different task. The payload is length-prefixed.
pub fn result_sign_data(task_id: &TaskId, payload: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 8 + payload.len());
    data.extend_from_slice(&task_id.0);
    data.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    data.extend_from_slice(payload.as_bytes());
    crate::hash_domain(b"verity.result", &data).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_verifies_known_signer_only() {
        let kp = SigningKeypair::generate();
        let stranger = SigningKeypair::generate();
        let mut dir = KeyDirectory::new();
        let addr = dir.insert(kp.public.clone());
        assert_eq!(addr, kp.address());

        let msg = result_sign_data(&TaskId([1; 32]), "42");
        let sig = MessageSigner::sign(&kp, &msg);
        assert!(dir.verify(&addr, &msg, &sig));
        assert!(!dir.verify(&stranger.address(), &msg, &sig));
        assert!(!dir.verify(&addr, &msg, &Signature::empty()));
    }

    #[test]
    fn sign_data_binds_task_and_payload() {
        let a = result_sign_data(&TaskId([1; 32]), "Brazil 3 - 0 Germany");
        let b = result_sign_data(&TaskId([2; 32]), "Brazil 3 - 0 Germany");
        let c = result_sign_data(&TaskId([1; 32]), "Brazil 3 - 1 Germany");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, result_sign_data(&TaskId([1; 32]), "Brazil 3 - 0 Germany"));
    }
}
