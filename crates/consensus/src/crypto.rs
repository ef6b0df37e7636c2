//! Signing keys for validators

use crate::types::Address;
use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;

/// Something that can sign consensus messages on behalf of a validator
pub trait Signer: Send + Sync {
    /// Address the signatures verify against
    fn address(&self) -> Address;

    /// Sign raw bytes
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// In-process ed25519 private key
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Build a key from a 32-byte seed
    pub fn from_bytes(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }
}

impl Signer for PrivateKey {
    fn address(&self) -> Address {
        Address(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({:?})", self.address())
    }
}
