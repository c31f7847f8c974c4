//! Account identities and the transaction verification hook.
//!
//! Transactions today carry the sender's raw secret key in place of a
//! signature, and nothing requires it to be checked. Anyone who sees a
//! transaction on the wire or in a block learns the sender's secret.
//! [`SignatureVerifier`] is the seam where a stricter deployment plugs in
//! real verification; the default [`AcceptAll`] lets everything through.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::Transaction;

/// Bytes of the public-key digest kept in an address.
const ADDRESS_BYTES: usize = 20;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Signature is not a valid secret key")]
    MalformedSecret,
    #[error("Secret does not belong to sender {0}")]
    SenderMismatch(String),
}

/// A freshly generated keypair and its address.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub secret_hex: String,
    pub public_key_hex: String,
    pub address: String,
}

pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> GeneratedKey;
}

/// Address of a public key: the first 20 bytes of its SHA-256, hex encoded.
pub fn derive_address(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..ADDRESS_BYTES])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519KeyGenerator;

impl KeyGenerator for Ed25519KeyGenerator {
    fn generate(&self) -> GeneratedKey {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        GeneratedKey {
            secret_hex: hex::encode(signing_key.to_bytes()),
            public_key_hex: hex::encode(public_key),
            address: derive_address(&public_key),
        }
    }
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, tx: &Transaction) -> Result<(), VerificationError>;
}

/// Accepts every transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(&self, _tx: &Transaction) -> Result<(), VerificationError> {
        Ok(())
    }
}

/// Requires the `signature` field to be the hex secret whose derived
/// address is the sender. Proves possession, not intent: the secret is
/// still exposed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderSecretVerifier;

impl SignatureVerifier for SenderSecretVerifier {
    fn verify(&self, tx: &Transaction) -> Result<(), VerificationError> {
        let bytes = hex::decode(tx.signature.trim()).map_err(|_| VerificationError::MalformedSecret)?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VerificationError::MalformedSecret)?;
        let public_key = SigningKey::from_bytes(&secret).verifying_key().to_bytes();
        if derive_address(&public_key) != tx.sender {
            return Err(VerificationError::SenderMismatch(tx.sender.clone()));
        }
        Ok(())
    }
}
