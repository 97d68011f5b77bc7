//! Cryptographic primitives: hashing, signing and pluggable signature verification.

use crate::types::{Hash256, PublicKeyBytes, SignatureBytes};
pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

/// SHA-256 over a domain tag followed by each part, with no separators.
///
/// Every part that feeds a canonical hash is fixed-width, so plain
/// concatenation is unambiguous.
pub fn sha256_parts(domain: &[u8], parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// BLAKE3 derived key over `parts` under a fixed context string.
pub fn blake3_derive(context: &str, parts: &[&[u8]]) -> Hash256 {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Fill `out` from the BLAKE3 extendable output of `parts`.
pub fn blake3_xof(context: &str, parts: &[&[u8]], out: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize_xof().fill(out);
}

/// Signature verification capability.
///
/// Components take this as `Arc<dyn SignatureVerifier>` so tests can swap in a
/// double while production uses [`Ed25519Verifier`].
pub trait SignatureVerifier: Send + Sync {
    /// Returns true iff `signature` is a valid signature of `message` under `public_key`.
    fn verify(&self, public_key: &PublicKeyBytes, message: &[u8], signature: &SignatureBytes) -> bool;
}

/// Strict Ed25519 verification (rejects small-order keys and malleable signatures).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &PublicKeyBytes, message: &[u8], signature: &SignatureBytes) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(signature.as_ref());
        key.verify_strict(message, &signature).is_ok()
    }
}

/// A signer that can create Ed25519 signatures.
///
/// Stands in for the hardware signer of a device, a manufacturer root, or a
/// channel party.
pub struct Signer {
    signing_key: SigningKey,
}

impl Signer {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        use rand::rngs::OsRng;
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        use ed25519_dalek::Signer as _;
        SignatureBytes::from(self.signing_key.sign(message).to_bytes())
    }

    /// Raw public key bytes, as stored in key pools and certificates.
    pub fn public_key(&self) -> PublicKeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_parts_matches_concatenation() {
        let joined = sha256(b"tag:abcdef");
        let parts = sha256_parts(b"tag:", &[b"abc", b"def"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_blake3_contexts_are_separated() {
        let a = blake3_derive("shift-core test context a", &[b"data"]);
        let b = blake3_derive("shift-core test context b", &[b"data"]);
        assert_ne!(a, b);
        assert_eq!(a, blake3_derive("shift-core test context a", &[b"data"]));
    }

    #[test]
    fn test_blake3_xof_fills_long_output() {
        let mut out = [0u8; 128];
        blake3_xof("shift-core test xof", &[b"data"], &mut out);
        assert_ne!(out[64..], [0u8; 64]);
    }

    #[test]
    fn test_ed25519_verifier() {
        let signer = Signer::generate();
        let message = b"settle 100";
        let signature = signer.sign(message);

        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&signer.public_key(), message, &signature));
        assert!(!verifier.verify(&signer.public_key(), b"settle 101", &signature));

        let other = Signer::generate();
        assert!(!verifier.verify(&other.public_key(), message, &signature));
    }

    #[test]
    fn test_verifier_rejects_garbage_key() {
        let signer = Signer::generate();
        let signature = signer.sign(b"m");
        // Arbitrary bytes, either not a point or not the signer
        let bogus = [0xffu8; 32];
        assert!(!Ed25519Verifier.verify(&bogus, b"m", &signature));
    }
}
