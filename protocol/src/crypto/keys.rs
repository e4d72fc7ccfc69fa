//! # Key Management
//!
//! Ed25519 keypairs for signing transactions, and raw-byte verification for
//! checking the signature bundles that arrive from the network.
//!
//! Key bytes are never logged. Signature bytes are stored as `Vec<u8>` for
//! serde's sake; anything that is not exactly 64 bytes simply fails to
//! verify.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use thiserror::Error;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not valid hex")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,
}

/// An Ed25519 signing keypair.
///
/// Deliberately not `Serialize`: exporting a private key should be an
/// explicit call to [`secret_key_bytes`](Self::secret_key_bytes), never a
/// side effect of dumping a struct to JSON.
pub struct KilnKeypair {
    signing_key: SigningKey,
}

impl KilnKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Handy for tests and
    /// devnet genesis accounts; a weak seed gives a weak key.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load a keypair from a hex-encoded 32-byte secret.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The 32 public key bytes that appear on-chain.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign `message`, returning the 64 raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Export the raw secret. Handle with care.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl std::fmt::Debug for KilnKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KilnKeypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Check that `public_key` is a valid Ed25519 point.
pub fn parse_public_key(public_key: &[u8; 32]) -> Result<VerifyingKey, KeyError> {
    VerifyingKey::from_bytes(public_key).map_err(|_| KeyError::InvalidPublicKey)
}

/// Verify a raw Ed25519 signature.
///
/// Returns `false` for malformed keys or signatures rather than an error:
/// from the validator's point of view a garbage signature and a wrong
/// signature are the same thing.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = parse_public_key(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let kp = KilnKeypair::generate();
        let sig = kp.sign(b"pack me");
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(&kp.public_key_bytes(), b"pack me", &sig));
    }

    #[test]
    fn test_verify_rejects_other_message() {
        let kp = KilnKeypair::generate();
        let sig = kp.sign(b"pack me");
        assert!(!verify_signature(&kp.public_key_bytes(), b"pack you", &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let kp = KilnKeypair::from_seed(&[1u8; 32]);
        let other = KilnKeypair::from_seed(&[2u8; 32]);
        let sig = kp.sign(b"msg");
        assert!(!verify_signature(&other.public_key_bytes(), b"msg", &sig));
    }

    #[test]
    fn test_verify_rejects_truncated_signature() {
        let kp = KilnKeypair::generate();
        let sig = kp.sign(b"msg");
        assert!(!verify_signature(&kp.public_key_bytes(), b"msg", &sig[..63]));
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = KilnKeypair::from_seed(&[9u8; 32]);
        let b = KilnKeypair::from_seed(&[9u8; 32]);
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn test_from_hex_roundtrip() {
        let kp = KilnKeypair::generate();
        let restored = KilnKeypair::from_hex(&hex::encode(kp.secret_key_bytes())).unwrap();
        assert_eq!(kp.public_key_bytes(), restored.public_key_bytes());
        assert!(KilnKeypair::from_hex("abcd").is_err());
    }
}
