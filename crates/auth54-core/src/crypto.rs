//! Key handling and detached signatures.
//!
//! The federation signs every protocol message with ECDSA over secp256k1,
//! matching the uncompressed SEC1 key format the wire carries: public keys
//! are 130 lowercase hex characters starting with the `04` point prefix,
//! signatures are 128 hex characters (fixed-size `r || s`).
//!
//! Malformed keys are rejected with an explicit error before any
//! verification is attempted; they are never silently treated as a failed
//! verification.

use k256::ecdsa::signature::{Signer as _, Verifier as _};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

/// Hex length of an uncompressed SEC1 public key (`04` + X + Y).
pub const PUBLIC_KEY_HEX_LEN: usize = 130;

/// Hex length of a fixed-size `r || s` signature.
pub const SIGNATURE_HEX_LEN: usize = 128;

/// Hex length of a secp256k1 private scalar.
pub const PRIVATE_KEY_HEX_LEN: usize = 64;

/// Errors produced while parsing keys or verifying signatures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyError {
    /// The public key has the wrong length, prefix, or is not hex.
    #[error("malformed public key: {reason}")]
    MalformedPublicKey {
        /// Why the key was rejected.
        reason: String,
    },

    /// The public key parsed as hex but is not a point on the curve.
    #[error("public key is not a valid curve point")]
    InvalidCurvePoint,

    /// The private key is not a valid secp256k1 scalar.
    #[error("malformed private key: {reason}")]
    MalformedPrivateKey {
        /// Why the key was rejected.
        reason: String,
    },

    /// The signature is not 128 hex characters or not a valid encoding.
    #[error("malformed signature: {reason}")]
    MalformedSignature {
        /// Why the signature was rejected.
        reason: String,
    },
}

/// Checks the wire shape of a public key: 130 hex chars, `04` prefix.
///
/// This is the fast-path gate every inbound key passes before any curve
/// arithmetic. It deliberately does not prove the point is on the curve;
/// [`parse_public_key`] does that.
///
/// # Errors
///
/// Returns [`KeyError::MalformedPublicKey`] describing the first violated
/// constraint.
pub fn validate_public_key(public_key: &str) -> Result<(), KeyError> {
    if public_key.len() != PUBLIC_KEY_HEX_LEN {
        return Err(KeyError::MalformedPublicKey {
            reason: format!(
                "expected {PUBLIC_KEY_HEX_LEN} hex characters, got {}",
                public_key.len()
            ),
        });
    }
    if !public_key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(KeyError::MalformedPublicKey {
            reason: "contains non-hex characters".to_string(),
        });
    }
    // Uncompressed SEC1 points carry the 04 marker byte.
    if !public_key.starts_with("04") {
        return Err(KeyError::MalformedPublicKey {
            reason: "missing 04 uncompressed-point prefix".to_string(),
        });
    }
    Ok(())
}

/// Returns `true` when the key passes the wire-shape gate.
#[must_use]
pub fn is_valid_public_key(public_key: &str) -> bool {
    validate_public_key(public_key).is_ok()
}

/// Parses a hex public key into a verifying key.
///
/// # Errors
///
/// Returns [`KeyError`] when the wire shape is wrong or the decoded bytes
/// are not a point on secp256k1.
pub fn parse_public_key(public_key: &str) -> Result<VerifyingKey, KeyError> {
    validate_public_key(public_key)?;
    let bytes = hex::decode(public_key).map_err(|error| KeyError::MalformedPublicKey {
        reason: error.to_string(),
    })?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|_| KeyError::InvalidCurvePoint)
}

/// Verifies a detached hex signature over a payload.
///
/// Returns `Ok(false)` for a well-formed signature that does not match;
/// malformed keys and signatures are errors, never `false`.
///
/// # Errors
///
/// Returns [`KeyError`] when the public key or signature is malformed.
pub fn verify_signature(
    public_key: &str,
    signature: &str,
    payload: &str,
) -> Result<bool, KeyError> {
    let verifying_key = parse_public_key(public_key)?;
    if signature.len() != SIGNATURE_HEX_LEN {
        return Err(KeyError::MalformedSignature {
            reason: format!(
                "expected {SIGNATURE_HEX_LEN} hex characters, got {}",
                signature.len()
            ),
        });
    }
    let bytes = hex::decode(signature).map_err(|error| KeyError::MalformedSignature {
        reason: error.to_string(),
    })?;
    let signature =
        Signature::from_slice(&bytes).map_err(|error| KeyError::MalformedSignature {
            reason: error.to_string(),
        })?;
    Ok(verifying_key.verify(payload.as_bytes(), &signature).is_ok())
}

/// Owns a secp256k1 private scalar and signs protocol payloads.
///
/// `Debug` redacts the key material.
pub struct KeypairSigner {
    signing_key: SigningKey,
}

impl std::fmt::Debug for KeypairSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypairSigner")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

impl KeypairSigner {
    /// Builds a signer from a 64-hex-char private scalar.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MalformedPrivateKey`] when the input is not a
    /// valid scalar.
    pub fn from_hex(private_key: &str) -> Result<Self, KeyError> {
        if private_key.len() != PRIVATE_KEY_HEX_LEN {
            return Err(KeyError::MalformedPrivateKey {
                reason: format!(
                    "expected {PRIVATE_KEY_HEX_LEN} hex characters, got {}",
                    private_key.len()
                ),
            });
        }
        let bytes = hex::decode(private_key).map_err(|error| KeyError::MalformedPrivateKey {
            reason: error.to_string(),
        })?;
        let signing_key =
            SigningKey::from_slice(&bytes).map_err(|error| KeyError::MalformedPrivateKey {
                reason: error.to_string(),
            })?;
        Ok(Self { signing_key })
    }

    /// Generates a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// The matching public key in the 130-hex-char wire form.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        hex::encode(point.as_bytes())
    }

    /// The private scalar in hex, for persisting a generated keypair.
    #[must_use]
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Signs a payload, returning the 128-hex-char detached signature.
    #[must_use]
    pub fn sign(&self, payload: &str) -> String {
        let signature: Signature = self.signing_key.sign(payload.as_bytes());
        hex::encode(signature.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let signer = KeypairSigner::generate();
        let public_key = signer.public_key_hex();
        let signature = signer.sign("payload");

        assert!(verify_signature(&public_key, &signature, "payload").unwrap());
    }

    #[test]
    fn verification_fails_for_mutated_payload() {
        let signer = KeypairSigner::generate();
        let signature = signer.sign("payload");

        assert!(!verify_signature(&signer.public_key_hex(), &signature, "payloae").unwrap());
    }

    #[test]
    fn verification_fails_for_substituted_key() {
        let signer = KeypairSigner::generate();
        let other = KeypairSigner::generate();
        let signature = signer.sign("payload");

        assert!(!verify_signature(&other.public_key_hex(), &signature, "payload").unwrap());
    }

    #[test]
    fn public_key_wire_shape() {
        let public_key = KeypairSigner::generate().public_key_hex();
        assert_eq!(public_key.len(), PUBLIC_KEY_HEX_LEN);
        assert!(public_key.starts_with("04"));
        validate_public_key(&public_key).unwrap();
    }

    #[test]
    fn rejects_wrong_length_key() {
        let err = validate_public_key("04abcd").unwrap_err();
        assert!(matches!(err, KeyError::MalformedPublicKey { .. }));
    }

    #[test]
    fn rejects_missing_point_prefix() {
        let mut key = KeypairSigner::generate().public_key_hex();
        key.replace_range(0..2, "02");
        let err = validate_public_key(&key).unwrap_err();
        assert!(matches!(err, KeyError::MalformedPublicKey { .. }));
    }

    #[test]
    fn rejects_non_hex_key() {
        let key = "zz".repeat(65);
        let err = validate_public_key(&key).unwrap_err();
        assert!(matches!(err, KeyError::MalformedPublicKey { .. }));
    }

    #[test]
    fn malformed_key_is_an_error_not_false() {
        let signer = KeypairSigner::generate();
        let signature = signer.sign("payload");

        let result = verify_signature("04short", &signature, "payload");
        assert!(result.is_err());
    }

    #[test]
    fn malformed_signature_is_an_error() {
        let signer = KeypairSigner::generate();
        let result = verify_signature(&signer.public_key_hex(), "beef", "payload");
        assert!(matches!(result, Err(KeyError::MalformedSignature { .. })));
    }

    #[test]
    fn private_key_round_trips_through_hex() {
        let signer = KeypairSigner::generate();
        let restored = KeypairSigner::from_hex(&signer.private_key_hex()).unwrap();
        assert_eq!(signer.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn debug_redacts_private_scalar() {
        let signer = KeypairSigner::generate();
        let rendered = format!("{signer:?}");
        assert!(!rendered.contains(&signer.private_key_hex()));
    }
}
