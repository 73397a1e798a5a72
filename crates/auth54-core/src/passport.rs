//! APT54 passport tokens.
//!
//! A passport is the authority's signed, time-boxed snapshot of an actor's
//! identity data. The signed message is the canonical JSON of `user_data`
//! concatenated with the expiration stamp, so any federation member holding
//! the authority's public key can re-verify the token without contacting
//! the authority again.
//!
//! Expiration checking is deliberately a separate operation from signature
//! verification; both gates apply before a passport is trusted.

use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actor::Actor;
use crate::canonical::{CanonicalJsonError, canonical_string};
use crate::crypto::{self, KeyError, KeypairSigner};

/// Fixed passport validity window.
pub const VALIDITY_DAYS: i64 = 14;

/// Wire format of passport timestamps, UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors raised while issuing or verifying passports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PassportError {
    /// `user_data` could not be canonicalized for signing.
    #[error("canonicalization failed: {0}")]
    Canonical(#[from] CanonicalJsonError),

    /// The trusted key or signature is malformed.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The expiration stamp is not in the wire format.
    #[error("malformed expiration stamp '{stamp}'")]
    MalformedExpiration {
        /// The rejected stamp.
        stamp: String,
    },
}

/// A signed, time-boxed identity assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Apt54 {
    /// Snapshot of the actor at issuance time.
    pub user_data: Actor,

    /// UTC expiration stamp, [`TIMESTAMP_FORMAT`].
    pub expiration: String,

    /// Detached signature over `canonical(user_data) || expiration`.
    pub signature: String,
}

impl Apt54 {
    /// Issues a passport for an actor, signing with the issuer's key.
    ///
    /// In federated mode the issuer is the authority; in standalone mode a
    /// service self-issues with its own key.
    ///
    /// # Errors
    ///
    /// Returns [`PassportError::Canonical`] when the actor snapshot cannot
    /// be canonicalized.
    pub fn issue(actor: &Actor, issuer: &KeypairSigner) -> Result<Self, PassportError> {
        let expiration = (Utc::now() + Duration::days(VALIDITY_DAYS))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let message = format!("{}{expiration}", canonical_string(actor)?);
        Ok(Self {
            user_data: actor.clone(),
            expiration,
            signature: issuer.sign(&message),
        })
    }

    /// Recomputes the message the signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`PassportError::Canonical`] when `user_data` cannot be
    /// canonicalized.
    pub fn signed_message(&self) -> Result<String, PassportError> {
        Ok(format!(
            "{}{}",
            canonical_string(&self.user_data)?,
            self.expiration
        ))
    }

    /// Verifies the signature against a trusted public key.
    ///
    /// Callers select the key explicitly: the configured authority key in
    /// federated mode, the service's own key in standalone mode. A valid
    /// signature says nothing about expiry; check [`Self::is_expired`] too.
    ///
    /// # Errors
    ///
    /// Returns [`PassportError`] when the key or signature is malformed or
    /// the snapshot cannot be canonicalized.
    pub fn verify(&self, trusted_public_key: &str) -> Result<bool, PassportError> {
        let message = self.signed_message()?;
        Ok(crypto::verify_signature(
            trusted_public_key,
            &self.signature,
            &message,
        )?)
    }

    /// Whether the validity window has passed.
    ///
    /// # Errors
    ///
    /// Returns [`PassportError::MalformedExpiration`] when the stamp does
    /// not parse; a garbled stamp is never treated as still-valid.
    pub fn is_expired(&self) -> Result<bool, PassportError> {
        let expiration = NaiveDateTime::parse_from_str(&self.expiration, TIMESTAMP_FORMAT)
            .map_err(|_| PassportError::MalformedExpiration {
                stamp: self.expiration.clone(),
            })?;
        Ok(Utc::now().naive_utc() > expiration)
    }

    /// Uuid of the actor this passport asserts.
    #[must_use]
    pub fn actor_uuid(&self) -> &str {
        &self.user_data.uuid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorType;

    fn sample_actor(signer: &KeypairSigner) -> Actor {
        let mut actor = Actor::new("21d55b52-5fcb-48e0-a309-c4b6a7cf56e7", ActorType::User);
        actor.initial_key = Some(signer.public_key_hex());
        actor
    }

    #[test]
    fn issue_and_verify() {
        let authority = KeypairSigner::generate();
        let user_key = KeypairSigner::generate();
        let passport = Apt54::issue(&sample_actor(&user_key), &authority).unwrap();

        assert!(passport.verify(&authority.public_key_hex()).unwrap());
        assert!(!passport.is_expired().unwrap());
        assert_eq!(passport.actor_uuid(), "21d55b52-5fcb-48e0-a309-c4b6a7cf56e7");
    }

    #[test]
    fn verification_fails_against_other_key() {
        let authority = KeypairSigner::generate();
        let other = KeypairSigner::generate();
        let passport = Apt54::issue(&sample_actor(&authority), &authority).unwrap();

        assert!(!passport.verify(&other.public_key_hex()).unwrap());
    }

    #[test]
    fn tampered_user_data_fails_verification() {
        let authority = KeypairSigner::generate();
        let mut passport = Apt54::issue(&sample_actor(&authority), &authority).unwrap();
        passport.user_data.is_banned = true;

        assert!(!passport.verify(&authority.public_key_hex()).unwrap());
    }

    #[test]
    fn past_expiration_is_expired_with_valid_signature() {
        let authority = KeypairSigner::generate();
        let actor = sample_actor(&authority);
        let expiration = (Utc::now() - Duration::days(1))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let message = format!("{}{expiration}", canonical_string(&actor).unwrap());
        let passport = Apt54 {
            user_data: actor,
            expiration,
            signature: authority.sign(&message),
        };

        assert!(passport.verify(&authority.public_key_hex()).unwrap());
        assert!(passport.is_expired().unwrap());
    }

    #[test]
    fn garbled_expiration_is_an_error() {
        let authority = KeypairSigner::generate();
        let mut passport = Apt54::issue(&sample_actor(&authority), &authority).unwrap();
        passport.expiration = "tomorrow".to_string();

        assert!(matches!(
            passport.is_expired(),
            Err(PassportError::MalformedExpiration { .. })
        ));
    }

    #[test]
    fn expiration_uses_wire_format() {
        let authority = KeypairSigner::generate();
        let passport = Apt54::issue(&sample_actor(&authority), &authority).unwrap();
        NaiveDateTime::parse_from_str(&passport.expiration, TIMESTAMP_FORMAT).unwrap();
    }
}
