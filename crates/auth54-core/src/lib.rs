//! Protocol core for the auth54 federation.
//!
//! This crate holds everything two federation members must agree on to
//! interoperate, with no I/O of its own:
//!
//! - [`canonical`]: deterministic JSON rendering, the byte source of every
//!   signature in the protocol
//! - [`crypto`]: secp256k1 key handling and detached signatures
//! - [`actor`]: the replicated identity model
//! - [`passport`]: APT54 signed identity assertions
//! - [`permaction`]: capability descriptors and the registry
//! - [`error`]: the protocol failure taxonomy with HTTP status mapping
//!
//! The service runtime (storage, sessions, channels, synchronization) lives
//! in `auth54-service`.

pub mod actor;
pub mod canonical;
pub mod crypto;
pub mod error;
pub mod passport;
pub mod permaction;

pub use actor::{Actor, ActorError, ActorType, IdentityRef};
pub use canonical::{CanonicalJsonError, canonical_string, canonicalize_json, canonicalize_value};
pub use crypto::{
    KeyError, KeypairSigner, PUBLIC_KEY_HEX_LEN, is_valid_public_key, validate_public_key,
    verify_signature,
};
pub use error::AuthError;
pub use passport::{Apt54, PassportError, TIMESTAMP_FORMAT, VALIDITY_DAYS};
pub use permaction::{
    MASQUERADE_PERMACTION_UUID, MASQUERADE_UNION, PermactionDescriptor, PermactionKind,
    PermactionRegistry,
};
