//! Protocol-level error taxonomy.
//!
//! Module-level errors (canonicalization, keys, passports, storage) stay
//! fine-grained; this enum is the protocol surface they converge to at the
//! operation boundary, where each class carries a stable HTTP status.

use thiserror::Error;

use crate::actor::ActorError;
use crate::canonical::CanonicalJsonError;
use crate::crypto::KeyError;
use crate::passport::PassportError;

/// Protocol failure classes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    /// Malformed uuid, public key, or request shape. Never retried.
    #[error("validation failed: {message}")]
    Validation {
        /// What was malformed.
        message: String,
    },

    /// Signature verification failed; logged as a potential forgery.
    #[error("signature verification failed: {context}")]
    Signature {
        /// Which check failed.
        context: String,
    },

    /// The acting actor lacks the required capability.
    #[error("permission denied for permaction '{permaction}'")]
    PermissionDenied {
        /// The capability that was required.
        permaction: String,
    },

    /// The acting actor is banned; terminal for session creation.
    #[error("actor '{uuid}' is banned")]
    BannedActor {
        /// The banned actor.
        uuid: String,
    },

    /// Unknown session, salt, or other local record.
    #[error("{what} not found")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The identity is unknown to the issuing authority (wire status 452).
    #[error("actor '{uuid}' unknown to the authority")]
    UnknownActor {
        /// The unknown identity.
        uuid: String,
    },

    /// Hash mismatch between replicas; a trigger for forced sync, not a
    /// fault.
    #[error("synchronization conflict in scope '{scope}'")]
    SyncConflict {
        /// Which hash scope diverged.
        scope: String,
    },

    /// Peer service unreachable or timed out; safe to retry.
    #[error("upstream '{peer}' unavailable: {message}")]
    Upstream {
        /// The unreachable peer.
        peer: String,
        /// Transport diagnostic.
        message: String,
    },

    /// Local storage or invariant failure.
    #[error("internal error: {message}")]
    Internal {
        /// Diagnostic.
        message: String,
    },
}

impl AuthError {
    /// HTTP status this failure class maps to.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Signature { .. } => 401,
            Self::PermissionDenied { .. } | Self::BannedActor { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::SyncConflict { .. } => 409,
            Self::UnknownActor { .. } => 452,
            Self::Internal { .. } => 500,
            Self::Upstream { .. } => 503,
        }
    }

    /// Whether a caller may retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }
}

impl From<CanonicalJsonError> for AuthError {
    fn from(error: CanonicalJsonError) -> Self {
        Self::Validation {
            message: error.to_string(),
        }
    }
}

impl From<KeyError> for AuthError {
    fn from(error: KeyError) -> Self {
        Self::Validation {
            message: error.to_string(),
        }
    }
}

impl From<ActorError> for AuthError {
    fn from(error: ActorError) -> Self {
        Self::Validation {
            message: error.to_string(),
        }
    }
}

impl From<PassportError> for AuthError {
    fn from(error: PassportError) -> Self {
        match error {
            PassportError::Canonical(inner) => inner.into(),
            PassportError::Key(inner) => inner.into(),
            PassportError::MalformedExpiration { stamp } => Self::Validation {
                message: format!("malformed passport expiration '{stamp}'"),
            },
        }
    }
}
