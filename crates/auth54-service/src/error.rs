//! Service-side error plumbing.
//!
//! Each runtime module keeps its own fine-grained error enum (store,
//! channel, config); [`ServiceError`] is the crate-level sum the engines
//! return, and the conversion into [`AuthError`] is where failures collapse
//! to the protocol taxonomy at the operation boundary.

use auth54_core::{ActorError, AuthError, CanonicalJsonError, KeyError, PassportError};
use thiserror::Error;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::store::StoreError;

/// Any failure raised by the service runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Service-to-service channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Canonicalization failure.
    #[error(transparent)]
    Canonical(#[from] CanonicalJsonError),

    /// Key or signature handling failure.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Actor invariant failure.
    #[error(transparent)]
    Actor(#[from] ActorError),

    /// Passport failure.
    #[error(transparent)]
    Passport(#[from] PassportError),

    /// A protocol-class failure raised directly by an engine.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<ServiceError> for AuthError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Auth(inner) => inner,
            ServiceError::Canonical(inner) => inner.into(),
            ServiceError::Key(inner) => inner.into(),
            ServiceError::Actor(inner) => inner.into(),
            ServiceError::Passport(inner) => inner.into(),
            ServiceError::Config(inner) => Self::Validation {
                message: inner.to_string(),
            },
            ServiceError::Channel(inner) => inner.into(),
            ServiceError::Store(inner) => Self::Internal {
                message: inner.to_string(),
            },
        }
    }
}
