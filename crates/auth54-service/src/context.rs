//! Shared runtime state.
//!
//! One [`ServiceContext`] per process: validated configuration, the open
//! replica database, the signing keypair, and the capability registry. The
//! engines (sessions, permissions, sync, the request dispatcher) all borrow
//! from it.

use std::sync::Arc;

use auth54_core::crypto::KeypairSigner;
use auth54_core::permaction::PermactionRegistry;
use secrecy::ExposeSecret;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::store::Db;

/// Everything a running service shares across requests.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    config: ServiceConfig,
    db: Db,
    signer: KeypairSigner,
    registry: PermactionRegistry,
}

impl ServiceContext {
    /// Builds the context: opens the database at the configured path and
    /// derives the signer from the configured private key.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when the database cannot be opened or the
    /// private key is malformed.
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        let db = Db::open(&config.database.path)?;
        Self::with_db(config, db)
    }

    /// Builds the context over an already-open database. Tests use this
    /// with in-memory databases.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when the private key is malformed.
    pub fn with_db(config: ServiceConfig, db: Db) -> Result<Self, ServiceError> {
        let signer = KeypairSigner::from_hex(config.private_key.expose_secret())?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                db,
                signer,
                registry: PermactionRegistry::builtin(),
            }),
        })
    }

    /// Replaces the capability registry, for services that register their
    /// own descriptors. Must be called before the context is shared.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when the context is already shared.
    pub fn set_registry(&mut self, registry: PermactionRegistry) -> Result<(), ServiceError> {
        let inner = Arc::get_mut(&mut self.inner).ok_or_else(|| {
            ServiceError::Auth(auth54_core::AuthError::Internal {
                message: "registry replaced after context was shared".to_string(),
            })
        })?;
        inner.registry = registry;
        Ok(())
    }

    /// Validated configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Replica database handle.
    #[must_use]
    pub fn db(&self) -> &Db {
        &self.inner.db
    }

    /// This service's signing keypair.
    #[must_use]
    pub fn signer(&self) -> &KeypairSigner {
        &self.inner.signer
    }

    /// Capability registry.
    #[must_use]
    pub fn registry(&self) -> &PermactionRegistry {
        &self.inner.registry
    }

    /// This service's actor uuid.
    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.inner.config.service_uuid
    }

    /// Whether this service is the trust authority: standalone services
    /// always are, and a federated service is when the configured authority
    /// key is its own.
    #[must_use]
    pub fn is_authority(&self) -> bool {
        if self.inner.config.standalone {
            return true;
        }
        self.inner
            .config
            .auth
            .as_ref()
            .is_some_and(|auth| auth.public_key == self.inner.config.public_key)
    }

    /// The key passports are verified against.
    #[must_use]
    pub fn trusted_public_key(&self) -> &str {
        self.inner.config.trusted_public_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::standalone_config;

    #[test]
    fn standalone_context_is_its_own_authority() {
        let config = standalone_config();
        let public_key = config.public_key.clone();
        let ctx = ServiceContext::with_db(config, Db::open_in_memory().unwrap()).unwrap();

        assert!(ctx.is_authority());
        assert_eq!(ctx.trusted_public_key(), public_key);
        assert_eq!(ctx.signer().public_key_hex(), public_key);
    }

    #[test]
    fn builtin_registry_is_loaded() {
        let ctx =
            ServiceContext::with_db(standalone_config(), Db::open_in_memory().unwrap()).unwrap();
        assert!(
            ctx.registry()
                .get(auth54_core::MASQUERADE_PERMACTION_UUID)
                .is_some()
        );
    }
}
