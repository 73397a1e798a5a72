//! Service configuration.
//!
//! A service is configured from one TOML document: its own identity and
//! keypair, the deployment mode (standalone vs federated), the trust
//! authority, the dependent services it fans sessions out to, and the
//! storage/timeout knobs. Validation is fail-closed: a federated service
//! without a reachable, well-formed authority section refuses to start.

use std::path::{Path, PathBuf};

use auth54_core::crypto;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML did not parse.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed document violates an invariant.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level service configuration.
#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    /// This service's actor uuid.
    pub service_uuid: String,

    /// Base URL this service is reachable at.
    pub service_domain: String,

    /// This service's public key, wire form.
    pub public_key: String,

    /// This service's private scalar, hex. Never logged.
    pub private_key: SecretString,

    /// Standalone services are their own trust authority; they self-sign
    /// and self-verify passports. This switch is explicit configuration,
    /// never inferred.
    #[serde(default)]
    pub standalone: bool,

    /// Trust authority coordinates. Required unless standalone.
    #[serde(default)]
    pub auth: Option<AuthoritySection>,

    /// Services this one establishes dependent sessions on.
    #[serde(default)]
    pub depended_services: Vec<DependedService>,

    /// Storage settings.
    pub database: DatabaseSection,

    /// Outbound call timeouts.
    #[serde(default)]
    pub timeouts: TimeoutSection,
}

/// Trust authority coordinates for federated mode.
#[derive(Debug, Deserialize)]
pub struct AuthoritySection {
    /// Authority base URL.
    pub url: String,

    /// Authority public key, wire form; the trusted key for passport
    /// verification in federated mode.
    pub public_key: String,
}

/// One dependent service, for session fan-out.
#[derive(Debug, Clone, Deserialize)]
pub struct DependedService {
    /// Name used in fan-out results.
    pub name: String,

    /// Base URL.
    pub url: String,

    /// Actor uuid of the dependent service.
    pub uuid: String,
}

/// Storage settings.
#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    /// SQLite database path.
    pub path: PathBuf,
}

/// Outbound call timeouts, seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeoutSection {
    /// Default per-request timeout.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,

    /// Connect timeout.
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    /// Timeout for best-effort sync callbacks.
    #[serde(default = "default_callback_secs")]
    pub callback_secs: u64,
}

const fn default_request_secs() -> u64 {
    10
}

const fn default_connect_secs() -> u64 {
    5
}

const fn default_callback_secs() -> u64 {
    5
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            connect_secs: default_connect_secs(),
            callback_secs: default_callback_secs(),
        }
    }
}

impl ServiceConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, or
    /// when validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if uuid::Uuid::parse_str(&self.service_uuid).is_err() {
            return Err(ConfigError::Validation(format!(
                "service_uuid '{}' is not a valid uuid",
                self.service_uuid
            )));
        }
        crypto::validate_public_key(&self.public_key)
            .map_err(|error| ConfigError::Validation(format!("public_key: {error}")))?;

        match (&self.auth, self.standalone) {
            (None, false) => {
                return Err(ConfigError::Validation(
                    "federated mode requires an [auth] section; set standalone = true to \
                     self-issue"
                        .to_string(),
                ));
            },
            (Some(auth), _) => {
                if auth.url.trim().is_empty() {
                    return Err(ConfigError::Validation("auth.url must not be empty".to_string()));
                }
                crypto::validate_public_key(&auth.public_key)
                    .map_err(|error| ConfigError::Validation(format!("auth.public_key: {error}")))?;
            },
            (None, true) => {},
        }

        for dependent in &self.depended_services {
            if uuid::Uuid::parse_str(&dependent.uuid).is_err() {
                return Err(ConfigError::Validation(format!(
                    "depended service '{}' has invalid uuid '{}'",
                    dependent.name, dependent.uuid
                )));
            }
        }
        Ok(())
    }

    /// The public key passports are verified against: the authority key in
    /// federated mode, this service's own key in standalone mode.
    #[must_use]
    pub fn trusted_public_key(&self) -> &str {
        if self.standalone {
            &self.public_key
        } else {
            self.auth
                .as_ref()
                .map_or(&self.public_key, |auth| &auth.public_key)
        }
    }
}


#[cfg(test)]
mod tests {
    use auth54_core::KeypairSigner;

    use super::*;

    fn base_toml(standalone: bool, with_auth: bool) -> String {
        let service = KeypairSigner::generate();
        let authority = KeypairSigner::generate();
        let mut doc = format!(
            "service_uuid = \"06d9e34f-9ea2-4a9e-a4ec-0cf4a1037a9e\"\n\
             service_domain = \"https://svc.example\"\n\
             public_key = \"{}\"\n\
             private_key = \"{}\"\n\
             standalone = {standalone}\n\
             [database]\n\
             path = \"/tmp/auth54.sqlite\"\n",
            service.public_key_hex(),
            service.private_key_hex(),
        );
        if with_auth {
            doc.push_str(&format!(
                "[auth]\nurl = \"https://auth.example\"\npublic_key = \"{}\"\n",
                authority.public_key_hex()
            ));
        }
        doc
    }

    #[test]
    fn federated_config_parses_with_authority() {
        let config = ServiceConfig::from_toml(&base_toml(false, true)).unwrap();
        assert!(!config.standalone);
        assert_eq!(config.timeouts.request_secs, 10);
        assert_eq!(config.timeouts.callback_secs, 5);
        assert_eq!(
            config.trusted_public_key(),
            config.auth.as_ref().unwrap().public_key
        );
    }

    #[test]
    fn federated_mode_requires_authority_section() {
        let err = ServiceConfig::from_toml(&base_toml(false, false)).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn standalone_mode_trusts_own_key() {
        let config = ServiceConfig::from_toml(&base_toml(true, false)).unwrap();
        assert_eq!(config.trusted_public_key(), config.public_key);
    }

    #[test]
    fn rejects_malformed_authority_key() {
        let mut doc = base_toml(false, false);
        doc.push_str("[auth]\nurl = \"https://auth.example\"\npublic_key = \"04beef\"\n");
        let err = ServiceConfig::from_toml(&doc).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_malformed_service_uuid() {
        let doc = base_toml(true, false).replace("06d9e34f-9ea2-4a9e-a4ec-0cf4a1037a9e", "svc-1");
        let err = ServiceConfig::from_toml(&doc).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_invalid_dependent_uuid() {
        let mut doc = base_toml(true, false);
        doc.push_str(
            "[[depended_services]]\nname = \"billing\"\nurl = \"https://billing.example\"\n\
             uuid = \"nope\"\n",
        );
        let err = ServiceConfig::from_toml(&doc).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
