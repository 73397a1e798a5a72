//! Actor model shared by every federation member.
//!
//! An actor is any identity participating in the federation: an end user, a
//! classic (password) user, a group, or a service. Rows replicate from the
//! trust authority to dependent services, so the serialized shape here is
//! also the sync wire format.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::{self, KeyError};

/// Kind of identity an actor row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Key-based end user.
    User,
    /// Login/password end user.
    ClassicUser,
    /// Permission group.
    Group,
    /// Federation service.
    Service,
}

impl ActorType {
    /// Stable string form used in storage and hashes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::ClassicUser => "classic_user",
            Self::Group => "group",
            Self::Service => "service",
        }
    }

    /// Parses the storage string form.
    ///
    /// # Errors
    ///
    /// Returns [`ActorError::UnknownType`] for anything else.
    pub fn parse(value: &str) -> Result<Self, ActorError> {
        match value {
            "user" => Ok(Self::User),
            "classic_user" => Ok(Self::ClassicUser),
            "group" => Ok(Self::Group),
            "service" => Ok(Self::Service),
            other => Err(ActorError::UnknownType {
                value: other.to_string(),
            }),
        }
    }
}

/// Errors raised by actor validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ActorError {
    /// `actor_type` is not one of the four known kinds.
    #[error("unknown actor type '{value}'")]
    UnknownType {
        /// The rejected value.
        value: String,
    },

    /// `uuid` is not a well-formed UUID.
    #[error("malformed actor uuid '{uuid}'")]
    MalformedUuid {
        /// The rejected value.
        uuid: String,
    },

    /// `initial_key` failed the public-key wire-shape gate.
    #[error("actor '{uuid}' carries a malformed initial key: {source}")]
    MalformedKey {
        /// Owning actor.
        uuid: String,
        /// Underlying key error.
        source: KeyError,
    },

    /// A service-type actor has no `service_domain` in its profile.
    #[error("service actor '{uuid}' exposes no service_domain")]
    MissingServiceDomain {
        /// Owning actor.
        uuid: String,
    },
}

/// One identity participating in the federation.
///
/// `uinfo` is an opaque profile document; the protocol only reads the keys
/// accessed through the typed accessors below (`service_domain`,
/// `group_name`, `weight`, `groups`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable primary identity.
    pub uuid: String,

    /// Kind of identity.
    pub actor_type: ActorType,

    /// Primary public key registered at creation, wire form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_key: Option<String>,

    /// Additional public keys, label to key, for rotation/multi-device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_keys: Option<BTreeMap<String, String>>,

    /// Opaque profile attributes.
    #[serde(default = "empty_object")]
    pub uinfo: Value,

    /// Signature over the actor's root permission set, replicated as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_perms_signature: Option<String>,

    /// Banned actors are refused sessions.
    #[serde(default)]
    pub is_banned: bool,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Actor {
    /// Builds a minimal actor with an empty profile.
    #[must_use]
    pub fn new(uuid: impl Into<String>, actor_type: ActorType) -> Self {
        Self {
            uuid: uuid.into(),
            actor_type,
            initial_key: None,
            secondary_keys: None,
            uinfo: empty_object(),
            root_perms_signature: None,
            is_banned: false,
        }
    }

    /// Checks the row invariants: well-formed uuid, well-formed initial key
    /// when present, and a `service_domain` for service actors.
    ///
    /// # Errors
    ///
    /// Returns [`ActorError`] naming the first violated invariant.
    pub fn validate(&self) -> Result<(), ActorError> {
        if uuid::Uuid::parse_str(&self.uuid).is_err() {
            return Err(ActorError::MalformedUuid {
                uuid: self.uuid.clone(),
            });
        }
        if let Some(key) = &self.initial_key {
            crypto::validate_public_key(key).map_err(|source| ActorError::MalformedKey {
                uuid: self.uuid.clone(),
                source,
            })?;
        }
        if self.actor_type == ActorType::Service && self.service_domain().is_none() {
            return Err(ActorError::MissingServiceDomain {
                uuid: self.uuid.clone(),
            });
        }
        Ok(())
    }

    /// Base URL of a service actor.
    #[must_use]
    pub fn service_domain(&self) -> Option<&str> {
        self.uinfo.get("service_domain").and_then(Value::as_str)
    }

    /// Name of a group actor.
    #[must_use]
    pub fn group_name(&self) -> Option<&str> {
        self.uinfo.get("group_name").and_then(Value::as_str)
    }

    /// Override weight of a group actor.
    #[must_use]
    pub fn group_weight(&self) -> Option<i64> {
        self.uinfo.get("weight").and_then(Value::as_i64)
    }

    /// Group uuids this actor belongs to.
    #[must_use]
    pub fn group_uuids(&self) -> Vec<String> {
        self.uinfo
            .get("groups")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every key a signature from this actor may verify against: the
    /// initial key first, then the secondary keys in label order.
    #[must_use]
    pub fn signature_keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        if let Some(key) = &self.initial_key {
            keys.push(key.as_str());
        }
        if let Some(secondary) = &self.secondary_keys {
            keys.extend(secondary.values().map(String::as_str));
        }
        keys
    }
}

/// How a principal identifies itself when requesting a salt or passport:
/// exactly one of a public key, an actor uuid, or a QR pairing token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRef {
    /// A registered public key, wire form.
    PubKey(String),
    /// An actor uuid.
    Uuid(String),
    /// An unresolved QR pairing token.
    QrToken(String),
}

impl IdentityRef {
    /// Extracts the identity reference from a request body, in the protocol
    /// precedence order (`pub_key`, then `uuid`, then `qr_token`), rejecting
    /// malformed keys and uuids.
    ///
    /// # Errors
    ///
    /// Returns [`ActorError::MalformedUuid`] or [`ActorError::MalformedKey`]
    /// for a present-but-invalid field, and `None` is mapped by callers when
    /// no field is present.
    pub fn from_body(body: &Value) -> Result<Option<Self>, ActorError> {
        if let Some(key) = body.get("pub_key").and_then(Value::as_str) {
            crypto::validate_public_key(key).map_err(|source| ActorError::MalformedKey {
                uuid: String::new(),
                source,
            })?;
            return Ok(Some(Self::PubKey(key.to_string())));
        }
        if let Some(id) = body.get("uuid").and_then(Value::as_str) {
            if uuid::Uuid::parse_str(id).is_err() {
                return Err(ActorError::MalformedUuid {
                    uuid: id.to_string(),
                });
            }
            return Ok(Some(Self::Uuid(id.to_string())));
        }
        if let Some(token) = body.get("qr_token").and_then(Value::as_str) {
            return Ok(Some(Self::QrToken(token.to_string())));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::crypto::KeypairSigner;

    fn user(uuid: &str) -> Actor {
        Actor::new(uuid, ActorType::User)
    }

    #[test]
    fn actor_type_round_trips() {
        for kind in [
            ActorType::User,
            ActorType::ClassicUser,
            ActorType::Group,
            ActorType::Service,
        ] {
            assert_eq!(ActorType::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ActorType::parse("admin").is_err());
    }

    #[test]
    fn validate_rejects_malformed_uuid() {
        let err = user("not-a-uuid").validate().unwrap_err();
        assert!(matches!(err, ActorError::MalformedUuid { .. }));
    }

    #[test]
    fn validate_rejects_malformed_key() {
        let mut actor = user("9f2adf30-07ab-4a4d-9291-fc6dbe7c0f3e");
        actor.initial_key = Some("04beef".to_string());
        let err = actor.validate().unwrap_err();
        assert!(matches!(err, ActorError::MalformedKey { .. }));
    }

    #[test]
    fn validate_requires_service_domain() {
        let mut actor = Actor::new("9f2adf30-07ab-4a4d-9291-fc6dbe7c0f3e", ActorType::Service);
        assert!(matches!(
            actor.validate().unwrap_err(),
            ActorError::MissingServiceDomain { .. }
        ));

        actor.uinfo = json!({"service_domain": "https://auth.example"});
        actor.validate().unwrap();
    }

    #[test]
    fn signature_keys_lists_initial_then_secondary() {
        let primary = KeypairSigner::generate().public_key_hex();
        let rotated = KeypairSigner::generate().public_key_hex();
        let mut actor = user("9f2adf30-07ab-4a4d-9291-fc6dbe7c0f3e");
        actor.initial_key = Some(primary.clone());
        actor.secondary_keys = Some(BTreeMap::from([("phone".to_string(), rotated.clone())]));

        assert_eq!(actor.signature_keys(), vec![&primary, &rotated]);
    }

    #[test]
    fn group_accessors_read_uinfo() {
        let mut group = Actor::new("9f2adf30-07ab-4a4d-9291-fc6dbe7c0f3e", ActorType::Group);
        group.uinfo = json!({"group_name": "admins", "weight": 40});
        assert_eq!(group.group_name(), Some("admins"));
        assert_eq!(group.group_weight(), Some(40));
    }

    #[test]
    fn identity_ref_precedence_and_validation() {
        let key = KeypairSigner::generate().public_key_hex();
        let body = json!({"pub_key": key, "uuid": "9f2adf30-07ab-4a4d-9291-fc6dbe7c0f3e"});
        assert!(matches!(
            IdentityRef::from_body(&body).unwrap(),
            Some(IdentityRef::PubKey(_))
        ));

        let body = json!({"uuid": "nope"});
        assert!(IdentityRef::from_body(&body).is_err());

        let body = json!({"qr_token": "abc123"});
        assert!(matches!(
            IdentityRef::from_body(&body).unwrap(),
            Some(IdentityRef::QrToken(_))
        ));

        assert_eq!(IdentityRef::from_body(&json!({})).unwrap(), None);
    }
}
